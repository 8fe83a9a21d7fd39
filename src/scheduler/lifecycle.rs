//! Request lifecycle management.
//!
//! The [`ServingContext`] owns every request being served together with the
//! request table, and shares the slot allocator with the rest of the engine.
//! Each tick starts with [`ServingContext::classify`], which partitions the
//! active requests into disjoint buckets:
//!
//! ```text
//!   add_request()
//!        │
//!        ▼
//!   ┌──────────┐  init_requests()  ┌─────────┐  prompt cached  ┌────────┐
//!   │  uninit  │ ────────────────► │ prefill │ ──────────────► │ decode │
//!   └──────────┘                   └─────────┘                 └────────┘
//!        │                              │                          │
//!        │ abort()                      │ abort()          EOS / max tokens
//!        ▼                              ▼                          ▼
//!   ┌──────────┐                                             ┌──────────┐
//!   │ aborted  │ ◄───────────────────────────────────────────│ finished │
//!   └──────────┘         (both released by the context)      └──────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use kvserve::core::{Request, SlotAllocator};
//! use kvserve::scheduler::ServingContext;
//!
//! let allocator = Arc::new(SlotAllocator::new(64));
//! let mut ctx = ServingContext::new(allocator, 4);
//!
//! ctx.add_request(Request::new(1, vec![1, 2, 3], 4)).unwrap();
//! let buckets = ctx.classify();
//! assert_eq!(buckets.uninit, vec![1]);
//!
//! ctx.init_requests(&buckets.uninit).unwrap();
//! assert_eq!(ctx.classify().prefill, vec![1]);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::req_table::RequestTable;
use crate::core::request::{Request, RequestId, RequestStatus};
use crate::core::slot_allocator::SlotAllocator;
use crate::error::{Error, Result};

/// Disjoint partition of the active requests for one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassifiedRequests {
    /// Requests without a request table row.
    pub uninit: Vec<RequestId>,
    /// Requests flagged for abort.
    pub aborted: Vec<RequestId>,
    /// Requests that produced their final token.
    pub finished: Vec<RequestId>,
    /// Requests whose prompt still needs KV entries.
    pub prefill: Vec<RequestId>,
    /// Requests generating one position per step.
    pub decode: Vec<RequestId>,
}

impl ClassifiedRequests {
    /// Whether there is nothing to run this tick.
    pub fn is_idle(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    /// Total number of classified requests.
    pub fn len(&self) -> usize {
        self.uninit.len()
            + self.aborted.len()
            + self.finished.len()
            + self.prefill.len()
            + self.decode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owner of all per-request serving state.
#[derive(Debug)]
pub struct ServingContext {
    allocator: Arc<SlotAllocator>,
    req_table: RequestTable,
    requests: HashMap<RequestId, Request>,
    /// Admission order; classification preserves it.
    order: Vec<RequestId>,
}

impl ServingContext {
    /// Create a context with a request table of `max_req_num` rows.
    pub fn new(allocator: Arc<SlotAllocator>, max_req_num: usize) -> Self {
        Self {
            allocator,
            req_table: RequestTable::new(max_req_num),
            requests: HashMap::new(),
            order: Vec::new(),
        }
    }

    // ========== Accessors ==========

    pub fn allocator(&self) -> &Arc<SlotAllocator> {
        &self.allocator
    }

    pub fn req_table(&self) -> &RequestTable {
        &self.req_table
    }

    pub fn req_table_mut(&mut self) -> &mut RequestTable {
        &mut self.req_table
    }

    pub fn request(&self, request_id: RequestId) -> Option<&Request> {
        self.requests.get(&request_id)
    }

    pub fn request_mut(&mut self, request_id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&request_id)
    }

    /// Look up a request, failing with [`Error::RequestNotFound`].
    pub fn get(&self, request_id: RequestId) -> Result<&Request> {
        self.requests
            .get(&request_id)
            .ok_or(Error::RequestNotFound(request_id))
    }

    /// Mutable variant of [`Self::get`].
    pub fn get_mut(&mut self, request_id: RequestId) -> Result<&mut Request> {
        self.requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))
    }

    /// Ids of all requests in admission order.
    pub fn request_ids(&self) -> &[RequestId] {
        &self.order
    }

    pub fn num_requests(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    // ========== Admission and abort ==========

    /// Admit a new request. It is initialized at the end of the tick that
    /// first classifies it.
    pub fn add_request(&mut self, request: Request) -> Result<()> {
        let request_id = request.request_id();
        if self.requests.contains_key(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        self.order.push(request_id);
        self.requests.insert(request_id, request);
        Ok(())
    }

    /// Flag a request for abort. Takes effect at the next classification.
    pub fn abort(&mut self, request_id: RequestId) -> Result<()> {
        self.get_mut(request_id)?.abort();
        Ok(())
    }

    // ========== Per-tick operations ==========

    /// Partition the active requests into disjoint buckets.
    pub fn classify(&self) -> ClassifiedRequests {
        let mut buckets = ClassifiedRequests::default();
        for &id in &self.order {
            let Some(req) = self.requests.get(&id) else {
                continue;
            };
            let bucket = if req.is_aborted() {
                &mut buckets.aborted
            } else {
                match req.status() {
                    RequestStatus::Uninitialized => &mut buckets.uninit,
                    RequestStatus::Finished => &mut buckets.finished,
                    RequestStatus::Prefill => &mut buckets.prefill,
                    RequestStatus::Decode => &mut buckets.decode,
                }
            };
            bucket.push(id);
        }
        debug!(
            uninit = buckets.uninit.len(),
            aborted = buckets.aborted.len(),
            finished = buckets.finished.len(),
            prefill = buckets.prefill.len(),
            decode = buckets.decode.len(),
            "classified requests"
        );
        buckets
    }

    /// Give request table rows to uninitialized requests.
    ///
    /// Stops at the first request that cannot get a row; those stay
    /// uninitialized and are retried on a later tick. Returns the number of
    /// requests initialized.
    pub fn init_requests(&mut self, ids: &[RequestId]) -> Result<usize> {
        let mut initialized = 0;
        for &id in ids {
            if self.get(id)?.status() != RequestStatus::Uninitialized {
                continue;
            }
            let req_idx = match self.req_table.alloc() {
                Ok(idx) => idx,
                Err(Error::OutOfRequestSlots { capacity }) => {
                    warn!(request_id = id, capacity, "request table full, init deferred");
                    break;
                }
                Err(e) => return Err(e),
            };
            self.get_mut(id)?.init(req_idx)?;
            initialized += 1;
        }
        Ok(initialized)
    }

    /// Remove requests and release their KV slots and request table rows.
    ///
    /// Used for both finished and aborted requests; returns the removed
    /// requests in the order given.
    pub fn filter(&mut self, ids: &[RequestId]) -> Result<Vec<Request>> {
        let mut removed = Vec::with_capacity(ids.len());
        for &id in ids {
            let req = self
                .requests
                .remove(&id)
                .ok_or(Error::RequestNotFound(id))?;
            self.order.retain(|&x| x != id);
            if let Some(req_idx) = req.req_idx() {
                let slots = self.req_table.free(req_idx, req.cur_kv_len());
                self.allocator.free(&slots)?;
                debug!(request_id = id, released = slots.len(), "released request");
            }
            removed.push(req);
        }
        Ok(removed)
    }

    /// Release every KV slot and request table row.
    ///
    /// Only valid while no request holds resources, e.g. around warmup.
    pub fn free_all(&mut self) {
        self.allocator.free_all();
        self.req_table.free_all();
    }
}
