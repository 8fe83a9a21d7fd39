//! Point-to-point transport between a prefill node and the decode-side worker.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::core::kv_cache::KvRows;
use crate::core::request::RequestId;
use crate::error::{Error, Result};

/// Communication settings applied before joining the transport group: a
/// small number of channels and socket threads per transfer.
///
/// They are handed to [`KvTransport::apply_tuning`] rather than written to
/// the process environment, which other threads may be reading.
pub const COMM_TUNING_ENV: [(&str, &str); 3] = [
    ("NCCL_MAX_NCHANNELS", "2"),
    ("NCCL_NSOCKS_PER_CHANNEL", "1"),
    ("NCCL_SOCKET_NTHREADS", "1"),
];

/// KV rows for one request, one entry per tensor-parallel rank.
#[derive(Debug, Clone)]
pub struct KvPayload {
    pub request_id: RequestId,
    pub ranks: Vec<KvRows>,
}

/// Receiving end of a two-party transport (this node is rank 1).
pub trait KvTransport: Send {
    /// Short name used in the `<name>_ok` status.
    fn name(&self) -> &str;

    /// Take communication settings (e.g. [`COMM_TUNING_ENV`]) before
    /// `connect`. A transport that spawns a communication backend passes
    /// them to it explicitly.
    fn apply_tuning(&mut self, settings: &[(&str, &str)]);

    /// Join the group with the prefill node.
    fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// Receive the payload for `request_id`.
    fn recv(&mut self, request_id: RequestId, timeout: Duration) -> Result<KvPayload>;
}

enum Message {
    Hello,
    Payload(KvPayload),
}

/// In-process transport over bounded crossbeam channels.
pub struct ChannelTransport {
    name: String,
    rx: Receiver<Message>,
    tuning: Vec<(String, String)>,
}

/// Prefill-side handle of a [`ChannelTransport`].
#[derive(Clone)]
pub struct ChannelSender {
    tx: Sender<Message>,
}

impl ChannelTransport {
    /// Create a connected sender/receiver pair.
    pub fn pair(name: impl Into<String>, capacity: usize) -> (ChannelSender, Self) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            ChannelSender { tx },
            Self {
                name: name.into(),
                rx,
                tuning: Vec::new(),
            },
        )
    }

    /// Settings received through [`KvTransport::apply_tuning`].
    pub fn tuning(&self) -> &[(String, String)] {
        &self.tuning
    }
}

impl ChannelSender {
    /// Announce the prefill side; completes the receiver's `connect`.
    pub fn hello(&self) -> Result<()> {
        self.tx
            .send(Message::Hello)
            .map_err(|_| Error::Transfer("transport receiver dropped".into()))
    }

    pub fn send(&self, payload: KvPayload) -> Result<()> {
        self.tx
            .send(Message::Payload(payload))
            .map_err(|_| Error::Transfer("transport receiver dropped".into()))
    }
}

fn recv_message(rx: &Receiver<Message>, timeout: Duration, what: &str) -> Result<Message> {
    rx.recv_timeout(timeout).map_err(|e| match e {
        RecvTimeoutError::Timeout => Error::Transfer(format!("timed out waiting for {what}")),
        RecvTimeoutError::Disconnected => {
            Error::Transfer(format!("prefill side closed while waiting for {what}"))
        }
    })
}

impl KvTransport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply_tuning(&mut self, settings: &[(&str, &str)]) {
        self.tuning = settings
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    fn connect(&mut self, timeout: Duration) -> Result<()> {
        match recv_message(&self.rx, timeout, "transport handshake")? {
            Message::Hello => Ok(()),
            Message::Payload(p) => Err(Error::Transfer(format!(
                "payload for request {} arrived before handshake",
                p.request_id
            ))),
        }
    }

    fn recv(&mut self, request_id: RequestId, timeout: Duration) -> Result<KvPayload> {
        match recv_message(&self.rx, timeout, "kv payload")? {
            Message::Payload(p) if p.request_id == request_id => Ok(p),
            Message::Payload(p) => Err(Error::Transfer(format!(
                "expected payload for request {request_id}, got {}",
                p.request_id
            ))),
            Message::Hello => Err(Error::Transfer("unexpected second handshake".into())),
        }
    }
}
