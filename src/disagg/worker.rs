//! Decode-side KV transfer worker.
//!
//! The worker runs on its own thread and is reached only through channels:
//!
//! ```text
//! supervisor                         worker thread
//!     │ spawn ─────────────────────────► hand comm tuning to transport
//!     │ ◄───────────────────────────── proc_start
//!     │ send_mem_manager × tp ─────────► (bounded wait per handle)
//!     │ ◄───────────────────────────── get_mem_managers_ok
//!     │                                  join transport with prefill node
//!     │ ◄───────────────────────────── <transport>_ok
//!     │ submit(task) ──────────────────► receive rows, write, synchronize
//!     │ ◄───────────────────────────── ok | fail (worker exits on fail)
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::config::TransferConfig;
use crate::core::kv_cache::KvMemory;
use crate::disagg::task::{KvMoveTask, TransferOutcome, TransferStatus};
use crate::disagg::transport::{KvTransport, COMM_TUNING_ENV};
use crate::error::{Error, Result};

/// KV memory shared between the serving engine and the transfer worker.
pub type SharedKvMemory = Arc<RwLock<KvMemory>>;

/// Spawns transfer workers.
#[derive(Debug)]
pub struct TransferWorker;

impl TransferWorker {
    /// Start a worker thread for `config.device_index`.
    pub fn spawn<T>(config: TransferConfig, transport: T) -> Result<TransferWorkerHandle>
    where
        T: KvTransport + 'static,
    {
        let (mem_tx, mem_rx) = bounded(config.tp.max(1));
        let (task_tx, task_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();
        let device_index = config.device_index;

        let join = thread::Builder::new()
            .name(format!("kv-transfer-{device_index}"))
            .spawn(move || {
                let outcome = run(&config, transport, &mem_rx, &task_rx, &status_tx);
                if let TransferOutcome::Failed(reason) = &outcome {
                    error!(device_index = config.device_index, %reason, "kv transfer worker failed");
                    if status_tx.send(TransferStatus::Fail).is_err() {
                        debug!(device_index = config.device_index, "supervisor gone before fail status");
                    }
                }
                outcome
            })?;
        info!(device_index, "kv transfer worker started");

        Ok(TransferWorkerHandle {
            mem_tx,
            task_tx: Some(task_tx),
            status_rx,
            join: Some(join),
        })
    }
}

/// Supervisor side of a running worker.
#[derive(Debug)]
pub struct TransferWorkerHandle {
    mem_tx: Sender<SharedKvMemory>,
    task_tx: Option<Sender<KvMoveTask>>,
    status_rx: Receiver<TransferStatus>,
    join: Option<JoinHandle<TransferOutcome>>,
}

impl TransferWorkerHandle {
    /// Hand over the memory manager of the next tensor-parallel rank.
    pub fn send_mem_manager(&self, memory: SharedKvMemory) -> Result<()> {
        self.mem_tx
            .send(memory)
            .map_err(|_| Error::Transfer("worker no longer accepts memory managers".into()))
    }

    /// Next status message, waiting up to `timeout`.
    pub fn recv_status(&self, timeout: Duration) -> Result<TransferStatus> {
        self.status_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Transfer("timed out waiting for worker status".into()),
            RecvTimeoutError::Disconnected => Error::Transfer("worker exited".into()),
        })
    }

    /// Wait for the three startup statuses, in order.
    ///
    /// Memory managers may be sent before or while waiting.
    pub fn wait_ready(&self, transport_name: &str, timeout: Duration) -> Result<()> {
        for expected in [
            TransferStatus::ProcStart,
            TransferStatus::MemManagersReady,
            TransferStatus::TransportReady(transport_name.to_string()),
        ] {
            let status = self.recv_status(timeout)?;
            if status != expected {
                return Err(Error::Transfer(format!(
                    "expected status {expected}, worker sent {status}"
                )));
            }
        }
        Ok(())
    }

    pub fn submit(&self, task: KvMoveTask) -> Result<()> {
        self.task_tx
            .as_ref()
            .ok_or_else(|| Error::Transfer("worker is shut down".into()))?
            .send(task)
            .map_err(|_| Error::Transfer("worker exited".into()))
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Close the task channel and wait for the worker to exit.
    pub fn shutdown(mut self) -> TransferOutcome {
        self.task_tx = None;
        match self.join.take().map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => TransferOutcome::Failed("worker thread panicked".into()),
            None => TransferOutcome::Completed,
        }
    }
}

fn run<T: KvTransport>(
    config: &TransferConfig,
    mut transport: T,
    mem_rx: &Receiver<SharedKvMemory>,
    task_rx: &Receiver<KvMoveTask>,
    status_tx: &Sender<TransferStatus>,
) -> TransferOutcome {
    transport.apply_tuning(&COMM_TUNING_ENV);
    if status_tx.send(TransferStatus::ProcStart).is_err() {
        return supervisor_gone();
    }

    let mems = match receive_mem_managers(config, mem_rx) {
        Ok(mems) => mems,
        Err(e) => return TransferOutcome::Failed(e.to_string()),
    };
    if status_tx.send(TransferStatus::MemManagersReady).is_err() {
        return supervisor_gone();
    }

    if let Err(e) = transport.connect(config.setup_timeout) {
        return TransferOutcome::Failed(e.to_string());
    }
    let ready = TransferStatus::TransportReady(transport.name().to_string());
    if status_tx.send(ready).is_err() {
        return supervisor_gone();
    }

    while let Ok(task) = task_rx.recv() {
        let start = Instant::now();
        if let Err(e) = move_kv(config, &mut transport, &mems, &task) {
            return TransferOutcome::Failed(format!("{}: {e}", task.to_decode_log_info()));
        }
        info!(
            cost_ms = start.elapsed().as_millis() as u64,
            task = %task.to_decode_log_info(),
            "trans finished"
        );
        if status_tx.send(TransferStatus::Ok).is_err() {
            break;
        }
    }
    TransferOutcome::Completed
}

fn supervisor_gone() -> TransferOutcome {
    TransferOutcome::Failed("supervisor gone".into())
}

fn receive_mem_managers(
    config: &TransferConfig,
    mem_rx: &Receiver<SharedKvMemory>,
) -> Result<Vec<SharedKvMemory>> {
    let mut mems = Vec::with_capacity(config.tp);
    for rank in 0..config.tp {
        let mem = mem_rx.recv_timeout(config.setup_timeout).map_err(|_| {
            Error::Transfer(format!("no memory manager for rank {rank} within timeout"))
        })?;
        mems.push(mem);
    }
    if mems.len() != config.tp || config.device_index >= mems.len() {
        return Err(Error::Transfer(format!(
            "got {} memory managers for tp {} and device {}",
            mems.len(),
            config.tp,
            config.device_index
        )));
    }
    Ok(mems)
}

fn move_kv<T: KvTransport>(
    config: &TransferConfig,
    transport: &mut T,
    mems: &[SharedKvMemory],
    task: &KvMoveTask,
) -> Result<()> {
    if task.move_kv_len == 0 {
        return Ok(());
    }
    if task.move_kv_len != task.decode_token_indexes.len() {
        return Err(Error::Transfer(format!(
            "move_kv_len {} but {} destination slots",
            task.move_kv_len,
            task.decode_token_indexes.len()
        )));
    }
    info!(task = %task.to_decode_log_info(), "trans start");
    let payload = transport.recv(task.request_id, config.recv_timeout)?;
    if payload.ranks.len() != mems.len() {
        return Err(Error::Transfer(format!(
            "payload carries {} ranks, expected {}",
            payload.ranks.len(),
            mems.len()
        )));
    }
    for (mem, rows) in mems.iter().zip(&payload.ranks) {
        mem.write()
            .receive_from_prefill_node(&task.decode_token_indexes, rows)?;
    }
    mems[config.device_index].read().device().synchronize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv_cache::KvMemoryConfig;
    use crate::core::request::RequestId;
    use crate::disagg::transport::{ChannelTransport, KvPayload};

    fn config(setup_timeout: Duration) -> TransferConfig {
        TransferConfig {
            tp: 1,
            device_index: 0,
            setup_timeout,
            recv_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_startup_stops_when_supervisor_is_gone() {
        let (_prefill, transport) = ChannelTransport::pair("nccl", 1);
        let (_mem_tx, mem_rx) = bounded(1);
        let (_task_tx, task_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();
        drop(status_rx);

        // Would otherwise wait the full setup timeout for a memory manager.
        let start = Instant::now();
        let outcome = run(
            &config(Duration::from_secs(30)),
            transport,
            &mem_rx,
            &task_rx,
            &status_tx,
        );
        assert_eq!(outcome, TransferOutcome::Failed("supervisor gone".into()));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    /// Transport that only checks tuning arrives before the handshake.
    struct TuningCheck {
        tuned: bool,
    }

    impl KvTransport for TuningCheck {
        fn name(&self) -> &str {
            "check"
        }

        fn apply_tuning(&mut self, settings: &[(&str, &str)]) {
            self.tuned = settings == COMM_TUNING_ENV.as_slice();
        }

        fn connect(&mut self, _timeout: Duration) -> Result<()> {
            if self.tuned {
                Ok(())
            } else {
                Err(Error::Transfer("connected before tuning".into()))
            }
        }

        fn recv(&mut self, request_id: RequestId, _timeout: Duration) -> Result<KvPayload> {
            Err(Error::Transfer(format!("no payload for {request_id}")))
        }
    }

    #[test]
    fn test_tuning_applied_before_connect() {
        let (mem_tx, mem_rx) = bounded(1);
        let (task_tx, task_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();
        let memory = KvMemory::new(KvMemoryConfig::new(4, 1, 2, 1), candle_core::Device::Cpu).unwrap();
        mem_tx.send(Arc::new(RwLock::new(memory))).unwrap();
        drop(task_tx);

        let transport = TuningCheck { tuned: false };
        let outcome = run(
            &config(Duration::from_secs(1)),
            transport,
            &mem_rx,
            &task_rx,
            &status_tx,
        );
        assert_eq!(outcome, TransferOutcome::Completed);
        let statuses: Vec<_> = status_rx.try_iter().collect();
        assert_eq!(statuses.last(), Some(&TransferStatus::TransportReady("check".into())));
    }
}
