//! Response worker (interrupt bottom-half)
//!
//! A dedicated thread owns the response side of the IPC channel. It sleeps on
//! the response doorbell, drains every queued message, and hands each decoded
//! response to the caller waiting on that category and transaction. Anything
//! else is stale: logged, counted, dropped. The worker never touches the
//! network table and never blocks on a caller.

use crate::diagnostics::DiagnosticCounters;
use crate::error::{NpuError, Result};
use crate::ipc::{IpcChannel, QueueIndex};
use crate::lock;
use crate::protocol::{FirmwareResponse, OpKind, PacketCodec};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct Pending {
    trans_id: u32,
    tx: Sender<FirmwareResponse>,
}

/// One completion slot per category
#[derive(Debug, Default)]
pub(crate) struct Completions {
    slots: [Mutex<Option<Pending>>; 3],
    closed: AtomicBool,
}

impl Completions {
    /// Register the wait for `trans_id` in `kind`'s slot
    ///
    /// The category issuance lock guarantees the slot is free. `None` once
    /// the completions are closed.
    pub(crate) fn arm(&self, kind: OpKind, trans_id: u32) -> Option<Receiver<FirmwareResponse>> {
        let mut slot = lock(&self.slots[kind.slot()]);
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let (tx, rx) = bounded(1);
        if let Some(p) = slot.replace(Pending { trans_id, tx }) {
            warn!("{kind} completion re-armed over trans={}", p.trans_id);
        }
        Some(rx)
    }

    /// Withdraw the wait for `trans_id`, if it is still registered
    pub(crate) fn disarm(&self, kind: OpKind, trans_id: u32) {
        let mut slot = lock(&self.slots[kind.slot()]);
        if slot.as_ref().is_some_and(|p| p.trans_id == trans_id) {
            slot.take();
        }
    }

    /// Deliver `response` to its waiter; `false` if nobody is waiting for it
    pub(crate) fn resolve(&self, response: FirmwareResponse) -> bool {
        let mut slot = lock(&self.slots[response.kind().slot()]);
        match slot.as_ref() {
            // Send stays under the slot lock: nothing lands after `disarm`.
            // One-slot channel, one send per arm: never blocks
            Some(p) if p.trans_id == response.trans_id() => {
                slot.take().is_some_and(|p| p.tx.try_send(response).is_ok())
            }
            _ => false,
        }
    }

    /// Refuse new waits and cancel every registered one
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_all();
    }

    /// Accept waits again
    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Drop every registered wait; waiters observe a disconnect
    pub(crate) fn cancel_all(&self) {
        for slot in &self.slots {
            if let Some(p) = lock(slot).take() {
                debug!("Cancelled pending trans={}", p.trans_id);
            }
        }
    }

    /// Registered transaction per category
    pub(crate) fn pending(&self) -> [Option<u32>; 3] {
        OpKind::ALL.map(|kind| lock(&self.slots[kind.slot()]).as_ref().map(|p| p.trans_id))
    }
}

/// Handle to the running worker thread
#[derive(Debug)]
pub(crate) struct ResponseWorker {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl ResponseWorker {
    /// Attach the response doorbell and start draining
    pub(crate) fn start(
        ipc: Arc<IpcChannel>,
        codec: Arc<dyn PacketCodec>,
        completions: Arc<Completions>,
        counters: Arc<DiagnosticCounters>,
    ) -> Result<Self> {
        let doorbell = ipc.attach_doorbell(QueueIndex::Response);
        let (shutdown, shutdown_rx) = bounded(1);

        let thread = std::thread::Builder::new()
            .name("npu-ipc-rsp".into())
            .spawn(move || {
                let drain = || drain_responses(&ipc, codec.as_ref(), &completions, &counters);
                // Responses may have landed before the doorbell was attached
                drain();
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(doorbell) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                            drain();
                        }
                    }
                }
                debug!("Response worker exiting");
            })
            .map_err(|e| NpuError::invalid_state(format!("failed to spawn response worker: {e}")))?;

        debug!("Response worker started");
        Ok(Self { shutdown, thread })
    }

    /// Stop the thread and wait for it
    pub(crate) fn stop(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            warn!("Response worker panicked");
        }
    }
}

fn drain_responses(
    ipc: &IpcChannel,
    codec: &dyn PacketCodec,
    completions: &Completions,
    counters: &DiagnosticCounters,
) {
    while let Some(words) = ipc.receive(QueueIndex::Response) {
        let response = match codec.decode_response(&words) {
            Ok(r) => r,
            Err(e) => {
                counters.record_malformed();
                warn!("Dropping malformed IPC response: {e}");
                continue;
            }
        };

        if completions.resolve(response) {
            counters.record_delivered();
            trace!("Delivered {} trans={}", response.kind(), response.trans_id());
        } else {
            counters.record_stale();
            warn!(
                "Dropping stale {} response trans={} status={:#x}",
                response.kind(),
                response.trans_id(),
                response.status()
            );
        }
    }
}
