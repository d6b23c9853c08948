// SPDX-License-Identifier: AGPL-3.0-only

//! Software (virtual coprocessor) firmware
//!
//! Implements [`FirmwareLoader`] with an in-process thread that plays the
//! firmware's side of the IPC channel: it drains the command queue, keeps its
//! own table of loaded networks, and answers through the response queue.
//! This enables:
//!
//! 1. **CI without hardware**: every lifecycle path, including timeouts and
//!    late responses, runs against the real host code.
//!
//! 2. **Fault scripting**: [`FirmwareControl`] scripts per-category replies
//!    (answer, answer late, reject, stay silent) and injects stray responses.
//!
//! ## Reply model
//!
//! ```text
//! command queue ──► firmware thread ──► reply scheduled at now + delay
//!                        │                        │
//!                  (doorbell wake)          (deadline reached)
//!                                                 ▼
//!                                        response queue ──► host worker
//! ```

use crate::error::{NpuError, Result};
use crate::firmware::FirmwareLoader;
use crate::ipc::{IpcChannel, QueueIndex};
use crate::lock;
use crate::protocol::{FirmwareResponse, HostCommand, OpKind, PacketCodec, STATUS_OK};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Status returned for exec/unload against a handle the firmware doesn't know
pub const ERR_UNKNOWN_HANDLE: u32 = 0x0000_0e01;

/// Idle wake interval of the firmware thread
const IDLE_TICK: Duration = Duration::from_millis(50);

/// Scripted answer to one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Answer success immediately
    Ok,
    /// Answer success after a delay
    OkAfter(Duration),
    /// Answer with a firmware error code
    Reject(u32),
    /// Never answer
    Silent,
}

/// How `boot` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBehavior {
    /// Start and bring the link up
    Normal,
    /// Fail to boot
    Fail,
    /// Start but never bring the link up (handshake will fail)
    NoLink,
}

/// Software firmware configuration
#[derive(Debug, Clone)]
pub struct SoftwareFirmwareConfig {
    /// First firmware handle handed out on load
    pub first_handle: u32,
    /// Exec status reported on successful exec
    pub exec_status: u32,
    /// Boot behaviour
    pub boot: BootBehavior,
}

impl Default for SoftwareFirmwareConfig {
    fn default() -> Self {
        Self {
            first_handle: 0x100,
            exec_status: 0,
            boot: BootBehavior::Normal,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    defaults: [Option<Reply>; 3],
    queued: [VecDeque<Reply>; 3],
}

impl Script {
    fn next(&mut self, kind: OpKind) -> Reply {
        let slot = kind.slot();
        self.queued[slot]
            .pop_front()
            .or(self.defaults[slot])
            .unwrap_or(Reply::Ok)
    }
}

#[derive(Debug, Default)]
struct ControlState {
    script: Script,
    commands: Vec<HostCommand>,
    // firmware handle → host network id
    loaded: HashMap<u32, u64>,
    link: Option<(Arc<IpcChannel>, Arc<dyn PacketCodec>)>,
}

/// Shared handle for scripting and observing the software firmware
#[derive(Debug, Clone, Default)]
pub struct FirmwareControl {
    state: Arc<Mutex<ControlState>>,
}

impl FirmwareControl {
    /// Answer every `kind` command with `reply` until changed
    pub fn set_reply(&self, kind: OpKind, reply: Reply) {
        lock(&self.state).script.defaults[kind.slot()] = Some(reply);
    }

    /// Answer the next `kind` command with `reply`, then fall back to the default
    pub fn queue_reply(&self, kind: OpKind, reply: Reply) {
        lock(&self.state).script.queued[kind.slot()].push_back(reply);
    }

    /// Commands received so far, in arrival order
    pub fn commands(&self) -> Vec<HostCommand> {
        lock(&self.state).commands.clone()
    }

    /// Number of commands received so far
    pub fn command_count(&self) -> usize {
        lock(&self.state).commands.len()
    }

    /// Host network id behind a firmware handle
    pub fn network_for_handle(&self, firmware_handle: u32) -> Option<u64> {
        lock(&self.state).loaded.get(&firmware_handle).copied()
    }

    /// Networks the firmware currently holds
    pub fn loaded_count(&self) -> usize {
        lock(&self.state).loaded.len()
    }

    /// Push an unsolicited response into the response queue
    ///
    /// # Errors
    ///
    /// Returns `SubsystemNotReady` if the firmware has not booted, or the
    /// IPC failure if the queue rejects the message.
    pub fn inject(&self, response: FirmwareResponse) -> Result<()> {
        let (ipc, codec) = lock(&self.state)
            .link
            .clone()
            .ok_or(NpuError::SubsystemNotReady)?;
        ipc.send(QueueIndex::Response, &codec.encode_response(&response))?;
        Ok(())
    }
}

/// In-process virtual coprocessor
#[derive(Debug)]
pub struct SoftwareFirmware {
    config: SoftwareFirmwareConfig,
    control: FirmwareControl,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Default for SoftwareFirmware {
    fn default() -> Self {
        Self::new(SoftwareFirmwareConfig::default())
    }
}

impl SoftwareFirmware {
    /// Create with explicit configuration
    pub fn new(config: SoftwareFirmwareConfig) -> Self {
        Self {
            config,
            control: FirmwareControl::default(),
            shutdown: None,
            thread: None,
        }
    }

    /// Scripting handle; stays valid across boots
    pub fn control(&self) -> FirmwareControl {
        self.control.clone()
    }
}

impl FirmwareLoader for SoftwareFirmware {
    fn boot(&mut self, ipc: &Arc<IpcChannel>, codec: &Arc<dyn PacketCodec>) -> Result<()> {
        if self.thread.is_some() {
            return Err(NpuError::firmware("software firmware already running"));
        }
        if self.config.boot == BootBehavior::Fail {
            return Err(NpuError::firmware("software firmware boot failure (scripted)"));
        }

        let doorbell = ipc.attach_doorbell(QueueIndex::Command);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        lock(&self.control.state).link = Some((Arc::clone(ipc), Arc::clone(codec)));

        let core = FirmwareCore {
            ipc: Arc::clone(ipc),
            codec: Arc::clone(codec),
            control: self.control.clone(),
            next_handle: self.config.first_handle,
            exec_status: self.config.exec_status,
            scheduled: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name("npu-fw-sim".into())
            .spawn(move || core.run(&doorbell, &shutdown_rx))
            .map_err(|e| NpuError::firmware(format!("failed to spawn firmware thread: {e}")))?;

        self.shutdown = Some(shutdown_tx);
        self.thread = Some(thread);

        if self.config.boot == BootBehavior::Normal {
            ipc.set_link_up(true);
        }
        info!("Software firmware booted ({:?})", self.config.boot);
        Ok(())
    }

    fn shutdown(&mut self, ipc: &IpcChannel) {
        ipc.set_link_up(false);
        if let Some(tx) = self.shutdown.take() {
            // Receiver gone means the thread already exited
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Software firmware thread panicked");
            }
        }
        let mut state = lock(&self.control.state);
        state.link = None;
        state.loaded.clear();
        info!("Software firmware stopped");
    }

    fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for SoftwareFirmware {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// State owned by the firmware thread
struct FirmwareCore {
    ipc: Arc<IpcChannel>,
    codec: Arc<dyn PacketCodec>,
    control: FirmwareControl,
    next_handle: u32,
    exec_status: u32,
    scheduled: Vec<(Instant, FirmwareResponse)>,
}

impl FirmwareCore {
    fn run(mut self, doorbell: &Receiver<()>, shutdown: &Receiver<()>) {
        loop {
            let tick = self
                .scheduled
                .iter()
                .map(|(due, _)| due.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(IDLE_TICK);

            select! {
                recv(shutdown) -> _ => break,
                recv(doorbell) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.drain_commands();
                }
                default(tick) => {}
            }
            self.flush_due();
        }
        debug!("Software firmware thread exiting");
    }

    fn drain_commands(&mut self) {
        while let Some(words) = self.ipc.receive(QueueIndex::Command) {
            match self.codec.decode_command(&words) {
                Ok(command) => self.handle(command),
                Err(e) => warn!("Firmware dropped malformed command: {e}"),
            }
        }
    }

    fn handle(&mut self, command: HostCommand) {
        let kind = command.kind();
        let reply = {
            let mut state = lock(&self.control.state);
            state.commands.push(command.clone());
            state.script.next(kind)
        };
        debug!("Firmware {kind} trans={} reply={reply:?}", command.trans_id());

        let delay = match reply {
            Reply::Silent => return,
            Reply::Ok | Reply::Reject(_) => Duration::ZERO,
            Reply::OkAfter(delay) => delay,
        };
        let status = match reply {
            Reply::Reject(code) => code,
            _ => STATUS_OK,
        };

        let response = self.execute(&command, status);
        self.scheduled.push((Instant::now() + delay, response));
    }

    fn execute(&mut self, command: &HostCommand, status: u32) -> FirmwareResponse {
        let mut state = lock(&self.control.state);
        match *command {
            HostCommand::Load {
                trans_id,
                network_id,
                ..
            } => {
                let firmware_handle = if status == STATUS_OK {
                    let handle = self.next_handle;
                    self.next_handle = self.next_handle.wrapping_add(1);
                    state.loaded.insert(handle, network_id);
                    handle
                } else {
                    0
                };
                FirmwareResponse::Load {
                    trans_id,
                    status,
                    firmware_handle,
                }
            }
            HostCommand::Exec {
                trans_id,
                firmware_handle,
                ..
            } => {
                let status = if status == STATUS_OK && !state.loaded.contains_key(&firmware_handle)
                {
                    ERR_UNKNOWN_HANDLE
                } else {
                    status
                };
                FirmwareResponse::Exec {
                    trans_id,
                    status,
                    exec_status: self.exec_status,
                }
            }
            HostCommand::Unload {
                trans_id,
                firmware_handle,
            } => {
                let status = if status != STATUS_OK {
                    status
                } else if state.loaded.remove(&firmware_handle).is_some() {
                    STATUS_OK
                } else {
                    ERR_UNKNOWN_HANDLE
                };
                FirmwareResponse::Unload { trans_id, status }
            }
        }
    }

    fn flush_due(&mut self) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|(at, _)| *at <= now);
        self.scheduled = later;

        for (_, response) in due {
            let words = self.codec.encode_response(&response);
            if let Err(e) = self.ipc.send(QueueIndex::Response, &words) {
                warn!(
                    "Firmware could not post {} response trans={}: {e}",
                    response.kind(),
                    response.trans_id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BufferSpan, WordCodec};

    fn booted() -> (SoftwareFirmware, Arc<IpcChannel>, Arc<dyn PacketCodec>) {
        let ipc = Arc::new(IpcChannel::new());
        let codec: Arc<dyn PacketCodec> = Arc::new(WordCodec);
        let mut fw = SoftwareFirmware::default();
        fw.boot(&ipc, &codec).unwrap();
        ipc.pre_init().unwrap();
        (fw, ipc, codec)
    }

    fn recv_response(
        ipc: &IpcChannel,
        bell: &Receiver<()>,
        codec: &Arc<dyn PacketCodec>,
    ) -> FirmwareResponse {
        bell.recv_timeout(Duration::from_secs(2)).expect("doorbell");
        let words = ipc.receive(QueueIndex::Response).expect("response");
        codec.decode_response(&words).unwrap()
    }

    #[test]
    fn test_load_then_unload() {
        let (mut fw, ipc, codec) = booted();
        let bell = ipc.attach_doorbell(QueueIndex::Response);

        let load = HostCommand::Load {
            trans_id: 1,
            network_id: 77,
            image: BufferSpan::default(),
            first_block_size: 0,
        };
        ipc.send(QueueIndex::Command, &codec.encode_command(&load))
            .unwrap();
        let FirmwareResponse::Load {
            status,
            firmware_handle,
            ..
        } = recv_response(&ipc, &bell, &codec)
        else {
            panic!("expected load response");
        };
        assert_eq!(status, STATUS_OK);
        assert_eq!(fw.control().network_for_handle(firmware_handle), Some(77));

        let unload = HostCommand::Unload {
            trans_id: 2,
            firmware_handle,
        };
        ipc.send(QueueIndex::Command, &codec.encode_command(&unload))
            .unwrap();
        let rsp = recv_response(&ipc, &bell, &codec);
        assert_eq!(rsp.status(), STATUS_OK);
        assert_eq!(fw.control().loaded_count(), 0);

        fw.shutdown(&ipc);
        assert!(!fw.is_running());
        assert!(!ipc.is_link_up());
    }

    #[test]
    fn test_exec_on_unknown_handle() {
        let (_fw, ipc, codec) = booted();
        let bell = ipc.attach_doorbell(QueueIndex::Response);

        let exec = HostCommand::Exec {
            trans_id: 3,
            firmware_handle: 0xabc,
            input: BufferSpan::default(),
            output: BufferSpan::default(),
            flags: 0,
        };
        ipc.send(QueueIndex::Command, &codec.encode_command(&exec))
            .unwrap();
        assert_eq!(
            recv_response(&ipc, &bell, &codec).status(),
            ERR_UNKNOWN_HANDLE
        );
    }

    #[test]
    fn test_scripted_boot_failure() {
        let ipc = Arc::new(IpcChannel::new());
        let codec: Arc<dyn PacketCodec> = Arc::new(WordCodec);
        let mut fw = SoftwareFirmware::new(SoftwareFirmwareConfig {
            boot: BootBehavior::Fail,
            ..Default::default()
        });
        assert!(matches!(
            fw.boot(&ipc, &codec),
            Err(NpuError::Firmware { .. })
        ));
        assert!(!fw.is_running());
    }

    #[test]
    fn test_queued_reply_overrides_default_once() {
        let control = FirmwareControl::default();
        control.set_reply(OpKind::Exec, Reply::Silent);
        control.queue_reply(OpKind::Exec, Reply::Reject(9));

        let mut state = lock(&control.state);
        assert_eq!(state.script.next(OpKind::Exec), Reply::Reject(9));
        assert_eq!(state.script.next(OpKind::Exec), Reply::Silent);
        assert_eq!(state.script.next(OpKind::Load), Reply::Ok);
    }
}
