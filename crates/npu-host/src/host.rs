// SPDX-License-Identifier: AGPL-3.0-only

//! Host context: the network lifecycle state machine
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──init()──► Ready ──deinit()──► Deinitializing ──► Uninitialized
//! ```
//!
//! # Command issuance
//!
//! Each category (load, exec, unload) has one issuance lock and one
//! completion slot. A caller holds the lock from transaction-id assignment
//! until its wait ends, so at most one command per category is outstanding
//! and callers of a category complete in the order their commands were
//! accepted. Categories proceed independently.
//!
//! ```text
//! caller ─► validate ─► vote ─► [issue lock] ─► arm ─► send ─► wait ─► [unlock]
//!                                                  ▲
//! worker ─────────────── drain response queue ─────┘ (matching trans only)
//! ```
//!
//! The table and buffer map locks are never held across a wait.
//!
//! # Lock order
//!
//! `state` → `inflight`; issuance lock → `networks` → `buffers`.

use crate::backends::{BackendType, Platform};
use crate::buffers::BufferMap;
use crate::config::{as_millis, HostConfig, FIRMWARE_VERSION, NPU_IPC_BUF_LENGTH};
use crate::diagnostics::{CalState, DiagnosticCounters, NetworkSummary, TimeoutStats};
use crate::error::{NpuError, Result};
use crate::firmware::FirmwareLoader;
use crate::ipc::{IpcChannel, QueueIndex};
use crate::lock;
use crate::network::{NetworkState, NetworkTable, NpuNetwork, SlotRef, TableError};
use crate::power::{PowerVote, PowerVotes};
use crate::protocol::{BufferSpan, FirmwareResponse, HostCommand, OpKind, PacketCodec, STATUS_OK};
use crate::worker::{Completions, ResponseWorker};
use crossbeam_channel::RecvTimeoutError;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the host context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No firmware, no worker
    Uninitialized,
    /// Accepting operations
    Ready,
    /// Draining; new operations are refused
    Deinitializing,
}

/// Memory description of a network image (load ioctl)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest {
    /// Mapped buffer holding the image
    pub buffer_handle: i32,
    /// Device address of the image inside the buffer
    pub physical_address: u64,
    /// Image size in bytes
    pub size: u32,
    /// Size of the first block the firmware fetches
    pub first_block_size: u32,
}

impl LoadRequest {
    const fn image(&self) -> BufferSpan {
        BufferSpan {
            handle: self.buffer_handle,
            physical_address: self.physical_address,
            size: self.size,
        }
    }
}

/// Arguments of an exec ioctl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecArgs {
    /// Input buffer
    pub input: BufferSpan,
    /// Output buffer
    pub output: BufferSpan,
    /// Execution flags, passed through to firmware
    pub flags: u32,
}

impl ExecArgs {
    /// Input at `base` and output right after it, both in buffer `handle`
    pub fn in_buffer(handle: i32, base: u64, input_size: u32, output_size: u32) -> Self {
        Self {
            input: BufferSpan {
                handle,
                physical_address: base,
                size: input_size,
            },
            output: BufferSpan {
                handle,
                physical_address: base + u64::from(input_size),
                size: output_size,
            },
            flags: 0,
        }
    }
}

/// Firmware-reported result of a successful exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus(pub u32);

/// Static capability and version info (get_info ioctl)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpuInfo {
    /// Firmware interface version
    pub firmware_version: u32,
    /// Network table capacity
    pub max_loaded_networks: usize,
    /// IPC ring length in words
    pub ipc_buf_length: usize,
    /// Size above which exec uses the large timeout
    pub large_network_threshold: u32,
    /// Currently loaded networks
    pub loaded_networks: usize,
    /// Platform variant
    pub backend: BackendType,
}

/// Per-device host state
#[derive(Debug)]
pub struct HostContext {
    config: HostConfig,
    backend: BackendType,
    state: Mutex<HostState>,
    inflight: Mutex<usize>,
    drained: Condvar,
    firmware: Mutex<Box<dyn FirmwareLoader>>,
    firmware_enabled: AtomicBool,
    codec: Arc<dyn PacketCodec>,
    ipc: Arc<IpcChannel>,
    power: Arc<PowerVotes>,
    init_vote: Mutex<Option<PowerVote>>,
    networks: Mutex<NetworkTable>,
    buffers: Mutex<BufferMap>,
    completions: Arc<Completions>,
    issue: [Mutex<()>; 3],
    worker: Mutex<Option<ResponseWorker>>,
    counters: Arc<DiagnosticCounters>,
    next_trans_id: AtomicU32,
    next_network_id: AtomicU64,
}

/// Counts an operation in flight for `deinit`'s drain
struct OpGuard<'a> {
    host: &'a HostContext,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut n = lock(&self.host.inflight);
        *n -= 1;
        if *n == 0 {
            self.host.drained.notify_all();
        }
    }
}

/// An outstanding exec: holds its network against unload and its I/O
/// buffers against unmap until dropped
struct ExecClaim<'a> {
    host: &'a HostContext,
    slot: SlotRef,
    input: i32,
    output: i32,
}

impl Drop for ExecClaim<'_> {
    fn drop(&mut self) {
        let mut networks = lock(&self.host.networks);
        if let Some(n) = networks.get_mut(self.slot) {
            n.active_execs = n.active_execs.saturating_sub(1);
        }
        let mut buffers = lock(&self.host.buffers);
        buffers.unpin(self.input);
        buffers.unpin(self.output);
    }
}

impl HostContext {
    /// Create an uninitialized context on `platform`
    pub fn new(config: HostConfig, platform: Platform) -> Self {
        info!("Creating NPU host context ({} backend)", platform.backend_type);
        Self {
            config,
            backend: platform.backend_type,
            state: Mutex::new(HostState::Uninitialized),
            inflight: Mutex::new(0),
            drained: Condvar::new(),
            firmware: Mutex::new(platform.firmware),
            firmware_enabled: AtomicBool::new(false),
            codec: platform.codec,
            ipc: Arc::new(IpcChannel::new()),
            power: PowerVotes::new(platform.power),
            init_vote: Mutex::new(None),
            networks: Mutex::new(NetworkTable::new()),
            buffers: Mutex::new(BufferMap::new()),
            completions: Arc::new(Completions::default()),
            issue: Default::default(),
            worker: Mutex::new(None),
            counters: Arc::new(DiagnosticCounters::default()),
            next_trans_id: AtomicU32::new(1),
            next_network_id: AtomicU64::new(1),
        }
    }

    /// Configuration in effect
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> HostState {
        *lock(&self.state)
    }

    /// Outstanding power votes
    pub fn power_votes(&self) -> u32 {
        self.power.count()
    }

    /// Whether the power rail is up
    pub fn power_enabled(&self) -> bool {
        self.power.is_powered()
    }

    /// Whether firmware is running
    pub fn firmware_enabled(&self) -> bool {
        self.firmware_enabled.load(Ordering::Acquire)
    }

    /// Live entries in the network table
    pub fn network_count(&self) -> usize {
        lock(&self.networks).len()
    }

    /// Snapshot of one network
    pub fn network(&self, id: u64) -> Option<NetworkSummary> {
        lock(&self.networks).find(id).map(summarize)
    }

    /// Bring the subsystem up: power vote, firmware boot, IPC handshake, worker
    ///
    /// Calling `init` on a ready context is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidState` while a `deinit` is in progress
    /// - `Power` / `Firmware` if the rail or the firmware fail to come up
    /// - `SubsystemNotReady` if the IPC handshake fails
    ///
    /// On any error the context stays `Uninitialized` with no votes held.
    pub fn init(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            HostState::Ready => return Ok(()),
            HostState::Deinitializing => {
                return Err(NpuError::invalid_state("deinit in progress"));
            }
            HostState::Uninitialized => {}
        }

        info!("Initializing NPU host");
        let vote = self.power.acquire()?;

        let mut firmware = lock(&self.firmware);
        firmware.boot(&self.ipc, &self.codec)?;
        self.firmware_enabled.store(true, Ordering::Release);

        if let Err(e) = self.ipc.pre_init() {
            error!("IPC pre-init handshake failed: {e}");
            self.abort_init(&mut **firmware);
            return Err(NpuError::SubsystemNotReady);
        }

        self.completions.reopen();
        let worker = match ResponseWorker::start(
            Arc::clone(&self.ipc),
            Arc::clone(&self.codec),
            Arc::clone(&self.completions),
            Arc::clone(&self.counters),
        ) {
            Ok(w) => w,
            Err(e) => {
                self.abort_init(&mut **firmware);
                return Err(e);
            }
        };

        *lock(&self.worker) = Some(worker);
        *lock(&self.init_vote) = Some(vote);
        *state = HostState::Ready;
        info!("NPU host ready (votes={})", self.power.count());
        Ok(())
    }

    fn abort_init(&self, firmware: &mut dyn FirmwareLoader) {
        firmware.shutdown(&self.ipc);
        self.firmware_enabled.store(false, Ordering::Release);
        self.ipc.deinit();
    }

    /// Tear the subsystem down and return to `Uninitialized`
    ///
    /// Waits up to `deinit_grace` for in-flight operations, then cancels
    /// their waits (they fail `SubsystemNotReady`). Networks still loaded
    /// are dropped with their power votes. Calling `deinit` on an
    /// uninitialized context is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidState` if another `deinit` is already running.
    pub fn deinit(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                HostState::Uninitialized => return Ok(()),
                HostState::Deinitializing => {
                    return Err(NpuError::invalid_state("deinit already in progress"));
                }
                HostState::Ready => *state = HostState::Deinitializing,
            }
        }
        info!("Deinitializing NPU host");

        if !self.wait_drained(Some(self.config.deinit_grace)) {
            warn!("In-flight operations after grace period, cancelling waits");
            self.completions.close();
            self.wait_drained(None);
        }

        if let Some(worker) = lock(&self.worker).take() {
            worker.stop();
        }

        let leftover = lock(&self.networks).drain();
        for n in &leftover {
            warn!(
                "Tearing down network {} (handle {:#x}, {:?})",
                n.id, n.firmware_handle, n.state
            );
        }
        drop(leftover);

        lock(&self.firmware).shutdown(&self.ipc);
        self.firmware_enabled.store(false, Ordering::Release);
        self.ipc.deinit();
        *lock(&self.buffers) = BufferMap::new();
        lock(&self.init_vote).take();

        *lock(&self.state) = HostState::Uninitialized;
        info!("NPU host deinitialized (votes={})", self.power.count());
        Ok(())
    }

    /// Wait for in-flight operations to finish; `false` on timeout
    fn wait_drained(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(|d| Instant::now() + d);
        let mut n = lock(&self.inflight);
        while *n > 0 {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    n = self
                        .drained
                        .wait_timeout(n, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    n = self.drained.wait(n).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        true
    }

    fn begin_op(&self) -> Result<OpGuard<'_>> {
        let state = lock(&self.state);
        if *state != HostState::Ready {
            return Err(NpuError::SubsystemNotReady);
        }
        *lock(&self.inflight) += 1;
        Ok(OpGuard { host: self })
    }

    /// Static capability and version info
    pub fn get_info(&self) -> NpuInfo {
        let networks = lock(&self.networks);
        NpuInfo {
            firmware_version: FIRMWARE_VERSION,
            max_loaded_networks: networks.capacity(),
            ipc_buf_length: NPU_IPC_BUF_LENGTH,
            large_network_threshold: self.config.large_network_threshold,
            loaded_networks: networks.len(),
            backend: self.backend,
        }
    }

    /// Map a caller buffer for device access
    ///
    /// # Errors
    ///
    /// `SubsystemNotReady` unless ready; `InvalidBuffer` for a zero size or a
    /// conflicting re-map.
    pub fn map_buf(&self, handle: i32, size: u32) -> Result<u64> {
        let _op = self.begin_op()?;
        lock(&self.buffers).map(handle, size)
    }

    /// Unmap a caller buffer
    ///
    /// # Errors
    ///
    /// `SubsystemNotReady` unless ready; `BufferInUse` if a live network's
    /// image is in the buffer or an outstanding exec reads or writes it;
    /// `InvalidBuffer` if it is not mapped.
    pub fn unmap_buf(&self, handle: i32) -> Result<()> {
        let _op = self.begin_op()?;
        let networks = lock(&self.networks);
        if networks.references_buffer(handle) {
            return Err(NpuError::BufferInUse { handle });
        }
        lock(&self.buffers).unmap(handle)
    }

    /// Load a network image and return its host id
    ///
    /// # Errors
    ///
    /// - `SubsystemNotReady` unless ready
    /// - `InvalidBuffer` if the image range is not inside a mapped buffer
    /// - `TableFull` with `MAX_LOADED_NETWORK` networks live
    /// - `IpcSendFailed` if the command cannot be queued
    /// - `LoadRejected` / `LoadTimeout` on firmware refusal or silence
    pub fn load_network(&self, request: &LoadRequest) -> Result<u64> {
        let _op = self.begin_op()?;
        let image = request.image();
        if request.first_block_size > request.size {
            return Err(NpuError::invalid_buffer(format!(
                "first block {} larger than image {}",
                request.first_block_size, request.size
            )));
        }

        let id = self.next_network_id.fetch_add(1, Ordering::Relaxed);
        let slot = {
            let mut networks = lock(&self.networks);
            lock(&self.buffers).validate(&image)?;
            networks
                .insert(NpuNetwork::new(id, image, request.first_block_size))
                .map_err(|e| match e {
                    TableError::TableFull => NpuError::TableFull {
                        capacity: networks.capacity(),
                    },
                    TableError::DuplicateId(id) => NpuError::DuplicateNetwork { id },
                })?
        };
        debug!("Network {id}: reserved slot {}", slot.index());

        let vote = match self.power.acquire() {
            Ok(v) => v,
            Err(e) => {
                lock(&self.networks).remove_slot(slot);
                return Err(e);
            }
        };

        let outcome = self.transact(OpKind::Load, self.config.load_timeout, |trans_id| {
            if let Some(n) = lock(&self.networks).get_mut(slot) {
                n.transaction_id = trans_id;
            }
            HostCommand::Load {
                trans_id,
                network_id: id,
                image,
                first_block_size: request.first_block_size,
            }
        });

        let mut networks = lock(&self.networks);
        match outcome {
            Ok(FirmwareResponse::Load {
                status: STATUS_OK,
                firmware_handle,
                ..
            }) => {
                let network = networks
                    .get_mut(slot)
                    .ok_or(NpuError::SubsystemNotReady)?;
                network.firmware_handle = firmware_handle;
                network.state = NetworkState::Loaded;
                network.hold_vote(vote);
                info!("Network {id} loaded (handle {firmware_handle:#x}, {} bytes)", image.size);
                Ok(id)
            }
            Ok(response) => {
                networks.remove_slot(slot);
                drop(vote);
                warn!("Network {id}: load rejected (status {:#x})", response.status());
                Err(NpuError::LoadRejected {
                    code: response.status(),
                })
            }
            Err(e) => {
                networks.remove_slot(slot);
                drop(vote);
                Err(e)
            }
        }
    }

    /// Execute a loaded network
    ///
    /// Networks larger than the size threshold wait for the large exec
    /// timeout. On timeout the network stays loaded.
    ///
    /// # Errors
    ///
    /// - `SubsystemNotReady` unless ready
    /// - `NetworkNotFound` (no IPC is sent), `NetworkBusy`, `NetworkStale`
    /// - `InvalidBuffer` for unmapped input/output ranges
    /// - `IpcSendFailed`, `ExecRejected`, `ExecTimeout`
    pub fn exec_network(&self, id: u64, args: &ExecArgs) -> Result<ExecStatus> {
        let _op = self.begin_op()?;

        let (firmware_handle, size, _claim) = {
            let mut networks = lock(&self.networks);
            let slot = networks
                .slot_of(id)
                .ok_or(NpuError::NetworkNotFound { id })?;
            let network = networks
                .get_mut(slot)
                .ok_or(NpuError::NetworkNotFound { id })?;
            match network.state {
                NetworkState::Loaded => {}
                NetworkState::Loading | NetworkState::Unloading => {
                    return Err(NpuError::NetworkBusy { id });
                }
                NetworkState::Stale => return Err(NpuError::NetworkStale { id }),
            }

            let mut buffers = lock(&self.buffers);
            buffers.pin(&args.input)?;
            if let Err(e) = buffers.pin(&args.output) {
                buffers.unpin(args.input.handle);
                return Err(e);
            }
            network.active_execs += 1;
            let claim = ExecClaim {
                host: self,
                slot,
                input: args.input.handle,
                output: args.output.handle,
            };
            (network.firmware_handle, network.size, claim)
        };

        let timeout = self.config.exec_timeout(size);
        let _vote = self.power.acquire()?;

        let response = self.transact(OpKind::Exec, timeout, |trans_id| {
            if let Some(n) = lock(&self.networks).find_mut(id) {
                n.transaction_id = trans_id;
            }
            HostCommand::Exec {
                trans_id,
                firmware_handle,
                input: args.input,
                output: args.output,
                flags: args.flags,
            }
        })?;

        match response {
            FirmwareResponse::Exec {
                status: STATUS_OK,
                exec_status,
                ..
            } => {
                debug!("Network {id} executed (status {exec_status:#x})");
                Ok(ExecStatus(exec_status))
            }
            other => {
                warn!("Network {id}: exec rejected (status {:#x})", other.status());
                Err(NpuError::ExecRejected {
                    code: other.status(),
                })
            }
        }
    }

    /// Unload a network
    ///
    /// On timeout the entry stays in the table flagged stale; a later
    /// `unload_network` may retry.
    ///
    /// # Errors
    ///
    /// - `SubsystemNotReady` unless ready
    /// - `NetworkNotFound`
    /// - `NetworkBusy` while loading, unloading or executing
    /// - `IpcSendFailed`, `UnloadRejected`, `UnloadTimeout`
    pub fn unload_network(&self, id: u64) -> Result<()> {
        let _op = self.begin_op()?;

        let (slot, firmware_handle, previous) = {
            let mut networks = lock(&self.networks);
            let slot = networks
                .slot_of(id)
                .ok_or(NpuError::NetworkNotFound { id })?;
            let network = networks
                .get_mut(slot)
                .ok_or(NpuError::NetworkNotFound { id })?;
            let previous = network.state;
            match previous {
                NetworkState::Loaded | NetworkState::Stale => {}
                NetworkState::Loading | NetworkState::Unloading => {
                    return Err(NpuError::NetworkBusy { id });
                }
            }
            if network.is_executing() {
                return Err(NpuError::NetworkBusy { id });
            }
            network.state = NetworkState::Unloading;
            (slot, network.firmware_handle, previous)
        };

        let restore = |state: NetworkState| {
            if let Some(n) = lock(&self.networks).get_mut(slot) {
                n.state = state;
            }
        };

        let _vote = match self.power.acquire() {
            Ok(v) => v,
            Err(e) => {
                restore(previous);
                return Err(e);
            }
        };

        let outcome = self.transact(OpKind::Unload, self.config.unload_timeout, |trans_id| {
            if let Some(n) = lock(&self.networks).get_mut(slot) {
                n.transaction_id = trans_id;
            }
            HostCommand::Unload {
                trans_id,
                firmware_handle,
            }
        });

        match outcome {
            Ok(response) if response.status() == STATUS_OK => {
                // Dropping the entry releases its resident vote
                drop(lock(&self.networks).remove_slot(slot));
                info!("Network {id} unloaded");
                Ok(())
            }
            Ok(response) => {
                restore(previous);
                warn!("Network {id}: unload rejected (status {:#x})", response.status());
                Err(NpuError::UnloadRejected {
                    code: response.status(),
                })
            }
            Err(e) if e.is_timeout() => {
                restore(NetworkState::Stale);
                Err(e)
            }
            Err(e) => {
                restore(previous);
                Err(e)
            }
        }
    }

    fn next_trans_id(&self) -> u32 {
        loop {
            let id = self.next_trans_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Issue one command of category `kind` and wait for its response
    fn transact(
        &self,
        kind: OpKind,
        timeout: Duration,
        build: impl FnOnce(u32) -> HostCommand,
    ) -> Result<FirmwareResponse> {
        let _issue = lock(&self.issue[kind.slot()]);

        let trans_id = self.next_trans_id();
        let command = build(trans_id);
        let rx = self
            .completions
            .arm(kind, trans_id)
            .ok_or(NpuError::SubsystemNotReady)?;

        if let Err(e) = self
            .ipc
            .send(QueueIndex::Command, &self.codec.encode_command(&command))
        {
            self.completions.disarm(kind, trans_id);
            warn!("{kind} trans={trans_id}: send failed: {e}");
            return Err(e.into());
        }
        debug!("{kind} trans={trans_id}: sent, waiting up to {timeout:?}");

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("{kind} trans={trans_id}: wait cancelled");
                Err(NpuError::SubsystemNotReady)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.completions.disarm(kind, trans_id);
                // The worker may have delivered between the timeout and disarm
                if let Ok(response) = rx.try_recv() {
                    return Ok(response);
                }

                self.counters.record_timeout(kind);
                let duration_ms = as_millis(timeout);
                error!("{kind} trans={trans_id}: no response after {duration_ms}ms");
                self.dump_debug_timeout_stats();
                self.dump_cal_state();
                Err(match kind {
                    OpKind::Load => NpuError::LoadTimeout { duration_ms },
                    OpKind::Exec => NpuError::ExecTimeout { duration_ms },
                    OpKind::Unload => NpuError::UnloadTimeout { duration_ms },
                })
            }
        }
    }

    /// Log and return timeout statistics
    pub fn dump_debug_timeout_stats(&self) -> TimeoutStats {
        let stats = self.counters.snapshot();
        stats.log();
        stats
    }

    /// Log and return a control-and-status snapshot
    pub fn dump_cal_state(&self) -> CalState {
        let networks = lock(&self.networks).iter().map(summarize).collect();
        let cal = CalState {
            host_state: self.state(),
            firmware_enabled: self.firmware_enabled(),
            power_enabled: self.power_enabled(),
            power_votes: self.power.count(),
            link_up: self.ipc.is_link_up(),
            command_queue_words: self.ipc.occupancy(QueueIndex::Command),
            response_queue_words: self.ipc.occupancy(QueueIndex::Response),
            pending: self.completions.pending(),
            networks,
        };
        cal.log();
        cal
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        if self.state() == HostState::Ready {
            if let Err(e) = self.deinit() {
                warn!("deinit on drop failed: {e}");
            }
        }
    }
}

fn summarize(n: &NpuNetwork) -> NetworkSummary {
    NetworkSummary {
        id: n.id,
        firmware_handle: n.firmware_handle,
        size: n.size,
        state: n.state,
        transaction_id: n.transaction_id,
    }
}
