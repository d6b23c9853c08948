//! Host-side driver core for an NPU coprocessor.
//!
//! The host does not run inference itself. It owns the lifecycle of network
//! images living on a coprocessor and talks to the coprocessor firmware over
//! a pair of shared-memory message queues. Every command is correlated with
//! its response by transaction id and bounded by a timeout.
//!
//! # Architecture
//!
//! ```text
//! callers (any thread)
//!   │  load / exec / unload
//!   ▼
//! HostContext ── NetworkTable (32 slots)   BufferMap   PowerVotes
//!   │  per-category issuance lock + completion slot
//!   ▼
//! IpcChannel  ── command ring ──────────────► firmware (FirmwareLoader)
//!             ◄─ response ring ── doorbell ──┘
//!   ▲
//! ResponseWorker thread: drains responses, wakes the matching caller
//! ```
//!
//! # Quick start
//!
//! ```
//! use npu_host::{ExecArgs, HostConfig, HostContext, LoadRequest, Platform};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (platform, _fw, _power) = Platform::software();
//! let host = HostContext::new(HostConfig::default(), platform);
//! host.init()?;
//!
//! let base = host.map_buf(3, 8192)?;
//! let id = host.load_network(&LoadRequest {
//!     buffer_handle: 3,
//!     physical_address: base,
//!     size: 4096,
//!     first_block_size: 1024,
//! })?;
//! host.exec_network(id, &ExecArgs::in_buffer(3, base, 4096, 4096))?;
//! host.unload_network(id)?;
//! host.deinit()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod buffers;
mod config;
mod diagnostics;
mod error;
mod firmware;
mod host;
mod ipc;
mod network;
mod power;
pub mod protocol;
mod worker;

pub use backends::{BackendType, Platform};
pub use buffers::{BufferMap, IOVA_BASE, IOVA_PAGE};
pub use config::{
    HostConfig, DEINIT_GRACE_MS, FIRMWARE_VERSION, LARGE_NETWORK_SIZE_THRESHOLD,
    MAX_LOADED_NETWORK, NPU_IPC_BUF_LENGTH, NW_LARGE_EXEC_TIMEOUT_MS, NW_LOAD_TIMEOUT_MS,
    NW_SMALL_EXEC_TIMEOUT_MS, NW_UNLOAD_TIMEOUT_MS,
};
pub use diagnostics::{CalState, DiagnosticCounters, NetworkSummary, TimeoutStats};
pub use error::{IpcError, NpuError, Result};
pub use firmware::FirmwareLoader;
pub use host::{ExecArgs, ExecStatus, HostContext, HostState, LoadRequest, NpuInfo};
pub use ipc::{IpcChannel, QueueIndex};
pub use network::{
    NetworkNotFound, NetworkState, NetworkTable, NpuNetwork, SlotRef, TableError,
    INVALID_FIRMWARE_HANDLE,
};
pub use power::{PowerController, PowerVote, PowerVotes, SoftwarePower};
pub use protocol::{BufferSpan, FirmwareResponse, HostCommand, OpKind, PacketCodec, WordCodec};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ExecArgs, ExecStatus, HostConfig, HostContext, LoadRequest, NpuError, NpuInfo, Platform,
        Result,
    };
}
