//! Timeout statistics and control-and-status dumps
//!
//! Both dumps go to `tracing` and are also returned as snapshots so tooling
//! and tests can inspect them.

use crate::host::HostState;
use crate::network::NetworkState;
use crate::protocol::OpKind;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Live counters shared by the host and its worker
#[derive(Debug, Default)]
pub struct DiagnosticCounters {
    timeouts: [AtomicU64; 3],
    stale_responses: AtomicU64,
    malformed_responses: AtomicU64,
    responses_delivered: AtomicU64,
}

impl DiagnosticCounters {
    pub(crate) fn record_timeout(&self, kind: OpKind) {
        self.timeouts[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> TimeoutStats {
        let t = |kind: OpKind| self.timeouts[kind.slot()].load(Ordering::Relaxed);
        TimeoutStats {
            load_timeouts: t(OpKind::Load),
            exec_timeouts: t(OpKind::Exec),
            unload_timeouts: t(OpKind::Unload),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            malformed_responses: self.malformed_responses.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Timeout and correlation statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutStats {
    /// Load waits that timed out
    pub load_timeouts: u64,
    /// Exec waits that timed out
    pub exec_timeouts: u64,
    /// Unload waits that timed out
    pub unload_timeouts: u64,
    /// Responses dropped for not matching a pending wait
    pub stale_responses: u64,
    /// Responses dropped for failing to decode
    pub malformed_responses: u64,
    /// Responses handed to a waiting caller
    pub responses_delivered: u64,
}

impl TimeoutStats {
    /// Log the statistics
    pub fn log(&self) {
        warn!(
            load = self.load_timeouts,
            exec = self.exec_timeouts,
            unload = self.unload_timeouts,
            stale = self.stale_responses,
            malformed = self.malformed_responses,
            delivered = self.responses_delivered,
            "NPU timeout stats"
        );
    }
}

/// One network as seen in a state dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    /// Host id
    pub id: u64,
    /// Firmware handle
    pub firmware_handle: u32,
    /// Image size
    pub size: u32,
    /// Lifecycle state
    pub state: NetworkState,
    /// Latest transaction
    pub transaction_id: u32,
}

/// Control-and-status snapshot of the host context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalState {
    /// Lifecycle state
    pub host_state: HostState,
    /// Firmware running
    pub firmware_enabled: bool,
    /// Power rail up
    pub power_enabled: bool,
    /// Outstanding power votes
    pub power_votes: u32,
    /// IPC link up
    pub link_up: bool,
    /// Words used in the command queue
    pub command_queue_words: usize,
    /// Words used in the response queue
    pub response_queue_words: usize,
    /// Pending transaction per category (load, exec, unload)
    pub pending: [Option<u32>; 3],
    /// Live networks
    pub networks: Vec<NetworkSummary>,
}

impl CalState {
    /// Log the snapshot
    pub fn log(&self) {
        info!(
            state = ?self.host_state,
            fw = self.firmware_enabled,
            power = self.power_enabled,
            votes = self.power_votes,
            link = self.link_up,
            cmd_words = self.command_queue_words,
            rsp_words = self.response_queue_words,
            pending = ?self.pending,
            "NPU CAL state"
        );
        for n in &self.networks {
            info!(
                id = n.id,
                handle = format_args!("{:#x}", n.firmware_handle),
                size = n.size,
                state = ?n.state,
                trans = n.transaction_id,
                "  network"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = DiagnosticCounters::default();
        counters.record_timeout(OpKind::Exec);
        counters.record_timeout(OpKind::Exec);
        counters.record_timeout(OpKind::Unload);
        counters.record_stale();

        let stats = counters.snapshot();
        assert_eq!(stats.exec_timeouts, 2);
        assert_eq!(stats.unload_timeouts, 1);
        assert_eq!(stats.load_timeouts, 0);
        assert_eq!(stats.stale_responses, 1);
    }
}
