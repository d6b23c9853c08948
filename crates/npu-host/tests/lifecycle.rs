//! Network lifecycle tests on the software platform
//!
//! Each test builds its own host with short deadlines; timeouts are driven
//! by scripting the virtual firmware to stay silent or answer late.

mod common;

use common::{fast_config, rig, rig_with, BUF};
use npu_host::backends::{BootBehavior, Reply, SoftwareFirmwareConfig};
use npu_host::{
    FirmwareResponse, HostConfig, HostContext, HostState, LoadRequest, NetworkState, NpuError,
    OpKind, Platform, PowerController, MAX_LOADED_NETWORK,
};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_load_exec_unload_roundtrip() {
    let rig = rig();
    assert_eq!(rig.host.power_votes(), 1, "init vote");

    let id = rig.load(4096).expect("load");
    assert_eq!(rig.host.network_count(), 1);
    assert_eq!(rig.host.power_votes(), 2, "resident vote");
    let summary = rig.host.network(id).expect("summary");
    assert_eq!(summary.state, NetworkState::Loaded);
    assert_eq!(rig.fw.network_for_handle(summary.firmware_handle), Some(id));

    let status = rig.host.exec_network(id, &rig.exec_args()).expect("exec");
    assert_eq!(status.0, 0);
    assert_eq!(rig.host.power_votes(), 2, "exec vote released");

    rig.host.unload_network(id).expect("unload");
    assert_eq!(rig.host.network_count(), 0);
    assert_eq!(rig.host.power_votes(), 1);
    assert_eq!(rig.fw.loaded_count(), 0);

    rig.host.deinit().expect("deinit");
    assert_eq!(rig.host.power_votes(), 0);
    assert!(!rig.power.is_enabled());
}

#[test]
fn test_table_full_on_33rd_load() {
    let rig = rig();
    let ids: Vec<u64> = (0..MAX_LOADED_NETWORK)
        .map(|_| rig.load(2048).expect("load"))
        .collect();
    assert_eq!(rig.host.network_count(), MAX_LOADED_NETWORK);

    let sent = rig.fw.command_count();
    let err = rig.load(2048).unwrap_err();
    assert!(matches!(err, NpuError::TableFull { capacity: 32 }), "{err}");
    assert_eq!(rig.fw.command_count(), sent, "no IPC for a full table");

    // Freeing one slot makes room again
    rig.host.unload_network(ids[5]).expect("unload");
    rig.load(2048).expect("load after unload");
    assert_eq!(rig.host.network_count(), MAX_LOADED_NETWORK);
}

#[test]
fn test_unknown_network_sends_nothing() {
    let rig = rig();
    let sent = rig.fw.command_count();

    let err = rig.host.exec_network(999, &rig.exec_args()).unwrap_err();
    assert!(matches!(err, NpuError::NetworkNotFound { id: 999 }));
    let err = rig.host.unload_network(999).unwrap_err();
    assert!(matches!(err, NpuError::NetworkNotFound { id: 999 }));

    assert_eq!(rig.fw.command_count(), sent);
}

#[test]
fn test_exec_timeout_class_follows_size() {
    let rig = rig();
    let small = rig.load(4096).expect("small");
    let large = rig.load(6144).expect("large");
    rig.fw.set_reply(OpKind::Exec, Reply::Silent);

    let err = rig.host.exec_network(small, &rig.exec_args()).unwrap_err();
    assert!(matches!(err, NpuError::ExecTimeout { duration_ms: 100 }), "{err}");

    let started = Instant::now();
    let err = rig.host.exec_network(large, &rig.exec_args()).unwrap_err();
    assert!(matches!(err, NpuError::ExecTimeout { duration_ms: 1000 }), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(1000));

    // Timed-out exec leaves the network loaded
    assert_eq!(rig.host.network(small).unwrap().state, NetworkState::Loaded);
    assert_eq!(rig.host.dump_debug_timeout_stats().exec_timeouts, 2);
    assert_eq!(rig.host.power_votes(), 3);
}

#[test]
fn test_threshold_itself_is_small() {
    let config = fast_config();
    assert_eq!(config.exec_timeout(5 * 1024), config.small_exec_timeout);
    assert_eq!(config.exec_timeout(5 * 1024 + 1), config.large_exec_timeout);
}

#[test]
fn test_load_rejected_releases_slot_and_vote() {
    let rig = rig();
    rig.fw.queue_reply(OpKind::Load, Reply::Reject(0x42));

    let err = rig.load(4096).unwrap_err();
    assert!(matches!(err, NpuError::LoadRejected { code: 0x42 }), "{err}");
    assert_eq!(rig.host.network_count(), 0);
    assert_eq!(rig.host.power_votes(), 1);

    // Next load uses the default reply again
    rig.load(4096).expect("load");
}

#[test]
fn test_load_timeout_releases_slot_and_vote() {
    let rig = rig();
    rig.fw.queue_reply(OpKind::Load, Reply::Silent);

    let err = rig.load(4096).unwrap_err();
    assert!(matches!(err, NpuError::LoadTimeout { duration_ms: 200 }), "{err}");
    assert_eq!(rig.host.network_count(), 0);
    assert_eq!(rig.host.power_votes(), 1);

    let cal = rig.host.dump_cal_state();
    assert_eq!(cal.pending, [None, None, None]);
    assert!(cal.networks.is_empty());
}

#[test]
fn test_exec_rejected_keeps_network() {
    let rig = rig();
    let id = rig.load(4096).unwrap();
    rig.fw.queue_reply(OpKind::Exec, Reply::Reject(0x7));

    let err = rig.host.exec_network(id, &rig.exec_args()).unwrap_err();
    assert!(matches!(err, NpuError::ExecRejected { code: 0x7 }));
    assert_eq!(rig.host.network(id).unwrap().state, NetworkState::Loaded);
    rig.host.exec_network(id, &rig.exec_args()).expect("retry");
}

#[test]
fn test_unload_timeout_marks_stale() {
    let rig = rig();
    let id = rig.load(4096).unwrap();
    rig.fw.queue_reply(OpKind::Unload, Reply::Silent);

    let err = rig.host.unload_network(id).unwrap_err();
    assert!(matches!(err, NpuError::UnloadTimeout { .. }), "{err}");
    assert_eq!(rig.host.network(id).unwrap().state, NetworkState::Stale);
    assert_eq!(rig.host.network_count(), 1);

    let err = rig.host.exec_network(id, &rig.exec_args()).unwrap_err();
    assert!(matches!(err, NpuError::NetworkStale { .. }));

    // Firmware still holds the handle, so a retry succeeds
    rig.host.unload_network(id).expect("retry unload");
    assert_eq!(rig.host.network_count(), 0);
    assert_eq!(rig.host.power_votes(), 1);
}

#[test]
fn test_stale_entry_released_by_deinit() {
    let rig = rig();
    rig.load(4096).unwrap();
    let id = rig.load(4096).unwrap();
    rig.fw.queue_reply(OpKind::Unload, Reply::Silent);
    rig.host.unload_network(id).unwrap_err();
    assert_eq!(rig.host.power_votes(), 3);

    rig.host.deinit().unwrap();
    assert_eq!(rig.host.power_votes(), 0);
    assert_eq!(rig.host.network_count(), 0);
    assert!(!rig.power.is_enabled());
    assert_eq!(rig.host.state(), HostState::Uninitialized);
}

#[test]
fn test_injected_stale_response_is_dropped() {
    let rig = rig();
    let id = rig.load(4096).unwrap();
    let before = rig.host.dump_cal_state();

    rig.fw
        .inject(FirmwareResponse::Load {
            trans_id: 0xdead,
            status: 0,
            firmware_handle: 0x999,
        })
        .unwrap();
    rig.fw
        .inject(FirmwareResponse::Unload {
            trans_id: 0xbeef,
            status: 0,
        })
        .unwrap();

    assert!(common::eventually(|| {
        rig.host.dump_debug_timeout_stats().stale_responses == 2
    }));
    assert_eq!(rig.host.dump_cal_state(), before);
    assert_eq!(rig.host.network(id).unwrap().state, NetworkState::Loaded);
}

#[test]
fn test_late_response_after_timeout_is_stale() {
    let rig = rig();
    let id = rig.load(4096).unwrap();
    rig.fw
        .queue_reply(OpKind::Exec, Reply::OkAfter(Duration::from_millis(300)));

    let err = rig.host.exec_network(id, &rig.exec_args()).unwrap_err();
    assert!(err.is_timeout());

    assert!(common::eventually(|| {
        rig.host.dump_debug_timeout_stats().stale_responses == 1
    }));
    // The late answer must not complete the next exec
    rig.host.exec_network(id, &rig.exec_args()).expect("next exec");
    assert_eq!(rig.host.dump_debug_timeout_stats().stale_responses, 1);
}

#[test]
fn test_buffer_validation() {
    let rig = rig();
    let err = rig
        .host
        .load_network(&LoadRequest {
            buffer_handle: 99,
            physical_address: rig.base,
            size: 1024,
            first_block_size: 512,
        })
        .unwrap_err();
    assert!(matches!(err, NpuError::InvalidBuffer { .. }));

    let err = rig
        .host
        .load_network(&LoadRequest {
            buffer_handle: BUF,
            physical_address: rig.base,
            size: 1024,
            first_block_size: 2048,
        })
        .unwrap_err();
    assert!(matches!(err, NpuError::InvalidBuffer { .. }));

    let id = rig.load(4096).unwrap();
    let sent = rig.fw.command_count();
    let mut args = rig.exec_args();
    args.output.size = u32::MAX;
    let err = rig.host.exec_network(id, &args).unwrap_err();
    assert!(matches!(err, NpuError::InvalidBuffer { .. }));
    assert_eq!(rig.fw.command_count(), sent);
}

#[test]
fn test_unmap_refuses_buffer_in_use() {
    let rig = rig();
    let id = rig.load(4096).unwrap();

    let err = rig.host.unmap_buf(BUF).unwrap_err();
    assert!(matches!(err, NpuError::BufferInUse { handle: BUF }));

    rig.host.unload_network(id).unwrap();
    rig.host.unmap_buf(BUF).expect("unmap");
    assert!(rig.load(4096).is_err());
}

#[test]
fn test_operations_refused_before_init() {
    common::init_tracing();
    let (platform, fw, _power) = Platform::software();
    let host = HostContext::new(fast_config(), platform);

    assert!(matches!(host.map_buf(1, 4096), Err(NpuError::SubsystemNotReady)));
    assert!(matches!(
        host.exec_network(1, &Default::default()),
        Err(NpuError::SubsystemNotReady)
    ));
    assert!(matches!(host.unload_network(1), Err(NpuError::SubsystemNotReady)));
    assert_eq!(fw.command_count(), 0);

    // get_info does not need the subsystem
    let info = host.get_info();
    assert_eq!(info.max_loaded_networks, 32);
    assert_eq!(info.ipc_buf_length, 512);
    assert_eq!(info.loaded_networks, 0);
}

#[test]
fn test_handshake_failure_is_not_ready() {
    let (platform, _fw, power) = Platform::software_with(SoftwareFirmwareConfig {
        boot: BootBehavior::NoLink,
        ..Default::default()
    });
    let host = HostContext::new(fast_config(), platform);

    let err = host.init().unwrap_err();
    assert!(matches!(err, NpuError::SubsystemNotReady), "{err}");
    assert_eq!(host.state(), HostState::Uninitialized);
    assert_eq!(host.power_votes(), 0);
    assert!(!power.is_enabled());
    assert!(!host.firmware_enabled());
}

#[test]
fn test_boot_failure_leaves_no_vote() {
    let (platform, _fw, _power) = Platform::software_with(SoftwareFirmwareConfig {
        boot: BootBehavior::Fail,
        ..Default::default()
    });
    let host = HostContext::new(fast_config(), platform);

    assert!(matches!(host.init(), Err(NpuError::Firmware { .. })));
    assert_eq!(host.power_votes(), 0);
}

#[test]
fn test_power_refusal_fails_init() {
    let (platform, _fw, power) = Platform::software();
    power.set_refuse(true);
    let host = HostContext::new(fast_config(), platform);

    assert!(matches!(host.init(), Err(NpuError::Power { .. })));
    assert_eq!(host.state(), HostState::Uninitialized);

    power.set_refuse(false);
    host.init().expect("init after rail recovers");
}

#[test]
fn test_reinit_after_deinit() {
    let rig = rig();
    rig.load(4096).unwrap();
    rig.host.deinit().unwrap();
    assert!(matches!(rig.load(4096), Err(NpuError::SubsystemNotReady)));

    rig.host.init().unwrap();
    assert!(rig.host.firmware_enabled());
    let base = rig.host.map_buf(BUF, 8192).unwrap();
    let id = rig
        .host
        .load_network(&LoadRequest {
            buffer_handle: BUF,
            physical_address: base,
            size: 4096,
            first_block_size: 1024,
        })
        .expect("load after reinit");
    assert_eq!(rig.host.network_count(), 1);
    rig.host.unload_network(id).unwrap();
}

#[test]
fn test_init_and_deinit_are_idempotent() {
    let rig = rig();
    rig.host.init().expect("second init");
    assert_eq!(rig.host.power_votes(), 1);
    rig.host.deinit().unwrap();
    rig.host.deinit().expect("second deinit");
    assert_eq!(rig.host.power_votes(), 0);
}

#[test]
fn test_drop_deinitializes() {
    let rig = rig();
    rig.load(4096).unwrap();
    let power = rig.power.clone();
    let fw = rig.fw.clone();
    drop(rig);

    assert!(!power.is_enabled());
    assert_eq!(fw.loaded_count(), 0);
}

#[test]
fn test_deinit_cancels_inflight_wait() {
    let config = HostConfig {
        small_exec_timeout: Duration::from_secs(30),
        ..fast_config()
    };
    let rig = rig_with(config, SoftwareFirmwareConfig::default());
    let id = rig.load(4096).unwrap();
    rig.fw.set_reply(OpKind::Exec, Reply::Silent);

    let host = rig.host.clone();
    let args = rig.exec_args();
    let waiter = thread::spawn(move || host.exec_network(id, &args));
    assert!(common::eventually(|| rig.host.dump_cal_state().pending[1].is_some()));

    let started = Instant::now();
    rig.host.deinit().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(NpuError::SubsystemNotReady)), "{result:?}");
    assert_eq!(rig.host.power_votes(), 0);
    assert_eq!(rig.host.state(), HostState::Uninitialized);
}
