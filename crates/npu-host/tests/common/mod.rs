//! Shared rig for host integration tests

#![allow(dead_code)]

use npu_host::backends::{FirmwareControl, SoftwareFirmwareConfig};
use npu_host::{ExecArgs, HostConfig, HostContext, LoadRequest, Platform, Result, SoftwarePower};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Buffer handle every test maps
pub const BUF: i32 = 7;

/// Size of that buffer
pub const BUF_SIZE: u32 = 64 * 1024;

pub struct Rig {
    pub host: Arc<HostContext>,
    pub fw: FirmwareControl,
    pub power: Arc<SoftwarePower>,
    pub base: u64,
}

impl Rig {
    pub fn load(&self, size: u32) -> Result<u64> {
        self.host.load_network(&LoadRequest {
            buffer_handle: BUF,
            physical_address: self.base,
            size,
            first_block_size: size.min(1024),
        })
    }

    pub fn exec_args(&self) -> ExecArgs {
        ExecArgs::in_buffer(BUF, self.base, 1024, 1024)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Short deadlines so timeout paths finish quickly
pub fn fast_config() -> HostConfig {
    HostConfig::default()
        .with_load_timeout(Duration::from_millis(200))
        .with_unload_timeout(Duration::from_millis(200))
        .with_exec_timeouts(Duration::from_millis(100), Duration::from_millis(1000))
        .with_deinit_grace(Duration::from_millis(200))
}

/// Deadlines no healthy exchange gets near
pub fn patient_config() -> HostConfig {
    HostConfig::default()
        .with_load_timeout(Duration::from_secs(5))
        .with_unload_timeout(Duration::from_secs(5))
        .with_exec_timeouts(Duration::from_secs(5), Duration::from_secs(5))
        .with_deinit_grace(Duration::from_millis(200))
}

/// Initialized host on the software platform with `BUF` mapped
pub fn rig() -> Rig {
    rig_with(fast_config(), SoftwareFirmwareConfig::default())
}

pub fn rig_with(config: HostConfig, firmware: SoftwareFirmwareConfig) -> Rig {
    init_tracing();
    let (platform, fw, power) = Platform::software_with(firmware);
    let host = Arc::new(HostContext::new(config, platform));
    host.init().expect("init");
    let base = host.map_buf(BUF, BUF_SIZE).expect("map");
    Rig {
        host,
        fw,
        power,
        base,
    }
}

/// Poll `cond` for up to two seconds
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
