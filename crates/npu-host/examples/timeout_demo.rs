//! Walk a network through its lifecycle, then force an exec timeout
//!
//! Shows the timeout statistics and CAL state dumps the host emits when
//! firmware goes quiet.

use npu_host::backends::Reply;
use npu_host::{ExecArgs, HostConfig, HostContext, LoadRequest, OpKind, Platform, Result};
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("npu_host=debug")
        .init();

    let (platform, firmware, _power) = Platform::software();
    let config = HostConfig::default()
        .with_exec_timeouts(Duration::from_millis(250), Duration::from_secs(2));
    let host = HostContext::new(config, platform);
    host.init()?;

    let base = host.map_buf(1, 16 * 1024)?;
    let id = host.load_network(&LoadRequest {
        buffer_handle: 1,
        physical_address: base,
        size: 4096,
        first_block_size: 1024,
    })?;
    let args = ExecArgs::in_buffer(1, base + 4096, 1024, 1024);

    let status = host.exec_network(id, &args)?;
    println!("exec ok: status {:#x}", status.0);

    firmware.queue_reply(OpKind::Exec, Reply::Silent);
    match host.exec_network(id, &args) {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("exec failed as scripted: {e}"),
    }

    let stats = host.dump_debug_timeout_stats();
    println!("exec timeouts so far: {}", stats.exec_timeouts);

    host.unload_network(id)?;
    host.deinit()?;
    println!("power votes after deinit: {}", host.power_votes());
    Ok(())
}
