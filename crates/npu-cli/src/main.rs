//! `npu`: command-line front end for the NPU host control plane.
//!
//! Runs against the software platform (virtual coprocessor in-process).
//!
//! ```text
//! USAGE:
//!   npu info                              Interface limits and version
//!   npu run [--size N] [--count N]        Load, exec N times, unload
//!   npu stress [--threads N] [--iterations N]
//!                                         Concurrent load/exec/unload cycles
//! ```

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use npu_host::backends::{FirmwareControl, Reply};
use npu_host::{
    ExecArgs, HostConfig, HostContext, LoadRequest, OpKind, Platform, LARGE_NETWORK_SIZE_THRESHOLD,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Buffer handle the CLI maps for images and I/O
const BUF: i32 = 1;

#[derive(Parser)]
#[command(name = "npu", about = "NPU host control plane CLI", version)]
struct Cli {
    /// Exec timeout for small networks, in milliseconds.
    #[arg(long, global = true, default_value_t = 2000)]
    exec_timeout_ms: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print interface limits and firmware version.
    Info,
    /// Load one network, execute it, unload it.
    Run {
        /// Network image size in bytes.
        #[arg(long, default_value_t = 4096)]
        size: u32,
        /// Number of executions.
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Have firmware ignore every Nth exec (0 = never).
        #[arg(long, default_value_t = 0)]
        drop_every: u32,
    },
    /// Hammer the host from several threads.
    Stress {
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Load/exec/unload cycles per thread.
        #[arg(long, default_value_t = 100)]
        iterations: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let exec_timeout = Duration::from_millis(cli.exec_timeout_ms);

    match cli.command {
        Cmd::Info => cmd_info()?,
        Cmd::Run {
            size,
            count,
            drop_every,
        } => cmd_run(exec_timeout, size, count, drop_every)?,
        Cmd::Stress {
            threads,
            iterations,
        } => cmd_stress(exec_timeout, threads, iterations)?,
    }

    Ok(())
}

fn cmd_info() -> Result<()> {
    let (platform, _, _) = Platform::software();
    let host = HostContext::new(HostConfig::default(), platform);
    let info = host.get_info();
    let config = host.config();

    println!("Backend        : {}", info.backend);
    println!("Firmware       : {:#010x}", info.firmware_version);
    println!("Network slots  : {}", info.max_loaded_networks);
    println!("IPC ring       : {} words", info.ipc_buf_length);
    println!("Large network  : > {} bytes", info.large_network_threshold);
    println!("Load timeout   : {:?}", config.load_timeout);
    println!("Unload timeout : {:?}", config.unload_timeout);
    println!(
        "Exec timeout   : {:?} small / {:?} large",
        config.small_exec_timeout, config.large_exec_timeout
    );
    Ok(())
}

/// Small and large exec timeouts; large networks get twelve times as long
fn exec_timeouts(small: Duration) -> Result<(Duration, Duration)> {
    let large = small
        .checked_mul(12)
        .with_context(|| format!("exec timeout {small:?} too large"))?;
    Ok((small, large))
}

fn start_host(exec_timeout: Duration) -> Result<(HostContext, FirmwareControl)> {
    let (small, large) = exec_timeouts(exec_timeout)?;
    let (platform, firmware, _) = Platform::software();
    let config = HostConfig::default().with_exec_timeouts(small, large);
    let host = HostContext::new(config, platform);
    host.init().context("host init failed")?;
    Ok((host, firmware))
}

fn cmd_run(exec_timeout: Duration, size: u32, count: u32, drop_every: u32) -> Result<()> {
    ensure!(size > 0, "image size must be non-zero");
    let (host, firmware) = start_host(exec_timeout)?;

    let io = 4096;
    let span = size.checked_add(2 * io).context("image too large")?;
    let base = host.map_buf(BUF, span)?;
    let id = host.load_network(&LoadRequest {
        buffer_handle: BUF,
        physical_address: base,
        size,
        first_block_size: size.min(1024),
    })?;
    let class = if size > LARGE_NETWORK_SIZE_THRESHOLD {
        "large"
    } else {
        "small"
    };
    println!("Loaded network {id} ({size} bytes, {class})");

    let args = ExecArgs::in_buffer(BUF, base + u64::from(size), io, io);
    let mut failures = 0;
    let started = Instant::now();
    for i in 1..=count {
        if drop_every > 0 && i % drop_every == 0 {
            firmware.queue_reply(OpKind::Exec, Reply::Silent);
        }
        match host.exec_network(id, &args) {
            Ok(status) => tracing::debug!("exec {i}: status {:#x}", status.0),
            Err(e) => {
                failures += 1;
                println!("exec {i}: {e}");
            }
        }
    }
    let elapsed = started.elapsed();

    host.unload_network(id)?;
    println!(
        "{count} execs in {elapsed:.2?} ({failures} failed), votes after unload: {}",
        host.power_votes()
    );

    let stats = host.dump_debug_timeout_stats();
    println!(
        "Timeouts: load={} exec={} unload={}  stale responses={}",
        stats.load_timeouts, stats.exec_timeouts, stats.unload_timeouts, stats.stale_responses
    );
    host.deinit()?;
    Ok(())
}

fn cmd_stress(exec_timeout: Duration, threads: usize, iterations: u32) -> Result<()> {
    ensure!(threads > 0, "need at least one thread");
    let (host, _firmware) = start_host(exec_timeout)?;
    let host = Arc::new(host);
    let base = host.map_buf(BUF, 16 * 1024)?;

    let started = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let host = Arc::clone(&host);
            thread::spawn(move || -> Result<u32> {
                let args = ExecArgs::in_buffer(BUF, base + 4096, 4096, 4096);
                for _ in 0..iterations {
                    let id = host.load_network(&LoadRequest {
                        buffer_handle: BUF,
                        physical_address: base,
                        size: 4096,
                        first_block_size: 1024,
                    })?;
                    host.exec_network(id, &args)?;
                    host.unload_network(id)?;
                }
                tracing::info!("thread {t} done");
                Ok(iterations)
            })
        })
        .collect();

    let mut cycles = 0;
    for worker in workers {
        let done = worker
            .join()
            .map_err(|_| anyhow::anyhow!("stress thread panicked"))??;
        cycles += done;
    }
    let elapsed = started.elapsed();

    println!(
        "{cycles} cycles on {threads} threads in {elapsed:.2?} ({:.0} cycles/s)",
        f64::from(cycles) / elapsed.as_secs_f64()
    );
    println!(
        "Networks left: {}  power votes: {}",
        host.network_count(),
        host.power_votes()
    );
    host.dump_cal_state();
    host.deinit()?;
    println!("Power votes after deinit: {}", host.power_votes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_timeouts_scale() {
        let (small, large) = exec_timeouts(Duration::from_millis(2000)).unwrap();
        assert_eq!(small, Duration::from_secs(2));
        assert_eq!(large, Duration::from_secs(24));
    }

    #[test]
    fn test_huge_exec_timeout_is_an_error() {
        let ms = u64::MAX;
        let err = exec_timeouts(Duration::from_millis(ms)).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(start_host(Duration::from_millis(ms)).is_err());
    }
}
