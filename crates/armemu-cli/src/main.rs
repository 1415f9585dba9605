#![forbid(unsafe_code)]

mod loopback;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use armemu_dma_transport::{DmaTransport, TransportConfig};
use armemu_io_snapshot::io::state::IoSnapshot;
use armemu_platform::{LevelInterrupts, MmioBus, WorkerPool};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::loopback::TRANSPORT_BASE;

#[derive(Debug, Parser)]
#[command(about = "Native runner for the armemu DMA transport (loopback and snapshot debugging)")]
struct Args {
    /// Transport configuration as JSON. Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `packet_size` from the configuration.
    #[arg(long)]
    packet_size: Option<u32>,

    /// Override `queue_depth` from the configuration.
    #[arg(long)]
    queue_depth: Option<u32>,

    /// Override `max_workers` from the configuration.
    #[arg(long)]
    max_workers: Option<u32>,

    /// Number of packets echoed through the guest.
    #[arg(long, default_value_t = 16)]
    packets: usize,

    /// Restore the transport's device state before running.
    #[arg(long)]
    snapshot_load: Option<PathBuf>,

    /// Save the transport's device state on exit.
    #[arg(long)]
    snapshot_save: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<TransportConfig> {
    let Some(path) = path else {
        return Ok(TransportConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config: {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(packet_size) = args.packet_size {
        config.packet_size = packet_size;
    }
    if let Some(queue_depth) = args.queue_depth {
        config.queue_depth = queue_depth;
    }
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }

    let irq = Arc::new(LevelInterrupts::new());
    let workers = Arc::new(
        WorkerPool::new(config.max_workers as usize).context("failed to start dispatch workers")?,
    );
    let transport =
        DmaTransport::new(config, irq.clone(), workers).context("invalid transport config")?;

    let mut device = transport.device();
    let mut bus = MmioBus::new();
    bus.register_range(
        TRANSPORT_BASE,
        device.window_size(),
        Box::new(device.clone()),
    );

    if let Some(path) = &args.snapshot_load {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to open snapshot for load: {}", path.display()))?;
        device
            .load_state(&bytes)
            .with_context(|| format!("failed to restore snapshot: {}", path.display()))?;
        tracing::info!(
            channels = transport.channel_count(),
            addresses = transport.address_count(),
            "restored transport snapshot"
        );
    }

    let report = loopback::run(&transport, &mut bus, &irq, args.packets)?;
    tracing::info!(
        channel = report.channel,
        packets = report.packets,
        bytes = report.bytes,
        interrupts = report.interrupts,
        "loopback complete"
    );
    println!(
        "channel {}: {} packets, {} bytes echoed ({} directory entries)",
        report.channel, report.packets, report.bytes, report.directory_entries
    );

    if let Some(path) = &args.snapshot_save {
        fs::write(path, device.save_state())
            .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved transport snapshot");
    }

    Ok(())
}
