//! ringsniff — capture live traffic from an interface into a pcap file.
//!
//! Packets are acquired through a kernel-shared memory-mapped AF_PACKET
//! ring, optionally filtered by protocol/port, and written either as a
//! stream or in one shot from a preallocated buffer. Run
//! `ringsniff --help` for usage and the filter grammar.

use anyhow::{Context, Result};
use clap::Parser;
use ring_capture::{CaptureConfig, Filter, Sniffer};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

mod cli;
mod stats;

use cli::Cli;

static RUNNING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let filter = match &cli.filter {
        Some(spec) => Filter::parse(spec).with_context(|| format!("invalid filter `{spec}`"))?,
        None => Filter::new(),
    };

    let config = CaptureConfig {
        interface: cli.interface.clone(),
        output_path: cli.output.clone(),
        ring_size: cli.ring_size,
        max_pcap_filesize: cli.max_pcap_filesize,
    };

    let mut sniffer = Sniffer::create(&config, filter).context("couldn't create sniffer")?;

    RUNNING.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
    }

    eprintln!(
        "ringsniff — capturing on {} ({}, ring {} MiB{}) → {}  (Ctrl-C to stop)",
        cli.interface,
        sniffer.version().name(),
        sniffer.layout().ring_bytes / (1024 * 1024),
        if cli.max_pcap_filesize > 0 {
            format!(", {} bytes preallocated", cli.max_pcap_filesize)
        } else {
            String::new()
        },
        cli.output.display(),
    );

    sniffer.run(&RUNNING).context("capture failed")?;
    tracing::info!("capture stopped, finalizing output");

    let capture_stats = sniffer.finish().context("couldn't finalize the capture file")?;
    stats::report(&capture_stats);

    if let Some(path) = &cli.stats_json {
        stats::write_json(&capture_stats, &cli.interface, &cli.output, path)?;
    }

    Ok(())
}
