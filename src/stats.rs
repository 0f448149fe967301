//! End-of-run capture summary.

use anyhow::{Context, Result};
use ring_capture::CaptureStats;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct CaptureSummary<'a> {
    finished_at: String,
    interface: &'a str,
    output: String,
    #[serde(flatten)]
    stats: &'a CaptureStats,
}

/// Human-readable summary on stderr, mirroring what the kernel saw.
pub fn report(stats: &CaptureStats) {
    eprintln!("{} packets received by the kernel.", stats.kernel_received);
    eprintln!("{} packets written to the capture file.", stats.packets_captured);
    if stats.non_ip_dropped > 0 {
        eprintln!("{} non-IP frames dropped by the filter.", stats.non_ip_dropped);
    }
    eprintln!("{} packets dropped by the kernel.", stats.kernel_dropped);
    if stats.buffer_overflow {
        eprintln!("Capture ended early: the preallocated buffer filled up.");
    }
}

/// JSON summary to `path`, or stdout when `path` is `-`.
pub fn write_json(stats: &CaptureStats, interface: &str, output: &Path, path: &Path) -> Result<()> {
    let summary = CaptureSummary {
        finished_at: chrono::Utc::now().to_rfc3339(),
        interface,
        output: output.display().to_string(),
        stats,
    };
    let json = serde_json::to_string_pretty(&summary)?;

    if path.as_os_str() == "-" {
        println!("{json}");
    } else {
        std::fs::write(path, json.as_bytes())
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }
    Ok(())
}
