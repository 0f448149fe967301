//! CLI definitions for ringsniff.

use clap::Parser;
use ring_capture::{MAX_RING_SIZE, MIN_RING_SIZE};
use std::path::PathBuf;

const FILTER_HELP: &str = "\
Filter expressions:
  The filter is a list of tokens separated by spaces; each token adds
  acceptance rules. If no filter is given, everything is captured.

  icmp                             capture ICMP
  tcp | udp                        capture every port of that protocol
  PORT[-PORT]                      TCP and UDP port or range, both directions
  (sport|dport):port:PORT[-PORT]   TCP and UDP, source or destination only
  (tcp|udp):PORT[-PORT]            one protocol, both directions
  (tcp|udp):(sport|dport):port:PORT[-PORT]

  Examples:
    -f \"tcp:80-443\"
    -f \"icmp dport:port:53\"
    -f \"udp:sport:port:5000-5100 8080\"";

#[derive(Parser)]
#[clap(
    name = "ringsniff",
    version,
    about = "Capture live traffic from a network interface into a pcap file\n\nPackets are read zero-copy from a kernel-shared AF_PACKET ring and either streamed to disk or accumulated in memory and written once on shutdown (Ctrl-C / SIGTERM).",
    after_help = FILTER_HELP
)]
pub struct Cli {
    /// Ring buffer size; plain bytes, or with an M (MiB) / G (GiB) suffix
    #[clap(short = 's', long = "ring-size", value_name = "SIZE",
           default_value = "256M", value_parser = parse_ring_size)]
    pub ring_size: usize,

    /// Preallocate SIZE bytes in memory and write the capture file only on
    /// shutdown; 0 streams packets to disk as they arrive
    #[clap(short = 'm', long = "max-filesize", value_name = "SIZE",
           default_value = "0", value_parser = parse_filesize)]
    pub max_pcap_filesize: usize,

    /// Filter expression (see below)
    #[clap(short = 'f', long = "filter", value_name = "SPEC")]
    pub filter: Option<String>,

    /// Write a JSON capture summary here on exit ("-" for stdout)
    #[clap(long, value_name = "PATH")]
    pub stats_json: Option<PathBuf>,

    /// Network interface to capture from
    pub interface: String,

    /// Output capture file
    pub output: PathBuf,
}

fn parse_ring_size(s: &str) -> Result<usize, String> {
    let size = parse_size(s)?;
    if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) {
        return Err(format!(
            "ring size must be between {} MiB and {} GiB",
            MIN_RING_SIZE / (1024 * 1024),
            MAX_RING_SIZE / (1024 * 1024 * 1024),
        ));
    }
    Ok(size)
}

fn parse_filesize(s: &str) -> Result<usize, String> {
    parse_size(s)
}

/// Decimal digits with one optional trailing unit character: M = MiB,
/// G = GiB. Anything else, including overflow, is rejected.
fn parse_size(s: &str) -> Result<usize, String> {
    let err = || format!("invalid size `{s}`");

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        None => (s, 1usize),
        Some(pos) if pos == s.len() - 1 => {
            let unit = match &s[pos..] {
                "M" => 1024 * 1024,
                "G" => 1024 * 1024 * 1024,
                _ => return Err(err()),
            };
            (&s[..pos], unit)
        }
        Some(_) => return Err(err()),
    };

    if digits.is_empty() {
        return Err(err());
    }

    let n: usize = digits.parse().map_err(|_| err())?;
    n.checked_mul(unit).ok_or_else(err)
}
