pub mod buffer;
pub mod error;
pub mod filter;
pub mod memfile;
pub mod pcap;
pub mod ring;
pub mod sniffer;

pub use buffer::PacketBuffer;
pub use error::CaptureError;
pub use filter::Filter;
pub use memfile::IncrementalFile;
pub use pcap::PcapFile;
pub use ring::{RingLayout, RingVersion, DEFAULT_RING_SIZE, MAX_RING_SIZE, MIN_RING_SIZE};
pub use sniffer::{CaptureConfig, CaptureStats, Sniffer};
