use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not decode packet {id}: {reason}")]
    Decode { id: u64, reason: String },
    #[error("banner terms: {0}")]
    BannerTerms(#[from] aho_corasick::BuildError),
    #[error("invalid config: {0}")]
    Config(String),
}

/// Reasons a decoded packet is refused at the engine's input boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("source and destination address families differ")]
    MixedFamilies,
    #[error("payload length {payload} exceeds packet length {packet}")]
    PayloadTooLong { payload: u32, packet: u32 },
    #[error("tcp fields set on protocol {0}")]
    TcpFieldsOnNonTcp(u8),
    #[error("payload head of {head} bytes exceeds payload length {payload}")]
    PayloadHead { head: usize, payload: u32 },
}
