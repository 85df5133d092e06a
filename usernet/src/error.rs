use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsernetError {
    #[error("dhcp range exhausted in subnet {0}")]
    LeaseExhausted(Ipv4Addr),

    #[error("invalid mac address {0:?}")]
    InvalidMac(String),

    #[error("no lease for mac {mac} after {elapsed_secs}s")]
    ResolveTimeout { mac: String, elapsed_secs: u64 },

    #[error("{addr} not reachable after {elapsed_secs}s")]
    SshReadyTimeout { addr: String, elapsed_secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
