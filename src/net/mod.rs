use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub mod endpoint;
pub mod link;
pub mod wire;

/// Converts an IP address and port to a socket address.
pub fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

/// A loopback socket address on `port`.
pub fn loopback(port: u16) -> SocketAddr {
    ip_addr_to_socket_addr(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

pub const BROKER_PORT: u16 = 8030;
/// Workers listen on consecutive ports starting here.
pub const FIRST_WORKER_PORT: u16 = 8031;
pub const DEFAULT_WORKER_COUNT: u16 = 4;

/// Name presented during the TLS handshake. Servers generate their own
/// certificate for it and clients do not verify it; peers are trusted by
/// address.
const SERVER_NAME: &str = "localhost";

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;
