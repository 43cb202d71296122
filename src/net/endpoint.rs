use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tracing::debug;

use super::{ip_addr_to_socket_addr, SERVER_NAME};
use crate::error::Result;

/// Creates a QUIC endpoint that accepts connections on `addr` and can also
/// dial out to other servers, like a broker talking to its workers.
pub fn server(addr: SocketAddr, keep_alive: Duration) -> Result<quinn::Endpoint> {
    let (cert, key) = self_signed()?;
    let transport_config = transport_config(keep_alive);

    let mut server_config = quinn::ServerConfig::with_single_cert(vec![cert], key)?;
    server_config.transport_config(transport_config.clone());

    let mut endpoint = quinn::Endpoint::server(server_config, addr)?;
    endpoint.set_default_client_config(client_config(transport_config));
    debug!(addr = %endpoint.local_addr()?, "listening");
    Ok(endpoint)
}

/// Creates a dial-only QUIC endpoint able to reach `remote`.
pub fn client(remote: SocketAddr, keep_alive: Duration) -> Result<quinn::Endpoint> {
    let unspecified = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let mut endpoint = quinn::Endpoint::client(ip_addr_to_socket_addr(unspecified, 0))?;
    endpoint.set_default_client_config(client_config(transport_config(keep_alive)));
    Ok(endpoint)
}

/// Shared transport configuration for the server and client sides. Keep-alives
/// stop idle broker to worker links from timing out between runs.
fn transport_config(keep_alive: Duration) -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    transport_config.keep_alive_interval(Some(keep_alive));
    Arc::new(transport_config)
}

fn client_config(transport_config: Arc<quinn::TransportConfig>) -> quinn::ClientConfig {
    let tls = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(TrustByAddress))
        .with_no_client_auth();
    let mut client_config = quinn::ClientConfig::new(Arc::new(tls));
    client_config.transport_config(transport_config);
    client_config
}

/// Generates a throwaway certificate for this process.
fn self_signed() -> Result<(Certificate, PrivateKey)> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
    let key = PrivateKey(cert.serialize_private_key_der());
    Ok((Certificate(cert.serialize_der()?), key))
}

/// Workers and brokers are addressed by a fixed list handed out at startup,
/// so the peer's certificate carries no extra information and is accepted
/// as-is. The TLS layer still encrypts the link.
struct TrustByAddress;

impl ServerCertVerifier for TrustByAddress {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
