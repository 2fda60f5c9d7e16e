//! NAT-PMP port forwarder (RFC 6886)
//!
//! Mapping request (12 bytes):
//! ```text
//! | version (0) | opcode (1 udp, 2 tcp) | reserved (2) |
//! | internal port (2) | suggested external port (2) | lifetime secs (4) |
//! ```
//! Mapping response (16 bytes):
//! ```text
//! | version | opcode + 128 | result code (2) | epoch secs (4) |
//! | internal port (2) | mapped external port (2) | lifetime secs (4) |
//! ```

use super::{PortForwardRequest, PortForwarder};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// NAT-PMP server port on the gateway
pub const NATPMP_PORT: u16 = 5351;

/// Lifetime requested for every mapping
const MAPPING_LIFETIME: u32 = 60;

/// Mappings are refreshed well before they expire
const REFRESH_INTERVAL: Duration = Duration::from_secs(45);

const INITIAL_RETRY_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_ATTEMPTS: u32 = 4;

const OPCODE_MAP_UDP: u8 = 1;
const OPCODE_MAP_TCP: u8 = 2;

/// Internal port 0 with external port 1 asks the gateway to pick a port
const INTERNAL_PORT: u16 = 0;
const ANY_EXTERNAL_PORT: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappingResponse {
    opcode: u8,
    result: u16,
    epoch: u32,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
}

fn encode_mapping_request(opcode: u8, internal_port: u16, external_port: u16, lifetime: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[1] = opcode;
    buf[4..6].copy_from_slice(&internal_port.to_be_bytes());
    buf[6..8].copy_from_slice(&external_port.to_be_bytes());
    buf[8..12].copy_from_slice(&lifetime.to_be_bytes());
    buf
}

fn decode_mapping_response(buf: &[u8]) -> Result<MappingResponse> {
    if buf.len() < 16 {
        return Err(Error::port_forward(format!(
            "NAT-PMP response too short: {} bytes",
            buf.len()
        )));
    }
    if buf[0] != 0 {
        return Err(Error::port_forward(format!("NAT-PMP version {} not supported", buf[0])));
    }
    if buf[1] < 128 {
        return Err(Error::port_forward(format!("NAT-PMP opcode {} is not a response", buf[1])));
    }

    Ok(MappingResponse {
        opcode: buf[1] - 128,
        result: u16::from_be_bytes([buf[2], buf[3]]),
        epoch: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        internal_port: u16::from_be_bytes([buf[8], buf[9]]),
        external_port: u16::from_be_bytes([buf[10], buf[11]]),
        lifetime: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
    })
}

fn result_message(code: u16) -> &'static str {
    match code {
        1 => "unsupported version",
        2 => "not authorized or refused",
        3 => "network failure",
        4 => "out of resources",
        5 => "unsupported opcode",
        _ => "unknown result code",
    }
}

/// Port forwarder talking NAT-PMP to the tunnel gateway
pub struct NatPmpForwarder {
    gateway: Option<IpAddr>,
    port: u16,
}

impl NatPmpForwarder {
    /// `gateway` overrides the per-request gateway
    pub fn new(gateway: Option<IpAddr>) -> Self {
        NatPmpForwarder {
            gateway,
            port: NATPMP_PORT,
        }
    }

    /// Talk to a non-standard server port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn server(&self, request: &PortForwardRequest) -> Result<SocketAddr> {
        let gateway = self
            .gateway
            .or(request.gateway)
            .ok_or_else(|| Error::port_forward("no NAT-PMP gateway configured"))?;
        Ok(SocketAddr::new(gateway, self.port))
    }

    async fn map(&self, server: SocketAddr, opcode: u8, external_port: u16) -> Result<u16> {
        let bind: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;

        let request = encode_mapping_request(opcode, INTERNAL_PORT, external_port, MAPPING_LIFETIME);
        let mut wait = INITIAL_RETRY_TIMEOUT;
        let mut buf = [0u8; 16];

        for attempt in 1..=MAX_ATTEMPTS {
            socket.send(&request).await?;
            match timeout(wait, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let response = decode_mapping_response(&buf[..n])?;
                    if response.opcode != opcode {
                        return Err(Error::port_forward(format!(
                            "NAT-PMP response opcode {} does not match request {}",
                            response.opcode, opcode
                        )));
                    }
                    if response.result != 0 {
                        return Err(Error::port_forward(format!(
                            "NAT-PMP mapping refused: {}",
                            result_message(response.result)
                        )));
                    }
                    debug!(
                        "NAT-PMP mapping opcode {} -> port {} for {}s (epoch {})",
                        opcode, response.external_port, response.lifetime, response.epoch
                    );
                    return Ok(response.external_port);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!("NAT-PMP attempt {}/{} to {} timed out", attempt, MAX_ATTEMPTS, server);
                    wait *= 2;
                }
            }
        }

        Err(Error::timeout(format!("NAT-PMP gateway {} did not answer", server)))
    }

    /// Map UDP and TCP, both must agree on the external port
    async fn map_both(&self, server: SocketAddr, external_port: u16) -> Result<u16> {
        let udp = self.map(server, OPCODE_MAP_UDP, external_port).await?;
        let tcp = self.map(server, OPCODE_MAP_TCP, udp).await?;
        if udp != tcp {
            return Err(Error::port_forward(format!(
                "NAT-PMP mapped UDP port {} but TCP port {}",
                udp, tcp
            )));
        }
        Ok(udp)
    }
}

#[async_trait]
impl PortForwarder for NatPmpForwarder {
    fn name(&self) -> &str {
        "natpmp"
    }

    async fn port_forward(&self, request: &PortForwardRequest) -> Result<u16> {
        let server = self.server(request)?;
        let port = self.map_both(server, ANY_EXTERNAL_PORT).await?;
        info!("NAT-PMP gateway {} forwarded port {}", server, port);
        Ok(port)
    }

    async fn keep_port_forward(
        &self,
        request: &PortForwardRequest,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<()> {
        let server = self.server(request)?;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            }

            let refreshed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                refreshed = self.map_both(server, port) => refreshed?,
            };
            if refreshed != port {
                return Err(Error::port_forward(format!(
                    "NAT-PMP gateway moved the forwarded port from {} to {}",
                    port, refreshed
                )));
            }
            debug!("NAT-PMP port {} refreshed", port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_mapping_request() {
        let buf = encode_mapping_request(OPCODE_MAP_TCP, 0, 1, 60);
        assert_eq!(buf, [0, 2, 0, 0, 0, 0, 0, 1, 0, 0, 0, 60]);
    }

    #[test]
    fn test_decode_mapping_response() {
        let mut buf = [0u8; 16];
        buf[1] = 129;
        buf[4..8].copy_from_slice(&1234u32.to_be_bytes());
        buf[10..12].copy_from_slice(&51413u16.to_be_bytes());
        buf[12..16].copy_from_slice(&60u32.to_be_bytes());

        let response = decode_mapping_response(&buf).unwrap();
        assert_eq!(response.opcode, OPCODE_MAP_UDP);
        assert_eq!(response.result, 0);
        assert_eq!(response.epoch, 1234);
        assert_eq!(response.external_port, 51413);
        assert_eq!(response.lifetime, 60);

        assert!(decode_mapping_response(&buf[..12]).is_err());
        buf[1] = 1;
        assert!(decode_mapping_response(&buf).is_err());
    }

    /// Answers every mapping request with `port` and `result`
    async fn fake_gateway(port: u16, result: u16) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 12];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                assert_eq!(n, 12);
                let mut reply = [0u8; 16];
                reply[1] = buf[1] + 128;
                reply[2..4].copy_from_slice(&result.to_be_bytes());
                reply[8..10].copy_from_slice(&buf[4..6]);
                reply[10..12].copy_from_slice(&port.to_be_bytes());
                reply[12..16].copy_from_slice(&buf[8..12]);
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        local
    }

    fn request() -> PortForwardRequest {
        PortForwardRequest {
            interface: "tun0".to_string(),
            server_name: "nl-01".to_string(),
            gateway: Some("127.0.0.1".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_port_forward_against_fake_gateway() {
        let server_port = fake_gateway(40123, 0).await;
        let forwarder = NatPmpForwarder::new(None).with_port(server_port);
        assert_eq!(forwarder.port_forward(&request()).await.unwrap(), 40123);
    }

    #[tokio::test]
    async fn test_refused_mapping() {
        let server_port = fake_gateway(0, 2).await;
        let forwarder = NatPmpForwarder::new(None).with_port(server_port);
        let err = forwarder.port_forward(&request()).await.unwrap_err();
        assert!(err.to_string().contains("not authorized"));
    }

    #[tokio::test]
    async fn test_keep_port_forward_cancelled() {
        let forwarder = NatPmpForwarder::new(None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        forwarder.keep_port_forward(&request(), 40123, cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_gateway() {
        let forwarder = NatPmpForwarder::new(None);
        let mut request = request();
        request.gateway = None;
        assert!(matches!(
            forwarder.port_forward(&request).await,
            Err(Error::PortForward(_))
        ));
    }
}
