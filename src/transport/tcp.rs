//! TCP transport: UDP beacon discovery, the VMTP unlock handshake, then a
//! length-prefixed framed session identical to the serial one.
//!
//! A brick on Wi-Fi multicasts a beacon on UDP 3015 roughly once per
//! second:
//!
//! ```text
//! Serial-Number: 0016533f0c1e
//! Port: 5555
//! Name: EV3
//! Protocol: EV3
//! ```
//!
//! Answering the beacon source with a single `0x00` byte makes the brick
//! open its TCP port for a short window.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::TransportError;
use crate::protocol::{FramerConfig, Packet, packet};
use crate::transport::reply::{Inbound, ReplySlot};
use crate::transport::{SendOptions, Transport};

pub const DEFAULT_TCP_PORT: u16 = 5555;
pub const DEFAULT_DISCOVERY_PORT: u16 = 3015;
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

const DISCOVERY_ACK: [u8; 1] = [0x00];
const HANDSHAKE_DELIMITER: &[u8] = b"\r\n\r\n";
const UNKNOWN_SERIAL: &str = "n/a";

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Statically configured brick address. With discovery enabled this
    /// filters beacons; without it this is the connect target.
    pub host: Option<String>,
    pub port: u16,
    pub use_discovery: bool,
    pub discovery_port: u16,
    pub discovery_timeout: Duration,
    /// Brick serial for the unlock request; `n/a` when unknown.
    pub serial_number: Option<String>,
    pub handshake_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_TCP_PORT,
            use_discovery: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            serial_number: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// One parsed discovery beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Beacon {
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub serial: String,
    pub protocol: String,
    pub name: String,
}

/// Parses the `key: value` beacon body. Only a valid `Port:` is required;
/// the other fields fall back to placeholders.
pub fn parse_beacon(body: &[u8]) -> Option<Beacon> {
    let text = String::from_utf8_lossy(body);
    let mut port = None;
    let mut serial = None;
    let mut protocol = None;
    let mut name = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "port" => port = value.parse::<u16>().ok().filter(|p| *p > 0),
            "serial-number" => serial = Some(value.to_string()),
            "protocol" => protocol = Some(value.to_string()),
            "name" => name = Some(value.to_string()),
            _ => {}
        }
    }
    Some(Beacon {
        ip: None,
        port: port?,
        serial: serial.unwrap_or_else(|| UNKNOWN_SERIAL.to_string()),
        protocol: protocol.unwrap_or_else(|| "EV3".to_string()),
        name: name.unwrap_or_default(),
    })
}

fn url_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct TcpSession {
    writer: OwnedWriteHalf,
    inbound: Inbound,
}

pub struct TcpTransport {
    config: TcpConfig,
    session: Option<TcpSession>,
    slot: ReplySlot,
    last_beacon: Option<Beacon>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            session: None,
            slot: ReplySlot::default(),
            last_beacon: None,
        }
    }

    /// The beacon that produced the current session, if discovery ran.
    pub fn last_beacon(&self) -> Option<&Beacon> {
        self.last_beacon.as_ref()
    }

    /// Waits for a beacon from the configured host (or any host when none
    /// is set) and acknowledges it. `Ok(None)` means the wait timed out
    /// but a static host allows continuing without discovery.
    async fn discover(&self) -> Result<Option<Beacon>, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port)).await?;
        let deadline = tokio::time::Instant::now() + self.config.discovery_timeout;
        let mut buf = [0u8; 1024];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let received = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => {
                    return if self.config.host.is_some() {
                        debug!("no beacon within the window, using the static host");
                        Ok(None)
                    } else {
                        Err(TransportError::Discovery(format!(
                            "no EV3 beacon on UDP port {} within {:?}",
                            self.config.discovery_port, self.config.discovery_timeout
                        )))
                    };
                }
            };
            let (len, source) = received;
            let Some(mut beacon) = parse_beacon(&buf[..len]) else {
                debug!("ignoring non-beacon datagram from {source}");
                continue;
            };
            if let Some(host) = &self.config.host
                && source.ip().to_string() != *host
            {
                debug!("ignoring beacon from {} (want {host})", source.ip());
                continue;
            }
            socket.send_to(&DISCOVERY_ACK, source).await?;
            beacon.ip = Some(source.ip());
            info!(
                "EV3 beacon from {}: serial {} port {}",
                source.ip(),
                beacon.serial,
                beacon.port
            );
            return Ok(Some(beacon));
        }
    }

    /// Sends one unlock request and collects the response until the header
    /// delimiter, end of stream, or the handshake window closes. Returns
    /// the bytes that arrived after the delimiter; they are the start of
    /// the framed session.
    async fn try_unlock(
        &self,
        stream: &mut TcpStream,
        request: &str,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        stream.write_all(request.as_bytes()).await?;
        let mut response: Vec<u8> = Vec::new();
        let collected = timeout(self.config.handshake_timeout, async {
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&chunk[..n]);
                if find_subsequence(&response, HANDSHAKE_DELIMITER).is_some() {
                    break;
                }
            }
            Ok::<(), std::io::Error>(())
        })
        .await;
        match collected {
            Ok(result) => result?,
            // Evaluate whatever arrived before the window closed.
            Err(_) => debug!("unlock response window closed"),
        }
        let text = String::from_utf8_lossy(&response).to_ascii_lowercase();
        if !text.contains("accept: ev3") {
            warn!(
                "unlock rejected: {:?}",
                String::from_utf8_lossy(&response).trim()
            );
            return Ok(None);
        }
        let remainder = match find_subsequence(&response, HANDSHAKE_DELIMITER) {
            Some(pos) => response[pos + HANDSHAKE_DELIMITER.len()..].to_vec(),
            None => Vec::new(),
        };
        Ok(Some(remainder))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }

        let beacon = if self.config.use_discovery {
            self.discover().await?
        } else {
            None
        };
        let (host, port, serial, protocol) = match &beacon {
            Some(beacon) => (
                beacon.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                beacon.port,
                beacon.serial.clone(),
                beacon.protocol.clone(),
            ),
            None => {
                let host = self.config.host.clone().ok_or_else(|| {
                    TransportError::InvalidConfig(
                        "TCP transport needs a host when discovery is off".into(),
                    )
                })?;
                (
                    host,
                    self.config.port,
                    self.config
                        .serial_number
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_SERIAL.to_string()),
                    "EV3".to_string(),
                )
            }
        };

        // The brick accepts either header shape depending on firmware; try
        // the canonical CRLF form first, then the compact one.
        let requests = [
            format!(
                "GET /target?sn={} VMTP1.0\r\nProtocol: {}\r\n\r\n",
                url_encode(&serial),
                protocol
            ),
            format!("GET /target?sn={serial} VMTP1.0\nProtocol: {protocol}"),
        ];
        let mut last_note = String::from("no response");
        for request in &requests {
            let mut stream =
                match timeout(self.config.handshake_timeout, TcpStream::connect((host.as_str(), port)))
                    .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => {
                        return Err(TransportError::Timeout);
                    }
                };
            match self.try_unlock(&mut stream, request).await? {
                Some(remainder) => {
                    let (reader, writer) = stream.into_split();
                    let mut inbound = Inbound::spawn(reader);
                    inbound.buffer = remainder;
                    self.session = Some(TcpSession { writer, inbound });
                    self.last_beacon = beacon;
                    info!("EV3 unlocked at {host}:{port}");
                    return Ok(());
                }
                None => last_note = format!("request {:?} not accepted", request.trim_end()),
            }
        }
        Err(TransportError::UnlockHandshakeFailed(last_note))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut session) = self.session.take() {
            let _ = session.writer.shutdown().await;
            debug!("TCP session closed");
        }
        self.slot.finish();
        Ok(())
    }

    async fn send(
        &mut self,
        packet: &Packet,
        opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError> {
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        if !session.inbound.drain() {
            self.session = None;
            self.slot.finish();
            return Err(TransportError::NotOpen);
        }

        self.slot.begin(opts.expected_message_counter)?;
        let slot = &self.slot;
        let result = async {
            let bytes = packet.encode()?;
            session.writer.write_all(&bytes).await?;
            if !packet::expects_reply(packet.packet_type) {
                return Ok(None);
            }
            session
                .inbound
                .recv_matching(&FramerConfig::length_prefixed(), slot, opts)
                .await
                .map(Some)
        }
        .await;
        self.slot.finish();

        if matches!(
            result,
            Err(TransportError::TransportClosed) | Err(TransportError::Io(_))
        ) {
            self.session = None;
        }
        result
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_requires_a_valid_port() {
        let body = b"Serial-Number: 0016533f0c1e\r\nPort: 5555\r\nName: EV3\r\nProtocol: EV3\r\n";
        let beacon = parse_beacon(body).unwrap();
        assert_eq!(beacon.port, 5555);
        assert_eq!(beacon.serial, "0016533f0c1e");
        assert_eq!(beacon.protocol, "EV3");
        assert_eq!(beacon.name, "EV3");

        assert!(parse_beacon(b"Serial-Number: x\r\nPort: 0\r\n").is_none());
        assert!(parse_beacon(b"Serial-Number: x\r\nPort: 70000\r\n").is_none());
        assert!(parse_beacon(b"nothing here").is_none());
    }

    #[test]
    fn beacon_fields_have_placeholders() {
        let beacon = parse_beacon(b"Port: 5555\n").unwrap();
        assert_eq!(beacon.serial, "n/a");
        assert_eq!(beacon.protocol, "EV3");
        assert_eq!(beacon.name, "");
    }

    #[test]
    fn url_encoding_keeps_unreserved_bytes() {
        assert_eq!(url_encode("0016533f0c1e"), "0016533f0c1e");
        assert_eq!(url_encode("n/a"), "n%2Fa");
        assert_eq!(url_encode("a b"), "a%20b");
    }
}
