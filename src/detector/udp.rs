//! UDP detector transport
//!
//! Each audio frame is wrapped in a small self-contained WAV chunk (16-bit
//! mono PCM) and sent as one datagram to the recognizer. This is the format a
//! Rhasspy UDP audio input expects. Datagrams are fire-and-forget: nothing is
//! acknowledged and send failures are left to the frame loop to count.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hound::{WavSpec, WavWriter};
use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::registry::parse_endpoint;
use super::{DetectorBackend, DetectorConfig, DetectorTransport, TransportError};
use crate::audio::AudioFrame;

/// Canonical kind name of the UDP backend
pub const UDP_KIND: &str = "UDP";

/// Timeout for resolving the remote endpoint (host names go through DNS)
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP payload over IPv4
const MAX_DATAGRAM: usize = 65_507;

/// RIFF header hound writes for 16-bit mono PCM
const WAV_HEADER_LEN: usize = 44;

/// Most samples a frame may carry and still fit in one datagram
pub const MAX_FRAME_SAMPLES: usize = (MAX_DATAGRAM - WAV_HEADER_LEN) / 2;

/// Backend producing [`UdpTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpBackend;

impl UdpBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DetectorBackend for UdpBackend {
    fn kind(&self) -> &'static str {
        UDP_KIND
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["network"]
    }

    fn parse(&self, args: &Map<String, Value>) -> Result<DetectorConfig, String> {
        let (address, port) = parse_endpoint(args)?;
        Ok(DetectorConfig::Udp { address, port })
    }

    async fn bind(
        &self,
        config: &DetectorConfig,
    ) -> Result<Box<dyn DetectorTransport>, TransportError> {
        match config {
            DetectorConfig::Udp { address, port } => {
                let transport = UdpTransport::bind(address, *port).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

/// Datagram transport to a single remote endpoint
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    target: SocketAddr,
    datagrams_sent: u64,
}

impl UdpTransport {
    /// Resolve `address:port` and bind a local socket of the matching family.
    ///
    /// The remote endpoint is not contacted.
    pub async fn bind(address: &str, port: u16) -> Result<Self, TransportError> {
        let target = resolve(address, port).await?;

        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        log::info!(
            "UdpTransport: bound {:?}, forwarding to {}",
            socket.local_addr().ok(),
            target
        );

        Ok(Self {
            socket: Some(socket),
            target,
            datagrams_sent: 0,
        })
    }
}

async fn resolve(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
    // Literal IPs need no lookup
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host((address, port)))
        .await
        .map_err(|_| TransportError::ResolveFailed(format!("timeout resolving {}", address)))?
        .map_err(|e| TransportError::ResolveFailed(format!("{}: {}", address, e)))?;

    addrs
        .next()
        .ok_or_else(|| TransportError::ResolveFailed(format!("no addresses for {}", address)))
}

#[async_trait]
impl DetectorTransport for UdpTransport {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let chunk = encode_wav_chunk(frame)?;

        socket
            .send_to(&chunk, self.target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.datagrams_sent += 1;
        if self.datagrams_sent % 500 == 0 {
            log::debug!("UdpTransport: sent {} datagrams", self.datagrams_sent);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!(
                "UdpTransport: closed ({} datagrams sent to {})",
                self.datagrams_sent,
                self.target
            );
        }
    }
}

/// Encode a frame as a complete in-memory WAV file
pub fn encode_wav_chunk(frame: &AudioFrame) -> Result<Vec<u8>, TransportError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: frame.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + frame.samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;
        for &sample in &frame.samples {
            writer
                .write_sample(sample)
                .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
