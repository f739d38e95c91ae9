//! GELF notifiers
//!
//! The delivery worker hands each record to one of these. [`UdpNotifier`]
//! sends zlib-compressed GELF datagrams, chunked when the payload is larger
//! than the configured chunk size. [`HttpNotifier`] posts the JSON payload
//! to a GELF HTTP input. Both are used only from the worker thread.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::config::{ChunkSize, Config, Transport};
use crate::delivery::{Notifier, NotifierFactory};
use crate::error::ReportError;
use crate::record::DiagnosticRecord;
use crate::utils::generate_message_id;

/// Magic bytes opening every GELF chunk
const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];

/// GELF limit on chunks per message
const MAX_CHUNKS: usize = 128;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifier matching the configured transport, built on the worker thread
pub fn notifier_for(config: &Config) -> NotifierFactory {
    let config = config.clone();
    Box::new(move || {
        let notifier: Box<dyn Notifier> = match config.transport {
            Transport::Udp => Box::new(UdpNotifier::new(&config)),
            Transport::Http => Box::new(HttpNotifier::new(&config)),
        };
        Ok(notifier)
    })
}

/// GELF over UDP
#[derive(Debug)]
pub struct UdpNotifier {
    hostname: String,
    port: u16,
    chunk_size: ChunkSize,
    socket: Option<(UdpSocket, SocketAddr)>,
}

impl UdpNotifier {
    pub fn new(config: &Config) -> Self {
        Self {
            hostname: config.hostname.clone(),
            port: config.port,
            chunk_size: config.max_chunk_size,
            socket: None,
        }
    }

    /// Socket bound for the backend's address family, created on first use
    fn socket(&mut self) -> Result<&(UdpSocket, SocketAddr), ReportError> {
        if self.socket.is_none() {
            let target = (self.hostname.as_str(), self.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    ReportError::delivery(format!("could not resolve {}:{}", self.hostname, self.port), None)
                })?;
            let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            self.socket = Some((UdpSocket::bind(local)?, target));
        }
        self.socket
            .as_ref()
            .ok_or_else(|| ReportError::delivery("socket unavailable", None))
    }
}

impl Notifier for UdpNotifier {
    fn notify(&mut self, record: &DiagnosticRecord) -> Result<(), ReportError> {
        let payload = encode(record)?;
        let datagrams = datagrams(&payload, self.chunk_size)?;

        let sent = {
            let (socket, target) = self.socket()?;
            datagrams
                .iter()
                .try_for_each(|datagram| socket.send_to(datagram, target).map(|_| ()))
        };
        if let Err(e) = sent {
            // rebind on the next record
            self.socket = None;
            return Err(e.into());
        }

        tracing::trace!(chunks = datagrams.len(), bytes = payload.len(), "GELF record sent");
        Ok(())
    }
}

/// GELF over HTTP (`POST http://host:port/gelf`)
#[derive(Debug)]
pub struct HttpNotifier {
    endpoint: String,
    client: Option<reqwest::blocking::Client>,
}

impl HttpNotifier {
    pub fn new(config: &Config) -> Self {
        Self::with_endpoint(format!("http://{}:{}/gelf", config.hostname, config.port))
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: None,
        }
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client, ReportError> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| ReportError::delivery("HTTP client unavailable", None))
    }
}

impl Notifier for HttpNotifier {
    fn notify(&mut self, record: &DiagnosticRecord) -> Result<(), ReportError> {
        let payload = record.to_gelf();
        let endpoint = self.endpoint.clone();

        let response = self.client()?.post(&endpoint).json(&payload).send()?;
        if !response.status().is_success() {
            return Err(ReportError::SendFailed(response.status()));
        }

        tracing::trace!(endpoint = %endpoint, "GELF record posted");
        Ok(())
    }
}

/// zlib-compressed GELF JSON
pub fn encode(record: &DiagnosticRecord) -> Result<Vec<u8>, ReportError> {
    let json = serde_json::to_vec(&record.to_gelf())?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Split a payload into GELF datagrams
///
/// A payload that fits in one datagram is sent as is. Larger payloads are
/// cut into chunks of `magic(2) | message id(8) | sequence(1) | count(1) | data`.
pub fn datagrams(payload: &[u8], chunk_size: ChunkSize) -> Result<Vec<Vec<u8>>, ReportError> {
    if payload.len() <= chunk_size.bytes() {
        return Ok(vec![payload.to_vec()]);
    }

    let pieces: Vec<&[u8]> = payload.chunks(chunk_size.payload_len().max(1)).collect();
    if pieces.len() > MAX_CHUNKS {
        return Err(ReportError::delivery(
            format!(
                "record needs {} chunks, GELF allows at most {MAX_CHUNKS}",
                pieces.len()
            ),
            None,
        ));
    }

    let id = generate_message_id();
    let count = pieces.len() as u8;
    Ok(pieces
        .iter()
        .enumerate()
        .map(|(seq, piece)| {
            let mut datagram = Vec::with_capacity(ChunkSize::HEADER_LEN + piece.len());
            datagram.extend_from_slice(&CHUNK_MAGIC);
            datagram.extend_from_slice(&id);
            datagram.push(seq as u8);
            datagram.push(count);
            datagram.extend_from_slice(piece);
            datagram
        })
        .collect())
}
