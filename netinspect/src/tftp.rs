//! Read-only TFTP client (RFC 1350, octet mode).
//!
//! The client sends one read request to the server's well-known port, then
//! talks to whatever port the first reply came from (the server's transfer
//! ID). Blocks must arrive strictly in order; there is no reordering and no
//! retransmission, so any timeout, error packet or out-of-sequence block
//! fails the transfer. Callers that want another try go through the
//! fallback chain.
//!
//! ```text
//! RRQ   | 01 | filename | 0 | "octet" | 0 |
//! DATA  | 03 | block    | payload (0..=512) |
//! ACK   | 04 | block    |
//! ERROR | 05 | code     | message | 0 |
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use memchr::memchr;
use tokio::net::UdpSocket;

use crate::error::ProtocolError;

/// Well-known server port.
pub const DEFAULT_PORT: u16 = 69;

/// Default wait for each packet.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload size of every block but the last.
pub const BLOCK_SIZE: usize = 512;

const MODE: &[u8] = b"octet";

/// Packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

/// Error codes sent by the client.
const ERR_ILLEGAL_OPERATION: u16 = 4;
const ERR_UNKNOWN_TID: u16 = 5;

/// A packet the client can receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Data { block: u16, payload: &'a [u8] },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl<'a> Packet<'a> {
    /// Decode a received datagram.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < 4 {
            return Err(ProtocolError::Malformed(format!(
                "{} byte packet",
                datagram.len()
            )));
        }

        let mut header = &datagram[..4];
        let opcode = header.get_u16();
        let field = header.get_u16();
        let body = &datagram[4..];

        match opcode {
            op if op == Opcode::Data as u16 => {
                if body.len() > BLOCK_SIZE {
                    return Err(ProtocolError::Malformed(format!(
                        "{} byte payload in block {}",
                        body.len(),
                        field
                    )));
                }
                Ok(Self::Data {
                    block: field,
                    payload: body,
                })
            }
            op if op == Opcode::Ack as u16 => Ok(Self::Ack { block: field }),
            op if op == Opcode::Error as u16 => {
                let end = memchr(0, body).unwrap_or(body.len());
                Ok(Self::Error {
                    code: field,
                    message: String::from_utf8_lossy(&body[..end]).into_owned(),
                })
            }
            op => Err(ProtocolError::UnexpectedOpcode(op)),
        }
    }
}

/// Encode a read request for `filename` in octet mode.
pub fn encode_read_request(filename: &str) -> Result<Bytes, ProtocolError> {
    if filename.is_empty() || filename.contains('\0') {
        return Err(ProtocolError::InvalidFilename(filename.to_string()));
    }

    let mut buf = BytesMut::with_capacity(2 + filename.len() + 1 + MODE.len() + 1);
    buf.put_u16(Opcode::ReadRequest as u16);
    buf.put_slice(filename.as_bytes());
    buf.put_u8(0);
    buf.put_slice(MODE);
    buf.put_u8(0);
    Ok(buf.freeze())
}

pub fn encode_ack(block: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(Opcode::Ack as u16);
    buf.put_u16(block);
    buf.freeze()
}

pub fn encode_error(code: u16, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + message.len() + 1);
    buf.put_u16(Opcode::Error as u16);
    buf.put_u16(code);
    buf.put_slice(message.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// A completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// File content, the concatenation of every block payload.
    pub data: Vec<u8>,
    /// Number of blocks received and acknowledged.
    pub blocks: usize,
}

/// TFTP client bound to one server.
#[derive(Debug, Clone)]
pub struct TftpClient {
    server: SocketAddr,
    timeout: Duration,
}

impl TftpClient {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Resolve `host` and target its `port`.
    pub async fn resolve(host: &str, port: u16) -> Result<Self, ProtocolError> {
        let server = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {host}"),
                ))
            })?;
        Ok(Self::new(server))
    }

    /// Set the wait for each packet.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Fetch `filename` into memory.
    pub async fn fetch(&self, filename: &str) -> Result<Transfer, ProtocolError> {
        let request = encode_read_request(filename)?;
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(&request, self.server).await?;
        debug!("TFTP read request for '{}' sent to {}", filename, self.server);

        let mut peer: Option<SocketAddr> = None;
        let mut expected: u16 = 1;
        let mut data = Vec::new();
        let mut blocks = 0usize;
        let mut buf = [0u8; 1024];

        loop {
            let (len, from) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
                .await
                .map_err(|_| ProtocolError::Timeout(self.timeout))??;

            match peer {
                None => peer = Some(from),
                Some(tid) if tid != from => {
                    warn!("TFTP packet from unknown transfer ID {} ignored", from);
                    let _ = socket
                        .send_to(&encode_error(ERR_UNKNOWN_TID, "Unknown transfer ID"), from)
                        .await;
                    continue;
                }
                Some(_) => {}
            }

            match Packet::parse(&buf[..len])? {
                Packet::Data { block, payload } => {
                    if block != expected {
                        let message = format!("expected block {expected}, got {block}");
                        let _ = socket
                            .send_to(&encode_error(ERR_ILLEGAL_OPERATION, &message), from)
                            .await;
                        return Err(ProtocolError::BlockMismatch {
                            expected,
                            received: block,
                        });
                    }

                    data.extend_from_slice(payload);
                    socket.send_to(&encode_ack(block), from).await?;
                    blocks += 1;
                    trace!("TFTP block {} ({} bytes) acknowledged", block, payload.len());

                    if payload.len() < BLOCK_SIZE {
                        break;
                    }
                    expected = expected.wrapping_add(1);
                }
                Packet::Error { code, message } => {
                    return Err(ProtocolError::Remote { code, message });
                }
                Packet::Ack { .. } => {
                    return Err(ProtocolError::UnexpectedOpcode(Opcode::Ack as u16));
                }
            }
        }

        debug!(
            "TFTP transfer of '{}' from {} complete: {} bytes in {} blocks",
            filename,
            self.server,
            data.len(),
            blocks
        );
        Ok(Transfer { data, blocks })
    }

    /// Fetch `filename` and write it to `local`. Nothing is written unless
    /// the whole transfer succeeds.
    pub async fn download(&self, filename: &str, local: &Path) -> Result<Transfer, ProtocolError> {
        let transfer = self.fetch(filename).await?;
        tokio::fs::write(local, &transfer.data).await?;
        Ok(transfer)
    }
}
