//! SCP retrieval over a dedicated SSH connection.
//!
//! The remote side runs `scp -f <file>` (source mode) and we act as the
//! sink: one NUL to start, one after the `C` header, one after the trailing
//! status byte.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use russh::ChannelMsg;
use secrecy::{ExposeSecret, SecretString};

use super::{ArtifactTransport, RetrievalTask, TransportKind};
use crate::error::{RetrievalError, TransportError};
use crate::session::{DeviceSession, HostKeyVerification, SshConfig, SshTransport};

const ACK: u8 = 0;
const WARNING: u8 = 1;
const FATAL: u8 = 2;

/// Fetches files with `scp -f` on a fresh SSH connection.
#[derive(Debug, Clone)]
pub struct ScpTransport {
    port: u16,
    connect_timeout: Duration,
    transfer_timeout: Duration,
    host_key_verification: HostKeyVerification,
}

impl ScpTransport {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            transfer_timeout: Duration::from_secs(300),
            host_key_verification: HostKeyVerification::default(),
        }
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }

    async fn receive(transport: &SshTransport, filename: &str) -> Result<Vec<u8>, RetrievalError> {
        let command = format!("scp -f {}", shell_quote(filename));
        let mut channel = transport.open_exec(&command).await?;
        channel
            .data(&[ACK][..])
            .await
            .map_err(TransportError::from)?;

        let mut sink = ScpSink::new();
        let mut stderr = Vec::new();
        while !sink.is_done() {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    let acks = sink.feed(&data)?;
                    for _ in 0..acks {
                        channel
                            .data(&[ACK][..])
                            .await
                            .map_err(TransportError::from)?;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        let _ = channel.eof().await;

        if !sink.is_done() && !stderr.is_empty() {
            return Err(RetrievalError::Remote {
                message: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        sink.finish()
    }
}

#[async_trait]
impl ArtifactTransport for ScpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Scp
    }

    async fn fetch(
        &self,
        task: &RetrievalTask<'_>,
        _session: &mut dyn DeviceSession,
    ) -> Result<Vec<u8>, RetrievalError> {
        let config = SshConfig {
            host: task.address.to_string(),
            port: self.port,
            username: task.username.to_string(),
            password: SecretString::from(task.password.expose_secret().to_owned()),
            timeout: self.connect_timeout,
            host_key_verification: self.host_key_verification,
            known_hosts_path: None,
        };
        let transport = SshTransport::connect(config).await?;
        debug!("{}: SCP connection open for {}", task.address, task.filename);

        let result = tokio::time::timeout(
            self.transfer_timeout,
            Self::receive(&transport, task.filename),
        )
        .await;
        let _ = transport.close().await;

        result.map_err(|_| RetrievalError::Timeout(self.transfer_timeout))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Header,
    Body { remaining: u64 },
    Trailer,
    Done,
}

/// Receiving side of the SCP source protocol for a single file.
///
/// Feed it the bytes the remote `scp -f` writes; it reports how many NUL
/// acknowledgements to send back.
#[derive(Debug)]
pub struct ScpSink {
    state: SinkState,
    line: Vec<u8>,
    content: Vec<u8>,
}

impl Default for ScpSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ScpSink {
    pub fn new() -> Self {
        Self {
            state: SinkState::Header,
            line: Vec::new(),
            content: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == SinkState::Done
    }

    /// Consume one chunk and return the number of acknowledgements owed.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<usize, RetrievalError> {
        let mut acks = 0;
        while !data.is_empty() {
            match self.state {
                SinkState::Header => {
                    let Some(pos) = data.iter().position(|&b| b == b'\n') else {
                        self.line.extend_from_slice(data);
                        break;
                    };
                    self.line.extend_from_slice(&data[..pos]);
                    data = &data[pos + 1..];
                    let line = std::mem::take(&mut self.line);
                    if let Some(next) = self.header(&line)? {
                        acks += 1;
                        self.state = next;
                    }
                }
                SinkState::Body { remaining } => {
                    let take = remaining.min(data.len() as u64) as usize;
                    self.content.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.state = SinkState::Trailer;
                    } else {
                        self.state = SinkState::Body { remaining };
                    }
                }
                SinkState::Trailer => match data[0] {
                    ACK => {
                        acks += 1;
                        self.state = SinkState::Done;
                        data = &data[1..];
                    }
                    _ => {
                        return Err(RetrievalError::Remote {
                            message: status_message(&data[1..]),
                        });
                    }
                },
                SinkState::Done => break,
            }
        }
        Ok(acks)
    }

    /// Interpret one control line. `Ok(None)` means nothing to acknowledge.
    fn header(&mut self, line: &[u8]) -> Result<Option<SinkState>, RetrievalError> {
        let Some((&kind, rest)) = line.split_first() else {
            return Err(RetrievalError::Unexpected {
                message: "empty control line".to_string(),
            });
        };
        match kind {
            WARNING | FATAL => Err(RetrievalError::Remote {
                message: status_message(rest),
            }),
            // Timestamps precede the file header when the source preserves times
            b'T' => Ok(Some(SinkState::Header)),
            b'C' => {
                let size = parse_file_header(rest)?;
                self.content.reserve(size.min(64 * 1024 * 1024) as usize);
                if size == 0 {
                    Ok(Some(SinkState::Trailer))
                } else {
                    Ok(Some(SinkState::Body { remaining: size }))
                }
            }
            b'D' | b'E' => Err(RetrievalError::Unexpected {
                message: "remote path is a directory".to_string(),
            }),
            _ => Err(RetrievalError::Unexpected {
                message: format!("unknown control line '{}'", String::from_utf8_lossy(line)),
            }),
        }
    }

    /// The received file, if the transfer completed.
    pub fn finish(self) -> Result<Vec<u8>, RetrievalError> {
        match self.state {
            SinkState::Done => Ok(self.content),
            SinkState::Header => Err(RetrievalError::Unexpected {
                message: "connection closed before file header".to_string(),
            }),
            SinkState::Body { remaining } => Err(RetrievalError::Unexpected {
                message: format!("connection closed with {remaining} bytes outstanding"),
            }),
            SinkState::Trailer => Err(RetrievalError::Unexpected {
                message: "connection closed before end-of-file status".to_string(),
            }),
        }
    }
}

/// Parse `<mode> <size> <name>` after the `C`.
fn parse_file_header(rest: &[u8]) -> Result<u64, RetrievalError> {
    let text = String::from_utf8_lossy(rest);
    let mut fields = text.splitn(3, ' ');
    let mode = fields.next().unwrap_or_default();
    let size = fields.next().unwrap_or_default();
    let name = fields.next().unwrap_or_default();

    if mode.len() != 4 || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) || name.is_empty() {
        return Err(RetrievalError::Unexpected {
            message: format!("malformed file header 'C{text}'"),
        });
    }
    size.parse().map_err(|_| RetrievalError::Unexpected {
        message: format!("invalid file size '{size}'"),
    })
}

fn status_message(rest: &[u8]) -> String {
    let text = String::from_utf8_lossy(rest);
    let text = text.trim_end_matches(['\n', '\0']).trim();
    if text.is_empty() {
        "scp reported an error".to_string()
    } else {
        text.to_string()
    }
}

/// Single-quote for the remote shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
