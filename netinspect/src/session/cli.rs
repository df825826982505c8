//! Prompt-driven CLI session over any byte stream.
//!
//! [`CliSession`] knows nothing about SSH or Telnet. It writes command lines
//! to a [`CliIo`], accumulates what comes back in a [`PatternBuffer`] and
//! decides a command is finished when the vendor prompt shows up at the end
//! of the buffer.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use regex::bytes::Regex;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use super::DeviceSession;
use super::buffer::PatternBuffer;
use super::profile::VendorProfile;
use crate::error::{CommandError, TransportError};

/// Byte stream underneath a CLI session.
pub trait CliIo: Send {
    /// Next chunk of output, or `None` once the peer closed the stream.
    fn read_chunk(
        &mut self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    fn write_all(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Credentials typed at the CLI, for transports without their own auth.
pub(crate) struct InBandLogin<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// An interactive CLI session.
pub struct CliSession<I> {
    io: I,
    profile: VendorProfile,
    buffer: PatternBuffer,
    timeout: Duration,
    username_prompt: Regex,
    password_prompt: Regex,
    closed: bool,
    /// A command timed out and its output may still be arriving.
    out_of_sync: bool,
}

impl<I: CliIo> CliSession<I> {
    /// Wrap a stream. Nothing is read until [`open`](Self::open).
    pub fn new(io: I, profile: VendorProfile, timeout: Duration) -> Self {
        Self {
            io,
            profile,
            buffer: PatternBuffer::default(),
            timeout,
            username_prompt: login_pattern(r"(?i)(?:user ?name|login)\s*:\s*\z"),
            password_prompt: login_pattern(r"(?i)password\s*:\s*\z"),
            closed: false,
            out_of_sync: false,
        }
    }

    pub fn profile(&self) -> &VendorProfile {
        &self.profile
    }

    /// Wait for the first prompt, log in if needed, elevate if a secret is
    /// given, then run the profile's on-open commands.
    pub(crate) async fn open(
        mut self,
        login: Option<InBandLogin<'_>>,
        secret: Option<&SecretString>,
    ) -> Result<Self, CommandError> {
        let banner = match login {
            Some(login) => self.login(login).await?,
            None => {
                let prompt = self.profile.prompt.clone();
                self.read_until_any(&[&prompt]).await?.1
            }
        };

        if let Some(secret) = secret {
            if let Err(e) = self.elevate(&banner, secret).await {
                warn!("{}: {}, continuing unprivileged", self.profile.name, e);
            }
        }

        for command in self.profile.on_open_commands.clone() {
            if let Err(e) = self.send_command(&command).await {
                warn!("{}: on-open command '{}' failed: {}", self.profile.name, command, e);
            }
        }

        Ok(self)
    }

    async fn login(&mut self, login: InBandLogin<'_>) -> Result<Vec<u8>, CommandError> {
        let prompt = self.profile.prompt.clone();
        let username = self.username_prompt.clone();
        let password = self.password_prompt.clone();
        let mut sent_username = false;
        let mut sent_password = false;

        loop {
            let (index, data) = match self.read_until_any(&[&prompt, &username, &password]).await {
                Ok(found) => found,
                Err(CommandError::Closed) if sent_password => {
                    return Err(CommandError::LoginRejected {
                        message: "connection closed after password".to_string(),
                    });
                }
                Err(e) => return Err(e),
            };

            match index {
                0 => return Ok(data),
                1 if !sent_username => {
                    self.write_line(login.username).await?;
                    sent_username = true;
                }
                2 if !sent_password => {
                    self.write_line(login.password).await?;
                    sent_password = true;
                }
                _ => {
                    return Err(CommandError::LoginRejected {
                        message: last_line(&data),
                    });
                }
            }
        }
    }

    async fn elevate(&mut self, current: &[u8], secret: &SecretString) -> Result<(), CommandError> {
        let Some(elevation) = self.profile.elevation.clone() else {
            return Ok(());
        };
        if elevation.elevated_prompt.is_match(current) {
            return Ok(());
        }

        debug!("{}: elevating with '{}'", self.profile.name, elevation.command);
        let prompt = self.profile.prompt.clone();
        self.write_line(&elevation.command).await?;

        let (index, _) = self
            .read_until_any(&[&elevation.password_prompt, &elevation.elevated_prompt, &prompt])
            .await?;
        match index {
            0 => {}
            1 => return Ok(()),
            _ => {
                return Err(CommandError::Elevation {
                    message: "no password prompt".to_string(),
                });
            }
        }

        self.write_line(secret.expose_secret()).await?;
        let (index, _) = self
            .read_until_any(&[&elevation.elevated_prompt, &elevation.password_prompt, &prompt])
            .await?;
        match index {
            0 => Ok(()),
            1 => Err(CommandError::Elevation {
                message: "secret rejected".to_string(),
            }),
            _ => Err(CommandError::Elevation {
                message: "still unprivileged".to_string(),
            }),
        }
    }

    /// Send one command and return its normalized output.
    ///
    /// After a prompt timeout the previous command may still be printing, so
    /// the next command only accepts output that follows its own echo.
    pub async fn send_command(&mut self, command: &str) -> Result<String, CommandError> {
        if self.closed {
            return Err(CommandError::Closed);
        }

        self.buffer.clear();
        trace!("{}: sending {:?}", self.profile.name, command);
        self.write_line(command).await?;

        let read = if self.out_of_sync {
            self.read_after_echo(command).await
        } else {
            let prompt = self.profile.prompt.clone();
            self.read_until_any(&[&prompt])
                .await
                .map(|(_, raw)| String::from_utf8_lossy(&raw).into_owned())
        };
        let raw = match read {
            Ok(raw) => raw,
            Err(e @ CommandError::PromptTimeout(_)) => {
                self.out_of_sync = true;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let output = normalize_output(&raw, command);

        if let Some(pattern) = self.profile.detect_failure(&output) {
            return Err(CommandError::Rejected {
                pattern: pattern.to_string(),
                output,
            });
        }
        Ok(output)
    }

    /// Discard prompt-terminated output until the echo of `command` shows up.
    async fn read_after_echo(&mut self, command: &str) -> Result<String, CommandError> {
        let deadline = Instant::now() + self.timeout;
        let prompt = self.profile.prompt.clone();

        loop {
            let (_, raw) = self.read_until_deadline(&[&prompt], deadline).await?;
            let text = String::from_utf8_lossy(&raw);
            if let Some(start) = echo_start(&text, command, &prompt) {
                debug!("{}: back in sync at {:?}", self.profile.name, command);
                self.out_of_sync = false;
                return Ok(text[start..].to_string());
            }
            debug!(
                "{}: discarding {} bytes of late output",
                self.profile.name,
                raw.len()
            );
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), CommandError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.io.write_all(&data).await?;
        Ok(())
    }

    /// Read until one of `patterns` matches the buffer tail, answering pager
    /// banners on the way. Returns the index of the matching pattern and the
    /// buffered output.
    async fn read_until_any(
        &mut self,
        patterns: &[&Regex],
    ) -> Result<(usize, Vec<u8>), CommandError> {
        let deadline = Instant::now() + self.timeout;
        self.read_until_deadline(patterns, deadline).await
    }

    async fn read_until_deadline(
        &mut self,
        patterns: &[&Regex],
        deadline: Instant,
    ) -> Result<(usize, Vec<u8>), CommandError> {
        loop {
            if let Some(pager) = &self.profile.pager {
                if self.buffer.remove_from_tail(pager) {
                    trace!("{}: answering pager", self.profile.name);
                    self.io.write_all(b" ").await?;
                    continue;
                }
            }

            if let Some(index) = patterns.iter().position(|p| self.buffer.tail_contains(p)) {
                return Ok((index, self.buffer.take()));
            }

            let chunk = tokio::time::timeout_at(deadline, self.io.read_chunk())
                .await
                .map_err(|_| CommandError::PromptTimeout(self.timeout))??;

            match chunk {
                Some(data) => self.buffer.extend(&data),
                None => {
                    self.closed = true;
                    return Err(CommandError::Closed);
                }
            }
        }
    }
}

#[async_trait]
impl<I: CliIo> DeviceSession for CliSession<I> {
    async fn run(&mut self, command: &str) -> Result<String, CommandError> {
        self.send_command(command).await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.close().await
    }
}

/// Strip the command echo and the trailing prompt line.
fn normalize_output(raw: &str, command: &str) -> String {
    let body = match raw.rfind('\n') {
        Some(pos) => &raw[..pos],
        None => "",
    };

    let command = command.trim();
    let body = match body.split_once('\n') {
        Some((first, rest)) if first.trim_end().ends_with(command) => rest,
        None if body.trim_end().ends_with(command) => "",
        _ => body,
    };

    body.trim_end_matches('\n').to_string()
}

/// Byte offset of the last line echoing `command`, either bare or after a
/// prompt.
fn echo_start(text: &str, command: &str, prompt: &Regex) -> Option<usize> {
    let command = command.trim();
    let mut offset = 0;
    let mut found = None;
    for line in text.split_inclusive('\n') {
        if let Some(before) = line.trim_end().strip_suffix(command) {
            let before = before.trim();
            if before.is_empty() || prompt.is_match(before.as_bytes()) {
                found = Some(offset);
            }
        }
        offset += line.len();
    }
    found
}

fn last_line(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.ends_with(':'))
        .unwrap_or("login refused")
        .to_string()
}

fn login_pattern(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => panic!("invalid built-in pattern {pattern:?}: {e}"),
    }
}
