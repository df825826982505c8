//! SSH transport built on russh.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use secrecy::{ExposeSecret, SecretString};

use super::HostKeyVerification;
use super::cli::CliIo;
use crate::error::TransportError;

/// Everything needed to open one SSH connection.
#[derive(Debug)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Limit for the TCP connect, the handshake and authentication, each.
    pub timeout: Duration,
    pub host_key_verification: HostKeyVerification,
    /// known_hosts file; the user's default when `None`.
    pub known_hosts_path: Option<PathBuf>,
}

/// An authenticated SSH connection.
pub struct SshTransport {
    session: Handle<SshHandler>,
    host: String,
}

impl SshTransport {
    /// Connect to the server and authenticate with a password.
    pub async fn connect(config: SshConfig) -> Result<Self, TransportError> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));
        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification,
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        let mut session = tokio::time::timeout(
            config.timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(|e| {
            // Prefer the detailed host key error over russh's generic one
            let stored = host_key_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match (stored, e) {
                (Some(hk_err), _) => hk_err,
                (None, russh::Error::IO(source)) => TransportError::ConnectionFailed {
                    host: config.host.clone(),
                    port: config.port,
                    source,
                },
                (None, e) => TransportError::Ssh(e),
            }
        })?;

        let auth = tokio::time::timeout(
            config.timeout,
            session.authenticate_password(&config.username, config.password.expose_secret()),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))??;
        if !auth.success() {
            return Err(TransportError::AuthenticationFailed {
                user: config.username,
            });
        }

        debug!("SSH session authenticated to {}:{}", config.host, config.port);
        Ok(Self {
            session,
            host: config.host,
        })
    }

    /// Open an interactive shell channel with a PTY. The connection is
    /// closed if the device refuses the shell.
    pub async fn open_shell(self) -> Result<SshShell, TransportError> {
        match self.request_shell().await {
            Ok(channel) => Ok(SshShell {
                transport: Some(self),
                channel,
            }),
            Err(e) => {
                let _ = self.close().await;
                Err(e)
            }
        }
    }

    async fn request_shell(&self) -> Result<Channel<Msg>, TransportError> {
        let channel = self.session.channel_open_session().await?;
        channel
            .request_pty(true, "xterm", 511, 24, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }

    /// Open a channel running a single command.
    pub async fn open_exec(&self, command: &str) -> Result<Channel<Msg>, TransportError> {
        let channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;
        Ok(channel)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// Interactive shell on an SSH connection.
pub struct SshShell {
    transport: Option<SshTransport>,
    channel: Channel<Msg>,
}

impl CliIo for SshShell {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.channel.eof().await;
        match self.transport.take() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }
}

/// russh client handler enforcing the host key policy.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// `Ok(true)` if known and matching, `Ok(false)` if unknown.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> Result<bool, TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, pubkey),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    fn learn_host_key(&self, pubkey: &PublicKey) -> Result<(), TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::known_hosts::learn_known_hosts_path(
                &self.host, self.port, pubkey, path,
            ),
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey),
        };
        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, err: TransportError) -> bool {
        *self
            .host_key_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let accepted = match self.host_key_verification {
            HostKeyVerification::Disabled => true,
            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key for {}: {}", self.host, e);
                    }
                    true
                }
                Err(e) => self.reject(e),
            },
            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                }),
                Err(e) => self.reject(e),
            },
        };
        Ok(accepted)
    }
}
