//! Management sessions to devices.
//!
//! A session is the CLI of one device, reached over SSH or Telnet. The
//! inspection core only sees the [`DeviceSession`] and [`SessionConnector`]
//! traits, so tests can substitute scripted sessions for real devices.

mod buffer;
mod cli;
pub mod profile;
mod ssh;
mod telnet;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::PatternBuffer;
pub use cli::{CliIo, CliSession};
pub use profile::VendorProfile;
pub use ssh::{SshConfig, SshShell, SshTransport};
pub use telnet::TelnetIo;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::config::InspectionConfig;
use crate::device::{DeviceRecord, ManagementProtocol};
use crate::error::{CommandError, ConnectError, TransportError};

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys.
    Strict,

    /// Accept and learn unknown keys, reject changed keys.
    #[default]
    AcceptNew,

    /// Accept all keys without checking. Lab use only.
    Disabled,
}

/// An open, authenticated CLI session to one device.
#[async_trait]
pub trait DeviceSession: Send {
    /// Run one command and return its normalized output.
    async fn run(&mut self, command: &str) -> Result<String, CommandError>;

    /// Close the session. Safe to call more than once.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Opens sessions to devices.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceSession>, ConnectError>;
}

/// Connector for real devices, dispatching on the management protocol.
#[derive(Debug, Clone)]
pub struct CliConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
}

impl CliConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
        }
    }

    pub fn from_config(config: &InspectionConfig) -> Self {
        Self::new(config.connect_timeout, config.command_timeout)
            .with_host_key_verification(config.host_key_verification)
    }

    pub fn with_host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }

    pub fn with_known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    async fn connect_ssh(
        &self,
        device: &DeviceRecord,
        profile: VendorProfile,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceSession>, ConnectError> {
        let config = SshConfig {
            host: device.address.clone(),
            port: device.port,
            username: device.credentials.username.clone(),
            password: SecretString::from(device.credentials.password.expose_secret().to_owned()),
            timeout,
            host_key_verification: self.host_key_verification,
            known_hosts_path: self.known_hosts_path.clone(),
        };

        let transport = SshTransport::connect(config)
            .await
            .map_err(|e| ConnectError::from_transport(&device.address, &e))?;
        let shell = transport
            .open_shell()
            .await
            .map_err(|e| ConnectError::from_transport(&device.address, &e))?;

        let session = CliSession::new(shell, profile, self.command_timeout);
        let session = tokio::time::timeout(
            timeout,
            session.open(None, device.credentials.secret.as_ref()),
        )
        .await
        .map_err(|_| ConnectError::timeout(&device.address, timeout))?
        .map_err(|e| ConnectError::from_command(&device.address, &e))?;
        Ok(Box::new(session))
    }

    async fn connect_telnet(
        &self,
        device: &DeviceRecord,
        profile: VendorProfile,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceSession>, ConnectError> {
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((device.address.as_str(), device.port)),
        )
        .await
        .map_err(|_| ConnectError::timeout(&device.address, timeout))?
        .map_err(|source| {
            ConnectError::from_transport(
                &device.address,
                &TransportError::ConnectionFailed {
                    host: device.address.clone(),
                    port: device.port,
                    source,
                },
            )
        })?;

        let session = CliSession::new(TelnetIo::new(stream), profile, self.command_timeout);
        let login = cli::InBandLogin {
            username: &device.credentials.username,
            password: device.credentials.password.expose_secret(),
        };
        let session = tokio::time::timeout(
            timeout,
            session.open(Some(login), device.credentials.secret.as_ref()),
        )
        .await
        .map_err(|_| ConnectError::timeout(&device.address, timeout))?
        .map_err(|e| ConnectError::from_command(&device.address, &e))?;
        Ok(Box::new(session))
    }
}

#[async_trait]
impl SessionConnector for CliConnector {
    async fn connect(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceSession>, ConnectError> {
        let profile = VendorProfile::for_device_type(&device.device_type);
        let timeout = profile.connect_timeout.unwrap_or(self.connect_timeout);
        debug!(
            "Connecting to {}:{} over {} (profile {}, timeout {:?})",
            device.address, device.port, device.protocol, profile.name, timeout
        );

        let session = match &device.protocol {
            ManagementProtocol::Ssh => self.connect_ssh(device, profile, timeout).await?,
            ManagementProtocol::Telnet => self.connect_telnet(device, profile, timeout).await?,
            ManagementProtocol::Unsupported(name) => {
                return Err(ConnectError::transport(
                    &device.address,
                    format!("unsupported management protocol '{name}'"),
                ));
            }
        };

        info!("Connected to {}", device.address);
        Ok(session)
    }
}
