//! Run configuration.
//!
//! One [`InspectionConfig`] is built at startup and handed to the
//! orchestrator and its collaborators explicitly. Layers, lowest priority
//! first: built-in defaults, an optional TOML file, then `NETINSPECT_`
//! environment variables (`__` separates nested keys, e.g.
//! `NETINSPECT_DIAGNOSTIC__SETTLE_DELAY=30`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::HostKeyVerification;
use crate::transfer::TransportKind;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "NETINSPECT_";

/// What an empty command list means for a command-list device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCommandPolicy {
    /// Recorded as "no commands configured" and counted as a success.
    #[default]
    Success,
    /// Counted as a failure.
    Failure,
}

/// Top-level configuration for an inspection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Maximum number of devices inspected at once.
    pub workers: usize,

    /// Directory under which each run creates its timestamped directory.
    pub output_root: PathBuf,

    /// Session connect timeout.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Time allowed for one command to return to the prompt.
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// SSH host key policy.
    pub host_key_verification: HostKeyVerification,

    /// Outcome of a command-list device with no commands.
    pub empty_commands: EmptyCommandPolicy,

    /// Diagnostic dump settings.
    pub diagnostic: DiagnosticConfig,

    /// Artifact retrieval settings.
    pub retrieval: RetrievalConfig,

    /// Notification settings.
    pub notify: NotifyConfig,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            output_root: PathBuf::from("LOG"),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            host_key_verification: HostKeyVerification::default(),
            empty_commands: EmptyCommandPolicy::default(),
            diagnostic: DiagnosticConfig::default(),
            retrieval: RetrievalConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

/// Settings for devices that generate their evidence on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticConfig {
    /// Device-type substrings that select the diagnostic dump flow.
    pub families: Vec<String>,

    /// Command that starts the dump.
    pub trigger_command: String,

    /// Wait between the trigger and the first retrieval.
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,

    /// Files produced by the dump, fetched in order.
    pub artifacts: Vec<String>,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            families: vec!["alcatel".to_string(), "ale".to_string()],
            trigger_command: "show tech-support".to_string(),
            settle_delay: Duration::from_secs(10),
            artifacts: vec![
                "tech_support_layer3.log".to_string(),
                "tech_support_layer2.log".to_string(),
                "tech_support.log".to_string(),
            ],
        }
    }
}

/// Settings for the transport fallback chain.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Transports in the order they are tried.
    pub order: Vec<TransportKind>,

    /// Username for file transfers instead of the device login.
    pub username: Option<String>,

    /// Password for file transfers instead of the device login.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// FTP login used when no username is known.
    pub ftp_default_username: String,

    /// FTP password used when no password is known.
    #[serde(skip_serializing)]
    pub ftp_default_password: String,

    pub ftp_port: u16,
    pub scp_port: u16,
    pub tftp_port: u16,

    /// Receive timeout for each TFTP packet.
    #[serde(with = "duration_secs")]
    pub tftp_timeout: Duration,

    /// Overall limit for one SCP or FTP transfer.
    #[serde(with = "duration_secs")]
    pub transfer_timeout: Duration,

    /// In-band output must be longer than this to count as file content.
    pub in_band_min_length: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            order: vec![
                TransportKind::Scp,
                TransportKind::Ftp,
                TransportKind::Tftp,
                TransportKind::InBand,
            ],
            username: None,
            password: None,
            ftp_default_username: "admin".to_string(),
            ftp_default_password: "password".to_string(),
            ftp_port: 21,
            scp_port: 22,
            tftp_port: crate::tftp::DEFAULT_PORT,
            tftp_timeout: crate::tftp::DEFAULT_TIMEOUT,
            transfer_timeout: Duration::from_secs(300),
            in_band_min_length: 50,
        }
    }
}

impl fmt::Debug for RetrievalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalConfig")
            .field("order", &self.order)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ftp_default_username", &self.ftp_default_username)
            .field("ftp_default_password", &"<redacted>")
            .field("ftp_port", &self.ftp_port)
            .field("scp_port", &self.scp_port)
            .field("tftp_port", &self.tftp_port)
            .field("tftp_timeout", &self.tftp_timeout)
            .field("transfer_timeout", &self.transfer_timeout)
            .field("in_band_min_length", &self.in_band_min_length)
            .finish()
    }
}

/// Settings for the end-of-run notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Largest total attachment size before falling back to the summary archive.
    pub max_attachment_mb: u64,

    /// Mail the summary through this relay. Without it the summary is logged.
    pub smtp: Option<SmtpConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attachment_mb: 25,
            smtp: None,
        }
    }
}

/// SMTP relay and addressing for the summary mail.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,

    /// STARTTLS on a plain connection when true, implicit TLS otherwise.
    pub use_tls: bool,

    /// Sender address, also the login unless `username` is set.
    pub sender: String,
    pub sender_name: String,
    pub username: Option<String>,

    #[serde(skip_serializing)]
    pub password: String,

    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,

    pub subject_prefix: String,

    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Delivery attempts before giving up.
    pub retry_count: u32,

    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 587,
            use_tls: true,
            sender: String::new(),
            sender_name: "网络巡检系统".to_string(),
            username: None,
            password: String::new(),
            recipients: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject_prefix: "[网络巡检]".to_string(),
            timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("sender", &self.sender)
            .field("sender_name", &self.sender_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("recipients", &self.recipients)
            .field("cc", &self.cc)
            .field("bcc", &self.bcc)
            .field("subject_prefix", &self.subject_prefix)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

impl SmtpConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |message: String| Error::Config { message };

        if self.server.trim().is_empty() {
            return Err(invalid("notify.smtp.server is required".to_string()));
        }
        if self.password.is_empty() {
            return Err(invalid("notify.smtp.password is required".to_string()));
        }
        if self.recipients.is_empty() {
            return Err(invalid(
                "notify.smtp.recipients must name at least one address".to_string(),
            ));
        }

        let addresses = std::iter::once(&self.sender)
            .chain(&self.recipients)
            .chain(&self.cc)
            .chain(&self.bcc);
        for address in addresses {
            if let Err(e) = address.trim().parse::<lettre::Address>() {
                return Err(invalid(format!(
                    "notify.smtp: invalid mail address '{address}': {e}"
                )));
            }
        }
        Ok(())
    }
}

impl InspectionConfig {
    /// Load defaults, the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config {
                    message: format!("config file not found: {}", path.display()),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration from an assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the run cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config {
                message: "workers must be at least 1".to_string(),
            });
        }
        if self.retrieval.order.is_empty() {
            return Err(Error::Config {
                message: "retrieval.order must name at least one transport".to_string(),
            });
        }
        if !self.diagnostic.families.is_empty() && self.diagnostic.artifacts.is_empty() {
            return Err(Error::Config {
                message: "diagnostic.artifacts is empty but diagnostic families are configured"
                    .to_string(),
            });
        }
        if let Some(smtp) = &self.notify.smtp {
            smtp.validate()?;
        }
        Ok(())
    }

    /// Whether a device-type tag belongs to a diagnostic dump family.
    pub fn is_diagnostic_family(&self, device_type: &str) -> bool {
        let tag = device_type.trim().to_lowercase();
        !tag.is_empty()
            && self
                .diagnostic
                .families
                .iter()
                .any(|family| tag.contains(&family.to_lowercase()))
    }
}

/// Serde adapter storing a `Duration` as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
