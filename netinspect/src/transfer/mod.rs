//! Artifact retrieval with transport fallback.
//!
//! A [`FallbackChain`] tries each configured [`ArtifactTransport`] in order
//! and stops at the first one that returns the file. When all of them fail
//! it leaves a `.failed` record where the artifact would have been written.

mod ftp;
mod inband;
mod scp;
mod tftp;

pub use ftp::FtpTransport;
pub use inband::InBandTransport;
pub use scp::{ScpSink, ScpTransport};
pub use tftp::TftpTransport;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use log::{info, warn};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::InspectionConfig;
use crate::error::RetrievalError;
use crate::layout::RunLayout;
use crate::session::DeviceSession;

/// The transports a chain can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// File copy over a dedicated SSH connection.
    Scp,
    /// Passive-mode FTP.
    Ftp,
    /// The built-in TFTP client.
    Tftp,
    /// File-viewing commands on the open management session.
    InBand,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scp => "scp",
            Self::Ftp => "ftp",
            Self::Tftp => "tftp",
            Self::InBand => "in_band",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One artifact to fetch from one device.
pub struct RetrievalTask<'a> {
    pub address: &'a str,
    /// File name on the device.
    pub filename: &'a str,
    pub username: &'a str,
    pub password: &'a SecretString,
}

impl fmt::Debug for RetrievalTask<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalTask")
            .field("address", &self.address)
            .field("filename", &self.filename)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A way of getting a file off a device.
#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Fetch the file content. `session` is the device's open management
    /// session; transports with their own connection ignore it.
    async fn fetch(
        &self,
        task: &RetrievalTask<'_>,
        session: &mut dyn DeviceSession,
    ) -> Result<Vec<u8>, RetrievalError>;
}

/// One failed transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub transport: TransportKind,
    pub error: String,
}

/// What happened to one retrieval task.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    /// File name on the device.
    pub filename: String,
    /// Transport that produced the file.
    pub transport: Option<TransportKind>,
    /// Where the file was written.
    pub local_path: Option<PathBuf>,
    /// Failed attempts, in the order they were made.
    pub attempts: Vec<Attempt>,
    /// Failure record written when every transport failed.
    pub failure_record: Option<PathBuf>,
}

impl RetrievalOutcome {
    pub fn is_success(&self) -> bool {
        self.local_path.is_some()
    }

    /// Every attempt's error, joined, or `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        if self.attempts.is_empty() {
            return Some("no transport attempted".to_string());
        }
        Some(
            self.attempts
                .iter()
                .map(|a| format!("{}: {}", a.transport, a.error))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Ordered list of transports tried until one succeeds.
#[derive(Clone)]
pub struct FallbackChain {
    transports: Vec<Arc<dyn ArtifactTransport>>,
}

impl FallbackChain {
    pub fn new(transports: Vec<Arc<dyn ArtifactTransport>>) -> Self {
        Self { transports }
    }

    /// Build the chain in `retrieval.order`.
    pub fn from_config(config: &InspectionConfig) -> Self {
        let retrieval = &config.retrieval;
        let transports = retrieval
            .order
            .iter()
            .map(|kind| -> Arc<dyn ArtifactTransport> {
                match kind {
                    TransportKind::Scp => Arc::new(
                        ScpTransport::new(retrieval.scp_port, config.connect_timeout)
                            .with_transfer_timeout(retrieval.transfer_timeout)
                            .with_host_key_verification(config.host_key_verification),
                    ),
                    TransportKind::Ftp => Arc::new(
                        FtpTransport::new(retrieval.ftp_port, config.connect_timeout)
                            .with_transfer_timeout(retrieval.transfer_timeout)
                            .with_default_login(
                                &retrieval.ftp_default_username,
                                &retrieval.ftp_default_password,
                            ),
                    ),
                    TransportKind::Tftp => {
                        Arc::new(TftpTransport::new(retrieval.tftp_port, retrieval.tftp_timeout))
                    }
                    TransportKind::InBand => {
                        Arc::new(InBandTransport::new(retrieval.in_band_min_length))
                    }
                }
            })
            .collect();
        Self::new(transports)
    }

    pub fn order(&self) -> Vec<TransportKind> {
        self.transports.iter().map(|t| t.kind()).collect()
    }

    /// Try every transport in order until one returns the file, then write
    /// it to the artifact path. On exhaustion write the failure record.
    pub async fn retrieve(
        &self,
        task: &RetrievalTask<'_>,
        session: &mut dyn DeviceSession,
        layout: &RunLayout,
    ) -> RetrievalOutcome {
        let mut outcome = RetrievalOutcome {
            filename: task.filename.to_string(),
            ..Default::default()
        };

        if let Err(e) = layout.ensure_device_dir(task.address).await {
            warn!(
                "{}: cannot create device directory for {}: {}",
                task.address, task.filename, e
            );
            outcome.attempts.extend(self.transports.iter().map(|t| Attempt {
                transport: t.kind(),
                error: format!("local directory unavailable: {e}"),
            }));
            return outcome;
        }

        let local_path = layout.artifact_path(task.address, task.filename);
        for transport in &self.transports {
            let kind = transport.kind();
            info!("{}: fetching {} via {}", task.address, task.filename, kind);

            let result = match transport.fetch(task, session).await {
                Ok(content) => tokio::fs::write(&local_path, &content)
                    .await
                    .map(|()| content.len())
                    .map_err(RetrievalError::from),
                Err(e) => Err(e),
            };

            match result {
                Ok(size) => {
                    info!(
                        "{}: {} retrieved via {} ({} bytes) -> {}",
                        task.address,
                        task.filename,
                        kind,
                        size,
                        local_path.display()
                    );
                    outcome.transport = Some(kind);
                    outcome.local_path = Some(local_path);
                    return outcome;
                }
                Err(e) => {
                    warn!("{}: {} via {} failed: {}", task.address, task.filename, kind, e);
                    outcome.attempts.push(Attempt {
                        transport: kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        let record_path = layout.failure_marker_path(task.address, task.filename);
        let record = failure_record(task, &outcome.attempts);
        match tokio::fs::write(&record_path, record).await {
            Ok(()) => {
                warn!(
                    "{}: every transport failed for {}, record written to {}",
                    task.address,
                    task.filename,
                    record_path.display()
                );
                outcome.failure_record = Some(record_path);
            }
            Err(e) => warn!(
                "{}: cannot write failure record {}: {}",
                task.address,
                record_path.display(),
                e
            ),
        }
        outcome
    }
}

impl fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain")
            .field("order", &self.order())
            .finish()
    }
}

/// Text of the `.failed` record.
fn failure_record(task: &RetrievalTask<'_>, attempts: &[Attempt]) -> String {
    let mut record = String::new();
    record.push_str("设备日志文件下载失败记录\n");
    record.push_str(&format!("设备IP: {}\n", task.address));
    record.push_str(&format!("文件名: {}\n", task.filename));
    record.push_str(&format!(
        "时间: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    record.push_str("错误信息:\n");
    for attempt in attempts {
        record.push_str(&format!("  {}: {}\n", attempt.transport, attempt.error));
    }
    record.push_str(&"=".repeat(50));
    record.push('\n');
    record.push_str("可能的解决方案:\n");
    record.push_str("1. 检查设备FTP/SCP/TFTP服务是否启用\n");
    record.push_str("2. 确认用户名密码正确\n");
    record.push_str("3. 检查文件是否存在于设备根目录\n");
    record.push_str("4. 手动从设备下载文件\n");
    record.push_str("5. 检查网络连接和防火墙设置\n");
    record.push_str("6. 确认FTP端口21、SSH端口22、TFTP端口69是否开放\n");
    record
}
