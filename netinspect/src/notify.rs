//! End-of-run notification.
//!
//! [`LogNotifier`] writes the summary to the log. [`SmtpNotifier`] mails it
//! as an HTML report with the selected archives attached.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};

use crate::config::SmtpConfig;
use crate::error::NotifyError;

/// What a notifier is asked to deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    /// Archives to attach.
    pub attachments: Vec<PathBuf>,
    /// Succeeded devices, annotated with vendor and flow.
    pub succeeded: Vec<String>,
    /// Failed device addresses.
    pub failed: Vec<String>,
    /// Human-readable run duration.
    pub elapsed: String,
}

/// Delivers the run summary somewhere.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether delivery succeeded. Never fails the run.
    async fn notify(&self, notification: &Notification) -> bool;
}

/// Writes the summary to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> bool {
        info!(
            "Run summary: {} succeeded, {} failed, elapsed {}",
            notification.succeeded.len(),
            notification.failed.len(),
            notification.elapsed
        );
        for device in &notification.succeeded {
            info!("  ok   {}", device);
        }
        for device in &notification.failed {
            warn!("  fail {}", device);
        }
        for attachment in &notification.attachments {
            info!("  attachment {}", attachment.display());
        }
        true
    }
}

/// Mails the summary through an SMTP relay.
pub struct SmtpNotifier {
    server: String,
    port: u16,
    use_tls: bool,
    sender: String,
    sender_name: String,
    username: String,
    password: SecretString,
    recipients: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject_prefix: String,
    timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Self {
        let sender = config.sender.trim().to_string();
        Self {
            server: config.server.trim().to_string(),
            port: config.port,
            use_tls: config.use_tls,
            username: config.username.clone().unwrap_or_else(|| sender.clone()),
            sender,
            sender_name: config.sender_name.clone(),
            password: SecretString::from(config.password.clone()),
            recipients: config.recipients.clone(),
            cc: config.cc.clone(),
            bcc: config.bcc.clone(),
            subject_prefix: config.subject_prefix.clone(),
            timeout: config.timeout,
            retry_count: config.retry_count.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// `"[网络巡检] 2024-05-01 设备巡检报告"`.
    fn subject(&self) -> String {
        format!(
            "{} {} 设备巡检报告",
            self.subject_prefix,
            Local::now().format("%Y-%m-%d")
        )
    }

    /// Assemble the report mail. Unreadable attachments are skipped.
    pub async fn build_message(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let mut attachments = Vec::new();
        for path in &notification.attachments {
            match tokio::fs::read(path).await {
                Ok(data) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string());
                    attachments.push((name, data));
                }
                Err(e) => warn!("Not attaching {}: {}", path.display(), e),
            }
        }

        let listed: Vec<(String, u64)> = attachments
            .iter()
            .map(|(name, data)| (name.clone(), data.len() as u64))
            .collect();
        let sent_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let html = render_body(notification, &listed, &sent_at);

        let mut builder = Message::builder()
            .from(Mailbox::new(
                Some(self.sender_name.clone()),
                parse_address(&self.sender)?,
            ))
            .subject(self.subject());
        for address in &self.recipients {
            builder = builder.to(Mailbox::new(None, parse_address(address)?));
        }
        for address in &self.cc {
            builder = builder.cc(Mailbox::new(None, parse_address(address)?));
        }
        for address in &self.bcc {
            builder = builder.bcc(Mailbox::new(None, parse_address(address)?));
        }

        let zip = ContentType::parse("application/zip")?;
        let mut body = MultiPart::mixed().singlepart(SinglePart::html(html));
        for (name, data) in attachments {
            body = body.singlepart(Attachment::new(name).body(data, zip.clone()));
        }
        Ok(builder.multipart(body)?)
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let builder = if self.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.server)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.server)?
        };
        Ok(builder
            .port(self.port)
            .credentials(SmtpCredentials::new(
                self.username.clone(),
                self.password.expose_secret().to_owned(),
            ))
            .timeout(Some(self.timeout))
            .build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: &Notification) -> bool {
        let message = match self.build_message(notification).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot build notification mail: {}", e);
                return false;
            }
        };
        let mailer = match self.transport() {
            Ok(mailer) => mailer,
            Err(e) => {
                warn!("Cannot set up SMTP relay {}: {}", self.server, e);
                return false;
            }
        };

        for attempt in 1..=self.retry_count {
            debug!(
                "Mailing report via {}:{} (attempt {}/{})",
                self.server, self.port, attempt, self.retry_count
            );
            match mailer.send(message.clone()).await {
                Ok(_) => {
                    info!(
                        "Report mailed to {} with {} attachments",
                        self.recipients.join(", "),
                        notification.attachments.len()
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Mail attempt {}/{} failed: {}",
                        attempt, self.retry_count, e
                    );
                    if attempt < self.retry_count {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        false
    }
}

fn parse_address(address: &str) -> Result<lettre::Address, NotifyError> {
    address
        .trim()
        .parse()
        .map_err(|source| NotifyError::Address {
            address: address.to_string(),
            source,
        })
}

/// HTML report: counts, device lists and attachments with their sizes.
fn render_body(notification: &Notification, attachments: &[(String, u64)], sent_at: &str) -> String {
    let succeeded = notification.succeeded.len();
    let failed = notification.failed.len();

    let mut html = String::from(
        "<html>\n<head><meta charset=\"utf-8\"></head>\n<body>\n<h2>设备巡检报告</h2>\n",
    );
    let _ = writeln!(html, "<p><strong>巡检时间:</strong> {}</p>", escape(sent_at));
    html.push_str("<h3>运维汇总</h3>\n<ul>\n");
    let _ = writeln!(html, "<li><strong>设备总数:</strong> {}</li>", succeeded + failed);
    let _ = writeln!(html, "<li><strong>成功设备:</strong> {succeeded}</li>");
    let _ = writeln!(html, "<li><strong>失败设备:</strong> {failed}</li>");
    if !notification.elapsed.is_empty() {
        let _ = writeln!(
            html,
            "<li><strong>总耗时:</strong> {}</li>",
            escape(&notification.elapsed)
        );
    }
    html.push_str("</ul>\n");

    if succeeded > 0 {
        html.push_str("<h3>成功设备列表</h3>\n<ul>\n");
        for device in &notification.succeeded {
            let _ = writeln!(html, "<li>{}</li>", escape(device));
        }
        html.push_str("</ul>\n");
    }
    if failed > 0 {
        html.push_str("<h3>失败设备列表</h3>\n<ul>\n");
        for device in &notification.failed {
            let _ = writeln!(html, "<li>{}</li>", escape(device));
        }
        html.push_str("</ul>\n");
    }
    if !attachments.is_empty() {
        html.push_str("<h3>附件文件</h3>\n<ul>\n");
        for (name, size) in attachments {
            let _ = writeln!(
                html,
                "<li>{} ({:.2} MB)</li>",
                escape(name),
                *size as f64 / MB
            );
        }
        html.push_str("</ul>\n");
    }

    let _ = writeln!(html, "<p>发送时间: {}</p>", escape(sent_at));
    html.push_str("</body>\n</html>\n");
    html
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Pick the archives to attach.
///
/// Everything goes when the total fits in `limit_bytes`. Otherwise only the
/// summary archive, or the three smallest archives when there is none.
pub async fn select_attachments(
    archives: &[PathBuf],
    summary: Option<&Path>,
    limit_bytes: u64,
) -> Vec<PathBuf> {
    let mut sized = Vec::with_capacity(archives.len());
    for path in archives {
        match tokio::fs::metadata(path).await {
            Ok(meta) => sized.push((path.clone(), meta.len())),
            Err(e) => warn!("Skipping attachment {}: {}", path.display(), e),
        }
    }
    choose_attachments(sized, summary, limit_bytes)
}

fn choose_attachments(
    mut sized: Vec<(PathBuf, u64)>,
    summary: Option<&Path>,
    limit_bytes: u64,
) -> Vec<PathBuf> {
    let total: u64 = sized.iter().map(|(_, size)| size).sum();
    if total <= limit_bytes {
        return sized.into_iter().map(|(path, _)| path).collect();
    }

    info!(
        "Attachments total {:.2} MB, over the {:.2} MB limit",
        total as f64 / MB,
        limit_bytes as f64 / MB
    );
    if let Some(summary) = summary {
        if sized.iter().any(|(path, _)| path == summary) {
            return vec![summary.to_path_buf()];
        }
    }
    sized.sort_by_key(|(_, size)| *size);
    sized.into_iter().take(3).map(|(path, _)| path).collect()
}

const MB: f64 = 1024.0 * 1024.0;

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(entries: &[(&str, u64)]) -> Vec<(PathBuf, u64)> {
        entries
            .iter()
            .map(|(name, size)| (PathBuf::from(name), *size))
            .collect()
    }

    #[test]
    fn test_everything_fits() {
        let chosen = choose_attachments(
            sized(&[("a.zip", 10), ("b.zip", 20), ("all_devices_ts.zip", 30)]),
            Some(Path::new("all_devices_ts.zip")),
            60,
        );
        assert_eq!(chosen.len(), 3);
    }

    #[test]
    fn test_over_limit_sends_summary_only() {
        let chosen = choose_attachments(
            sized(&[("a.zip", 10), ("b.zip", 20), ("all_devices_ts.zip", 30)]),
            Some(Path::new("all_devices_ts.zip")),
            59,
        );
        assert_eq!(chosen, vec![PathBuf::from("all_devices_ts.zip")]);
    }

    #[test]
    fn test_over_limit_without_summary_sends_three_smallest() {
        let chosen = choose_attachments(
            sized(&[("d.zip", 40), ("a.zip", 10), ("c.zip", 30), ("b.zip", 20)]),
            None,
            50,
        );
        assert_eq!(
            chosen,
            vec![
                PathBuf::from("a.zip"),
                PathBuf::from("b.zip"),
                PathBuf::from("c.zip")
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("a.zip");
        std::fs::write(&present, b"12345").unwrap();

        let chosen =
            select_attachments(&[present.clone(), tmp.path().join("gone.zip")], None, 1024).await;
        assert_eq!(chosen, vec![present]);
    }

    fn smtp_config(server: &str, port: u16) -> SmtpConfig {
        SmtpConfig {
            server: server.to_string(),
            port,
            use_tls: false,
            sender: "netinspect@example.com".to_string(),
            password: "pw".to_string(),
            recipients: vec!["noc@example.com".to_string()],
            cc: vec!["lead@example.com".to_string()],
            retry_count: 1,
            retry_delay: Duration::ZERO,
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_body() {
        let notification = Notification {
            succeeded: vec!["10.0.0.1 (Cisco - 命令列表)".to_string()],
            failed: vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
            elapsed: "12.5s".to_string(),
            ..Default::default()
        };
        let html = render_body(
            &notification,
            &[("all_devices_ts.zip".to_string(), 2 * 1024 * 1024)],
            "2024-05-01 10:00:00",
        );

        assert!(html.contains("<li><strong>设备总数:</strong> 3</li>"));
        assert!(html.contains("<li><strong>成功设备:</strong> 1</li>"));
        assert!(html.contains("<li><strong>失败设备:</strong> 2</li>"));
        assert!(html.contains("<li><strong>总耗时:</strong> 12.5s</li>"));
        assert!(html.contains("<li>10.0.0.1 (Cisco - 命令列表)</li>"));
        assert!(html.contains("<li>10.0.0.3</li>"));
        assert!(html.contains("<li>all_devices_ts.zip (2.00 MB)</li>"));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }

    #[tokio::test]
    async fn test_message_carries_attachments() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("10.0.0.1_ts.zip");
        std::fs::write(&archive, b"PK\x03\x04zipdata").unwrap();

        let notifier = SmtpNotifier::new(&smtp_config("smtp.example.com", 587));
        let notification = Notification {
            attachments: vec![archive, tmp.path().join("gone.zip")],
            succeeded: vec!["10.0.0.1".to_string()],
            ..Default::default()
        };
        let message = notifier.build_message(&notification).await.unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();

        assert!(raw.contains("noc@example.com"));
        assert!(raw.contains("lead@example.com"));
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("filename=\"10.0.0.1_ts.zip\""));
        assert!(!raw.contains("gone.zip"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_fails_to_build() {
        let mut config = smtp_config("smtp.example.com", 587);
        config.recipients = vec!["nobody".to_string()];
        let err = SmtpNotifier::new(&config)
            .build_message(&Notification::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Address { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let notifier = SmtpNotifier::new(&smtp_config("127.0.0.1", port));
        assert!(!notifier.notify(&Notification::default()).await);
    }

    #[tokio::test]
    async fn test_log_notifier_reports_success() {
        let notification = Notification {
            succeeded: vec!["10.0.0.1 (Cisco - 命令列表)".to_string()],
            failed: vec!["10.0.0.2".to_string()],
            elapsed: "1.0s".to_string(),
            ..Default::default()
        };
        assert!(LogNotifier.notify(&notification).await);
    }
}
