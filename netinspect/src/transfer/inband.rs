//! Last-resort retrieval: print the file on the management session.

use async_trait::async_trait;
use chrono::Local;
use log::debug;

use super::{ArtifactTransport, RetrievalTask, TransportKind};
use crate::error::RetrievalError;
use crate::session::DeviceSession;

/// File-viewing commands tried in order; `{}` is the file name.
const VIEW_COMMANDS: [&str; 4] = ["more {}", "cat {}", "show file {}", "file show {}"];

/// Reads a file by running viewing commands on the open session.
#[derive(Debug, Clone)]
pub struct InBandTransport {
    min_length: usize,
}

impl InBandTransport {
    /// Output must be longer than `min_length` bytes to count as content.
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }

    fn accepts(&self, output: &str) -> bool {
        output.len() > self.min_length
            && !output.contains("No such file")
            && !output.to_lowercase().contains("not found")
    }
}

#[async_trait]
impl ArtifactTransport for InBandTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InBand
    }

    async fn fetch(
        &self,
        task: &RetrievalTask<'_>,
        session: &mut dyn DeviceSession,
    ) -> Result<Vec<u8>, RetrievalError> {
        for template in VIEW_COMMANDS {
            let command = template.replace("{}", task.filename);
            match session.run(&command).await {
                Ok(output) if self.accepts(&output) => {
                    debug!(
                        "{}: '{}' returned {} bytes",
                        task.address,
                        command,
                        output.len()
                    );
                    return Ok(with_provenance(task, &command, &output).into_bytes());
                }
                Ok(output) => {
                    debug!(
                        "{}: '{}' output not usable ({} bytes)",
                        task.address,
                        command,
                        output.len()
                    );
                }
                Err(e) => debug!("{}: '{}' failed: {}", task.address, command, e),
            }
        }
        Err(RetrievalError::NoContent)
    }
}

/// Prefix the captured text with where and how it was obtained.
fn with_provenance(task: &RetrievalTask<'_>, command: &str, output: &str) -> String {
    let mut text = String::with_capacity(output.len() + 256);
    text.push_str("# 设备文件内容\n");
    text.push_str(&format!("# 设备IP: {}\n", task.address));
    text.push_str(&format!("# 文件名: {}\n", task.filename));
    text.push_str(&format!("# 获取命令: {command}\n"));
    text.push_str(&format!(
        "# 获取时间: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    text.push_str("# ");
    text.push_str(&"=".repeat(50));
    text.push_str("\n\n");
    text.push_str(output);
    text
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use secrecy::SecretString;

    use super::*;
    use crate::device::{Credentials, DeviceRecord};
    use crate::session::SessionConnector;
    use crate::session::mock::ScriptedConnector;

    const LOG: &str = "Tue May 14 10:00:00 : CSLIB library(0) info message: system started\n\
                       Tue May 14 10:00:01 : STACK-MANAGER info message: chassis 1 up\n";

    fn task(password: &SecretString) -> RetrievalTask<'_> {
        RetrievalTask {
            address: "10.0.0.9",
            filename: "tech_support.log",
            username: "admin",
            password,
        }
    }

    #[tokio::test]
    async fn test_falls_through_unusable_output() {
        let connector = ScriptedConnector::new()
            .reject("more tech_support.log", "ERROR: Invalid entry: \"more\"")
            .respond("cat tech_support.log", "cat: tech_support.log: No such file or directory, retry later")
            .respond("show file tech_support.log", LOG);
        let device = DeviceRecord::new("10.0.0.9", "alcatel_aos", Credentials::new("admin", "pw"));
        let mut session = connector.connect(&device).await.unwrap();
        let password = SecretString::from("pw".to_string());

        let content = InBandTransport::new(50)
            .fetch(&task(&password), session.as_mut())
            .await
            .unwrap();
        let content = String::from_utf8(content).unwrap();

        assert!(content.starts_with("# 设备文件内容\n# 设备IP: 10.0.0.9\n# 文件名: tech_support.log\n"));
        assert!(content.contains("# 获取命令: show file tech_support.log\n"));
        assert!(content.ends_with(&format!("# {}\n\n{}", "=".repeat(50), LOG)));
        assert_eq!(
            connector.activity.commands_for("10.0.0.9"),
            vec![
                "more tech_support.log",
                "cat tech_support.log",
                "show file tech_support.log"
            ]
        );
        assert_eq!(connector.activity.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_content_after_every_command() {
        let connector = ScriptedConnector::new()
            .respond("more a.log", "short")
            .respond(
                "cat a.log",
                "The requested file was NOT FOUND on flash, please check the name and retry",
            );
        let device = DeviceRecord::new("10.0.0.9", "alcatel_aos", Credentials::new("admin", "pw"));
        let mut session = connector.connect(&device).await.unwrap();
        let password = SecretString::from("pw".to_string());
        let task = RetrievalTask {
            filename: "a.log",
            ..task(&password)
        };

        let err = InBandTransport::new(50)
            .fetch(&task, session.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NoContent));
        assert_eq!(connector.activity.commands_for("10.0.0.9").len(), 4);
    }

    #[test]
    fn test_acceptance_threshold() {
        let transport = InBandTransport::new(50);
        assert!(!transport.accepts(&"x".repeat(50)));
        assert!(transport.accepts(&"x".repeat(51)));
    }
}
