use std::time::Duration;

use async_trait::async_trait;

use super::{ArtifactTransport, RetrievalTask, TransportKind};
use crate::error::RetrievalError;
use crate::session::DeviceSession;
use crate::tftp::TftpClient;

/// Fetches files with the built-in TFTP client. Needs no credentials.
#[derive(Debug, Clone)]
pub struct TftpTransport {
    port: u16,
    timeout: Duration,
}

impl TftpTransport {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl ArtifactTransport for TftpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tftp
    }

    async fn fetch(
        &self,
        task: &RetrievalTask<'_>,
        _session: &mut dyn DeviceSession,
    ) -> Result<Vec<u8>, RetrievalError> {
        let client = TftpClient::resolve(task.address, self.port)
            .await?
            .with_timeout(self.timeout);
        Ok(client.fetch(task.filename).await?.data)
    }
}
