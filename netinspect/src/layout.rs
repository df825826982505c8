//! Local artifact layout for one run.
//!
//! ```text
//! <output_root>/<ts>/                         run directory
//! <output_root>/<ts>/<addr>_<ts>/             one per device
//!     <addr>_<remote file>                    retrieved artifact
//!     <addr>_<remote file>.failed             failure record
//!     <addr>_<device type>_commands_output.txt
//! <output_root>/<ts>/<addr>_<ts>.zip          per-device archive
//! <output_root>/<ts>/all_devices_<ts>.zip     summary archive
//! ```
//!
//! Every path is a pure function of (address, run timestamp, name), so
//! concurrent devices never share a path and two runs never collide.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Run timestamp format, also used in directory names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Paths for one inspection run.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    timestamp: String,
}

impl RunLayout {
    /// Layout rooted at `<output_root>/<timestamp of started>`.
    pub fn new(output_root: impl AsRef<Path>, started: DateTime<Local>) -> Self {
        Self::with_timestamp(output_root, started.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Layout with an explicit timestamp string.
    pub fn with_timestamp(output_root: impl AsRef<Path>, timestamp: impl Into<String>) -> Self {
        let timestamp = timestamp.into();
        Self {
            root: output_root.as_ref().join(&timestamp),
            timestamp,
        }
    }

    /// Run directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Create the run directory.
    pub async fn create(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Directory holding everything for one device.
    pub fn device_dir(&self, address: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}", path_component(address), self.timestamp))
    }

    /// Create the device directory if needed and return it.
    pub async fn ensure_device_dir(&self, address: &str) -> io::Result<PathBuf> {
        let dir = self.device_dir(address);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Local path for a retrieved artifact.
    pub fn artifact_path(&self, address: &str, remote_filename: &str) -> PathBuf {
        self.device_dir(address).join(artifact_name(address, remote_filename))
    }

    /// Local path for the record written when every transport failed.
    pub fn failure_marker_path(&self, address: &str, remote_filename: &str) -> PathBuf {
        self.device_dir(address).join(format!(
            "{}.failed",
            artifact_name(address, remote_filename)
        ))
    }

    /// Local path for a device's combined command transcript.
    pub fn transcript_path(&self, address: &str, device_type: &str) -> PathBuf {
        self.device_dir(address).join(format!(
            "{}_{}_commands_output.txt",
            path_component(address),
            path_component(device_type)
        ))
    }

    /// Archive of one device directory.
    pub fn device_archive_path(&self, address: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}.zip", path_component(address), self.timestamp))
    }

    /// Archive bundling every device archive.
    pub fn summary_archive_path(&self) -> PathBuf {
        self.root.join(format!("all_devices_{}.zip", self.timestamp))
    }

    /// Plain list of failed addresses included in the summary archive.
    pub fn failed_list_path(&self) -> PathBuf {
        self.root.join("failed_devices.txt")
    }
}

fn artifact_name(address: &str, remote_filename: &str) -> String {
    format!(
        "{}_{}",
        path_component(address),
        path_component(remote_filename)
    )
}

/// Make a value safe to use as a single path component.
fn path_component(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}
