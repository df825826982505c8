//! Run-level orchestration.
//!
//! The [`Orchestrator`] creates the run directory, inspects every device on
//! a bounded pool of tokio tasks, partitions addresses into success and
//! failure sets, then archives evidence and sends the notification.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Local;
use futures_util::FutureExt;
use indexmap::IndexSet;
use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::archive::{Archiver, ZipArchiver};
use crate::config::InspectionConfig;
use crate::device::{DeviceRecord, FlowKind};
use crate::error::{Error, Result};
use crate::inspect::{InspectionResult, Inspector, panic_message};
use crate::layout::RunLayout;
use crate::notify::{LogNotifier, Notification, Notifier, select_attachments};
use crate::session::{CliConnector, SessionConnector};
use crate::transfer::FallbackChain;

/// Success and failure address sets shared by every worker.
///
/// An address lands in exactly one set. A failure recorded for an address
/// that already succeeded moves it to the failure set; a later success
/// does not move it back.
#[derive(Debug, Default)]
pub struct ResultLedger {
    inner: Mutex<LedgerSets>,
}

#[derive(Debug, Default)]
struct LedgerSets {
    succeeded: IndexSet<String>,
    failed: IndexSet<String>,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &InspectionResult) {
        if result.is_success() {
            self.record_success(&result.address);
        } else {
            self.record_failure(&result.address);
        }
    }

    pub fn record_success(&self, address: &str) {
        let mut sets = self.lock();
        if !sets.failed.contains(address) {
            sets.succeeded.insert(address.to_string());
        }
    }

    pub fn record_failure(&self, address: &str) {
        let mut sets = self.lock();
        sets.succeeded.shift_remove(address);
        sets.failed.insert(address.to_string());
    }

    /// Succeeded and failed addresses, each in order of completion.
    pub fn snapshot(&self) -> (Vec<String>, Vec<String>) {
        let sets = self.lock();
        (
            sets.succeeded.iter().cloned().collect(),
            sets.failed.iter().cloned().collect(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerSets> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Final report of a run.
#[derive(Debug, Clone)]
pub struct InspectionReport {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed: Duration,
    pub run_dir: PathBuf,
    /// Per-device archives followed by the summary archive.
    pub archives: Vec<PathBuf>,
    /// Every device's result, in inventory order.
    pub results: Vec<InspectionResult>,
}

impl InspectionReport {
    fn result_for(&self, address: &str) -> Option<&InspectionResult> {
        self.results.iter().find(|r| r.address == address)
    }
}

impl fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Inspection finished in {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "  run directory: {}", self.run_dir.display())?;
        writeln!(f, "  total:     {}", self.total)?;
        writeln!(f, "  succeeded: {}", self.succeeded.len())?;
        writeln!(f, "  failed:    {}", self.failed.len())?;
        if !self.succeeded.is_empty() {
            writeln!(f, "Succeeded:")?;
            for address in &self.succeeded {
                match self.result_for(address) {
                    Some(result) => writeln!(f, "  {}", annotate(result, None))?,
                    None => writeln!(f, "  {address}")?,
                }
            }
        }
        if !self.failed.is_empty() {
            writeln!(f, "Failed:")?;
            for address in &self.failed {
                match self.result_for(address).and_then(|r| r.failure.as_ref()) {
                    Some(failure) => writeln!(f, "  {address}: {failure}")?,
                    None => writeln!(f, "  {address}")?,
                }
            }
        }
        if !self.archives.is_empty() {
            writeln!(f, "Archives:")?;
            for archive in &self.archives {
                writeln!(f, "  {}", archive.display())?;
            }
        }
        Ok(())
    }
}

/// `"10.0.0.1 (Cisco - 命令列表)"` or `"10.0.0.9 (ALE - tech-support)"`.
fn annotate(result: &InspectionResult, trigger_command: Option<&str>) -> String {
    match result.flow {
        Some(FlowKind::DiagnosticDump) => {
            let label = trigger_command
                .map(|c| c.trim().trim_start_matches("show ").trim())
                .filter(|c| !c.is_empty())
                .unwrap_or("diagnostic dump");
            format!("{} ({} - {})", result.address, result.vendor, label)
        }
        Some(FlowKind::CommandList) => {
            format!("{} ({} - 命令列表)", result.address, result.vendor)
        }
        None => result.address.clone(),
    }
}

/// Drives one inspection run.
pub struct Orchestrator {
    config: Arc<InspectionConfig>,
    connector: Arc<dyn SessionConnector>,
    chain: Arc<FallbackChain>,
    archiver: Arc<dyn Archiver>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    /// Orchestrator with the CLI session connector, the configured transport
    /// chain, zip archiving and log notification.
    pub fn new(config: InspectionConfig) -> Self {
        let connector = Arc::new(CliConnector::from_config(&config));
        let chain = Arc::new(FallbackChain::from_config(&config));
        Self {
            config: Arc::new(config),
            connector,
            chain,
            archiver: Arc::new(ZipArchiver),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_chain(mut self, chain: FallbackChain) -> Self {
        self.chain = Arc::new(chain);
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &InspectionConfig {
        &self.config
    }

    /// Inspect every device and post-process the evidence.
    ///
    /// Each address is inspected once; later records repeating an address
    /// are dropped with a warning. Fails only when the run directory cannot
    /// be created. Device failures are reported in the returned
    /// [`InspectionReport`].
    pub async fn run(&self, devices: Vec<DeviceRecord>) -> Result<InspectionReport> {
        let started = Instant::now();
        let layout = Arc::new(RunLayout::new(&self.config.output_root, Local::now()));
        layout
            .create()
            .await
            .map_err(|e| Error::io(layout.root(), e))?;

        let devices = unique_addresses(devices);
        let total = devices.len();
        info!(
            "Inspecting {} devices with {} workers, evidence under {}",
            total,
            self.config.workers,
            layout.root().display()
        );
        if devices.is_empty() {
            warn!("No devices to inspect");
            return Ok(InspectionReport {
                total: 0,
                succeeded: Vec::new(),
                failed: Vec::new(),
                elapsed: started.elapsed(),
                run_dir: layout.root().to_path_buf(),
                archives: Vec::new(),
                results: Vec::new(),
            });
        }

        let inspector = Inspector::new(
            self.connector.clone(),
            self.chain.clone(),
            layout.clone(),
            self.config.clone(),
        );
        let ledger = Arc::new(ResultLedger::new());
        let results = self.inspect_all(devices, inspector, ledger.clone()).await;

        let (succeeded, failed) = ledger.snapshot();
        let elapsed = started.elapsed();
        info!(
            "Inspection of {} devices finished in {:.1}s: {} succeeded, {} failed",
            total,
            elapsed.as_secs_f64(),
            succeeded.len(),
            failed.len()
        );

        let mut report = InspectionReport {
            total,
            succeeded,
            failed,
            elapsed,
            run_dir: layout.root().to_path_buf(),
            archives: Vec::new(),
            results,
        };
        let summary = self.archive(&layout, &mut report).await;
        self.send_notification(&report, summary.as_deref()).await;
        Ok(report)
    }

    async fn inspect_all(
        &self,
        devices: Vec<DeviceRecord>,
        inspector: Inspector,
        ledger: Arc<ResultLedger>,
    ) -> Vec<InspectionResult> {
        let permits = Arc::new(Semaphore::new(self.config.workers));
        let devices: Vec<Arc<DeviceRecord>> = devices.into_iter().map(Arc::new).collect();
        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::new();

        for (index, device) in devices.iter().enumerate() {
            let device = Arc::clone(device);
            let inspector = inspector.clone();
            let permits = Arc::clone(&permits);
            let ledger = Arc::clone(&ledger);

            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let started = Instant::now();
                let result = match AssertUnwindSafe(inspector.inspect(&device))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!("{}: inspection panicked: {}", device.address, message);
                        InspectionResult::panicked(&device, message, started.elapsed())
                    }
                };
                ledger.record(&result);
                (index, result)
            });
            task_index.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<InspectionResult>> = vec![None; devices.len()];
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (index, result))) => slots[index] = Some(result),
                Err(e) => {
                    // Only reachable if the task itself was torn down
                    let Some(&index) = task_index.get(&e.id()) else {
                        warn!("Unknown inspection task ended: {}", e);
                        continue;
                    };
                    let device = &devices[index];
                    warn!("{}: inspection task ended abnormally: {}", device.address, e);
                    let result = InspectionResult::panicked(device, e.to_string(), Duration::ZERO);
                    ledger.record(&result);
                    slots[index] = Some(result);
                }
            }
        }

        slots.into_iter().flatten().collect()
    }

    /// Archive each succeeded device, then the summary. Returns the summary
    /// archive path when one was written.
    async fn archive(&self, layout: &RunLayout, report: &mut InspectionReport) -> Option<PathBuf> {
        let mut device_archives = Vec::new();
        for address in &report.succeeded {
            let dir = layout.device_dir(address);
            if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                info!("{}: no evidence directory, nothing to archive", address);
                continue;
            }
            let target = layout.device_archive_path(address);
            match self.archiver.compress_directory(&dir, &target).await {
                Ok(path) => device_archives.push(path),
                Err(e) => warn!("{}: archiving failed: {}", address, e),
            }
        }

        if device_archives.is_empty() {
            info!("No device archives created");
            return None;
        }

        let mut members = device_archives.clone();
        if !report.failed.is_empty() {
            let path = layout.failed_list_path();
            match tokio::fs::write(&path, failed_list(layout.timestamp(), &report.failed)).await {
                Ok(()) => members.push(path),
                Err(e) => warn!("Cannot write {}: {}", path.display(), e),
            }
        }

        report.archives = device_archives;
        match self
            .archiver
            .compress_files(&members, &layout.summary_archive_path())
            .await
        {
            Ok(summary) => {
                report.archives.push(summary.clone());
                Some(summary)
            }
            Err(e) => {
                warn!("Summary archive failed: {}", e);
                None
            }
        }
    }

    async fn send_notification(&self, report: &InspectionReport, summary: Option<&Path>) {
        let limit = self.config.notify.max_attachment_mb.saturating_mul(1024 * 1024);
        let attachments = select_attachments(&report.archives, summary, limit).await;
        let trigger = self.config.diagnostic.trigger_command.as_str();

        let notification = Notification {
            attachments,
            succeeded: report
                .succeeded
                .iter()
                .map(|address| match report.result_for(address) {
                    Some(result) => annotate(result, Some(trigger)),
                    None => address.clone(),
                })
                .collect(),
            failed: report.failed.clone(),
            elapsed: format!("{:.1}s", report.elapsed.as_secs_f64()),
        };

        if self.notifier.notify(&notification).await {
            info!("Notification sent");
        } else {
            warn!("Notification failed");
        }
    }
}

/// Keep the first record for each address.
fn unique_addresses(devices: Vec<DeviceRecord>) -> Vec<DeviceRecord> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| {
            let first = seen.insert(device.address.clone());
            if !first {
                warn!("{}: listed more than once, keeping the first entry", device.address);
            }
            first
        })
        .collect()
}

fn failed_list(timestamp: &str, failed: &[String]) -> String {
    let mut text = format!("运维失败设备列表\n时间: {timestamp}\n");
    text.push_str(&"=".repeat(40));
    text.push('\n');
    for address in failed {
        text.push_str(address);
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use zip::ZipArchive;

    use super::*;
    use crate::device::Credentials;
    use crate::error::ConnectFailureKind;
    use crate::inspect::FailureDetail;
    use crate::session::mock::ScriptedConnector;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> bool {
            self.sent.lock().unwrap().push(notification.clone());
            true
        }
    }

    fn config(root: &Path, workers: usize) -> InspectionConfig {
        let mut config = InspectionConfig::default();
        config.output_root = root.to_path_buf();
        config.workers = workers;
        config.diagnostic.settle_delay = Duration::ZERO;
        config
    }

    fn cisco(address: &str) -> DeviceRecord {
        DeviceRecord::new(address, "cisco_ios", Credentials::new("admin", "pw"))
            .with_commands(["show version"])
    }

    fn orchestrator(
        config: InspectionConfig,
        connector: ScriptedConnector,
    ) -> (Orchestrator, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = Orchestrator::new(config)
            .with_connector(Arc::new(connector))
            .with_chain(FallbackChain::new(Vec::new()))
            .with_notifier(notifier.clone());
        (orchestrator, notifier)
    }

    #[tokio::test]
    async fn test_worker_bound_holds() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new()
            .respond("show version", "Version 1.0")
            .with_delay(Duration::from_millis(20));
        let activity = connector.activity.clone();
        let (orchestrator, _) = orchestrator(config(tmp.path(), 10), connector);

        let devices = (1..=50).map(|i| cisco(&format!("10.0.1.{i}"))).collect();
        let report = orchestrator.run(devices).await.unwrap();

        assert_eq!(report.total, 50);
        assert_eq!(report.succeeded.len() + report.failed.len(), 50);
        assert_eq!(report.succeeded.len(), 50);
        assert_eq!(activity.connects.load(Ordering::SeqCst), 50);
        assert_eq!(activity.disconnects.load(Ordering::SeqCst), 50);
        let peak = activity.peak.load(Ordering::SeqCst);
        assert!(peak <= 10, "peak concurrency {peak} exceeded the bound");
        assert!(peak > 1, "devices never overlapped");

        // Results come back in inventory order
        assert_eq!(report.results[0].address, "10.0.1.1");
        assert_eq!(report.results[49].address, "10.0.1.50");
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new()
            .respond("show version", "Version 1.0")
            .panic_on("10.0.0.2")
            .refuse("10.0.0.3", ConnectFailureKind::Timeout);
        let (orchestrator, notifier) = orchestrator(config(tmp.path(), 2), connector);

        let report = orchestrator
            .run(vec![cisco("10.0.0.1"), cisco("10.0.0.2"), cisco("10.0.0.3")])
            .await
            .unwrap();

        assert_eq!(report.succeeded, vec!["10.0.0.1"]);
        let mut failed = report.failed.clone();
        failed.sort();
        assert_eq!(failed, vec!["10.0.0.2", "10.0.0.3"]);
        assert!(matches!(
            report.results[1].failure,
            Some(FailureDetail::Panicked(_))
        ));

        // One device archive plus the summary, which lists the failures
        assert_eq!(report.archives.len(), 2);
        let summary = report.archives.last().unwrap();
        assert!(
            summary
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("all_devices_")
        );
        let mut archive = ZipArchive::new(File::open(summary).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"failed_devices.txt".to_string()));
        let mut listed = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("failed_devices.txt").unwrap(),
            &mut listed,
        )
        .unwrap();
        assert!(listed.starts_with("运维失败设备列表\n"));
        assert!(listed.contains("10.0.0.2\n"));
        assert!(listed.contains("10.0.0.3\n"));

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].succeeded, vec!["10.0.0.1 (Cisco - 命令列表)"]);
        assert_eq!(sent[0].attachments.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_command_still_counts_as_success() {
        let tmp = tempfile::tempdir().unwrap();
        // No scripted response: the command times out
        let (orchestrator, _) = orchestrator(config(tmp.path(), 10), ScriptedConnector::new());

        let report = orchestrator.run(vec![cisco("10.0.0.5")]).await.unwrap();

        assert_eq!(report.succeeded, vec!["10.0.0.5"]);
        assert!(report.failed.is_empty());

        let transcript = report.results[0].transcript.clone().unwrap();
        assert!(transcript.starts_with(&report.run_dir));
        assert!(transcript.ends_with("10.0.0.5_cisco_ios_commands_output.txt"));
        let text = std::fs::read_to_string(&transcript).unwrap();
        assert_eq!(text.matches("[命令 1] show version").count(), 1);
        assert!(text.contains("[命令 1] show version - 执行失败"));
        assert!(text.contains("失败命令: 1\n"));

        let device_zip = report.run_dir.join(format!(
            "10.0.0.5_{}.zip",
            report.run_dir.file_name().unwrap().to_string_lossy()
        ));
        assert!(report.archives.contains(&device_zip));
        assert!(device_zip.exists());
    }

    #[tokio::test]
    async fn test_repeated_address_is_inspected_once() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new()
            .respond("show version", "Version 1.0")
            .respond("show clock", "10:00:00 UTC");
        let activity = connector.activity.clone();
        let (orchestrator, _) = orchestrator(config(tmp.path(), 10), connector);

        let report = orchestrator
            .run(vec![
                cisco("10.0.0.1"),
                cisco("10.0.0.1").with_commands(["show clock"]),
                cisco("10.0.0.2"),
            ])
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded.len() + report.failed.len(), report.total);
        assert_eq!(report.results.len(), 2);
        assert_eq!(activity.connects.load(Ordering::SeqCst), 2);
        assert_eq!(activity.commands_for("10.0.0.1"), vec!["show version"]);
    }

    #[tokio::test]
    async fn test_empty_inventory_gives_empty_report() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, notifier) =
            orchestrator(config(tmp.path(), 10), ScriptedConnector::new());

        let report = orchestrator.run(Vec::new()).await.unwrap();

        assert_eq!(report.total, 0);
        assert!(report.succeeded.is_empty() && report.failed.is_empty());
        assert!(report.run_dir.is_dir());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_output_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not_a_dir");
        std::fs::write(&blocker, "file").unwrap();
        let (orchestrator, _) = orchestrator(config(&blocker, 10), ScriptedConnector::new());

        let err = orchestrator.run(vec![cisco("10.0.0.1")]).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_ledger_failure_wins() {
        let ledger = ResultLedger::new();
        ledger.record_success("10.0.0.1");
        ledger.record_failure("10.0.0.1");
        ledger.record_success("10.0.0.1");
        ledger.record_success("10.0.0.2");

        let (succeeded, failed) = ledger.snapshot();
        assert_eq!(succeeded, vec!["10.0.0.2"]);
        assert_eq!(failed, vec!["10.0.0.1"]);
    }

    #[test]
    fn test_ledger_concurrent_appends() {
        let ledger = ResultLedger::new();
        std::thread::scope(|scope| {
            for t in 0..8 {
                let ledger = &ledger;
                scope.spawn(move || {
                    for i in 0..100 {
                        let address = format!("10.{t}.0.{i}");
                        if i % 4 == 0 {
                            ledger.record_failure(&address);
                        } else {
                            ledger.record_success(&address);
                        }
                    }
                });
            }
        });

        let (succeeded, failed) = ledger.snapshot();
        assert_eq!(succeeded.len(), 600);
        assert_eq!(failed.len(), 200);
    }

    #[test]
    fn test_report_display() {
        let report = InspectionReport {
            total: 2,
            succeeded: vec!["10.0.0.1".to_string()],
            failed: vec!["10.0.0.2".to_string()],
            elapsed: Duration::from_millis(12_340),
            run_dir: PathBuf::from("LOG/ts"),
            archives: Vec::new(),
            results: Vec::new(),
        };
        let text = report.to_string();
        assert!(text.starts_with("Inspection finished in 12.3s\n"));
        assert!(text.contains("  total:     2\n"));
        assert!(text.contains("  succeeded: 1\n"));
        assert!(text.contains("  failed:    1\n"));
        assert!(text.contains("Failed:\n  10.0.0.2\n"));
    }
}
