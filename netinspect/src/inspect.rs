//! Per-device inspection routine.
//!
//! One call to [`Inspector::inspect`] walks a device through
//! `Connecting -> Classifying -> Executing -> Finalizing` and ends in either
//! `Succeeded` or `Failed`. The session is released on every path out of
//! `Executing`, including a panic inside the flow.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use futures_util::FutureExt;
use log::{debug, info, warn};
use secrecy::SecretString;

use crate::config::{EmptyCommandPolicy, InspectionConfig};
use crate::device::{DeviceRecord, FlowKind, VendorFlow};
use crate::error::{CommandError, ConnectFailureKind};
use crate::layout::RunLayout;
use crate::session::profile::vendor_name;
use crate::session::{DeviceSession, SessionConnector};
use crate::transfer::{FallbackChain, RetrievalOutcome, RetrievalTask};

/// Steps of the per-device state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionState {
    Connecting,
    Classifying,
    Executing,
    Finalizing,
    Succeeded,
    Failed,
}

impl fmt::Display for InspectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Classifying => "classifying",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a device ended in the failure set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDetail {
    /// No session could be opened.
    Connect {
        kind: ConnectFailureKind,
        message: String,
    },
    /// The flow ran but did not meet its success condition.
    Flow(String),
    /// The inspection panicked.
    Panicked(String),
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { kind, message } => write!(f, "connect ({kind}): {message}"),
            Self::Flow(message) => write!(f, "flow: {message}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Outcome of inspecting one device.
#[derive(Debug, Clone)]
pub struct InspectionResult {
    pub address: String,
    pub device_type: String,
    /// Display name of the vendor.
    pub vendor: String,
    /// Flow the device was classified into; `None` if it never connected.
    pub flow: Option<FlowKind>,
    /// `Succeeded` or `Failed`.
    pub state: InspectionState,
    /// Combined command transcript, for command-list devices.
    pub transcript: Option<PathBuf>,
    /// One outcome per artifact, for diagnostic dump devices.
    pub retrievals: Vec<RetrievalOutcome>,
    pub commands_succeeded: usize,
    pub commands_failed: usize,
    /// Informational remark such as "no commands configured".
    pub note: Option<String>,
    pub failure: Option<FailureDetail>,
    pub elapsed: Duration,
}

impl InspectionResult {
    fn new(device: &DeviceRecord) -> Self {
        Self {
            address: device.address.clone(),
            device_type: device.device_type.clone(),
            vendor: vendor_name(&device.device_type),
            flow: None,
            state: InspectionState::Connecting,
            transcript: None,
            retrievals: Vec::new(),
            commands_succeeded: 0,
            commands_failed: 0,
            note: None,
            failure: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Result for a device whose inspection never returned normally.
    pub fn panicked(device: &DeviceRecord, message: impl Into<String>, elapsed: Duration) -> Self {
        let mut result = Self::new(device);
        result.state = InspectionState::Failed;
        result.failure = Some(FailureDetail::Panicked(message.into()));
        result.elapsed = elapsed;
        result
    }

    pub fn is_success(&self) -> bool {
        self.state == InspectionState::Succeeded
    }

    /// Every evidence file written for this device.
    pub fn artifacts(&self) -> Vec<&Path> {
        self.transcript
            .iter()
            .map(PathBuf::as_path)
            .chain(self.retrievals.iter().filter_map(|r| r.local_path.as_deref()))
            .collect()
    }
}

/// What a flow produced, before it is folded into the result.
#[derive(Debug, Default)]
struct FlowReport {
    failure: Option<String>,
    note: Option<String>,
    transcript: Option<PathBuf>,
    retrievals: Vec<RetrievalOutcome>,
    commands_succeeded: usize,
    commands_failed: usize,
}

/// Runs the inspection routine for one device at a time. Cheap to clone
/// into each worker.
#[derive(Clone)]
pub struct Inspector {
    connector: Arc<dyn SessionConnector>,
    chain: Arc<FallbackChain>,
    layout: Arc<RunLayout>,
    config: Arc<InspectionConfig>,
}

impl Inspector {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        chain: Arc<FallbackChain>,
        layout: Arc<RunLayout>,
        config: Arc<InspectionConfig>,
    ) -> Self {
        Self {
            connector,
            chain,
            layout,
            config,
        }
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Inspect one device. Never fails; every problem ends up in the result.
    pub async fn inspect(&self, device: &DeviceRecord) -> InspectionResult {
        let started = Instant::now();
        let mut result = InspectionResult::new(device);
        info!(
            "{}: starting inspection ({}, {})",
            device.address, device.device_type, result.vendor
        );

        let mut session = match self.connector.connect(device).await {
            Ok(session) => session,
            Err(e) => {
                warn!("{}: {}", device.address, e);
                result.failure = Some(FailureDetail::Connect {
                    kind: e.kind,
                    message: e.message,
                });
                return finish(result, InspectionState::Failed, started);
            }
        };

        transition(&mut result, InspectionState::Classifying);
        let flow = VendorFlow::classify(device, &self.config);
        result.flow = Some(flow.kind());
        info!("{}: {} flow selected", device.address, flow.kind());

        transition(&mut result, InspectionState::Executing);
        let executed = AssertUnwindSafe(self.execute(device, &flow, session.as_mut()))
            .catch_unwind()
            .await;

        transition(&mut result, InspectionState::Finalizing);
        if let Err(e) = session.disconnect().await {
            warn!("{}: disconnect failed: {}", device.address, e);
        }
        drop(session);

        let report = match executed {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("{}: flow panicked: {}", device.address, message);
                result.failure = Some(FailureDetail::Panicked(message));
                return finish(result, InspectionState::Failed, started);
            }
        };

        result.transcript = report.transcript;
        result.retrievals = report.retrievals;
        result.commands_succeeded = report.commands_succeeded;
        result.commands_failed = report.commands_failed;
        result.note = report.note;
        match report.failure {
            Some(message) => {
                warn!("{}: {}", device.address, message);
                result.failure = Some(FailureDetail::Flow(message));
                finish(result, InspectionState::Failed, started)
            }
            None => finish(result, InspectionState::Succeeded, started),
        }
    }

    async fn execute(
        &self,
        device: &DeviceRecord,
        flow: &VendorFlow,
        session: &mut dyn DeviceSession,
    ) -> FlowReport {
        match flow {
            VendorFlow::DiagnosticDump {
                trigger_command,
                artifacts,
            } => {
                self.diagnostic_dump(device, trigger_command, artifacts, session)
                    .await
            }
            VendorFlow::CommandList { commands } => {
                self.command_list(device, commands, session).await
            }
        }
    }

    /// Trigger the dump, let the device write it, then fetch each file in
    /// turn. Succeeds when at least one file arrives.
    async fn diagnostic_dump(
        &self,
        device: &DeviceRecord,
        trigger_command: &str,
        artifacts: &[String],
        session: &mut dyn DeviceSession,
    ) -> FlowReport {
        let mut report = FlowReport::default();

        info!("{}: running '{}'", device.address, trigger_command);
        match session.run(trigger_command).await {
            Ok(output) => debug!(
                "{}: '{}' returned {} bytes",
                device.address,
                trigger_command,
                output.len()
            ),
            // The dump may still have been written
            Err(e) => warn!(
                "{}: '{}' failed: {}, trying retrieval anyway",
                device.address, trigger_command, e
            ),
        }

        let settle = self.config.diagnostic.settle_delay;
        if !settle.is_zero() {
            info!("{}: waiting {:?} for the dump to settle", device.address, settle);
            tokio::time::sleep(settle).await;
        }

        let retrieval = &self.config.retrieval;
        let username = retrieval
            .username
            .as_deref()
            .unwrap_or(&device.credentials.username);
        let override_password = retrieval
            .password
            .as_ref()
            .map(|p| SecretString::from(p.clone()));
        let password = override_password
            .as_ref()
            .unwrap_or(&device.credentials.password);

        for filename in artifacts {
            let task = RetrievalTask {
                address: &device.address,
                filename,
                username,
                password,
            };
            let outcome = self.chain.retrieve(&task, session, &self.layout).await;
            report.retrievals.push(outcome);
        }

        let retrieved = report.retrievals.iter().filter(|r| r.is_success()).count();
        info!(
            "{}: {}/{} artifacts retrieved",
            device.address,
            retrieved,
            artifacts.len()
        );
        if retrieved == 0 {
            report.failure = Some(format!(
                "none of {} artifacts could be retrieved",
                artifacts.len()
            ));
        }
        report
    }

    /// Run every command, keep going past failures, and write the
    /// transcript. Succeeds once the transcript is on disk.
    async fn command_list(
        &self,
        device: &DeviceRecord,
        commands: &[String],
        session: &mut dyn DeviceSession,
    ) -> FlowReport {
        let mut report = FlowReport::default();

        if commands.is_empty() {
            info!("{}: no commands configured", device.address);
            report.note = Some("no commands configured".to_string());
            if self.config.empty_commands == EmptyCommandPolicy::Failure {
                report.failure = Some("no commands configured".to_string());
            }
            return report;
        }

        let mut transcript = Transcript::new(&device.address, &device.device_type, commands.len());
        for (i, command) in commands.iter().enumerate() {
            debug!(
                "{}: [{}/{}] {}",
                device.address,
                i + 1,
                commands.len(),
                command
            );
            match session.run(command).await {
                Ok(output) => transcript.record_output(i + 1, command, &output),
                Err(e) => {
                    warn!("{}: '{}' failed: {}", device.address, command, e);
                    transcript.record_failure(i + 1, command, &e);
                }
            }
        }
        report.commands_succeeded = transcript.succeeded;
        report.commands_failed = transcript.failed;
        info!(
            "{}: {} commands succeeded, {} failed",
            device.address, transcript.succeeded, transcript.failed
        );

        let path = self
            .layout
            .transcript_path(&device.address, &device.device_type_key());
        let written = match self.layout.ensure_device_dir(&device.address).await {
            Ok(_) => tokio::fs::write(&path, transcript.finish()).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                info!("{}: transcript written to {}", device.address, path.display());
                report.transcript = Some(path);
            }
            Err(e) => {
                report.failure = Some(format!(
                    "cannot write transcript {}: {}",
                    path.display(),
                    e
                ));
            }
        }
        report
    }
}

fn transition(result: &mut InspectionResult, next: InspectionState) {
    debug!("{}: {} -> {}", result.address, result.state, next);
    result.state = next;
}

fn finish(
    mut result: InspectionResult,
    terminal: InspectionState,
    started: Instant,
) -> InspectionResult {
    transition(&mut result, terminal);
    result.elapsed = started.elapsed();
    info!(
        "{}: inspection {} in {:.1}s",
        result.address,
        terminal,
        result.elapsed.as_secs_f64()
    );
    result
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

const HEAVY_RULE: usize = 80;
const LIGHT_RULE: usize = 60;

/// Combined per-device command transcript.
struct Transcript {
    text: String,
    succeeded: usize,
    failed: usize,
}

impl Transcript {
    fn new(address: &str, device_type: &str, total: usize) -> Self {
        let mut text = String::new();
        text.push_str(&format!("设备: {address}\n"));
        text.push_str(&format!("设备类型: {device_type}\n"));
        text.push_str(&format!("执行时间: {}\n", now()));
        text.push_str(&format!("命令总数: {total}\n"));
        text.push_str(&"=".repeat(HEAVY_RULE));
        text.push_str("\n\n");
        Self {
            text,
            succeeded: 0,
            failed: 0,
        }
    }

    fn record_output(&mut self, index: usize, command: &str, output: &str) {
        self.text.push_str(&format!("[命令 {index}] {command}\n"));
        self.text.push_str(&"-".repeat(LIGHT_RULE));
        self.text.push('\n');
        self.text.push_str(output);
        self.text.push('\n');
        self.text.push_str(&"=".repeat(HEAVY_RULE));
        self.text.push_str("\n\n");
        self.succeeded += 1;
    }

    fn record_failure(&mut self, index: usize, command: &str, error: &CommandError) {
        self.text
            .push_str(&format!("[命令 {index}] {command} - 执行失败\n"));
        self.text.push_str(&"-".repeat(LIGHT_RULE));
        self.text.push('\n');
        self.text.push_str(&format!("错误信息: {error}\n"));
        if let Some(output) = error.output() {
            self.text.push_str(output);
            self.text.push('\n');
        }
        self.text.push_str(&"=".repeat(HEAVY_RULE));
        self.text.push_str("\n\n");
        self.failed += 1;
    }

    fn finish(mut self) -> String {
        self.text.push_str("\n执行汇总:\n");
        self.text.push_str(&format!("成功命令: {}\n", self.succeeded));
        self.text.push_str(&format!("失败命令: {}\n", self.failed));
        self.text.push_str(&format!("完成时间: {}\n", now()));
        self.text
    }
}

fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
