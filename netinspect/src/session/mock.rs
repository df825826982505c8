//! Scripted sessions for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceSession, SessionConnector};
use crate::device::DeviceRecord;
use crate::error::{CommandError, ConnectError, ConnectFailureKind, TransportError};

/// Shared counters across every session a connector opened.
#[derive(Debug, Default)]
pub struct Activity {
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub commands: Mutex<Vec<(String, String)>>,
}

impl Activity {
    pub fn commands_for(&self, address: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

/// Connector handing out [`ScriptedSession`]s.
#[derive(Default)]
pub struct ScriptedConnector {
    responses: HashMap<String, Result<String, String>>,
    refuse: HashMap<String, ConnectFailureKind>,
    panic_on: HashSet<String>,
    delay: Duration,
    pub activity: Arc<Activity>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session answers `command` with `output`.
    pub fn respond(mut self, command: &str, output: &str) -> Self {
        self.responses
            .insert(command.to_string(), Ok(output.to_string()));
        self
    }

    /// Every session rejects `command`, echoing `output`.
    pub fn reject(mut self, command: &str, output: &str) -> Self {
        self.responses
            .insert(command.to_string(), Err(output.to_string()));
        self
    }

    pub fn refuse(mut self, address: &str, kind: ConnectFailureKind) -> Self {
        self.refuse.insert(address.to_string(), kind);
        self
    }

    /// Panic while connecting to `address`.
    pub fn panic_on(mut self, address: &str) -> Self {
        self.panic_on.insert(address.to_string());
        self
    }

    /// Sleep this long on every command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, device: &DeviceRecord) -> Result<Box<dyn DeviceSession>, ConnectError> {
        if self.panic_on.contains(&device.address) {
            panic!("scripted panic for {}", device.address);
        }
        if let Some(kind) = self.refuse.get(&device.address) {
            return Err(ConnectError::new(&device.address, *kind, "scripted refusal"));
        }

        let active = self.activity.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.activity.peak.fetch_max(active, Ordering::SeqCst);
        self.activity.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedSession {
            address: device.address.clone(),
            responses: self.responses.clone(),
            delay: self.delay,
            activity: self.activity.clone(),
            open: true,
        }))
    }
}

/// Session answering from a fixed table. Unknown commands time out.
pub struct ScriptedSession {
    address: String,
    responses: HashMap<String, Result<String, String>>,
    delay: Duration,
    activity: Arc<Activity>,
    open: bool,
}

#[async_trait]
impl DeviceSession for ScriptedSession {
    async fn run(&mut self, command: &str) -> Result<String, CommandError> {
        if !self.open {
            return Err(CommandError::Closed);
        }
        self.activity
            .commands
            .lock()
            .unwrap()
            .push((self.address.clone(), command.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.responses.get(command) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(output)) => Err(CommandError::Rejected {
                pattern: "% Invalid input".to_string(),
                output: output.clone(),
            }),
            None => Err(CommandError::PromptTimeout(Duration::from_secs(1))),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            self.activity.active.fetch_sub(1, Ordering::SeqCst);
            self.activity.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
