//! Device records and vendor flow selection.

use std::fmt;

use secrecy::SecretString;

use crate::config::InspectionConfig;

/// Management protocol used to reach a device's CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementProtocol {
    Ssh,
    Telnet,
    /// Anything the inventory named that no session adapter speaks.
    Unsupported(String),
}

impl ManagementProtocol {
    /// Parse an inventory protocol cell, case-insensitively.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "ssh" => Self::Ssh,
            "telnet" => Self::Telnet,
            _ => Self::Unsupported(value.trim().to_string()),
        }
    }

    /// Well-known port for the protocol.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Ssh => Some(22),
            Self::Telnet => Some(23),
            Self::Unsupported(_) => None,
        }
    }
}

impl fmt::Display for ManagementProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => f.write_str("ssh"),
            Self::Telnet => f.write_str("telnet"),
            Self::Unsupported(name) => f.write_str(name),
        }
    }
}

/// Login material for one device.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
    /// Privilege elevation secret (e.g. Cisco `enable`).
    pub secret: Option<SecretString>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(SecretString::from(secret.into()));
        self
    }
}

/// One device to inspect. Read-only to the inspection core.
#[derive(Debug)]
pub struct DeviceRecord {
    /// Address used for every connection and for local artifact naming.
    pub address: String,
    pub protocol: ManagementProtocol,
    pub port: u16,
    pub credentials: Credentials,
    /// Declared device-type tag, e.g. `cisco_ios` or `alcatel_aos`.
    pub device_type: String,
    /// Resolved command list for command-list devices.
    pub commands: Vec<String>,
}

impl DeviceRecord {
    /// Create an SSH device on the default port.
    pub fn new(
        address: impl Into<String>,
        device_type: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            address: address.into(),
            protocol: ManagementProtocol::Ssh,
            port: 22,
            credentials,
            device_type: device_type.into(),
            commands: Vec::new(),
        }
    }

    /// Set the protocol and reset the port to its default.
    pub fn with_protocol(mut self, protocol: ManagementProtocol) -> Self {
        if let Some(port) = protocol.default_port() {
            self.port = port;
        }
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Lower-cased, trimmed device-type tag.
    pub fn device_type_key(&self) -> String {
        self.device_type.trim().to_lowercase()
    }
}

/// Which flow a device runs. Decided once per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorFlow {
    /// Trigger an on-device dump, wait, then fetch the named artifacts.
    DiagnosticDump {
        trigger_command: String,
        artifacts: Vec<String>,
    },
    /// Run each command in order and capture the output.
    CommandList { commands: Vec<String> },
}

impl VendorFlow {
    /// Classify a device from its device-type tag.
    pub fn classify(device: &DeviceRecord, config: &InspectionConfig) -> Self {
        if config.is_diagnostic_family(&device.device_type) {
            Self::DiagnosticDump {
                trigger_command: config.diagnostic.trigger_command.clone(),
                artifacts: config.diagnostic.artifacts.clone(),
            }
        } else {
            Self::CommandList {
                commands: device.commands.clone(),
            }
        }
    }

    pub fn kind(&self) -> FlowKind {
        match self {
            Self::DiagnosticDump { .. } => FlowKind::DiagnosticDump,
            Self::CommandList { .. } => FlowKind::CommandList,
        }
    }
}

/// Data-less tag of a [`VendorFlow`], kept in results and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    DiagnosticDump,
    CommandList,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiagnosticDump => f.write_str("diagnostic dump"),
            Self::CommandList => f.write_str("command list"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(device_type: &str) -> DeviceRecord {
        DeviceRecord::new("10.0.0.1", device_type, Credentials::new("admin", "admin"))
            .with_commands(["show version", "show clock"])
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(ManagementProtocol::parse(" SSH "), ManagementProtocol::Ssh);
        assert_eq!(ManagementProtocol::parse("telnet"), ManagementProtocol::Telnet);
        assert_eq!(
            ManagementProtocol::parse("serial"),
            ManagementProtocol::Unsupported("serial".to_string())
        );
        assert_eq!(ManagementProtocol::Telnet.default_port(), Some(23));
        assert_eq!(ManagementProtocol::parse("serial").default_port(), None);
    }

    #[test]
    fn test_with_protocol_resets_port() {
        let record = device("cisco_ios").with_protocol(ManagementProtocol::Telnet);
        assert_eq!(record.port, 23);
        let record = record.with_port(2323);
        assert_eq!(record.port, 2323);
    }

    #[test]
    fn test_classify_diagnostic_dump() {
        let config = InspectionConfig::default();
        let flow = VendorFlow::classify(&device("alcatel_aos"), &config);
        assert_eq!(flow.kind(), FlowKind::DiagnosticDump);
        match flow {
            VendorFlow::DiagnosticDump {
                trigger_command,
                artifacts,
            } => {
                assert_eq!(trigger_command, "show tech-support");
                assert_eq!(artifacts.len(), 3);
            }
            VendorFlow::CommandList { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_classify_command_list() {
        let config = InspectionConfig::default();
        let flow = VendorFlow::classify(&device("cisco_ios"), &config);
        assert_eq!(
            flow,
            VendorFlow::CommandList {
                commands: vec!["show version".to_string(), "show clock".to_string()]
            }
        );
    }

    #[test]
    fn test_device_type_key() {
        let record = device("  Huawei_VRP ");
        assert_eq!(record.device_type_key(), "huawei_vrp");
    }
}
