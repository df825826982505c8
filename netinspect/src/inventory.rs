//! JSON device inventory.
//!
//! ```json
//! {
//!   "devices": [
//!     { "address": "10.0.0.1", "protocol": "ssh", "port": 22,
//!       "username": "admin", "password": "pw", "secret": "en",
//!       "device_type": "cisco_ios" },
//!     { "mark": "#", "address": "10.0.0.2", "device_type": "huawei" }
//!   ],
//!   "commands": {
//!     "cisco_ios": ["show version", "# show tech", "show clock"]
//!   }
//! }
//! ```
//!
//! Devices marked `#` and commands starting with `#` are skipped. Command
//! lists are looked up by the lower-cased, trimmed device type.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};
use serde::Deserialize;

use crate::device::{Credentials, DeviceRecord, ManagementProtocol};
use crate::error::{Error, Result};

const EXCLUDE_MARK: &str = "#";

/// Inventory file as stored on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InventoryFile {
    pub devices: Vec<InventoryRow>,
    /// Command lists keyed by device type.
    pub commands: HashMap<String, Vec<String>>,
}

/// One device row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InventoryRow {
    /// `#` excludes the row.
    pub mark: Option<String>,
    #[serde(alias = "ip")]
    pub address: String,
    pub protocol: Option<String>,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub secret: Option<String>,
    pub device_type: String,
}

/// Read and resolve an inventory file.
pub async fn load_inventory(path: &Path) -> Result<Vec<DeviceRecord>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Inventory {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
    parse_inventory(&text)
}

/// Resolve inventory JSON into device records.
pub fn parse_inventory(text: &str) -> Result<Vec<DeviceRecord>> {
    let file: InventoryFile = serde_json::from_str(text).map_err(|e| Error::Inventory {
        message: format!("invalid inventory: {e}"),
    })?;

    let commands: HashMap<String, Vec<String>> = file
        .commands
        .into_iter()
        .map(|(device_type, list)| (device_type.trim().to_lowercase(), clean_commands(list)))
        .collect();

    let mut devices = Vec::new();
    for row in file.devices {
        if row.mark.as_deref().map(str::trim) == Some(EXCLUDE_MARK) {
            debug!("Skipping excluded device {}", row.address);
            continue;
        }
        let address = row.address.trim();
        if address.is_empty() {
            warn!("Skipping inventory row without an address");
            continue;
        }

        let device_type = row.device_type.trim().to_string();
        let key = device_type.to_lowercase();
        let device_commands = match commands.get(&key) {
            Some(list) => list.clone(),
            None => {
                if !key.is_empty() {
                    warn!(
                        "{}: no command list for device type '{}', using an empty list",
                        address, device_type
                    );
                }
                Vec::new()
            }
        };

        let mut credentials = Credentials::new(row.username.trim(), row.password);
        if let Some(secret) = row.secret.filter(|s| !s.is_empty()) {
            credentials = credentials.with_secret(secret);
        }

        let protocol = row
            .protocol
            .as_deref()
            .map(ManagementProtocol::parse)
            .unwrap_or(ManagementProtocol::Ssh);
        let mut device = DeviceRecord::new(address, device_type, credentials)
            .with_protocol(protocol)
            .with_commands(device_commands);
        if let Some(port) = row.port {
            device = device.with_port(port);
        }
        devices.push(device);
    }

    debug!("Inventory resolved to {} devices", devices.len());
    Ok(devices)
}

fn clean_commands(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && !c.starts_with(EXCLUDE_MARK))
        .collect()
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    const INVENTORY: &str = r##"{
        "devices": [
            { "mark": "1", "ip": "10.0.0.1", "protocol": "ssh", "port": 2222,
              "username": "admin", "password": "pw", "secret": "en",
              "device_type": "Cisco_IOS " },
            { "mark": "#", "address": "10.0.0.2", "device_type": "huawei" },
            { "address": "10.0.0.3", "protocol": "telnet", "username": "u",
              "password": "p", "secret": "", "device_type": "huawei" },
            { "address": "10.0.0.4", "device_type": "alcatel_aos" },
            { "address": "  ", "device_type": "cisco_ios" }
        ],
        "commands": {
            "cisco_ios": ["show version", "# show tech-support", "", " show clock "]
        }
    }"##;

    #[test]
    fn test_parse_inventory() {
        let devices = parse_inventory(INVENTORY).unwrap();
        let addresses: Vec<_> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4"]);

        let cisco = &devices[0];
        assert_eq!(cisco.port, 2222);
        assert_eq!(cisco.protocol, ManagementProtocol::Ssh);
        assert_eq!(cisco.device_type, "Cisco_IOS");
        assert_eq!(cisco.commands, vec!["show version", "show clock"]);
        assert_eq!(
            cisco.credentials.secret.as_ref().map(|s| s.expose_secret()),
            Some("en")
        );

        let huawei = &devices[1];
        assert_eq!(huawei.protocol, ManagementProtocol::Telnet);
        assert_eq!(huawei.port, 23);
        assert!(huawei.commands.is_empty());
        assert!(huawei.credentials.secret.is_none());

        let ale = &devices[2];
        assert_eq!(ale.port, 22);
        assert!(ale.commands.is_empty());
    }

    #[test]
    fn test_invalid_json_is_inventory_error() {
        let err = parse_inventory("{ devices: ").unwrap_err();
        assert!(matches!(err, Error::Inventory { .. }));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = load_inventory(Path::new("/nonexistent/devices.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("devices.json");
        std::fs::write(&path, INVENTORY).unwrap();
        assert_eq!(load_inventory(&path).await.unwrap().len(), 3);
    }
}
