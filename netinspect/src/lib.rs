//! # netinspect
//!
//! Concurrent bulk inspection of network devices.
//!
//! For every device in an inventory, netinspect opens a management session
//! (SSH or Telnet), runs either the vendor's command list or an on-device
//! diagnostic dump, and collects the evidence under one timestamped run
//! directory. Dump files are fetched through a fallback chain of transports
//! (SCP, FTP, TFTP, then in-band viewing commands), stopping at the first
//! that works.
//!
//! ## Features
//!
//! - Bounded worker pool; one device's failure never affects another
//! - Prompt-driven CLI sessions via russh or plain Telnet
//! - Vendor profiles for Cisco, Huawei, H3C, Ruijie, Juniper, Arista, ALE and others
//! - Built-in TFTP client
//! - Per-device and summary zip archives, mailed over SMTP or logged
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use netinspect::{InspectionConfig, Orchestrator, load_inventory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), netinspect::Error> {
//!     let config = InspectionConfig::load(Some(Path::new("netinspect.toml")))?;
//!     let devices = load_inventory(Path::new("devices.json")).await?;
//!
//!     let report = Orchestrator::new(config).run(devices).await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod device;
pub mod error;
pub mod inspect;
pub mod inventory;
pub mod layout;
pub mod notify;
pub mod orchestrator;
pub mod session;
pub mod tftp;
pub mod transfer;

// Re-export main types for convenience
pub use config::InspectionConfig;
pub use device::{Credentials, DeviceRecord, FlowKind, ManagementProtocol, VendorFlow};
pub use error::{Error, Result};
pub use inspect::{InspectionResult, InspectionState, Inspector};
pub use inventory::{load_inventory, parse_inventory};
pub use layout::RunLayout;
pub use notify::{LogNotifier, Notifier, SmtpNotifier};
pub use orchestrator::{InspectionReport, Orchestrator};
pub use tftp::TftpClient;
pub use transfer::{FallbackChain, RetrievalOutcome, TransportKind};
