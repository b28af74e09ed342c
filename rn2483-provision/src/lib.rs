//! Provisioning of RN2483 LoRaWAN radio modules.
//!
//! The RN2483 is driven over a serial line with plain ASCII commands. This
//! crate writes the ABP device address and session keys, turns adaptive
//! data rate off and saves everything to the module's EEPROM, stopping at
//! the first command the module refuses.

pub mod config;
pub mod credentials;
pub mod error;
pub mod link;
pub mod protocol;
pub mod provisioner;
pub mod sim;
pub mod tracing;

pub use credentials::{DevAddr, DeviceCredentials, SessionKey};
pub use error::{Error, Result};
pub use provisioner::{ProvisioningReport, Provisioner};
