//! Configuration management for rn2483-provision.
//!
//! Settings come from, in decreasing order of precedence: command-line
//! flags, environment variables (`RN2483_*`), a TOML file, and built-in
//! defaults. Session keys are best passed through the environment so they
//! never land in shell history or a committed file.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 57600
//! timeout_ms = 2000
//!
//! [device]
//! devaddr = "02011100"
//!
//! [identity]
//! mode = "query"
//! banner = "RN2483"
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::DeviceCredentials;
use crate::error::{Error, Result};

/// Default serial device.
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// The RN2483 UART runs at 57600 baud out of reset.
pub const DEFAULT_BAUD: u32 = 57600;

/// Wait for each reply line. `sys factoryRESET` is the slowest command,
/// answering once the module has rebooted.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for the second reply of `mac join` and `mac tx`, which only comes
/// after the radio transmission and both receive windows.
pub const DEFAULT_UPLINK_TIMEOUT: Duration = Duration::from_secs(30);

/// Expected start of the module's banner and version string.
pub const DEFAULT_BANNER: &str = "RN2483";

/// Default LoRaWAN application port for the test uplink.
pub const DEFAULT_UPLINK_PORT: u8 = 1;

/// Serial connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Serial device path
    pub port: String,
    pub baud: u32,
    /// Bound on the wait for each reply line
    pub timeout: Duration,
    /// Bound on the wait for the delayed reply of an uplink
    pub uplink_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            uplink_timeout: DEFAULT_UPLINK_TIMEOUT,
        }
    }
}

/// How the module's identity is confirmed before anything is written.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IdentityMode {
    /// Send `sys get ver` and check the reply
    #[default]
    Query,
    /// Read the banner printed at power-up
    Banner,
    /// Do not check
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCheck {
    pub mode: IdentityMode,
    pub banner: String,
}

impl Default for IdentityCheck {
    fn default() -> Self {
        Self {
            mode: IdentityMode::default(),
            banner: DEFAULT_BANNER.to_string(),
        }
    }
}

/// Frame sent after provisioning to check the keys against the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkTest {
    pub port: u8,
    pub payload: Vec<u8>,
}

/// Everything needed for one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    pub connection: ConnectionConfig,
    pub credentials: DeviceCredentials,
    pub identity: IdentityCheck,
    pub uplink: Option<UplinkTest>,
}

/// Contents of the TOML configuration file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub uplink: UplinkSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SerialSection {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub uplink_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    pub devaddr: Option<String>,
    pub appskey: Option<String>,
    pub nwkskey: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySection {
    pub mode: Option<IdentityMode>,
    pub banner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UplinkSection {
    pub port: Option<u8>,
    /// Hex-encoded frame payload
    pub payload: Option<String>,
}

impl FileConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }
}

/// Program a Microchip RN2483 LoRaWAN module with ABP session keys
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rn2483-provision", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "RN2483_CONFIG")]
    pub config: Option<PathBuf>,

    /// Serial device the module is attached to
    #[arg(short, long, env = "RN2483_PORT")]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, env = "RN2483_BAUD")]
    pub baud: Option<u32>,

    /// Reply timeout per command, in milliseconds
    #[arg(long, env = "RN2483_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Device address (8 hex digits)
    #[arg(long, env = "RN2483_DEVADDR")]
    pub devaddr: Option<String>,

    /// Application session key (32 hex digits); empty to leave unset
    #[arg(long, env = "RN2483_APPSKEY", hide_env_values = true)]
    pub appskey: Option<String>,

    /// Network session key (32 hex digits); empty to leave unset
    #[arg(long, env = "RN2483_NWKSKEY", hide_env_values = true)]
    pub nwkskey: Option<String>,

    /// How to confirm the module's identity before writing to it
    #[arg(long, value_enum, env = "RN2483_IDENTITY")]
    pub identity: Option<IdentityMode>,

    /// Expected start of the module banner
    #[arg(long, env = "RN2483_BANNER")]
    pub banner: Option<String>,

    /// After saving, join (ABP) and send this hex payload as a test uplink
    #[arg(long, value_name = "HEX")]
    pub test_uplink: Option<String>,

    /// Application port for the test uplink
    #[arg(long, value_name = "PORT")]
    pub uplink_port: Option<u8>,

    /// Run against a simulated module instead of the serial port
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Load the configuration file named by `--config`, if any.
    pub fn file_config(&self) -> Result<FileConfig> {
        match &self.config {
            Some(path) => FileConfig::load_from(path),
            None => Ok(FileConfig::default()),
        }
    }
}

fn millis(value: Option<u64>, default: Duration, name: &str) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(0) => Err(Error::Config(format!("{} must be greater than zero", name))),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn uplink_port(port: u8) -> Result<u8> {
    // LoRaWAN application ports; 0 carries MAC commands, 224+ are reserved.
    if (1..=223).contains(&port) {
        Ok(port)
    } else {
        Err(Error::Config(format!(
            "uplink port must be between 1 and 223, got {}",
            port
        )))
    }
}

impl ProvisionConfig {
    /// Merge command-line values (which already include the environment)
    /// over the file and the defaults, and validate the result.
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let connection = ConnectionConfig {
            port: cli
                .port
                .clone()
                .or(file.serial.port)
                .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            baud: match cli.baud.or(file.serial.baud).unwrap_or(DEFAULT_BAUD) {
                0 => return Err(Error::Config("baud must be greater than zero".into())),
                baud => baud,
            },
            timeout: millis(
                cli.timeout_ms.or(file.serial.timeout_ms),
                DEFAULT_TIMEOUT,
                "timeout_ms",
            )?,
            uplink_timeout: millis(
                file.serial.uplink_timeout_ms,
                DEFAULT_UPLINK_TIMEOUT,
                "uplink_timeout_ms",
            )?,
        };

        let devaddr = cli.devaddr.clone().or(file.device.devaddr).unwrap_or_default();
        let appskey = cli.appskey.clone().or(file.device.appskey).unwrap_or_default();
        let nwkskey = cli.nwkskey.clone().or(file.device.nwkskey).unwrap_or_default();
        let credentials = DeviceCredentials::parse(&devaddr, &appskey, &nwkskey)?;

        let identity = IdentityCheck {
            mode: cli.identity.or(file.identity.mode).unwrap_or_default(),
            banner: cli
                .banner
                .clone()
                .or(file.identity.banner)
                .unwrap_or_else(|| DEFAULT_BANNER.to_string()),
        };
        if identity.mode != IdentityMode::Skip && identity.banner.trim().is_empty() {
            return Err(Error::Config("identity banner must not be empty".into()));
        }

        let uplink = match cli.test_uplink.clone().or(file.uplink.payload) {
            None => None,
            Some(text) => {
                let payload = hex::decode(text.trim()).map_err(|e| {
                    Error::Config(format!("test uplink payload is not hex: {}", e))
                })?;
                if payload.is_empty() {
                    return Err(Error::Config("test uplink payload is empty".into()));
                }
                let port = cli
                    .uplink_port
                    .or(file.uplink.port)
                    .unwrap_or(DEFAULT_UPLINK_PORT);
                Some(UplinkTest {
                    port: uplink_port(port)?,
                    payload,
                })
            }
        };

        Ok(Self {
            connection,
            credentials,
            identity,
            uplink,
        })
    }
}
