//! One-shot provisioning of a module.
//!
//! The [`Provisioner`] owns the link to the module. It walks the fixed
//! command table from [`protocol::provisioning_commands`], waiting for each
//! acknowledgment before sending the next command and stopping at the
//! first failure, so a partially configured module is reported with the
//! exact step that broke. Recovery is a fresh run, which starts with a
//! factory reset.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{IdentityCheck, IdentityMode, ProvisionConfig, UplinkTest, DEFAULT_UPLINK_TIMEOUT};
use crate::credentials::DeviceCredentials;
use crate::error::{CommandError, Error, Exchange, Result, StepFailure};
use crate::link::{self, matches_banner, ModuleLink};
use crate::protocol::{self, Command, Reply, Step};
use crate::tracing::prelude::*;

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningReport {
    /// Banner or version string the module identified itself with
    pub identity: Option<String>,
    /// Every command sent, in order, with its acknowledgment
    pub exchanges: Vec<Exchange>,
    /// Steps not sent because their key was absent
    pub skipped: Vec<Step>,
    pub uplink: Option<UplinkReport>,
}

/// Replies to the test uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkReport {
    /// Final reply to `mac join abp`
    pub join: String,
    /// Final reply to `mac tx`, `mac_tx_ok` or a downlink (`mac_rx ...`)
    pub tx: String,
}

pub struct Provisioner<T> {
    link: ModuleLink<T>,
    uplink_timeout: Duration,
}

impl<T> Provisioner<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(link: ModuleLink<T>) -> Self {
        Self {
            link,
            uplink_timeout: DEFAULT_UPLINK_TIMEOUT,
        }
    }

    /// Bound the wait for the delayed replies of join and uplink.
    pub fn with_uplink_timeout(mut self, timeout: Duration) -> Self {
        self.uplink_timeout = timeout;
        self
    }

    /// Confirm the module is what we expect before touching its state.
    ///
    /// Returns the line the module identified itself with, `None` when the
    /// check is skipped.
    pub async fn verify_identity(&mut self, check: &IdentityCheck) -> Result<Option<String>> {
        let received = match check.mode {
            IdentityMode::Skip => {
                debug!("Identity check skipped");
                return Ok(None);
            }
            IdentityMode::Banner => self.link.read_banner().await,
            IdentityMode::Query => match self.link.query_version().await {
                Ok(line) => Some(line),
                Err(e) => {
                    debug!(error = %e, "Version query failed");
                    e.reply().map(str::to_string)
                }
            },
        };

        match received {
            Some(line) if matches_banner(&line, &check.banner) => {
                info!(module = %line, "Module identified");
                Ok(Some(line))
            }
            received => Err(Error::IdentityMismatch {
                expected: check.banner.clone(),
                received,
            }),
        }
    }

    /// Run the provisioning sequence.
    ///
    /// Stops at the first step whose command times out or is refused;
    /// later steps are not sent.
    pub async fn provision(&mut self, creds: &DeviceCredentials) -> Result<ProvisioningReport> {
        let mut report = ProvisioningReport::default();

        for (step, command) in protocol::provisioning_commands(creds) {
            let Some(command) = command else {
                warn!(step = %step, "Key not configured, step skipped");
                report.skipped.push(step);
                continue;
            };

            debug!(step = %step, number = step.number(), command = %command, "Sending");
            match self.link.send_command(&command).await {
                Ok(reply) => {
                    info!(step = %step, number = step.number(), reply = %reply, "Acknowledged");
                    report.exchanges.push(Exchange {
                        step,
                        command: command.redacted().to_string(),
                        reply,
                    });
                }
                Err(error) => {
                    error!(
                        step = %step,
                        number = step.number(),
                        command = %command,
                        error = %error,
                        "Provisioning stopped"
                    );
                    return Err(Error::Step(Box::new(StepFailure {
                        step,
                        command: command.redacted().to_string(),
                        error,
                        completed: report.exchanges,
                    })));
                }
            }
        }

        info!(
            commands = report.exchanges.len(),
            skipped = report.skipped.len(),
            "Module provisioned"
        );
        Ok(report)
    }

    /// Join with the saved ABP keys and send one unconfirmed frame.
    pub async fn test_uplink(&mut self, test: &UplinkTest) -> Result<UplinkReport> {
        let join = self
            .two_stage(&Command::join_abp(), |line| line == "accepted")
            .await?;
        info!(reply = %join, "Joined");

        let tx = self
            .two_stage(&Command::tx_uncnf(test.port, &test.payload), |line| {
                line == "mac_tx_ok" || line.starts_with("mac_rx")
            })
            .await?;
        info!(reply = %tx, port = test.port, "Test uplink sent");

        Ok(UplinkReport { join, tx })
    }

    // Commands that answer `ok` at once and their outcome once the radio
    // is done.
    async fn two_stage(
        &mut self,
        command: &Command,
        accept: impl Fn(&str) -> bool,
    ) -> Result<String> {
        let fail = |source: CommandError| Error::Command {
            command: command.redacted().to_string(),
            source,
        };

        self.link.send_command(command).await.map_err(fail)?;
        let line = self
            .link
            .read_line_within(self.uplink_timeout)
            .await
            .map_err(fail)?;
        if accept(line.trim()) && !matches!(Reply::classify(&line), Reply::Error(_)) {
            Ok(line)
        } else {
            Err(fail(CommandError::Rejected(line)))
        }
    }

    /// Identify, provision and optionally test, then release the link.
    ///
    /// Consumes the provisioner so the underlying port is closed on every
    /// path out of this function.
    pub async fn run(mut self, config: &ProvisionConfig) -> Result<ProvisioningReport> {
        let identity = self.verify_identity(&config.identity).await?;
        let mut report = self.provision(&config.credentials).await?;
        report.identity = identity;
        if let Some(test) = &config.uplink {
            report.uplink = Some(self.test_uplink(test).await?);
        }
        Ok(report)
    }
}

/// Open the configured serial port and run the whole procedure on it.
pub async fn provision_port(config: &ProvisionConfig) -> Result<ProvisioningReport> {
    let port = link::connect(&config.connection)?;
    info!(port = %config.connection.port, baud = config.connection.baud, "Serial port open");

    let provisioner = Provisioner::new(ModuleLink::new(port, config.connection.timeout))
        .with_uplink_timeout(config.connection.uplink_timeout);
    let result = provisioner.run(config).await;
    debug!(port = %config.connection.port, "Serial port closed");
    result
}
