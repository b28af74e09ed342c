//! Command-line front end for provisioning RN2483 modules.
//!
//! Resolves the configuration, runs the provisioning sequence on the serial
//! port (or on a simulated module with `--dry-run`) and prints what was
//! sent and what the module answered. On failure the step that broke and
//! the module's raw reply are printed; re-running starts over from a
//! factory reset.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;

use rn2483_provision::config::{Cli, IdentityMode, ProvisionConfig};
use rn2483_provision::error::{Error, Exchange};
use rn2483_provision::link::ModuleLink;
use rn2483_provision::provisioner::{self, ProvisioningReport, Provisioner};
use rn2483_provision::sim::{SimulatedModule, SIM_VERSION};
use rn2483_provision::tracing::{self, prelude::*};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing::init_journald_or_stderr(cli.verbose);

    let file = cli.file_config().context("loading configuration file")?;
    let config = ProvisionConfig::resolve(&cli, file).context("invalid configuration")?;

    let result = if cli.dry_run {
        dry_run(&config).await
    } else {
        provisioner::provision_port(&config).await
    };

    match result {
        Ok(report) => {
            print_report(&report);
            info!("Done.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_failure(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn dry_run(config: &ProvisionConfig) -> rn2483_provision::Result<ProvisioningReport> {
    warn!("Dry run: talking to a simulated module, nothing is written to hardware");
    let mut module = SimulatedModule::rn2483();
    if config.identity.mode == IdentityMode::Banner {
        module = module.with_banner(SIM_VERSION);
    }
    let (host, _task) = module.spawn();
    Provisioner::new(ModuleLink::new(host, config.connection.timeout))
        .with_uplink_timeout(config.connection.uplink_timeout)
        .run(config)
        .await
}

fn print_exchanges(exchanges: &[Exchange]) {
    for exchange in exchanges {
        println!(
            "  {}. {:<14} {:<50} -> {}",
            exchange.step.number(),
            exchange.step.to_string(),
            exchange.command,
            exchange.reply
        );
    }
}

fn print_report(report: &ProvisioningReport) {
    if let Some(identity) = &report.identity {
        println!("module: {}", identity);
    }
    print_exchanges(&report.exchanges);
    for step in &report.skipped {
        println!("  {}. {:<14} skipped (key not configured)", step.number(), step.to_string());
    }
    if let Some(uplink) = &report.uplink {
        println!("test uplink: join {}, tx {}", uplink.join, uplink.tx);
    }
    println!("provisioning complete");
}

fn print_failure(error: &Error) {
    eprintln!("error: {}", error);
    if let Some(failure) = error.step_failure() {
        if !failure.completed.is_empty() {
            eprintln!("completed before the failure:");
            for exchange in &failure.completed {
                eprintln!(
                    "  {}. {} -> {}",
                    exchange.step.number(),
                    exchange.command,
                    exchange.reply
                );
            }
        }
        match failure.error.reply() {
            Some(reply) => eprintln!("module reply: {}", reply),
            None => eprintln!("module reply: none"),
        }
        eprintln!("the module may be partially configured; run again to start over from a factory reset");
    }
}
