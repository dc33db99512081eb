// Main binary that runs one virtual BMC per configured VM
use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use ovirtbmc_bmc::{BmcConfig, BmcFleet, SessionExit, DEFAULT_CONFIG_PATH};
use ovirtbmc_ovirt::OvirtClient;
use std::io::stderr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Virtual IPMI BMCs for oVirt virtual machines", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "OVIRTBMC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long, default_value_t = false)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG wins over the defaults
    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "ovirtbmc={level},ovirtbmc_bmc={level},ovirtbmc_ovirt={level},ovirtbmc_ipmi={level},hyper=warn,reqwest=warn,rustls=warn",
        level = level
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let config = BmcConfig::load(&cli.config)
        .wrap_err_with(|| format!("Failed to load {}", cli.config.display()))?;
    info!(
        path = %cli.config.display(),
        instances = config.instances.len(),
        "Configuration loaded"
    );

    if cli.check {
        for instance in &config.instances {
            info!(vm = %instance.vm_name, addr = %instance.bind_addr(), "BMC entry");
        }
        println!("{}: OK ({} BMC entries)", cli.config.display(), config.instances.len());
        return Ok(());
    }

    let client = OvirtClient::connect(config.ovirt_config())
        .await
        .wrap_err("Failed to connect to the oVirt engine")?;

    let mut fleet = BmcFleet::build(&config.instances, Arc::new(client), &config.lookup_policy())
        .await
        .wrap_err("No BMC could be started")?;
    for failure in fleet.failures() {
        warn!(error = %failure, "BMC entry skipped");
    }
    fleet.start_all();

    let stop = fleet.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, stopping BMCs..."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, stopping BMCs"),
        }
        stop.stop();
    });

    let reports = fleet.await_all().await;
    let mut failed = 0;
    for report in &reports {
        match &report.exit {
            SessionExit::Shutdown => info!(vm = %report.vm_name, "BMC stopped"),
            SessionExit::ColdReset => info!(vm = %report.vm_name, "BMC stopped by cold reset"),
            SessionExit::Failed(reason) => {
                error!(vm = %report.vm_name, reason = %reason, "BMC failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(eyre!("{} of {} BMC sessions failed", failed, reports.len()));
    }
    info!("All BMCs stopped");
    Ok(())
}
