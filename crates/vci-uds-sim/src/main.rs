//! vci-uds simulator
//!
//! Runs a scripted diagnostic session against simulated ECUs on an
//! in-process bus and logs every result.
//!
//! # Usage
//!
//! ```bash
//! ./vci-uds-sim
//! ./vci-uds-sim --config sim.toml --frame-log frames.log --verbose
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vci_uds::{ResultCode, Service, UdsResponse};
use vci_uds_sim::{SimBus, SimConfig};

#[derive(Parser, Debug)]
#[command(name = "vci-uds-sim")]
#[command(about = "Run a UDS session against simulated ECUs")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write every bus frame to this file
    #[arg(long)]
    frame_log: Option<PathBuf>,

    /// Simulated bus latency in milliseconds
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,

    /// How long to keep the session alive with Tester Present, in milliseconds
    #[arg(long, default_value_t = 0)]
    keep_alive_ms: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "vci_uds=debug,vci_uds_sim=debug"
    } else {
        "vci_uds=info,vci_uds_sim=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            SimConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => SimConfig::default(),
    };

    let bus = SimBus::from_config(&config)
        .context("Failed to build simulated bus")?
        .with_latency(Duration::from_millis(args.latency_ms));
    let service = Service::builder(Arc::new(bus))
        .context(config.tester.clone())
        .security_config(config.tester_security())
        .build()
        .context("Invalid tester session")?;

    if let Some(path) = &args.frame_log {
        let text = format!("enabled = true\npath = {:?}\n", path.display().to_string());
        expect_ok("frame log", service.set_log_config(&text))?;
    }

    run_session(&service, args.keep_alive_ms)?;

    service.shutdown();
    info!("Session finished");
    Ok(())
}

fn run_session(service: &Service, keep_alive_ms: u64) -> Result<()> {
    report("DiagnosticSessionControl (extended)", service.request_sync(&[0x10, 0x03]));
    report("ReadDataByIdentifier VIN", service.request_sync(&[0x22, 0xF1, 0x90]));
    report("SecurityAccess level 1", service.security_access(1));
    report("SecurityAccess level 1 again", service.security_access(1));
    report(
        "RoutineControl (with response pending)",
        service.request_sync(&[0x31, 0x01, 0xFF, 0x00]),
    );

    // Queue a batch and collect the results from the worker
    let batch: [&[u8]; 3] = [&[0x22, 0xF1, 0x87], &[0x22, 0xF1, 0x90], &[0x22, 0x12, 0x34]];
    for request in batch {
        expect_ok("async request", service.request_async(request))?;
    }
    for _ in batch {
        report("async result", service.read_response(Duration::from_secs(5)));
    }

    expect_ok("functional request", service.request_functional(&[0x3E, 0x00]))?;
    match service.read_functional_responses(16, Duration::from_secs(5)) {
        Ok(responses) => {
            for response in responses {
                info!(
                    source = format_args!("0x{:X}", response.source_id),
                    payload = %hex::encode_upper(&response.payload),
                    "Functional response"
                );
            }
        }
        Err(code) => warn!(result = %code, "No functional responses"),
    }

    if keep_alive_ms > 0 {
        expect_ok("keep-alive", service.start_keep_alive())?;
        info!(duration_ms = keep_alive_ms, "Holding session with Tester Present");
        std::thread::sleep(Duration::from_millis(keep_alive_ms));
        service.stop_keep_alive();
    }

    report("ECUReset (hard)", service.request_sync(&[0x11, 0x01]));
    Ok(())
}

fn report(label: &str, response: UdsResponse) {
    if response.is_ok() {
        info!(
            request = label,
            payload = %hex::encode_upper(&response.payload),
            "OK"
        );
    } else {
        warn!(
            request = label,
            result = %response.result_code,
            code = i32::from(response.result_code),
            payload = %hex::encode_upper(&response.payload),
            "Failed"
        );
    }
}

fn expect_ok(what: &str, code: ResultCode) -> Result<()> {
    if code.is_ok() {
        Ok(())
    } else {
        anyhow::bail!("{} failed: {} ({})", what, code, i32::from(code))
    }
}
