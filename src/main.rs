//! CLI entry point for nurdctrl
//!
//! Inspects a running readout controller:
//! - crate list and per-crate records
//! - configuration snapshots, optionally filtered by key prefix
//! - live register values and raw module access
//!
//! `serve-mock` starts a local demo controller to try the other commands
//! against.
//!
//! # Usage
//!
//! ```bash
//! nurdctrl list-crates daq01
//! nurdctrl dump-registers daq01:23546 0 1 firmware
//! nurdctrl --json dump-config daq01 crate.0
//! ```
//!
//! Exit codes: 0 success, 2 connection, 3 protocol, 4 not found,
//! 5 register, 6 hardware, 64 usage.

use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use nurdctrl::config::Settings;
use nurdctrl::logging;
use nurdctrl::model::{AccessOp, ModuleAccess, ModuleAccessRequest, ModuleIndex};
use nurdctrl::server::{ControlServer, Controller, MockController};
use nurdctrl::{
    ControllerAddress, CrateIndex, CtrlClient, CtrlError, RegisterRequest, RegisterScope,
    RegisterSelection, RegisterTarget,
};

#[derive(Parser)]
#[command(name = "nurdctrl", version)]
#[command(about = "Inspect a running nurdlib readout controller", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output on stderr (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the controller answers and speaks our protocol
    Ping {
        /// Controller host, optionally with :port
        host: String,
    },

    /// List crates in the controller's canonical order
    ListCrates {
        /// Controller host, optionally with :port
        host: String,
    },

    /// Show one crate with its modules and register layout
    CrateInfo {
        /// Controller host, optionally with :port
        host: String,
        /// Crate index as printed by list-crates
        crate_index: CrateIndex,
    },

    /// Dump the controller's current configuration
    DumpConfig {
        /// Controller host, optionally with :port
        host: String,
        /// Only keys starting with this prefix, e.g. `crate.0.caen_v775`
        prefix: Option<String>,
        /// One `key = values` line per scalar instead of the block tree
        #[arg(long)]
        flat: bool,
    },

    /// Read live register values of a module or of the crate itself
    DumpRegisters {
        /// Controller host, optionally with :port
        host: String,
        /// Crate index
        crate_index: CrateIndex,
        /// Module index, `J.K` for a sub-module, or `global` for crate registers
        module: RegisterScope,
        /// Register name or offset; all registers when omitted
        register: Option<RegisterSelection>,
    },

    /// Raw reads and writes at module offsets
    ModuleAccess {
        /// Controller host, optionally with :port
        host: String,
        /// Crate index
        crate_index: CrateIndex,
        /// Module index
        module: ModuleIndex,
        /// Accesses as `ofs:bits` (read) or `ofs:bits:value` (write)
        #[arg(required = true)]
        accesses: Vec<ModuleAccess>,
    },

    /// Serve the built-in demo controller until Ctrl+C
    ServeMock {
        /// Listen address, overrides the settings file
        #[arg(long)]
        bind: Option<String>,
    },
}

const EXIT_USAGE: u8 = 64;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("nurdctrl: {e}");
            return ExitCode::from(e.kind().exit_code());
        }
    };

    if let Err(e) = logging::init_from_settings(&settings.logging, cli.verbose) {
        eprintln!("nurdctrl: {e}");
        return ExitCode::from(EXIT_USAGE);
    }

    match run(cli, &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nurdctrl: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Library errors carry their own code; anything else is a plain failure.
fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CtrlError>())
        .map_or(1, |e| e.kind().exit_code())
}

async fn run(cli: Cli, settings: &Settings) -> Result<()> {
    let json = cli.json;
    let host = match &cli.command {
        Commands::ServeMock { bind } => return serve_mock(settings, bind.as_deref()).await,
        Commands::Ping { host }
        | Commands::ListCrates { host }
        | Commands::CrateInfo { host, .. }
        | Commands::DumpConfig { host, .. }
        | Commands::DumpRegisters { host, .. }
        | Commands::ModuleAccess { host, .. } => host.clone(),
    };

    let address = ControllerAddress::parse_with_default_port(&host, settings.client.default_port)
        .map_err(CtrlError::from)?;

    let mut client = CtrlClient::new(settings.client_config());
    client.connect(&address).await?;
    // Close on every path so the controller can drop the session right away.
    let outcome = execute(&mut client, cli.command, json).await;
    client.close().await;
    outcome
}

async fn execute(client: &mut CtrlClient, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Ping { .. } => {
            let info = client.ping().await?;
            if json {
                print_json(&info)?;
            } else {
                println!(
                    "{} is online (protocol {})",
                    info.name, info.protocol_version
                );
            }
        }
        Commands::ListCrates { .. } => {
            let crates = client.list_crates().await?;
            if json {
                print_json(&crates)?;
            } else {
                for summary in &crates {
                    print!("{summary}");
                }
            }
        }
        Commands::CrateInfo { crate_index, .. } => {
            let info = client.crate_info(crate_index).await?;
            emit(json, &info)?;
        }
        Commands::DumpConfig { prefix, flat, .. } => {
            let snapshot = client.dump_config(prefix.as_deref()).await?;
            debug!("snapshot holds {} scalar entries", snapshot.len());
            if json {
                print_json(&snapshot)?;
            } else if flat {
                print!("{}", snapshot.to_flat_string());
            } else {
                print!("{snapshot}");
            }
        }
        Commands::DumpRegisters {
            crate_index,
            module,
            register,
            ..
        } => {
            let request = RegisterRequest {
                target: RegisterTarget {
                    crate_index,
                    scope: module,
                },
                selection: register.unwrap_or(RegisterSelection::All),
            };
            let dump = client.read_registers(&request).await?;
            emit(json, &dump)?;
        }
        Commands::ModuleAccess {
            crate_index,
            module,
            accesses,
            ..
        } => {
            let request = ModuleAccessRequest {
                target: RegisterTarget::module(crate_index, module),
                accesses,
            };
            let values = client.module_access(&request).await?;
            if json {
                print_json(&values)?;
            } else {
                print_accesses(&request.accesses, &values);
            }
        }
        Commands::ServeMock { .. } => anyhow::bail!("serve-mock does not talk to a controller"),
    }
    Ok(())
}

fn print_accesses(accesses: &[ModuleAccess], values: &[u32]) {
    let mut values = values.iter();
    for access in accesses {
        let width = usize::from(access.width.bits() / 4);
        match access.op {
            AccessOp::Read => {
                if let Some(value) = values.next() {
                    println!(
                        "0x{:08x} -> 0x{:0width$x}",
                        access.offset,
                        value,
                        width = width
                    );
                }
            }
            AccessOp::Write(value) => {
                println!(
                    "0x{:08x} <- 0x{:0width$x}",
                    access.offset,
                    value,
                    width = width
                );
            }
        }
    }
}

fn emit<T: Serialize + Display>(json: bool, value: &T) -> Result<()> {
    if json {
        print_json(value)
    } else {
        print!("{value}");
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode JSON output")?;
    println!("{text}");
    Ok(())
}

async fn serve_mock(settings: &Settings, bind: Option<&str>) -> Result<()> {
    let bind = bind.unwrap_or(&settings.server.bind);
    let controller: Arc<dyn Controller> = Arc::new(MockController::demo());
    let server = ControlServer::bind(bind, controller, settings.server_config())
        .await
        .with_context(|| format!("failed to listen on {bind}"))?;
    let handle = server.spawn()?;

    println!("demo controller listening on {}", handle.local_addr());
    println!("press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl+C")?;
    info!("Ctrl+C received");
    handle.shutdown().await;
    Ok(())
}
