// This file is part of boardctl, a control-plane library for FPGA-based signal-processing boards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// boardctl is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// boardctl is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

use boardctl::bitstream::BitstreamImage;
use boardctl::board::BoardControl;
use boardctl::config::{CONTROL_PORT, ChannelConfig, FABRIC_PORT};
use boardctl::error::BoardctlError;
use boardctl::fleet::{DeviceOutcome, FleetOptions, run_on_fleet};
use clap::{Parser, Subcommand};
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "board")]
#[command(bin_name = "board")]
struct Cli {
    #[arg(
        long = "host",
        required = true,
        help = "board hostname or address; repeat the flag to run against a fleet"
    )]
    hosts: Vec<String>,
    #[arg(long, default_value_t = CONTROL_PORT)]
    control_port: u16,
    #[arg(long, default_value_t = FABRIC_PORT)]
    fabric_port: u16,
    #[arg(long, default_value_t = 1500, help = "per-exchange receive timeout")]
    timeout_ms: u64,
    #[arg(long, default_value_t = 3, help = "transmissions per exchange before giving up")]
    retries: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report liveness and firmware version of each board.
    Status,
    /// Upload a configuration image to staging memory, optionally boot it.
    Upload {
        file: PathBuf,
        #[arg(long, help = "read the staged image back in full (slow)")]
        verify: bool,
        #[arg(long, help = "boot the staged image after upload")]
        boot: bool,
    },
    /// Program the word-addressed NOR flash store.
    FlashNor {
        file: PathBuf,
        #[arg(long, default_value_t = 0, help = "start word address")]
        addr: u32,
        #[arg(long)]
        verify: bool,
    },
    /// Program the page-addressed SPI flash store.
    FlashSpi {
        file: PathBuf,
        #[arg(long)]
        verify: bool,
    },
    /// Reconfigure each board from its flashed image.
    Reboot,
    /// Power each board down.
    Shutdown,
    /// Pulse each board's FPGA logic reset.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");

    let configs: Vec<ChannelConfig> = cli
        .hosts
        .iter()
        .map(|host| ChannelConfig {
            host: host.clone(),
            control_port: cli.control_port,
            fabric_port: cli.fabric_port,
            timeout: Duration::from_millis(cli.timeout_ms),
            max_retries: cli.retries,
            ..Default::default()
        })
        .collect();

    match cli.command {
        Commands::Status => {
            run(configs, |config| {
                let mut board = BoardControl::connect(config)?;
                let fv = board.firmware_version()?;
                let source = if fv.golden_image {
                    " (golden fallback)"
                } else if fv.multiboot {
                    " (multiboot fallback)"
                } else {
                    ""
                };
                Ok(format!("alive, firmware {}.{}{source}", fv.major, fv.minor))
            })
            .await
        }
        Commands::Upload { file, verify, boot } => {
            let image = match BitstreamImage::from_file(&file) {
                Ok(image) => Arc::new(image),
                Err(e) => {
                    eprintln!("{e}");
                    return ExitCode::FAILURE;
                }
            };
            run(configs, move |config| {
                let mut board = BoardControl::connect(config)?;
                board.upload_engine().program(&image, verify)?;
                if boot {
                    let outcome = board.upload_engine().boot_from_uploaded_image()?;
                    Ok(format!("uploaded and booted: {outcome:?}"))
                } else {
                    Ok("uploaded".to_string())
                }
            })
            .await
        }
        Commands::FlashNor { file, addr, verify } => {
            let data = match std::fs::read(&file) {
                Ok(data) => Arc::new(data),
                Err(e) => {
                    eprintln!("failed to read {file:?}: {e}");
                    return ExitCode::FAILURE;
                }
            };
            run(configs, move |config| {
                let mut board = BoardControl::connect(config)?;
                board.flash_engine().program_nor(addr, &data, verify)?;
                Ok("NOR store programmed".to_string())
            })
            .await
        }
        Commands::FlashSpi { file, verify } => {
            let data = match std::fs::read(&file) {
                Ok(data) => Arc::new(data),
                Err(e) => {
                    eprintln!("failed to read {file:?}: {e}");
                    return ExitCode::FAILURE;
                }
            };
            run(configs, move |config| {
                let mut board = BoardControl::connect(config)?;
                board.flash_engine().program_spi(&data, verify)?;
                Ok("SPI store programmed".to_string())
            })
            .await
        }
        Commands::Reboot => {
            run(configs, |config| {
                let mut board = BoardControl::connect(config)?;
                board.reboot()?;
                Ok("reboot requested".to_string())
            })
            .await
        }
        Commands::Shutdown => {
            run(configs, |config| {
                let mut board = BoardControl::connect(config)?;
                board.shutdown()?;
                Ok("shutdown requested".to_string())
            })
            .await
        }
        Commands::Reset => {
            run(configs, |config| {
                let mut board = BoardControl::connect(config)?;
                board.reset_logic()?;
                Ok("logic reset".to_string())
            })
            .await
        }
    }
}

/// Fan the operation out (a single host is a fleet of one), print per-host
/// results and fold them into a process exit code.
async fn run<F>(configs: Vec<ChannelConfig>, op: F) -> ExitCode
where
    F: Fn(ChannelConfig) -> Result<String, BoardctlError> + Send + Sync + 'static,
{
    let outcomes = run_on_fleet(configs, FleetOptions::default(), op).await;
    let mut hosts: Vec<&String> = outcomes.keys().collect();
    hosts.sort();
    let mut all_ok = true;
    for host in hosts {
        match &outcomes[host] {
            DeviceOutcome::Ok(message) => println!("{host}: {message}"),
            DeviceOutcome::Failed(e) => {
                all_ok = false;
                eprintln!("{host}: {e}");
            }
            DeviceOutcome::Unresponsive => {
                all_ok = false;
                eprintln!("{host}: unresponsive");
            }
        }
    }
    if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
