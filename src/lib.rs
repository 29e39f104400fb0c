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

//! boardctl - Control plane for reconfigurable FPGA signal-processing boards.
//!
//! This library talks to the embedded microcontroller on each board over a
//! sequenced request/response protocol on UDP and provides:
//! - 32-bit register (Wishbone bus) access, single-word and chunked bulk
//! - upload of a new FPGA configuration image into staging memory,
//!   checksum-verified, and booting from it
//! - erase/program/verify cycles for the two persistent flash stores
//! - board-level orchestration (reboot, shutdown, reset, liveness probing,
//!   sensor telemetry) and fleet-wide fan-out across many boards
//!
//! # Architecture
//!
//! The layers depend strictly downward:
//! 1. [`protocol::codec`] frames typed requests and replies as big-endian
//!    16-bit words behind a (command id, sequence number) header.
//! 2. [`protocol::channel`] owns the sequence number and the control/fabric
//!    socket pair, and performs send/await/retry/validate.
//! 3. the `wishbone` module builds register access on the channel;
//!    [`transport`] exposes it behind the [`transport::Transport`]
//!    capability trait.
//! 4. [`upload`] and [`flash`] are the two stateful hardware workflows.
//! 5. [`board`] composes everything for one board; [`fleet`] fans an
//!    operation out across many boards.
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`,
//!   `error` or `off`) in binaries that install `env_logger`
//!
//! # Examples
//!
//! ```rust,no_run
//! use boardctl::bitstream::BitstreamImage;
//! use boardctl::board::BoardControl;
//! use boardctl::config::ChannelConfig;
//! use std::path::Path;
//!
//! # fn example() -> Result<(), boardctl::error::BoardctlError> {
//! let mut board = BoardControl::connect(ChannelConfig::for_host("snap07.cluster"))?;
//! let image = BitstreamImage::from_file(Path::new("correlator.fpg"))?;
//! board.upload_engine().program(&image, false)?;
//! let outcome = board.upload_engine().boot_from_uploaded_image()?;
//! println!("boot outcome: {outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod bitstream;
pub mod board;
pub mod config;
pub mod error;
pub mod flash;
pub mod fleet;
pub mod protocol;
pub mod transport;
pub mod upload;

pub(crate) mod wishbone;

pub use bitstream::{BitstreamImage, ImageChecksum, ImageFormat};
pub use board::{BoardControl, FirmwareVersion};
pub use config::ChannelConfig;
pub use error::BoardctlError;
pub use fleet::{DeviceOutcome, FleetOptions, run_on_fleet};
pub use transport::{DatagramTransport, Transport};
pub use upload::BootOutcome;
