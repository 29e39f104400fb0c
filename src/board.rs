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

//! Board-level orchestration: reboot, shutdown, logic reset, liveness and
//! telemetry, composing the transport and the two engines.

use crate::config::{
    BOOT_STATUS_ADDR, ChannelConfig, FIRMWARE_VERSION_ADDR, PROBE_RETRIES, TELEMETRY_BASE_ADDR,
    TELEMETRY_WORDS,
};
use crate::error::BoardctlError;
use crate::flash::FlashProgrammingEngine;
use crate::protocol::codec::{BoardReg, ReadWishboneReq, WriteBoardRegReq};
use crate::transport::DatagramTransport;
use crate::upload::ImageUploadEngine;
use crate::wishbone;
use log::{debug, info};
use std::time::{Duration, Instant};

/// Run `probe` every `interval` until it returns true or `max_wait` has
/// elapsed. Returns whether the probe ever succeeded. The probe runs at
/// least once, immediately.
pub fn poll_until(
    interval: Duration,
    max_wait: Duration,
    mut probe: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() + interval > deadline {
            return false;
        }
        std::thread::sleep(interval);
    }
}

/// Decoded contents of the identity/version and boot-status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    /// The board fell back to the failsafe golden image.
    pub golden_image: bool,
    /// The board booted the secondary multiboot image.
    pub multiboot: bool,
}

/// One board, reached over the datagram transport.
#[derive(Debug)]
pub struct BoardControl {
    transport: DatagramTransport,
}

impl BoardControl {
    /// Open a control session to the board described by `config`.
    pub fn connect(config: ChannelConfig) -> Result<Self, BoardctlError> {
        Ok(BoardControl {
            transport: DatagramTransport::connect(config)?,
        })
    }

    /// The underlying transport, for register access through
    /// [`crate::transport::Transport`].
    pub fn transport_mut(&mut self) -> &mut DatagramTransport {
        &mut self.transport
    }

    /// The image upload engine for this board.
    pub fn upload_engine(&mut self) -> ImageUploadEngine<'_> {
        ImageUploadEngine::new(&mut self.transport)
    }

    /// The flash programming engine for this board.
    pub fn flash_engine(&mut self) -> FlashProgrammingEngine<'_> {
        FlashProgrammingEngine::new(&mut self.transport)
    }

    /// Reconfigure the FPGA from the currently flashed image. Distinct from
    /// [`ImageUploadEngine::boot_from_uploaded_image`], which boots staging
    /// memory. The board drops off the network while reconfiguring, so no
    /// response is expected.
    pub fn reboot(&mut self) -> Result<(), BoardctlError> {
        info!("rebooting from flashed image");
        self.transport.channel.send_no_reply(&WriteBoardRegReq {
            reg: BoardReg::RebootFromFlash,
            data: 1,
        })
    }

    /// Power the board down. The controller cuts power before it could
    /// answer, so no response is expected.
    pub fn shutdown(&mut self) -> Result<(), BoardctlError> {
        info!("shutting board down");
        self.transport.channel.send_no_reply(&WriteBoardRegReq {
            reg: BoardReg::Shutdown,
            data: 1,
        })
    }

    /// Pulse the FPGA logic reset line.
    pub fn reset_logic(&mut self) -> Result<(), BoardctlError> {
        info!("resetting FPGA logic");
        self.transport
            .channel
            .exchange(&WriteBoardRegReq {
                reg: BoardReg::LogicReset,
                data: 1,
            })
            .map(|_| ())
    }

    /// Connectivity check: one read of the identity/version register with
    /// its own small retry budget, independent of the general exchange
    /// policy.
    pub fn is_alive(&mut self) -> bool {
        let alive = self
            .transport
            .channel
            .exchange_with_budget(
                &ReadWishboneReq {
                    addr: FIRMWARE_VERSION_ADDR,
                },
                PROBE_RETRIES,
            )
            .is_ok();
        debug!(
            "liveness probe of {}: {}",
            self.transport.channel.config().host,
            if alive { "alive" } else { "no answer" }
        );
        alive
    }

    /// Firmware version and boot-source flags, read from the identity and
    /// boot-status registers.
    pub fn firmware_version(&mut self) -> Result<FirmwareVersion, BoardctlError> {
        let version = wishbone::read_word(&mut self.transport.channel, FIRMWARE_VERSION_ADDR)?;
        let status = wishbone::read_word(&mut self.transport.channel, BOOT_STATUS_ADDR)?;
        Ok(FirmwareVersion {
            major: (version >> 16) as u16,
            minor: version as u16,
            golden_image: status & 0x1 != 0,
            multiboot: status & 0x2 != 0,
        })
    }

    /// Raw 32-bit words of the sensor telemetry register window, in window
    /// order. Interpretation is instrument-specific and left to the caller.
    pub fn sensor_telemetry(&mut self) -> Result<Vec<u32>, BoardctlError> {
        let bytes = wishbone::bulk_read(
            &mut self.transport.channel,
            TELEMETRY_BASE_ADDR,
            TELEMETRY_WORDS * 4,
        )?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Discard stale datagrams and re-synchronize the sequence number after
    /// an operator interrupt. See [`crate::protocol::channel::SequencedChannel::drain`].
    pub fn drain(&mut self) -> Result<usize, BoardctlError> {
        self.transport.channel.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_poll_until_returns_on_first_success() {
        let calls = AtomicU32::new(0);
        let ok = poll_until(Duration::from_millis(1), Duration::from_millis(100), || {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_until_gives_up_after_max_wait() {
        let started = Instant::now();
        let ok = poll_until(Duration::from_millis(5), Duration::from_millis(30), || false);
        assert!(!ok);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_poll_until_retries_until_success() {
        let calls = AtomicU32::new(0);
        let ok = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::SeqCst) >= 2
        });
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
