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

//! Upload of a configuration image into staging memory, and booting from it.
//!
//! The upload cycle is: put the staging controller into programming mode and
//! clear it, stream the image over the fabric endpoint in fire-and-forget
//! chunks, then prove the transfer twice: the device's fabric frame counter
//! must equal the number of chunks sent, and the device's independently
//! computed checksum must equal ours. Only then is staging marked finished.
//! Any failure after transmission clears staging memory so the board is
//! never left holding a half-written image, and the whole
//! transmit-and-check cycle restarts up to a bounded attempt count.

use crate::bitstream::BitstreamImage;
use crate::board::poll_until;
use crate::config::{
    BOOT_POLL_INTERVAL, BOOT_POLL_MAX, BOOT_STATUS_ADDR, CHECKSUM_REG_ADDR,
    FIRMWARE_VERSION_ADDR, PROBE_RETRIES, STAGING_BASE_ADDR, UPLOAD_ATTEMPTS,
};
use crate::error::BoardctlError;
use crate::protocol::codec::{ReadWishboneReq, SdramProgramReq, SdramReconfigureReq};
use crate::transport::DatagramTransport;
use crate::wishbone;
use log::{debug, info, warn};

/// How a board came back after [`ImageUploadEngine::boot_from_uploaded_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The freshly staged image is running.
    NewImage { version_major: u16, version_minor: u16 },
    /// The board rejected the staged image and fell back to the failsafe
    /// golden image.
    GoldenFallback,
    /// The board fell back to the secondary multiboot image.
    MultibootFallback,
}

/// Transient per-upload state: where we are in the image and what has been
/// sent so far. Discarded when the call returns.
#[derive(Debug)]
struct ProgrammingSession {
    cursor: usize,
    chunks_sent: u32,
    attempt: u32,
}

/// Uploads a canonical image through a board's staging memory.
pub struct ImageUploadEngine<'t> {
    transport: &'t mut DatagramTransport,
}

impl<'t> ImageUploadEngine<'t> {
    pub fn new(transport: &'t mut DatagramTransport) -> Self {
        ImageUploadEngine { transport }
    }

    /// Run the full upload cycle for `image`. With `verify` set, the staged
    /// image is additionally read back in full and compared word-for-word
    /// (slow; the checksum already covers silent corruption).
    ///
    /// # Returns: `Result<(), BoardctlError>`
    /// * `Ok(())` - Image staged, counted, checksummed and committed
    /// * `Err(BoardctlError::Programming)` - All attempts exhausted; staging
    ///   memory has been cleared
    pub fn program(&mut self, image: &BitstreamImage, verify: bool) -> Result<(), BoardctlError> {
        let mut last_err: Option<BoardctlError> = None;
        for attempt in 1..=UPLOAD_ATTEMPTS {
            let mut session = ProgrammingSession {
                cursor: 0,
                chunks_sent: 0,
                attempt,
            };
            self.prepare()?;
            self.transmit(image, &mut session)?;
            match self.check_and_commit(image, &session, verify) {
                Ok(()) => {
                    info!(
                        "image staged: {} chunks, checksum 0x{:04X}, attempt {attempt}",
                        session.chunks_sent,
                        image.checksum()
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("upload attempt {attempt} failed: {e}");
                    self.clear_staging()?;
                    last_err = Some(e);
                }
            }
        }
        Err(BoardctlError::Programming(format!(
            "image upload failed after {UPLOAD_ATTEMPTS} attempts, staging cleared; last error: {}",
            last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }

    /// Step 1: programming mode, cleared contents, zeroed transfer counters.
    fn prepare(&mut self) -> Result<(), BoardctlError> {
        self.transport.channel.exchange(&SdramReconfigureReq {
            clear_sdram: true,
            reset_counters: true,
            ..Default::default()
        })?;
        debug!("staging memory cleared, counters reset");
        Ok(())
    }

    fn clear_staging(&mut self) -> Result<(), BoardctlError> {
        self.transport.channel.exchange(&SdramReconfigureReq {
            clear_sdram: true,
            reset_counters: true,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Step 2: stream the chunks over the fabric endpoint.
    fn transmit(
        &mut self,
        image: &BitstreamImage,
        session: &mut ProgrammingSession,
    ) -> Result<(), BoardctlError> {
        let total = image.chunks().len();
        for (index, chunk) in image.chunks().enumerate() {
            self.transport.channel.send_fabric(&SdramProgramReq {
                first_packet: index == 0,
                last_packet: index == total - 1,
                chunk: chunk.to_vec(),
            })?;
            session.cursor += chunk.len();
            session.chunks_sent += 1;
        }
        debug!(
            "transmitted {} chunks ({} bytes) on attempt {}",
            session.chunks_sent, session.cursor, session.attempt
        );
        Ok(())
    }

    /// Steps 3-5: count check, checksum check, commit, optional verify.
    fn check_and_commit(
        &mut self,
        image: &BitstreamImage,
        session: &ProgrammingSession,
        verify: bool,
    ) -> Result<(), BoardctlError> {
        let stats = self
            .transport
            .channel
            .exchange(&SdramReconfigureReq::default())?;
        if stats.frames_bad > 0 || stats.frames_overload > 0 {
            warn!(
                "device counted {} bad and {} overload frames",
                stats.frames_bad, stats.frames_overload
            );
        }
        if stats.frames_received as u32 != session.chunks_sent {
            return Err(BoardctlError::Programming(format!(
                "sent {} chunks but the device counted {} frames; check that the fabric \
                 path is routed to this board and the MTU covers the chunk size",
                session.chunks_sent, stats.frames_received
            )));
        }

        let local = image.checksum();
        let reported =
            wishbone::read_word(&mut self.transport.channel, CHECKSUM_REG_ADDR)? as u16;
        if reported == 0 {
            return Err(BoardctlError::Programming(
                "device reports a zero checksum: the upload never reached staging memory"
                    .to_string(),
            ));
        }
        if reported != local {
            return Err(BoardctlError::ChecksumMismatch { local, reported });
        }

        self.transport.channel.exchange(&SdramReconfigureReq {
            finished_writing: true,
            ..Default::default()
        })?;

        if verify {
            self.verify_staged(image)?;
        }
        Ok(())
    }

    /// Opt-in full read-back of the staged image.
    fn verify_staged(&mut self, image: &BitstreamImage) -> Result<(), BoardctlError> {
        info!("verifying staged image ({} bytes)", image.as_bytes().len());
        let mut offset = 0usize;
        for chunk in image.chunks() {
            let readback = wishbone::bulk_read(
                &mut self.transport.channel,
                STAGING_BASE_ADDR + offset as u32,
                chunk.len(),
            )?;
            if let Some(pos) = chunk.iter().zip(&readback).position(|(a, b)| a != b) {
                return Err(BoardctlError::Programming(format!(
                    "staged image differs from source at byte offset {} \
                     (wrote 0x{:02X}, read 0x{:02X})",
                    offset + pos,
                    chunk[pos],
                    readback[pos]
                )));
            }
            offset += chunk.len();
        }
        Ok(())
    }

    /// Tell the board to reconfigure from staging memory, wait for it to
    /// come back, and classify what it actually booted.
    ///
    /// # Returns: `Result<BootOutcome, BoardctlError>`
    /// * `Ok(BootOutcome)` - Board is back; see the variant for which image runs
    /// * `Err(BoardctlError::Programming)` - Board never answered within the
    ///   boot poll window
    pub fn boot_from_uploaded_image(&mut self) -> Result<BootOutcome, BoardctlError> {
        self.transport.channel.exchange(&SdramReconfigureReq {
            about_to_boot: true,
            ..Default::default()
        })?;
        self.transport.channel.send_no_reply(&SdramReconfigureReq {
            do_reboot: true,
            ..Default::default()
        })?;
        info!("reconfiguration from staged image requested, waiting for the board");

        let channel = &mut self.transport.channel;
        let alive = poll_until(BOOT_POLL_INTERVAL, BOOT_POLL_MAX, || {
            channel
                .exchange_with_budget(
                    &ReadWishboneReq {
                        addr: FIRMWARE_VERSION_ADDR,
                    },
                    PROBE_RETRIES,
                )
                .is_ok()
        });
        if !alive {
            return Err(BoardctlError::Programming(format!(
                "board did not respond within {BOOT_POLL_MAX:?} after reboot"
            )));
        }

        let status = wishbone::read_word(&mut self.transport.channel, BOOT_STATUS_ADDR)?;
        if status & 0x1 != 0 {
            warn!("board fell back to the golden image");
            Ok(BootOutcome::GoldenFallback)
        } else if status & 0x2 != 0 {
            warn!("board fell back to the multiboot image");
            Ok(BootOutcome::MultibootFallback)
        } else {
            let version =
                wishbone::read_word(&mut self.transport.channel, FIRMWARE_VERSION_ADDR)?;
            let (version_major, version_minor) = ((version >> 16) as u16, version as u16);
            info!("board is running the new image (firmware {version_major}.{version_minor})");
            Ok(BootOutcome::NewImage {
                version_major,
                version_minor,
            })
        }
    }
}
