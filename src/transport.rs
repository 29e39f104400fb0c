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

//! The transport capability interface and its datagram-protocol variant.
//!
//! Callers that only need register access and image programming depend on
//! the [`Transport`] trait, not on any concrete backend. This crate ships
//! the sequenced-datagram variant; backends wrapping other control protocols
//! or direct memory-mapped access implement the same trait elsewhere.

use crate::bitstream::BitstreamImage;
use crate::config::ChannelConfig;
use crate::error::BoardctlError;
use crate::protocol::channel::SequencedChannel;
use crate::upload::ImageUploadEngine;
use crate::wishbone;

/// Capabilities every board transport provides.
pub trait Transport {
    /// Read one 32-bit word from `addr`.
    fn read_word(&mut self, addr: u32) -> Result<u32, BoardctlError>;

    /// Write one 32-bit word to `addr`.
    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), BoardctlError>;

    /// Read exactly `nbytes` starting at `addr`. The address and length need
    /// not be word-aligned.
    fn bulk_read(&mut self, addr: u32, nbytes: usize) -> Result<Vec<u8>, BoardctlError>;

    /// Write `data` starting at `addr`. Address and length must be
    /// word-aligned.
    fn bulk_write(&mut self, addr: u32, data: &[u8]) -> Result<(), BoardctlError>;

    /// Upload `image` into staging memory, checksum-verified, ready to boot.
    fn program_image(
        &mut self,
        image: &BitstreamImage,
        verify: bool,
    ) -> Result<(), BoardctlError>;
}

/// The sequenced UDP datagram transport specified for these boards.
#[derive(Debug)]
pub struct DatagramTransport {
    pub(crate) channel: SequencedChannel,
}

impl DatagramTransport {
    /// Open a transport to the board described by `config`.
    pub fn connect(config: ChannelConfig) -> Result<Self, BoardctlError> {
        Ok(DatagramTransport {
            channel: SequencedChannel::connect(config)?,
        })
    }

    /// Access the underlying channel, e.g. to `drain` it after an operator
    /// interrupt.
    pub fn channel_mut(&mut self) -> &mut SequencedChannel {
        &mut self.channel
    }
}

impl Transport for DatagramTransport {
    fn read_word(&mut self, addr: u32) -> Result<u32, BoardctlError> {
        wishbone::read_word(&mut self.channel, addr)
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), BoardctlError> {
        wishbone::write_word(&mut self.channel, addr, value)
    }

    fn bulk_read(&mut self, addr: u32, nbytes: usize) -> Result<Vec<u8>, BoardctlError> {
        wishbone::bulk_read(&mut self.channel, addr, nbytes)
    }

    fn bulk_write(&mut self, addr: u32, data: &[u8]) -> Result<(), BoardctlError> {
        wishbone::bulk_write(&mut self.channel, addr, data)
    }

    fn program_image(
        &mut self,
        image: &BitstreamImage,
        verify: bool,
    ) -> Result<(), BoardctlError> {
        ImageUploadEngine::new(self).program(image, verify)
    }
}
