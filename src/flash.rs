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

//! Erase/program/verify cycles for the two persistent flash stores.
//!
//! Both stores share the same three-phase shape but differ in geometry and
//! bit order:
//!
//! - the word-addressed NOR store (primary firmware) programs up to 256
//!   16-bit words per request, with a 512-word logical block split into two
//!   chained requests flagged start/finish, and erases in fixed-size blocks;
//! - the page-addressed SPI store (secondary controller firmware) programs
//!   264-byte pages grouped into sectors at fixed addresses, with every byte
//!   bit-reversed on the wire to match the hardware shift register.
//!
//! Erase failures restart the whole erase pass from the first unit, because
//! the store gives no way to resume a partial erase. Program failures are
//! surfaced immediately and never retried here: blind retries against a
//! partially programmed sector wear the flash and can mask real damage.
//! Verification is strictly read-only and stops at the first mismatch.

use crate::config::{
    ERASE_PASSES, NOR_BLOCK_WORDS, NOR_ERASE_BLOCK_WORDS, NOR_PROGRAM_WORDS, SPI_FLASH_BYTES,
    SPI_PAGE_BYTES, SPI_SECTOR_ADDRS,
};
use crate::error::BoardctlError;
use crate::protocol::codec::{
    EraseFlashBlockReq, EraseSpiSectorReq, ProgramFlashWordsReq, ProgramSpiPageReq,
    ReadFlashWordsReq, ReadSpiPageReq,
};
use crate::transport::DatagramTransport;
use log::{debug, info, warn};

/// Programs the persistent flash stores of one board.
pub struct FlashProgrammingEngine<'t> {
    transport: &'t mut DatagramTransport,
}

impl<'t> FlashProgrammingEngine<'t> {
    pub fn new(transport: &'t mut DatagramTransport) -> Self {
        FlashProgrammingEngine { transport }
    }

    /// Erase, program and optionally verify `data` into the word-addressed
    /// NOR store starting at word address `addr` (a multiple of the logical
    /// block size).
    ///
    /// # Returns: `Result<(), BoardctlError>`
    /// * `Ok(())` - Every block programmed (and verified, if requested)
    /// * `Err(BoardctlError::Argument)` - Misaligned start address
    /// * `Err(BoardctlError::Programming)` - Erase passes exhausted, a
    ///   program unit was rejected, or verification found a mismatch
    pub fn program_nor(
        &mut self,
        addr: u32,
        data: &[u8],
        verify: bool,
    ) -> Result<(), BoardctlError> {
        if addr % NOR_BLOCK_WORDS as u32 != 0 {
            return Err(BoardctlError::Argument(format!(
                "NOR start address 0x{addr:08X} is not a multiple of the {NOR_BLOCK_WORDS}-word block"
            )));
        }
        let words = nor_words(data);
        info!(
            "programming NOR store: {} words at 0x{addr:08X}",
            words.len()
        );
        self.erase_nor(addr, words.len())?;
        self.program_nor_words(addr, &words)?;
        if verify {
            self.verify_nor(addr, &words)?;
        }
        Ok(())
    }

    /// Phase 1: erase each covering block in address order. Any refused
    /// erase resets the cursor and restarts the whole pass.
    fn erase_nor(&mut self, addr: u32, num_words: usize) -> Result<(), BoardctlError> {
        let blocks = nor_blocks_covering(addr, num_words);
        'pass: for pass in 1..=ERASE_PASSES {
            for &block_addr in &blocks {
                let reply = self
                    .transport
                    .channel
                    .exchange(&EraseFlashBlockReq { addr: block_addr })?;
                if !reply.erase_success {
                    warn!(
                        "NOR erase refused at block 0x{block_addr:08X} on pass {pass}, restarting pass"
                    );
                    continue 'pass;
                }
            }
            debug!("NOR erase pass {pass} complete ({} blocks)", blocks.len());
            return Ok(());
        }
        Err(BoardctlError::Programming(format!(
            "NOR erase failed after {ERASE_PASSES} passes"
        )))
    }

    /// Phase 2: each 512-word logical block travels as two chained 256-word
    /// requests flagged start then finish.
    fn program_nor_words(&mut self, addr: u32, words: &[u16]) -> Result<(), BoardctlError> {
        for (index, block) in words.chunks(NOR_BLOCK_WORDS).enumerate() {
            let block_addr = addr + (index * NOR_BLOCK_WORDS) as u32;
            let (first_half, second_half) = block.split_at(NOR_PROGRAM_WORDS);
            for (half, offset, start, finish) in [
                (first_half, 0u32, true, false),
                (second_half, NOR_PROGRAM_WORDS as u32, false, true),
            ] {
                let reply = self.transport.channel.exchange(&ProgramFlashWordsReq {
                    addr: block_addr + offset,
                    total_num_words: NOR_BLOCK_WORDS as u16,
                    packet_num_words: NOR_PROGRAM_WORDS as u16,
                    start_program: start,
                    finish_program: finish,
                    words: half.to_vec(),
                })?;
                if !reply.program_success {
                    return Err(BoardctlError::Programming(format!(
                        "NOR program rejected at word address 0x{:08X}; not retrying \
                         against a partially programmed sector",
                        block_addr + offset
                    )));
                }
            }
        }
        Ok(())
    }

    /// Phase 3: read every word back and stop at the first difference.
    fn verify_nor(&mut self, addr: u32, words: &[u16]) -> Result<(), BoardctlError> {
        info!("verifying NOR store ({} words)", words.len());
        for (index, expected) in words.chunks(NOR_PROGRAM_WORDS).enumerate() {
            let chunk_addr = addr + (index * NOR_PROGRAM_WORDS) as u32;
            let reply = self.transport.channel.exchange(&ReadFlashWordsReq {
                addr: chunk_addr,
                num_words: expected.len() as u16,
            })?;
            if let Some(pos) = expected
                .iter()
                .zip(&reply.words)
                .position(|(a, b)| a != b)
            {
                return Err(BoardctlError::Programming(format!(
                    "NOR verify mismatch at word offset {} (wrote 0x{:04X}, read 0x{:04X})",
                    index * NOR_PROGRAM_WORDS + pos,
                    expected[pos],
                    reply.words[pos]
                )));
            }
        }
        Ok(())
    }

    /// Erase, program and optionally verify `data` into the page-addressed
    /// SPI store, starting at page zero.
    ///
    /// # Returns: `Result<(), BoardctlError>`
    /// * `Ok(())` - Every page programmed (and verified, if requested)
    /// * `Err(BoardctlError::Argument)` - Data exceeds the store
    /// * `Err(BoardctlError::Programming)` - Erase passes exhausted, a page
    ///   was rejected, or verification found a mismatch
    /// * `Err(BoardctlError::ReadFailed)` - Device flagged a verify read bad
    pub fn program_spi(&mut self, data: &[u8], verify: bool) -> Result<(), BoardctlError> {
        if data.len() > SPI_FLASH_BYTES as usize {
            return Err(BoardctlError::Argument(format!(
                "{} bytes exceed the {SPI_FLASH_BYTES} byte SPI store",
                data.len()
            )));
        }
        let padded = spi_pages(data);
        info!(
            "programming SPI store: {} pages ({} bytes)",
            padded.len() / SPI_PAGE_BYTES,
            padded.len()
        );
        self.erase_spi(padded.len())?;
        self.program_spi_pages(&padded)?;
        if verify {
            self.verify_spi(&padded)?;
        }
        Ok(())
    }

    fn erase_spi(&mut self, num_bytes: usize) -> Result<(), BoardctlError> {
        let sectors = spi_sectors_covering(num_bytes);
        'pass: for pass in 1..=ERASE_PASSES {
            for &sector_addr in &sectors {
                let reply = self
                    .transport
                    .channel
                    .exchange(&EraseSpiSectorReq { addr: sector_addr })?;
                if !reply.erase_success {
                    warn!(
                        "SPI erase refused at sector 0x{sector_addr:08X} on pass {pass}, restarting pass"
                    );
                    continue 'pass;
                }
            }
            debug!("SPI erase pass {pass} complete ({} sectors)", sectors.len());
            return Ok(());
        }
        Err(BoardctlError::Programming(format!(
            "SPI erase failed after {ERASE_PASSES} passes"
        )))
    }

    fn program_spi_pages(&mut self, padded: &[u8]) -> Result<(), BoardctlError> {
        for (index, page) in padded.chunks(SPI_PAGE_BYTES).enumerate() {
            let addr = (index * SPI_PAGE_BYTES) as u32;
            let reply = self.transport.channel.exchange(&ProgramSpiPageReq {
                addr,
                num_bytes: SPI_PAGE_BYTES as u16,
                bytes: reverse_bits(page),
            })?;
            if !reply.program_success {
                return Err(BoardctlError::Programming(format!(
                    "SPI program rejected at page address 0x{addr:08X}; not retrying \
                     against a partially programmed sector"
                )));
            }
        }
        Ok(())
    }

    fn verify_spi(&mut self, padded: &[u8]) -> Result<(), BoardctlError> {
        info!("verifying SPI store ({} bytes)", padded.len());
        for (index, expected) in padded.chunks(SPI_PAGE_BYTES).enumerate() {
            let addr = (index * SPI_PAGE_BYTES) as u32;
            let reply = self.transport.channel.exchange(&ReadSpiPageReq {
                addr,
                num_bytes: SPI_PAGE_BYTES as u16,
            })?;
            if !reply.read_success {
                return Err(BoardctlError::ReadFailed(format!(
                    "device flagged the verify read at page address 0x{addr:08X} bad"
                )));
            }
            let restored = reverse_bits(&reply.bytes);
            if let Some(pos) = expected.iter().zip(&restored).position(|(a, b)| a != b) {
                return Err(BoardctlError::Programming(format!(
                    "SPI verify mismatch at byte offset {} (wrote 0x{:02X}, read 0x{:02X})",
                    index * SPI_PAGE_BYTES + pos,
                    expected[pos],
                    restored[pos]
                )));
            }
        }
        Ok(())
    }
}

/// Bytes as big-endian 16-bit words, padded with erased-state words to a
/// logical block multiple.
fn nor_words(data: &[u8]) -> Vec<u16> {
    let mut words: Vec<u16> = data
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0xFF)]))
        .collect();
    let remainder = words.len() % NOR_BLOCK_WORDS;
    if remainder != 0 {
        words.resize(words.len() + NOR_BLOCK_WORDS - remainder, 0xFFFF);
    }
    words
}

/// Erase-block addresses covering `num_words` words from `addr`, in order.
fn nor_blocks_covering(addr: u32, num_words: usize) -> Vec<u32> {
    let first = addr - addr % NOR_ERASE_BLOCK_WORDS;
    let end = addr + num_words as u32;
    (first..end)
        .step_by(NOR_ERASE_BLOCK_WORDS as usize)
        .collect()
}

/// Bytes padded with 0xFF to a whole number of SPI pages.
fn spi_pages(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    let remainder = padded.len() % SPI_PAGE_BYTES;
    if remainder != 0 {
        padded.resize(padded.len() + SPI_PAGE_BYTES - remainder, 0xFF);
    }
    padded
}

/// The fixed sector addresses whose sectors overlap the first `num_bytes`.
fn spi_sectors_covering(num_bytes: usize) -> Vec<u32> {
    SPI_SECTOR_ADDRS
        .iter()
        .copied()
        .filter(|addr| (*addr as usize) < num_bytes)
        .collect()
}

/// The hardware shift register clocks SPI bytes LSB first.
fn reverse_bits(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.reverse_bits()).collect()
}
