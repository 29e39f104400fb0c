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

//! 32-bit register access over the Wishbone bus.
//!
//! Single-word reads and writes travel as one exchange each. Larger
//! transfers are chained through requests of at most [`MAX_BULK_WORDS`]
//! aligned 32-bit words, a ceiling imposed by the embedded controller's wire
//! format. Reads accept unaligned addresses and lengths by widening to the
//! covering aligned word span and trimming the result; writes require
//! alignment because the protocol offers no read-modify-write.

use crate::config::MAX_BULK_WORDS;
use crate::error::BoardctlError;
use crate::protocol::channel::SequencedChannel;
use crate::protocol::codec::{
    BulkReadWishboneReq, BulkWriteWishboneReq, ReadWishboneReq, WriteWishboneReq,
};
use log::trace;

/// The aligned word span covering an arbitrary byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadPlan {
    /// Word-aligned start address.
    start_addr: u32,
    /// 32-bit words to read.
    total_words: usize,
    /// Bytes to skip at the front of the widened result.
    skip: usize,
}

fn plan_bulk_read(addr: u32, nbytes: usize) -> ReadPlan {
    let start_addr = addr & !3;
    let skip = (addr - start_addr) as usize;
    let span = skip + nbytes;
    ReadPlan {
        start_addr,
        total_words: span.div_ceil(4),
        skip,
    }
}

pub(crate) fn read_word(
    channel: &mut SequencedChannel,
    addr: u32,
) -> Result<u32, BoardctlError> {
    let reply = channel.exchange(&ReadWishboneReq { addr })?;
    Ok(reply.data)
}

pub(crate) fn write_word(
    channel: &mut SequencedChannel,
    addr: u32,
    value: u32,
) -> Result<(), BoardctlError> {
    let reply = channel.exchange(&WriteWishboneReq { addr, data: value })?;
    if reply.data != value {
        return Err(BoardctlError::WriteFailed(format!(
            "device echoed 0x{:08X} for a write of 0x{value:08X} to 0x{addr:08X}",
            reply.data
        )));
    }
    Ok(())
}

pub(crate) fn bulk_read(
    channel: &mut SequencedChannel,
    addr: u32,
    nbytes: usize,
) -> Result<Vec<u8>, BoardctlError> {
    if nbytes == 0 {
        return Ok(Vec::new());
    }
    let plan = plan_bulk_read(addr, nbytes);
    trace!(
        "bulk read of {nbytes} bytes at 0x{addr:08X}: {} words from 0x{:08X}",
        plan.total_words, plan.start_addr
    );

    // A span within one word is cheaper as a plain register read.
    if plan.total_words == 1 {
        let word = read_word(channel, plan.start_addr)?;
        let bytes = word.to_be_bytes();
        return Ok(bytes[plan.skip..plan.skip + nbytes].to_vec());
    }

    let mut data = Vec::with_capacity(plan.total_words * 4);
    let mut cursor = plan.start_addr;
    let mut words_left = plan.total_words;
    while words_left > 0 {
        let count = words_left.min(MAX_BULK_WORDS);
        let reply = channel.exchange(&BulkReadWishboneReq {
            addr: cursor,
            num_words: count as u16,
        })?;
        if reply.num_words as usize != count {
            return Err(BoardctlError::ReadFailed(format!(
                "device returned {} words for a request of {count} at 0x{cursor:08X}",
                reply.num_words
            )));
        }
        data.extend_from_slice(&reply.data);
        cursor += (count * 4) as u32;
        words_left -= count;
    }
    Ok(data[plan.skip..plan.skip + nbytes].to_vec())
}

pub(crate) fn bulk_write(
    channel: &mut SequencedChannel,
    addr: u32,
    data: &[u8],
) -> Result<(), BoardctlError> {
    if addr % 4 != 0 || data.len() % 4 != 0 {
        return Err(BoardctlError::Argument(format!(
            "bulk write needs word alignment, got address 0x{addr:08X} and {} bytes",
            data.len()
        )));
    }
    if data.is_empty() {
        return Ok(());
    }
    let mut cursor = addr;
    for chunk in data.chunks(MAX_BULK_WORDS * 4) {
        let num_words = (chunk.len() / 4) as u16;
        let mut padded = chunk.to_vec();
        padded.resize(MAX_BULK_WORDS * 4, 0);
        let reply = channel.exchange(&BulkWriteWishboneReq {
            addr: cursor,
            num_words,
            data: padded,
        })?;
        if reply.words_written != num_words {
            return Err(BoardctlError::WriteFailed(format!(
                "device committed {} of {num_words} words at 0x{cursor:08X}",
                reply.words_written
            )));
        }
        cursor += chunk.len() as u32;
    }
    Ok(())
}
