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

//! Packet codec for the board control protocol.
//!
//! Every message starts with a two-word header (command id, sequence number)
//! followed by opcode-specific positional fields. Scalars travel as big-endian
//! 16-bit words; 32-bit quantities are split into high/low halves. Replies
//! carry the request command id plus one.
//!
//! The per-opcode layouts form a compile-time table: each opcode has one
//! request struct implementing [`WireRequest`] and one reply struct
//! implementing [`WireReply`], tied together through `WireRequest::Reply`.
//! Replies whose size depends on the request (bulk reads, flash reads)
//! declare the variable word count via [`WireRequest::reply_data_words`];
//! re-slicing a contiguous word run back into a nested array field happens in
//! that reply's `unpack`, nowhere else.
//!
//! Reply packing ([`encode_reply`]) exists so that device simulators and
//! tests can produce byte-exact frames with the same table the decoder uses.

use crate::config::{IMAGE_CHUNK_BYTES, MAX_BULK_WORDS, NOR_PROGRAM_WORDS, SPI_PAGE_BYTES};
use crate::error::BoardctlError;

/// Command ids of every request the embedded controller understands.
/// Replies use `id + 1`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ReadWishbone = 0x0001,
    WriteWishbone = 0x0003,
    BulkReadWishbone = 0x0005,
    BulkWriteWishbone = 0x0007,
    SdramReconfigure = 0x0009,
    SdramProgram = 0x000B,
    WriteBoardReg = 0x000D,
    EraseFlashBlock = 0x000F,
    ProgramFlashWords = 0x0011,
    ReadFlashWords = 0x0013,
    EraseSpiSector = 0x0015,
    ProgramSpiPage = 0x0017,
    ReadSpiPage = 0x0019,
}

impl Opcode {
    /// Command id carried by the reply to this request.
    pub const fn reply_id(self) -> u16 {
        self as u16 + 1
    }
}

/// Board-level registers reachable through [`WriteBoardRegReq`].
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardReg {
    /// Reconfigure the FPGA from the currently flashed image.
    RebootFromFlash = 0x0001,
    /// Power the board down. The controller does not answer this one.
    Shutdown = 0x0002,
    /// Pulse the FPGA logic reset line.
    LogicReset = 0x0003,
}

/// The two-word header every message begins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: u16,
    pub seq: u16,
}

/// A request with a fixed positional field layout.
pub trait WireRequest {
    const OPCODE: Opcode;
    /// Reply layout this request elicits.
    type Reply: WireReply;

    /// Append the fields (everything after the header) to `out`.
    fn pack_fields(&self, out: &mut Vec<u8>);

    /// Number of variable data words in the reply, known only from the
    /// request (e.g. how many words a bulk read asked for).
    fn reply_data_words(&self) -> usize {
        0
    }
}

/// A reply with a fixed positional field layout.
pub trait WireReply: Sized {
    /// Command id of this reply on the wire.
    const REPLY_ID: u16;
    /// Scalar field words after the header, excluding variable data words
    /// and padding.
    const FIXED_WORDS: usize;
    /// Declared trailing padding words, stripped before `unpack`.
    const PAD_WORDS: usize;

    /// Rebuild the typed reply from its field words (header and padding
    /// already removed).
    fn unpack(words: &[u16]) -> Result<Self, BoardctlError>;

    /// Append the fields (everything after the header, before padding)
    /// to `out`.
    fn pack_fields(&self, out: &mut Vec<u8>);
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32_halves(out: &mut Vec<u8>, v: u32) {
    put_u16(out, (v >> 16) as u16);
    put_u16(out, v as u16);
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    put_u16(out, v as u16);
}

fn merge_u32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

/// Frame a request: header (opcode, seq) followed by its fields.
pub fn encode<R: WireRequest>(req: &R, seq: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    put_u16(&mut out, R::OPCODE as u16);
    put_u16(&mut out, seq);
    req.pack_fields(&mut out);
    out
}

/// Frame a reply: header (reply id, seq), fields, then declared padding.
pub fn encode_reply<P: WireReply>(reply: &P, seq: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    put_u16(&mut out, P::REPLY_ID);
    put_u16(&mut out, seq);
    reply.pack_fields(&mut out);
    for _ in 0..P::PAD_WORDS {
        put_u16(&mut out, 0);
    }
    out
}

/// Read the two-word header without touching the rest of the payload.
pub fn peek_header(payload: &[u8]) -> Result<PacketHeader, BoardctlError> {
    if payload.len() < 4 {
        return Err(BoardctlError::MalformedResponse(format!(
            "datagram of {} bytes is shorter than the packet header",
            payload.len()
        )));
    }
    Ok(PacketHeader {
        command: u16::from_be_bytes([payload[0], payload[1]]),
        seq: u16::from_be_bytes([payload[2], payload[3]]),
    })
}

/// Decode the reply to `req`, checking the declared word count and stripping
/// the header and padding before handing the field words to the reply type.
pub fn decode_reply<R: WireRequest>(
    req: &R,
    payload: &[u8],
) -> Result<R::Reply, BoardctlError> {
    let total_words = 2 + R::Reply::FIXED_WORDS + req.reply_data_words() + R::Reply::PAD_WORDS;
    if payload.len() < total_words * 2 {
        return Err(BoardctlError::MalformedResponse(format!(
            "reply to 0x{:04X} is {} bytes but the layout declares {} words",
            R::OPCODE as u16,
            payload.len(),
            total_words
        )));
    }
    let words: Vec<u16> = payload[..total_words * 2]
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect();
    R::Reply::unpack(&words[2..total_words - R::Reply::PAD_WORDS])
}

// ---------------------------------------------------------------------------
// Register access
// ---------------------------------------------------------------------------

/// Read one 32-bit word from the Wishbone bus.
#[derive(Debug, Clone, Copy)]
pub struct ReadWishboneReq {
    pub addr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWishboneReply {
    pub addr: u32,
    pub data: u32,
}

impl WireRequest for ReadWishboneReq {
    const OPCODE: Opcode = Opcode::ReadWishbone;
    type Reply = ReadWishboneReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
    }
}

impl WireReply for ReadWishboneReply {
    const REPLY_ID: u16 = Opcode::ReadWishbone.reply_id();
    const FIXED_WORDS: usize = 4;
    const PAD_WORDS: usize = 5;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(ReadWishboneReply {
            addr: merge_u32(words[0], words[1]),
            data: merge_u32(words[2], words[3]),
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u32_halves(out, self.data);
    }
}

/// Write one 32-bit word to the Wishbone bus.
#[derive(Debug, Clone, Copy)]
pub struct WriteWishboneReq {
    pub addr: u32,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteWishboneReply {
    pub addr: u32,
    pub data: u32,
}

impl WireRequest for WriteWishboneReq {
    const OPCODE: Opcode = Opcode::WriteWishbone;
    type Reply = WriteWishboneReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u32_halves(out, self.data);
    }
}

impl WireReply for WriteWishboneReply {
    const REPLY_ID: u16 = Opcode::WriteWishbone.reply_id();
    const FIXED_WORDS: usize = 4;
    const PAD_WORDS: usize = 5;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(WriteWishboneReply {
            addr: merge_u32(words[0], words[1]),
            data: merge_u32(words[2], words[3]),
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u32_halves(out, self.data);
    }
}

/// Read up to [`MAX_BULK_WORDS`] aligned 32-bit words in one request.
#[derive(Debug, Clone, Copy)]
pub struct BulkReadWishboneReq {
    pub addr: u32,
    /// Number of 32-bit words to read.
    pub num_words: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReadWishboneReply {
    pub addr: u32,
    pub num_words: u16,
    /// The read words as a big-endian byte stream, `4 * num_words` long.
    pub data: Vec<u8>,
}

impl WireRequest for BulkReadWishboneReq {
    const OPCODE: Opcode = Opcode::BulkReadWishbone;
    type Reply = BulkReadWishboneReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_words);
    }

    fn reply_data_words(&self) -> usize {
        self.num_words as usize * 2
    }
}

impl WireReply for BulkReadWishboneReply {
    const REPLY_ID: u16 = Opcode::BulkReadWishbone.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 2;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        let num_words = words[2];
        let data_words = &words[3..];
        if data_words.len() != num_words as usize * 2 {
            return Err(BoardctlError::MalformedResponse(format!(
                "bulk read reply declares {} words but carries {}",
                num_words,
                data_words.len() / 2
            )));
        }
        let mut data = Vec::with_capacity(data_words.len() * 2);
        for w in data_words {
            data.extend_from_slice(&w.to_be_bytes());
        }
        Ok(BulkReadWishboneReply {
            addr: merge_u32(words[0], words[1]),
            num_words,
            data,
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_words);
        for pair in self.data.chunks_exact(2) {
            put_u16(out, u16::from_be_bytes([pair[0], pair[1]]));
        }
    }
}

/// Write up to [`MAX_BULK_WORDS`] aligned 32-bit words in one request. The
/// data field is always `MAX_BULK_WORDS` long on the wire; a shorter chunk is
/// zero-padded by the sender while `num_words` declares the true count.
#[derive(Debug, Clone)]
pub struct BulkWriteWishboneReq {
    pub addr: u32,
    /// Number of 32-bit words the device should commit.
    pub num_words: u16,
    /// Big-endian byte stream, exactly `4 * MAX_BULK_WORDS` long.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkWriteWishboneReply {
    pub addr: u32,
    /// How many 32-bit words the device reports having committed.
    pub words_written: u16,
}

impl WireRequest for BulkWriteWishboneReq {
    const OPCODE: Opcode = Opcode::BulkWriteWishbone;
    type Reply = BulkWriteWishboneReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_words);
        debug_assert_eq!(self.data.len(), MAX_BULK_WORDS * 4);
        for pair in self.data.chunks_exact(2) {
            put_u16(out, u16::from_be_bytes([pair[0], pair[1]]));
        }
    }
}

impl WireReply for BulkWriteWishboneReply {
    const REPLY_ID: u16 = Opcode::BulkWriteWishbone.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 2;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(BulkWriteWishboneReply {
            addr: merge_u32(words[0], words[1]),
            words_written: words[2],
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.words_written);
    }
}

// ---------------------------------------------------------------------------
// Staging memory
// ---------------------------------------------------------------------------

/// Control the staging memory controller. All flags false is a pure query;
/// the reply always carries the fabric frame counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdramReconfigureReq {
    pub clear_sdram: bool,
    pub finished_writing: bool,
    pub about_to_boot: bool,
    pub do_reboot: bool,
    pub reset_counters: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdramReconfigureReply {
    pub frames_received: u16,
    pub frames_bad: u16,
    pub frames_overload: u16,
}

impl WireRequest for SdramReconfigureReq {
    const OPCODE: Opcode = Opcode::SdramReconfigure;
    type Reply = SdramReconfigureReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_bool(out, self.clear_sdram);
        put_bool(out, self.finished_writing);
        put_bool(out, self.about_to_boot);
        put_bool(out, self.do_reboot);
        put_bool(out, self.reset_counters);
    }
}

impl WireReply for SdramReconfigureReply {
    const REPLY_ID: u16 = Opcode::SdramReconfigure.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 3;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(SdramReconfigureReply {
            frames_received: words[0],
            frames_bad: words[1],
            frames_overload: words[2],
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u16(out, self.frames_received);
        put_u16(out, self.frames_bad);
        put_u16(out, self.frames_overload);
    }
}

/// One fire-and-forget image chunk on the fabric endpoint. Never answered.
#[derive(Debug, Clone)]
pub struct SdramProgramReq {
    pub first_packet: bool,
    pub last_packet: bool,
    /// Exactly [`IMAGE_CHUNK_BYTES`] of canonical image data, raw.
    pub chunk: Vec<u8>,
}

/// Placeholder reply for requests nothing ever answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoReply;

impl WireRequest for SdramProgramReq {
    const OPCODE: Opcode = Opcode::SdramProgram;
    type Reply = NoReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_bool(out, self.first_packet);
        put_bool(out, self.last_packet);
        debug_assert_eq!(self.chunk.len(), IMAGE_CHUNK_BYTES);
        out.extend_from_slice(&self.chunk);
    }
}

impl WireReply for NoReply {
    const REPLY_ID: u16 = Opcode::SdramProgram.reply_id();
    const FIXED_WORDS: usize = 0;
    const PAD_WORDS: usize = 0;

    fn unpack(_words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(NoReply)
    }

    fn pack_fields(&self, _out: &mut Vec<u8>) {}
}

// ---------------------------------------------------------------------------
// Board control
// ---------------------------------------------------------------------------

/// Write a board-level control register.
#[derive(Debug, Clone, Copy)]
pub struct WriteBoardRegReq {
    pub reg: BoardReg,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBoardRegReply {
    pub reg_id: u16,
    pub data: u32,
}

impl WireRequest for WriteBoardRegReq {
    const OPCODE: Opcode = Opcode::WriteBoardReg;
    type Reply = WriteBoardRegReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u16(out, self.reg as u16);
        put_u32_halves(out, self.data);
    }
}

impl WireReply for WriteBoardRegReply {
    const REPLY_ID: u16 = Opcode::WriteBoardReg.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 4;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(WriteBoardRegReply {
            reg_id: words[0],
            data: merge_u32(words[1], words[2]),
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u16(out, self.reg_id);
        put_u32_halves(out, self.data);
    }
}

// ---------------------------------------------------------------------------
// NOR flash (word-addressed store)
// ---------------------------------------------------------------------------

/// Erase the NOR block containing `addr` (a multiple of the block size).
#[derive(Debug, Clone, Copy)]
pub struct EraseFlashBlockReq {
    pub addr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseFlashBlockReply {
    pub addr: u32,
    pub erase_success: bool,
}

impl WireRequest for EraseFlashBlockReq {
    const OPCODE: Opcode = Opcode::EraseFlashBlock;
    type Reply = EraseFlashBlockReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
    }
}

impl WireReply for EraseFlashBlockReply {
    const REPLY_ID: u16 = Opcode::EraseFlashBlock.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 4;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(EraseFlashBlockReply {
            addr: merge_u32(words[0], words[1]),
            erase_success: words[2] != 0,
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_bool(out, self.erase_success);
    }
}

/// Program up to [`NOR_PROGRAM_WORDS`] 16-bit words. A 512-word logical block
/// is two of these chained, flagged start then finish.
#[derive(Debug, Clone)]
pub struct ProgramFlashWordsReq {
    pub addr: u32,
    /// Words in the whole logical block this packet belongs to.
    pub total_num_words: u16,
    /// Words carried by this packet.
    pub packet_num_words: u16,
    pub start_program: bool,
    pub finish_program: bool,
    /// Exactly [`NOR_PROGRAM_WORDS`] words.
    pub words: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramFlashWordsReply {
    pub addr: u32,
    pub program_success: bool,
}

impl WireRequest for ProgramFlashWordsReq {
    const OPCODE: Opcode = Opcode::ProgramFlashWords;
    type Reply = ProgramFlashWordsReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.total_num_words);
        put_u16(out, self.packet_num_words);
        put_bool(out, self.start_program);
        put_bool(out, self.finish_program);
        debug_assert_eq!(self.words.len(), NOR_PROGRAM_WORDS);
        for w in &self.words {
            put_u16(out, *w);
        }
    }
}

impl WireReply for ProgramFlashWordsReply {
    const REPLY_ID: u16 = Opcode::ProgramFlashWords.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 4;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(ProgramFlashWordsReply {
            addr: merge_u32(words[0], words[1]),
            program_success: words[2] != 0,
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_bool(out, self.program_success);
    }
}

/// Read back NOR words for verification.
#[derive(Debug, Clone, Copy)]
pub struct ReadFlashWordsReq {
    pub addr: u32,
    pub num_words: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFlashWordsReply {
    pub addr: u32,
    pub num_words: u16,
    pub words: Vec<u16>,
}

impl WireRequest for ReadFlashWordsReq {
    const OPCODE: Opcode = Opcode::ReadFlashWords;
    type Reply = ReadFlashWordsReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_words);
    }

    fn reply_data_words(&self) -> usize {
        self.num_words as usize
    }
}

impl WireReply for ReadFlashWordsReply {
    const REPLY_ID: u16 = Opcode::ReadFlashWords.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 2;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        let num_words = words[2];
        let data = &words[3..];
        if data.len() != num_words as usize {
            return Err(BoardctlError::MalformedResponse(format!(
                "flash read reply declares {} words but carries {}",
                num_words,
                data.len()
            )));
        }
        Ok(ReadFlashWordsReply {
            addr: merge_u32(words[0], words[1]),
            num_words,
            words: data.to_vec(),
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_words);
        for w in &self.words {
            put_u16(out, *w);
        }
    }
}

// ---------------------------------------------------------------------------
// SPI flash (page-addressed store)
// ---------------------------------------------------------------------------

/// Erase the SPI sector starting at one of the fixed sector addresses.
#[derive(Debug, Clone, Copy)]
pub struct EraseSpiSectorReq {
    pub addr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseSpiSectorReply {
    pub addr: u32,
    pub erase_success: bool,
}

impl WireRequest for EraseSpiSectorReq {
    const OPCODE: Opcode = Opcode::EraseSpiSector;
    type Reply = EraseSpiSectorReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
    }
}

impl WireReply for EraseSpiSectorReply {
    const REPLY_ID: u16 = Opcode::EraseSpiSector.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 4;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(EraseSpiSectorReply {
            addr: merge_u32(words[0], words[1]),
            erase_success: words[2] != 0,
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_bool(out, self.erase_success);
    }
}

/// Program one 264-byte SPI page. Bytes are already in wire bit order
/// (bit-reversed) and travel one per 16-bit word.
#[derive(Debug, Clone)]
pub struct ProgramSpiPageReq {
    pub addr: u32,
    pub num_bytes: u16,
    /// Exactly [`SPI_PAGE_BYTES`] bytes.
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSpiPageReply {
    pub addr: u32,
    pub program_success: bool,
}

impl WireRequest for ProgramSpiPageReq {
    const OPCODE: Opcode = Opcode::ProgramSpiPage;
    type Reply = ProgramSpiPageReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_bytes);
        debug_assert_eq!(self.bytes.len(), SPI_PAGE_BYTES);
        for b in &self.bytes {
            put_u16(out, *b as u16);
        }
    }
}

impl WireReply for ProgramSpiPageReply {
    const REPLY_ID: u16 = Opcode::ProgramSpiPage.reply_id();
    const FIXED_WORDS: usize = 3;
    const PAD_WORDS: usize = 4;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        Ok(ProgramSpiPageReply {
            addr: merge_u32(words[0], words[1]),
            program_success: words[2] != 0,
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_bool(out, self.program_success);
    }
}

/// Read back one SPI page for verification. Returned bytes are in wire bit
/// order; the caller un-reverses them.
#[derive(Debug, Clone, Copy)]
pub struct ReadSpiPageReq {
    pub addr: u32,
    pub num_bytes: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSpiPageReply {
    pub addr: u32,
    pub num_bytes: u16,
    pub bytes: Vec<u8>,
    pub read_success: bool,
}

impl WireRequest for ReadSpiPageReq {
    const OPCODE: Opcode = Opcode::ReadSpiPage;
    type Reply = ReadSpiPageReply;

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_bytes);
    }

    fn reply_data_words(&self) -> usize {
        SPI_PAGE_BYTES
    }
}

impl WireReply for ReadSpiPageReply {
    const REPLY_ID: u16 = Opcode::ReadSpiPage.reply_id();
    /// addr (2), num_bytes, read_success.
    const FIXED_WORDS: usize = 4;
    const PAD_WORDS: usize = 2;

    fn unpack(words: &[u16]) -> Result<Self, BoardctlError> {
        let num_bytes = words[2];
        let data = &words[3..words.len() - 1];
        if data.len() != SPI_PAGE_BYTES {
            return Err(BoardctlError::MalformedResponse(format!(
                "SPI page reply carries {} data words instead of {}",
                data.len(),
                SPI_PAGE_BYTES
            )));
        }
        Ok(ReadSpiPageReply {
            addr: merge_u32(words[0], words[1]),
            num_bytes,
            bytes: data.iter().map(|w| *w as u8).collect(),
            read_success: words[words.len() - 1] != 0,
        })
    }

    fn pack_fields(&self, out: &mut Vec<u8>) {
        put_u32_halves(out, self.addr);
        put_u16(out, self.num_bytes);
        for b in &self.bytes {
            put_u16(out, *b as u16);
        }
        put_bool(out, self.read_success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_is_big_endian_opcode_then_seq() {
        let frame = encode(&ReadWishboneReq { addr: 0x00010002 }, 0xABCD);
        assert_eq!(
            &frame[..4],
            &[0x00, 0x01, 0xAB, 0xCD],
            "header must be BE opcode then BE seq"
        );
        assert_eq!(&frame[4..], &[0x00, 0x01, 0x00, 0x02], "address split hi/lo");
    }

    #[test]
    fn test_read_wishbone_reply_round_trip() {
        let reply = ReadWishboneReply {
            addr: 0xDEAD_BEEF,
            data: 0x1234_5678,
        };
        let frame = encode_reply(&reply, 7);
        let req = ReadWishboneReq { addr: 0xDEAD_BEEF };
        assert_eq!(decode_reply(&req, &frame).unwrap(), reply);
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.command, Opcode::ReadWishbone.reply_id());
        assert_eq!(header.seq, 7);
    }

    #[test]
    fn test_write_wishbone_reply_round_trip() {
        let reply = WriteWishboneReply {
            addr: 0x0000_0040,
            data: 0xFFFF_0000,
        };
        let frame = encode_reply(&reply, 0xFFFF);
        let req = WriteWishboneReq {
            addr: 0x0000_0040,
            data: 0xFFFF_0000,
        };
        assert_eq!(decode_reply(&req, &frame).unwrap(), reply);
    }

    #[test]
    fn test_bulk_read_reply_reslices_nested_data() {
        let data: Vec<u8> = (0u8..20).collect();
        let reply = BulkReadWishboneReply {
            addr: 0x100,
            num_words: 5,
            data: data.clone(),
        };
        let frame = encode_reply(&reply, 3);
        let req = BulkReadWishboneReq {
            addr: 0x100,
            num_words: 5,
        };
        let decoded = decode_reply(&req, &frame).unwrap();
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn test_bulk_read_reply_word_count_mismatch_is_malformed() {
        let reply = BulkReadWishboneReply {
            addr: 0x100,
            num_words: 6, // lies about its own length
            data: (0u8..20).collect(),
        };
        let frame = encode_reply(&reply, 3);
        let req = BulkReadWishboneReq {
            addr: 0x100,
            num_words: 5,
        };
        assert!(matches!(
            decode_reply(&req, &frame),
            Err(BoardctlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_sdram_reconfigure_reply_round_trip() {
        let reply = SdramReconfigureReply {
            frames_received: 1200,
            frames_bad: 0,
            frames_overload: 2,
        };
        let frame = encode_reply(&reply, 99);
        let req = SdramReconfigureReq::default();
        assert_eq!(decode_reply(&req, &frame).unwrap(), reply);
    }

    #[test]
    fn test_board_reg_reply_round_trip() {
        let reply = WriteBoardRegReply {
            reg_id: BoardReg::LogicReset as u16,
            data: 1,
        };
        let frame = encode_reply(&reply, 12);
        let req = WriteBoardRegReq {
            reg: BoardReg::LogicReset,
            data: 1,
        };
        assert_eq!(decode_reply(&req, &frame).unwrap(), reply);
    }

    #[test]
    fn test_flash_read_reply_round_trip() {
        let words: Vec<u16> = (0..64).map(|i| i * 3).collect();
        let reply = ReadFlashWordsReply {
            addr: 0x2_0000,
            num_words: 64,
            words: words.clone(),
        };
        let frame = encode_reply(&reply, 17);
        let req = ReadFlashWordsReq {
            addr: 0x2_0000,
            num_words: 64,
        };
        assert_eq!(decode_reply(&req, &frame).unwrap().words, words);
    }

    #[test]
    fn test_spi_page_reply_round_trip() {
        let bytes: Vec<u8> = (0..SPI_PAGE_BYTES).map(|i| (i % 251) as u8).collect();
        let reply = ReadSpiPageReply {
            addr: 0x840,
            num_bytes: SPI_PAGE_BYTES as u16,
            bytes: bytes.clone(),
            read_success: true,
        };
        let frame = encode_reply(&reply, 21);
        let req = ReadSpiPageReq {
            addr: 0x840,
            num_bytes: SPI_PAGE_BYTES as u16,
        };
        let decoded = decode_reply(&req, &frame).unwrap();
        assert_eq!(decoded.bytes, bytes);
        assert!(decoded.read_success);
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let frame = encode_reply(
            &ReadWishboneReply {
                addr: 0,
                data: 0,
            },
            1,
        );
        let req = ReadWishboneReq { addr: 0 };
        assert!(matches!(
            decode_reply(&req, &frame[..frame.len() - 2]),
            Err(BoardctlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_header_shorter_than_four_bytes_is_malformed() {
        assert!(matches!(
            peek_header(&[0x00, 0x02]),
            Err(BoardctlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_sdram_program_packs_raw_chunk() {
        let chunk = vec![0x5A; IMAGE_CHUNK_BYTES];
        let frame = encode(
            &SdramProgramReq {
                first_packet: true,
                last_packet: false,
                chunk: chunk.clone(),
            },
            0,
        );
        // header (2 words) + flags (2 words) + raw chunk
        assert_eq!(frame.len(), 8 + IMAGE_CHUNK_BYTES);
        assert_eq!(&frame[4..8], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&frame[8..], &chunk[..]);
    }
}
