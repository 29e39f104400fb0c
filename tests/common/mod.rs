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

//! A scripted in-process board: two UDP sockets and a model of the embedded
//! controller, with fault injection knobs for the failure-path tests.
//!
//! Replies are produced with the crate's own codec table, so every test that
//! talks to the mock also exercises the encode/decode round trip.

#![allow(dead_code)]

use boardctl::config::{
    BOOT_STATUS_ADDR, CHECKSUM_REG_ADDR, ChannelConfig, FIRMWARE_VERSION_ADDR, SPI_PAGE_BYTES,
    STAGING_BASE_ADDR,
};
use boardctl::protocol::codec::{
    BulkReadWishboneReply, BulkWriteWishboneReply, EraseFlashBlockReply, EraseSpiSectorReply,
    ProgramFlashWordsReply, ProgramSpiPageReply, ReadFlashWordsReply, ReadSpiPageReply,
    ReadWishboneReply, SdramReconfigureReply, WireReply, WriteBoardRegReply, WriteWishboneReply,
    encode_reply,
};
use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Mutable device model plus fault injection knobs.
#[derive(Debug, Default)]
pub struct MockState {
    /// Wishbone memory; absent words read back as their own address.
    pub memory: HashMap<u32, u32>,
    /// Staging memory contents accumulated from fabric chunks.
    pub staged: Vec<u8>,
    pub frames_received: u16,
    pub frames_bad: u16,
    pub frames_overload: u16,
    /// NOR store; absent words read back erased (0xFFFF).
    pub nor: HashMap<u32, u16>,
    /// SPI store in wire bit order; absent bytes read back erased (0xFF).
    pub spi: HashMap<u32, u8>,
    pub nor_erase_counts: HashMap<u32, u32>,
    pub spi_erase_counts: HashMap<u32, u32>,
    pub version: (u16, u16),
    pub golden_image: bool,
    pub multiboot: bool,
    /// Set once the client marks staging memory finished.
    pub finished_writing: bool,
    /// Boot-source flags applied when a reboot request is processed.
    pub after_boot_golden: bool,
    pub after_boot_multiboot: bool,
    /// Board register writes seen, as (reg id, value).
    pub board_reg_writes: Vec<(u16, u32)>,

    // fault injection
    /// Swallow this many control requests (the client sees timeouts).
    pub drop_requests: u32,
    /// Answer the next request with a wrong sequence number.
    pub wrong_seq_next: bool,
    /// Refuse this many erase requests.
    pub fail_erase_next: u32,
    /// Refuse this many program requests.
    pub fail_program_next: u32,
    /// Corrupt one bit of the next programmed flash unit (the device still
    /// reports success; only verification can catch it).
    pub corrupt_program_data: bool,
    /// Report one word short on the next bulk write.
    pub short_write_next: bool,
    /// Report a zero staged checksum regardless of contents.
    pub zero_checksum: bool,
    /// Skew the reported staged checksum by this much.
    pub checksum_bias: u16,
    /// Silently drop this many fabric chunks.
    pub drop_fabric_next: u32,

    // observability
    pub control_requests: u32,
    pub program_requests: u32,
    pub staging_clears: u32,
    /// (first, last) flags of each fabric chunk received.
    pub fabric_flags: Vec<(bool, bool)>,
}

/// One scripted board listening on loopback.
pub struct MockBoard {
    state: Arc<Mutex<MockState>>,
    control_port: u16,
    fabric_port: u16,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MockBoard {
    pub fn start() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        // any loopback alias works as the host, letting fleet tests give
        // several boards distinct host keys
        let control = UdpSocket::bind("0.0.0.0:0").expect("bind control");
        let fabric = UdpSocket::bind("0.0.0.0:0").expect("bind fabric");
        let control_port = control.local_addr().unwrap().port();
        let fabric_port = fabric.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(MockState {
            version: (3, 11),
            ..Default::default()
        }));
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);
            std::thread::spawn(move || serve(control, fabric, state, running))
        };
        MockBoard {
            state,
            control_port,
            fabric_port,
            running,
            thread: Some(thread),
        }
    }

    /// A channel configuration pointing at this mock, with a short timeout
    /// so failure-path tests stay fast.
    pub fn config(&self) -> ChannelConfig {
        self.config_as("127.0.0.1")
    }

    /// Like [`MockBoard::config`] but with an explicit host key (any
    /// loopback alias reaches the mock).
    pub fn config_as(&self, host: &str) -> ChannelConfig {
        ChannelConfig {
            host: host.to_string(),
            control_port: self.control_port,
            fabric_port: self.fabric_port,
            timeout: Duration::from_millis(200),
            max_retries: 3,
            max_datagram_bytes: 16384,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Drop for MockBoard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(
    control: UdpSocket,
    fabric: UdpSocket,
    state: Arc<Mutex<MockState>>,
    running: Arc<AtomicBool>,
) {
    control
        .set_read_timeout(Some(Duration::from_millis(10)))
        .unwrap();
    fabric.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 16384];
    let mut fabric_buf = [0u8; 16384];
    // fabric chunks queued before a control request must be applied before
    // that request is answered, as on the real controller
    let mut drain_fabric = |st: &mut MockState| {
        while let Ok((n, _)) = fabric.recv_from(&mut fabric_buf) {
            handle_fabric(st, &fabric_buf[..n]);
        }
    };
    while running.load(Ordering::SeqCst) {
        match control.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let mut st = state.lock().unwrap();
                drain_fabric(&mut st);
                st.control_requests += 1;
                if st.drop_requests > 0 {
                    st.drop_requests -= 1;
                } else if let Some(reply) = handle_control(&mut st, &buf[..n]) {
                    let _ = control.send_to(&reply, peer);
                }
            }
            Err(_) => {
                drain_fabric(&mut state.lock().unwrap());
            }
        }
    }
}

fn words_of(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect()
}

fn merge(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

fn read_memory_word(st: &MockState, addr: u32) -> u32 {
    if addr >= STAGING_BASE_ADDR {
        let idx = (addr - STAGING_BASE_ADDR) as usize;
        let byte = |i: usize| st.staged.get(idx + i).copied().unwrap_or(0xFF);
        return u32::from_be_bytes([byte(0), byte(1), byte(2), byte(3)]);
    }
    match addr {
        FIRMWARE_VERSION_ADDR => ((st.version.0 as u32) << 16) | st.version.1 as u32,
        BOOT_STATUS_ADDR => (st.golden_image as u32) | ((st.multiboot as u32) << 1),
        CHECKSUM_REG_ADDR => {
            if st.zero_checksum {
                0
            } else {
                staged_checksum(st).wrapping_add(st.checksum_bias) as u32
            }
        }
        _ => st.memory.get(&addr).copied().unwrap_or(addr),
    }
}

fn staged_checksum(st: &MockState) -> u16 {
    st.staged
        .chunks_exact(2)
        .fold(0u16, |acc, pair| {
            acc.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]))
        })
}

fn reply_frame<P: WireReply>(st: &mut MockState, reply: &P, seq: u16) -> Vec<u8> {
    let seq = if st.wrong_seq_next {
        st.wrong_seq_next = false;
        seq.wrapping_add(1)
    } else {
        seq
    };
    encode_reply(reply, seq)
}

fn handle_control(st: &mut MockState, payload: &[u8]) -> Option<Vec<u8>> {
    let words = words_of(payload);
    let opcode = words[0];
    let seq = words[1];
    match opcode {
        // ReadWishbone
        0x0001 => {
            let addr = merge(words[2], words[3]);
            let data = read_memory_word(st, addr);
            Some(reply_frame(st, &ReadWishboneReply { addr, data }, seq))
        }
        // WriteWishbone
        0x0003 => {
            let addr = merge(words[2], words[3]);
            let data = merge(words[4], words[5]);
            st.memory.insert(addr, data);
            Some(reply_frame(st, &WriteWishboneReply { addr, data }, seq))
        }
        // BulkReadWishbone
        0x0005 => {
            let addr = merge(words[2], words[3]);
            let num_words = words[4];
            let mut data = Vec::with_capacity(num_words as usize * 4);
            for i in 0..num_words as u32 {
                data.extend_from_slice(&read_memory_word(st, addr + i * 4).to_be_bytes());
            }
            Some(reply_frame(
                st,
                &BulkReadWishboneReply {
                    addr,
                    num_words,
                    data,
                },
                seq,
            ))
        }
        // BulkWriteWishbone
        0x0007 => {
            let addr = merge(words[2], words[3]);
            let num_words = words[4];
            for i in 0..num_words as usize {
                let value = merge(words[5 + i * 2], words[6 + i * 2]);
                st.memory.insert(addr + (i * 4) as u32, value);
            }
            let words_written = if st.short_write_next {
                st.short_write_next = false;
                num_words.saturating_sub(1)
            } else {
                num_words
            };
            Some(reply_frame(
                st,
                &BulkWriteWishboneReply {
                    addr,
                    words_written,
                },
                seq,
            ))
        }
        // SdramReconfigure
        0x0009 => {
            let clear_sdram = words[2] != 0;
            let do_reboot = words[5] != 0;
            let reset_counters = words[6] != 0;
            if clear_sdram {
                st.staged.clear();
                st.finished_writing = false;
                st.staging_clears += 1;
            }
            if words[3] != 0 {
                st.finished_writing = true;
            }
            if reset_counters {
                st.frames_received = 0;
                st.frames_bad = 0;
                st.frames_overload = 0;
            }
            if do_reboot {
                // board drops off the wire and comes back with new flags
                st.golden_image = st.after_boot_golden;
                st.multiboot = st.after_boot_multiboot;
                return None;
            }
            let reply = SdramReconfigureReply {
                frames_received: st.frames_received,
                frames_bad: st.frames_bad,
                frames_overload: st.frames_overload,
            };
            Some(reply_frame(st, &reply, seq))
        }
        // WriteBoardReg
        0x000D => {
            let reg_id = words[2];
            let data = merge(words[3], words[4]);
            st.board_reg_writes.push((reg_id, data));
            // reboot and shutdown take the controller down before it answers
            if reg_id == 0x0001 || reg_id == 0x0002 {
                return None;
            }
            Some(reply_frame(st, &WriteBoardRegReply { reg_id, data }, seq))
        }
        // EraseFlashBlock
        0x000F => {
            let addr = merge(words[2], words[3]);
            let erase_success = if st.fail_erase_next > 0 {
                st.fail_erase_next -= 1;
                false
            } else {
                *st.nor_erase_counts.entry(addr).or_insert(0) += 1;
                true
            };
            Some(reply_frame(
                st,
                &EraseFlashBlockReply {
                    addr,
                    erase_success,
                },
                seq,
            ))
        }
        // ProgramFlashWords
        0x0011 => {
            st.program_requests += 1;
            let addr = merge(words[2], words[3]);
            let packet_num_words = words[5];
            let program_success = if st.fail_program_next > 0 {
                st.fail_program_next -= 1;
                false
            } else {
                for i in 0..packet_num_words as usize {
                    st.nor.insert(addr + i as u32, words[8 + i]);
                }
                if st.corrupt_program_data {
                    st.corrupt_program_data = false;
                    st.nor.entry(addr).and_modify(|w| *w ^= 0x0001);
                }
                true
            };
            Some(reply_frame(
                st,
                &ProgramFlashWordsReply {
                    addr,
                    program_success,
                },
                seq,
            ))
        }
        // ReadFlashWords
        0x0013 => {
            let addr = merge(words[2], words[3]);
            let num_words = words[4];
            let data: Vec<u16> = (0..num_words as u32)
                .map(|i| st.nor.get(&(addr + i)).copied().unwrap_or(0xFFFF))
                .collect();
            Some(reply_frame(
                st,
                &ReadFlashWordsReply {
                    addr,
                    num_words,
                    words: data,
                },
                seq,
            ))
        }
        // EraseSpiSector
        0x0015 => {
            let addr = merge(words[2], words[3]);
            let erase_success = if st.fail_erase_next > 0 {
                st.fail_erase_next -= 1;
                false
            } else {
                *st.spi_erase_counts.entry(addr).or_insert(0) += 1;
                true
            };
            Some(reply_frame(
                st,
                &EraseSpiSectorReply {
                    addr,
                    erase_success,
                },
                seq,
            ))
        }
        // ProgramSpiPage
        0x0017 => {
            st.program_requests += 1;
            let addr = merge(words[2], words[3]);
            let program_success = if st.fail_program_next > 0 {
                st.fail_program_next -= 1;
                false
            } else {
                for i in 0..SPI_PAGE_BYTES {
                    st.spi.insert(addr + i as u32, words[5 + i] as u8);
                }
                if st.corrupt_program_data {
                    st.corrupt_program_data = false;
                    st.spi.entry(addr).and_modify(|b| *b ^= 0x01);
                }
                true
            };
            Some(reply_frame(
                st,
                &ProgramSpiPageReply {
                    addr,
                    program_success,
                },
                seq,
            ))
        }
        // ReadSpiPage
        0x0019 => {
            let addr = merge(words[2], words[3]);
            let num_bytes = words[4];
            let bytes: Vec<u8> = (0..SPI_PAGE_BYTES)
                .map(|i| st.spi.get(&(addr + i as u32)).copied().unwrap_or(0xFF))
                .collect();
            Some(reply_frame(
                st,
                &ReadSpiPageReply {
                    addr,
                    num_bytes,
                    bytes,
                    read_success: true,
                },
                seq,
            ))
        }
        _ => None,
    }
}

fn handle_fabric(st: &mut MockState, payload: &[u8]) {
    if st.drop_fabric_next > 0 {
        st.drop_fabric_next -= 1;
        return;
    }
    // header (2 words) + first/last flags (2 words), then the raw chunk
    let words = words_of(&payload[..8]);
    st.fabric_flags.push((words[2] != 0, words[3] != 0));
    st.staged.extend_from_slice(&payload[8..]);
    st.frames_received += 1;
}
