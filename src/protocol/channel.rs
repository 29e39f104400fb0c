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

//! The sequenced request/response channel.
//!
//! UDP gives no delivery or ordering guarantee, so the protocol's own
//! (sequence number, command id) pair is the only application-level
//! correctness check: every exchange validates both fields before trusting a
//! payload. A failed validation is a desynchronization signal (typically a
//! stale reply to an earlier timed-out request arriving late) and is
//! deliberately not retried; retrying would consume the next good reply too.
//!
//! One channel owns one sequence number and therefore allows exactly one
//! outstanding request. Callers sharing a channel across tasks must serialize
//! access externally; fleet operations instead give every board its own
//! channel (see [`crate::fleet`]).

use crate::config::{ChannelConfig, FIRMWARE_VERSION_ADDR};
use crate::error::BoardctlError;
use crate::protocol::codec::{self, ReadWishboneReq, WireRequest};
use log::{debug, trace, warn};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::Duration;

/// How long `drain` keeps listening for further stale datagrams once the
/// queue has gone quiet.
const DRAIN_SWEEP_TIMEOUT: Duration = Duration::from_millis(50);

/// A control/fabric socket pair with a monotonic 16-bit sequence number.
#[derive(Debug)]
pub struct SequencedChannel {
    config: ChannelConfig,
    /// Acknowledged request/response endpoint.
    control: UdpSocket,
    /// Fire-and-forget bulk transfer endpoint.
    fabric: UdpSocket,
    seq: u16,
}

impl SequencedChannel {
    /// Open both endpoints to the board described by `config`.
    ///
    /// # Returns: `Result<SequencedChannel, BoardctlError>`
    /// * `Ok(SequencedChannel)` - Connected channel, sequence number 0
    /// * `Err(BoardctlError::Socket)` - Bind, connect or timeout setup failed
    pub fn connect(config: ChannelConfig) -> Result<Self, BoardctlError> {
        let control = Self::open_socket(&config.host, config.control_port, config.timeout)?;
        let fabric = Self::open_socket(&config.host, config.fabric_port, config.timeout)?;
        debug!(
            "channel to {} open (control {}, fabric {})",
            config.host, config.control_port, config.fabric_port
        );
        Ok(SequencedChannel {
            config,
            control,
            fabric,
            seq: 0,
        })
    }

    fn open_socket(host: &str, port: u16, timeout: Duration) -> Result<UdpSocket, BoardctlError> {
        let sock = UdpSocket::bind("0.0.0.0:0").map_err(|e| BoardctlError::Socket {
            op: "bind",
            e,
        })?;
        sock.connect((host, port)).map_err(|e| BoardctlError::Socket {
            op: "connect",
            e,
        })?;
        sock.set_read_timeout(Some(timeout))
            .map_err(|e| BoardctlError::Socket {
                op: "set_read_timeout",
                e,
            })?;
        Ok(sock)
    }

    /// The configuration this channel was built with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current sequence number (the one the next request will carry).
    pub fn sequence(&self) -> u16 {
        self.seq
    }

    /// Force the sequence number, e.g. after an operator interrupt left the
    /// channel in an unknown state. Normal operation never needs this.
    pub fn set_sequence(&mut self, seq: u16) {
        trace!("sequence number forced from 0x{:04X} to 0x{seq:04X}", self.seq);
        self.seq = seq;
    }

    fn advance(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    /// One acknowledged exchange with the default retry budget.
    pub fn exchange<R: WireRequest>(&mut self, req: &R) -> Result<R::Reply, BoardctlError> {
        self.exchange_with_budget(req, self.config.max_retries)
    }

    /// One acknowledged exchange: send, await, retransmit on timeout,
    /// validate sequence number and command id.
    ///
    /// `max_retries` bounds the total number of transmissions of this
    /// payload. On success the sequence number advances; on failure it does
    /// not, so a retried whole operation reuses it.
    ///
    /// # Returns: `Result<R::Reply, BoardctlError>`
    /// * `Ok(R::Reply)` - Decoded, validated reply
    /// * `Err(BoardctlError::RequestTimeout)` - No datagram within any attempt
    /// * `Err(BoardctlError::ProtocolMismatch)` - Wrong command id or sequence
    ///   number; never retried
    /// * `Err(BoardctlError::MalformedResponse)` - Reply shorter than its layout
    pub fn exchange_with_budget<R: WireRequest>(
        &mut self,
        req: &R,
        max_retries: u32,
    ) -> Result<R::Reply, BoardctlError> {
        let payload = codec::encode(req, self.seq);
        self.check_datagram_size(payload.len())?;
        let mut buf = vec![0u8; self.config.max_datagram_bytes];
        let mut attempts = 0;
        loop {
            attempts += 1;
            trace!(
                "tx 0x{:04X} seq 0x{:04X} attempt {attempts}/{max_retries}",
                R::OPCODE as u16,
                self.seq
            );
            self.control
                .send(&payload)
                .map_err(|e| BoardctlError::Socket { op: "send", e })?;

            match self.control.recv(&mut buf) {
                Ok(n) => {
                    let header = codec::peek_header(&buf[..n])?;
                    if header.command != R::OPCODE.reply_id() || header.seq != self.seq {
                        return Err(BoardctlError::ProtocolMismatch {
                            expected_id: R::OPCODE.reply_id(),
                            got_id: header.command,
                            expected_seq: self.seq,
                            got_seq: header.seq,
                        });
                    }
                    let reply = codec::decode_reply(req, &buf[..n])?;
                    self.advance();
                    return Ok(reply);
                }
                Err(e) if is_timeout(&e) => {
                    if attempts >= max_retries {
                        return Err(BoardctlError::RequestTimeout {
                            attempts,
                            timeout_ms: self.config.timeout.as_millis() as u64,
                        });
                    }
                    debug!(
                        "no reply to 0x{:04X} seq 0x{:04X} within {:?}, retransmitting",
                        R::OPCODE as u16,
                        self.seq,
                        self.config.timeout
                    );
                }
                Err(e) => return Err(BoardctlError::Socket { op: "recv", e }),
            }
        }
    }

    /// Send a request the board will not answer (e.g. a shutdown register
    /// write) on the control endpoint, then advance the sequence number.
    pub fn send_no_reply<R: WireRequest>(&mut self, req: &R) -> Result<(), BoardctlError> {
        let payload = codec::encode(req, self.seq);
        self.check_datagram_size(payload.len())?;
        trace!(
            "tx 0x{:04X} seq 0x{:04X} (no reply expected)",
            R::OPCODE as u16,
            self.seq
        );
        self.control
            .send(&payload)
            .map_err(|e| BoardctlError::Socket { op: "send", e })?;
        self.advance();
        Ok(())
    }

    /// Send one fire-and-forget datagram on the fabric endpoint, then advance
    /// the sequence number. Used only for image chunks.
    pub fn send_fabric<R: WireRequest>(&mut self, req: &R) -> Result<(), BoardctlError> {
        let payload = codec::encode(req, self.seq);
        self.check_datagram_size(payload.len())?;
        self.fabric
            .send(&payload)
            .map_err(|e| BoardctlError::Socket { op: "send", e })?;
        self.advance();
        Ok(())
    }

    fn check_datagram_size(&self, len: usize) -> Result<(), BoardctlError> {
        if len > self.config.max_datagram_bytes {
            return Err(BoardctlError::Argument(format!(
                "encoded packet of {len} bytes exceeds the {} byte datagram ceiling",
                self.config.max_datagram_bytes
            )));
        }
        Ok(())
    }

    /// Discard any queued stale datagrams and re-establish the sequence
    /// invariant with one probe exchange. Call after an operator interrupt
    /// or a surfaced [`BoardctlError::ProtocolMismatch`].
    ///
    /// # Returns: `Result<usize, BoardctlError>`
    /// * `Ok(usize)` - Number of stale datagrams discarded
    /// * `Err(BoardctlError::SequenceSet)` - The probe itself desynchronized;
    ///   the channel cannot recover without reconnecting
    pub fn drain(&mut self) -> Result<usize, BoardctlError> {
        self.control
            .set_read_timeout(Some(DRAIN_SWEEP_TIMEOUT))
            .map_err(|e| BoardctlError::Socket {
                op: "set_read_timeout",
                e,
            })?;
        let mut buf = vec![0u8; self.config.max_datagram_bytes];
        let mut discarded = 0;
        loop {
            match self.control.recv(&mut buf) {
                Ok(_) => discarded += 1,
                Err(e) if is_timeout(&e) => break,
                Err(e) => {
                    // restore the timeout before bailing out
                    let _ = self.control.set_read_timeout(Some(self.config.timeout));
                    return Err(BoardctlError::Socket { op: "recv", e });
                }
            }
        }
        self.control
            .set_read_timeout(Some(self.config.timeout))
            .map_err(|e| BoardctlError::Socket {
                op: "set_read_timeout",
                e,
            })?;
        if discarded > 0 {
            warn!("drained {discarded} stale datagrams from {}", self.config.host);
        }

        match self.exchange(&ReadWishboneReq {
            addr: FIRMWARE_VERSION_ADDR,
        }) {
            Ok(_) => Ok(discarded),
            Err(BoardctlError::ProtocolMismatch { got_seq, .. }) => {
                Err(BoardctlError::SequenceSet(format!(
                    "probe after drain still desynchronized (device answered seq 0x{got_seq:04X}, \
                     expected 0x{:04X})",
                    self.seq
                )))
            }
            Err(e) => Err(e),
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
