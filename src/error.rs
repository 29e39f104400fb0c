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

use std::path::PathBuf;

/// Error taxonomy for every fallible operation in the crate.
///
/// The protocol-level variants map one-to-one onto the failure modes of the
/// sequenced exchange: `RequestTimeout` is the only transient one and is
/// produced after the per-exchange retry budget is spent; `ProtocolMismatch`
/// signals desynchronization (a stale or foreign datagram) and is never
/// produced by simple packet loss. The engine-level variants describe which
/// workflow step gave up and leave the board in the inspectable state
/// documented on the operation that returned them.
#[derive(Debug, thiserror::Error)]
pub enum BoardctlError {
    #[error(
        "BoardctlError::RequestTimeout: no response after {attempts} transmissions ({timeout_ms} ms each)"
    )]
    RequestTimeout { attempts: u32, timeout_ms: u64 },
    #[error(
        "BoardctlError::ProtocolMismatch: expected command 0x{expected_id:04X} seq 0x{expected_seq:04X}, got command 0x{got_id:04X} seq 0x{got_seq:04X}"
    )]
    ProtocolMismatch {
        expected_id: u16,
        got_id: u16,
        expected_seq: u16,
        got_seq: u16,
    },
    #[error("BoardctlError::MalformedResponse: {0}")]
    MalformedResponse(String),
    #[error("BoardctlError::InvalidBitstream: {0}")]
    InvalidBitstream(String),
    #[error(
        "BoardctlError::ChecksumMismatch: local checksum 0x{local:04X} but device reported 0x{reported:04X}"
    )]
    ChecksumMismatch { local: u16, reported: u16 },
    #[error("BoardctlError::Programming: {0}")]
    Programming(String),
    #[error("BoardctlError::WriteFailed: {0}")]
    WriteFailed(String),
    #[error("BoardctlError::ReadFailed: {0}")]
    ReadFailed(String),
    #[error("BoardctlError::SequenceSet: {0}")]
    SequenceSet(String),
    #[error("BoardctlError::Argument: {0}")]
    Argument(String),
    #[error("BoardctlError::Socket: An IO error occurred during {op}: {e}")]
    Socket { op: &'static str, e: std::io::Error },
    #[error("BoardctlError::File: An IO error occurred when reading {file:?}: {e}")]
    File { file: PathBuf, e: std::io::Error },
    #[error("BoardctlError::Internal: An internal error occurred: {0}")]
    Internal(String),
}
