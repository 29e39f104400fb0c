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

//! Wire-protocol and flash-geometry constants, plus per-channel configuration.
//!
//! Everything here is fixed by the embedded microcontroller firmware; none of
//! it is negotiated at runtime. Tunables that may legitimately differ between
//! deployments (timeouts, retry budgets, datagram ceiling) live on
//! [`ChannelConfig`] and are set at construction time.

use std::time::Duration;

/// UDP port of the control endpoint (acknowledged request/response).
pub const CONTROL_PORT: u16 = 30584;

/// UDP port of the fabric endpoint, used only for fire-and-forget image chunks.
pub const FABRIC_PORT: u16 = 30585;

/// Size of one configuration-image chunk on the fabric endpoint. Images are
/// padded to a multiple of this before transmission.
pub const IMAGE_CHUNK_BYTES: usize = 8192;

/// Byte offset of the 12-byte magic marker inside a canonical image.
pub const IMAGE_MAGIC_OFFSET: usize = 30;

/// Magic marker a canonical configuration image must carry at
/// [`IMAGE_MAGIC_OFFSET`]. A word-swapped match is also accepted and forces a
/// whole-image word swap before use.
pub const IMAGE_MAGIC: [u8; 12] = [
    0xAA, 0x99, 0x55, 0x66, 0x20, 0x00, 0x00, 0x00, 0x30, 0x02, 0x20, 0x01,
];

/// Maximum number of 32-bit words a single bulk read/write request may carry.
/// This is a wire-format limit of the embedded controller, not of this crate.
pub const MAX_BULK_WORDS: usize = 497;

/// Number of 16-bit words in one NOR flash program request.
pub const NOR_PROGRAM_WORDS: usize = 256;

/// Logical NOR program block: two chained [`NOR_PROGRAM_WORDS`] requests
/// flagged start/finish.
pub const NOR_BLOCK_WORDS: usize = 512;

/// NOR erase block size in 16-bit words; erase addresses are multiples of it.
pub const NOR_ERASE_BLOCK_WORDS: u32 = 0x0001_0000;

/// Size of one SPI flash page in bytes.
pub const SPI_PAGE_BYTES: usize = 264;

/// Fixed byte addresses of the SPI flash sectors, in erase order. The first
/// two entries are the small boot sector and the remainder of sector zero;
/// the rest are full 256-page sectors.
pub const SPI_SECTOR_ADDRS: [u32; 17] = [
    0x0000_0000,
    0x0000_0840,
    0x0001_0800,
    0x0002_1000,
    0x0003_1800,
    0x0004_2000,
    0x0005_2800,
    0x0006_3000,
    0x0007_3800,
    0x0008_4000,
    0x0009_4800,
    0x000A_5000,
    0x000B_5800,
    0x000C_6000,
    0x000D_6800,
    0x000E_7000,
    0x000F_7800,
];

/// Total addressable size of the SPI flash store in bytes.
pub const SPI_FLASH_BYTES: u32 = 0x0010_8000;

/// Wishbone base address of the staged-image read-back window, used by the
/// opt-in post-upload verification pass.
pub const STAGING_BASE_ADDR: u32 = 0x0400_0000;

/// Wishbone address of the identity/version register: firmware major
/// version in the high half, minor in the low half. Also the liveness probe
/// target.
pub const FIRMWARE_VERSION_ADDR: u32 = 0x0000_0010;

/// Wishbone address of the boot-status register: bit 0 set when the board
/// fell back to the golden image, bit 1 when it booted the multiboot image.
pub const BOOT_STATUS_ADDR: u32 = 0x0000_0014;

/// Wishbone address of the register holding the checksum the device computed
/// over the staged image (low 16 bits).
pub const CHECKSUM_REG_ADDR: u32 = 0x0000_0018;

/// Wishbone base address of the sensor telemetry register window.
pub const TELEMETRY_BASE_ADDR: u32 = 0x0002_0000;

/// Number of 32-bit telemetry registers in the window.
pub const TELEMETRY_WORDS: usize = 24;

/// Bounded number of Transmit..Checksum-check cycles the upload engine runs
/// before surfacing `Programming`.
pub const UPLOAD_ATTEMPTS: u32 = 3;

/// Bounded number of whole erase passes the flash engine runs before giving up.
pub const ERASE_PASSES: u32 = 3;

/// Retry budget of the liveness probe, deliberately smaller than the general
/// exchange budget so that connectivity checks stay fast.
pub const PROBE_RETRIES: u32 = 2;

/// Interval between connectivity probes while waiting for a board to come
/// back after a reboot.
pub const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum time to wait for a board to come back after a reboot.
pub const BOOT_POLL_MAX: Duration = Duration::from_secs(30);

/// Per-channel configuration, shared by value and never mutated after
/// construction. One instance describes one board.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Board hostname or IP address.
    pub host: String,
    /// Control endpoint port (acknowledged exchanges).
    pub control_port: u16,
    /// Fabric endpoint port (fire-and-forget image chunks).
    pub fabric_port: u16,
    /// Blocking receive timeout for one exchange attempt.
    pub timeout: Duration,
    /// Total transmissions of one payload before `RequestTimeout`.
    pub max_retries: u32,
    /// Largest datagram the channel will send or accept. Must be large
    /// enough for an image chunk plus framing; the network path must carry
    /// it unfragmented.
    pub max_datagram_bytes: usize,
}

impl ChannelConfig {
    /// Configuration for `host` with every tunable at its default.
    pub fn for_host(host: impl Into<String>) -> Self {
        ChannelConfig {
            host: host.into(),
            ..Default::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            host: "localhost".to_string(),
            control_port: CONTROL_PORT,
            fabric_port: FABRIC_PORT,
            timeout: Duration::from_millis(1500),
            max_retries: 3,
            max_datagram_bytes: 9000,
        }
    }
}
