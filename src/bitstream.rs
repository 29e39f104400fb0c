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

//! Configuration-image normalization and validation.
//!
//! Boards consume one canonical image form: big-endian 16-bit words, padded
//! with 0xFF to a multiple of the fabric chunk size, carrying the magic
//! marker at byte offset 30. Toolflows hand us that form wrapped in several
//! containers; [`BitstreamImage::from_file`] auto-detects the container and
//! unwraps it:
//!
//! - an archive with a text header terminated by a literal `?quit` line,
//!   whose payload may be gzip-compressed;
//! - a raw payload behind a fixed 32-byte 0xFF marker, stored with every
//!   byte bit-reversed;
//! - ASCII hex, four characters per little-endian 16-bit word;
//! - the canonical binary itself.
//!
//! A magic marker found word-swapped forces a whole-image word swap before
//! acceptance, so downstream code never sees the swapped orientation.

use crate::config::{IMAGE_CHUNK_BYTES, IMAGE_MAGIC, IMAGE_MAGIC_OFFSET};
use crate::error::BoardctlError;
use flate2::read::GzDecoder;
use log::{debug, trace};
use std::io::Read;
use std::path::Path;

/// Sentinel line terminating an archive's text header.
const ARCHIVE_SENTINEL: &[u8] = b"?quit";

/// Length of the 0xFF marker header on bit-reversed payloads.
const MARKER_HEADER_BYTES: usize = 32;

/// Gzip stream signature.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Container formats accepted by [`BitstreamImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// `?quit`-terminated text header plus (possibly gzipped) payload.
    Archive,
    /// 32-byte 0xFF marker header plus bit-reversed payload.
    MarkerBin,
    /// Four ASCII hex characters per little-endian 16-bit word.
    AsciiHex,
    /// Canonical big-endian binary.
    Raw,
}

/// A validated configuration image in canonical form: word-swap resolved and
/// padded to a multiple of [`IMAGE_CHUNK_BYTES`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitstreamImage {
    bytes: Vec<u8>,
    payload_len: usize,
}

impl BitstreamImage {
    /// Load and normalize an image file, auto-detecting its container from
    /// the extension and, failing that, the content.
    ///
    /// # Returns: `Result<BitstreamImage, BoardctlError>`
    /// * `Ok(BitstreamImage)` - Canonical, validated, chunk-padded image
    /// * `Err(BoardctlError::File)` - The file could not be read
    /// * `Err(BoardctlError::InvalidBitstream)` - Container malformed or
    ///   magic marker absent in both orientations
    pub fn from_file(path: &Path) -> Result<Self, BoardctlError> {
        let raw = std::fs::read(path).map_err(|e| BoardctlError::File {
            file: path.into(),
            e,
        })?;
        let format = detect_format(path, &raw);
        debug!("loading {path:?} as {format:?} ({} bytes)", raw.len());
        Self::from_raw(raw, format)
    }

    /// Normalize `raw` given a known container format.
    pub fn from_raw(raw: Vec<u8>, format: ImageFormat) -> Result<Self, BoardctlError> {
        let payload = match format {
            ImageFormat::Archive => {
                let inner = unwrap_archive(&raw)?;
                // archives may carry the marker container inside
                if has_marker_header(&inner) {
                    strip_marker_and_reverse(inner)?
                } else {
                    inner
                }
            }
            ImageFormat::MarkerBin => strip_marker_and_reverse(raw)?,
            ImageFormat::AsciiHex => parse_ascii_hex(&raw)?,
            ImageFormat::Raw => raw,
        };
        canonicalize(payload)
    }

    /// The canonical padded bytes, ready for chunked transmission.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the image before chunk padding was applied.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// The fabric chunks, each exactly [`IMAGE_CHUNK_BYTES`] long.
    pub fn chunks(&self) -> impl ExactSizeIterator<Item = &[u8]> {
        self.bytes.chunks(IMAGE_CHUNK_BYTES)
    }

    /// The 16-bit running-sum checksum over the whole padded image, as the
    /// device computes it on its side of the fabric link.
    pub fn checksum(&self) -> u16 {
        let mut acc = ImageChecksum::new();
        acc.update(&self.bytes);
        acc.finish()
    }
}

/// Streaming form of the image checksum: the sum of all big-endian 16-bit
/// words mod 65536, fed chunk by chunk. Chunks must be even-sized, which
/// every canonical image chunk is.
#[derive(Debug, Default)]
pub struct ImageChecksum {
    sum: u16,
}

impl ImageChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        debug_assert_eq!(chunk.len() % 2, 0);
        for pair in chunk.chunks_exact(2) {
            self.sum = self
                .sum
                .wrapping_add(u16::from_be_bytes([pair[0], pair[1]]));
        }
    }

    pub fn finish(&self) -> u16 {
        self.sum
    }
}

/// Decide the container format from the file extension, falling back to
/// content sniffing for unknown extensions.
pub fn detect_format(path: &Path, raw: &[u8]) -> ImageFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("fpg") => ImageFormat::Archive,
        Some("bin") => ImageFormat::MarkerBin,
        Some("hex") => ImageFormat::AsciiHex,
        _ => {
            if raw.starts_with(b"?") {
                ImageFormat::Archive
            } else if has_marker_header(raw) {
                ImageFormat::MarkerBin
            } else if !raw.is_empty()
                && raw
                    .iter()
                    .all(|b| b.is_ascii_hexdigit() || b.is_ascii_whitespace())
            {
                ImageFormat::AsciiHex
            } else {
                ImageFormat::Raw
            }
        }
    }
}

fn has_marker_header(raw: &[u8]) -> bool {
    raw.len() > MARKER_HEADER_BYTES && raw[..MARKER_HEADER_BYTES].iter().all(|b| *b == 0xFF)
}

/// Drop the text header up to and including the sentinel line, then gunzip
/// the payload if it carries the gzip signature.
fn unwrap_archive(raw: &[u8]) -> Result<Vec<u8>, BoardctlError> {
    let mut cursor = 0;
    let payload_start = loop {
        let line_end = raw[cursor..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| cursor + p)
            .ok_or_else(|| {
                BoardctlError::InvalidBitstream(
                    "archive header never terminated by a sentinel line".to_string(),
                )
            })?;
        let line = &raw[cursor..line_end];
        if line.strip_suffix(b"\r").unwrap_or(line) == ARCHIVE_SENTINEL {
            break line_end + 1;
        }
        cursor = line_end + 1;
    };
    let payload = &raw[payload_start..];
    if payload.starts_with(&GZIP_MAGIC) {
        trace!("archive payload is gzip-compressed, inflating");
        let mut inflated = Vec::new();
        GzDecoder::new(payload)
            .read_to_end(&mut inflated)
            .map_err(|e| {
                BoardctlError::InvalidBitstream(format!("archive payload failed to inflate: {e}"))
            })?;
        Ok(inflated)
    } else {
        Ok(payload.to_vec())
    }
}

/// Strip the 0xFF marker header and undo the storage bit order.
fn strip_marker_and_reverse(raw: Vec<u8>) -> Result<Vec<u8>, BoardctlError> {
    if !has_marker_header(&raw) {
        return Err(BoardctlError::InvalidBitstream(format!(
            "expected a {MARKER_HEADER_BYTES}-byte 0xFF marker header"
        )));
    }
    Ok(raw[MARKER_HEADER_BYTES..]
        .iter()
        .map(|b| b.reverse_bits())
        .collect())
}

/// Group every four hex characters into one little-endian 16-bit word and
/// emit the canonical big-endian byte form.
fn parse_ascii_hex(raw: &[u8]) -> Result<Vec<u8>, BoardctlError> {
    let digits: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.is_empty() || digits.len() % 4 != 0 {
        return Err(BoardctlError::InvalidBitstream(format!(
            "hex image must be a multiple of 4 digits, got {}",
            digits.len()
        )));
    }
    let mut out = Vec::with_capacity(digits.len() / 2);
    for group in digits.chunks_exact(4) {
        let text = std::str::from_utf8(group)
            .map_err(|_| BoardctlError::InvalidBitstream("non-ASCII hex digit".to_string()))?;
        let lo = u8::from_str_radix(&text[0..2], 16).map_err(|_| {
            BoardctlError::InvalidBitstream(format!("invalid hex digits {text:?}"))
        })?;
        let hi = u8::from_str_radix(&text[2..4], 16).map_err(|_| {
            BoardctlError::InvalidBitstream(format!("invalid hex digits {text:?}"))
        })?;
        out.extend_from_slice(&u16::from_le_bytes([lo, hi]).to_be_bytes());
    }
    Ok(out)
}

/// Validate the magic marker (resolving a word-swapped image) and pad to a
/// chunk multiple.
fn canonicalize(mut payload: Vec<u8>) -> Result<BitstreamImage, BoardctlError> {
    if payload.len() < IMAGE_MAGIC_OFFSET + IMAGE_MAGIC.len() {
        return Err(BoardctlError::InvalidBitstream(format!(
            "{} bytes is too short to carry the magic marker",
            payload.len()
        )));
    }
    let window = &payload[IMAGE_MAGIC_OFFSET..IMAGE_MAGIC_OFFSET + IMAGE_MAGIC.len()];
    if window != IMAGE_MAGIC {
        let mut swapped_magic = IMAGE_MAGIC;
        for pair in swapped_magic.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
        if window != swapped_magic || payload.len() % 2 != 0 {
            return Err(BoardctlError::InvalidBitstream(
                "magic marker not found at offset 30 in either orientation".to_string(),
            ));
        }
        debug!("magic marker is word-swapped, swapping whole image");
        for pair in payload.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
    }

    let payload_len = payload.len();
    let remainder = payload_len % IMAGE_CHUNK_BYTES;
    if remainder != 0 {
        payload.resize(payload_len + IMAGE_CHUNK_BYTES - remainder, 0xFF);
    }
    trace!(
        "canonical image: {payload_len} payload bytes, {} padded",
        payload.len()
    );
    Ok(BitstreamImage {
        bytes: payload,
        payload_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    /// A minimal canonical payload of `len` bytes with the magic in place.
    fn canonical_payload(len: usize) -> Vec<u8> {
        let mut raw: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
        raw[IMAGE_MAGIC_OFFSET..IMAGE_MAGIC_OFFSET + IMAGE_MAGIC.len()]
            .copy_from_slice(&IMAGE_MAGIC);
        raw
    }

    #[test]
    fn test_exact_chunk_image_needs_no_padding() {
        let image =
            BitstreamImage::from_raw(canonical_payload(IMAGE_CHUNK_BYTES), ImageFormat::Raw)
                .unwrap();
        assert_eq!(image.as_bytes().len(), IMAGE_CHUNK_BYTES);
        assert_eq!(image.chunks().len(), 1, "8192 bytes must be one chunk");
    }

    #[test]
    fn test_one_byte_overflow_pads_second_chunk_with_ff() {
        let image =
            BitstreamImage::from_raw(canonical_payload(IMAGE_CHUNK_BYTES + 1), ImageFormat::Raw)
                .unwrap();
        assert_eq!(image.chunks().len(), 2);
        assert_eq!(image.payload_len(), IMAGE_CHUNK_BYTES + 1);
        let pad = &image.as_bytes()[IMAGE_CHUNK_BYTES + 1..];
        assert_eq!(pad.len(), IMAGE_CHUNK_BYTES - 1, "8191 bytes of padding");
        assert!(pad.iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_chunks_reassemble_to_original_payload() {
        let payload = canonical_payload(3 * IMAGE_CHUNK_BYTES - 100);
        let image = BitstreamImage::from_raw(payload.clone(), ImageFormat::Raw).unwrap();
        let mut reassembled = Vec::new();
        for chunk in image.chunks() {
            assert_eq!(chunk.len(), IMAGE_CHUNK_BYTES);
            reassembled.extend_from_slice(chunk);
        }
        reassembled.truncate(image.payload_len());
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_missing_magic_is_rejected() {
        let mut raw = canonical_payload(IMAGE_CHUNK_BYTES);
        raw[IMAGE_MAGIC_OFFSET] ^= 0xFF;
        assert!(matches!(
            BitstreamImage::from_raw(raw, ImageFormat::Raw),
            Err(BoardctlError::InvalidBitstream(_))
        ));
    }

    #[test]
    fn test_word_swapped_image_is_unswapped() {
        let mut swapped = canonical_payload(IMAGE_CHUNK_BYTES);
        for pair in swapped.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
        let image = BitstreamImage::from_raw(swapped, ImageFormat::Raw).unwrap();
        assert_eq!(
            &image.as_bytes()[..IMAGE_CHUNK_BYTES],
            &canonical_payload(IMAGE_CHUNK_BYTES)[..],
            "swap must be undone before use"
        );
    }

    #[test]
    fn test_marker_bin_strips_header_and_reverses_bits() {
        let payload = canonical_payload(IMAGE_CHUNK_BYTES);
        let mut stored = vec![0xFF; MARKER_HEADER_BYTES];
        stored.extend(payload.iter().map(|b| b.reverse_bits()));
        let image = BitstreamImage::from_raw(stored, ImageFormat::MarkerBin).unwrap();
        assert_eq!(image.as_bytes(), &payload[..]);
    }

    #[test]
    fn test_archive_with_gzip_payload_unwraps() {
        let payload = canonical_payload(IMAGE_CHUNK_BYTES);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&payload).unwrap();
        let compressed = gz.finish().unwrap();
        let mut archive = b"?meta design radiometer_2026\n?meta clock 256\n?quit\n".to_vec();
        archive.extend_from_slice(&compressed);
        let image = BitstreamImage::from_raw(archive, ImageFormat::Archive).unwrap();
        assert_eq!(image.as_bytes(), &payload[..]);
    }

    #[test]
    fn test_archive_without_sentinel_is_rejected() {
        let archive = b"?meta design radiometer_2026\nnot a sentinel\n".to_vec();
        assert!(matches!(
            BitstreamImage::from_raw(archive, ImageFormat::Archive),
            Err(BoardctlError::InvalidBitstream(_))
        ));
    }

    #[test]
    fn test_ascii_hex_groups_to_little_endian_words() {
        // "3412" is the LE spelling of word 0x1234, canonical bytes 12 34
        assert_eq!(parse_ascii_hex(b"3412").unwrap(), vec![0x12, 0x34]);
        assert_eq!(
            parse_ascii_hex(b"34 12\nff 00").unwrap(),
            vec![0x12, 0x34, 0x00, 0xFF]
        );
    }

    #[test]
    fn test_ascii_hex_odd_digit_count_is_rejected() {
        assert!(matches!(
            parse_ascii_hex(b"34121"),
            Err(BoardctlError::InvalidBitstream(_))
        ));
    }

    #[test]
    fn test_streaming_checksum_matches_whole_buffer() {
        let image =
            BitstreamImage::from_raw(canonical_payload(2 * IMAGE_CHUNK_BYTES + 77), ImageFormat::Raw)
                .unwrap();
        let mut streaming = ImageChecksum::new();
        for chunk in image.chunks() {
            streaming.update(chunk);
        }
        assert_eq!(streaming.finish(), image.checksum());
    }

    #[test]
    fn test_format_detection_prefers_extension() {
        let raw = canonical_payload(IMAGE_CHUNK_BYTES);
        assert_eq!(
            detect_format(Path::new("image.fpg"), &raw),
            ImageFormat::Archive
        );
        assert_eq!(
            detect_format(Path::new("image.bin"), &raw),
            ImageFormat::MarkerBin
        );
        assert_eq!(
            detect_format(Path::new("image.hex"), &raw),
            ImageFormat::AsciiHex
        );
        assert_eq!(detect_format(Path::new("image.bit"), &raw), ImageFormat::Raw);
    }

    #[test]
    fn test_format_detection_sniffs_content() {
        assert_eq!(
            detect_format(Path::new("image"), b"?meta x\n?quit\n"),
            ImageFormat::Archive
        );
        let marker = vec![0xFFu8; MARKER_HEADER_BYTES + 4];
        assert_eq!(detect_format(Path::new("image"), &marker), ImageFormat::MarkerBin);
        assert_eq!(
            detect_format(Path::new("image"), b"0123 abcd"),
            ImageFormat::AsciiHex
        );
    }
}
