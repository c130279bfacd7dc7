// This file is part of icapd, an application to manage bitstream and clock lifecycle of PCIe FPGA accelerators.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// icapd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// icapd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Container (xclbin / AXLF) handling.
//!
//! - [`axlf`] - header validation, section table and section resolution
//! - [`bitheader`] - the legacy `.bit` header that precedes raw configuration words
//! - [`sections`] - typed views over the metadata sections the daemon consumes
//! - [`signature`] - signature policy, keyring service and the verifier seam
//! - [`builder`] - assembles containers in memory, used by tests and the simulator
//! - [`xuid`] - the 128-bit image identity
//!
//! All multi-byte container fields are little-endian. The readers below return `None` when the
//! requested bytes are out of bounds and leave the error wording to their callers.

pub mod axlf;
pub mod bitheader;
pub mod builder;
pub mod sections;
pub mod signature;
pub mod xuid;

pub(crate) fn read_array<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    data.get(offset..offset.checked_add(N)?)?.try_into().ok()
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    read_array(data, offset).map(u16::from_le_bytes)
}

pub(crate) fn read_i16(data: &[u8], offset: usize) -> Option<i16> {
    read_array(data, offset).map(i16::from_le_bytes)
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    read_array(data, offset).map(u32::from_le_bytes)
}

pub(crate) fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    read_array(data, offset).map(i32::from_le_bytes)
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    read_array(data, offset).map(u64::from_le_bytes)
}

/// Reads a fixed-width, NUL padded string field.
pub(crate) fn read_fixed_str(data: &[u8], offset: usize, width: usize) -> Option<String> {
    let field = data.get(offset..offset.checked_add(width)?)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    Some(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Writes `value` into a fixed-width field, truncating and NUL padding as needed.
pub(crate) fn write_fixed_str(out: &mut [u8], value: &str) {
    let len = value.len().min(out.len().saturating_sub(1));
    out[..len].copy_from_slice(&value.as_bytes()[..len]);
    out[len..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn readers_stop_at_bounds() {
        let data = [1u8, 0, 0, 0, 2];
        assert_that!(read_u32(&data, 0), some(eq(1)));
        assert_that!(read_u32(&data, 2), none());
        assert_that!(read_u64(&data, usize::MAX), none());
    }

    #[gtest]
    fn fixed_strings_round_trip() {
        let mut field = [0xffu8; 8];
        write_fixed_str(&mut field, "kernel_clk");
        assert_that!(read_fixed_str(&field, 0, 8), some(eq("kernel_")));
    }
}
