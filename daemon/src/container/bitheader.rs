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

//! The legacy `.bit` header.
//!
//! Bitstream sections keep the header the vendor tools write in front of the configuration
//! words. All integers in it are big-endian:
//!
//! ```text
//! u16 n, (n - 1) bytes 0f f0 0f f0 .., 1 terminator byte, u16 0x0001,
//! 'a' u16 len design-name\0
//! 'b' u16 len part-name\0
//! 'c' u16 len date\0
//! 'd' u16 len time\0
//! 'e' u32 payload-length
//! payload
//! ```

use crate::error::IcapError;

pub const EVEN_MAGIC_BYTE: u8 = 0x0f;
pub const ODD_MAGIC_BYTE: u8 = 0xf0;
const MAGIC_LENGTH: u16 = 9;
const MARKER: u16 = 0x0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitHeader {
    pub design_name: String,
    pub part_name: String,
    pub date: String,
    pub time: String,
    /// Bytes consumed by the header itself.
    pub header_length: usize,
    /// Bytes of configuration payload following the header.
    pub bitstream_length: usize,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], IcapError> {
        let bytes = self
            .pos
            .checked_add(n)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or_else(|| {
                IcapError::InvalidHeader(format!("truncated at byte {} reading {what}", self.pos))
            })?;
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self, what: &str) -> Result<u8, IcapError> {
        Ok(self.take(1, what)?[0])
    }

    fn be16(&mut self, what: &str) -> Result<u16, IcapError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn be32(&mut self, what: &str) -> Result<u32, IcapError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn tag(&mut self, expected: u8) -> Result<(), IcapError> {
        let tag = self.u8("tag")?;
        if tag != expected {
            return Err(IcapError::InvalidHeader(format!(
                "expected tag '{}' at byte {}, found 0x{tag:02x}",
                expected as char,
                self.pos - 1
            )));
        }
        Ok(())
    }

    fn tagged_string(&mut self, tag: u8, what: &str) -> Result<String, IcapError> {
        self.tag(tag)?;
        let len = self.be16(what)? as usize;
        if len == 0 {
            return Err(IcapError::InvalidHeader(format!("{what} is empty")));
        }
        let raw = self.take(len, what)?;
        let Some((&0, text)) = raw.split_last() else {
            return Err(IcapError::InvalidHeader(format!(
                "{what} is not NUL-terminated"
            )));
        };
        let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
        Ok(String::from_utf8_lossy(&text[..end]).into_owned())
    }
}

impl BitHeader {
    /// Parse the header at the start of a bitstream section.
    ///
    /// # Returns: `Result<BitHeader, IcapError>`
    /// * `Ok(BitHeader)` - header fields, its own length and the payload length
    /// * `Err(IcapError::InvalidHeader)` - magic, marker or tag mismatch, or truncation
    pub fn parse(data: &[u8]) -> Result<Self, IcapError> {
        let mut cursor = Cursor { data, pos: 0 };

        let magic_len = cursor.be16("magic length")?;
        if magic_len == 0 {
            return Err(IcapError::InvalidHeader("magic length is zero".into()));
        }
        let magic = cursor.take(usize::from(magic_len - 1), "magic")?;
        for (i, byte) in magic.iter().enumerate() {
            let expected = if i % 2 == 0 {
                EVEN_MAGIC_BYTE
            } else {
                ODD_MAGIC_BYTE
            };
            if *byte != expected {
                return Err(IcapError::InvalidHeader(format!(
                    "magic byte {i} is 0x{byte:02x}, expected 0x{expected:02x}"
                )));
            }
        }
        cursor.u8("magic terminator")?;

        let marker = cursor.be16("marker")?;
        if marker != MARKER {
            return Err(IcapError::InvalidHeader(format!(
                "marker is 0x{marker:04x}, expected 0x{MARKER:04x}"
            )));
        }

        let design_name = cursor.tagged_string(b'a', "design name")?;
        let part_name = cursor.tagged_string(b'b', "part name")?;
        let date = cursor.tagged_string(b'c', "date")?;
        let time = cursor.tagged_string(b'd', "time")?;
        cursor.tag(b'e')?;
        let bitstream_length = cursor.be32("payload length")? as usize;

        Ok(BitHeader {
            design_name,
            part_name,
            date,
            time,
            header_length: cursor.pos,
            bitstream_length,
        })
    }

    /// The configuration payload of `section`, which this header was parsed from.
    pub fn payload<'a>(&self, section: &'a [u8]) -> Result<&'a [u8], IcapError> {
        self.header_length
            .checked_add(self.bitstream_length)
            .and_then(|end| section.get(self.header_length..end))
            .ok_or_else(|| {
                IcapError::InvalidHeader(format!(
                    "header of {} bytes plus payload of {} bytes exceeds the section length {}",
                    self.header_length,
                    self.bitstream_length,
                    section.len()
                ))
            })
    }

    /// Frame `payload` with a header carrying the given fields.
    pub fn encode(design_name: &str, part_name: &str, date: &str, time: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + payload.len());
        out.extend_from_slice(&MAGIC_LENGTH.to_be_bytes());
        for i in 0..usize::from(MAGIC_LENGTH - 1) {
            out.push(if i % 2 == 0 {
                EVEN_MAGIC_BYTE
            } else {
                ODD_MAGIC_BYTE
            });
        }
        out.push(0);
        out.extend_from_slice(&MARKER.to_be_bytes());
        for (tag, value) in [
            (b'a', design_name),
            (b'b', part_name),
            (b'c', date),
            (b'd', time),
        ] {
            out.push(tag);
            out.extend_from_slice(&((value.len() + 1) as u16).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        out.push(b'e');
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    fn framed() -> Vec<u8> {
        BitHeader::encode(
            "shell;UserID=0XFFFFFFFF",
            "xcu280-fsvh2892-2L-e",
            "2025/01/31",
            "12:00:00",
            &[0xaa, 0x99, 0x55, 0x66, 0x20, 0x00, 0x00, 0x00],
        )
    }

    #[gtest]
    fn encoded_header_parses_back() {
        let data = framed();
        let header = BitHeader::parse(&data).unwrap();
        expect_that!(header.design_name, eq("shell;UserID=0XFFFFFFFF"));
        expect_that!(header.part_name, eq("xcu280-fsvh2892-2L-e"));
        expect_that!(header.date, eq("2025/01/31"));
        expect_that!(header.time, eq("12:00:00"));
        expect_that!(header.bitstream_length, eq(8));
        expect_that!(header.header_length, eq(data.len() - 8));
        expect_that!(
            header.payload(&data).unwrap(),
            eq(&[0xaa, 0x99, 0x55, 0x66, 0x20, 0x00, 0x00, 0x00][..])
        );
    }

    #[gtest]
    #[rstest]
    #[case::even_byte(2, "magic byte 0")]
    #[case::odd_byte(3, "magic byte 1")]
    #[case::marker(12, "marker")]
    #[case::first_tag(13, "expected tag 'a'")]
    #[case::design_name_terminator(39, "design name is not NUL-terminated")]
    fn corrupted_fields(#[case] index: usize, #[case] message: &str) {
        let mut data = framed();
        data[index] ^= 0xff;
        assert_that!(
            BitHeader::parse(&data),
            err(displays_as(contains_substring(message)))
        );
    }

    #[gtest]
    fn truncated_header() {
        let data = framed();
        assert_that!(
            BitHeader::parse(&data[..20]),
            err(displays_as(contains_substring("truncated")))
        );
    }

    #[gtest]
    fn payload_longer_than_section() {
        let data = framed();
        let header = BitHeader::parse(&data).unwrap();
        assert_that!(
            header.payload(&data[..data.len() - 1]),
            err(displays_as(contains_substring("exceeds the section length")))
        );
    }
}
