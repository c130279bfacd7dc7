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

use crate::container::axlf::{
    AXLF_MAGIC, FEATURE_ROM_TIMESTAMP_OFFSET, LENGTH_OFFSET, MODE_OFFSET, NUM_SECTIONS_OFFSET,
    PLATFORM_VBNV_LEN, PLATFORM_VBNV_OFFSET, SECTION_HEADER_SIZE, SECTION_NAME_LEN,
    SECTION_TABLE_OFFSET, SIGNATURE_LENGTH_OFFSET, SectionKind, TIMESTAMP_OFFSET,
    UNIQUE_ID_OFFSET, UUID_OFFSET, VERSION_MAJOR_OFFSET, VERSION_MINOR_OFFSET,
    VERSION_PATCH_OFFSET,
};
use crate::container::bitheader::BitHeader;
use crate::container::sections::ClockFreqTopology;
use crate::container::write_fixed_str;
use crate::container::xuid::Xuid;

/// Assembles an AXLF container in memory.
///
/// # Examples
///
/// ```rust
/// # use icapd::container::axlf::{Axlf, SectionKind};
/// # use icapd::container::builder::AxlfBuilder;
/// # use icapd::container::xuid::Xuid;
/// let image = AxlfBuilder::new(Xuid::from_bytes([1; 16]))
///     .bitstream(&[0, 0, 0, 0])
///     .build();
/// let axlf = Axlf::parse(&image).unwrap();
/// assert!(axlf.has_section(SectionKind::Bitstream));
/// ```
#[derive(Debug, Clone)]
pub struct AxlfBuilder {
    uuid: Xuid,
    unique_id: u64,
    time_stamp: u64,
    feature_rom_timestamp: u64,
    version: (u8, u8, u16),
    platform_vbnv: String,
    sections: Vec<(SectionKind, Vec<u8>)>,
    signature: Option<Vec<u8>>,
}

impl AxlfBuilder {
    pub fn new(uuid: Xuid) -> Self {
        AxlfBuilder {
            uuid,
            unique_id: 0,
            time_stamp: 0,
            feature_rom_timestamp: 0,
            version: (2, 0, 0),
            platform_vbnv: "xilinx_u280_xdma_201920_3".to_string(),
            sections: Vec::new(),
            signature: None,
        }
    }

    pub fn feature_rom_timestamp(mut self, timestamp: u64) -> Self {
        self.feature_rom_timestamp = timestamp;
        self
    }

    pub fn time_stamp(mut self, timestamp: u64) -> Self {
        self.time_stamp = timestamp;
        self
    }

    pub fn version(mut self, major: u8, minor: u8, patch: u16) -> Self {
        self.version = (major, minor, patch);
        self
    }

    pub fn platform(mut self, vbnv: &str) -> Self {
        self.platform_vbnv = vbnv.to_string();
        self
    }

    pub fn section(mut self, kind: SectionKind, data: Vec<u8>) -> Self {
        self.sections.push((kind, data));
        self
    }

    /// Adds a `BITSTREAM` section wrapping `payload` in a `.bit` header.
    pub fn bitstream(self, payload: &[u8]) -> Self {
        let framed = BitHeader::encode("user", "xcu280-fsvh2892-2L-e", "2025/01/01", "00:00:00", payload);
        self.section(SectionKind::Bitstream, framed)
    }

    /// Adds a `CLEARING_BITSTREAM` section wrapping `payload` in a `.bit` header.
    pub fn clearing_bitstream(self, payload: &[u8]) -> Self {
        let framed = BitHeader::encode("clear", "xcu280-fsvh2892-2L-e", "2025/01/01", "00:00:00", payload);
        self.section(SectionKind::ClearingBitstream, framed)
    }

    pub fn clock_topology(self, topology: &ClockFreqTopology) -> Self {
        self.section(SectionKind::ClockFreqTopology, topology.encode())
    }

    /// Appends a detached signature; the header then records its length.
    pub fn signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let table_end = SECTION_TABLE_OFFSET + SECTION_HEADER_SIZE * self.sections.len();
        let mut out = vec![0u8; table_end];

        for (i, (kind, data)) in self.sections.iter().enumerate() {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            let offset = out.len() as u64;
            out.extend_from_slice(data);

            let at = SECTION_TABLE_OFFSET + i * SECTION_HEADER_SIZE;
            out[at..at + 4].copy_from_slice(&kind.code().to_le_bytes());
            write_fixed_str(&mut out[at + 4..at + 4 + SECTION_NAME_LEN], &kind.to_string());
            out[at + 24..at + 32].copy_from_slice(&offset.to_le_bytes());
            out[at + 32..at + 40].copy_from_slice(&(data.len() as u64).to_le_bytes());
        }

        let signature_length = self.signature.as_ref().map_or(-1, |s| s.len() as i32);
        if let Some(signature) = &self.signature {
            out.extend_from_slice(signature);
        }
        let length = out.len() as u64;

        out[0..8].copy_from_slice(&AXLF_MAGIC);
        out[SIGNATURE_LENGTH_OFFSET..SIGNATURE_LENGTH_OFFSET + 4]
            .copy_from_slice(&signature_length.to_le_bytes());
        out[UNIQUE_ID_OFFSET..UNIQUE_ID_OFFSET + 8].copy_from_slice(&self.unique_id.to_le_bytes());
        out[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&length.to_le_bytes());
        out[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&self.time_stamp.to_le_bytes());
        out[FEATURE_ROM_TIMESTAMP_OFFSET..FEATURE_ROM_TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&self.feature_rom_timestamp.to_le_bytes());
        out[VERSION_PATCH_OFFSET..VERSION_PATCH_OFFSET + 2]
            .copy_from_slice(&self.version.2.to_le_bytes());
        out[VERSION_MAJOR_OFFSET] = self.version.0;
        out[VERSION_MINOR_OFFSET] = self.version.1;
        out[MODE_OFFSET..MODE_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        write_fixed_str(
            &mut out[PLATFORM_VBNV_OFFSET..PLATFORM_VBNV_OFFSET + PLATFORM_VBNV_LEN],
            &self.platform_vbnv,
        );
        out[UUID_OFFSET..UUID_OFFSET + 16].copy_from_slice(self.uuid.as_bytes());
        out[NUM_SECTIONS_OFFSET..NUM_SECTIONS_OFFSET + 4]
            .copy_from_slice(&(self.sections.len() as u32).to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::axlf::Axlf;
    use googletest::prelude::*;

    #[gtest]
    fn header_fields_are_written() {
        let image = AxlfBuilder::new(Xuid::from_bytes([9; 16]))
            .version(2, 14, 354)
            .time_stamp(42)
            .platform("xilinx_u50_gen3x16_xdma_base_5")
            .bitstream(&[1, 2, 3, 4])
            .build();
        let axlf = Axlf::parse(&image).unwrap();
        let header = axlf.header();
        expect_that!(header.version_major, eq(2));
        expect_that!(header.version_minor, eq(14));
        expect_that!(header.version_patch, eq(354));
        expect_that!(header.time_stamp, eq(42));
        expect_that!(header.platform_vbnv, eq("xilinx_u50_gen3x16_xdma_base_5"));
        expect_that!(header.length, eq(image.len() as u64));
        expect_that!(header.signature_length, none());
    }

    #[gtest]
    fn signature_is_appended() {
        let unsigned = AxlfBuilder::new(Xuid::from_bytes([9; 16])).build();
        let signed = AxlfBuilder::new(Xuid::from_bytes([9; 16]))
            .signature(vec![0xee; 32])
            .build();
        assert_that!(signed.len(), eq(unsigned.len() + 32));
        let axlf = Axlf::parse(&signed).unwrap();
        let (original, signature) = axlf.signed_parts().unwrap().unwrap();
        assert_that!(original, eq(&unsigned));
        assert_that!(signature, eq(&[0xee; 32][..]));
    }
}
