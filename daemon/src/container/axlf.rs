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

//! AXLF container validation and section resolution.
//!
//! An AXLF image is a fixed header followed by a table of section descriptors, each pointing at
//! a byte range of the image by offset and size. [`Axlf::parse`] checks the magic and that the
//! header and section table fit, but does not bound-check individual sections: that happens on
//! [`Axlf::resolve_section`], so an image whose unused sections are damaged can still be loaded.
//!
//! # Layout
//!
//! | offset | field                           |
//! |--------|---------------------------------|
//! | 0      | magic `"xclbin2\0"`             |
//! | 8      | signature length, `-1` unsigned |
//! | 296    | unique id                       |
//! | 304    | total length (incl. signature)  |
//! | 312    | timestamp                       |
//! | 320    | feature ROM timestamp           |
//! | 328    | version patch / major / minor   |
//! | 352    | platform VBNV                   |
//! | 416    | image uuid                      |
//! | 448    | number of sections              |
//! | 456    | section table, 40 bytes / entry |

use crate::container::signature::{SecurityLevel, SignaturePolicy};
use crate::container::xuid::Xuid;
use crate::container::{
    read_array, read_fixed_str, read_i32, read_u8, read_u16, read_u32, read_u64,
};
use crate::error::IcapError;
use log::{info, trace, warn};
use std::fmt;
use std::str::FromStr;

pub const AXLF_MAGIC: [u8; 8] = *b"xclbin2\0";

pub(crate) const SIGNATURE_LENGTH_OFFSET: usize = 8;
pub(crate) const UNIQUE_ID_OFFSET: usize = 296;
pub(crate) const LENGTH_OFFSET: usize = 304;
pub(crate) const TIMESTAMP_OFFSET: usize = 312;
pub(crate) const FEATURE_ROM_TIMESTAMP_OFFSET: usize = 320;
pub(crate) const VERSION_PATCH_OFFSET: usize = 328;
pub(crate) const VERSION_MAJOR_OFFSET: usize = 330;
pub(crate) const VERSION_MINOR_OFFSET: usize = 331;
pub(crate) const MODE_OFFSET: usize = 332;
pub(crate) const PLATFORM_VBNV_OFFSET: usize = 352;
pub(crate) const PLATFORM_VBNV_LEN: usize = 64;
pub(crate) const UUID_OFFSET: usize = 416;
pub(crate) const NUM_SECTIONS_OFFSET: usize = 448;
pub(crate) const SECTION_TABLE_OFFSET: usize = 456;
pub(crate) const SECTION_HEADER_SIZE: usize = 40;
pub(crate) const SECTION_NAME_LEN: usize = 16;

/// Section kinds, numbered as in the xclbin format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Bitstream,
    ClearingBitstream,
    EmbeddedMetadata,
    Firmware,
    DebugData,
    SchedFirmware,
    MemTopology,
    Connectivity,
    IpLayout,
    DebugIpLayout,
    DesignCheckPoint,
    ClockFreqTopology,
    Mcs,
    Bmc,
    BuildMetadata,
    KeyvalueMetadata,
    UserMetadata,
    DnaCertificate,
    Pdi,
    BitstreamPartialPdi,
    PartitionMetadata,
    Unknown(u32),
}

const KNOWN_KINDS: [(SectionKind, u32, &str); 21] = [
    (SectionKind::Bitstream, 0, "BITSTREAM"),
    (SectionKind::ClearingBitstream, 1, "CLEARING_BITSTREAM"),
    (SectionKind::EmbeddedMetadata, 2, "EMBEDDED_METADATA"),
    (SectionKind::Firmware, 3, "FIRMWARE"),
    (SectionKind::DebugData, 4, "DEBUG_DATA"),
    (SectionKind::SchedFirmware, 5, "SCHED_FIRMWARE"),
    (SectionKind::MemTopology, 6, "MEM_TOPOLOGY"),
    (SectionKind::Connectivity, 7, "CONNECTIVITY"),
    (SectionKind::IpLayout, 8, "IP_LAYOUT"),
    (SectionKind::DebugIpLayout, 9, "DEBUG_IP_LAYOUT"),
    (SectionKind::DesignCheckPoint, 10, "DESIGN_CHECK_POINT"),
    (SectionKind::ClockFreqTopology, 11, "CLOCK_FREQ_TOPOLOGY"),
    (SectionKind::Mcs, 12, "MCS"),
    (SectionKind::Bmc, 13, "BMC"),
    (SectionKind::BuildMetadata, 14, "BUILD_METADATA"),
    (SectionKind::KeyvalueMetadata, 15, "KEYVALUE_METADATA"),
    (SectionKind::UserMetadata, 16, "USER_METADATA"),
    (SectionKind::DnaCertificate, 17, "DNA_CERTIFICATE"),
    (SectionKind::Pdi, 18, "PDI"),
    (SectionKind::BitstreamPartialPdi, 19, "BITSTREAM_PARTIAL_PDI"),
    (SectionKind::PartitionMetadata, 20, "PARTITION_METADATA"),
];

impl SectionKind {
    pub fn from_code(code: u32) -> Self {
        KNOWN_KINDS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(kind, _, _)| *kind)
            .unwrap_or(SectionKind::Unknown(code))
    }

    pub fn code(self) -> u32 {
        match self {
            SectionKind::Unknown(code) => code,
            known => KNOWN_KINDS
                .iter()
                .find(|(kind, _, _)| *kind == known)
                .map(|(_, code, _)| *code)
                .unwrap_or(u32::MAX),
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match KNOWN_KINDS.iter().find(|(kind, _, _)| kind == self) {
            Some((_, _, name)) => f.write_str(name),
            None => write!(f, "UNKNOWN({})", self.code()),
        }
    }
}

impl FromStr for SectionKind {
    type Err = IcapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        KNOWN_KINDS
            .iter()
            .find(|(_, _, name)| *name == wanted)
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| IcapError::Argument(format!("unknown section kind '{s}'")))
    }
}

/// Decoded fixed header of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxlfHeader {
    /// Length of the trailing signature, `None` when the image is unsigned.
    pub signature_length: Option<u32>,
    pub unique_id: u64,
    pub length: u64,
    pub time_stamp: u64,
    pub feature_rom_timestamp: u64,
    pub version_patch: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub mode: u32,
    pub platform_vbnv: String,
    pub uuid: Xuid,
    pub num_sections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub kind: SectionKind,
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// What the installed hardware accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Timestamp of the feature ROM of the installed shell. `0` accepts any image.
    pub feature_rom_timestamp: u64,
    pub min_version_major: u8,
}

/// Returns an error unless `data` starts with [`AXLF_MAGIC`].
pub fn validate_header(data: &[u8]) -> Result<(), IcapError> {
    match read_array::<8>(data, 0) {
        Some(magic) if magic == AXLF_MAGIC => Ok(()),
        _ => Err(IcapError::InvalidMagic),
    }
}

fn malformed(what: &str) -> IcapError {
    IcapError::MalformedContainer(format!("container is truncated reading {what}"))
}

/// A validated view over a container image.
#[derive(Debug, Clone)]
pub struct Axlf<'a> {
    bytes: &'a [u8],
    header: AxlfHeader,
    sections: Vec<SectionHeader>,
}

impl<'a> Axlf<'a> {
    /// Validate the magic, the fixed header and the section table of `data`.
    ///
    /// # Returns: `Result<Axlf, IcapError>`
    /// * `Ok(Axlf)` - view over the first `header.length` bytes of `data`
    /// * `Err(IcapError::InvalidMagic)` - `data` is not an AXLF container
    /// * `Err(IcapError::MalformedContainer)` - the header or section table does not fit
    pub fn parse(data: &'a [u8]) -> Result<Self, IcapError> {
        validate_header(data)?;
        let header = Self::parse_header(data)?;

        let length = usize::try_from(header.length)
            .map_err(|_| IcapError::MalformedContainer("declared length overflows".into()))?;
        if length > data.len() {
            return Err(IcapError::MalformedContainer(format!(
                "declared length {length} exceeds the {} bytes supplied",
                data.len()
            )));
        }
        let bytes = &data[..length];

        let table_end = (header.num_sections as usize)
            .checked_mul(SECTION_HEADER_SIZE)
            .and_then(|n| n.checked_add(SECTION_TABLE_OFFSET))
            .ok_or_else(|| IcapError::MalformedContainer("section count overflows".into()))?;
        if table_end > bytes.len() {
            return Err(IcapError::MalformedContainer(format!(
                "{} section headers do not fit in {} bytes",
                header.num_sections,
                bytes.len()
            )));
        }

        let sections = (0..header.num_sections as usize)
            .map(|i| Self::parse_section_header(bytes, SECTION_TABLE_OFFSET + i * SECTION_HEADER_SIZE))
            .collect::<Result<Vec<_>, _>>()?;

        trace!(
            "Parsed container {} with {} sections",
            header.uuid,
            sections.len()
        );
        Ok(Axlf {
            bytes,
            header,
            sections,
        })
    }

    fn parse_header(data: &[u8]) -> Result<AxlfHeader, IcapError> {
        let signature_length = read_i32(data, SIGNATURE_LENGTH_OFFSET)
            .ok_or_else(|| malformed("signature length"))?;
        let signature_length = match signature_length {
            -1 => None,
            n => Some(u32::try_from(n).map_err(|_| {
                IcapError::MalformedContainer(format!("invalid signature length {n}"))
            })?),
        };
        let uuid = read_array::<16>(data, UUID_OFFSET).ok_or_else(|| malformed("uuid"))?;
        Ok(AxlfHeader {
            signature_length,
            unique_id: read_u64(data, UNIQUE_ID_OFFSET).ok_or_else(|| malformed("unique id"))?,
            length: read_u64(data, LENGTH_OFFSET).ok_or_else(|| malformed("length"))?,
            time_stamp: read_u64(data, TIMESTAMP_OFFSET).ok_or_else(|| malformed("timestamp"))?,
            feature_rom_timestamp: read_u64(data, FEATURE_ROM_TIMESTAMP_OFFSET)
                .ok_or_else(|| malformed("feature ROM timestamp"))?,
            version_patch: read_u16(data, VERSION_PATCH_OFFSET)
                .ok_or_else(|| malformed("version"))?,
            version_major: read_u8(data, VERSION_MAJOR_OFFSET)
                .ok_or_else(|| malformed("version"))?,
            version_minor: read_u8(data, VERSION_MINOR_OFFSET)
                .ok_or_else(|| malformed("version"))?,
            mode: read_u32(data, MODE_OFFSET).ok_or_else(|| malformed("mode"))?,
            platform_vbnv: read_fixed_str(data, PLATFORM_VBNV_OFFSET, PLATFORM_VBNV_LEN)
                .ok_or_else(|| malformed("platform name"))?,
            uuid: Xuid::from_bytes(uuid),
            num_sections: read_u32(data, NUM_SECTIONS_OFFSET)
                .ok_or_else(|| malformed("section count"))?,
        })
    }

    fn parse_section_header(data: &[u8], at: usize) -> Result<SectionHeader, IcapError> {
        Ok(SectionHeader {
            kind: SectionKind::from_code(read_u32(data, at).ok_or_else(|| malformed("section kind"))?),
            name: read_fixed_str(data, at + 4, SECTION_NAME_LEN)
                .ok_or_else(|| malformed("section name"))?,
            offset: read_u64(data, at + 24).ok_or_else(|| malformed("section offset"))?,
            size: read_u64(data, at + 32).ok_or_else(|| malformed("section size"))?,
        })
    }

    pub fn header(&self) -> &AxlfHeader {
        &self.header
    }

    pub fn uuid(&self) -> Xuid {
        self.header.uuid
    }

    /// The container bytes, `header.length` long.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    pub fn has_section(&self, kind: SectionKind) -> bool {
        self.sections.iter().any(|s| s.kind == kind)
    }

    /// Locate the first section of `kind`.
    ///
    /// # Returns: `Result<(u64, u64), IcapError>`
    /// * `Ok((offset, size))` - the section lies within the declared container length
    /// * `Err(IcapError::SectionNotFound)` - no such section
    /// * `Err(IcapError::MalformedContainer)` - the section runs past the container end
    pub fn resolve_section(&self, kind: SectionKind) -> Result<(u64, u64), IcapError> {
        let section = self
            .sections
            .iter()
            .find(|s| s.kind == kind)
            .ok_or(IcapError::SectionNotFound(kind))?;
        match section.offset.checked_add(section.size) {
            Some(end) if end <= self.header.length => Ok((section.offset, section.size)),
            _ => Err(IcapError::MalformedContainer(format!(
                "{kind} section at {} with size {} runs past the container length {}",
                section.offset, section.size, self.header.length
            ))),
        }
    }

    /// Borrow the bytes of the first section of `kind`.
    pub fn section(&self, kind: SectionKind) -> Result<&'a [u8], IcapError> {
        let (offset, size) = self.resolve_section(kind)?;
        // resolve_section bounds both by header.length == bytes.len()
        let start = offset as usize;
        Ok(&self.bytes[start..start + size as usize])
    }

    /// Copy the first section of `kind` into an owned buffer.
    pub fn extract_section(&self, kind: SectionKind) -> Result<Vec<u8>, IcapError> {
        let section = self.section(kind)?;
        let mut copy = Vec::new();
        copy.try_reserve_exact(section.len())
            .map_err(|_| IcapError::OutOfMemory {
                bytes: section.len(),
            })?;
        copy.extend_from_slice(section);
        Ok(copy)
    }

    /// Check that the image was built for the installed hardware.
    pub fn validate_compatibility(&self, device: &DeviceInfo) -> Result<(), IcapError> {
        let image_ts = self.header.feature_rom_timestamp;
        if device.feature_rom_timestamp != 0
            && image_ts != 0
            && image_ts != device.feature_rom_timestamp
        {
            return Err(IcapError::IncompatibleImage(format!(
                "feature ROM timestamp {image_ts:#x} does not match the installed {:#x}",
                device.feature_rom_timestamp
            )));
        }
        if self.header.version_major < device.min_version_major {
            return Err(IcapError::IncompatibleImage(format!(
                "container version {}.{}.{} is older than the supported major {}",
                self.header.version_major,
                self.header.version_minor,
                self.header.version_patch,
                device.min_version_major
            )));
        }
        Ok(())
    }

    /// The image as it was before signing, and the detached signature.
    ///
    /// Signing appends the signature and patches the signature length and total length fields;
    /// the signed data is the original image with both fields restored.
    pub fn signed_parts(&self) -> Result<Option<(Vec<u8>, &'a [u8])>, IcapError> {
        let Some(sig_len) = self.header.signature_length else {
            return Ok(None);
        };
        let sig_len = sig_len as usize;
        let total = self.bytes.len();
        let orig_len = total.checked_sub(sig_len).ok_or_else(|| {
            IcapError::MalformedContainer(format!(
                "signature length {sig_len} exceeds the container length {total}"
            ))
        })?;
        if orig_len < SECTION_TABLE_OFFSET {
            return Err(IcapError::MalformedContainer(format!(
                "signature length {sig_len} leaves no room for the header"
            )));
        }

        let mut unsigned = Vec::new();
        unsigned
            .try_reserve_exact(orig_len)
            .map_err(|_| IcapError::OutOfMemory { bytes: orig_len })?;
        unsigned.extend_from_slice(&self.bytes[..orig_len]);
        unsigned[SIGNATURE_LENGTH_OFFSET..SIGNATURE_LENGTH_OFFSET + 4]
            .copy_from_slice(&(-1i32).to_le_bytes());
        unsigned[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&(orig_len as u64).to_le_bytes());
        Ok(Some((unsigned, &self.bytes[orig_len..])))
    }

    /// Apply the signature policy to this image.
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Ok(())` - the signature verified, or the policy does not require one
    /// * `Err(IcapError::UnsignedImage)` - no signature and the level is above `None`
    /// * `Err(IcapError::SignatureRejected)` - verification failed and the level is above `None`
    pub fn validate_signature(&self, policy: &SignaturePolicy<'_>) -> Result<(), IcapError> {
        let Some((unsigned, signature)) = self.signed_parts()? else {
            if policy.level > SecurityLevel::None {
                return Err(IcapError::UnsignedImage);
            }
            trace!("Container {} is unsigned", self.header.uuid);
            return Ok(());
        };

        let verdict = policy
            .scope()
            .and_then(|scope| {
                policy
                    .verifier
                    .verify(&unsigned, signature, scope)
                    .map_err(IcapError::SignatureRejected)
            });
        match verdict {
            Ok(()) => {
                info!("Signature of container {} verified", self.header.uuid);
                Ok(())
            }
            Err(e) if policy.level == SecurityLevel::None => {
                warn!("Ignoring failed signature check of {}: {e}", self.header.uuid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
