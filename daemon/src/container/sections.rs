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

//! Typed views over the metadata sections of a container.
//!
//! Each section starts with an element count followed by fixed-size entries. A count that does
//! not fit in the section is rejected with `MalformedContainer` before any entry is read.
//!
//! The memory-controller helpers at the bottom derive, from `IP_LAYOUT` and `MEM_TOPOLOGY`,
//! which auxiliary controllers an image carries and where their registers live.

use crate::container::axlf::SectionKind;
use crate::container::{
    read_fixed_str, read_i16, read_i32, read_u8, read_u16, read_u32, read_u64, write_fixed_str,
};
use crate::error::IcapError;
use log::{info, warn};

/// Number of clock generators an image may drive.
pub const MAX_CLOCKS: usize = 4;
/// Lowest frequency a clock may be overridden to.
pub const MIN_OVERRIDE_MHZ: u16 = 60;

const CLOCK_ENTRIES_OFFSET: usize = 2;
const CLOCK_ENTRY_SIZE: usize = 136;
const CLOCK_NAME_LEN: usize = 128;
const IP_ENTRIES_OFFSET: usize = 8;
const IP_ENTRY_SIZE: usize = 80;
const IP_NAME_LEN: usize = 64;
const MEM_ENTRIES_OFFSET: usize = 8;
const MEM_ENTRY_SIZE: usize = 40;
const MEM_TAG_LEN: usize = 16;
const CONNECTION_ENTRIES_OFFSET: usize = 4;
const CONNECTION_ENTRY_SIZE: usize = 12;
const DEBUG_IP_ENTRIES_OFFSET: usize = 8;
const DEBUG_IP_ENTRY_SIZE: usize = 144;
const DEBUG_IP_NAME_LEN: usize = 128;

fn truncated(kind: SectionKind) -> IcapError {
    IcapError::MalformedContainer(format!("{kind} section is truncated"))
}

/// Split `data` into `count` entries of `size` bytes starting at `first`.
fn entries(
    data: &[u8],
    kind: SectionKind,
    count: i64,
    first: usize,
    size: usize,
) -> Result<Vec<&[u8]>, IcapError> {
    let count = usize::try_from(count)
        .map_err(|_| IcapError::MalformedContainer(format!("{kind} has a negative count")))?;
    let needed = count
        .checked_mul(size)
        .and_then(|n| n.checked_add(first))
        .ok_or_else(|| IcapError::MalformedContainer(format!("{kind} count overflows")))?;
    if count > 0 && needed > data.len() {
        return Err(IcapError::MalformedContainer(format!(
            "{kind} declares {count} entries ({needed} bytes) but the section is {} bytes",
            data.len()
        )));
    }
    Ok((0..count)
        .map(|i| &data[first + i * size..first + (i + 1) * size])
        .collect())
}

fn encode_entries(header: &[u8], first: usize, entries: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = vec![0u8; first];
    out[..header.len()].copy_from_slice(header);
    for entry in entries {
        out.extend_from_slice(&entry);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    Unused,
    Data,
    Kernel,
    System,
    Other(u8),
}

impl ClockType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ClockType::Unused,
            1 => ClockType::Data,
            2 => ClockType::Kernel,
            3 => ClockType::System,
            other => ClockType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ClockType::Unused => 0,
            ClockType::Data => 1,
            ClockType::Kernel => 2,
            ClockType::System => 3,
            ClockType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockFreq {
    pub freq_mhz: u16,
    pub clock_type: ClockType,
    pub name: String,
}

/// The `CLOCK_FREQ_TOPOLOGY` section: frequencies the image was built for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClockFreqTopology {
    pub clocks: Vec<ClockFreq>,
}

impl ClockFreqTopology {
    pub fn parse(data: &[u8]) -> Result<Self, IcapError> {
        let kind = SectionKind::ClockFreqTopology;
        let count = read_i16(data, 0).ok_or_else(|| truncated(kind))?;
        let clocks = entries(data, kind, count.into(), CLOCK_ENTRIES_OFFSET, CLOCK_ENTRY_SIZE)?
            .into_iter()
            .map(|e| ClockFreq {
                freq_mhz: read_u16(e, 0).unwrap_or_default(),
                clock_type: ClockType::from_code(read_u8(e, 2).unwrap_or_default()),
                name: read_fixed_str(e, 8, CLOCK_NAME_LEN).unwrap_or_default(),
            })
            .collect();
        Ok(ClockFreqTopology { clocks })
    }

    pub fn encode(&self) -> Vec<u8> {
        let entries = self
            .clocks
            .iter()
            .map(|c| {
                let mut e = vec![0u8; CLOCK_ENTRY_SIZE];
                e[0..2].copy_from_slice(&c.freq_mhz.to_le_bytes());
                e[2] = c.clock_type.code();
                write_fixed_str(&mut e[8..], &c.name);
                e
            })
            .collect();
        encode_entries(
            &(self.clocks.len() as i16).to_le_bytes(),
            CLOCK_ENTRIES_OFFSET,
            entries,
        )
    }

    /// The declared clocks in generator order: `[data, kernel, system0, system1]`.
    ///
    /// # Returns: `Result<[Option<&ClockFreq>; MAX_CLOCKS], IcapError>`
    /// * `Err(IcapError::ClockTopology)` - more than four clocks, not exactly one data clock,
    ///   not exactly one kernel clock, or more than two system clocks
    pub fn ordered(&self) -> Result<[Option<&ClockFreq>; MAX_CLOCKS], IcapError> {
        if self.clocks.len() > MAX_CLOCKS {
            return Err(IcapError::ClockTopology(format!(
                "{} clocks declared, at most {MAX_CLOCKS} supported",
                self.clocks.len()
            )));
        }
        let of_type = |t: ClockType| self.clocks.iter().filter(move |c| c.clock_type == t);

        let data: Vec<_> = of_type(ClockType::Data).collect();
        let kernel: Vec<_> = of_type(ClockType::Kernel).collect();
        let system: Vec<_> = of_type(ClockType::System).collect();
        if data.len() != 1 {
            return Err(IcapError::ClockTopology(format!(
                "expected exactly one data clock, found {}",
                data.len()
            )));
        }
        if kernel.len() != 1 {
            return Err(IcapError::ClockTopology(format!(
                "expected exactly one kernel clock, found {}",
                kernel.len()
            )));
        }
        if system.len() > 2 {
            return Err(IcapError::ClockTopology(format!(
                "at most two system clocks supported, found {}",
                system.len()
            )));
        }
        Ok([
            Some(data[0]),
            Some(kernel[0]),
            system.first().copied(),
            system.get(1).copied(),
        ])
    }

    /// Requested frequency per generator, `0` for generators the image does not use.
    pub fn target_frequencies(&self) -> Result<[u16; MAX_CLOCKS], IcapError> {
        Ok(self.ordered()?.map(|c| c.map_or(0, |c| c.freq_mhz)))
    }

    /// Range an override of generator `idx` may take: from [`MIN_OVERRIDE_MHZ`] up to the
    /// frequency the image was built for. `(0, 0)` for generators the image does not use.
    pub fn bounds(&self, idx: usize) -> Result<(u16, u16), IcapError> {
        let ordered = self.ordered()?;
        Ok(match ordered.get(idx).copied().flatten() {
            Some(clock) => (MIN_OVERRIDE_MHZ, clock.freq_mhz),
            None => (0, 0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpType {
    Mb,
    Kernel,
    Dnasc,
    Ddr4Controller,
    MemDdr4,
    MemHbm,
    Other(u32),
}

impl IpType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => IpType::Mb,
            1 => IpType::Kernel,
            2 => IpType::Dnasc,
            3 => IpType::Ddr4Controller,
            4 => IpType::MemDdr4,
            5 => IpType::MemHbm,
            other => IpType::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            IpType::Mb => 0,
            IpType::Kernel => 1,
            IpType::Dnasc => 2,
            IpType::Ddr4Controller => 3,
            IpType::MemDdr4 => 4,
            IpType::MemHbm => 5,
            IpType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpData {
    pub ip_type: IpType,
    /// For memory controllers the low 16 bits hold the controller index.
    pub properties: u32,
    pub base_address: u64,
    pub name: String,
}

impl IpData {
    pub fn index(&self) -> u16 {
        (self.properties & 0xffff) as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpLayout {
    pub ips: Vec<IpData>,
}

impl IpLayout {
    pub fn parse(data: &[u8]) -> Result<Self, IcapError> {
        let kind = SectionKind::IpLayout;
        let count = read_i32(data, 0).ok_or_else(|| truncated(kind))?;
        let ips = entries(data, kind, count.into(), IP_ENTRIES_OFFSET, IP_ENTRY_SIZE)?
            .into_iter()
            .map(|e| IpData {
                ip_type: IpType::from_code(read_u32(e, 0).unwrap_or_default()),
                properties: read_u32(e, 4).unwrap_or_default(),
                base_address: read_u64(e, 8).unwrap_or_default(),
                name: read_fixed_str(e, 16, IP_NAME_LEN).unwrap_or_default(),
            })
            .collect();
        Ok(IpLayout { ips })
    }

    pub fn encode(&self) -> Vec<u8> {
        let entries = self
            .ips
            .iter()
            .map(|ip| {
                let mut e = vec![0u8; IP_ENTRY_SIZE];
                e[0..4].copy_from_slice(&ip.ip_type.code().to_le_bytes());
                e[4..8].copy_from_slice(&ip.properties.to_le_bytes());
                e[8..16].copy_from_slice(&ip.base_address.to_le_bytes());
                write_fixed_str(&mut e[16..], &ip.name);
                e
            })
            .collect();
        encode_entries(&(self.ips.len() as i32).to_le_bytes(), IP_ENTRIES_OFFSET, entries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Ddr3,
    Ddr4,
    Dram,
    Streaming,
    PreallocatedGlob,
    Are,
    Hbm,
    Bram,
    Uram,
    StreamingConnection,
    Other(u8),
}

impl MemType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => MemType::Ddr3,
            1 => MemType::Ddr4,
            2 => MemType::Dram,
            3 => MemType::Streaming,
            4 => MemType::PreallocatedGlob,
            5 => MemType::Are,
            6 => MemType::Hbm,
            7 => MemType::Bram,
            8 => MemType::Uram,
            9 => MemType::StreamingConnection,
            other => MemType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MemType::Ddr3 => 0,
            MemType::Ddr4 => 1,
            MemType::Dram => 2,
            MemType::Streaming => 3,
            MemType::PreallocatedGlob => 4,
            MemType::Are => 5,
            MemType::Hbm => 6,
            MemType::Bram => 7,
            MemType::Uram => 8,
            MemType::StreamingConnection => 9,
            MemType::Other(other) => other,
        }
    }

    /// Memory type implied by a bank tag such as `DDR[1]`, `HBM[0]` or `bank2`.
    ///
    /// The declared type of a bank is not reliable, the tag is. Unrecognised tags map to
    /// `Ddr3`, which no controller asks for.
    pub fn from_tag(tag: &str) -> Self {
        let starts = |prefix: &str| {
            tag.get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        };
        if starts("DDR") {
            MemType::Dram
        } else if starts("HBM") {
            MemType::Hbm
        } else if starts("bank") {
            MemType::Ddr4
        } else {
            MemType::Ddr3
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemData {
    pub mem_type: MemType,
    pub used: bool,
    pub size_kb: u64,
    pub base_address: u64,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemTopology {
    pub banks: Vec<MemData>,
}

impl MemTopology {
    pub fn parse(data: &[u8]) -> Result<Self, IcapError> {
        let kind = SectionKind::MemTopology;
        let count = read_i32(data, 0).ok_or_else(|| truncated(kind))?;
        let banks = entries(data, kind, count.into(), MEM_ENTRIES_OFFSET, MEM_ENTRY_SIZE)?
            .into_iter()
            .map(|e| MemData {
                mem_type: MemType::from_code(read_u8(e, 0).unwrap_or_default()),
                used: read_u8(e, 1).unwrap_or_default() != 0,
                size_kb: read_u64(e, 8).unwrap_or_default(),
                base_address: read_u64(e, 16).unwrap_or_default(),
                tag: read_fixed_str(e, 24, MEM_TAG_LEN).unwrap_or_default(),
            })
            .collect();
        Ok(MemTopology { banks })
    }

    pub fn encode(&self) -> Vec<u8> {
        let entries = self
            .banks
            .iter()
            .map(|m| {
                let mut e = vec![0u8; MEM_ENTRY_SIZE];
                e[0] = m.mem_type.code();
                e[1] = u8::from(m.used);
                e[8..16].copy_from_slice(&m.size_kb.to_le_bytes());
                e[16..24].copy_from_slice(&m.base_address.to_le_bytes());
                write_fixed_str(&mut e[24..], &m.tag);
                e
            })
            .collect();
        encode_entries(
            &(self.banks.len() as i32).to_le_bytes(),
            MEM_ENTRIES_OFFSET,
            entries,
        )
    }

    /// Index of the `ordinal`-th bank whose tag maps to `wanted`.
    pub fn memory_index(&self, wanted: MemType, ordinal: u32) -> Option<usize> {
        self.banks
            .iter()
            .enumerate()
            .filter(|(_, bank)| MemType::from_tag(&bank.tag) == wanted)
            .nth(ordinal as usize)
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub arg_index: i32,
    pub ip_layout_index: i32,
    pub mem_data_index: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connectivity {
    pub connections: Vec<Connection>,
}

impl Connectivity {
    pub fn parse(data: &[u8]) -> Result<Self, IcapError> {
        let kind = SectionKind::Connectivity;
        let count = read_i32(data, 0).ok_or_else(|| truncated(kind))?;
        let connections = entries(
            data,
            kind,
            count.into(),
            CONNECTION_ENTRIES_OFFSET,
            CONNECTION_ENTRY_SIZE,
        )?
        .into_iter()
        .map(|e| Connection {
            arg_index: read_i32(e, 0).unwrap_or_default(),
            ip_layout_index: read_i32(e, 4).unwrap_or_default(),
            mem_data_index: read_i32(e, 8).unwrap_or_default(),
        })
        .collect();
        Ok(Connectivity { connections })
    }

    pub fn encode(&self) -> Vec<u8> {
        let entries = self
            .connections
            .iter()
            .map(|c| {
                [c.arg_index, c.ip_layout_index, c.mem_data_index]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect()
            })
            .collect();
        encode_entries(
            &(self.connections.len() as i32).to_le_bytes(),
            CONNECTION_ENTRIES_OFFSET,
            entries,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugIpData {
    pub debug_type: u8,
    pub index: u16,
    pub properties: u8,
    pub major: u8,
    pub minor: u8,
    pub base_address: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugIpLayout {
    pub entries: Vec<DebugIpData>,
}

impl DebugIpLayout {
    pub fn parse(data: &[u8]) -> Result<Self, IcapError> {
        let kind = SectionKind::DebugIpLayout;
        let count = read_u16(data, 0).ok_or_else(|| truncated(kind))?;
        let entries = entries(
            data,
            kind,
            count.into(),
            DEBUG_IP_ENTRIES_OFFSET,
            DEBUG_IP_ENTRY_SIZE,
        )?
        .into_iter()
        .map(|e| DebugIpData {
            debug_type: e[0],
            index: u16::from_le_bytes([e[1], e[5]]),
            properties: e[2],
            major: e[3],
            minor: e[4],
            base_address: read_u64(e, 8).unwrap_or_default(),
            name: read_fixed_str(e, 16, DEBUG_IP_NAME_LEN).unwrap_or_default(),
        })
        .collect();
        Ok(DebugIpLayout { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// DDR memory controller with ECC status registers.
    Memory,
    /// HBM memory controller.
    HbmMemory,
    /// Device DNA self-check block.
    Dna,
}

/// An auxiliary on-chip controller present in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDescriptor {
    pub kind: ControllerKind,
    /// Position of the controller in `IP_LAYOUT`.
    pub ip_index: usize,
    pub base_address: u64,
    /// Tag of the memory bank the controller serves.
    pub memory_tag: Option<String>,
}

/// Derive the auxiliary controllers of an image.
///
/// Memory controllers are matched to their memory bank by the bank tag and the controller
/// index; controllers whose bank is missing, of the wrong type, or unused are skipped.
pub fn controller_descriptors(
    ip_layout: &IpLayout,
    mem_topology: Option<&MemTopology>,
) -> Vec<ControllerDescriptor> {
    let mut out = Vec::new();
    for (i, ip) in ip_layout.ips.iter().enumerate() {
        let (kind, bank) = match ip.ip_type {
            IpType::Ddr4Controller | IpType::MemDdr4 => {
                let wanted = if ip.ip_type == IpType::MemDdr4 {
                    MemType::Dram
                } else {
                    MemType::Ddr4
                };
                let Some((index, bank)) = memory_bank(mem_topology, wanted, ip.properties) else {
                    warn!("No memory bank for controller {} index {}", ip.name, ip.properties);
                    continue;
                };
                if bank.mem_type != wanted {
                    warn!("Bad memory controller index {} for bank {index}", ip.properties);
                    continue;
                }
                (ControllerKind::Memory, Some(bank))
            }
            IpType::MemHbm => {
                let Some((_, bank)) =
                    memory_bank(mem_topology, MemType::Hbm, u32::from(ip.index()))
                else {
                    continue;
                };
                (ControllerKind::HbmMemory, Some(bank))
            }
            IpType::Dnasc => (ControllerKind::Dna, None),
            _ => continue,
        };
        if let Some(bank) = bank
            && !bank.used
        {
            info!("Ignoring memory controller for unused bank {}", bank.tag);
            continue;
        }
        out.push(ControllerDescriptor {
            kind,
            ip_index: i,
            base_address: ip.base_address,
            memory_tag: bank.map(|b| b.tag.clone()),
        });
    }
    out
}

fn memory_bank(
    topology: Option<&MemTopology>,
    wanted: MemType,
    ordinal: u32,
) -> Option<(usize, &MemData)> {
    let topology = topology?;
    let index = topology.memory_index(wanted, ordinal)?;
    topology.banks.get(index).map(|bank| (index, bank))
}
