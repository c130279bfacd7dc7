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

use crate::container::axlf::{Axlf, SectionKind};
use crate::container::sections::{
    ClockFreqTopology, ControllerDescriptor, IpLayout, MemTopology, controller_descriptors,
};
use crate::error::IcapError;
use log::{info, trace};
use std::collections::HashMap;

/// Metadata sections kept from the active image.
#[derive(Debug, Default, Clone)]
pub struct SectionCache {
    sections: HashMap<SectionKind, Vec<u8>>,
}

impl SectionCache {
    /// Sections that are cached when present.
    pub const KINDS: [SectionKind; 5] = [
        SectionKind::IpLayout,
        SectionKind::MemTopology,
        SectionKind::Connectivity,
        SectionKind::DebugIpLayout,
        SectionKind::ClockFreqTopology,
    ];

    /// Copy the cached kinds out of `image`. Absent sections are skipped.
    pub fn from_image(image: &Axlf<'_>) -> Result<Self, IcapError> {
        let mut sections = HashMap::new();
        for kind in Self::KINDS {
            if !image.has_section(kind) {
                trace!("Image has no {kind} section");
                continue;
            }
            sections.insert(kind, image.extract_section(kind)?);
        }
        Ok(SectionCache { sections })
    }

    pub fn get(&self, kind: SectionKind) -> Option<&[u8]> {
        self.sections.get(&kind).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn clock_topology(&self) -> Result<Option<ClockFreqTopology>, IcapError> {
        self.get(SectionKind::ClockFreqTopology)
            .map(ClockFreqTopology::parse)
            .transpose()
    }

    pub fn ip_layout(&self) -> Result<Option<IpLayout>, IcapError> {
        self.get(SectionKind::IpLayout).map(IpLayout::parse).transpose()
    }

    pub fn mem_topology(&self) -> Result<Option<MemTopology>, IcapError> {
        self.get(SectionKind::MemTopology)
            .map(MemTopology::parse)
            .transpose()
    }

    /// The auxiliary controllers the image brings; none without an `IP_LAYOUT`.
    pub fn controllers(&self) -> Result<Vec<ControllerDescriptor>, IcapError> {
        let Some(ip_layout) = self.ip_layout()? else {
            return Ok(Vec::new());
        };
        let mem_topology = self.mem_topology()?;
        Ok(controller_descriptors(&ip_layout, mem_topology.as_ref()))
    }
}

/// Brings up the drivers of the auxiliary controllers of an image.
pub trait ControllerFactory: Send + Sync {
    /// Tear down every controller of the previous image.
    fn destroy_all(&self);

    fn create(&self, descriptor: &ControllerDescriptor) -> Result<(), IcapError>;
}

/// Only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogControllerFactory;

impl ControllerFactory for LogControllerFactory {
    fn destroy_all(&self) {
        trace!("Destroying auxiliary controllers");
    }

    fn create(&self, descriptor: &ControllerDescriptor) -> Result<(), IcapError> {
        info!(
            "{:?} controller at 0x{:x} (ip {}, bank {})",
            descriptor.kind,
            descriptor.base_address,
            descriptor.ip_index,
            descriptor.memory_tag.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}
