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

use crate::container::sections::MAX_CLOCKS;
use crate::container::xuid::Xuid;
use crate::error::IcapError;
use crate::hardware::clock_wizard::COUNTED_CLOCKS;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// Everything a peer mirrors about the hardware.
    ReadSnapshot,
    /// Program a container, transferred by value.
    LoadContainer(Vec<u8>),
    /// Program a container the owner can read in place.
    LoadContainerShared(Arc<[u8]>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    Snapshot(PeerSnapshot),
    /// `0`, or a negative errno.
    DownloadStatus(i32),
}

/// One field of a [`PeerSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    ClockFreq(usize),
    FreqCounter(usize),
    Idcode,
    MigCalibrated,
}

/// Hardware state of the owner as seen by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerSnapshot {
    /// MHz, in generator order.
    pub clock_freqs: [u16; MAX_CLOCKS],
    /// kHz, as measured.
    pub freq_counters: [u32; COUNTED_CLOCKS],
    pub idcode: u32,
    /// Image active on the owner.
    pub uuid: Xuid,
    pub mig_calibrated: bool,
}

/// A [`PeerSnapshot`] as it travels over DBus: `(aq, au, u, s, b)`.
pub type SnapshotWire = (Vec<u16>, Vec<u32>, u32, String, bool);

impl PeerSnapshot {
    pub fn value(&self, kind: DataKind) -> u64 {
        match kind {
            DataKind::ClockFreq(i) => self.clock_freqs.get(i).copied().map_or(0, u64::from),
            DataKind::FreqCounter(i) => self.freq_counters.get(i).copied().map_or(0, u64::from),
            DataKind::Idcode => u64::from(self.idcode),
            DataKind::MigCalibrated => u64::from(self.mig_calibrated),
        }
    }

    pub fn to_wire(&self) -> SnapshotWire {
        (
            self.clock_freqs.to_vec(),
            self.freq_counters.to_vec(),
            self.idcode,
            self.uuid.to_string(),
            self.mig_calibrated,
        )
    }

    /// Missing trailing clocks read as zero, extra ones are ignored.
    pub fn from_wire(wire: SnapshotWire) -> Result<PeerSnapshot, IcapError> {
        let (freqs, counters, idcode, uuid, mig_calibrated) = wire;
        let mut snapshot = PeerSnapshot {
            idcode,
            uuid: uuid.parse()?,
            mig_calibrated,
            ..PeerSnapshot::default()
        };
        for (dst, src) in snapshot.clock_freqs.iter_mut().zip(freqs) {
            *dst = src;
        }
        for (dst, src) in snapshot.freq_counters.iter_mut().zip(counters) {
            *dst = src;
        }
        Ok(snapshot)
    }
}
