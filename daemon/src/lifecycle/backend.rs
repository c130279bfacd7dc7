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

use crate::container::axlf::Axlf;
use crate::container::sections::MAX_CLOCKS;
use crate::container::signature::SecurityLevel;
use crate::error::IcapError;

/// The part of a device that differs between the function owning the hardware and a function
/// that has to ask the owner for everything.
///
/// [`Icap`](crate::lifecycle::Icap) holds exactly one backend, chosen when it is built, and
/// calls it with the device lock held.
pub trait Backend: Send {
    /// Whether this backend drives the registers itself.
    fn privileged(&self) -> bool;

    /// Put `image` on the device. The image has been parsed and checked for compatibility.
    fn download(&mut self, image: &Axlf<'_>) -> Result<(), IcapError>;

    /// Reload the device from flash.
    fn reset_bitstream(&mut self) -> Result<(), IcapError>;

    /// Cycle the AXI gate.
    fn reset_axi_gate(&mut self) -> Result<(), IcapError>;

    /// Program the clock generators to `targets`, in MHz, `0` meaning unchanged.
    fn set_frequencies(&mut self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError>;

    /// Check the measured frequencies against `targets`.
    fn verify_frequencies(&mut self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError>;

    /// Frequency each generator is set to, in MHz.
    fn frequencies(&mut self) -> Result<[u16; MAX_CLOCKS], IcapError>;

    /// Measured frequency of clock `idx`, in kHz.
    fn counter_khz(&mut self, idx: usize) -> Result<u32, IcapError>;

    fn idcode(&mut self) -> Result<u32, IcapError>;

    fn mig_calibrated(&mut self) -> Result<bool, IcapError>;

    fn security_level(&self) -> SecurityLevel;

    fn set_security_level(&mut self, level: SecurityLevel) -> Result<(), IcapError>;

    /// Lifetime of cached peer state, in seconds.
    fn cache_expiry(&self) -> u64;

    fn set_cache_expiry(&mut self, secs: u64) -> Result<(), IcapError>;
}
