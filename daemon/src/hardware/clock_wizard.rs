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

//! Dynamic reconfiguration of the user clock generators.
//!
//! The generators can only be programmed to the discrete settings of [`FREQUENCY_TABLE`]. A
//! requested frequency is mapped to the highest table entry that does not exceed it, so a clock is
//! never run faster than the image asked for. The frequency counters measure what the generators
//! actually produce.

use crate::container::sections::MAX_CLOCKS;
use crate::error::IcapError;
use crate::hardware::io::{RegisterWindow, Sleeper};
use crate::hardware::poll::RetryPolicy;
use crate::hardware::regs::{clock, counter};
use log::{error, info, trace};
use std::sync::Arc;
use std::time::Duration;

/// Reference input of every generator, in MHz.
const INPUT_FREQ_MHZ: u64 = 100;

/// One programmable generator setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyStep {
    pub freq_mhz: u16,
    /// Value of CONFIG(0): multiplier and first divider.
    pub config0: u32,
    /// Value of CONFIG(2): output divider.
    pub config2: u32,
}

const fn step(freq_mhz: u16, config0: u32, config2: u32) -> FrequencyStep {
    FrequencyStep {
        freq_mhz,
        config0,
        config2,
    }
}

/// Supported generator settings, ascending.
pub const FREQUENCY_TABLE: [FrequencyStep; 40] = [
    step(60, 0x0601, 0x000a),
    step(66, 0x0601, 0x0009),
    step(75, 0x0601, 0x0008),
    step(80, 0x0801, 0x000a),
    step(85, 0x0601, 0x0007),
    step(90, 0x0901, 0x000a),
    step(100, 0x0a01, 0x000a),
    step(110, 0x0b01, 0x000a),
    step(116, 0x0701, 0x0006),
    step(122, 0x0b01, 0x0009),
    step(128, 0x0901, 0x0007),
    step(133, 0x0c01, 0x0009),
    step(140, 0x0e01, 0x000a),
    step(150, 0x0c01, 0x0008),
    step(155, 0x0e01, 0x0009),
    step(160, 0x0801, 0x0005),
    step(166, 0x0a01, 0x0006),
    step(171, 0x0c01, 0x0007),
    step(180, 0x0901, 0x0005),
    step(185, 0x0d01, 0x0007),
    step(200, 0x0e01, 0x0007),
    step(216, 0x0d01, 0x0006),
    step(225, 0x0901, 0x0004),
    step(233, 0x0e01, 0x0006),
    step(240, 0x0c01, 0x0005),
    step(250, 0x0a01, 0x0004),
    step(260, 0x0d01, 0x0005),
    step(266, 0x0801, 0x0003),
    step(275, 0x0b01, 0x0004),
    step(280, 0x0e01, 0x0005),
    step(300, 0x0c01, 0x0004),
    step(325, 0x0d01, 0x0004),
    step(333, 0x0a01, 0x0003),
    step(350, 0x0e01, 0x0004),
    step(366, 0x0b01, 0x0003),
    step(400, 0x0c01, 0x0003),
    step(433, 0x0d01, 0x0003),
    step(450, 0x0901, 0x0002),
    step(466, 0x0e01, 0x0003),
    step(500, 0x0a01, 0x0002),
];

/// Index of the highest table entry not above `freq_mhz`, clamped to the table.
///
/// # Examples
///
/// ```
/// use icapd::hardware::clock_wizard::{nearest_step, FREQUENCY_TABLE};
///
/// assert_eq!(FREQUENCY_TABLE[nearest_step(305)].freq_mhz, 300);
/// assert_eq!(nearest_step(10), 0);
/// assert_eq!(nearest_step(10_000), FREQUENCY_TABLE.len() - 1);
/// ```
pub fn nearest_step(freq_mhz: u32) -> usize {
    FREQUENCY_TABLE
        .partition_point(|s| u32::from(s.freq_mhz) <= freq_mhz)
        .saturating_sub(1)
}

/// The frequency a generator actually runs at when `freq_mhz` is requested.
pub fn step_frequency(freq_mhz: u32) -> u16 {
    FREQUENCY_TABLE[nearest_step(freq_mhz)].freq_mhz
}

/// Clocks with a frequency counter: data, kernel and the HBM clock.
pub const COUNTED_CLOCKS: usize = 3;

/// The clock generators of the user region and their frequency counters.
pub struct ClockEngine {
    wizards: [Option<RegisterWindow>; MAX_CLOCKS],
    counter: Option<RegisterWindow>,
    counter_hbm: Option<RegisterWindow>,
    sleeper: Arc<dyn Sleeper>,
}

impl ClockEngine {
    pub fn new(
        wizards: [Option<RegisterWindow>; MAX_CLOCKS],
        counter: Option<RegisterWindow>,
        counter_hbm: Option<RegisterWindow>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        ClockEngine {
            wizards,
            counter,
            counter_hbm,
            sleeper,
        }
    }

    fn locked(wizard: &RegisterWindow) -> Result<bool, IcapError> {
        Ok(wizard.read(clock::STATUS)? & clock::STATUS_LOCKED != 0)
    }

    /// Frequency generator `idx` currently produces, in MHz.
    ///
    /// # Returns: `Result<u16, IcapError>`
    /// * `Ok(0)` - there is no generator `idx`, it is not locked, or its dividers read as zero
    /// * `Ok(u16)` - the frequency reconstructed from the generator settings
    pub fn current_frequency(&self, idx: usize) -> Result<u16, IcapError> {
        let Some(wizard) = self.wizards.get(idx).and_then(Option::as_ref) else {
            return Ok(0);
        };
        if !Self::locked(wizard)? {
            return Ok(0);
        }

        let config0 = wizard.read(clock::config(0))?;
        let div0 = u64::from(config0 & 0xff);
        let mut mul0 = u64::from((config0 >> 8) & 0xff);
        let mut mul_frac0 = 0;
        if config0 & clock::MUL_FRAC_EN != 0 {
            mul_frac0 = u64::from((config0 >> 16) & 0x3ff);
        }
        mul0 = mul0 * 1000 + mul_frac0;

        let config2 = wizard.read(clock::config(2))?;
        let mut div1 = u64::from(config2 & 0xff);
        let mut div_frac1 = 0;
        if config2 & clock::DIV_FRAC_EN != 0 {
            div_frac1 = u64::from((config2 >> 8) & 0x3ff);
        }
        div1 = div1 * 1000 + div_frac1;

        let divider = div0 * 1000 * div1;
        if divider == 0 {
            error!("Clock generator {idx} reports a zero divider");
            return Ok(0);
        }
        let freq = INPUT_FREQ_MHZ * mul0 * 1000 / divider;
        Ok(u16::try_from(freq).unwrap_or(u16::MAX))
    }

    /// Fail with `ClockBusy` if a generator that would be reprogrammed is not idle.
    pub fn ensure_idle(&self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        for (idx, target) in targets.iter().enumerate() {
            if *target == 0 {
                continue;
            }
            if let Some(wizard) = &self.wizards[idx]
                && !Self::locked(wizard)?
            {
                error!("Clock generator {idx} is busy");
                return Err(IcapError::ClockBusy { clock: idx });
            }
        }
        Ok(())
    }

    /// Program the generators to `targets`, in MHz; `0` leaves a generator untouched.
    ///
    /// Without `force` a generator that already runs at the step a target maps to is skipped.
    /// The batch stops at the first generator that fails to lock, after that generator has been
    /// restored to its previous settings.
    ///
    /// # Arguments
    ///
    /// * `targets` - requested frequency per generator
    /// * `force` - reprogram even generators that already run at the requested step
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::ClockBusy)` - a generator was not locked before reprogramming
    /// * `Err(IcapError::ClockLockTimeout)` - a generator did not lock on the new settings
    pub fn reconfigure(&self, targets: &[u16; MAX_CLOCKS], force: bool) -> Result<(), IcapError> {
        for (idx, target) in targets.iter().enumerate() {
            if *target == 0 {
                continue;
            }
            let Some(wizard) = &self.wizards[idx] else {
                continue;
            };
            let step_idx = nearest_step(u32::from(*target));
            let current = self.current_frequency(idx)?;
            info!("Clock {idx}: current {current} MHz, requested {target} MHz");
            if !force && nearest_step(u32::from(current)) == step_idx {
                continue;
            }
            if !Self::locked(wizard)? {
                error!("Clock generator {idx} is busy");
                return Err(IcapError::ClockBusy { clock: idx });
            }

            let setting = FREQUENCY_TABLE[step_idx];
            wizard.write(clock::config(0), setting.config0)?;
            wizard.write(clock::config(2), setting.config2)?;
            self.sleeper.sleep(Duration::from_millis(10));
            wizard.write(clock::CONTROL, clock::LOAD_SEN)?;
            self.sleeper.sleep(Duration::from_millis(1));
            wizard.write(clock::CONTROL, clock::SADDR)?;

            trace!("Waiting for clock generator {idx} to lock");
            self.sleeper.sleep(Duration::from_millis(100));
            let locked =
                RetryPolicy::CLOCK_LOCK.poll(self.sleeper.as_ref(), || Self::locked(wizard))?;
            if !locked {
                error!(
                    "Clock generator {idx} did not lock after {:?}, restoring previous settings",
                    RetryPolicy::CLOCK_LOCK.budget()
                );
                wizard.write(clock::CONTROL, clock::RESTORE)?;
                self.sleeper.sleep(Duration::from_millis(10));
                wizard.write(clock::CONTROL, clock::IDLE)?;
                return Err(IcapError::ClockLockTimeout { clock: idx });
            }
            trace!(
                "Clock generator {idx}: CONFIG(0) {:#x}, CONFIG(2) {:#x}",
                wizard.read(clock::config(0))?,
                wizard.read(clock::config(2))?
            );
        }
        Ok(())
    }

    /// Measured frequency of clock `idx`, in kHz; `0` when no counter covers it.
    pub fn counter_khz(&self, idx: usize) -> Result<u32, IcapError> {
        let (block, register) = match idx {
            0 | 1 => (self.counter.as_ref(), counter::value(idx as u64)),
            2 => (self.counter_hbm.as_ref(), counter::value(0)),
            _ => (None, 0),
        };
        let Some(block) = block else {
            return Ok(0);
        };
        block.write(counter::CONTROL, counter::RESET)?;
        let latched = RetryPolicy::COUNTER_LATCH.poll(self.sleeper.as_ref(), || {
            Ok(block.read(counter::CONTROL)? == counter::READY)
        })?;
        if !latched {
            trace!("Frequency counter for clock {idx} did not latch, reading anyway");
        }
        block.read(register)
    }

    /// Check the measured frequencies against the steps `targets` map to.
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::FrequencyOutOfTolerance)` - a clock is more than 5% off its step
    pub fn verify(&self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        for (idx, target) in targets.iter().enumerate() {
            if *target == 0 {
                continue;
            }
            let step = u32::from(step_frequency(u32::from(*target)));
            let expected_khz = step * 1000;
            let measured_khz = self.counter_khz(idx)?;
            if measured_khz.abs_diff(expected_khz) > step * 50 {
                error!(
                    "Clock {idx} runs at {measured_khz} kHz, {expected_khz} kHz requested"
                );
                return Err(IcapError::FrequencyOutOfTolerance {
                    clock: idx,
                    expected_khz,
                    measured_khz,
                });
            }
        }
        Ok(())
    }
}
