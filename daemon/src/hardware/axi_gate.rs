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

//! The AXI gate between the static shell and the user region.
//!
//! While the gate is frozen no AXI traffic reaches the region being reprogrammed. The gate only
//! ever moves between two states and both transitions are idempotent, so [`FrozenGate`] can free
//! it unconditionally when the programming window closes.

use crate::error::IcapError;
use crate::hardware::io::{RegisterWindow, Sleeper};
use crate::hardware::regs::{gate, icap};
use log::{error, trace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Which reset sequence the configuration port expects while the gate is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateGeneration {
    /// Single reset pulse.
    #[default]
    Legacy,
    /// Software reset followed by a FIFO clear.
    Unified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Free,
    Frozen,
}

pub struct AxiGate {
    gate: RegisterWindow,
    icap: RegisterWindow,
    generation: GateGeneration,
    state: GateState,
    sleeper: Arc<dyn Sleeper>,
}

impl AxiGate {
    /// The gate is assumed free when the daemon starts.
    pub fn new(
        gate: RegisterWindow,
        icap: RegisterWindow,
        generation: GateGeneration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        AxiGate {
            gate,
            icap,
            generation,
            state: GateState::Free,
            sleeper,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Isolate the user region.
    ///
    /// # Returns: `Result<bool, IcapError>`
    /// * `Ok(true)` - the gate was free and is now frozen
    /// * `Ok(false)` - the gate was already frozen, nothing was written
    /// * `Err(IcapError)` - register access failed; the gate is left free when it was frozen first
    pub fn freeze(&mut self) -> Result<bool, IcapError> {
        if self.state == GateState::Frozen {
            return Ok(false);
        }
        trace!("Freezing AXI gate at {:#x}", self.gate.base());
        self.gate.read(gate::RD)?;
        self.gate.write(gate::WR, gate::FREEZE)?;
        self.state = GateState::Frozen;

        if let Err(e) = self.reset_port() {
            error!("Failed to reset the configuration port behind a frozen gate: {e}");
            if let Err(free_err) = self.free() {
                error!("Failed to free the AXI gate: {free_err}");
            }
            return Err(e);
        }
        Ok(true)
    }

    fn reset_port(&self) -> Result<(), IcapError> {
        self.gate.read(gate::RD)?;
        match self.generation {
            GateGeneration::Legacy => {
                self.icap.write(icap::CR, icap::CR_LEGACY_RESET)?;
                self.sleeper.sleep(Duration::from_nanos(20));
            }
            GateGeneration::Unified => {
                for value in [icap::CR_SW_RESET, 0, icap::CR_FIFO_CLEAR, 0] {
                    self.icap.write(icap::CR, value)?;
                    self.sleeper.sleep(Duration::from_micros(2));
                }
            }
        }
        Ok(())
    }

    /// Reconnect the user region.
    ///
    /// # Returns: `Result<bool, IcapError>`
    /// * `Ok(true)` - the gate was frozen and is now free
    /// * `Ok(false)` - the gate was already free, nothing was written
    /// * `Err(IcapError)` - register access failed, the gate is still considered frozen
    pub fn free(&mut self) -> Result<bool, IcapError> {
        if self.state == GateState::Free {
            return Ok(false);
        }
        trace!("Freeing AXI gate at {:#x}", self.gate.base());
        for value in gate::FREE_SEQUENCE {
            self.gate.read(gate::RD)?;
            self.gate.write(gate::WR, value)?;
            self.sleeper.sleep(Duration::from_nanos(500));
        }
        self.gate.read(gate::RD)?;
        self.state = GateState::Free;
        Ok(true)
    }

    /// Freeze the gate for the lifetime of the returned guard.
    pub fn frozen(&mut self) -> Result<FrozenGate<'_>, IcapError> {
        self.freeze()?;
        Ok(FrozenGate {
            gate: self,
            released: false,
        })
    }
}

/// A frozen gate; freed when dropped.
pub struct FrozenGate<'a> {
    gate: &'a mut AxiGate,
    released: bool,
}

impl FrozenGate<'_> {
    /// Free the gate now and report whether it worked.
    pub fn release(mut self) -> Result<(), IcapError> {
        self.released = true;
        self.gate.free().map(|_| ())
    }
}

impl Drop for FrozenGate<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.gate.free() {
            error!("Failed to free the AXI gate: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::io::RegisterIo;
    use crate::hardware::simulated::{NoopSleeper, SimulatedDevice};
    use googletest::prelude::*;
    use rstest::*;

    fn gate_on(device: &Arc<SimulatedDevice>, generation: GateGeneration) -> AxiGate {
        let layout = device.layout();
        AxiGate::new(
            RegisterWindow::new(device.clone(), layout.gate),
            RegisterWindow::new(device.clone(), layout.icap),
            generation,
            Arc::new(NoopSleeper),
        )
    }

    #[gtest]
    #[rstest]
    #[case::legacy(GateGeneration::Legacy, vec![0xc])]
    #[case::unified(GateGeneration::Unified, vec![0x8, 0x0, 0x4, 0x0])]
    fn freeze_resets_the_port_per_generation(
        #[case] generation: GateGeneration,
        #[case] resets: Vec<u32>,
    ) {
        let device = Arc::new(SimulatedDevice::default());
        let mut gate = gate_on(&device, generation);

        assert_that!(gate.freeze().unwrap(), eq(true));
        assert_that!(device.gate_writes(), eq(&vec![gate::FREEZE]));
        assert_that!(device.icap_control_writes(), eq(&resets));
        assert_that!(device.gate_frozen(), eq(true));
    }

    #[gtest]
    fn transitions_are_idempotent() {
        let device = Arc::new(SimulatedDevice::default());
        let mut gate = gate_on(&device, GateGeneration::Legacy);

        assert_that!(gate.free().unwrap(), eq(false));
        assert_that!(device.write_log().len(), eq(0));

        gate.freeze().unwrap();
        let after_first = device.write_log().len();
        assert_that!(gate.freeze().unwrap(), eq(false));
        assert_that!(device.write_log().len(), eq(after_first));

        assert_that!(gate.free().unwrap(), eq(true));
        assert_that!(
            device.gate_writes(),
            eq(&vec![gate::FREEZE, 0xe, 0xc, 0xe, 0xf])
        );
        assert_that!(gate.state(), eq(GateState::Free));
    }

    #[gtest]
    fn guard_frees_on_every_exit_path() {
        let device = Arc::new(SimulatedDevice::default());
        let mut gate = gate_on(&device, GateGeneration::Unified);

        let attempt = |gate: &mut AxiGate| -> Result<(), IcapError> {
            let _window = gate.frozen()?;
            Err(IcapError::Internal("programming failed".into()))
        };
        assert_that!(attempt(&mut gate), err(anything()));
        assert_that!(gate.state(), eq(GateState::Free));
        assert_that!(device.gate_frozen(), eq(false));
    }

    /// Fails every write to the ICAP control register.
    struct BrokenControl {
        inner: Arc<SimulatedDevice>,
        control: u64,
    }

    impl RegisterIo for BrokenControl {
        fn read32(&self, offset: u64) -> Result<u32, IcapError> {
            self.inner.read32(offset)
        }

        fn write32(&self, offset: u64, value: u32) -> Result<(), IcapError> {
            if offset == self.control {
                return Err(IcapError::Internal("bus error".into()));
            }
            self.inner.write32(offset, value)
        }
    }

    #[gtest]
    fn failed_port_reset_leaves_the_gate_free() {
        let device = Arc::new(SimulatedDevice::default());
        let layout = device.layout();
        let io: Arc<dyn RegisterIo> = Arc::new(BrokenControl {
            inner: device.clone(),
            control: layout.icap + icap::CR,
        });
        let mut gate = AxiGate::new(
            RegisterWindow::new(io.clone(), layout.gate),
            RegisterWindow::new(io, layout.icap),
            GateGeneration::Legacy,
            Arc::new(NoopSleeper),
        );

        assert_that!(
            gate.frozen().map(|_| ()),
            err(displays_as(contains_substring("bus error")))
        );
        assert_that!(gate.state(), eq(GateState::Free));
        assert_that!(device.gate_frozen(), eq(false));
        assert_that!(
            device.gate_writes(),
            eq(&vec![gate::FREEZE, 0xe, 0xc, 0xe, 0xf])
        );
    }

    #[gtest]
    fn explicit_release_frees_once() {
        let device = Arc::new(SimulatedDevice::default());
        let mut gate = gate_on(&device, GateGeneration::Legacy);

        gate.frozen().unwrap().release().unwrap();
        assert_that!(gate.state(), eq(GateState::Free));
        assert_that!(device.gate_writes().len(), eq(5));
    }
}
