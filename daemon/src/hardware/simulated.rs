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

//! A register-level model of the reprogramming blocks.
//!
//! [`SimulatedDevice`] answers register accesses the way the real blocks do closely enough for
//! the drivers to run against it: the configuration port accepts words, the gate remembers what
//! was written to it, the clock generators lock on the settings they are given and the counters
//! report the frequency those settings produce. Every write is logged. The `set_*` knobs inject
//! the failures the drivers have to cope with.
//!
//! The daemon runs on it when `simulate = true` is configured.

use crate::config::BlockLayout;
use crate::container::sections::MAX_CLOCKS;
use crate::error::IcapError;
use crate::hardware::io::{RegisterIo, Sleeper};
use crate::hardware::regs::{calibration, clock, counter, gate, icap};
use log::trace;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Address span decoded for each block.
const BLOCK_SPAN: u64 = 0x1000;

/// Default settings of every generator: 100 MHz.
const RESET_CONFIG: (u32, u32) = (0x0a01, 0x000a);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Icap,
    Gate,
    Calibration,
    Wizard(usize),
    Counter,
    CounterHbm,
}

#[derive(Debug)]
struct Wizard {
    config0: u32,
    config2: u32,
    saved: (u32, u32),
    locked: bool,
    fail_lock: bool,
    controls: Vec<u32>,
}

impl Default for Wizard {
    fn default() -> Self {
        Wizard {
            config0: RESET_CONFIG.0,
            config2: RESET_CONFIG.1,
            saved: RESET_CONFIG,
            locked: true,
            fail_lock: false,
            controls: Vec::new(),
        }
    }
}

impl Wizard {
    /// Output frequency in kHz.
    fn output_khz(&self) -> u32 {
        if !self.locked {
            return 0;
        }
        let div0 = u64::from(self.config0 & 0xff);
        let mut mul = u64::from((self.config0 >> 8) & 0xff) * 1000;
        if self.config0 & clock::MUL_FRAC_EN != 0 {
            mul += u64::from((self.config0 >> 16) & 0x3ff);
        }
        let mut div1 = u64::from(self.config2 & 0xff) * 1000;
        if self.config2 & clock::DIV_FRAC_EN != 0 {
            div1 += u64::from((self.config2 >> 8) & 0x3ff);
        }
        if div0 == 0 || div1 == 0 {
            return 0;
        }
        u32::try_from(100_000 * mul / (div0 * div1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug)]
struct State {
    writes: Vec<(u64, u32)>,
    fifo: Vec<u32>,
    programmed: Vec<u32>,
    strobes: usize,
    icap_controls: Vec<u32>,
    vacancy: u32,
    stuck_strobe: bool,
    done: bool,
    idcode: u32,
    gate_writes: Vec<u32>,
    calibrated: bool,
    wizards: [Wizard; MAX_CLOCKS],
    counter_status: u32,
    counter_hbm_status: u32,
    counter_override: [Option<u32>; MAX_CLOCKS],
}

impl Default for State {
    fn default() -> Self {
        State {
            writes: Vec::new(),
            fifo: Vec::new(),
            programmed: Vec::new(),
            strobes: 0,
            icap_controls: Vec::new(),
            vacancy: 64,
            stuck_strobe: false,
            done: true,
            idcode: 0x04b3_1093,
            gate_writes: Vec::new(),
            calibrated: true,
            wizards: Default::default(),
            counter_status: 0,
            counter_hbm_status: 0,
            counter_override: [None; MAX_CLOCKS],
        }
    }
}

/// A simulated management BAR laid out as [`BlockLayout`] describes.
#[derive(Debug)]
pub struct SimulatedDevice {
    layout: BlockLayout,
    state: Mutex<State>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        SimulatedDevice::new(BlockLayout::default())
    }
}

impl SimulatedDevice {
    pub fn new(layout: BlockLayout) -> Self {
        SimulatedDevice {
            layout,
            state: Mutex::new(State::default()),
        }
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a panic in a test holding the lock must not hide the real failure
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decode(&self, offset: u64) -> Option<(Block, u64)> {
        let within = |base: u64| (base..base + BLOCK_SPAN).contains(&offset);
        let l = &self.layout;
        let block = if within(l.icap) {
            (Block::Icap, l.icap)
        } else if within(l.gate) {
            (Block::Gate, l.gate)
        } else if let Some(base) = l.calibration.filter(|b| within(*b)) {
            (Block::Calibration, base)
        } else if let Some(base) = l.counter.filter(|b| within(*b)) {
            (Block::Counter, base)
        } else if let Some(base) = l.counter_hbm.filter(|b| within(*b)) {
            (Block::CounterHbm, base)
        } else {
            let (idx, base) = l
                .clock_wizards
                .iter()
                .take(MAX_CLOCKS)
                .enumerate()
                .find(|(_, b)| within(**b))?;
            (Block::Wizard(idx), *base)
        };
        Some((block.0, offset - block.1))
    }

    /// Every register write so far, as absolute offset and value.
    pub fn write_log(&self) -> Vec<(u64, u32)> {
        self.state().writes.clone()
    }

    /// Words the configuration port has taken, in order.
    pub fn programmed_words(&self) -> Vec<u32> {
        self.state().programmed.clone()
    }

    /// Forget the words taken so far.
    pub fn clear_programmed_words(&self) {
        self.state().programmed.clear();
    }

    /// Number of write strobes the configuration port has seen.
    pub fn write_strobes(&self) -> usize {
        self.state().strobes
    }

    /// Reset and FIFO commands written to the configuration port.
    pub fn icap_control_writes(&self) -> Vec<u32> {
        self.state().icap_controls.clone()
    }

    pub fn gate_writes(&self) -> Vec<u32> {
        self.state().gate_writes.clone()
    }

    pub fn gate_frozen(&self) -> bool {
        self.state().gate_writes.last() == Some(&gate::FREEZE)
    }

    /// Values written to the control register of generator `idx`.
    pub fn wizard_control_writes(&self, idx: usize) -> Vec<u32> {
        self.state().wizards[idx].controls.clone()
    }

    pub fn set_fifo_vacancy(&self, vacancy: u32) {
        self.state().vacancy = vacancy;
    }

    /// Keep the write strobe asserted forever.
    pub fn set_stuck_strobe(&self, stuck: bool) {
        self.state().stuck_strobe = stuck;
    }

    /// Whether the port reports done once it has taken words.
    pub fn set_done_after_program(&self, done: bool) {
        self.state().done = done;
    }

    pub fn set_idcode(&self, idcode: u32) {
        self.state().idcode = idcode;
    }

    pub fn set_calibrated(&self, calibrated: bool) {
        self.state().calibrated = calibrated;
    }

    pub fn set_wizard_config(&self, idx: usize, config0: u32, config2: u32) {
        let mut state = self.state();
        let wizard = &mut state.wizards[idx];
        wizard.config0 = config0;
        wizard.config2 = config2;
        wizard.saved = (config0, config2);
    }

    pub fn set_wizard_locked(&self, idx: usize, locked: bool) {
        self.state().wizards[idx].locked = locked;
    }

    /// Make generator `idx` fail to lock on new settings.
    pub fn set_lock_failure(&self, idx: usize, fail: bool) {
        self.state().wizards[idx].fail_lock = fail;
    }

    /// Report `khz` from the counter of clock `idx` instead of the generator output.
    pub fn set_counter_override(&self, idx: usize, khz: Option<u32>) {
        self.state().counter_override[idx] = khz;
    }

    fn counter_value(state: &State, idx: usize) -> u32 {
        state.counter_override[idx].unwrap_or_else(|| state.wizards[idx].output_khz())
    }
}

impl RegisterIo for SimulatedDevice {
    fn read32(&self, offset: u64) -> Result<u32, IcapError> {
        let state = self.state();
        let Some((block, reg)) = self.decode(offset) else {
            return Ok(0);
        };
        let value = match (block, reg) {
            (Block::Icap, icap::CR) if state.stuck_strobe => icap::CR_WRITE,
            (Block::Icap, icap::SR) if state.done => icap::SR_DONE_MASK,
            (Block::Icap, icap::WFV) => state.vacancy,
            (Block::Icap, icap::RF) => state.idcode,
            (Block::Calibration, calibration::STATUS) if state.calibrated => calibration::DONE,
            (Block::Wizard(i), clock::STATUS) => u32::from(state.wizards[i].locked),
            (Block::Wizard(i), r) if r == clock::config(0) => state.wizards[i].config0,
            (Block::Wizard(i), r) if r == clock::config(2) => state.wizards[i].config2,
            (Block::Counter, counter::CONTROL) => state.counter_status,
            (Block::Counter, r) if r == counter::value(0) => Self::counter_value(&state, 0),
            (Block::Counter, r) if r == counter::value(1) => Self::counter_value(&state, 1),
            (Block::CounterHbm, counter::CONTROL) => state.counter_hbm_status,
            (Block::CounterHbm, r) if r == counter::value(0) => Self::counter_value(&state, 2),
            _ => 0,
        };
        Ok(value)
    }

    fn write32(&self, offset: u64, value: u32) -> Result<(), IcapError> {
        let mut state = self.state();
        state.writes.push((offset, value));
        let Some((block, reg)) = self.decode(offset) else {
            trace!("Write {value:#x} to unmapped offset {offset:#x}");
            return Ok(());
        };
        match (block, reg) {
            (Block::Icap, icap::WF) => state.fifo.push(value),
            (Block::Icap, icap::CR) if value == icap::CR_WRITE => {
                state.strobes += 1;
                if !state.stuck_strobe {
                    let words = std::mem::take(&mut state.fifo);
                    state.programmed.extend(words);
                }
            }
            (Block::Icap, icap::CR) if value != icap::CR_READ => {
                if value & icap::CR_FIFO_CLEAR != 0 {
                    state.fifo.clear();
                }
                state.icap_controls.push(value);
            }
            (Block::Gate, gate::WR) => state.gate_writes.push(value),
            (Block::Wizard(i), r) if r == clock::config(0) => state.wizards[i].config0 = value,
            (Block::Wizard(i), r) if r == clock::config(2) => state.wizards[i].config2 = value,
            (Block::Wizard(i), clock::CONTROL) => {
                let wizard = &mut state.wizards[i];
                wizard.controls.push(value);
                match value {
                    clock::SADDR if wizard.fail_lock => wizard.locked = false,
                    clock::SADDR => {
                        wizard.locked = true;
                        wizard.saved = (wizard.config0, wizard.config2);
                    }
                    clock::RESTORE => {
                        (wizard.config0, wizard.config2) = wizard.saved;
                        wizard.locked = true;
                    }
                    _ => {}
                }
            }
            (Block::Counter, counter::CONTROL) if value == counter::RESET => {
                state.counter_status = counter::READY;
            }
            (Block::CounterHbm, counter::CONTROL) if value == counter::RESET => {
                state.counter_hbm_status = counter::READY;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn calls(&self) -> usize {
        self.delays.lock().map(|d| d.len()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.delays
            .lock()
            .map(|d| d.iter().sum())
            .unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) {}
}
