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

//! The backend of the function that owns the programming hardware.
//!
//! A download runs in this order:
//!
//! 1. the signature policy is applied to the container and the header of its clearing
//!    bitstream is checked
//! 2. the clock topology of the image is validated and its frequencies applied
//! 3. with the gate frozen: the clearing bitstream staged by the previous image, the primary
//!    bitstream, and a forced reapplication of the frequencies, since programming can disturb
//!    the generators without their registers showing it
//! 4. the clearing bitstream of the new image is staged for the next download
//! 5. memory controller calibration is awaited
//!
//! The gate is freed on every exit from step 3.

use crate::config::BlockLayout;
use crate::container::axlf::{Axlf, SectionKind};
use crate::container::bitheader::BitHeader;
use crate::container::sections::{ClockFreqTopology, MAX_CLOCKS};
use crate::container::signature::{
    KeyringHandle, SecurityLevel, SignaturePolicy, SignatureVerifier, UnavailableVerifier,
};
use crate::error::IcapError;
use crate::hardware::axi_gate::{AxiGate, GateGeneration};
use crate::hardware::clock_wizard::ClockEngine;
use crate::hardware::config_port::ConfigPort;
use crate::hardware::io::{RegisterIo, RegisterWindow, Sleeper};
use crate::hardware::poll::RetryPolicy;
use crate::hardware::regs::calibration;
use crate::lifecycle::backend::Backend;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Time the device needs to come back after an IPROG reload.
const REBOOT_DELAY: Duration = Duration::from_secs(4);
/// Settle time around an AXI gate reset.
const GATE_RESET_DELAY: Duration = Duration::from_millis(500);

pub struct HardwareOwner {
    port: ConfigPort,
    gate: AxiGate,
    clocks: ClockEngine,
    calibration: Option<RegisterWindow>,
    sleeper: Arc<dyn Sleeper>,
    /// Clearing bitstream of the active image, programmed before the next image.
    clearing: Option<Vec<u8>>,
    /// Frequencies last requested, in generator order.
    targets: [u16; MAX_CLOCKS],
    security: SecurityLevel,
    verifier: Arc<dyn SignatureVerifier>,
    keyring: Option<KeyringHandle>,
    idcode: u32,
}

impl HardwareOwner {
    /// Attach to the blocks of `layout` on `io` and read the device IDCODE.
    ///
    /// # Arguments
    ///
    /// * `io` - register access to the management BAR
    /// * `layout` - where the blocks are within `io`
    /// * `generation` - reset sequence of the configuration port
    /// * `sleeper` - delays between register accesses
    ///
    /// # Returns: `Result<HardwareOwner, IcapError>`
    /// * `Ok(HardwareOwner)` - ready, with no signature verification configured
    /// * `Err(IcapError::Argument)` - the layout names more generators than are supported
    /// * `Err(IcapError)` - the IDCODE probe failed
    pub fn new(
        io: Arc<dyn RegisterIo>,
        layout: &BlockLayout,
        generation: GateGeneration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, IcapError> {
        let window = |base: u64| RegisterWindow::new(io.clone(), base);
        let icap = window(layout.icap);
        let port = ConfigPort::new(icap.clone(), sleeper.clone());
        let gate = AxiGate::new(window(layout.gate), icap, generation, sleeper.clone());
        let clocks = ClockEngine::new(
            layout.wizard_slots()?.map(|slot| slot.map(window)),
            layout.counter.map(window),
            layout.counter_hbm.map(window),
            sleeper.clone(),
        );
        let idcode = port.probe_idcode()?;

        Ok(HardwareOwner {
            port,
            gate,
            clocks,
            calibration: layout.calibration.map(window),
            sleeper,
            clearing: None,
            targets: [0; MAX_CLOCKS],
            security: SecurityLevel::None,
            verifier: Arc::new(UnavailableVerifier),
            keyring: None,
            idcode,
        })
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_keyring(mut self, keyring: KeyringHandle) -> Self {
        self.keyring = Some(keyring);
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security = level;
        self
    }

    fn apply_clock_topology(&mut self, image: &Axlf<'_>) -> Result<(), IcapError> {
        if !image.has_section(SectionKind::ClockFreqTopology) {
            info!("Image {} declares no clock topology", image.uuid());
            return Ok(());
        }
        let topology = ClockFreqTopology::parse(image.section(SectionKind::ClockFreqTopology)?)?;
        let targets = topology.target_frequencies()?;
        info!(
            "Image clocks: data {} MHz, kernel {} MHz, system {} MHz, system1 {} MHz",
            targets[0], targets[1], targets[2], targets[3]
        );
        self.set_frequencies(&targets)
    }

    fn program(&mut self, primary: &[u8]) -> Result<(), IcapError> {
        let window = self.gate.frozen()?;
        if let Some(clearing) = self.clearing.take() {
            info!("Programming staged clearing bitstream ({} bytes)", clearing.len());
            self.port.program(&clearing)?;
        }
        self.port.program(primary)?;
        self.clocks.reconfigure(&self.targets, true)?;
        window.release()
    }

    fn wait_for_calibration(&self) -> Result<(), IcapError> {
        let Some(block) = &self.calibration else {
            return Ok(());
        };
        let calibrated = RetryPolicy::CALIBRATION.poll(self.sleeper.as_ref(), || {
            Ok(block.read(calibration::STATUS)? & calibration::DONE != 0)
        })?;
        if !calibrated {
            error!(
                "Memory calibration did not complete within {:?}",
                RetryPolicy::CALIBRATION.budget()
            );
            return Err(IcapError::CalibrationTimeout);
        }
        Ok(())
    }
}

/// The clearing bitstream of `image`, with its header checked so it can be programmed later.
fn clearing_bitstream(image: &Axlf<'_>) -> Result<Option<Vec<u8>>, IcapError> {
    let clearing = match image.extract_section(SectionKind::ClearingBitstream) {
        Ok(clearing) => clearing,
        Err(IcapError::SectionNotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    BitHeader::parse(&clearing)?.payload(&clearing)?;
    Ok(Some(clearing))
}

impl Backend for HardwareOwner {
    fn privileged(&self) -> bool {
        true
    }

    fn download(&mut self, image: &Axlf<'_>) -> Result<(), IcapError> {
        image.validate_signature(&SignaturePolicy {
            level: self.security,
            verifier: self.verifier.as_ref(),
            keyring: self.keyring.as_deref(),
        })?;
        let clearing = clearing_bitstream(image)?;
        self.apply_clock_topology(image)?;

        let primary = image.section(SectionKind::Bitstream)?;
        self.program(primary)?;

        self.clearing = clearing;
        self.wait_for_calibration()?;
        info!("Image {} programmed", image.uuid());
        Ok(())
    }

    fn reset_bitstream(&mut self) -> Result<(), IcapError> {
        self.port.send_boot_sequence()?;
        self.sleeper.sleep(REBOOT_DELAY);
        self.clearing = None;
        info!("Device reloaded from flash");
        Ok(())
    }

    fn reset_axi_gate(&mut self) -> Result<(), IcapError> {
        self.gate.freeze()?;
        self.sleeper.sleep(GATE_RESET_DELAY);
        self.gate.free()?;
        self.sleeper.sleep(GATE_RESET_DELAY);
        Ok(())
    }

    fn set_frequencies(&mut self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        self.clocks.ensure_idle(targets)?;
        self.targets = *targets;

        let window = self.gate.frozen()?;
        let scaled = self.clocks.reconfigure(targets, false);
        window.release()?;
        scaled
    }

    fn verify_frequencies(&mut self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        self.clocks.verify(targets)
    }

    fn frequencies(&mut self) -> Result<[u16; MAX_CLOCKS], IcapError> {
        let mut freqs = [0; MAX_CLOCKS];
        for (idx, freq) in freqs.iter_mut().enumerate() {
            *freq = self.clocks.current_frequency(idx)?;
        }
        Ok(freqs)
    }

    fn counter_khz(&mut self, idx: usize) -> Result<u32, IcapError> {
        self.clocks.counter_khz(idx)
    }

    fn idcode(&mut self) -> Result<u32, IcapError> {
        Ok(self.idcode)
    }

    fn mig_calibrated(&mut self) -> Result<bool, IcapError> {
        match &self.calibration {
            Some(block) => Ok(block.read(calibration::STATUS)? & calibration::DONE != 0),
            None => Ok(false),
        }
    }

    fn security_level(&self) -> SecurityLevel {
        self.security
    }

    fn set_security_level(&mut self, level: SecurityLevel) -> Result<(), IcapError> {
        if level == SecurityLevel::Dedicated && self.keyring.is_none() {
            warn!("Dedicated keyring is unavailable, signed images will be rejected");
        }
        info!("Security level {:?} -> {level:?}", self.security);
        self.security = level;
        Ok(())
    }

    fn cache_expiry(&self) -> u64 {
        0
    }

    fn set_cache_expiry(&mut self, _secs: u64) -> Result<(), IcapError> {
        Err(IcapError::Argument(
            "the hardware owner keeps no peer cache".into(),
        ))
    }
}
