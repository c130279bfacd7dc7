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

//! Bitstream lifecycle of one device.
//!
//! [`Icap`] is the entry point for everything that changes or reads the programmed image: it
//! parses and checks containers, keeps the [`ImageState`] and the metadata of the active image,
//! and hands the hardware work to a [`Backend`]. Two backends exist:
//!
//! - [`HardwareOwner`](hardware_owner::HardwareOwner) drives the configuration port, the AXI
//!   gate and the clock generators of a function that owns them.
//! - [`PeerDelegate`](peer_delegate::PeerDelegate) forwards to the owning function through a
//!   [`PeerChannel`](crate::peer::PeerChannel).
//!
//! Every operation holds the device lock for its whole duration, so a download, a lock and a
//! clock change never interleave.
//!
//! # Examples
//!
//! ```
//! use icapd::container::builder::AxlfBuilder;
//! use icapd::container::xuid::Xuid;
//! use icapd::hardware::axi_gate::GateGeneration;
//! use icapd::hardware::simulated::{NoopSleeper, SimulatedDevice};
//! use icapd::lifecycle::IcapBuilder;
//! use icapd::lifecycle::hardware_owner::HardwareOwner;
//! use std::sync::Arc;
//!
//! let device = Arc::new(SimulatedDevice::default());
//! let owner = HardwareOwner::new(
//!     device.clone(),
//!     &device.layout(),
//!     GateGeneration::Legacy,
//!     Arc::new(NoopSleeper),
//! )?;
//! let icap = IcapBuilder::new(owner).build();
//!
//! let id = Xuid::from_bytes([0x42; 16]);
//! let image = AxlfBuilder::new(id).bitstream(&[0u8; 64]).build();
//! assert_eq!(icap.download(&image)?, id);
//! assert_eq!(icap.lock(&id)?, 1);
//! # Ok::<(), icapd::error::IcapError>(())
//! ```

pub mod backend;
pub mod hardware_owner;
pub mod image_state;
pub mod notify;
pub mod peer_delegate;
pub mod section_cache;

use crate::container::axlf::{Axlf, DeviceInfo, SectionKind};
use crate::container::sections::{ControllerDescriptor, MAX_CLOCKS};
use crate::container::signature::SecurityLevel;
use crate::container::xuid::Xuid;
use crate::error::IcapError;
use crate::hardware::clock_wizard::COUNTED_CLOCKS;
use crate::lifecycle::backend::Backend;
use crate::lifecycle::image_state::ImageState;
use crate::lifecycle::notify::{ExecNotifier, LogNotifier};
use crate::lifecycle::section_cache::{ControllerFactory, LogControllerFactory, SectionCache};
use crate::peer::protocol::{PeerRequest, PeerResponse, PeerSnapshot};
use log::{error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

struct IcapInner {
    backend: Box<dyn Backend>,
    state: ImageState,
    sections: SectionCache,
    controllers: Vec<ControllerDescriptor>,
}

/// One device: its active image, the users holding it, and the hardware behind it.
pub struct Icap {
    inner: Mutex<IcapInner>,
    device: DeviceInfo,
    notifier: Arc<dyn ExecNotifier>,
    factory: Arc<dyn ControllerFactory>,
}

pub struct IcapBuilder {
    backend: Box<dyn Backend>,
    device: DeviceInfo,
    notifier: Arc<dyn ExecNotifier>,
    factory: Arc<dyn ControllerFactory>,
}

impl IcapBuilder {
    pub fn new(backend: impl Backend + 'static) -> Self {
        IcapBuilder::boxed(Box::new(backend))
    }

    /// For a backend chosen at runtime.
    pub fn boxed(backend: Box<dyn Backend>) -> Self {
        IcapBuilder {
            backend,
            device: DeviceInfo::default(),
            notifier: Arc::new(LogNotifier),
            factory: Arc::new(LogControllerFactory),
        }
    }

    /// What the installed shell accepts; by default any image.
    pub fn device_info(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ExecNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn controller_factory(mut self, factory: Arc<dyn ControllerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn build(self) -> Icap {
        Icap {
            inner: Mutex::new(IcapInner {
                backend: self.backend,
                state: ImageState::Idle,
                sections: SectionCache::default(),
                controllers: Vec::new(),
            }),
            device: self.device,
            notifier: self.notifier,
            factory: self.factory,
        }
    }
}

/// Round a counter reading to the nearest MHz.
fn khz_to_mhz(khz: u32) -> u16 {
    u16::try_from(khz.saturating_add(500) / 1000).unwrap_or(u16::MAX)
}

impl Icap {
    fn lock_inner(&self) -> Result<MutexGuard<'_, IcapInner>, IcapError> {
        self.inner
            .lock()
            .map_err(|e| IcapError::Internal(format!("device lock poisoned: {e}")))
    }

    /// Whether this device drives the programming hardware itself.
    pub fn privileged(&self) -> Result<bool, IcapError> {
        Ok(self.lock_inner()?.backend.privileged())
    }

    /// Program the container in `bytes` and make it the active image.
    ///
    /// The container is parsed and checked against the installed shell before the device
    /// is touched. A download is refused while anybody holds the active image. If it fails
    /// after programming started, the device is left without an active image.
    ///
    /// # Arguments
    ///
    /// * `bytes` - a complete xclbin container
    ///
    /// # Returns: `Result<Xuid, IcapError>`
    /// * `Ok(Xuid)` - the uuid of the now active image
    /// * `Err(IcapError::ImageInUse)` - the active image is locked
    /// * `Err(IcapError)` - the container is invalid or programming failed
    pub fn download(&self, bytes: &[u8]) -> Result<Xuid, IcapError> {
        let image = Axlf::parse(bytes)?;
        image.validate_compatibility(&self.device)?;
        let id = image.uuid();

        let mut inner = self.lock_inner()?;
        inner.state.begin_programming()?;
        info!("Downloading image {id}");
        self.factory.destroy_all();
        inner.sections = SectionCache::default();
        inner.controllers.clear();

        match self.install(&mut inner, &image) {
            Ok(()) => {
                inner.state.finish_programming(id)?;
                info!("Image {id} is active");
                Ok(id)
            }
            Err(e) => {
                error!("Download of image {id} failed: {e}");
                inner.sections = SectionCache::default();
                inner.controllers.clear();
                inner.state.abort_programming();
                Err(e)
            }
        }
    }

    fn install(&self, inner: &mut IcapInner, image: &Axlf<'_>) -> Result<(), IcapError> {
        inner.backend.download(image)?;
        inner.sections = SectionCache::from_image(image)?;

        let privileged = inner.backend.privileged();
        let controllers = match inner.sections.controllers() {
            Ok(controllers) => controllers,
            Err(e) if !privileged => {
                warn!("Cannot derive controllers of image {}: {e}", image.uuid());
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        for controller in &controllers {
            if let Err(e) = self.factory.create(controller) {
                if privileged {
                    return Err(e);
                }
                warn!("Cannot create {:?} controller: {e}", controller.kind);
            }
        }
        inner.controllers = controllers;
        Ok(())
    }

    /// Take a reference on the active image. The first reference activates it for execution.
    ///
    /// # Returns: `Result<u32, IcapError>`
    /// * `Ok(u32)` - the new reference count
    /// * `Err(IcapError::IdentityMismatch)` - `id` is not the active image
    pub fn lock(&self, id: &Xuid) -> Result<u32, IcapError> {
        let mut inner = self.lock_inner()?;
        let refs = inner.state.lock(id)?;
        if refs == 1 {
            self.notifier.activate(id);
        }
        info!("Image {id} locked, {refs} user(s)");
        Ok(refs)
    }

    /// Drop a reference on the active image; `None` or the null uuid drops all of them.
    ///
    /// # Returns: `Result<u32, IcapError>`
    /// * `Ok(u32)` - the new reference count
    /// * `Err(IcapError::IdentityMismatch)` - `id` is not the active image
    /// * `Err(IcapError::Argument)` - the image is not locked
    pub fn unlock(&self, id: Option<&Xuid>) -> Result<u32, IcapError> {
        let mut inner = self.lock_inner()?;
        let before = inner.state.refcount();
        let refs = inner.state.unlock(id)?;
        if refs == 0 && before > 0 && !inner.backend.privileged() {
            self.notifier.stop();
        }
        info!("Image {} unlocked, {refs} user(s)", inner.state.active_id());
        Ok(refs)
    }

    /// Reload the device from flash, dropping the active image.
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::NotPrivileged)` - on a peer
    /// * `Err(IcapError::ImageInUse)` - the active image is locked
    pub fn reset_bitstream(&self) -> Result<(), IcapError> {
        let mut inner = self.lock_inner()?;
        if !inner.backend.privileged() {
            return Err(IcapError::NotPrivileged(
                "resetting the bitstream is only possible on the owning function".into(),
            ));
        }
        inner.state.check_not_in_use()?;
        inner.backend.reset_bitstream()?;
        inner.state.reset()?;
        self.factory.destroy_all();
        inner.sections = SectionCache::default();
        inner.controllers.clear();
        Ok(())
    }

    /// Cycle the AXI gate between the shell and the user region.
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::NotPrivileged)` - on a peer
    /// * `Err(IcapError::ImageInUse)` - the active image is locked
    pub fn reset_axi_gate(&self) -> Result<(), IcapError> {
        let mut inner = self.lock_inner()?;
        if !inner.backend.privileged() {
            return Err(IcapError::NotPrivileged(
                "resetting the AXI gate is only possible on the owning function".into(),
            ));
        }
        inner.state.check_not_in_use()?;
        inner.backend.reset_axi_gate()
    }

    /// Program the clock generators to `targets` MHz without any bounds check; `0` leaves a
    /// generator unchanged.
    pub fn set_frequencies(&self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        self.lock_inner()?.backend.set_frequencies(targets)
    }

    /// Override the frequencies of the active image.
    ///
    /// Each non-zero target must lie within [`frequency_bounds`](Self::frequency_bounds).
    /// The measured frequencies are checked afterwards.
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::ClockTopology)` - no active image, or it declares no clocks
    /// * `Err(IcapError::FrequencyOutOfRange)` - a target is out of bounds; nothing is written
    /// * `Err(IcapError::FrequencyOutOfTolerance)` - a clock did not reach its target
    pub fn update_frequencies(&self, targets: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        let mut inner = self.lock_inner()?;
        let id = inner.state.active_id();
        if id.is_null() {
            return Err(IcapError::ClockTopology("no active image".into()));
        }
        let topology = inner.sections.clock_topology()?.ok_or_else(|| {
            IcapError::ClockTopology(format!("image {id} declares no clock topology"))
        })?;
        for (clock, requested) in targets.iter().copied().enumerate() {
            if requested == 0 {
                continue;
            }
            let (min, max) = topology.bounds(clock)?;
            if max == 0 || requested < min || requested > max {
                return Err(IcapError::FrequencyOutOfRange {
                    clock,
                    requested,
                    min,
                    max,
                });
            }
        }
        inner.backend.set_frequencies(targets)?;
        inner.backend.verify_frequencies(targets)
    }

    /// Frequency each generator is set to, in MHz.
    pub fn frequencies(&self) -> Result<[u16; MAX_CLOCKS], IcapError> {
        self.lock_inner()?.backend.frequencies()
    }

    /// `(min, max)` MHz each clock may be overridden to; `(0, 0)` for clocks the active image
    /// does not use, and for all clocks without an active image.
    pub fn frequency_bounds(&self) -> Result<[(u16, u16); MAX_CLOCKS], IcapError> {
        let inner = self.lock_inner()?;
        let mut bounds = [(0, 0); MAX_CLOCKS];
        if let Some(topology) = inner.sections.clock_topology()? {
            for (idx, slot) in bounds.iter_mut().enumerate() {
                *slot = topology.bounds(idx)?;
            }
        }
        Ok(bounds)
    }

    /// Frequency of each clock in MHz: measured where a counter exists and an image is
    /// active, configured otherwise.
    pub fn clock_report(&self) -> Result<[u16; MAX_CLOCKS], IcapError> {
        let mut inner = self.lock_inner()?;
        let mut report = inner.backend.frequencies()?;
        if inner.state.active_id().is_null() {
            return Ok(report);
        }
        for (idx, freq) in report.iter_mut().enumerate().take(COUNTED_CLOCKS) {
            let configured = *freq;
            let measured_khz = inner.backend.counter_khz(idx)?;
            let expected_khz = u32::from(configured) * 1000;
            if configured != 0 && measured_khz.abs_diff(expected_khz) > u32::from(configured) * 50
            {
                warn!("Clock {idx} measures {measured_khz} kHz, set to {configured} MHz");
            }
            *freq = khz_to_mhz(measured_khz);
        }
        Ok(report)
    }

    pub fn idcode(&self) -> Result<u32, IcapError> {
        self.lock_inner()?.backend.idcode()
    }

    pub fn mig_calibrated(&self) -> Result<bool, IcapError> {
        self.lock_inner()?.backend.mig_calibrated()
    }

    /// Cached metadata section of the active image.
    ///
    /// # Returns: `Result<Vec<u8>, IcapError>`
    /// * `Err(IcapError::SectionNotFound)` - not cached, or the image has no such section
    pub fn section(&self, kind: SectionKind) -> Result<Vec<u8>, IcapError> {
        self.lock_inner()?
            .sections
            .get(kind)
            .map(<[u8]>::to_vec)
            .ok_or(IcapError::SectionNotFound(kind))
    }

    pub fn state(&self) -> Result<ImageState, IcapError> {
        Ok(self.lock_inner()?.state)
    }

    /// The active image, [`Xuid::NULL`] when there is none.
    pub fn active_image(&self) -> Result<Xuid, IcapError> {
        Ok(self.lock_inner()?.state.active_id())
    }

    pub fn refcount(&self) -> Result<u32, IcapError> {
        Ok(self.lock_inner()?.state.refcount())
    }

    /// Auxiliary controllers of the active image.
    pub fn controllers(&self) -> Result<Vec<ControllerDescriptor>, IcapError> {
        Ok(self.lock_inner()?.controllers.clone())
    }

    pub fn security_level(&self) -> Result<SecurityLevel, IcapError> {
        Ok(self.lock_inner()?.backend.security_level())
    }

    pub fn set_security_level(&self, level: SecurityLevel) -> Result<(), IcapError> {
        self.lock_inner()?.backend.set_security_level(level)
    }

    /// Lifetime of the cached owner state, in seconds.
    pub fn cache_expiry(&self) -> Result<u64, IcapError> {
        Ok(self.lock_inner()?.backend.cache_expiry())
    }

    pub fn set_cache_expiry(&self, secs: u64) -> Result<(), IcapError> {
        self.lock_inner()?.backend.set_cache_expiry(secs)
    }

    /// Answer a request from a peer function.
    ///
    /// Snapshot fields that cannot be read are reported as zero. A forwarded download
    /// answers `0` or the negative errno of the failure.
    pub fn serve_peer(&self, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::ReadSnapshot => PeerResponse::Snapshot(self.snapshot()),
            PeerRequest::LoadContainer(bytes) => {
                PeerResponse::DownloadStatus(self.serve_download(&bytes))
            }
            PeerRequest::LoadContainerShared(bytes) => {
                PeerResponse::DownloadStatus(self.serve_download(&bytes))
            }
        }
    }

    fn serve_download(&self, bytes: &[u8]) -> i32 {
        match self.download(bytes) {
            Ok(id) => {
                info!("Programmed image {id} for a peer");
                0
            }
            Err(e) => {
                error!("Peer download failed: {e}");
                -e.errno()
            }
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        let mut inner = match self.lock_inner() {
            Ok(inner) => inner,
            Err(e) => {
                error!("Cannot read state for a peer: {e}");
                return PeerSnapshot::default();
            }
        };
        let uuid = inner.state.active_id();
        let clock_freqs = inner.backend.frequencies().unwrap_or_else(|e| {
            error!("Cannot read clock frequencies for a peer: {e}");
            [0; MAX_CLOCKS]
        });
        let mut freq_counters = [0; COUNTED_CLOCKS];
        if !uuid.is_null() {
            for (idx, counter) in freq_counters.iter_mut().enumerate() {
                *counter = inner.backend.counter_khz(idx).unwrap_or_else(|e| {
                    error!("Cannot read frequency counter {idx} for a peer: {e}");
                    0
                });
            }
        }
        let idcode = inner.backend.idcode().unwrap_or_else(|e| {
            error!("Cannot read IDCODE for a peer: {e}");
            0
        });
        let mig_calibrated = inner.backend.mig_calibrated().unwrap_or_else(|e| {
            error!("Cannot read calibration status for a peer: {e}");
            false
        });
        PeerSnapshot {
            clock_freqs,
            freq_counters,
            idcode,
            uuid,
            mig_calibrated,
        }
    }
}
