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

use icapd::container::builder::AxlfBuilder;
use icapd::container::sections::{ClockFreq, ClockFreqTopology, ClockType, ControllerDescriptor};
use icapd::container::xuid::Xuid;
use icapd::error::IcapError;
use icapd::hardware::axi_gate::GateGeneration;
use icapd::hardware::simulated::{NoopSleeper, SimulatedDevice};
use icapd::lifecycle::hardware_owner::HardwareOwner;
use icapd::lifecycle::notify::{ChannelNotifier, ExecEvent};
use icapd::lifecycle::section_cache::ControllerFactory;
use icapd::lifecycle::{Icap, IcapBuilder};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

pub const A: Xuid = Xuid::from_bytes([0xa; 16]);
pub const B: Xuid = Xuid::from_bytes([0xb; 16]);

/// Data and kernel clock frequencies of [`image`].
pub const DATA_MHZ: u16 = 300;
pub const KERNEL_MHZ: u16 = 500;

pub fn clock(freq_mhz: u16, clock_type: ClockType, name: &str) -> ClockFreq {
    ClockFreq {
        freq_mhz,
        clock_type,
        name: name.to_string(),
    }
}

pub fn topology(clocks: Vec<ClockFreq>) -> ClockFreqTopology {
    ClockFreqTopology { clocks }
}

pub fn data_and_kernel(data: u16, kernel: u16) -> ClockFreqTopology {
    topology(vec![
        clock(data, ClockType::Data, "data_clk"),
        clock(kernel, ClockType::Kernel, "kernel_clk"),
    ])
}

/// A container for `id` with a bitstream of `payload` and the default data and kernel clocks.
pub fn image_builder(id: Xuid, payload: &[u8]) -> AxlfBuilder {
    AxlfBuilder::new(id)
        .bitstream(payload)
        .clock_topology(&data_and_kernel(DATA_MHZ, KERNEL_MHZ))
}

pub fn image(id: Xuid) -> Vec<u8> {
    image_builder(id, &id.as_bytes()[..8]).build()
}

/// Words the configuration port takes for `payload`.
pub fn words(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Records the controllers it is asked to create.
#[derive(Default)]
pub struct RecordingFactory {
    created: Mutex<Vec<ControllerDescriptor>>,
    fail: Mutex<bool>,
}

impl RecordingFactory {
    pub fn created(&self) -> Vec<ControllerDescriptor> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut f) = self.fail.lock() {
            *f = fail;
        }
    }
}

impl ControllerFactory for RecordingFactory {
    fn destroy_all(&self) {
        if let Ok(mut created) = self.created.lock() {
            created.clear();
        }
    }

    fn create(&self, controller: &ControllerDescriptor) -> Result<(), IcapError> {
        if self.fail.lock().map(|f| *f).unwrap_or_default() {
            return Err(IcapError::Internal(format!(
                "cannot create {:?} controller",
                controller.kind
            )));
        }
        if let Ok(mut created) = self.created.lock() {
            created.push(controller.clone());
        }
        Ok(())
    }
}

/// An owning function on a simulated device.
pub struct OwnerRig {
    pub device: Arc<SimulatedDevice>,
    pub icap: Arc<Icap>,
    pub events: UnboundedReceiver<ExecEvent>,
    pub factory: Arc<RecordingFactory>,
}

impl OwnerRig {
    pub fn new() -> OwnerRig {
        OwnerRig::configured(|owner| owner)
    }

    /// An owner adjusted by `configure` before it is put behind the lifecycle.
    pub fn configured(configure: impl FnOnce(HardwareOwner) -> HardwareOwner) -> OwnerRig {
        let device = Arc::new(SimulatedDevice::default());
        let owner = HardwareOwner::new(
            device.clone(),
            &device.layout(),
            GateGeneration::Legacy,
            Arc::new(NoopSleeper),
        )
        .expect("simulated owner should attach");
        // forget the IDCODE probe
        device.clear_programmed_words();
        let (notifier, events) = ChannelNotifier::channel();
        let factory = Arc::new(RecordingFactory::default());
        let icap = IcapBuilder::new(configure(owner))
            .notifier(Arc::new(notifier))
            .controller_factory(factory.clone())
            .build();
        OwnerRig {
            device,
            icap: Arc::new(icap),
            events,
            factory,
        }
    }

    /// Events sent so far.
    pub fn drain_events(&mut self) -> Vec<ExecEvent> {
        drain(&mut self.events)
    }
}

pub fn drain(events: &mut UnboundedReceiver<ExecEvent>) -> Vec<ExecEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
