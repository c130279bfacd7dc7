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

//! Register-level drivers for the blocks involved in reprogramming.
//!
//! # Architecture
//!
//! Every block sees the device through a [`RegisterWindow`](io::RegisterWindow): a base offset
//! into a shared [`RegisterIo`](io::RegisterIo). On real hardware the `RegisterIo` is the PCI
//! resource file of the management BAR; in tests and in simulation mode it is a
//! [`SimulatedDevice`](simulated::SimulatedDevice).
//!
//! - [`config_port`] - the ICAP write FIFO that takes configuration words
//! - [`axi_gate`] - isolation of the user region while it is reprogrammed
//! - [`clock_wizard`] - dynamic reconfiguration of the user clocks and their counters
//! - [`poll`] - the bounded wait used by all of the above
//! - [`regs`] - register offsets and command values

pub mod axi_gate;
pub mod clock_wizard;
pub mod config_port;
pub mod io;
pub mod poll;
pub mod regs;
pub mod simulated;
