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

//! icapd manages the programmable region of PCIe FPGA accelerator cards: it validates xclbin
//! containers, programs them through the ICAP configuration port behind the AXI isolation
//! gate, sets the user clocks the image asks for, and tracks which image is active and who
//! holds it.
//!
//! - [`container`] parses and checks xclbin containers and their metadata sections
//! - [`hardware`] drives the register blocks: configuration port, AXI gate, clock generators
//! - [`lifecycle`] ties them into per-device image lifecycle, see [`lifecycle::Icap`]
//! - [`peer`] lets an unprivileged function delegate to the function owning the hardware
//! - [`comm`] exposes all of it over DBus

pub mod comm;
pub mod config;
pub mod container;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod peer;
pub mod system_io;
