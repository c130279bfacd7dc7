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

//! Register offsets, relative to the base of each block, and command values.

/// AXI HWICAP.
pub mod icap {
    pub const GIER: u64 = 0x1c;
    pub const ISR: u64 = 0x20;
    pub const IER: u64 = 0x28;
    /// Write FIFO.
    pub const WF: u64 = 0x100;
    /// Read FIFO.
    pub const RF: u64 = 0x104;
    /// Read size in words.
    pub const SZ: u64 = 0x108;
    pub const CR: u64 = 0x10c;
    pub const SR: u64 = 0x110;
    /// Write FIFO vacancy.
    pub const WFV: u64 = 0x114;
    /// Read FIFO occupancy.
    pub const RFO: u64 = 0x118;
    pub const ASR: u64 = 0x11c;

    pub const CR_WRITE: u32 = 0x1;
    pub const CR_READ: u32 = 0x2;
    pub const CR_FIFO_CLEAR: u32 = 0x4;
    pub const CR_SW_RESET: u32 = 0x8;
    /// Reset pulse used by legacy gates when the fabric is frozen.
    pub const CR_LEGACY_RESET: u32 = CR_FIFO_CLEAR | CR_SW_RESET;
    /// Done or end-of-startup.
    pub const SR_DONE_MASK: u32 = 0x5;

    /// Dummy, sync, type-1 NOP, write CMD, IPROG, NOP, NOP: reload the image from flash.
    pub const BOOT_SEQUENCE: [u32; 7] = [
        0xffff_ffff,
        0xaa99_5566,
        0x2000_0000,
        0x3000_8001,
        0x0000_000f,
        0x2000_0000,
        0x2000_0000,
    ];

    /// Dummy, sync, NOP, NOP, read IDCODE, NOP, NOP.
    pub const IDCODE_SEQUENCE: [u32; 7] = [
        0xffff_ffff,
        0xaa99_5566,
        0x2000_0000,
        0x2000_0000,
        0x2801_8001,
        0x2000_0000,
        0x2000_0000,
    ];
}

/// AXI gate isolating the user region.
pub mod gate {
    pub const WR: u64 = 0x0;
    pub const RD: u64 = 0x8;

    pub const FREEZE: u32 = 0xc;
    pub const FREE_SEQUENCE: [u32; 4] = [0xe, 0xc, 0xe, 0xf];
}

/// Clocking wizard dynamic reconfiguration port.
pub mod clock {
    pub const STATUS: u64 = 0x4;
    pub const STATUS_LOCKED: u32 = 0x1;

    pub const fn config(n: u64) -> u64 {
        0x200 + 4 * n
    }

    /// Load the new settings into the generator.
    pub const LOAD_SEN: u32 = 0x7;
    /// Start the reconfiguration.
    pub const SADDR: u32 = 0x2;
    /// Reload the previous settings after a failed lock.
    pub const RESTORE: u32 = 0x4;
    pub const IDLE: u32 = 0x0;
    pub const CONTROL: u64 = config(23);

    pub const MUL_FRAC_EN: u32 = 1 << 26;
    pub const DIV_FRAC_EN: u32 = 1 << 18;
}

/// Clock frequency counters.
pub mod counter {
    pub const CONTROL: u64 = 0x0;
    pub const RESET: u32 = 0x1;
    pub const READY: u32 = 0x2;

    pub const fn value(n: u64) -> u64 {
        0x8 + 4 * n
    }
}

/// Memory controller calibration status.
pub mod calibration {
    pub const STATUS: u64 = 0x0;
    pub const DONE: u32 = 0x1;
}
