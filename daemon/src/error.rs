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

//! The single error type of the daemon.
//!
//! Every fallible operation returns `Result<T, IcapError>`. The display strings carry the
//! variant name as a prefix (`IcapError::ImageInUse: ...`) so that callers on the other side
//! of DBus can match on them. [`IcapError::errno`] gives the Linux errno that the peer
//! protocol transports in place of the error itself.

use crate::container::axlf::SectionKind;
use crate::container::xuid::Xuid;
use log::error;
use std::path::PathBuf;
use zbus::fdo;

const EPERM: i32 = 1;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const EDOM: i32 = 33;
const EOPNOTSUPP: i32 = 95;
const ETIMEDOUT: i32 = 110;
const EKEYREJECTED: i32 = 129;

#[derive(Debug, thiserror::Error)]
pub enum IcapError {
    #[error("IcapError::MalformedContainer: {0}")]
    MalformedContainer(String),
    #[error("IcapError::SectionNotFound: container has no {0:?} section")]
    SectionNotFound(SectionKind),
    #[error("IcapError::InvalidMagic: container does not start with the xclbin2 magic")]
    InvalidMagic,
    #[error("IcapError::InvalidHeader: bitstream header is invalid: {0}")]
    InvalidHeader(String),
    #[error("IcapError::IncompatibleImage: {0}")]
    IncompatibleImage(String),
    #[error("IcapError::UnsignedImage: unsigned container refused by the security policy")]
    UnsignedImage,
    #[error("IcapError::SignatureRejected: {0}")]
    SignatureRejected(String),
    #[error("IcapError::PortBusy: configuration port reports a write FIFO vacancy of {vacancy}")]
    PortBusy { vacancy: u32 },
    #[error("IcapError::WriteTimeout: write strobe did not clear after writing {words} words")]
    WriteTimeout { words: usize },
    #[error("IcapError::ProgrammingTimeout: configuration port never reported done (status 0x{status:x})")]
    ProgrammingTimeout { status: u32 },
    #[error("IcapError::ClockBusy: clock generator {clock} is busy")]
    ClockBusy { clock: usize },
    #[error("IcapError::ClockLockTimeout: clock generator {clock} failed to lock")]
    ClockLockTimeout { clock: usize },
    #[error(
        "IcapError::FrequencyOutOfTolerance: clock {clock} runs at {measured_khz} kHz, {expected_khz} kHz requested"
    )]
    FrequencyOutOfTolerance {
        clock: usize,
        expected_khz: u32,
        measured_khz: u32,
    },
    #[error(
        "IcapError::FrequencyOutOfRange: {requested} MHz for clock {clock} is outside {min}..={max} MHz"
    )]
    FrequencyOutOfRange {
        clock: usize,
        requested: u16,
        min: u16,
        max: u16,
    },
    #[error("IcapError::ClockTopology: {0}")]
    ClockTopology(String),
    #[error("IcapError::CalibrationTimeout: memory calibration did not complete")]
    CalibrationTimeout,
    #[error("IcapError::ImageInUse: active image is locked by {refcount} user(s)")]
    ImageInUse { refcount: u32 },
    #[error("IcapError::IdentityMismatch: requested {requested}, active image is {active}")]
    IdentityMismatch { requested: Xuid, active: Xuid },
    #[error("IcapError::OutOfMemory: cannot allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },
    #[error("IcapError::NotPrivileged: {0}")]
    NotPrivileged(String),
    #[error("IcapError::Peer: peer failed with status {status}: {detail}")]
    Peer { status: i32, detail: String },
    #[error("IcapError::Argument: {0}")]
    Argument(String),
    #[error("IcapError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("IcapError::IOWrite: An IO error occurred when writing to {file:?}: {e}")]
    IOWrite { file: PathBuf, e: std::io::Error },
    #[error("IcapError::TomlDe: Failed to parse {file:?}: {e}")]
    TomlDe { file: PathBuf, e: toml::de::Error },
    #[error("IcapError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

impl IcapError {
    /// The peer could not be reached or did not answer in a usable way.
    pub fn peer_unreachable(detail: impl Into<String>) -> Self {
        IcapError::Peer {
            status: -EIO,
            detail: detail.into(),
        }
    }

    /// The peer did not answer within the allotted time.
    pub fn peer_timeout(detail: impl Into<String>) -> Self {
        IcapError::Peer {
            status: -ETIMEDOUT,
            detail: detail.into(),
        }
    }

    /// The errno reported to a peer that forwarded a download.
    pub fn errno(&self) -> i32 {
        match self {
            IcapError::MalformedContainer(_)
            | IcapError::SectionNotFound(_)
            | IcapError::InvalidMagic
            | IcapError::InvalidHeader(_)
            | IcapError::Argument(_)
            | IcapError::TomlDe { .. } => EINVAL,
            IcapError::IncompatibleImage(_) => EOPNOTSUPP,
            IcapError::UnsignedImage | IcapError::SignatureRejected(_) => EKEYREJECTED,
            IcapError::WriteTimeout { .. }
            | IcapError::ProgrammingTimeout { .. }
            | IcapError::ClockLockTimeout { .. }
            | IcapError::CalibrationTimeout => ETIMEDOUT,
            IcapError::ClockBusy { .. }
            | IcapError::ImageInUse { .. }
            | IcapError::IdentityMismatch { .. } => EBUSY,
            IcapError::FrequencyOutOfTolerance { .. }
            | IcapError::FrequencyOutOfRange { .. }
            | IcapError::ClockTopology(_) => EDOM,
            IcapError::OutOfMemory { .. } => ENOMEM,
            IcapError::NotPrivileged(_) => EPERM,
            IcapError::Peer { status, .. } => status.abs(),
            IcapError::PortBusy { .. }
            | IcapError::IORead { .. }
            | IcapError::IOWrite { .. }
            | IcapError::Internal(_) => EIO,
        }
    }
}

impl From<IcapError> for fdo::Error {
    fn from(err: IcapError) -> Self {
        error!("{err}");
        match err {
            IcapError::Argument(..) => fdo::Error::InvalidArgs(err.to_string()),
            IcapError::NotPrivileged(..) => fdo::Error::AccessDenied(err.to_string()),
            IcapError::IORead { .. } => fdo::Error::IOError(err.to_string()),
            IcapError::IOWrite { .. } => fdo::Error::IOError(err.to_string()),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    #[rstest]
    #[case::in_use(IcapError::ImageInUse { refcount: 2 }, 16)]
    #[case::lock_timeout(IcapError::ClockLockTimeout { clock: 1 }, 110)]
    #[case::unsigned(IcapError::UnsignedImage, 129)]
    #[case::magic(IcapError::InvalidMagic, 22)]
    #[case::peer(IcapError::Peer { status: -16, detail: String::new() }, 16)]
    fn errno_matches_kernel_codes(#[case] err: IcapError, #[case] expected: i32) {
        assert_that!(err.errno(), eq(expected));
    }

    #[gtest]
    fn display_is_prefixed_with_variant() {
        let err = IcapError::ImageInUse { refcount: 1 };
        assert_that!(
            err.to_string(),
            starts_with("IcapError::ImageInUse:")
        );
    }
}
