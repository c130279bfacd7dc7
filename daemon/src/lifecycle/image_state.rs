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

//! Which image is on the device and how many users hold it.
//!
//! ```text
//! Idle ──download──▶ Programming ──ok──▶ Active(id, 0) ──lock──▶ Active(id, n > 0)
//!   ▲                    │                   │    ▲                    │
//!   └──────failure───────┘                   │    └───────unlock───────┘
//!   └──────────────────reset─────────────────┘
//! ```
//!
//! A new download is only accepted while nobody holds the active image.

use crate::container::xuid::Xuid;
use crate::error::IcapError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageState {
    #[default]
    Idle,
    /// A download is running; `previous` was active before it started.
    Programming { previous: Option<Xuid> },
    Active { id: Xuid, refs: u32 },
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageState::Idle => write!(f, "idle"),
            ImageState::Programming { .. } => write!(f, "programming"),
            ImageState::Active { .. } => write!(f, "active"),
        }
    }
}

impl ImageState {
    /// The active image, [`Xuid::NULL`] unless [`Active`](ImageState::Active).
    pub fn active_id(&self) -> Xuid {
        match self {
            ImageState::Active { id, .. } => *id,
            _ => Xuid::NULL,
        }
    }

    pub fn refcount(&self) -> u32 {
        match self {
            ImageState::Active { refs, .. } => *refs,
            _ => 0,
        }
    }

    /// Fail with `ImageInUse` while the active image is held.
    pub fn check_not_in_use(&self) -> Result<(), IcapError> {
        match self.refcount() {
            0 => Ok(()),
            refcount => Err(IcapError::ImageInUse { refcount }),
        }
    }

    /// Enter [`Programming`](ImageState::Programming).
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::ImageInUse)` - the active image is held
    /// * `Err(IcapError::Internal)` - a download is already running
    pub fn begin_programming(&mut self) -> Result<(), IcapError> {
        self.check_not_in_use()?;
        let previous = match *self {
            ImageState::Idle => None,
            ImageState::Active { id, .. } => Some(id),
            ImageState::Programming { .. } => {
                return Err(IcapError::Internal("a download is already running".into()));
            }
        };
        *self = ImageState::Programming { previous };
        Ok(())
    }

    /// Leave [`Programming`](ImageState::Programming) with `id` active and unheld.
    pub fn finish_programming(&mut self, id: Xuid) -> Result<(), IcapError> {
        let ImageState::Programming { .. } = self else {
            return Err(IcapError::Internal(format!(
                "cannot activate {id} while {self}"
            )));
        };
        *self = ImageState::Active { id, refs: 0 };
        Ok(())
    }

    /// Leave [`Programming`](ImageState::Programming) after a failed download. The previous
    /// image is gone from the device either way.
    pub fn abort_programming(&mut self) {
        *self = ImageState::Idle;
    }

    /// Take a reference on the active image.
    ///
    /// # Returns: `Result<u32, IcapError>`
    /// * `Ok(u32)` - the new reference count
    /// * `Err(IcapError::IdentityMismatch)` - `id` is not the active image
    pub fn lock(&mut self, id: &Xuid) -> Result<u32, IcapError> {
        if id.is_null() {
            return Err(IcapError::Argument("cannot lock the null image".into()));
        }
        let active_id = self.active_id();
        match self {
            ImageState::Active { id: active, refs } if active == id => {
                *refs = refs
                    .checked_add(1)
                    .ok_or_else(|| IcapError::Internal("reference count overflow".into()))?;
                Ok(*refs)
            }
            _ => Err(IcapError::IdentityMismatch {
                requested: *id,
                active: active_id,
            }),
        }
    }

    /// Drop a reference on the active image; `None` or the null id drops all of them.
    ///
    /// # Returns: `Result<u32, IcapError>`
    /// * `Ok(u32)` - the new reference count
    /// * `Err(IcapError::IdentityMismatch)` - `id` is not the active image
    /// * `Err(IcapError::Argument)` - the active image is not held
    pub fn unlock(&mut self, id: Option<&Xuid>) -> Result<u32, IcapError> {
        let id = id.copied().unwrap_or(Xuid::NULL);
        let active_id = self.active_id();
        match self {
            ImageState::Active { refs, .. } if id.is_null() => {
                *refs = 0;
                Ok(0)
            }
            _ if id.is_null() => Ok(0),
            ImageState::Active { id: active, refs } if *active == id => {
                if *refs == 0 {
                    return Err(IcapError::Argument(format!("image {id} is not locked")));
                }
                *refs -= 1;
                Ok(*refs)
            }
            _ => Err(IcapError::IdentityMismatch {
                requested: id,
                active: active_id,
            }),
        }
    }

    /// Forget the active image after the device reloaded from flash.
    pub fn reset(&mut self) -> Result<(), IcapError> {
        self.check_not_in_use()?;
        if let ImageState::Programming { .. } = self {
            return Err(IcapError::Internal("cannot reset during a download".into()));
        }
        *self = ImageState::Idle;
        Ok(())
    }
}
