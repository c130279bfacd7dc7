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

use crate::container::xuid::Xuid;
use log::{info, warn};
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// What the execution subsystem is told about the active image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEvent {
    /// First user of the image; the scheduler resets for it.
    Activated(Xuid),
    /// Last user is gone.
    Stopped,
    /// The region was reprogrammed through the peer.
    Reconfigured,
}

impl ExecEvent {
    /// The uuid carried by the event, empty when there is none.
    pub fn uuid(&self) -> String {
        match self {
            ExecEvent::Activated(id) => id.to_string(),
            _ => String::new(),
        }
    }
}

impl fmt::Display for ExecEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecEvent::Activated(_) => write!(f, "activated"),
            ExecEvent::Stopped => write!(f, "stopped"),
            ExecEvent::Reconfigured => write!(f, "reconfigured"),
        }
    }
}

/// The execution subsystem, as far as the image lifecycle is concerned.
pub trait ExecNotifier: Send + Sync {
    fn activate(&self, id: &Xuid);
    fn stop(&self);
    fn reconfigure(&self);
}

/// Only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ExecNotifier for LogNotifier {
    fn activate(&self, id: &Xuid) {
        info!("Image {id} activated");
    }

    fn stop(&self) {
        info!("Image released by its last user");
    }

    fn reconfigure(&self) {
        info!("Region reconfigured");
    }
}

/// Queues events for an async consumer, e.g. the DBus signal emitter.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: UnboundedSender<ExecEvent>,
}

impl ChannelNotifier {
    pub fn channel() -> (ChannelNotifier, UnboundedReceiver<ExecEvent>) {
        let (tx, rx) = unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }

    fn send(&self, event: ExecEvent) {
        if self.tx.send(event).is_err() {
            warn!("Dropping {event} event: nobody is listening");
        }
    }
}

impl ExecNotifier for ChannelNotifier {
    fn activate(&self, id: &Xuid) {
        self.send(ExecEvent::Activated(*id));
    }

    fn stop(&self) {
        self.send(ExecEvent::Stopped);
    }

    fn reconfigure(&self) {
        self.send(ExecEvent::Reconfigured);
    }
}
