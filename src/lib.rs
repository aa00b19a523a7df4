/*
  roadkit, a driver-safety kit firmware.
  Copyright (C) 2026 the roadkit authors.

  roadkit is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  roadkit is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! roadkit is the on-board firmware of a vehicle driver-safety kit.
//!
//! The kit authenticates a driver with an NFC badge, gates the start of a
//! trip on an alcohol test, and then records the trip by fusing GPS, cabin
//! environment, cellular status and a camera fatigue pipeline into events
//! which are buffered in a durable local outbox and drained to a cloud API
//! by a background sync worker.

#![warn(clippy::pedantic)]

use std::fmt::Display;

pub mod config;
pub mod control;
pub mod display;
pub mod events;
pub mod fatigue;
pub mod hardware;
pub mod outbox;
pub mod run;
pub mod state;
pub mod stop;
pub mod sync;

/// The version of this firmware, reported in the boot `health` event.
pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
/// The set of errors which can cause the firmware to stop running.
pub enum KitError {
    /// The executable was invoked with bad command line arguments.
    /// The string describes which argument was missing or wrong.
    Args(&'static str),
    /// The configuration file could not be parsed or failed validation.
    Config(config::Error),
    /// An I/O operation failed.
    Io(std::io::Error),
    /// A GPIO operation failed during setup.
    Gpio(gpio_cdev::Error),
    /// The outbox store failed in a way we cannot recover from.
    Store(outbox::Error),
    /// The HTTP client could not be constructed.
    Http(reqwest::Error),
    /// A lock was poisoned, implying that a thread holding it panicked.
    Poison,
}

impl Display for KitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KitError::Args(s) => write!(f, "bad arguments: {s}"),
            KitError::Config(e) => write!(f, "configuration error: {e}"),
            KitError::Io(e) => write!(f, "I/O error: {e}"),
            KitError::Gpio(e) => write!(f, "GPIO error: {e}"),
            KitError::Store(e) => write!(f, "outbox store error: {e}"),
            KitError::Http(e) => write!(f, "HTTP client error: {e}"),
            KitError::Poison => write!(f, "a lock was poisoned"),
        }
    }
}

impl From<config::Error> for KitError {
    fn from(err: config::Error) -> Self {
        KitError::Config(err)
    }
}

impl From<std::io::Error> for KitError {
    fn from(err: std::io::Error) -> Self {
        KitError::Io(err)
    }
}

impl From<gpio_cdev::Error> for KitError {
    fn from(err: gpio_cdev::Error) -> Self {
        KitError::Gpio(err)
    }
}

impl From<outbox::Error> for KitError {
    fn from(err: outbox::Error) -> Self {
        KitError::Store(err)
    }
}

impl From<reqwest::Error> for KitError {
    fn from(err: reqwest::Error) -> Self {
        KitError::Http(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for KitError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        KitError::Poison
    }
}
