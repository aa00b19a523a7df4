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

//! Definitions for hardware devices.
//!
//! The goal of this module is to abstract away some of the details of
//! exactly how our hardware works so that we can focus on the business
//! logic elsewhere. Every driver here follows the same rule: absence of
//! the physical part is a state, not an error. A driver constructed
//! without its hardware keeps answering `read()` with safe defaults and an
//! `ok = false` flag, and the rest of the firmware never has to care.

pub mod buttons;
pub mod buzzer;
pub mod dht22;
pub mod gas;
pub mod gps;
pub mod led;
pub mod nfc;

use std::sync::{Arc, Mutex};

use gpio_cdev::LineHandle;

/// A trait for GPIO pins.
pub trait GpioPin {
    /// Perform a GPIO read on this pin.
    /// Returns `true` if the pin is pulled high, and `false` otherwise.
    ///
    /// # Errors
    ///
    /// This can return an error if the read failed.
    fn read(&mut self) -> Result<bool, gpio_cdev::Error>;

    /// Perform a GPIO write on this pin, setting the pin's logic level to
    /// `value`.
    ///
    /// # Errors
    ///
    /// This can return an error if the write failed.
    fn write(&mut self, value: bool) -> Result<(), gpio_cdev::Error>;
}

impl GpioPin for LineHandle {
    fn read(&mut self) -> Result<bool, gpio_cdev::Error> {
        Ok(1 == self.get_value()?)
    }

    fn write(&mut self, value: bool) -> Result<(), gpio_cdev::Error> {
        let int_value = u8::from(value);
        self.set_value(int_value)?;

        Ok(())
    }
}

#[derive(Clone)]
/// A structure for testing GPIO traffic.
///
/// A `ListenerPin` stores the history of all writes to it.
/// When read from, a `ListenerPin` will return the last written value of
/// the pin. Clones share one history, so a test can hand a clone to a
/// driver thread and still observe (or script) the pin from outside.
pub struct ListenerPin(Arc<Mutex<Vec<bool>>>);

impl ListenerPin {
    #[must_use]
    /// Construct a new `ListenerPin` with only one reading in its history.
    pub fn new(last_value: bool) -> ListenerPin {
        ListenerPin(Arc::new(Mutex::new(vec![last_value])))
    }

    #[must_use]
    /// A copy of the history of writes to this pin.
    ///
    /// # Panics
    ///
    /// This function will panic if another holder of the history panicked
    /// while writing to it.
    pub fn history(&self) -> Vec<bool> {
        self.0.lock().unwrap().clone()
    }
}

impl GpioPin for ListenerPin {
    fn read(&mut self) -> Result<bool, gpio_cdev::Error> {
        Ok(*self.0.lock().unwrap().last().unwrap())
    }

    fn write(&mut self, value: bool) -> Result<(), gpio_cdev::Error> {
        self.0.lock().unwrap().push(value);

        Ok(())
    }
}
