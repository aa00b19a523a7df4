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

//! Driver for the cabin gas sensor.
//!
//! The sensor is an MQ-series element with an on-board comparator; the
//! kit only sees its digital output. The line is asserted low when the
//! measured concentration crosses the potentiometer threshold. The same
//! line doubles as the alcohol sensor during the blow phase of a test.

use super::GpioPin;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// One reading of the gas line.
pub struct GasReading {
    /// Whether gas is currently detected (line pulled low).
    pub gas_detected: bool,
    /// The raw logic level of the line (high = clean air).
    pub ttl_state: bool,
    /// Whether the line could actually be read.
    pub ok: bool,
}

/// The gas sensor driver.
pub struct GasSensor<P: GpioPin> {
    pin: Option<P>,
}

impl<P: GpioPin> GasSensor<P> {
    #[must_use]
    /// Construct a driver over an acquired input line.
    pub fn new(pin: P) -> GasSensor<P> {
        GasSensor { pin: Some(pin) }
    }

    #[must_use]
    /// Construct a driver for a kit with no gas sensor fitted.
    pub fn absent() -> GasSensor<P> {
        GasSensor { pin: None }
    }

    #[must_use]
    /// Whether the sensor hardware is present.
    pub fn is_present(&self) -> bool {
        self.pin.is_some()
    }

    #[must_use]
    /// Read the line. With the sensor absent or unreadable this returns
    /// the default reading, which reports clean air and `ok = false`.
    pub fn read(&mut self) -> GasReading {
        let Some(pin) = self.pin.as_mut() else {
            return GasReading::default();
        };

        match pin.read() {
            Ok(level) => GasReading {
                gas_detected: !level,
                ttl_state: level,
                ok: true,
            },
            Err(e) => {
                log::warn!("gas line read failed: {e}");
                GasReading::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::hardware::ListenerPin;

    use super::*;

    #[test]
    /// Test that a low line means gas and a high line means clean air.
    fn asserted_low() {
        let pin = ListenerPin::new(true);
        let mut sensor = GasSensor::new(pin.clone());

        let reading = sensor.read();
        assert!(!reading.gas_detected);
        assert!(reading.ttl_state);
        assert!(reading.ok);

        pin.clone().write(false).unwrap();
        let reading = sensor.read();
        assert!(reading.gas_detected);
        assert!(!reading.ttl_state);
        assert!(reading.ok);
    }

    #[test]
    /// Test that an absent sensor reads as clean air with `ok` unset.
    fn absent_is_safe() {
        let mut sensor: GasSensor<ListenerPin> = GasSensor::absent();
        assert!(!sensor.is_present());

        let reading = sensor.read();
        assert_eq!(reading, GasReading::default());
        assert!(!reading.gas_detected);
        assert!(!reading.ok);
    }
}
