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

//! Driver for the DHT22 cabin temperature and humidity sensor.
//!
//! The DHT22 talks a single-wire protocol of timed pulses: the host holds
//! the line low to request a reading, releases it, and the sensor answers
//! with 40 bits encoded in the width of high pulses. The line must be
//! wired open-drain with a pull-up.
//!
//! The sensor supports at most one reading every two seconds and fails a
//! fair fraction of reads even when healthy, so the driver keeps the last
//! good reading and serves it through both the minimum interval and any
//! transient failure.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use super::GpioPin;

/// The minimum interval between read attempts, a datasheet limit.
const MIN_INTERVAL: Duration = Duration::from_secs(2);

/// High pulses longer than this are ones; shorter are zeros.
/// The sensor sends roughly 27 us for a zero and 70 us for a one.
const ONE_THRESHOLD: Duration = Duration::from_micros(49);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// The last known cabin environment.
pub struct EnvReading {
    /// Cabin temperature in degrees Celsius.
    pub temperature_c: Option<f64>,
    /// Cabin relative humidity in percent.
    pub humidity_pct: Option<f64>,
    /// Whether the values come from a real (possibly cached) reading.
    pub ok: bool,
}

/// The DHT22 driver.
pub struct Dht22<P: GpioPin> {
    pin: Option<P>,
    cache: EnvReading,
    last_attempt: Option<Instant>,
}

impl<P: GpioPin> Dht22<P> {
    #[must_use]
    /// Construct a driver over the acquired data line.
    pub fn new(pin: P) -> Dht22<P> {
        Dht22 {
            pin: Some(pin),
            cache: EnvReading::default(),
            last_attempt: None,
        }
    }

    #[must_use]
    /// Construct a driver for a kit with no DHT22 fitted.
    pub fn absent() -> Dht22<P> {
        Dht22 {
            pin: None,
            cache: EnvReading::default(),
            last_attempt: None,
        }
    }

    #[must_use]
    /// Whether the sensor hardware is present.
    pub fn is_present(&self) -> bool {
        self.pin.is_some()
    }

    /// The current environment reading.
    ///
    /// At most one hardware read is attempted per two seconds; between
    /// attempts, and whenever an attempt fails, the cached reading is
    /// returned unchanged.
    pub fn read(&mut self) -> EnvReading {
        let Some(pin) = self.pin.as_mut() else {
            return self.cache;
        };

        if let Some(last) = self.last_attempt {
            if last.elapsed() < MIN_INTERVAL {
                return self.cache;
            }
        }
        self.last_attempt = Some(Instant::now());

        match sample(pin) {
            Some((temperature_c, humidity_pct)) => {
                self.cache = EnvReading {
                    temperature_c: Some(temperature_c),
                    humidity_pct: Some(humidity_pct),
                    ok: true,
                };
            }
            None => log::debug!("DHT22 read failed, serving cached value"),
        }
        self.cache
    }
}

/// Run one wire transaction: request, read 40 bits, decode.
/// Returns `None` on any timing or checksum failure.
fn sample(pin: &mut impl GpioPin) -> Option<(f64, f64)> {
    // host start signal: hold low, then release the line
    pin.write(false).ok()?;
    sleep(Duration::from_millis(2));
    pin.write(true).ok()?;

    // sensor acknowledges with 80 us low, 80 us high, then starts bit 0
    wait_for(pin, false, Duration::from_micros(200))?;
    wait_for(pin, true, Duration::from_micros(200))?;
    wait_for(pin, false, Duration::from_micros(200))?;

    let mut bytes = [0_u8; 5];
    for bit in 0..40 {
        // every bit starts with a fixed-width low preamble
        wait_for(pin, true, Duration::from_micros(200))?;
        // the width of the high pulse carries the bit value
        let high = wait_for(pin, false, Duration::from_micros(300))?;
        if high > ONE_THRESHOLD {
            bytes[bit / 8] |= 1 << (7 - bit % 8);
        }
    }

    decode(bytes)
}

/// Busy-wait until the line reaches `level`, returning the elapsed time,
/// or `None` if `timeout` passes first or the read fails.
fn wait_for(pin: &mut impl GpioPin, level: bool, timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    loop {
        if pin.read().ok()? == level {
            return Some(start.elapsed());
        }
        if start.elapsed() > timeout {
            return None;
        }
    }
}

/// Decode the five raw bytes of a transaction into
/// `(temperature_c, humidity_pct)`, validating the checksum.
fn decode(bytes: [u8; 5]) -> Option<(f64, f64)> {
    let sum = bytes[..4]
        .iter()
        .fold(0_u8, |acc, byte| acc.wrapping_add(*byte));
    if sum != bytes[4] {
        return None;
    }

    let humidity = f64::from(u16::from_be_bytes([bytes[0], bytes[1]])) / 10.0;
    let raw_temp = f64::from(u16::from_be_bytes([bytes[2] & 0x7F, bytes[3]])) / 10.0;
    let temperature = if bytes[2] & 0x80 == 0 {
        raw_temp
    } else {
        -raw_temp
    };

    Some((temperature, humidity))
}

#[cfg(test)]
mod tests {
    use crate::hardware::ListenerPin;

    use super::*;

    #[test]
    /// Test decoding of the datasheet example transaction.
    fn decode_positive() {
        // humidity 65.2 %, temperature 35.1 C
        let (temperature, humidity) = decode([0x02, 0x8C, 0x01, 0x5F, 0xEE]).unwrap();
        assert!((humidity - 65.2).abs() < 1e-9);
        assert!((temperature - 35.1).abs() < 1e-9);
    }

    #[test]
    /// Test that the sign bit produces negative temperatures.
    fn decode_negative() {
        // humidity 40.0 %, temperature -10.1 C
        let (temperature, humidity) = decode([0x01, 0x90, 0x80, 0x65, 0x76]).unwrap();
        assert!((humidity - 40.0).abs() < 1e-9);
        assert!((temperature + 10.1).abs() < 1e-9);
    }

    #[test]
    /// Test that a corrupted transaction is rejected by the checksum.
    fn decode_bad_checksum() {
        assert_eq!(decode([0x02, 0x8C, 0x01, 0x5F, 0xEF]), None);
    }

    #[test]
    /// Test that an absent sensor returns the default reading.
    fn absent_is_safe() {
        let mut sensor: Dht22<ListenerPin> = Dht22::absent();
        assert!(!sensor.is_present());
        assert_eq!(sensor.read(), EnvReading::default());
    }

    #[test]
    /// Test that a failed wire transaction leaves the (empty) cache
    /// untouched instead of producing garbage.
    fn failed_read_serves_cache() {
        // a ListenerPin echoes writes back, so the sensor ack never comes
        // and the transaction times out
        let mut sensor = Dht22::new(ListenerPin::new(true));
        let reading = sensor.read();
        assert_eq!(reading, EnvReading::default());
        assert!(!reading.ok);
    }
}
