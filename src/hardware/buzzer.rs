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

//! Driver for the passive buzzer.
//!
//! The buzzer hangs off a plain GPIO, so tones are produced by toggling
//! the line as a software square wave at the requested frequency and duty
//! cycle. `play` is non-blocking: each call spawns a short-lived pattern
//! thread, and a shared mutex serializes patterns so two alerts never
//! interleave their toggling on the same pin.

use std::{
    sync::{Arc, Mutex},
    thread::sleep,
    time::{Duration, Instant},
};

use super::GpioPin;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The named beep patterns of the kit.
pub enum Pattern {
    /// One short blip, played on ordinary state changes.
    Info,
    /// Two medium tones, played for non-fatal trouble.
    Warning,
    /// Three sharp high tones, played for critical alerts.
    Critical,
    /// A rising pair, played on success.
    Success,
    /// A falling pair, played on failure.
    Error,
}

/// One element of a pattern: either a tone at `(frequency, duty percent)`
/// or a silence, held for the given number of milliseconds.
type Step = (Option<(u32, u8)>, u64);

impl Pattern {
    /// The steps of this pattern. Tones with no explicit frequency play at
    /// the configured base frequency of the buzzer.
    fn steps(self, base_freq: u32) -> Vec<Step> {
        match self {
            Pattern::Info => vec![(Some((base_freq, 40)), 100)],
            Pattern::Warning => vec![
                (Some((base_freq, 50)), 150),
                (None, 100),
                (Some((base_freq, 50)), 150),
            ],
            Pattern::Critical => vec![
                (Some((2500, 70)), 100),
                (None, 80),
                (Some((2500, 70)), 100),
                (None, 80),
                (Some((2500, 70)), 100),
                (None, 80),
            ],
            Pattern::Success => vec![
                (Some((1500, 40)), 100),
                (None, 50),
                (Some((2500, 40)), 150),
            ],
            Pattern::Error => vec![
                (Some((2500, 50)), 150),
                (None, 50),
                (Some((1200, 50)), 200),
            ],
        }
    }
}

#[derive(Clone)]
/// The buzzer driver. Cheap to clone; all clones share the pin and the
/// pattern gate.
pub struct Buzzer<P: GpioPin + Send + 'static> {
    pin: Option<Arc<Mutex<P>>>,
    base_freq: u32,
    /// Held for the duration of one pattern so patterns play back to back
    /// instead of on top of each other.
    gate: Arc<Mutex<()>>,
}

impl<P: GpioPin + Send + 'static> Buzzer<P> {
    #[must_use]
    /// Construct a driver over an acquired output line.
    pub fn new(pin: P, base_freq: u32) -> Buzzer<P> {
        Buzzer {
            pin: Some(Arc::new(Mutex::new(pin))),
            base_freq,
            gate: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    /// Construct a driver for a kit with no buzzer fitted.
    pub fn absent() -> Buzzer<P> {
        Buzzer {
            pin: None,
            base_freq: 0,
            gate: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    /// Whether the buzzer hardware is present.
    pub fn is_present(&self) -> bool {
        self.pin.is_some()
    }

    /// Play a pattern without blocking the caller.
    /// With the buzzer absent this is a silent no-op.
    pub fn play(&self, pattern: Pattern) {
        let Some(pin) = self.pin.clone() else {
            return;
        };
        let gate = Arc::clone(&self.gate);
        let base_freq = self.base_freq;

        std::thread::spawn(move || {
            let _hold = gate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut pin = pin.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (tone, ms) in pattern.steps(base_freq) {
                let result = match tone {
                    Some((freq, duty)) => {
                        square_wave(&mut *pin, freq, duty, Duration::from_millis(ms))
                    }
                    None => {
                        sleep(Duration::from_millis(ms));
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    log::warn!("buzzer write failed mid-pattern: {e}");
                    let _ = pin.write(false);
                    return;
                }
            }
        });
    }
}

/// Toggle `pin` as a square wave of the given frequency and duty cycle
/// for `duration`, leaving the line low afterwards.
fn square_wave(
    pin: &mut impl GpioPin,
    freq: u32,
    duty_pct: u8,
    duration: Duration,
) -> Result<(), gpio_cdev::Error> {
    let period = Duration::from_secs(1) / freq;
    let high = period * u32::from(duty_pct) / 100;
    let low = period - high;

    let start = Instant::now();
    while start.elapsed() < duration {
        pin.write(true)?;
        sleep(high);
        pin.write(false)?;
        sleep(low);
    }
    pin.write(false)?;
    Ok(())
}
