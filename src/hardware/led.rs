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

//! Driver for the status LED.
//!
//! A common-cathode RGB LED on three GPIO lines. The lines are plain
//! digital outputs, so the palette is the eight on/off combinations; the
//! named colors below pick the nearest combination for each status the
//! firmware wants to show. `blink` runs a background toggler thread which
//! any later `set_named` or `off` cancels.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::stop::StopToken;

use super::GpioPin;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The named colors of the status LED.
pub enum Color {
    /// All channels off.
    Off,
    /// Nominal: green (nearest digital neighbor of the green-yellow
    /// branding color).
    Ok,
    /// Critical: red.
    Red,
    /// Level-1 fatigue and other soft trouble: yellow, standing in for
    /// orange.
    Warning,
    /// Informational: blue.
    Info,
    /// The sync worker lost the API: blue.
    Offline,
    /// White, used by the boot splash.
    White,
}

impl Color {
    /// The (red, green, blue) channel levels of this color.
    fn channels(self) -> [bool; 3] {
        match self {
            Color::Off => [false, false, false],
            Color::Ok => [false, true, false],
            Color::Red => [true, false, false],
            Color::Warning => [true, true, false],
            Color::Info | Color::Offline => [false, false, true],
            Color::White => [true, true, true],
        }
    }
}

/// The status LED driver.
pub struct RgbLed<P: GpioPin + Send + 'static> {
    channels: Option<Arc<Mutex<[P; 3]>>>,
    /// The blinker thread currently running, if any, with its stop token.
    blinker: Mutex<Option<(StopToken, std::thread::JoinHandle<()>)>>,
}

impl<P: GpioPin + Send + 'static> RgbLed<P> {
    #[must_use]
    /// Construct a driver over three acquired output lines, in red,
    /// green, blue order.
    pub fn new(channels: [P; 3]) -> RgbLed<P> {
        RgbLed {
            channels: Some(Arc::new(Mutex::new(channels))),
            blinker: Mutex::new(None),
        }
    }

    #[must_use]
    /// Construct a driver for a kit with no status LED fitted.
    pub fn absent() -> RgbLed<P> {
        RgbLed {
            channels: None,
            blinker: Mutex::new(None),
        }
    }

    #[must_use]
    /// Whether the LED hardware is present.
    pub fn is_present(&self) -> bool {
        self.channels.is_some()
    }

    /// Show a steady color, cancelling any blink in progress.
    pub fn set_named(&self, color: Color) {
        self.cancel_blink();
        if let Some(channels) = &self.channels {
            write_color(channels, color);
        }
    }

    /// Turn the LED off, cancelling any blink in progress.
    pub fn off(&self) {
        self.set_named(Color::Off);
    }

    /// Blink a color continuously in the background until the next
    /// `set_named` or `off`. Re-blinking restarts the cycle.
    pub fn blink(&self, color: Color, on: Duration, off: Duration) {
        self.cancel_blink();
        let Some(channels) = self.channels.clone() else {
            return;
        };

        let token = StopToken::new();
        let thread_token = token.clone();
        let handle = std::thread::spawn(move || loop {
            write_color(&channels, color);
            if thread_token.wait_timeout(on) {
                break;
            }
            write_color(&channels, Color::Off);
            if thread_token.wait_timeout(off) {
                break;
            }
        });

        *self
            .blinker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some((token, handle));
    }

    /// Stop the blinker thread, if one is running, and wait for it so its
    /// last write cannot land on top of whatever the caller shows next.
    fn cancel_blink(&self) {
        let blinker = self
            .blinker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = blinker {
            token.stop();
            let _ = handle.join();
        }
    }
}

/// Write a color to the three channels. Write failures are ignored: a
/// broken status LED must never take the firmware down.
fn write_color<P: GpioPin>(channels: &Mutex<[P; 3]>, color: Color) {
    let mut pins = channels
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    for (pin, level) in pins.iter_mut().zip(color.channels()) {
        let _ = pin.write(level);
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use crate::hardware::ListenerPin;

    use super::*;

    fn scripted_led() -> ([ListenerPin; 3], RgbLed<ListenerPin>) {
        let pins = [
            ListenerPin::new(false),
            ListenerPin::new(false),
            ListenerPin::new(false),
        ];
        let led = RgbLed::new(pins.clone());
        (pins, led)
    }

    #[test]
    /// Test that a steady color lands on the right channels.
    fn steady_color() {
        let (pins, led) = scripted_led();
        led.set_named(Color::Warning);

        assert_eq!(pins[0].history().last(), Some(&true));
        assert_eq!(pins[1].history().last(), Some(&true));
        assert_eq!(pins[2].history().last(), Some(&false));
    }

    #[test]
    /// Test that a blink toggles the channel and that `set_named` cancels
    /// the toggler.
    fn blink_and_cancel() {
        let (pins, led) = scripted_led();
        led.blink(Color::Red, Duration::from_millis(10), Duration::from_millis(10));
        sleep(Duration::from_millis(100));

        let red_history = pins[0].history();
        let toggles = red_history.windows(2).filter(|w| w[0] != w[1]).count();
        assert!(toggles >= 4, "expected several toggles, saw {toggles}");

        led.set_named(Color::Ok);
        let settled = pins[0].history().len();
        sleep(Duration::from_millis(50));
        // no more writes after the blinker was cancelled and ok was set
        assert_eq!(pins[0].history().len(), settled);
        assert_eq!(pins[0].history().last(), Some(&false));
        assert_eq!(pins[1].history().last(), Some(&true));
    }

    #[test]
    /// Test that an absent LED accepts every call silently.
    fn absent_is_dark() {
        let led: RgbLed<ListenerPin> = RgbLed::absent();
        assert!(!led.is_present());
        led.set_named(Color::Red);
        led.blink(Color::Red, Duration::from_millis(1), Duration::from_millis(1));
        led.off();
    }
}
