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

//! Driver for the four-button pad.
//!
//! Each button sits between its GPIO and ground with the internal pull-up
//! enabled, so an idle line reads high and a press reads low. The driver
//! is polled from the main loop: each `poll` call scans all four lines for
//! a high-to-low edge, applies a 200 ms software debounce per button, and
//! queues events into a bounded ring that drops the oldest entry on
//! overflow.

use std::{collections::VecDeque, time::Instant};

use super::GpioPin;

/// How long after a press a button ignores further edges.
const DEBOUNCE_MS: u128 = 200;

/// Capacity of the pending-event ring.
const QUEUE_CAP: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The four buttons of the pad.
pub enum ButtonEvent {
    /// Start / confirm.
    Start,
    /// Stop (request trip end).
    Stop,
    /// Open the menu or cycle its pages.
    Menu,
    /// Back / cancel.
    Back,
}

impl ButtonEvent {
    /// The buttons in pin order (start, stop, menu, back).
    const ORDER: [ButtonEvent; 4] = [
        ButtonEvent::Start,
        ButtonEvent::Stop,
        ButtonEvent::Menu,
        ButtonEvent::Back,
    ];
}

/// The button pad driver.
pub struct ButtonPad<P: GpioPin> {
    /// The four input lines, in [`ButtonEvent::ORDER`] order.
    pins: Option<[P; 4]>,
    /// The last observed level of each line (true = high = released).
    last_level: [bool; 4],
    /// When each button last produced an event.
    last_press: [Option<Instant>; 4],
    /// Events waiting to be consumed.
    events: VecDeque<ButtonEvent>,
}

impl<P: GpioPin> ButtonPad<P> {
    #[must_use]
    /// Construct a pad over four acquired input lines, given in the order
    /// start, stop, menu, back.
    pub fn new(pins: [P; 4]) -> ButtonPad<P> {
        ButtonPad {
            pins: Some(pins),
            last_level: [true; 4],
            last_press: [None; 4],
            events: VecDeque::with_capacity(QUEUE_CAP),
        }
    }

    #[must_use]
    /// Construct a pad for a kit with no buttons wired up.
    pub fn absent() -> ButtonPad<P> {
        ButtonPad {
            pins: None,
            last_level: [true; 4],
            last_press: [None; 4],
            events: VecDeque::new(),
        }
    }

    #[must_use]
    /// Whether the pad hardware is present.
    pub fn is_present(&self) -> bool {
        self.pins.is_some()
    }

    /// Scan the lines for new presses, then pop the oldest pending event.
    ///
    /// Unreadable lines are skipped; a flaky pad degrades to a dead pad
    /// rather than a stream of phantom presses.
    pub fn poll(&mut self) -> Option<ButtonEvent> {
        self.scan();
        self.events.pop_front()
    }

    /// Scan all four lines once, queueing an event for every debounced
    /// high-to-low edge.
    fn scan(&mut self) {
        let now = Instant::now();
        let Some(pins) = self.pins.as_mut() else {
            return;
        };

        for (idx, pin) in pins.iter_mut().enumerate() {
            let level = match pin.read() {
                Ok(level) => level,
                Err(_) => continue,
            };

            let pressed_edge = self.last_level[idx] && !level;
            self.last_level[idx] = level;
            if !pressed_edge {
                continue;
            }

            // software debounce: a second edge within the window is the
            // same mechanical press bouncing
            if let Some(last) = self.last_press[idx] {
                if now.duration_since(last).as_millis() < DEBOUNCE_MS {
                    continue;
                }
            }
            self.last_press[idx] = Some(now);

            if self.events.len() == QUEUE_CAP {
                self.events.pop_front();
            }
            self.events.push_back(ButtonEvent::ORDER[idx]);
        }
    }
}
