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

//! Yawn counting.
//!
//! The face detector reports the mean pixel intensity of the mouth
//! region. An open mouth is a dark hole, so a sustained drop below the
//! calibrated closed-mouth intensity is a yawn.

use std::time::Instant;

use super::FatigueConfig;

/// The yawn detector.
pub struct YawnDetector {
    config: FatigueConfig,
    baseline_samples: Vec<f64>,
    /// Calibrated closed-mouth intensity.
    baseline: Option<f64>,
    /// When the current open-mouth stretch began.
    open_since: Option<Instant>,
    /// Whether the current stretch was already counted.
    counted: bool,
    last_yawn_at: Option<Instant>,
    count: u32,
}

impl YawnDetector {
    #[must_use]
    pub fn new(config: FatigueConfig) -> YawnDetector {
        YawnDetector {
            config,
            baseline_samples: Vec::new(),
            baseline: None,
            open_since: None,
            counted: false,
            last_yawn_at: None,
            count: 0,
        }
    }

    /// Feed one calibration frame's mouth intensity.
    pub fn add_baseline_sample(&mut self, intensity: f64) {
        self.baseline_samples.push(intensity);
    }

    /// Fix the closed-mouth baseline from the collected samples.
    /// Returns whether any samples were available.
    pub fn finalize_baseline(&mut self) -> bool {
        if self.baseline_samples.is_empty() {
            return false;
        }
        let sum: f64 = self.baseline_samples.iter().sum();
        self.baseline = Some(sum / self.baseline_samples.len() as f64);
        true
    }

    /// Feed one detection frame's mouth intensity.
    pub fn update(&mut self, intensity: f64, now: Instant) {
        let Some(baseline) = self.baseline else {
            return;
        };

        let open = intensity < baseline * (1.0 - self.config.mouth_drop_ratio);
        if open {
            let since = *self.open_since.get_or_insert(now);
            let cooled = self.last_yawn_at.map_or(true, |last| {
                now.duration_since(last).as_secs_f64() >= self.config.yawn_cooldown_s
            });
            if !self.counted
                && cooled
                && now.duration_since(since).as_secs_f64() >= self.config.yawn_duration_s
            {
                self.count += 1;
                self.counted = true;
                self.last_yawn_at = Some(now);
            }
        } else {
            self.open_since = None;
            self.counted = false;
        }
    }

    /// Total yawns counted so far.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }
}
