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

//! Head-nod and microsleep tracking.
//!
//! A drowsy driver's head drops and snaps back up. The tracker follows
//! the vertical center of the face box (smoothed, normalized by frame
//! height) against a baseline captured during calibration. A short
//! excursion below the baseline is a nod, counted over a sliding window;
//! an excursion that never recovers is a microsleep.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use super::{FaceBox, FatigueConfig};

/// The nod tracker.
pub struct NodTracker {
    config: FatigueConfig,
    /// Calibration samples of the normalized face-center height.
    baseline_samples: Vec<f64>,
    /// The calibrated resting position, set by `finalize_baseline`.
    baseline_y: Option<f64>,
    /// Smoothed normalized face-center height.
    ema_y: Option<f64>,
    /// Normalized face height of the last frame, the unit in which the
    /// drop threshold is expressed.
    face_height: f64,
    /// When the current head-down excursion started.
    down_since: Option<Instant>,
    /// When the last counted nod ended.
    last_nod_at: Option<Instant>,
    /// End times of counted nods, pruned to the sliding window.
    nods: VecDeque<Instant>,
    microsleep: bool,
}

impl NodTracker {
    #[must_use]
    pub fn new(config: FatigueConfig) -> NodTracker {
        NodTracker {
            config,
            baseline_samples: Vec::new(),
            baseline_y: None,
            ema_y: None,
            face_height: 0.0,
            down_since: None,
            last_nod_at: None,
            nods: VecDeque::new(),
            microsleep: false,
        }
    }

    /// Feed one calibration frame.
    pub fn add_calibration_sample(&mut self, face: &FaceBox, frame_height: u32) {
        let center = normalized_center(face, frame_height);
        self.baseline_samples.push(center);
        self.smooth(center);
    }

    /// How many calibration samples have been collected.
    #[must_use]
    pub fn calibration_samples(&self) -> u32 {
        self.baseline_samples.len() as u32
    }

    /// Fix the baseline from the collected samples.
    /// Returns whether any samples were available.
    pub fn finalize_baseline(&mut self) -> bool {
        if self.baseline_samples.is_empty() {
            return false;
        }
        let sum: f64 = self.baseline_samples.iter().sum();
        self.baseline_y = Some(sum / self.baseline_samples.len() as f64);
        true
    }

    /// Feed one detection frame.
    pub fn update(&mut self, face: Option<&FaceBox>, frame_height: u32, now: Instant) {
        self.prune(now);

        let Some(face) = face else {
            // with no face there is no head position to reason about
            self.down_since = None;
            self.microsleep = false;
            return;
        };
        let Some(baseline) = self.baseline_y else {
            return;
        };

        let center = normalized_center(face, frame_height);
        let smoothed = self.smooth(center);
        self.face_height = f64::from(face.height) / f64::from(frame_height.max(1));

        // image y grows downward, so a dropped head is a larger center
        let down = smoothed - baseline > self.config.nod_down_threshold * self.face_height;

        if down {
            let since = *self.down_since.get_or_insert(now);
            if now.duration_since(since).as_secs_f64() >= self.config.nod_microsleep_s {
                self.microsleep = true;
            }
        } else {
            if let Some(since) = self.down_since.take() {
                let held = now.duration_since(since).as_secs_f64();
                let cooled = self.last_nod_at.map_or(true, |last| {
                    now.duration_since(last).as_secs_f64() >= self.config.nod_cooldown_s
                });
                if held >= self.config.nod_min_duration_s
                    && held < self.config.nod_max_duration_s
                    && cooled
                {
                    self.nods.push_back(now);
                    self.last_nod_at = Some(now);
                }
            }
            self.microsleep = false;
        }
    }

    /// Nods counted inside the sliding window ending at `now`.
    #[must_use]
    pub fn count(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.nods.len() as u32
    }

    /// Whether the head has been down past the microsleep threshold.
    #[must_use]
    pub fn is_microsleep(&self) -> bool {
        self.microsleep
    }

    /// Seconds of the head-down excursion in progress, 0 when upright.
    #[must_use]
    pub fn head_down_duration(&self, now: Instant) -> f64 {
        self.down_since
            .map_or(0.0, |since| now.duration_since(since).as_secs_f64())
    }

    /// Advance the EMA and return its new value.
    fn smooth(&mut self, sample: f64) -> f64 {
        let alpha = self.config.nod_smooth_alpha;
        let smoothed = match self.ema_y {
            Some(previous) => previous * (1.0 - alpha) + sample * alpha,
            None => sample,
        };
        self.ema_y = Some(smoothed);
        smoothed
    }

    /// Drop nods that have aged out of the window.
    fn prune(&mut self, now: Instant) {
        let window = Duration::from_secs_f64(self.config.nod_window_s);
        while let Some(front) = self.nods.front() {
            if now.duration_since(*front) > window {
                self.nods.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The vertical center of the face, normalized by frame height.
fn normalized_center(face: &FaceBox, frame_height: u32) -> f64 {
    f64::from(face.y + face.height / 2.0) / f64::from(frame_height.max(1))
}
