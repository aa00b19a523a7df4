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

//! Tunables of the fatigue pipeline.
//!
//! Deliberately a separate value type from the firmware
//! [`Configuration`](crate::config::Configuration): the pipeline is its
//! own subsystem with its own calibration lore, and handing it one
//! self-contained config keeps the two from growing into each other.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
/// All thresholds and timings of the fatigue detector.
pub struct FatigueConfig {
    /// Seconds of baseline accumulation before detection starts.
    pub calibration_sec: f64,
    /// Minimum face samples required to accept the calibration.
    pub calibration_min_samples: u32,
    /// EMA weight of the newest head position sample (1 = raw).
    pub nod_smooth_alpha: f64,
    /// Head drop below baseline, as a fraction of face height, that
    /// counts as "head down".
    pub nod_down_threshold: f64,
    /// Shortest head drop that counts as a nod, in seconds.
    pub nod_min_duration_s: f64,
    /// Longest head drop that still counts as a nod; anything longer is
    /// a microsleep, not a nod.
    pub nod_max_duration_s: f64,
    /// Dead time between two counted nods, in seconds.
    pub nod_cooldown_s: f64,
    /// Continuous head-down time that raises the microsleep flag.
    pub nod_microsleep_s: f64,
    /// Length of the sliding window over which nods are counted.
    pub nod_window_s: f64,
    /// Relative intensity drop in the mouth region that counts as an
    /// open mouth.
    pub mouth_drop_ratio: f64,
    /// Seconds the mouth must stay open to count as a yawn.
    pub yawn_duration_s: f64,
    /// Dead time between two counted yawns, in seconds.
    pub yawn_cooldown_s: f64,
    /// Yawns that escalate the level to warning.
    pub yawn_warn_count: u32,
    /// Windowed nods that escalate the level to warning.
    pub nod_warn_count: u32,
    /// Windowed nods that escalate the level to alert.
    pub nod_alert_count: u32,
}

impl Default for FatigueConfig {
    fn default() -> FatigueConfig {
        FatigueConfig {
            calibration_sec: 5.0,
            calibration_min_samples: 10,
            nod_smooth_alpha: 0.35,
            nod_down_threshold: 0.12,
            nod_min_duration_s: 0.3,
            nod_max_duration_s: 3.0,
            nod_cooldown_s: 2.0,
            nod_microsleep_s: 3.0,
            nod_window_s: 300.0,
            mouth_drop_ratio: 0.30,
            yawn_duration_s: 2.5,
            yawn_cooldown_s: 10.0,
            yawn_warn_count: 3,
            nod_warn_count: 2,
            nod_alert_count: 4,
        }
    }
}
