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

//! Fusion of the fatigue indicators into one alert level.

use super::FatigueConfig;

/// Fatigue level: everything nominal.
pub const LEVEL_NORMAL: u8 = 0;
/// Fatigue level: early signs, worth a soft warning.
pub const LEVEL_WARNING: u8 = 1;
/// Fatigue level: intervene now.
pub const LEVEL_ALERT: u8 = 2;

/// Combine the indicator counters into a level.
///
/// A microsleep is an alert on its own. Nods escalate by count, yawns
/// reach warning on their own and alert only in combination with at
/// least one nod.
#[must_use]
pub fn fuse(config: &FatigueConfig, nod_count: u32, is_microsleep: bool, yawn_count: u32) -> u8 {
    let mut level = LEVEL_NORMAL;

    if is_microsleep || nod_count >= config.nod_alert_count {
        level = LEVEL_ALERT;
    } else if nod_count >= config.nod_warn_count {
        level = LEVEL_WARNING;
    }

    if yawn_count >= config.yawn_warn_count {
        level = level.max(LEVEL_WARNING);
        if nod_count >= 1 {
            level = LEVEL_ALERT;
        }
    }

    level
}

/// The display name of a level.
#[must_use]
pub fn level_name(level: u8) -> &'static str {
    match level {
        LEVEL_WARNING => "WARNING",
        LEVEL_ALERT => "ALERT",
        _ => "NORMAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test the whole fusion table against the documented rules.
    fn fusion_table() {
        let config = FatigueConfig::default();

        // (nods, microsleep, yawns) -> level
        let cases = [
            ((0, false, 0), LEVEL_NORMAL),
            ((1, false, 0), LEVEL_NORMAL),
            ((2, false, 0), LEVEL_WARNING),
            ((3, false, 0), LEVEL_WARNING),
            ((4, false, 0), LEVEL_ALERT),
            ((0, true, 0), LEVEL_ALERT),
            ((0, false, 3), LEVEL_WARNING),
            ((0, false, 2), LEVEL_NORMAL),
            // yawns plus a single nod escalate all the way
            ((1, false, 3), LEVEL_ALERT),
            ((2, false, 3), LEVEL_ALERT),
        ];

        for ((nods, microsleep, yawns), expected) in cases {
            assert_eq!(
                fuse(&config, nods, microsleep, yawns),
                expected,
                "nods={nods} microsleep={microsleep} yawns={yawns}"
            );
        }
    }

    #[test]
    /// Test the level names.
    fn names() {
        assert_eq!(level_name(LEVEL_NORMAL), "NORMAL");
        assert_eq!(level_name(LEVEL_WARNING), "WARNING");
        assert_eq!(level_name(LEVEL_ALERT), "ALERT");
    }
}
