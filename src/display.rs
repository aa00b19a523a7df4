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

//! Content for the on-board panel.
//!
//! The panel must always tell the truth: network state from the sync
//! worker, queue depth from the outbox, GPS fix, fatigue level, current
//! state. This module only builds the text lines; how they reach the
//! glass is a [`Panel`] implementation's business.

use std::collections::BTreeMap;

/// Something that can show a handful of short text lines.
pub trait Panel {
    /// Replace the panel content.
    fn show(&mut self, lines: &[String]);
}

/// A panel printing to the log, for bench setups without a display.
/// Only logs when the content changes, since the main loop redraws at
/// every tick.
#[derive(Default)]
pub struct ConsolePanel {
    last: Vec<String>,
}

impl Panel for ConsolePanel {
    fn show(&mut self, lines: &[String]) {
        if lines != self.last.as_slice() {
            log::debug!("panel: {}", lines.join(" | "));
            self.last = lines.to_vec();
        }
    }
}

/// The panel of a kit with no display fitted.
pub struct AbsentPanel;

impl Panel for AbsentPanel {
    fn show(&mut self, _: &[String]) {}
}

/// Everything the diagnostics menu can show.
pub struct MenuData {
    /// Init status of each hardware driver.
    pub sensors: BTreeMap<String, bool>,
    pub queue_size: i64,
    /// Wall-clock of the last successful sync, already formatted.
    pub last_sync: Option<String>,
    pub sync_fails: u32,
    pub gps_fix: bool,
    pub gps_sats: u8,
    pub lat: f64,
    pub serial: String,
    pub version: String,
    pub uptime_min: u64,
}

#[must_use]
/// The boot splash.
pub fn screen_boot(serial: &str, version: &str, status: &BTreeMap<String, bool>) -> Vec<String> {
    let failed: Vec<&str> = status
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(name, _)| name.as_str())
        .collect();
    let health = if failed.is_empty() {
        "all drivers up".into()
    } else {
        format!("missing: {}", failed.join(","))
    };
    vec![format!("roadkit v{version}"), serial.to_string(), health]
}

#[must_use]
/// The idle screen.
pub fn screen_ready(
    driver_name: &str,
    gps_fix: bool,
    gps_sats: u8,
    network: &str,
    rssi_dbm: i32,
    temp_c: Option<f64>,
    queue_size: i64,
    online: bool,
) -> Vec<String> {
    let temp = temp_c.map_or("--".into(), |t| format!("{t:.1}C"));
    vec![
        format!("READY  {driver_name}"),
        format!(
            "GPS {} ({gps_sats} sats)",
            if gps_fix { "fix" } else { "no fix" }
        ),
        format!("{network} {rssi_dbm} dBm  {}", online_tag(online)),
        format!("{temp}  queue {queue_size}"),
        "START to begin".into(),
    ]
}

#[must_use]
/// The badge prompt; `blink` alternates the prompt line.
pub fn screen_auth(blink: bool) -> Vec<String> {
    vec![
        "DRIVER AUTH".into(),
        if blink {
            ">>> present badge <<<".into()
        } else {
            "    present badge    ".into()
        },
        "BACK to cancel".into(),
    ]
}

#[must_use]
/// The badge result, shown briefly before the alcohol test.
pub fn screen_auth_result(driver_name: &str) -> Vec<String> {
    vec!["BADGE OK".into(), driver_name.to_string()]
}

#[must_use]
/// The alcohol sensor warmup countdown.
pub fn screen_alcohol_warmup(elapsed_s: f64, total_s: u64) -> Vec<String> {
    let left = (total_s as f64 - elapsed_s).max(0.0);
    vec![
        "ALCOHOL TEST".into(),
        format!("warming up {left:.0}s"),
    ]
}

#[must_use]
/// The blow countdown.
pub fn screen_alcohol_blow(countdown_s: f64) -> Vec<String> {
    vec!["ALCOHOL TEST".into(), format!("BLOW NOW  {countdown_s:.0}s")]
}

#[must_use]
/// The passed verdict.
pub fn screen_alcohol_pass() -> Vec<String> {
    vec![
        "TEST PASSED".into(),
        "START to begin trip".into(),
        "BACK to cancel".into(),
    ]
}

#[must_use]
/// The failed verdict.
pub fn screen_alcohol_fail() -> Vec<String> {
    vec![
        "TEST FAILED".into(),
        "trip blocked".into(),
        "START to retest, BACK to quit".into(),
    ]
}

#[must_use]
/// The trip screen.
pub fn screen_trip(
    speed_kmh: f64,
    gps_fix: bool,
    network: &str,
    queue_size: i64,
    fatigue_level: u8,
    elapsed_min: f64,
    online: bool,
) -> Vec<String> {
    vec![
        format!("TRIP  {elapsed_min:.0} min"),
        format!("{speed_kmh:.0} km/h  GPS {}", if gps_fix { "fix" } else { "--" }),
        format!("{network}  {}  queue {queue_size}", online_tag(online)),
        format!("fatigue L{fatigue_level}"),
    ]
}

#[must_use]
/// The stop confirmation prompt.
pub fn screen_stop_confirm() -> Vec<String> {
    vec![
        "END TRIP?".into(),
        "START to confirm".into(),
        "BACK to resume".into(),
    ]
}

#[must_use]
/// The remote lockout screen.
pub fn screen_warning_lock() -> Vec<String> {
    vec!["KIT LOCKED".into(), "contact your fleet manager".into()]
}

#[must_use]
/// One page of the diagnostics menu.
pub fn screen_menu(page: u8, data: &MenuData) -> Vec<String> {
    match page {
        0 => {
            let mut lines = vec!["MENU 1/4  sensors".into()];
            lines.extend(
                data.sensors
                    .iter()
                    .map(|(name, ok)| format!("{name}: {}", if *ok { "up" } else { "down" })),
            );
            lines
        }
        1 => vec![
            "MENU 2/4  sync".into(),
            format!("queue {}", data.queue_size),
            format!(
                "last ok {}",
                data.last_sync.as_deref().unwrap_or("never")
            ),
            format!("fails {}", data.sync_fails),
        ],
        2 => vec![
            "MENU 3/4  gps".into(),
            format!(
                "{} ({} sats)",
                if data.gps_fix { "fix" } else { "no fix" },
                data.gps_sats
            ),
            format!("lat {:.5}", data.lat),
        ],
        _ => vec![
            "MENU 4/4  kit".into(),
            data.serial.clone(),
            format!("fw {}", data.version),
            format!("up {} min", data.uptime_min),
        ],
    }
}

/// The network tag shown on every status screen.
fn online_tag(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "OFFLINE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test that the ready screen reflects the truth it was given.
    fn ready_tells_truth() {
        let lines = screen_ready("Alice", true, 9, "4G", -77, Some(24.5), 12, false);
        let joined = lines.join("\n");
        assert!(joined.contains("Alice"));
        assert!(joined.contains("fix"));
        assert!(joined.contains("9 sats"));
        assert!(joined.contains("4G"));
        assert!(joined.contains("-77"));
        assert!(joined.contains("24.5"));
        assert!(joined.contains("queue 12"));
        assert!(joined.contains("OFFLINE"));
    }

    #[test]
    /// Test that the boot splash names the drivers that failed init.
    fn boot_names_missing_drivers() {
        let mut status = BTreeMap::new();
        status.insert("GPS".to_string(), true);
        status.insert("NFC".to_string(), false);
        status.insert("CAM".to_string(), false);

        let lines = screen_boot("RK-1", "0.1.0", &status);
        let joined = lines.join("\n");
        assert!(joined.contains("RK-1"));
        assert!(joined.contains("missing: CAM,NFC"));
    }

    #[test]
    /// Test that all four menu pages render.
    fn menu_pages() {
        let data = MenuData {
            sensors: BTreeMap::from([("GPS".to_string(), true)]),
            queue_size: 3,
            last_sync: None,
            sync_fails: 7,
            gps_fix: false,
            gps_sats: 0,
            lat: 48.1,
            serial: "RK-1".into(),
            version: "0.1.0".into(),
            uptime_min: 42,
        };

        assert!(screen_menu(0, &data).join("\n").contains("GPS: up"));
        let sync_page = screen_menu(1, &data).join("\n");
        assert!(sync_page.contains("never"));
        assert!(sync_page.contains("fails 7"));
        assert!(screen_menu(2, &data).join("\n").contains("no fix"));
        assert!(screen_menu(3, &data).join("\n").contains("up 42 min"));
    }

    #[test]
    /// Test that the console panel only logs content changes.
    fn console_panel_dedupes() {
        let mut panel = ConsolePanel::default();
        let lines = vec!["a".to_string()];
        panel.show(&lines);
        assert_eq!(panel.last, lines);
        panel.show(&lines);
        assert_eq!(panel.last, lines);
    }
}
