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

//! Loading and validating configurations for the kit firmware.

use std::{collections::HashSet, fmt::Display, io::Read, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
/// A configuration for the entire kit.
///
/// Everything except the identity block has a default, so a minimal
/// configuration file only needs to carry the provisioning identity of the
/// kit. All durations are given in seconds.
pub struct Configuration {
    /// The root URL of the cloud API, without a trailing slash.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// The organization this kit belongs to.
    pub org_id: String,
    /// The vehicle this kit is installed in.
    pub vehicle_id: String,
    /// The identity of the kit itself.
    pub kit_id: String,
    /// The serial number sent in the `X-Kit-Serial` header.
    pub kit_serial: String,
    /// The shared secret sent in the `X-Kit-Key` header.
    pub kit_key: String,
    /// Path of the SQLite file backing the outbox and the badge cache.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Seconds between telemetry points while in READY or TRIP_ACTIVE.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_s: u64,
    /// Seconds between sync worker passes over the outbox.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_s: u64,
    /// Maximum number of outbox items attempted per sync pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The GPIO pin connected to the DHT22 data line.
    #[serde(default = "default_pin_dht")]
    pub pin_dht: u8,
    /// The GPIO pin connected to the gas sensor's digital output.
    #[serde(default = "default_pin_gas")]
    pub pin_gas: u8,
    /// The GPIO pin driving the passive buzzer.
    #[serde(default = "default_pin_buzzer")]
    pub pin_buzzer: u8,
    /// The base tone frequency of the buzzer, in Hz.
    #[serde(default = "default_buzzer_freq")]
    pub buzzer_freq_hz: u32,
    /// The GPIO pins driving the red, green and blue LED channels.
    #[serde(default = "default_pins_led")]
    pub pins_led: [u8; 3],
    /// The GPIO pins of the start, stop, menu and back buttons.
    /// Buttons are wired to ground with internal pull-ups, so a press
    /// reads low.
    #[serde(default = "default_pins_buttons")]
    pub pins_buttons: [u8; 4],
    /// The serial device carrying the continuous NMEA stream.
    #[serde(default = "default_gps_nmea_port")]
    pub gps_nmea_port: String,
    /// The serial device answering AT commands on the same modem.
    #[serde(default = "default_gps_at_port")]
    pub gps_at_port: String,
    /// Baud rate of both modem serial ports.
    #[serde(default = "default_gps_baud")]
    pub gps_baud: u32,
    /// The serial device of the PN532 badge reader, if one is fitted.
    #[serde(default)]
    pub nfc_port: Option<String>,
    /// Path of the stream of per-frame face observations published by the
    /// vision process, if a camera is fitted.
    #[serde(default)]
    pub vision_stream_path: Option<String>,
    /// Seconds the alcohol sensor heats before a blow is accepted.
    #[serde(default = "default_alcohol_warmup")]
    pub alcohol_warmup_s: u64,
    /// Seconds the driver must blow into the sensor.
    #[serde(default = "default_alcohol_blow")]
    pub alcohol_blow_s: u64,
    /// Cabin temperature above which the warning buzzer sounds.
    #[serde(default = "default_temp_warn")]
    pub temp_warn_c: f64,
    /// Cabin temperature above which a critical alert is emitted.
    #[serde(default = "default_temp_critical")]
    pub temp_critical_c: f64,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".into()
}

fn default_db_path() -> String {
    "roadkit_buffer.sqlite3".into()
}

fn default_telemetry_interval() -> u64 {
    2
}

fn default_sync_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_pin_dht() -> u8 {
    4
}

fn default_pin_gas() -> u8 {
    17
}

fn default_pin_buzzer() -> u8 {
    27
}

fn default_buzzer_freq() -> u32 {
    2000
}

fn default_pins_led() -> [u8; 3] {
    [22, 23, 24]
}

fn default_pins_buttons() -> [u8; 4] {
    [5, 6, 13, 19]
}

fn default_gps_nmea_port() -> String {
    "/dev/ttyUSB1".into()
}

fn default_gps_at_port() -> String {
    "/dev/ttyUSB2".into()
}

fn default_gps_baud() -> u32 {
    115_200
}

fn default_alcohol_warmup() -> u64 {
    20
}

fn default_alcohol_blow() -> u64 {
    7
}

fn default_temp_warn() -> f64 {
    40.0
}

fn default_temp_critical() -> f64 {
    50.0
}

#[derive(Debug)]
/// The set of errors that can occur when validating a configuration.
pub enum Error {
    /// The configuration was malformed and could not be parsed into a
    /// `Configuration` object.
    Malformed(serde_json::Error),
    /// A mandatory identity field was left empty.
    /// The kit refuses to boot without a full identity, since every event
    /// it emits would be unattributable.
    MissingIdentity(&'static str),
    /// Two pins are duplicated for differing functions.
    DuplicatePin(u8),
    /// A pin is reserved on the Raspberry Pi and may not be used.
    ReservedPin(u8),
    /// A period was configured as zero.
    ZeroInterval(&'static str),
    /// The warning temperature is not below the critical temperature.
    TemperatureOrder,
}

impl Configuration {
    /// Construct a new `Configuration` by parsing some readable source.
    /// Will also check the configuration to determine that there are no
    /// logical inconsistencies in its definition.
    ///
    /// # Errors
    ///
    /// This function will return errors in line with the definition of
    /// `Error` in this module.
    pub fn parse(source: &mut impl Read) -> Result<Configuration, Error> {
        // deserialize the configuration
        let config: Configuration = serde_json::from_reader(source).map_err(Error::Malformed)?;

        // now validate it

        // identity fields are mandatory and must be non-empty
        for (field, value) in [
            ("org_id", &config.org_id),
            ("vehicle_id", &config.vehicle_id),
            ("kit_id", &config.kit_id),
            ("kit_serial", &config.kit_serial),
            ("kit_key", &config.kit_key),
        ] {
            if value.trim().is_empty() {
                return Err(Error::MissingIdentity(field));
            }
        }

        for (field, value) in [
            ("telemetry_interval_s", config.telemetry_interval_s),
            ("sync_interval_s", config.sync_interval_s),
            ("batch_size", config.batch_size as u64),
            ("buzzer_freq_hz", u64::from(config.buzzer_freq_hz)),
        ] {
            if value == 0 {
                return Err(Error::ZeroInterval(field));
            }
        }

        if config.temp_warn_c >= config.temp_critical_c {
            return Err(Error::TemperatureOrder);
        }

        // check that no pins are reused in the configuration
        // also, check that no illegal pins (i.e. ones on the Raspberry Pi
        // which are reserved) are used
        let mut pins_used = HashSet::new();
        for pin in [config.pin_dht, config.pin_gas, config.pin_buzzer]
            .into_iter()
            .chain(config.pins_led)
            .chain(config.pins_buttons)
        {
            if !is_legal(pin) {
                return Err(Error::ReservedPin(pin));
            }
            if pins_used.contains(&pin) {
                return Err(Error::DuplicatePin(pin));
            }
            pins_used.insert(pin);
        }

        // all validation steps passed
        Ok(config)
    }

    #[must_use]
    /// The period between telemetry points.
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_s)
    }

    #[must_use]
    /// The period between sync worker passes.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_s)
    }
}

/// Determine whether a GPIO pin ID is a legal pin for use by the kit.
fn is_legal(pin: u8) -> bool {
    // There are GPIO pins 0 through 27 (inclusive).
    // However, pins 0 and 1 are reserved for EEPROM.
    1 < pin && pin <= 27
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Malformed(json_err) => {
                write!(f, "Failed to parse JSON for configuration: {json_err}")
            }
            Error::MissingIdentity(field) => {
                write!(f, "Mandatory identity field {field} is missing or empty")
            }
            Error::DuplicatePin(p) => write!(f, "GPIO pin {p} is used for multiple purposes"),
            Error::ReservedPin(p) => write!(
                f,
                "GPIO pin {p} is not allowed to be used on the Raspberry Pi"
            ),
            Error::ZeroInterval(field) => write!(f, "{field} must be nonzero"),
            Error::TemperatureOrder => {
                write!(f, "temp_warn_c must be strictly below temp_critical_c")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// A minimal identity block used by multiple tests.
    const IDENTITY: &str = r#"
        "org_id": "org-1",
        "vehicle_id": "veh-1",
        "kit_id": "kit-1",
        "kit_serial": "RK-TEST-001",
        "kit_key": "aa55"
    "#;

    #[test]
    /// Test that a configuration carrying only the identity gets every
    /// documented default.
    fn defaults() {
        let mut cursor = Cursor::new(format!("{{{IDENTITY}}}"));
        let config = Configuration::parse(&mut cursor).unwrap();

        assert_eq!(config.api_base_url, "http://127.0.0.1:8000");
        assert_eq!(config.db_path, "roadkit_buffer.sqlite3");
        assert_eq!(config.telemetry_interval_s, 2);
        assert_eq!(config.sync_interval_s, 5);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.pins_led, [22, 23, 24]);
        assert_eq!(config.pins_buttons, [5, 6, 13, 19]);
        assert_eq!(config.gps_baud, 115_200);
        assert_eq!(config.alcohol_warmup_s, 20);
        assert_eq!(config.alcohol_blow_s, 7);
        assert!(config.nfc_port.is_none());
        assert!(config.vision_stream_path.is_none());
    }

    #[test]
    /// Test the parsing of a full configuration string.
    fn full_config() {
        let config_str = format!(
            r#"{{
                {IDENTITY},
                "api_base_url": "https://api.example.com",
                "db_path": "/var/lib/roadkit/buffer.sqlite3",
                "telemetry_interval_s": 1,
                "sync_interval_s": 3,
                "batch_size": 10,
                "pin_dht": 4,
                "pin_gas": 17,
                "pin_buzzer": 27,
                "buzzer_freq_hz": 2000,
                "pins_led": [22, 23, 24],
                "pins_buttons": [5, 6, 13, 19],
                "gps_nmea_port": "/dev/ttyUSB1",
                "gps_at_port": "/dev/ttyUSB2",
                "gps_baud": 115200,
                "nfc_port": "/dev/ttyS0",
                "vision_stream_path": "/run/roadkit/vision.sock",
                "alcohol_warmup_s": 20,
                "alcohol_blow_s": 7,
                "temp_warn_c": 40.0,
                "temp_critical_c": 50.0
            }}"#
        );

        let mut cursor = Cursor::new(config_str);
        let config = Configuration::parse(&mut cursor).unwrap();

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.kit_serial, "RK-TEST-001");
        assert_eq!(config.nfc_port.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(config.telemetry_interval(), Duration::from_secs(1));
    }

    #[test]
    /// Test that an empty identity field is rejected.
    fn missing_identity() {
        let config_str = r#"{
            "org_id": "",
            "vehicle_id": "veh-1",
            "kit_id": "kit-1",
            "kit_serial": "RK-TEST-001",
            "kit_key": "aa55"
        }"#;
        let mut cursor = Cursor::new(config_str);

        let Err(Error::MissingIdentity(field)) = Configuration::parse(&mut cursor) else {
            panic!()
        };
        assert_eq!(field, "org_id");
    }

    #[test]
    /// Test that a pin used for two purposes is rejected.
    fn duplicate_pin() {
        let config_str = format!(r#"{{{IDENTITY}, "pin_gas": 27}}"#);
        let mut cursor = Cursor::new(config_str);

        let Err(Error::DuplicatePin(27)) = Configuration::parse(&mut cursor) else {
            panic!()
        };
    }
}
