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

//! Driver for the combined GNSS + cellular modem.
//!
//! The modem exposes two serial ports: one streams NMEA sentences
//! continuously, the other answers AT commands. A dedicated reader thread
//! owns the NMEA port, parses `GGA`, `RMC`, `VTG` and `GSA` sentences and
//! merges them into a shared [`GpsFix`] cache; when the port drops it
//! reconnects with a backoff doubling from one second up to thirty. The
//! AT port is used briefly at init to switch the GNSS engine on, and then
//! every thirty seconds to refresh signal strength and network type.

use std::{
    io::{BufRead, BufReader, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::Duration,
};

use chrono::NaiveDate;

use crate::stop::StopToken;

/// Longest pause between NMEA reconnection attempts.
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq)]
/// The last known position and cellular state.
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub speed_gps_kmh: f64,
    pub heading_deg: f64,
    /// GGA fix quality; zero means no usable fix.
    pub fix_quality: u8,
    pub satellites: u8,
    pub hdop: f64,
    /// Whether the receiver currently has a usable fix.
    pub gps_ok: bool,
    /// Wall timestamp of the last RMC sentence, RFC 3339 UTC.
    pub timestamp_iso: String,
    /// Cellular signal strength; -1 until the first CSQ answer.
    pub rssi_dbm: i32,
    /// One of 2G, 3G, 4G, 5G-NSA or 5G; `ACT<n>` for an access
    /// technology code outside that map; UNKNOWN until the modem answers
    /// its first COPS query.
    pub network_type: String,
    /// The operator name reported by the modem.
    pub operator: String,
}

impl Default for GpsFix {
    fn default() -> GpsFix {
        GpsFix {
            lat: 0.0,
            lon: 0.0,
            altitude_m: 0.0,
            speed_gps_kmh: 0.0,
            heading_deg: 0.0,
            fix_quality: 0,
            satellites: 0,
            hdop: 99.9,
            gps_ok: false,
            timestamp_iso: String::new(),
            rssi_dbm: -1,
            network_type: "UNKNOWN".into(),
            operator: String::new(),
        }
    }
}

/// The modem driver. `read` is cheap; all serial traffic happens on
/// background threads.
pub struct GpsDriver {
    cache: Arc<Mutex<GpsFix>>,
    at_port: String,
    baud: u32,
    /// Guards against overlapping network refreshes when the modem
    /// answers slowly.
    refreshing: Arc<AtomicBool>,
    present: bool,
}

impl GpsDriver {
    /// Initialize the GNSS engine over the AT port and spawn the NMEA
    /// reader thread. The reader keeps retrying even if the port is not
    /// openable yet, so a modem that enumerates late still comes up.
    ///
    /// Returns the driver and whether the hardware answered at init.
    pub fn start(nmea_port: &str, at_port: &str, baud: u32, stop: StopToken) -> GpsDriver {
        let answered = at_init(at_port, baud);
        if !answered {
            log::warn!("modem did not answer AT init on {at_port}");
        }

        let cache = Arc::new(Mutex::new(GpsFix::default()));
        let thread_cache = Arc::clone(&cache);
        let port_name = nmea_port.to_string();
        if let Err(e) = std::thread::Builder::new()
            .name("gps-nmea".into())
            .spawn(move || nmea_loop(&port_name, baud, &thread_cache, &stop))
        {
            log::error!("could not spawn the NMEA reader: {e}");
        }

        GpsDriver {
            cache,
            at_port: at_port.to_string(),
            baud,
            refreshing: Arc::new(AtomicBool::new(false)),
            present: answered,
        }
    }

    #[must_use]
    /// Construct a driver for a kit with no modem fitted.
    pub fn absent() -> GpsDriver {
        GpsDriver {
            cache: Arc::new(Mutex::new(GpsFix::default())),
            at_port: String::new(),
            baud: 0,
            refreshing: Arc::new(AtomicBool::new(false)),
            present: false,
        }
    }

    #[must_use]
    /// Whether the modem answered at init.
    pub fn is_present(&self) -> bool {
        self.present
    }

    #[must_use]
    /// A copy of the current fix and cellular state.
    pub fn read(&self) -> GpsFix {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Refresh signal strength, operator and network type in the
    /// background. Returns immediately; a refresh already in flight is
    /// not doubled up.
    pub fn refresh_network(&self) {
        if !self.present || self.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }

        let at_port = self.at_port.clone();
        let baud = self.baud;
        let cache = Arc::clone(&self.cache);
        let refreshing = Arc::clone(&self.refreshing);
        std::thread::spawn(move || {
            if let Ok(mut port) = open_port(&at_port, baud) {
                let csq = at_send(&mut port, "AT+CSQ");
                if let Some(rssi) = parse_csq(&csq) {
                    cache
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .rssi_dbm = rssi;
                }

                let cops = at_send(&mut port, "AT+COPS?");
                if let Some((operator, network_type)) = parse_cops(&cops) {
                    let mut fix = cache
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    fix.operator = operator;
                    fix.network_type = network_type;
                }
            }
            refreshing.store(false, Ordering::SeqCst);
        });
    }
}

/// The NMEA reader thread: open, read lines, merge, reconnect on failure.
fn nmea_loop(port_name: &str, baud: u32, cache: &Mutex<GpsFix>, stop: &StopToken) {
    let mut backoff = Duration::from_secs(1);

    while !stop.is_stopped() {
        let port = match open_port(port_name, baud) {
            Ok(port) => {
                backoff = Duration::from_secs(1);
                port
            }
            Err(e) => {
                log::warn!("NMEA port {port_name} unavailable: {e}, retrying in {backoff:?}");
                if stop.wait_timeout(backoff) {
                    return;
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue;
            }
        };

        let mut reader = BufReader::new(port);
        let mut line = String::new();
        loop {
            if stop.is_stopped() {
                return;
            }
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let sentence = line.trim();
                    if sentence.starts_with('$') {
                        let mut fix = cache
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        apply_sentence(sentence, &mut fix);
                    }
                    line.clear();
                }
                // a timeout is just a quiet second; keep any partial line
                // and check the stop token again
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::warn!("NMEA port lost: {e}");
                    break;
                }
            }
        }

        if stop.wait_timeout(backoff) {
            return;
        }
        backoff = (backoff * 2).min(RECONNECT_CAP);
    }
}

/// Open a serial port with the one-second read timeout every loop in this
/// module relies on for stop-token checks.
fn open_port(name: &str, baud: u32) -> serialport::Result<Box<dyn serialport::SerialPort>> {
    serialport::new(name, baud)
        .timeout(Duration::from_secs(1))
        .open()
}

/// Merge one NMEA sentence into the fix. Sentences with a bad checksum or
/// of an unhandled type are ignored.
fn apply_sentence(sentence: &str, fix: &mut GpsFix) {
    let Some(body) = checked_body(sentence) else {
        return;
    };
    let fields: Vec<&str> = body.split(',').collect();
    let id = fields[0];
    if id.len() < 5 {
        return;
    }

    // the two-letter talker prefix (GP, GN, ...) does not matter
    match &id[2..] {
        "GGA" => apply_gga(&fields, fix),
        "RMC" => apply_rmc(&fields, fix),
        "VTG" => apply_vtg(&fields, fix),
        "GSA" => apply_gsa(&fields, fix),
        _ => {}
    }
}

/// Strip the leading `$` and the `*hh` checksum, validating the checksum
/// when present. Returns `None` for a malformed or corrupted sentence.
fn checked_body(sentence: &str) -> Option<&str> {
    let body = sentence.strip_prefix('$')?;
    match body.split_once('*') {
        Some((data, checksum)) => {
            let wanted = u8::from_str_radix(checksum.trim(), 16).ok()?;
            let actual = data.bytes().fold(0_u8, |acc, byte| acc ^ byte);
            (actual == wanted).then_some(data)
        }
        None => Some(body),
    }
}

/// GGA: fix quality, satellite count, position, altitude, HDOP.
fn apply_gga(fields: &[&str], fix: &mut GpsFix) {
    if fields.len() < 10 {
        return;
    }
    let quality: u8 = fields[6].parse().unwrap_or(0);
    fix.fix_quality = quality;
    fix.satellites = fields[7].parse().unwrap_or(0);
    fix.gps_ok = quality > 0;

    if quality > 0 {
        if let (Some(lat), Some(lon)) = (
            parse_coord(fields[2], fields[3]),
            parse_coord(fields[4], fields[5]),
        ) {
            fix.lat = round_to(lat, 6);
            fix.lon = round_to(lon, 6);
        }
        if let Ok(altitude) = fields[9].parse::<f64>() {
            fix.altitude_m = round_to(altitude, 1);
        }
    }
    if let Ok(hdop) = fields[8].parse::<f64>() {
        fix.hdop = round_to(hdop, 1);
    }
}

/// RMC: validity, position, speed over ground, course, wall timestamp.
fn apply_rmc(fields: &[&str], fix: &mut GpsFix) {
    if fields.len() < 10 || fields[2] != "A" {
        return;
    }

    if let (Some(lat), Some(lon)) = (
        parse_coord(fields[3], fields[4]),
        parse_coord(fields[5], fields[6]),
    ) {
        fix.lat = round_to(lat, 6);
        fix.lon = round_to(lon, 6);
        fix.gps_ok = true;
    }
    if let Ok(knots) = fields[7].parse::<f64>() {
        fix.speed_gps_kmh = round_to(knots * 1.852, 1);
    }
    if let Ok(course) = fields[8].parse::<f64>() {
        fix.heading_deg = round_to(course, 1);
    }
    if let Some(timestamp) = parse_rmc_timestamp(fields[1], fields[9]) {
        fix.timestamp_iso = timestamp;
    }
}

/// VTG: speed in km/h and true track, fresher than the RMC values.
fn apply_vtg(fields: &[&str], fix: &mut GpsFix) {
    if fields.len() < 8 {
        return;
    }
    if let Ok(kmh) = fields[7].parse::<f64>() {
        fix.speed_gps_kmh = round_to(kmh, 1);
    }
    if let Ok(track) = fields[1].parse::<f64>() {
        fix.heading_deg = round_to(track, 1);
    }
}

/// GSA: horizontal dilution of precision.
fn apply_gsa(fields: &[&str], fix: &mut GpsFix) {
    if fields.len() < 18 {
        return;
    }
    if let Ok(hdop) = fields[16].parse::<f64>() {
        fix.hdop = round_to(hdop, 1);
    }
}

/// Parse an NMEA `ddmm.mmmm` / `dddmm.mmmm` coordinate with its
/// hemisphere letter into signed decimal degrees.
fn parse_coord(value: &str, hemisphere: &str) -> Option<f64> {
    let dot = value.find('.')?;
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    let unsigned = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Some(unsigned),
        "S" | "W" => Some(-unsigned),
        _ => None,
    }
}

/// Combine the RMC `hhmmss[.sss]` and `ddmmyy` fields into RFC 3339 UTC.
fn parse_rmc_timestamp(time: &str, date: &str) -> Option<String> {
    if time.len() < 6 || date.len() != 6 {
        return None;
    }
    let hour: u32 = time[0..2].parse().ok()?;
    let minute: u32 = time[2..4].parse().ok()?;
    let second: u32 = time[4..6].parse().ok()?;
    let day: u32 = date[0..2].parse().ok()?;
    let month: u32 = date[2..4].parse().ok()?;
    let year: i32 = date[4..6].parse().ok()?;
    // the sentence carries a two-digit year; anything from the 80s or 90s
    // is a receiver still in the previous GPS epoch
    let year = if year >= 80 { 1900 + year } else { 2000 + year };

    let datetime = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)?
        .and_utc();
    Some(datetime.to_rfc3339())
}

/// Round to the given number of decimal digits.
fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10_f64.powi(digits);
    (value * factor).round() / factor
}

/// Probe the modem and switch its GNSS engine on.
/// Returns whether the modem answered the probe.
fn at_init(port_name: &str, baud: u32) -> bool {
    let Ok(mut port) = open_port(port_name, baud) else {
        return false;
    };

    let probe = at_send(&mut port, "AT");
    if !probe.contains("OK") && !probe.contains("AT") {
        return false;
    }
    for cmd in ["AT+CGNSSMODE=1", "AT+CGPS=0", "AT+CGPS=1"] {
        at_send(&mut port, cmd);
        sleep(Duration::from_millis(300));
    }
    true
}

/// Send one AT command and collect whatever the modem answers within the
/// port timeout.
fn at_send(port: &mut Box<dyn serialport::SerialPort>, cmd: &str) -> String {
    let _ = port.clear(serialport::ClearBuffer::Input);
    if port.write_all(format!("{cmd}\r").as_bytes()).is_err() {
        return String::new();
    }
    sleep(Duration::from_millis(300));

    let mut buffer = [0_u8; 2048];
    let read = port.read(&mut buffer).unwrap_or(0);
    String::from_utf8_lossy(&buffer[..read]).into_owned()
}

/// Extract the RSSI in dBm from a `+CSQ: <n>,<ber>` answer.
/// Values outside 0..=31 (notably the "unknown" marker 99) are rejected.
fn parse_csq(response: &str) -> Option<i32> {
    let line = response.lines().find(|line| line.contains("+CSQ:"))?;
    let value = line.split(':').nth(1)?.trim().split(',').next()?;
    let csq: i32 = value.trim().parse().ok()?;
    (0..=31).contains(&csq).then(|| -113 + 2 * csq)
}

/// Extract operator name and access technology from a
/// `+COPS: <mode>,<format>,"<operator>",<act>` answer.
fn parse_cops(response: &str) -> Option<(String, String)> {
    let line = response.lines().find(|line| line.contains("+COPS:"))?;
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 4 {
        return None;
    }
    let operator = parts[2].trim().trim_matches('"').to_string();
    let act: i32 = parts[3].trim().parse().ok()?;
    let network_type = match act {
        0 => "2G".into(),
        2 => "3G".into(),
        7 => "4G".into(),
        11 => "5G-NSA".into(),
        12 => "5G".into(),
        other => format!("ACT{other}"),
    };
    Some((operator, network_type))
}
