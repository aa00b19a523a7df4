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

//! Specification of the "outbound" events, which travel from the kit to
//! the cloud API through the outbox.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    fatigue::FatigueSnapshot,
    hardware::{dht22::EnvReading, gas::GasReading, gps::GpsFix},
};

/// Current wall time as an RFC 3339 UTC string, the timestamp format of
/// every event the kit emits.
#[must_use]
pub fn utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The kinds of safety alert the kit can raise.
pub enum AlertType {
    /// The alcohol test failed.
    AlcoholFail,
    /// The fatigue pipeline reported an alert-level episode.
    FatigueAlert,
    /// Gas was detected in the cabin outside of an alcohol test.
    GasDetected,
    /// The cabin temperature crossed the critical threshold.
    TempCritical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How serious an alert is.
pub enum Severity {
    /// Worth a look.
    Warning,
    /// Worth an intervention.
    Critical,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
/// One snapshot composed from all sensor reads at a sampling instant.
///
/// The OBD and IMU blocks are reserved-zero placeholders: the ingest
/// schema already carries them, the kit does not read those buses yet.
pub struct TelemetryPoint {
    /// Sampling wall time, RFC 3339 UTC.
    pub time: String,
    pub org_id: String,
    pub vehicle_id: String,
    pub kit_id: String,
    /// The trip this point belongs to, if one is active.
    pub trip_id: Option<String>,

    // position
    pub lat: f64,
    pub lon: f64,
    pub speed_gps_kmh: f64,
    pub heading_deg: f64,
    pub altitude_m: f64,
    pub gps_fix_quality: u8,
    pub gps_satellites: u8,
    pub gps_hdop: f64,

    // cabin environment
    pub cabin_temp_c: f64,
    pub cabin_humidity_pct: f64,
    pub gas_detected: bool,

    // cellular
    pub signal_strength_rssi: i32,
    pub network_type: String,

    // fatigue
    pub fatigue_level: u8,
    pub fatigue_nod_count: u32,
    pub fatigue_yawn_count: u32,
    pub fatigue_is_microsleep: bool,
    pub fatigue_head_down_sec: f64,
    pub fatigue_face_detected: bool,

    // OBD placeholders
    pub engine_rpm: u32,
    pub vehicle_speed_obd_kmh: f64,
    pub engine_load_pct: f64,
    pub fuel_level_pct: f64,
    pub battery_voltage: f64,

    // IMU placeholders
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
}

/// The provisioning identity stamped into every event.
pub struct KitIdentity {
    pub org_id: String,
    pub vehicle_id: String,
    pub kit_id: String,
}

impl TelemetryPoint {
    #[must_use]
    /// Compose a point from the current snapshot of every sensor.
    pub fn compose(
        identity: &KitIdentity,
        trip_id: Option<String>,
        gps: &GpsFix,
        env: &EnvReading,
        gas: &GasReading,
        fatigue: &FatigueSnapshot,
    ) -> TelemetryPoint {
        TelemetryPoint {
            time: utc_iso(),
            org_id: identity.org_id.clone(),
            vehicle_id: identity.vehicle_id.clone(),
            kit_id: identity.kit_id.clone(),
            trip_id,

            lat: gps.lat,
            lon: gps.lon,
            speed_gps_kmh: gps.speed_gps_kmh,
            heading_deg: gps.heading_deg,
            altitude_m: gps.altitude_m,
            gps_fix_quality: gps.fix_quality,
            gps_satellites: gps.satellites,
            gps_hdop: gps.hdop,

            cabin_temp_c: env.temperature_c.unwrap_or(0.0),
            cabin_humidity_pct: env.humidity_pct.unwrap_or(0.0),
            gas_detected: gas.gas_detected,

            signal_strength_rssi: gps.rssi_dbm,
            network_type: gps.network_type.clone(),

            fatigue_level: fatigue.level,
            fatigue_nod_count: fatigue.nod_count,
            fatigue_yawn_count: fatigue.yawn_count,
            fatigue_is_microsleep: fatigue.is_microsleep,
            fatigue_head_down_sec: fatigue.head_down_sec,
            fatigue_face_detected: fatigue.face_detected,

            engine_rpm: 0,
            vehicle_speed_obd_kmh: 0.0,
            engine_load_pct: 0.0,
            fuel_level_pct: 0.0,
            battery_voltage: 0.0,

            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 0.0,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
        }
    }

    #[must_use]
    /// Wrap this point into the ingest payload shape, `{"points": [..]}`.
    pub fn into_payload(self) -> serde_json::Value {
        serde_json::json!({ "points": [self] })
    }
}

#[derive(Serialize, Debug)]
/// A safety alert bound for the `alert` endpoint.
pub struct AlertEvent {
    pub ts: String,
    pub org_id: String,
    pub kit_id: String,
    pub vehicle_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl AlertEvent {
    #[must_use]
    /// Construct an alert stamped with the current time.
    pub fn now(
        identity: &KitIdentity,
        trip_id: Option<String>,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
    ) -> AlertEvent {
        AlertEvent {
            ts: utc_iso(),
            org_id: identity.org_id.clone(),
            kit_id: identity.kit_id.clone(),
            vehicle_id: identity.vehicle_id.clone(),
            trip_id,
            alert_type,
            severity,
            message: message.into(),
            meta: None,
        }
    }

    #[must_use]
    /// Attach extra context to the alert.
    pub fn with_meta(mut self, meta: serde_json::Value) -> AlertEvent {
        self.meta = Some(meta);
        self
    }
}

#[derive(Serialize, Debug)]
/// A badge presentation bound for the `nfc_auth` endpoint.
pub struct NfcAuthEvent {
    pub ts: String,
    pub org_id: String,
    pub kit_id: String,
    pub vehicle_id: String,
    pub badge_uid_hash: String,
    pub driver_id: String,
    /// `success` for a cache hit, `offline_allowed` for an unknown badge
    /// accepted pending server-side validation.
    pub auth_result: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Serialize, Debug)]
/// An alcohol test outcome bound for the `alcohol` endpoint.
pub struct AlcoholEvent {
    pub ts_start: String,
    pub ts_end: String,
    pub org_id: String,
    pub kit_id: String,
    pub vehicle_id: String,
    pub driver_id: Option<String>,
    pub sensor_warmup_time_s: u64,
    /// Raw logic level of the gas line at decision time (high = clean).
    pub ttl_state: bool,
    /// `pass` or `fail`.
    pub result: String,
    /// Whether the gas sensor itself was readable; with the sensor absent
    /// the result degrades to `pass` and this flag records it.
    pub sensor_ok: bool,
}

#[derive(Serialize, Debug)]
/// A trip start record bound for the `trip_open` endpoint.
pub struct TripOpenEvent {
    pub trip_id: String,
    pub org_id: String,
    pub vehicle_id: String,
    pub kit_id: String,
    pub driver_id: Option<String>,
    pub start_time: String,
    pub start_lat: f64,
    pub start_lon: f64,
    pub status: String,
}

#[derive(Serialize, Debug)]
/// A trip end record bound for the `trip_close` endpoint.
pub struct TripCloseEvent {
    pub trip_id: String,
    pub org_id: String,
    pub vehicle_id: String,
    pub kit_id: String,
    pub end_time: String,
    pub end_lat: f64,
    pub end_lon: f64,
    pub status: String,
}

#[derive(Serialize, Debug)]
/// The boot health report bound for the `health` endpoint.
pub struct HealthEvent {
    pub time: String,
    pub org_id: String,
    pub kit_id: String,
    pub event_type: String,
    pub firmware_version: String,
    /// Init status of each hardware driver, keyed by driver name.
    /// A `BTreeMap` so the report serializes in a stable order.
    pub drivers: BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn identity() -> KitIdentity {
        KitIdentity {
            org_id: "org-1".into(),
            vehicle_id: "veh-1".into(),
            kit_id: "kit-1".into(),
        }
    }

    /// Helper function to test that the serialized result is the same as
    /// the expected result, independent of whitespace or key ordering.
    fn serialize_helper(expected: &Value, event: &impl Serialize) {
        let event_value = serde_json::to_value(event).unwrap();
        assert_eq!(&event_value, expected);
    }

    #[test]
    /// Test that every field of a telemetry point survives a round trip
    /// through JSON unchanged.
    fn telemetry_round_trip() {
        let point = TelemetryPoint {
            time: "2026-02-11T08:30:00.000Z".into(),
            org_id: "org-1".into(),
            vehicle_id: "veh-1".into(),
            kit_id: "kit-1".into(),
            trip_id: Some("6f78f0c0-3f2e-4e0b-9a35-6c1b2f0f6d11".into()),
            lat: 48.858_37,
            lon: 2.294_48,
            speed_gps_kmh: 87.3,
            heading_deg: 271.5,
            altitude_m: 35.2,
            gps_fix_quality: 1,
            gps_satellites: 9,
            gps_hdop: 0.9,
            cabin_temp_c: 24.5,
            cabin_humidity_pct: 41.0,
            gas_detected: false,
            signal_strength_rssi: -77,
            network_type: "4G".into(),
            fatigue_level: 1,
            fatigue_nod_count: 2,
            fatigue_yawn_count: 3,
            fatigue_is_microsleep: false,
            fatigue_head_down_sec: 0.4,
            fatigue_face_detected: true,
            engine_rpm: 0,
            vehicle_speed_obd_kmh: 0.0,
            engine_load_pct: 0.0,
            fuel_level_pct: 0.0,
            battery_voltage: 0.0,
            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 0.0,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
        };

        let text = serde_json::to_string(&point).unwrap();
        let back: TelemetryPoint = serde_json::from_str(&text).unwrap();
        assert_eq!(point, back);
    }

    #[test]
    /// Test that an alert without a trip or meta drops those keys
    /// entirely.
    fn serialize_alert() {
        let alert = AlertEvent {
            ts: "2026-02-11T08:30:00.000Z".into(),
            org_id: "org-1".into(),
            kit_id: "kit-1".into(),
            vehicle_id: "veh-1".into(),
            trip_id: None,
            alert_type: AlertType::AlcoholFail,
            severity: Severity::Critical,
            message: "alcohol test failed, trip blocked".into(),
            meta: None,
        };

        serialize_helper(
            &json!({
                "ts": "2026-02-11T08:30:00.000Z",
                "org_id": "org-1",
                "kit_id": "kit-1",
                "vehicle_id": "veh-1",
                "alert_type": "alcohol_fail",
                "severity": "critical",
                "message": "alcohol test failed, trip blocked"
            }),
            &alert,
        );
    }

    #[test]
    /// Test the ingest payload shape around a composed point.
    fn telemetry_payload_shape() {
        let point = TelemetryPoint::compose(
            &identity(),
            None,
            &GpsFix::default(),
            &EnvReading::default(),
            &GasReading::default(),
            &FatigueSnapshot::default(),
        );
        let payload = point.into_payload();

        let points = payload.get("points").unwrap().as_array().unwrap();
        assert_eq!(points.len(), 1);
        let point = points[0].as_object().unwrap();
        assert_eq!(point.get("org_id").unwrap(), "org-1");
        assert_eq!(point.get("trip_id").unwrap(), &Value::Null);
        assert_eq!(point.get("engine_rpm").unwrap(), 0);
        assert_eq!(point.get("network_type").unwrap(), "UNKNOWN");
    }
}
