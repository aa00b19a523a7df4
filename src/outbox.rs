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

//! The durable event outbox and the badge cache.
//!
//! Every event the kit produces is inserted here first and deleted only
//! after the cloud API acknowledged it, which is what makes the kit
//! offline-first: the SQLite file survives power loss, and the sync worker
//! retries each row with exponential backoff until it is delivered.
//!
//! The store serializes all access internally, so the main loop and the
//! sync worker share one [`Outbox`] value without further locking.

use std::{
    fmt::Display,
    path::Path,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::{params, Connection};

/// How many rows the outbox may hold before telemetry is purged.
pub const MAX_QUEUE_ITEMS: i64 = 50_000;

/// Retry ceiling in seconds for a failing row.
const BACKOFF_CAP_S: f64 = 600.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// The closed set of logical endpoints an event can be addressed to.
/// The sync worker maps each tag to its remote path.
pub enum Endpoint {
    /// Periodic sensor snapshots. The only purgeable endpoint: telemetry
    /// is voluminous and a lost point costs one sample, while every other
    /// endpoint carries an irreplaceable business event.
    Telemetry,
    /// Badge presentations.
    NfcAuth,
    /// Alcohol test outcomes.
    Alcohol,
    /// Safety alerts (alcohol fail, fatigue, gas, temperature).
    Alert,
    /// Trip start records.
    TripOpen,
    /// Trip end records.
    TripClose,
    /// Device health reports.
    Health,
}

impl Endpoint {
    /// All endpoints, in no particular order.
    pub const ALL: [Endpoint; 7] = [
        Endpoint::Telemetry,
        Endpoint::NfcAuth,
        Endpoint::Alcohol,
        Endpoint::Alert,
        Endpoint::TripOpen,
        Endpoint::TripClose,
        Endpoint::Health,
    ];

    #[must_use]
    /// The tag stored in the `endpoint` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Telemetry => "telemetry",
            Endpoint::NfcAuth => "nfc_auth",
            Endpoint::Alcohol => "alcohol",
            Endpoint::Alert => "alert",
            Endpoint::TripOpen => "trip_open",
            Endpoint::TripClose => "trip_close",
            Endpoint::Health => "health",
        }
    }

    #[must_use]
    /// Parse a stored tag back into an endpoint.
    /// Returns `None` for a tag outside the closed set, which the sync
    /// worker treats as a poisoned row.
    pub fn parse(tag: &str) -> Option<Endpoint> {
        Endpoint::ALL.into_iter().find(|e| e.as_str() == tag)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
/// One row eligible for delivery, as returned by `dequeue_batch`.
pub struct PendingItem {
    /// The row id, monotonically assigned on insert.
    pub id: i64,
    /// The raw endpoint tag. Kept as text so a row written by a newer
    /// firmware does not wedge the queue of an older one.
    pub endpoint: String,
    /// The payload JSON text exactly as enqueued.
    pub payload: String,
    /// How many delivery attempts have failed so far.
    pub retry_count: i64,
}

#[derive(Debug, PartialEq, Eq)]
/// A cached badge-to-driver mapping.
pub struct BadgeCacheEntry {
    /// The driver the badge belongs to.
    pub driver_id: String,
    /// A display name for the driver.
    pub driver_name: String,
}

#[derive(Debug)]
/// The set of errors the store can produce.
pub enum Error {
    /// The underlying SQLite call failed.
    Sqlite(rusqlite::Error),
    /// The store's internal lock was poisoned.
    Poison,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Sqlite(e) => write!(f, "SQLite error: {e}"),
            Error::Poison => write!(f, "outbox lock poisoned"),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err)
    }
}

/// The durable store. One value is shared by reference between the main
/// loop (producer) and the sync worker (consumer).
pub struct Outbox {
    conn: Mutex<Connection>,
}

impl Outbox {
    /// Open (or create) the store at `path` and apply the schema.
    ///
    /// Any rows found in the legacy `telemetry_queue` table are migrated
    /// into the outbox under the `telemetry` endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot
    /// be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Outbox, Error> {
        let conn = Connection::open(path)?;
        Outbox::setup(conn)
    }

    /// Open an in-memory store. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Outbox, Error> {
        let conn = Connection::open_in_memory()?;
        Outbox::setup(conn)
    }

    fn setup(conn: Connection) -> Result<Outbox, Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL NOT NULL,
                endpoint TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER DEFAULT 0,
                next_retry_at REAL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS badge_cache (
                uid_hash TEXT PRIMARY KEY,
                driver_id TEXT,
                driver_name TEXT,
                cached_at REAL
            );

            CREATE TABLE IF NOT EXISTS telemetry_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL
            );",
        )?;

        // migrate any rows left behind by the single-endpoint firmware
        let old_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM telemetry_queue", [], |row| row.get(0))?;
        if old_count > 0 {
            conn.execute(
                "INSERT INTO outbox (ts, endpoint, payload, retry_count, next_retry_at)
                 SELECT 0, 'telemetry', payload, 0, 0 FROM telemetry_queue",
                [],
            )?;
            conn.execute("DELETE FROM telemetry_queue", [])?;
            log::info!("migrated {old_count} legacy telemetry rows into the outbox");
        }

        Ok(Outbox {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new event addressed to `endpoint`.
    /// The row becomes eligible for delivery immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails or the lock is poisoned.
    pub fn enqueue(&self, endpoint: Endpoint, payload: &serde_json::Value) -> Result<(), Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        conn.execute(
            "INSERT INTO outbox(ts, endpoint, payload) VALUES (?1, ?2, ?3)",
            params![wall_seconds(), endpoint.as_str(), payload.to_string()],
        )?;
        Ok(())
    }

    /// Return up to `limit` rows whose retry time has come, ordered by
    /// ascending id. Rows are neither locked nor removed; the caller must
    /// `mark_sent` or `mark_failed` each one.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the lock is poisoned.
    pub fn dequeue_batch(&self, limit: usize) -> Result<Vec<PendingItem>, Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        let mut stmt = conn.prepare(
            "SELECT id, endpoint, payload, retry_count FROM outbox
             WHERE next_retry_at <= ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![wall_seconds(), limit as i64], |row| {
            Ok(PendingItem {
                id: row.get(0)?,
                endpoint: row.get(1)?,
                payload: row.get(2)?,
                retry_count: row.get(3)?,
            })
        })?;

        let mut batch = Vec::new();
        for item in rows {
            batch.push(item?);
        }
        Ok(batch)
    }

    /// Delete acknowledged rows. Deleting an id twice (or an id that never
    /// existed) is a no-op, so replays after a crash are harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails or the lock is poisoned.
    pub fn mark_sent(&self, ids: &[i64]) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM outbox WHERE id IN ({placeholders})");
        conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Record a failed delivery attempt: increment the retry counter and
    /// push the row's next eligibility to
    /// `now + min(5 * 2^retry_count, 600)` seconds.
    ///
    /// Returns the new retry count, or 0 if the row no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or the lock is poisoned.
    pub fn mark_failed(&self, id: i64) -> Result<i64, Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        let retries: i64 = match conn.query_row(
            "SELECT retry_count FROM outbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let retries = retries + 1;
        #[allow(clippy::cast_precision_loss)]
        let delay = (5.0 * f64::powi(2.0, retries.min(30) as i32)).min(BACKOFF_CAP_S);
        conn.execute(
            "UPDATE outbox SET retry_count = ?1, next_retry_at = ?2 WHERE id = ?3",
            params![retries, wall_seconds() + delay, id],
        )?;
        Ok(retries)
    }

    /// Drop a row outright. Used for poisoned rows whose retry count has
    /// exceeded the operational limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails or the lock is poisoned.
    pub fn drop_row(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// The total number of rows waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails or the lock is poisoned.
    pub fn queue_size(&self) -> Result<i64, Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        Ok(conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?)
    }

    /// If the store holds more than `max_items` rows, delete the oldest
    /// `telemetry` rows until it does not. Rows on every other endpoint
    /// are never purged.
    ///
    /// Returns how many rows were deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails or the lock is poisoned.
    pub fn purge_old(&self, max_items: i64) -> Result<i64, Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        if total <= max_items {
            return Ok(0);
        }
        let excess = total - max_items;
        let purged = conn.execute(
            "DELETE FROM outbox WHERE id IN
             (SELECT id FROM outbox WHERE endpoint = 'telemetry'
              ORDER BY id ASC LIMIT ?1)",
            params![excess],
        )?;
        if purged > 0 {
            log::warn!("outbox over {max_items} rows, purged {purged} oldest telemetry rows");
        }
        Ok(purged as i64)
    }

    /// Remember (or refresh) a badge-to-driver mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails or the lock is poisoned.
    pub fn cache_badge(
        &self,
        uid_hash: &str,
        driver_id: &str,
        driver_name: &str,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        conn.execute(
            "INSERT OR REPLACE INTO badge_cache
             (uid_hash, driver_id, driver_name, cached_at) VALUES (?1, ?2, ?3, ?4)",
            params![uid_hash, driver_id, driver_name, wall_seconds()],
        )?;
        Ok(())
    }

    /// Look up a badge hash in the local cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the lock is poisoned.
    pub fn lookup_badge(&self, uid_hash: &str) -> Result<Option<BadgeCacheEntry>, Error> {
        let conn = self.conn.lock().map_err(|_| Error::Poison)?;
        match conn.query_row(
            "SELECT driver_id, driver_name FROM badge_cache WHERE uid_hash = ?1",
            params![uid_hash],
            |row| {
                Ok(BadgeCacheEntry {
                    driver_id: row.get(0)?,
                    driver_name: row.get(1)?,
                })
            },
        ) {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
impl Outbox {
    /// Insert a raw row, bypassing the typed API. Lets tests model disk
    /// corruption and rows written by other firmware versions.
    pub(crate) fn inject_raw(&self, endpoint: &str, payload: &str, retry_count: i64) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outbox(ts, endpoint, payload, retry_count) VALUES (?1, ?2, ?3, ?4)",
            params![wall_seconds(), endpoint, payload, retry_count],
        )
        .unwrap();
    }
}

/// Wall time as seconds since the UNIX epoch.
fn wall_seconds() -> f64 {
    // we trust that this code was run after January 1st, 1970
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    /// Test that rows come back in insertion order and survive until
    /// acknowledged.
    fn fifo_and_ack() {
        let outbox = Outbox::open_in_memory().unwrap();
        for n in 0..5 {
            outbox
                .enqueue(Endpoint::Telemetry, &json!({ "n": n }))
                .unwrap();
        }
        assert_eq!(outbox.queue_size().unwrap(), 5);

        let batch = outbox.dequeue_batch(50).unwrap();
        assert_eq!(batch.len(), 5);
        let ids: Vec<i64> = batch.iter().map(|item| item.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        // dequeue does not remove
        assert_eq!(outbox.queue_size().unwrap(), 5);

        outbox.mark_sent(&ids[..2]).unwrap();
        assert_eq!(outbox.queue_size().unwrap(), 3);

        // acknowledging the same ids twice is a no-op
        outbox.mark_sent(&ids[..2]).unwrap();
        assert_eq!(outbox.queue_size().unwrap(), 3);
    }

    #[test]
    /// Test that the k-th consecutive failure schedules the retry at
    /// `now + min(5 * 2^k, 600)` seconds.
    fn backoff_schedule() {
        let outbox = Outbox::open_in_memory().unwrap();
        outbox.enqueue(Endpoint::Alert, &json!({})).unwrap();
        let id = outbox.dequeue_batch(1).unwrap()[0].id;

        for k in 1..=10 {
            let before = wall_seconds();
            let retries = outbox.mark_failed(id).unwrap();
            assert_eq!(retries, k);

            let next_retry_at: f64 = {
                let conn = outbox.conn.lock().unwrap();
                conn.query_row(
                    "SELECT next_retry_at FROM outbox WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .unwrap()
            };
            #[allow(clippy::cast_precision_loss)]
            let expected = f64::min(5.0 * f64::powi(2.0, k as i32), 600.0);
            let offset = next_retry_at - before;
            assert!(
                (offset - expected).abs() < 1.0,
                "failure {k}: expected backoff {expected}, got {offset}"
            );
        }

        // a failed row is no longer eligible
        assert!(outbox.dequeue_batch(50).unwrap().is_empty());
    }

    #[test]
    /// Test that failing a row that was already acknowledged is harmless.
    fn fail_after_ack() {
        let outbox = Outbox::open_in_memory().unwrap();
        outbox.enqueue(Endpoint::Health, &json!({})).unwrap();
        let id = outbox.dequeue_batch(1).unwrap()[0].id;
        outbox.mark_sent(&[id]).unwrap();
        assert_eq!(outbox.mark_failed(id).unwrap(), 0);
    }

    #[test]
    /// Test that the purge only ever drops telemetry, oldest first.
    fn purge_preserves_events() {
        let outbox = Outbox::open_in_memory().unwrap();
        outbox.enqueue(Endpoint::Telemetry, &json!({"n": 0})).unwrap();
        outbox.enqueue(Endpoint::TripOpen, &json!({})).unwrap();
        outbox.enqueue(Endpoint::Telemetry, &json!({"n": 1})).unwrap();
        outbox.enqueue(Endpoint::Alert, &json!({})).unwrap();
        outbox.enqueue(Endpoint::Telemetry, &json!({"n": 2})).unwrap();

        let purged = outbox.purge_old(3).unwrap();
        assert_eq!(purged, 2);
        assert_eq!(outbox.queue_size().unwrap(), 3);

        let remaining = outbox.dequeue_batch(50).unwrap();
        let endpoints: Vec<&str> = remaining.iter().map(|i| i.endpoint.as_str()).collect();
        assert_eq!(endpoints, ["trip_open", "alert", "telemetry"]);
        // the surviving telemetry row is the newest one
        assert!(remaining[2].payload.contains("\"n\":2"));

        // under the cap, the purge is a no-op
        assert_eq!(outbox.purge_old(3).unwrap(), 0);
    }

    #[test]
    /// Test that legacy telemetry_queue rows are re-homed at open.
    fn migrates_legacy_queue() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE telemetry_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL
            );
            INSERT INTO telemetry_queue(payload) VALUES ('{\"points\":[]}');
            INSERT INTO telemetry_queue(payload) VALUES ('{\"points\":[1]}');",
        )
        .unwrap();

        let outbox = Outbox::setup(conn).unwrap();
        assert_eq!(outbox.queue_size().unwrap(), 2);

        let batch = outbox.dequeue_batch(50).unwrap();
        assert!(batch.iter().all(|item| item.endpoint == "telemetry"));

        // the legacy table is emptied so reopening does not duplicate
        let conn = outbox.conn.lock().unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM telemetry_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    /// Test that a file-backed store loses nothing across a reopen, as
    /// after a crash mid-trip.
    fn survives_reopen() {
        let path = std::env::temp_dir().join(format!("roadkit-outbox-{}.sqlite3", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let outbox = Outbox::open(&path).unwrap();
            outbox.enqueue(Endpoint::TripOpen, &json!({"n": 1})).unwrap();
            outbox.enqueue(Endpoint::Telemetry, &json!({"n": 2})).unwrap();
            outbox.mark_failed(outbox.dequeue_batch(1).unwrap()[0].id).unwrap();
        }

        let outbox = Outbox::open(&path).unwrap();
        assert_eq!(outbox.queue_size().unwrap(), 2);
        // the backed-off row kept its retry state
        let conn = outbox.conn.lock().unwrap();
        let retries: i64 = conn
            .query_row(
                "SELECT retry_count FROM outbox WHERE endpoint = 'trip_open'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(retries, 1);
        drop(conn);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    /// Test the badge cache round trip.
    fn badge_cache() {
        let outbox = Outbox::open_in_memory().unwrap();
        assert_eq!(outbox.lookup_badge("abcd").unwrap(), None);

        outbox.cache_badge("abcd", "D42", "Alice").unwrap();
        assert_eq!(
            outbox.lookup_badge("abcd").unwrap(),
            Some(BadgeCacheEntry {
                driver_id: "D42".into(),
                driver_name: "Alice".into(),
            })
        );

        // refresh overwrites
        outbox.cache_badge("abcd", "D42", "Alice B.").unwrap();
        assert_eq!(
            outbox.lookup_badge("abcd").unwrap().unwrap().driver_name,
            "Alice B."
        );
    }

    #[test]
    /// Test that every endpoint tag parses back to itself.
    fn endpoint_tags() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::parse(endpoint.as_str()), Some(endpoint));
        }
        assert_eq!(Endpoint::parse("bogus"), None);
    }
}
