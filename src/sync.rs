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

//! The sync worker: drains the outbox to the cloud API.
//!
//! One dedicated thread wakes every few seconds, pulls a batch of
//! eligible rows in id order and POSTs them one by one. A 2xx deletes
//! the row; anything else backs the row off and ends the pass, so a
//! degraded server sees one request per interval instead of a flood,
//! and recovery always resumes at the head of the line.

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::{Duration, SystemTime},
};

use crate::{
    outbox::{Endpoint, Outbox, MAX_QUEUE_ITEMS},
    stop::StopToken,
};

/// HTTP transport timeout for one delivery attempt.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A row that cannot be delivered because its own content is broken is
/// dropped once it has failed this many times.
pub const POISON_RETRY_LIMIT: i64 = 20;

/// The worker counts as offline after this many consecutive failures.
const OFFLINE_AFTER_FAILS: u32 = 3;

/// The remote path an endpoint tag maps to.
#[must_use]
pub fn remote_path(endpoint: Endpoint) -> &'static str {
    match endpoint {
        Endpoint::Telemetry => "/v1/ingest/telemetry",
        Endpoint::NfcAuth => "/v1/ingest/nfc_auth",
        Endpoint::Alcohol => "/v1/ingest/alcohol_test",
        Endpoint::Alert => "/v1/ingest/alert",
        Endpoint::TripOpen => "/v1/trips/open",
        Endpoint::TripClose => "/v1/trips/close",
        Endpoint::Health => "/v1/device/health",
    }
}

#[derive(Debug)]
/// Why one delivery attempt did not succeed.
pub enum PostError {
    /// The server answered with a non-2xx status.
    Status(u16),
    /// The request never completed (connect, timeout, TLS, ...).
    Transport(String),
}

impl Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostError::Status(code) => write!(f, "server answered {code}"),
            PostError::Transport(message) => write!(f, "transport error: {message}"),
        }
    }
}

/// The authenticated HTTP client, shared between the sync thread (which
/// posts) and the main loop (which reads the health indicators for the
/// panel).
pub struct ApiClient {
    base_url: String,
    kit_serial: String,
    kit_key: String,
    client: reqwest::blocking::Client,
    last_ok: Mutex<Option<SystemTime>>,
    consecutive_fails: AtomicU32,
}

impl ApiClient {
    /// Construct a client for the given API root.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: &str, kit_serial: &str, kit_key: &str) -> Result<ApiClient, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(ApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            kit_serial: kit_serial.to_string(),
            kit_key: kit_key.to_string(),
            client,
            last_ok: Mutex::new(None),
            consecutive_fails: AtomicU32::new(0),
        })
    }

    /// POST one payload to the endpoint's remote path.
    ///
    /// # Errors
    ///
    /// Returns an error for any non-2xx answer or transport failure; the
    /// failure is also counted into the online indicator.
    pub fn post(&self, endpoint: Endpoint, payload_json: &str) -> Result<(), PostError> {
        let url = format!("{}{}", self.base_url, remote_path(endpoint));
        let outcome = self
            .client
            .post(url)
            .header("X-Kit-Serial", &self.kit_serial)
            .header("X-Kit-Key", &self.kit_key)
            .header("Content-Type", "application/json")
            .body(payload_json.to_string())
            .send();

        match outcome {
            Ok(response) if response.status().is_success() => {
                *self
                    .last_ok
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(SystemTime::now());
                self.consecutive_fails.store(0, Ordering::SeqCst);
                Ok(())
            }
            Ok(response) => {
                self.consecutive_fails.fetch_add(1, Ordering::SeqCst);
                Err(PostError::Status(response.status().as_u16()))
            }
            Err(e) => {
                self.consecutive_fails.fetch_add(1, Ordering::SeqCst);
                Err(PostError::Transport(e.to_string()))
            }
        }
    }

    #[must_use]
    /// When the last successful delivery happened.
    pub fn last_ok_time(&self) -> Option<SystemTime> {
        *self
            .last_ok
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    /// How many deliveries in a row have failed.
    pub fn consecutive_fails(&self) -> u32 {
        self.consecutive_fails.load(Ordering::SeqCst)
    }

    #[must_use]
    /// Whether the kit currently considers itself connected.
    pub fn is_online(&self) -> bool {
        self.consecutive_fails() < OFFLINE_AFTER_FAILS
    }
}

/// The sync thread body: run passes until stopped, sleeping `interval`
/// between them on the stop token so shutdown wakes it immediately.
pub fn sync_loop(
    outbox: &Outbox,
    api: &ApiClient,
    batch_size: usize,
    interval: Duration,
    stop: &StopToken,
) {
    log::info!("sync worker up, interval {interval:?}, batch {batch_size}");
    while !stop.is_stopped() {
        if let Err(e) = sync_pass(outbox, api, batch_size) {
            log::warn!("sync pass aborted: {e}");
        }
        if stop.wait_timeout(interval) {
            break;
        }
    }
    log::info!("sync worker stopped");
}

/// One pass: purge, dequeue, deliver in id order until the first remote
/// failure.
///
/// Rows that cannot even be attempted (unknown endpoint tag, payload no
/// longer valid JSON) are backed off like remote failures so they cannot
/// stall the queue, but they do not end the pass: they say nothing about
/// the server. Past [`POISON_RETRY_LIMIT`] failures such a row is
/// dropped.
///
/// # Errors
///
/// Returns an error only if the store itself fails.
pub fn sync_pass(
    outbox: &Outbox,
    api: &ApiClient,
    batch_size: usize,
) -> Result<(), crate::outbox::Error> {
    outbox.purge_old(MAX_QUEUE_ITEMS)?;

    for item in outbox.dequeue_batch(batch_size)? {
        let endpoint = Endpoint::parse(&item.endpoint);
        let payload_ok = serde_json::from_str::<serde_json::Value>(&item.payload).is_ok();

        let Some(endpoint) = endpoint.filter(|_| payload_ok) else {
            let retries = outbox.mark_failed(item.id)?;
            log::warn!(
                "outbox row {} (endpoint {:?}) is undeliverable, failure {retries}",
                item.id,
                item.endpoint
            );
            if retries > POISON_RETRY_LIMIT {
                log::warn!("dropping poisoned outbox row {}", item.id);
                outbox.drop_row(item.id)?;
            }
            continue;
        };

        match api.post(endpoint, &item.payload) {
            Ok(()) => outbox.mark_sent(&[item.id])?,
            Err(e) => {
                log::warn!("delivery of row {} to {endpoint} failed: {e}", item.id);
                outbox.mark_failed(item.id)?;
                break;
            }
        }
    }
    Ok(())
}
