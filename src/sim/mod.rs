//! Load simulator
//!
//! Drives a running API the way a client session does: create a ride,
//! wait a random moment, read it straight back, wait again. A read that
//! comes back 404 right after its create would be a read-your-writes
//! violation and is logged as such.

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::common::Result;

pub const MIN_DISTANCE: f64 = 5.0;
pub const MAX_DISTANCE: f64 = 1000.0;

/// Longest random pause, in seconds
const MAX_PAUSE_SECS: f64 = 2.0;

#[derive(Debug, Deserialize)]
struct Created {
    id: i64,
}

/// What one create-then-read round observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Round {
    /// Read returned the ride just written
    Consistent { id: i64 },
    /// Read did not find the ride just written
    Stale { id: i64 },
    /// Create failed; no read issued
    Rejected { status: u16 },
    /// Read failed for another reason
    ReadFailed { id: i64, status: u16 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub consistent: u64,
    pub stale: u64,
    pub rejected: u64,
    pub read_failed: u64,
}

impl Summary {
    fn record(&mut self, round: &Round) {
        match round {
            Round::Consistent { .. } => self.consistent += 1,
            Round::Stale { .. } => self.stale += 1,
            Round::Rejected { .. } => self.rejected += 1,
            Round::ReadFailed { .. } => self.read_failed += 1,
        }
    }
}

pub struct Simulator {
    client: Client,
    base_url: String,
    credential: String,
    pause: bool,
}

impl Simulator {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
            pause: true,
        }
    }

    /// Simulator for an API on localhost
    pub fn local(port: u16, credential: impl Into<String>) -> Self {
        Self::new(format!("http://localhost:{}", port), credential)
    }

    /// Skip the random pauses between requests.
    pub fn without_pauses(mut self) -> Self {
        self.pause = false;
        self
    }

    /// Run `iterations` rounds, or forever when `None`.
    pub async fn run(&self, iterations: Option<u64>) -> Summary {
        let mut summary = Summary::default();
        let mut done = 0;
        while iterations.map_or(true, |n| done < n) {
            match self.run_once().await {
                Ok(round) => summary.record(&round),
                Err(e) => error!(error = %e, "Round failed"),
            }
            done += 1;
            self.sleep().await;
        }
        summary
    }

    /// Create one ride and read it back.
    pub async fn run_once(&self) -> Result<Round> {
        let distance = rand::thread_rng().gen_range(MIN_DISTANCE..MAX_DISTANCE);
        let response = self
            .client
            .post(format!("{}/rides", self.base_url))
            .header("Authorization", &self.credential)
            .form(&[("distance", distance.to_string())])
            .send()
            .await
            .map_err(|e| crate::Error::Other(format!("create request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!(status = status.as_u16(), body = %body, "Create response");
        if status != StatusCode::CREATED {
            warn!(status = status.as_u16(), "Ride not created, skipping read");
            return Ok(Round::Rejected {
                status: status.as_u16(),
            });
        }
        let created: Created = serde_json::from_str(&body)
            .map_err(|e| crate::Error::Other(format!("unexpected create body: {}", e)))?;

        self.sleep().await;

        let response = self
            .client
            .get(format!("{}/rides/{}", self.base_url, created.id))
            .header("Authorization", &self.credential)
            .send()
            .await
            .map_err(|e| crate::Error::Other(format!("read request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!(status = status.as_u16(), body = %body, "Read response");

        Ok(match status {
            StatusCode::OK => Round::Consistent { id: created.id },
            StatusCode::NOT_FOUND => {
                error!(ride = created.id, "Read did not observe own write");
                Round::Stale { id: created.id }
            }
            other => Round::ReadFailed {
                id: created.id,
                status: other.as_u16(),
            },
        })
    }

    async fn sleep(&self) {
        if !self.pause {
            return;
        }
        let secs = rand::thread_rng().gen::<f64>() * MAX_PAUSE_SECS;
        info!("Sleeping for {:.3}s", secs);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}
