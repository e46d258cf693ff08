//! HTTP fetch utilities and record-store seams for earlybird.
//!
//! The job and user stores are collaborator interfaces: the production
//! deployment backs them with a hosted database, while tests and the CLI
//! use the in-memory implementations defined here.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use earlybird_core::{Job, UserRecord};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "earlybird-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given zero-based failed attempt,
    /// doubling from the base and saturating at the cap.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16) as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-timeout GET client with retry classification and exponential
/// backoff. Single logical flow per run, so there is no internal
/// concurrency gating here; admission control belongs to the host.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut attempt = 0;
        loop {
            match self.attempt_get(url).await {
                Ok(response) => return Ok(response),
                Err(err) if retryable(&err) && attempt < self.backoff.max_retries => {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

fn retryable(err: &FetchError) -> bool {
    let disposition = match err {
        FetchError::Request(inner) => classify_reqwest_error(inner),
        FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
            .map(classify_status)
            .unwrap_or(RetryDisposition::NonRetryable),
    };
    disposition == RetryDisposition::Retryable
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Insert-or-update record store keyed by the job content hash.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert(&self, job: &Job) -> Result<UpsertOutcome, StoreError>;

    /// Active jobs first seen within the recency window, newest first.
    async fn recent_active(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;
}

/// Subscriber retrieval for the delivery loop.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Verified, actively subscribed users who signed up before the
    /// cutoff, newest signup first.
    async fn eligible_users(
        &self,
        signed_up_before: DateTime<Utc>,
    ) -> Result<Vec<UserRecord>, StoreError>;
}

/// Hash-addressed in-memory job store. Re-sighting an existing hash
/// refreshes `last_seen_at`, `is_active` and `run_id` only; first-sight
/// fields are preserved so freshness tiers stay anchored.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    pub async fn get(&self, hash: &str) -> Option<Job> {
        self.jobs.lock().await.get(hash).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert(&self, job: &Job) -> Result<UpsertOutcome, StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job.hash) {
            Some(existing) => {
                existing.last_seen_at = job.last_seen_at;
                existing.is_active = job.is_active;
                existing.run_id = job.run_id;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                jobs.insert(job.hash.clone(), job.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn recent_active(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.is_active && job.created_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: Vec<UserRecord>,
}

impl InMemoryUserStore {
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn eligible_users(
        &self,
        signed_up_before: DateTime<Utc>,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let mut eligible: Vec<UserRecord> = self
            .users
            .iter()
            .filter(|user| {
                user.email_verified
                    && user.subscription_active
                    && user.created_at < signed_up_before
            })
            .cloned()
            .collect();
        eligible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(eligible)
    }
}
