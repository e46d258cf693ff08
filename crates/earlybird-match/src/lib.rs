//! Matching and delivery: AI-assisted ranking with a deterministic
//! heuristic fallback, email transport and the paced per-subscriber
//! delivery loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use earlybird_core::{
    Job, MatchSession, MatchStrategy, RemotePreference, UserPreferences, UserRecord,
    WorkEnvironment,
};
use earlybird_store::{JobStore, UserStore};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "earlybird-match";

/// Role-affinity floor below which a title similarity contributes nothing.
const ROLE_AFFINITY_FLOOR: f64 = 0.7;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oracle returned status {0}")]
    HttpStatus(StatusCode),
    #[error("oracle response malformed: {0}")]
    Malformed(String),
}

/// Ranks a job corpus for one subscriber, returning job hashes in
/// preference order. Implementations may return hashes outside the
/// corpus; callers must drop them.
#[async_trait]
pub trait MatchOracle: Send + Sync {
    async fn rank(&self, prefs: &UserPreferences, corpus: &[Job]) -> Result<Vec<String>, OracleError>;
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    /// Largest number of postings offered to the model per subscriber.
    pub max_candidates: usize,
    pub timeout: StdDuration,
}

impl OracleConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            max_candidates: 40,
            timeout: StdDuration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Chat-completions backed oracle. Sends a compact candidate listing and
/// expects a JSON array of hashes back, best match first.
pub struct ChatOracle {
    config: OracleConfig,
    client: reqwest::Client,
}

impl ChatOracle {
    pub fn new(config: OracleConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn build_prompt(&self, prefs: &UserPreferences, corpus: &[Job]) -> String {
        let mut prompt = String::from(
            "Rank these job postings for an early-career candidate, best match first.\n",
        );
        prompt.push_str(&format!(
            "Candidate: roles {:?}; target cities {:?}; languages {:?}; remote preference {:?}.\n",
            prefs.roles_selected,
            prefs.target_cities,
            prefs.languages_spoken,
            prefs.remote_preference,
        ));
        prompt.push_str("Postings (hash | title | company | location | career):\n");
        for job in corpus.iter().take(self.config.max_candidates) {
            prompt.push_str(&format!(
                "{} | {} | {} | {} | {}\n",
                job.hash,
                job.title,
                job.company,
                job.location,
                job.categories.career.slug(),
            ));
        }
        prompt.push_str(
            "Reply with only a JSON array of posting hashes from the list above, best first.",
        );
        prompt
    }

    /// Pulls a JSON string array out of a model reply that may carry
    /// surrounding prose or code fences.
    fn parse_hashes(content: &str) -> Result<Vec<String>, OracleError> {
        let start = content.find('[');
        let end = content.rfind(']');
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if s < e => (s, e),
            _ => {
                return Err(OracleError::Malformed(
                    "no JSON array in reply".to_string(),
                ))
            }
        };
        serde_json::from_str(&content[start..=end])
            .map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl MatchOracle for ChatOracle {
    async fn rank(&self, prefs: &UserPreferences, corpus: &[Job]) -> Result<Vec<String>, OracleError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: self.build_prompt(prefs, corpus),
            }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::HttpStatus(status));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        let content = reply
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| OracleError::Malformed("no choices in reply".to_string()))?;
        Self::parse_hashes(content)
    }
}

/// Deterministic heuristic ranking. Pure: the corpus is never mutated and
/// identical inputs always produce identical orderings.
pub fn rank_fallback(prefs: &UserPreferences, corpus: &[Job]) -> Vec<Job> {
    let mut scored: Vec<(f64, &Job)> = corpus
        .iter()
        .map(|job| (heuristic_score(prefs, job), job))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.posted_at.cmp(&a.1.posted_at))
            .then_with(|| a.1.hash.cmp(&b.1.hash))
    });
    scored.into_iter().map(|(_, job)| job.clone()).collect()
}

pub fn heuristic_score(prefs: &UserPreferences, job: &Job) -> f64 {
    let title = job.title.to_lowercase();
    let mut score = 0.0;

    // A literal role hit in the title counts as full affinity; fuzzy
    // similarity covers reworded titles.
    let role_affinity = prefs
        .roles_selected
        .iter()
        .map(|role| {
            let role = role.to_lowercase();
            if title.contains(&role) {
                1.0
            } else {
                jaro_winkler(&role, &title)
            }
        })
        .fold(0.0, f64::max);
    if role_affinity >= ROLE_AFFINITY_FLOOR {
        score += 3.0 * role_affinity;
    }

    let location = job.location.to_lowercase();
    if prefs.target_cities.iter().any(|city| {
        let city = city.to_lowercase();
        location.contains(&city) || job.categories.location.slug() == city
    }) {
        score += 2.0;
    }

    score += match (prefs.remote_preference, job.work_environment) {
        (RemotePreference::Any, _) => 0.5,
        (RemotePreference::Remote, WorkEnvironment::Remote)
        | (RemotePreference::Hybrid, WorkEnvironment::Hybrid)
        | (RemotePreference::Onsite, WorkEnvironment::Onsite) => 1.5,
        _ => 0.0,
    };

    if prefs.languages_spoken.iter().any(|lang| {
        job.language_requirements
            .iter()
            .any(|req| req.eq_ignore_ascii_case(lang))
    }) {
        score += 1.0;
    }

    if job.categories.career_resolved() {
        score += 0.5;
    }

    score
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub jobs: Vec<Job>,
    pub strategy: MatchStrategy,
}

/// Per-subscriber matcher. The oracle is optional; without one every
/// subscriber takes the heuristic path with strategy `fallback`.
pub struct MatchingEngine {
    oracle: Option<Box<dyn MatchOracle>>,
}

impl MatchingEngine {
    pub fn new(oracle: Option<Box<dyn MatchOracle>>) -> Self {
        Self { oracle }
    }

    pub fn heuristic_only() -> Self {
        Self::new(None)
    }

    /// Produces at most the subscriber's tier cap, drawn from `corpus`.
    /// Exactly one strategy is reported per call: `ai_success` when the
    /// oracle yields at least one usable hash, `ai_failed` when the
    /// oracle call errors, `fallback` otherwise.
    pub async fn match_jobs(&self, user: &UserRecord, corpus: &[Job]) -> MatchResult {
        let prefs = UserPreferences::from_record(user);
        let (mut jobs, strategy) = match &self.oracle {
            Some(oracle) => match oracle.rank(&prefs, corpus).await {
                Ok(hashes) => {
                    let picked = Self::resolve_hashes(&hashes, corpus);
                    if picked.is_empty() {
                        (rank_fallback(&prefs, corpus), MatchStrategy::Fallback)
                    } else {
                        (picked, MatchStrategy::AiSuccess)
                    }
                }
                Err(err) => {
                    warn!(user = %user.email, error = %err, "oracle ranking failed; using heuristic");
                    (rank_fallback(&prefs, corpus), MatchStrategy::AiFailed)
                }
            },
            None => (rank_fallback(&prefs, corpus), MatchStrategy::Fallback),
        };
        jobs.truncate(user.subscription_tier.max_matches());
        MatchResult { jobs, strategy }
    }

    /// Keeps oracle hashes that exist in the corpus, in oracle order,
    /// first occurrence wins.
    fn resolve_hashes(hashes: &[String], corpus: &[Job]) -> Vec<Job> {
        let by_hash: HashMap<&str, &Job> =
            corpus.iter().map(|job| (job.hash.as_str(), job)).collect();
        let mut seen = HashSet::new();
        hashes
            .iter()
            .filter(|hash| seen.insert(hash.as_str()))
            .filter_map(|hash| by_hash.get(hash.as_str()).map(|job| (*job).clone()))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("email request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("email API returned status {0}")]
    HttpStatus(StatusCode),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_matches(&self, user: &UserRecord, jobs: &[Job]) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub timeout: StdDuration,
}

impl EmailConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.resend.com/emails".to_string(),
            api_key: api_key.into(),
            from: "EarlyBird <digest@earlybird.jobs>".to_string(),
            timeout: StdDuration::from_secs(15),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    html: String,
}

/// Sends the match digest through an HTTP email API.
pub struct HttpEmailTransport {
    config: EmailConfig,
    client: reqwest::Client,
}

impl HttpEmailTransport {
    pub fn new(config: EmailConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

pub fn digest_subject(jobs: &[Job]) -> String {
    format!("{} new early-career matches for you", jobs.len())
}

pub fn render_digest(user: &UserRecord, jobs: &[Job]) -> String {
    let mut html = format!("<p>Hi {},</p><ul>", user.full_name);
    for job in jobs {
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a> at {} ({})</li>",
            job.url, job.title, job.company, job.location
        ));
    }
    html.push_str("</ul>");
    html
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send_matches(&self, user: &UserRecord, jobs: &[Job]) -> Result<(), TransportError> {
        let payload = EmailPayload {
            from: &self.config.from,
            to: &user.email,
            subject: digest_subject(jobs),
            html: render_digest(user, jobs),
        };
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status));
        }
        Ok(())
    }
}

/// Logs the digest instead of sending it. Used for dry runs.
#[derive(Debug, Default)]
pub struct LogEmailTransport;

#[async_trait]
impl EmailTransport for LogEmailTransport {
    async fn send_matches(&self, user: &UserRecord, jobs: &[Job]) -> Result<(), TransportError> {
        info!(
            user = %user.email,
            matches = jobs.len(),
            subject = %digest_subject(jobs),
            "dry-run email"
        );
        Ok(())
    }
}

/// Records match sessions for auditing. Failures here are logged and
/// never fail a delivery.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn record(&self, session: &MatchSession) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionSink {
    sessions: Mutex<Vec<MatchSession>>,
}

impl InMemorySessionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sessions(&self) -> Vec<MatchSession> {
        self.sessions.lock().await.clone()
    }
}

#[async_trait]
impl SessionSink for InMemorySessionSink {
    async fn record(&self, session: &MatchSession) -> anyhow::Result<()> {
        self.sessions.lock().await.push(session.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingSessionSink;

#[async_trait]
impl SessionSink for TracingSessionSink {
    async fn record(&self, session: &MatchSession) -> anyhow::Result<()> {
        info!(
            user = %session.user_id,
            strategy = session.strategy.as_str(),
            corpus_size = session.corpus_size,
            match_count = session.match_count,
            "match session"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Subscribers must have signed up at least this long ago.
    pub signup_cutoff: Duration,
    /// Age window for the job corpus.
    pub job_window: Duration,
    pub corpus_limit: usize,
    /// Pause between subscribers so the oracle and email API are not
    /// hammered.
    pub pacing: StdDuration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            signup_cutoff: Duration::hours(48),
            job_window: Duration::days(7),
            corpus_limit: 1000,
            pacing: StdDuration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub processed: usize,
    pub sent: usize,
    pub errors: usize,
}

/// Paced delivery over all eligible subscribers. One subscriber's
/// failure never aborts the run; a cooperative stop flag ends it early
/// between subscribers.
pub struct DeliveryRunner {
    jobs: Arc<dyn JobStore>,
    users: Arc<dyn UserStore>,
    engine: MatchingEngine,
    transport: Arc<dyn EmailTransport>,
    sessions: Arc<dyn SessionSink>,
    config: DeliveryConfig,
    stop: Arc<AtomicBool>,
}

impl DeliveryRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        users: Arc<dyn UserStore>,
        engine: MatchingEngine,
        transport: Arc<dyn EmailTransport>,
        sessions: Arc<dyn SessionSink>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            jobs,
            users,
            engine,
            transport,
            sessions,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle; setting it to true ends the run after the
    /// in-flight subscriber.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(&self) -> anyhow::Result<DeliverySummary> {
        let now = Utc::now();
        let users = self
            .users
            .eligible_users(now - self.config.signup_cutoff)
            .await?;
        let corpus = self
            .jobs
            .recent_active(now - self.config.job_window, self.config.corpus_limit)
            .await?;
        info!(
            subscribers = users.len(),
            corpus = corpus.len(),
            "starting delivery run"
        );

        let mut summary = DeliverySummary::default();
        if corpus.is_empty() {
            warn!("no recent active jobs; skipping delivery");
            return Ok(summary);
        }

        for user in &users {
            if self.stop.load(Ordering::SeqCst) {
                info!(
                    processed = summary.processed,
                    "stop requested; ending delivery run early"
                );
                break;
            }
            summary.processed += 1;
            match self.deliver_to(user, &corpus).await {
                Ok(true) => summary.sent += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(user = %user.email, error = %err, "delivery failed for subscriber");
                    summary.errors += 1;
                }
            }
            tokio::time::sleep(self.config.pacing).await;
        }

        info!(
            processed = summary.processed,
            sent = summary.sent,
            errors = summary.errors,
            "delivery run finished"
        );
        Ok(summary)
    }

    async fn deliver_to(&self, user: &UserRecord, corpus: &[Job]) -> anyhow::Result<bool> {
        let result = self.engine.match_jobs(user, corpus).await;

        let session = MatchSession {
            user_id: user.email.clone(),
            strategy: result.strategy,
            corpus_size: corpus.len(),
            match_count: result.jobs.len(),
            matched_at: Utc::now(),
        };
        if let Err(err) = self.sessions.record(&session).await {
            warn!(user = %user.email, error = %err, "failed to record match session");
        }

        if result.jobs.is_empty() {
            return Ok(false);
        }
        self.transport.send_matches(user, &result.jobs).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use earlybird_core::{
        CareerPath, ExperienceLevel, FreshnessTier, JobCategories, LocationBucket,
        ProfessionalExperience, SubscriptionTier,
    };
    use earlybird_store::{InMemoryJobStore, InMemoryUserStore, UpsertOutcome};
    use uuid::Uuid;

    fn job(hash: &str, title: &str, location: &str, days_old: i64) -> Job {
        let now = Utc::now();
        let posted_at = now - Duration::days(days_old);
        Job {
            hash: hash.to_string(),
            title: title.to_string(),
            company: "Acme".to_string(),
            location: location.to_string(),
            url: format!("https://example.com/{hash}"),
            description: title.to_string(),
            experience: ExperienceLevel::EarlyCareer,
            work_environment: WorkEnvironment::Remote,
            source: "remoteok".to_string(),
            categories: JobCategories::new(CareerPath::Tech, LocationBucket::EuRemote),
            company_profile_url: "https://acme.com".to_string(),
            language_requirements: vec!["English".to_string()],
            scraped_at: now,
            original_posted_at: posted_at,
            posted_at,
            last_seen_at: now,
            created_at: now,
            is_active: true,
            freshness_tier: FreshnessTier::Fresh,
            run_id: Uuid::new_v4(),
        }
    }

    fn user(email: &str, tier: SubscriptionTier) -> UserRecord {
        UserRecord {
            email: email.to_string(),
            full_name: "Test Subscriber".to_string(),
            email_verified: true,
            subscription_active: true,
            subscription_tier: tier,
            created_at: Utc::now() - Duration::days(10),
            target_cities: vec!["Dublin".to_string()],
            languages_spoken: vec!["English".to_string()],
            company_types: vec![],
            roles_selected: vec!["software engineer".to_string()],
            professional_experience: Some(ProfessionalExperience::Entry),
            visa_required: Some(false),
            remote_preference: Some(RemotePreference::Remote),
        }
    }

    struct StaticOracle {
        reply: Result<Vec<String>, ()>,
    }

    #[async_trait]
    impl MatchOracle for StaticOracle {
        async fn rank(
            &self,
            _prefs: &UserPreferences,
            _corpus: &[Job],
        ) -> Result<Vec<String>, OracleError> {
            match &self.reply {
                Ok(hashes) => Ok(hashes.clone()),
                Err(()) => Err(OracleError::Malformed("synthetic failure".to_string())),
            }
        }
    }

    struct FlakyTransport {
        fail_for: String,
    }

    #[async_trait]
    impl EmailTransport for FlakyTransport {
        async fn send_matches(
            &self,
            user: &UserRecord,
            _jobs: &[Job],
        ) -> Result<(), TransportError> {
            if user.email == self.fail_for {
                Err(TransportError::Message("smtp relay unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn fallback_ranking_is_deterministic() {
        let prefs = UserPreferences::from_record(&user("a@example.com", SubscriptionTier::Free));
        let corpus = vec![
            job("h1", "Graduate Software Engineer", "Dublin, Ireland", 1),
            job("h2", "Marketing Intern", "Madrid, Spain", 2),
            job("h3", "Junior Software Engineer", "Remote", 3),
        ];

        let first = rank_fallback(&prefs, &corpus);
        let second = rank_fallback(&prefs, &corpus);
        assert_eq!(first, second);
        // Role affinity plus city keep the Dublin engineering role on top.
        assert_eq!(first[0].hash, "h1");
        assert_eq!(first.last().unwrap().hash, "h2");
    }

    #[test]
    fn fallback_ties_break_on_recency_then_hash() {
        let prefs = UserPreferences::from_record(&user("a@example.com", SubscriptionTier::Free));
        let mut corpus = vec![
            job("zz", "Junior Software Engineer", "Remote", 5),
            job("aa", "Junior Software Engineer", "Remote", 5),
            job("mm", "Junior Software Engineer", "Remote", 1),
        ];
        // Pin the stale pair to one instant so the hash decides.
        corpus[1].posted_at = corpus[0].posted_at;

        let ranked = rank_fallback(&prefs, &corpus);
        assert_eq!(ranked[0].hash, "mm");
        assert_eq!(ranked[1].hash, "aa");
        assert_eq!(ranked[2].hash, "zz");
    }

    #[test]
    fn fallback_never_mutates_the_corpus() {
        let prefs = UserPreferences::from_record(&user("a@example.com", SubscriptionTier::Free));
        let corpus = vec![
            job("h1", "Junior Developer", "Remote", 1),
            job("h2", "Trainee Analyst", "London, UK", 2),
        ];
        let snapshot = corpus.clone();
        let _ = rank_fallback(&prefs, &corpus);
        assert_eq!(corpus, snapshot);
    }

    #[tokio::test]
    async fn oracle_error_reports_ai_failed_and_still_matches() {
        let engine = MatchingEngine::new(Some(Box::new(StaticOracle { reply: Err(()) })));
        let corpus = vec![job("h1", "Junior Developer", "Remote", 1)];

        let subscriber = user("a@example.com", SubscriptionTier::Free);
        let result = engine.match_jobs(&subscriber, &corpus).await;
        assert_eq!(result.strategy, MatchStrategy::AiFailed);

        // The returned matches are exactly the heuristic ranking.
        let prefs = UserPreferences::from_record(&subscriber);
        assert_eq!(result.jobs, rank_fallback(&prefs, &corpus));
    }

    #[tokio::test]
    async fn unusable_oracle_reply_reports_fallback() {
        let engine = MatchingEngine::new(Some(Box::new(StaticOracle {
            reply: Ok(vec!["not-in-corpus".to_string()]),
        })));
        let corpus = vec![job("h1", "Junior Developer", "Remote", 1)];

        let result = engine
            .match_jobs(&user("a@example.com", SubscriptionTier::Free), &corpus)
            .await;
        assert_eq!(result.strategy, MatchStrategy::Fallback);
        assert_eq!(result.jobs.len(), 1);
    }

    #[tokio::test]
    async fn usable_oracle_reply_keeps_order_and_drops_unknown_hashes() {
        let engine = MatchingEngine::new(Some(Box::new(StaticOracle {
            reply: Ok(vec![
                "h2".to_string(),
                "ghost".to_string(),
                "h1".to_string(),
                "h2".to_string(),
            ]),
        })));
        let corpus = vec![
            job("h1", "Junior Developer", "Remote", 1),
            job("h2", "Graduate Analyst", "Remote", 2),
        ];

        let result = engine
            .match_jobs(&user("a@example.com", SubscriptionTier::Free), &corpus)
            .await;
        assert_eq!(result.strategy, MatchStrategy::AiSuccess);
        let hashes: Vec<&str> = result.jobs.iter().map(|j| j.hash.as_str()).collect();
        assert_eq!(hashes, vec!["h2", "h1"]);
    }

    #[tokio::test]
    async fn tier_caps_bound_the_match_count() {
        let corpus: Vec<Job> = (0..30)
            .map(|i| job(&format!("h{i:02}"), "Junior Developer", "Remote", 1))
            .collect();
        let engine = MatchingEngine::heuristic_only();

        let free = engine
            .match_jobs(&user("free@example.com", SubscriptionTier::Free), &corpus)
            .await;
        let premium = engine
            .match_jobs(
                &user("premium@example.com", SubscriptionTier::Premium),
                &corpus,
            )
            .await;
        assert_eq!(free.jobs.len(), 5);
        assert_eq!(premium.jobs.len(), 15);
    }

    #[test]
    fn oracle_reply_parsing_tolerates_surrounding_prose() {
        let content = "Here you go:\n```json\n[\"aaa\", \"bbb\"]\n```";
        let hashes = ChatOracle::parse_hashes(content).unwrap();
        assert_eq!(hashes, vec!["aaa", "bbb"]);

        assert!(matches!(
            ChatOracle::parse_hashes("no array here"),
            Err(OracleError::Malformed(_))
        ));
    }

    async fn seeded_stores() -> (Arc<InMemoryJobStore>, Arc<InMemoryUserStore>) {
        let jobs = Arc::new(InMemoryJobStore::new());
        for i in 0..8 {
            let outcome = jobs
                .upsert(&job(&format!("h{i}"), "Junior Developer", "Remote", 1))
                .await
                .unwrap();
            assert_eq!(outcome, UpsertOutcome::Inserted);
        }
        let users = Arc::new(InMemoryUserStore::new(vec![
            user("a@example.com", SubscriptionTier::Free),
            user("b@example.com", SubscriptionTier::Premium),
            user("c@example.com", SubscriptionTier::Free),
        ]));
        (jobs, users)
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            pacing: StdDuration::from_millis(1),
            ..DeliveryConfig::default()
        }
    }

    #[tokio::test]
    async fn one_failing_subscriber_never_aborts_the_run() {
        let (jobs, users) = seeded_stores().await;
        let sessions = Arc::new(InMemorySessionSink::new());
        let runner = DeliveryRunner::new(
            jobs,
            users,
            MatchingEngine::heuristic_only(),
            Arc::new(FlakyTransport {
                fail_for: "b@example.com".to_string(),
            }),
            sessions.clone(),
            fast_config(),
        );

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.errors, 1);

        // A session is recorded for every processed subscriber, failed
        // sends included.
        let recorded = sessions.sessions().await;
        assert_eq!(recorded.len(), 3);
        assert!(recorded
            .iter()
            .all(|s| s.strategy == MatchStrategy::Fallback && s.corpus_size == 8));
        assert!(recorded.iter().all(|s| s.match_count <= 15));
    }

    #[tokio::test]
    async fn stop_flag_ends_the_run_between_subscribers() {
        let (jobs, users) = seeded_stores().await;
        let runner = DeliveryRunner::new(
            jobs,
            users,
            MatchingEngine::heuristic_only(),
            Arc::new(LogEmailTransport),
            Arc::new(InMemorySessionSink::new()),
            fast_config(),
        );
        runner.stop_flag().store(true, Ordering::SeqCst);

        let summary = runner.run().await.unwrap();
        assert_eq!(summary, DeliverySummary::default());
    }

    #[tokio::test]
    async fn empty_corpus_skips_delivery_entirely() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let users = Arc::new(InMemoryUserStore::new(vec![user(
            "a@example.com",
            SubscriptionTier::Free,
        )]));
        let runner = DeliveryRunner::new(
            jobs,
            users,
            MatchingEngine::heuristic_only(),
            Arc::new(LogEmailTransport),
            Arc::new(InMemorySessionSink::new()),
            fast_config(),
        );

        let summary = runner.run().await.unwrap();
        assert_eq!(summary, DeliverySummary::default());
    }
}
