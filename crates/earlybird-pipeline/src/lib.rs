//! Ingestion pipeline: turns raw scraped records into canonical early-career
//! jobs with funnel telemetry, falling back to a fixed illustrative sample
//! set when the source is unreachable.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use earlybird_adapters::{AdapterContext, RawJobRecord, SourceAdapter};
use earlybird_core::{
    CareerPath, ExperienceLevel, Job, JobCategories, LocationBucket, WorkEnvironment,
};
use earlybird_core::FreshnessTier;
use earlybird_store::{HttpFetcher, JobStore, UpsertOutcome};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "earlybird-pipeline";

const DEFAULT_RULES_YAML: &str = include_str!("../rules/default.yaml");

/// Representative titles kept per run for quick diagnosis.
pub const SAMPLE_TITLE_CAP: usize = 5;

/// Keyword rule table driving eligibility, career-path and
/// location-bucket resolution. Kept as configuration data so the lists
/// stay auditable and extensible without a code change.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    #[allow(dead_code)]
    version: u32,
    graduate_signals: Vec<String>,
    seniority_signals: Vec<String>,
    #[serde(default)]
    career_rules: Vec<CareerRule>,
    #[serde(default)]
    location_rules: Vec<LocationRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CareerRule {
    path: CareerPath,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LocationRule {
    bucket: LocationBucket,
    contains_any: Vec<String>,
}

impl RuleSet {
    /// Rule table shipped with the crate.
    pub fn builtin() -> Self {
        serde_yaml::from_str(DEFAULT_RULES_YAML).expect("embedded rule table parses")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing classifier rule table")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    // Matching is case-insensitive on both sides; callers may pass raw
    // posting text.
    fn contains_any(haystack: &str, needles: &[String]) -> bool {
        needles
            .iter()
            .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
    }

    pub fn has_graduate_signal(&self, text: &str) -> bool {
        Self::contains_any(&text.to_lowercase(), &self.graduate_signals)
    }

    pub fn has_seniority_signal(&self, text: &str) -> bool {
        Self::contains_any(&text.to_lowercase(), &self.seniority_signals)
    }

    /// First matching career rule wins, in table order.
    pub fn career_path_for(&self, text: &str) -> CareerPath {
        let haystack = text.to_lowercase();
        self.career_rules
            .iter()
            .find(|rule| Self::contains_any(&haystack, &rule.contains_any))
            .map(|rule| rule.path)
            .unwrap_or(CareerPath::Unknown)
    }

    pub fn location_bucket_for(&self, location: &str) -> Option<LocationBucket> {
        let haystack = location.to_lowercase();
        self.location_rules
            .iter()
            .find(|rule| Self::contains_any(&haystack, &rule.contains_any))
            .map(|rule| rule.bucket)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub eligible: bool,
    pub career_path: CareerPath,
}

/// Pure lexical classifier. Never fails for any string input, including
/// empty strings; seniority signals beat graduate signals on ties.
#[derive(Debug, Clone)]
pub struct EligibilityClassifier {
    rules: Arc<RuleSet>,
}

impl EligibilityClassifier {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, title: &str, description: &str) -> Classification {
        let haystack = format!("{title} {description}").to_lowercase();
        let graduate = self.rules.has_graduate_signal(&haystack);
        let seniority = self.rules.has_seniority_signal(&haystack);
        Classification {
            eligible: graduate && !seniority,
            career_path: self.rules.career_path_for(&haystack),
        }
    }
}

/// Source-fixed inputs to normalization, derived from the adapter.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub source_id: String,
    pub location_discriminator: String,
    pub default_location: LocationBucket,
    pub default_location_label: String,
    pub work_environment: WorkEnvironment,
}

impl SourceProfile {
    pub fn for_adapter(adapter: &dyn SourceAdapter) -> Self {
        Self {
            source_id: adapter.source_id().to_string(),
            location_discriminator: adapter.location_discriminator().to_string(),
            default_location: adapter.default_location(),
            default_location_label: adapter.default_location_label().to_string(),
            work_environment: adapter.work_environment(),
        }
    }
}

/// Converts one raw record into the canonical [`Job`] entity. Pure; no I/O.
#[derive(Debug, Clone)]
pub struct JobNormalizer {
    rules: Arc<RuleSet>,
    profile: SourceProfile,
}

impl JobNormalizer {
    pub fn new(rules: Arc<RuleSet>, profile: SourceProfile) -> Self {
        Self { rules, profile }
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    /// Hex SHA-256 over the canonical posting string. Stable within a
    /// run for identical logical postings, which makes the hash the
    /// upsert dedup key.
    pub fn content_hash(&self, title: &str, company: &str, run_id: Uuid) -> String {
        let canonical = format!(
            "{title}-{company}-{}-{run_id}",
            self.profile.location_discriminator
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn resolve_posted_at(raw: &RawJobRecord, now: DateTime<Utc>) -> DateTime<Utc> {
        raw.posted_epoch_secs()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(now)
    }

    /// Best-effort company profile link. A heuristic, not a verified URL.
    fn company_profile_url(company: &str) -> String {
        let host: String = company
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if host.is_empty() {
            "https://unknown.invalid".to_string()
        } else {
            format!("https://{host}.com")
        }
    }

    pub fn normalize(&self, raw: &RawJobRecord, run_id: Uuid, now: DateTime<Utc>) -> Job {
        let title = raw.position.clone().unwrap_or_default();
        let company = raw.company.clone().unwrap_or_default();
        let description = raw
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| title.clone());

        let haystack = format!("{title} {description}").to_lowercase();
        let career = self.rules.career_path_for(&haystack);

        let location_label = raw
            .location
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.profile.default_location_label.clone());
        let location = self
            .rules
            .location_bucket_for(&location_label)
            .unwrap_or(self.profile.default_location);

        let posted_at = Self::resolve_posted_at(raw, now);

        Job {
            hash: self.content_hash(&title, &company, run_id),
            url: raw.url.clone().unwrap_or_default(),
            description,
            experience: ExperienceLevel::EarlyCareer,
            work_environment: self.profile.work_environment,
            source: self.profile.source_id.clone(),
            categories: JobCategories::new(career, location),
            company_profile_url: Self::company_profile_url(&company),
            language_requirements: vec!["English".to_string()],
            scraped_at: now,
            original_posted_at: posted_at,
            posted_at,
            last_seen_at: now,
            created_at: now,
            is_active: true,
            freshness_tier: freshness_for(posted_at, now),
            run_id,
            title,
            company,
            location: location_label,
        }
    }
}

pub fn freshness_for(posted_at: DateTime<Utc>, now: DateTime<Utc>) -> FreshnessTier {
    let age = now.signed_duration_since(posted_at);
    if age <= Duration::hours(48) {
        FreshnessTier::Fresh
    } else if age <= Duration::days(7) {
        FreshnessTier::Aging
    } else {
        FreshnessTier::Stale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStage {
    Raw,
    Eligible,
    CareerTagged,
    LocationTagged,
    Inserted,
    Updated,
}

/// Per-run pipeline counters plus captured errors and sample titles.
/// Counters only ever grow within a run; failures become data instead of
/// panics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunnelTelemetry {
    pub raw: usize,
    pub eligible: usize,
    pub career_tagged: usize,
    pub location_tagged: usize,
    pub inserted: usize,
    pub updated: usize,
    pub errors: Vec<String>,
    pub samples: Vec<String>,
}

impl FunnelTelemetry {
    pub fn record(&mut self, stage: FunnelStage, delta: usize) {
        let counter = match stage {
            FunnelStage::Raw => &mut self.raw,
            FunnelStage::Eligible => &mut self.eligible,
            FunnelStage::CareerTagged => &mut self.career_tagged,
            FunnelStage::LocationTagged => &mut self.location_tagged,
            FunnelStage::Inserted => &mut self.inserted,
            FunnelStage::Updated => &mut self.updated,
        };
        *counter += delta;
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Keeps up to [`SAMPLE_TITLE_CAP`] titles; a no-op beyond the cap.
    pub fn add_sample(&mut self, title: &str) {
        if self.samples.len() < SAMPLE_TITLE_CAP {
            self.samples.push(title.to_string());
        }
    }
}

/// Fire-and-forget funnel consumer, invoked exactly once per run.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, source_id: &str, funnel: &FunnelTelemetry);
}

#[derive(Debug, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, source_id: &str, funnel: &FunnelTelemetry) {
        info!(
            source_id,
            raw = funnel.raw,
            eligible = funnel.eligible,
            career_tagged = funnel.career_tagged,
            location_tagged = funnel.location_tagged,
            inserted = funnel.inserted,
            updated = funnel.updated,
            errors = funnel.errors.len(),
            samples = ?funnel.samples,
            "ingestion funnel"
        );
    }
}

/// Which path the run took. Degradation is an explicit outcome, not a
/// branch to be inferred from counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineStatus {
    Succeeded,
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub jobs: Vec<Job>,
    pub funnel: FunnelTelemetry,
    pub status: PipelineStatus,
}

/// One-source ingestion orchestrator. `run` never returns an error: fetch
/// failure degrades to the fallback sample set and everything else is
/// captured into the funnel.
pub struct IngestionPipeline {
    adapter: Box<dyn SourceAdapter>,
    classifier: EligibilityClassifier,
    normalizer: JobNormalizer,
    http: HttpFetcher,
    store: Arc<dyn JobStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl IngestionPipeline {
    pub fn new(
        adapter: Box<dyn SourceAdapter>,
        rules: RuleSet,
        http: HttpFetcher,
        store: Arc<dyn JobStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let rules = Arc::new(rules);
        let profile = SourceProfile::for_adapter(adapter.as_ref());
        Self {
            classifier: EligibilityClassifier::new(rules.clone()),
            normalizer: JobNormalizer::new(rules, profile),
            adapter,
            http,
            store,
            telemetry,
        }
    }

    pub async fn run(&self, run_id: Uuid) -> IngestionReport {
        let scraped_at = Utc::now();
        let mut funnel = FunnelTelemetry::default();
        let ctx = AdapterContext {
            run_id,
            fetched_at: scraped_at,
        };

        let (jobs, status) = match self.adapter.fetch(&self.http, &ctx).await {
            Ok(records) => {
                funnel.record(FunnelStage::Raw, records.len());
                let jobs = self
                    .ingest_records(&records, run_id, scraped_at, &mut funnel)
                    .await;
                info!(
                    source_id = self.adapter.source_id(),
                    %run_id,
                    raw = funnel.raw,
                    jobs = jobs.len(),
                    "ingestion run completed"
                );
                (jobs, PipelineStatus::Succeeded)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    source_id = self.adapter.source_id(),
                    %run_id,
                    error = %reason,
                    "source fetch failed; producing fallback samples"
                );
                funnel.add_error(&reason);
                let jobs = self
                    .ingest_fallback(run_id, scraped_at, &mut funnel)
                    .await;
                (jobs, PipelineStatus::Degraded { reason })
            }
        };

        // Exactly one emit per run, on both paths.
        self.telemetry.emit(self.adapter.source_id(), &funnel);

        IngestionReport {
            run_id,
            source_id: self.adapter.source_id().to_string(),
            jobs,
            funnel,
            status,
        }
    }

    async fn ingest_records(
        &self,
        records: &[RawJobRecord],
        run_id: Uuid,
        scraped_at: DateTime<Utc>,
        funnel: &mut FunnelTelemetry,
    ) -> Vec<Job> {
        let work_environment = self.normalizer.profile().work_environment;
        let mut jobs = Vec::new();
        for raw in records {
            if let Some(job) = self
                .ingest_record(raw, work_environment, run_id, scraped_at, funnel)
                .await
            {
                jobs.push(job);
            }
        }
        jobs
    }

    async fn ingest_record(
        &self,
        raw: &RawJobRecord,
        work_environment: WorkEnvironment,
        run_id: Uuid,
        scraped_at: DateTime<Utc>,
        funnel: &mut FunnelTelemetry,
    ) -> Option<Job> {
        // Records without a title or company are dropped silently; the
        // classifier is never consulted for them.
        if !raw.has_required_fields() {
            return None;
        }

        let title = raw.position.as_deref().unwrap_or_default();
        let description = raw.description.as_deref().unwrap_or_default();
        let classification = self.classifier.classify(title, description);
        if !classification.eligible {
            return None;
        }

        funnel.record(FunnelStage::Eligible, 1);
        funnel.add_sample(title);

        let mut job = self.normalizer.normalize(raw, run_id, scraped_at);
        job.work_environment = work_environment;

        if job.categories.career_resolved() {
            funnel.record(FunnelStage::CareerTagged, 1);
        }
        if job.categories.location_resolved() {
            funnel.record(FunnelStage::LocationTagged, 1);
        }

        match self.store.upsert(&job).await {
            Ok(UpsertOutcome::Inserted) => funnel.record(FunnelStage::Inserted, 1),
            Ok(UpsertOutcome::Updated) => funnel.record(FunnelStage::Updated, 1),
            Err(err) => funnel.add_error(format!("upsert failed for {}: {err}", job.hash)),
        }

        Some(job)
    }

    /// Fixed illustrative sample set, built through the same hashing and
    /// tagging rules as the normal path so downstream consumers stay
    /// non-empty and the pipeline stays provably live.
    async fn ingest_fallback(
        &self,
        run_id: Uuid,
        scraped_at: DateTime<Utc>,
        funnel: &mut FunnelTelemetry,
    ) -> Vec<Job> {
        let seeds = fallback_seeds(scraped_at);
        funnel.record(FunnelStage::Raw, seeds.len());
        let mut jobs = Vec::new();
        for (raw, work_environment) in seeds {
            if let Some(job) = self
                .ingest_record(&raw, work_environment, run_id, scraped_at, funnel)
                .await
            {
                jobs.push(job);
            }
        }
        jobs
    }
}

fn fallback_seeds(now: DateTime<Utc>) -> Vec<(RawJobRecord, WorkEnvironment)> {
    let seed = |position: &str,
                company: &str,
                location: &str,
                url: &str,
                description: &str,
                days_ago: i64| RawJobRecord {
        id: None,
        position: Some(position.to_string()),
        company: Some(company.to_string()),
        description: Some(description.to_string()),
        location: Some(location.to_string()),
        date: Some(serde_json::json!((now - Duration::days(days_ago)).timestamp())),
        url: Some(url.to_string()),
    };

    vec![
        (
            seed(
                "Graduate Software Engineer",
                "TechCorp Europe",
                "Dublin, Ireland",
                "https://techcorp.com/careers/graduate-software-engineer",
                "Graduate software engineering position for recent computer science graduates. Training provided.",
                2,
            ),
            WorkEnvironment::Hybrid,
        ),
        (
            seed(
                "Data Analyst Graduate Programme",
                "DataInsights Ltd",
                "London, UK",
                "https://datainsights.com/careers/graduate-programme",
                "12-month graduate programme for data analysts. Perfect for mathematics and statistics graduates.",
                1,
            ),
            WorkEnvironment::Hybrid,
        ),
        (
            seed(
                "Marketing Internship",
                "BrandBuilders Madrid",
                "Madrid, Spain",
                "https://brandbuilders.com/careers/marketing-intern",
                "6-month marketing internship for students and recent graduates. Remote work options available.",
                3,
            ),
            WorkEnvironment::Remote,
        ),
    ]
}
