//! Core domain model for earlybird: canonical jobs, category enums,
//! subscriber preferences and match-session audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "earlybird-core";

/// Coarse domain bucket a posting is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CareerPath {
    Tech,
    DataAnalytics,
    Marketing,
    Finance,
    Sales,
    Design,
    Operations,
    Unknown,
}

impl CareerPath {
    pub fn is_resolved(self) -> bool {
        !matches!(self, CareerPath::Unknown)
    }

    pub fn slug(self) -> &'static str {
        match self {
            CareerPath::Tech => "tech",
            CareerPath::DataAnalytics => "data-analytics",
            CareerPath::Marketing => "marketing",
            CareerPath::Finance => "finance",
            CareerPath::Sales => "sales",
            CareerPath::Design => "design",
            CareerPath::Operations => "operations",
            CareerPath::Unknown => "unknown",
        }
    }
}

/// Closed set of location buckets a posting resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationBucket {
    EuRemote,
    Dublin,
    London,
    Madrid,
    Berlin,
    Amsterdam,
    Paris,
    Unknown,
}

impl LocationBucket {
    pub fn is_resolved(self) -> bool {
        !matches!(self, LocationBucket::Unknown)
    }

    pub fn slug(self) -> &'static str {
        match self {
            LocationBucket::EuRemote => "eu-remote",
            LocationBucket::Dublin => "dublin",
            LocationBucket::London => "london",
            LocationBucket::Madrid => "madrid",
            LocationBucket::Berlin => "berlin",
            LocationBucket::Amsterdam => "amsterdam",
            LocationBucket::Paris => "paris",
            LocationBucket::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkEnvironment {
    Remote,
    Hybrid,
    Onsite,
}

/// Experience tag carried by every job this pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperienceLevel {
    EarlyCareer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessTier {
    Fresh,
    Aging,
    Stale,
}

/// Structured category assignment. Replaces an ad hoc set of
/// colon-prefixed tag strings with a closed pair of enums; the string
/// rendering survives only at the edges via [`JobCategories::as_tags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCategories {
    pub career: CareerPath,
    pub location: LocationBucket,
}

impl JobCategories {
    pub fn new(career: CareerPath, location: LocationBucket) -> Self {
        Self { career, location }
    }

    pub fn career_resolved(&self) -> bool {
        self.career.is_resolved()
    }

    pub fn location_resolved(&self) -> bool {
        self.location.is_resolved()
    }

    /// Legacy tag rendering: `career:<path>`, `early-career`, `loc:<bucket>`.
    /// Each prefix appears exactly once, so a resolved tag can never
    /// coexist with its `unknown` form.
    pub fn as_tags(&self) -> Vec<String> {
        vec![
            format!("career:{}", self.career.slug()),
            "early-career".to_string(),
            format!("loc:{}", self.location.slug()),
        ]
    }
}

/// Canonical job entity produced by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Hex SHA-256 over title, company, location discriminator and run id.
    /// Identical logical postings within one run share a hash, which is
    /// the upsert key for dedup.
    pub hash: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub description: String,
    pub experience: ExperienceLevel,
    pub work_environment: WorkEnvironment,
    pub source: String,
    pub categories: JobCategories,
    pub company_profile_url: String,
    pub language_requirements: Vec<String>,
    pub scraped_at: DateTime<Utc>,
    pub original_posted_at: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub freshness_tier: FreshnessTier,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Premium,
}

impl SubscriptionTier {
    /// Largest match set a subscriber on this tier receives per delivery.
    pub fn max_matches(self) -> usize {
        match self {
            SubscriptionTier::Free => 5,
            SubscriptionTier::Premium => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfessionalExperience {
    Entry,
    Mid,
    Senior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePreference {
    Remote,
    Hybrid,
    Onsite,
    Any,
}

/// Subscriber record as retrieved from the user store. Preference fields
/// are optional here; defaults are applied by
/// [`UserPreferences::from_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub full_name: String,
    pub email_verified: bool,
    pub subscription_active: bool,
    pub subscription_tier: SubscriptionTier,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub target_cities: Vec<String>,
    #[serde(default)]
    pub languages_spoken: Vec<String>,
    #[serde(default)]
    pub company_types: Vec<String>,
    #[serde(default)]
    pub roles_selected: Vec<String>,
    #[serde(default)]
    pub professional_experience: Option<ProfessionalExperience>,
    #[serde(default)]
    pub visa_required: Option<bool>,
    #[serde(default)]
    pub remote_preference: Option<RemotePreference>,
}

/// One subscriber's matching inputs with every field defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub target_cities: Vec<String>,
    pub languages_spoken: Vec<String>,
    pub company_types: Vec<String>,
    pub roles_selected: Vec<String>,
    pub professional_experience: ProfessionalExperience,
    pub visa_required: bool,
    pub remote_preference: RemotePreference,
}

impl UserPreferences {
    pub fn from_record(user: &UserRecord) -> Self {
        Self {
            target_cities: user.target_cities.clone(),
            languages_spoken: user.languages_spoken.clone(),
            company_types: user.company_types.clone(),
            roles_selected: user.roles_selected.clone(),
            professional_experience: user
                .professional_experience
                .unwrap_or(ProfessionalExperience::Entry),
            visa_required: user.visa_required.unwrap_or(false),
            remote_preference: user.remote_preference.unwrap_or(RemotePreference::Any),
        }
    }
}

/// Which path produced a subscriber's matches. The three outcomes are
/// mutually exclusive and exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Oracle returned a non-empty ranking.
    AiSuccess,
    /// Oracle answered but produced nothing usable; heuristic ranking ran.
    Fallback,
    /// Oracle call failed outright; heuristic ranking ran.
    AiFailed,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::AiSuccess => "ai_success",
            MatchStrategy::Fallback => "fallback",
            MatchStrategy::AiFailed => "ai_failed",
        }
    }
}

/// Audit record of one subscriber's matching outcome for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSession {
    pub user_id: String,
    pub strategy: MatchStrategy,
    pub corpus_size: usize,
    pub match_count: usize,
    pub matched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn resolved_categories_never_render_unknown_tags() {
        let categories = JobCategories::new(CareerPath::Tech, LocationBucket::Dublin);
        let tags = categories.as_tags();
        assert_eq!(
            tags,
            vec![
                "career:tech".to_string(),
                "early-career".to_string(),
                "loc:dublin".to_string()
            ]
        );
        assert!(!tags.iter().any(|t| t.contains("unknown")));
    }

    #[test]
    fn tag_rendering_is_duplicate_free() {
        let categories = JobCategories::new(CareerPath::Unknown, LocationBucket::Unknown);
        let tags = categories.as_tags();
        let mut deduped = tags.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(tags.len(), deduped.len());
        assert!(!categories.career_resolved());
        assert!(!categories.location_resolved());
    }

    #[test]
    fn preferences_default_every_absent_field() {
        let user = UserRecord {
            email: "sam@example.com".to_string(),
            full_name: "Sam".to_string(),
            email_verified: true,
            subscription_active: true,
            subscription_tier: SubscriptionTier::Free,
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap(),
            target_cities: vec![],
            languages_spoken: vec![],
            company_types: vec![],
            roles_selected: vec![],
            professional_experience: None,
            visa_required: None,
            remote_preference: None,
        };

        let prefs = UserPreferences::from_record(&user);
        assert_eq!(prefs.professional_experience, ProfessionalExperience::Entry);
        assert_eq!(prefs.remote_preference, RemotePreference::Any);
        assert!(!prefs.visa_required);
    }

    #[test]
    fn tier_caps_match_delivery_limits() {
        assert_eq!(SubscriptionTier::Free.max_matches(), 5);
        assert_eq!(SubscriptionTier::Premium.max_matches(), 15);
    }

    #[test]
    fn match_strategy_wire_names() {
        assert_eq!(MatchStrategy::AiSuccess.as_str(), "ai_success");
        assert_eq!(MatchStrategy::Fallback.as_str(), "fallback");
        assert_eq!(MatchStrategy::AiFailed.as_str(), "ai_failed");
        assert_eq!(
            serde_json::to_string(&MatchStrategy::AiFailed).unwrap(),
            "\"ai_failed\""
        );
    }
}
