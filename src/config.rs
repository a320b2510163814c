//! Unified configuration for the enrichment pipeline.
//!
//! Configuration reads from `prospect.toml` with layered overrides
//! (file → environment → CLI flags). Every section has compiled-in
//! defaults so a bare `prospect enrich <url>` works without a file.
//!
//! # Configuration File Format
//!
//! ```toml
//! [models]
//! cheap = "claude-3-5-haiku-latest"
//! mid = "claude-sonnet-4-5"
//! deep = "claude-opus-4-1"
//!
//! [thresholds]
//! escalation_confidence = 0.4
//! t2_context_confidence = 0.4
//! ambiguity_confidence = 0.6
//! answer_skip_confidence = 0.8
//! small_batch = 3
//!
//! [budgets]
//! max_cost_per_company = 2.0
//! max_concurrent_requests = 10
//! crawl_concurrency = 5
//!
//! [cache]
//! page_ttl_hours = 168
//! answer_reuse_ttl_hours = 720
//!
//! [tier3]
//! gate = "ambiguity_only"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run modes for the pipeline.
///
/// | Mode       | Question set           | Tiers                    |
/// |------------|------------------------|--------------------------|
/// | `Full`     | every loaded question  | T1, T2, T3 (gated)       |
/// | `Sourcing` | priority ≤ 1 only      | T1 only, T3 gate forced off |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Full,
    Sourcing,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Sourcing => write!(f, "sourcing"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(RunMode::Full),
            "sourcing" => Ok(RunMode::Sourcing),
            _ => anyhow::bail!("Invalid run mode '{}'. Valid values: full, sourcing", s),
        }
    }
}

/// When tier-3 deep extraction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier3Gate {
    /// Never run tier 3.
    Off,
    /// Always run tier 3.
    Always,
    /// Run tier 3 only when at least one merged answer is below the
    /// ambiguity confidence threshold.
    #[default]
    AmbiguityOnly,
}

/// Model identifiers for the three extraction tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_cheap_model")]
    pub cheap: String,
    #[serde(default = "default_mid_model")]
    pub mid: String,
    #[serde(default = "default_deep_model")]
    pub deep: String,
}

fn default_cheap_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_mid_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_deep_model() -> String {
    "claude-opus-4-1".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cheap: default_cheap_model(),
            mid: default_mid_model(),
            deep: default_deep_model(),
        }
    }
}

impl ModelsConfig {
    /// Model used for a given extraction tier (1..=3).
    pub fn for_tier(&self, tier: u8) -> &str {
        match tier {
            1 => &self.cheap,
            2 => &self.mid,
            _ => &self.deep,
        }
    }
}

/// Confidence thresholds and the small-batch dispatch ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    /// T1 answers below this confidence escalate to T2.
    #[serde(default = "default_escalation_confidence")]
    pub escalation_confidence: f64,
    /// T1 answers below this confidence enter the T2 context block.
    #[serde(default = "default_t2_context_confidence")]
    pub t2_context_confidence: f64,
    /// `ambiguity_only` tier-3 gate triggers below this merged confidence.
    #[serde(default = "default_ambiguity_confidence")]
    pub ambiguity_confidence: f64,
    /// Persisted answers at or above this confidence are reused across runs.
    #[serde(default = "default_answer_skip_confidence")]
    pub answer_skip_confidence: f64,
    /// Item-count ceiling at or below which dispatch bypasses the batch API.
    #[serde(default = "default_small_batch")]
    pub small_batch: usize,
}

fn default_escalation_confidence() -> f64 {
    0.4
}

fn default_t2_context_confidence() -> f64 {
    0.4
}

fn default_ambiguity_confidence() -> f64 {
    0.6
}

fn default_answer_skip_confidence() -> f64 {
    0.8
}

fn default_small_batch() -> usize {
    3
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            escalation_confidence: default_escalation_confidence(),
            t2_context_confidence: default_t2_context_confidence(),
            ambiguity_confidence: default_ambiguity_confidence(),
            answer_skip_confidence: default_answer_skip_confidence(),
            small_batch: default_small_batch(),
        }
    }
}

/// Cost and concurrency budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetsConfig {
    /// Per-company cost ceiling in USD. Tier 3 is skipped once cumulative
    /// phase cost reaches this.
    #[serde(default = "default_max_cost")]
    pub max_cost_per_company: f64,
    /// Bound on concurrent direct LLM requests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Bound on concurrent site-crawl fetches.
    #[serde(default = "default_crawl_concurrency")]
    pub crawl_concurrency: usize,
    /// Per-tier character budgets for page text in prompts.
    #[serde(default = "default_t1_chars")]
    pub t1_char_budget: usize,
    #[serde(default = "default_t2_chars")]
    pub t2_char_budget: usize,
    #[serde(default = "default_t3_chars")]
    pub t3_char_budget: usize,
    /// Budget for tagged external-profile snippets appended to every prompt.
    #[serde(default = "default_snippet_chars")]
    pub snippet_char_budget: usize,
}

fn default_max_cost() -> f64 {
    2.0
}

fn default_max_concurrent() -> usize {
    10
}

fn default_crawl_concurrency() -> usize {
    5
}

fn default_t1_chars() -> usize {
    60_000
}

fn default_t2_chars() -> usize {
    80_000
}

fn default_t3_chars() -> usize {
    100_000
}

fn default_snippet_chars() -> usize {
    4_000
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            max_cost_per_company: default_max_cost(),
            max_concurrent_requests: default_max_concurrent(),
            crawl_concurrency: default_crawl_concurrency(),
            t1_char_budget: default_t1_chars(),
            t2_char_budget: default_t2_chars(),
            t3_char_budget: default_t3_chars(),
            snippet_char_budget: default_snippet_chars(),
        }
    }
}

impl BudgetsConfig {
    /// Character budget for a tier's page text.
    pub fn char_budget_for_tier(&self, tier: u8) -> usize {
        match tier {
            1 => self.t1_char_budget,
            2 => self.t2_char_budget,
            _ => self.t3_char_budget,
        }
    }
}

/// Cache TTLs, in hours. Zero means "no age limit".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_page_ttl")]
    pub page_ttl_hours: u64,
    #[serde(default = "default_answer_ttl")]
    pub answer_reuse_ttl_hours: u64,
}

fn default_page_ttl() -> u64 {
    168
}

fn default_answer_ttl() -> u64 {
    720
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_ttl_hours: default_page_ttl(),
            answer_reuse_ttl_hours: default_answer_ttl(),
        }
    }
}

/// Tier-3 gating section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tier3Config {
    #[serde(default)]
    pub gate: Tier3Gate,
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub budgets: BudgetsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tier3: Tier3Config,
    /// Run mode (full or sourcing).
    #[serde(default)]
    pub mode: RunMode,
    /// Bypass the batch API entirely; every item goes out as a direct request.
    #[serde(default)]
    pub no_batch: bool,
    /// Ignore persisted answers and re-extract everything.
    #[serde(default)]
    pub force_reextract: bool,
    /// Overall run deadline in seconds, when set.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl EnrichConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML content.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    /// Load from `prospect.toml` in the given directory, or defaults when
    /// the file does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join("prospect.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// The effective tier-3 gate: sourcing mode forces it off.
    pub fn effective_tier3_gate(&self) -> Tier3Gate {
        match self.mode {
            RunMode::Sourcing => Tier3Gate::Off,
            RunMode::Full => self.tier3.gate,
        }
    }

    /// Validate the configuration, returning a list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (name, v) in [
            ("escalation_confidence", self.thresholds.escalation_confidence),
            ("t2_context_confidence", self.thresholds.t2_context_confidence),
            ("ambiguity_confidence", self.thresholds.ambiguity_confidence),
            (
                "answer_skip_confidence",
                self.thresholds.answer_skip_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&v) {
                problems.push(format!("thresholds.{name} must be in [0, 1], got {v}"));
            }
        }

        if self.budgets.max_cost_per_company < 0.0 {
            problems.push(format!(
                "budgets.max_cost_per_company must be non-negative, got {}",
                self.budgets.max_cost_per_company
            ));
        }
        if self.budgets.max_concurrent_requests == 0 {
            problems.push("budgets.max_concurrent_requests must be at least 1".to_string());
        }
        if self.budgets.crawl_concurrency == 0 {
            problems.push("budgets.crawl_concurrency must be at least 1".to_string());
        }
        if self.models.cheap.is_empty() || self.models.mid.is_empty() || self.models.deep.is_empty()
        {
            problems.push("models must name all three tiers".to_string());
        }

        problems
    }
}

/// Resolve the store path: `PROSPECT_DB` env var, explicit flag, or the
/// platform data directory.
pub fn resolve_db_path(flag: Option<PathBuf>) -> PathBuf {
    if let Ok(p) = std::env::var("PROSPECT_DB") {
        return PathBuf::from(p);
    }
    if let Some(p) = flag {
        return p;
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prospect")
        .join("prospect.db")
}
