//! Core domain types shared across pipeline phases.
//!
//! Everything downstream of phase 1 reads these; only the phases that
//! produce a type mutate it. `Company` is fixed after name derivation,
//! `CrawledPage` after collection, the `PageIndex` after classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A company record to enrich. The URL is the canonical identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Company {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Pre-seeded field values from the ingest source.
    #[serde(default)]
    pub seed_values: HashMap<String, serde_json::Value>,
}

impl Company {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Best available location string: explicit location, else "city, state".
    pub fn location_string(&self) -> Option<String> {
        if let Some(loc) = &self.location {
            return Some(loc.clone());
        }
        match (&self.city, &self.state) {
            (Some(c), Some(s)) => Some(format!("{c}, {s}")),
            (Some(c), None) => Some(c.clone()),
            _ => None,
        }
    }

    /// Host portion of the company URL, without a `www.` prefix.
    pub fn host(&self) -> Option<String> {
        let stripped = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .unwrap_or(&self.url);
        let host = stripped.split('/').next()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(host.strip_prefix("www.").unwrap_or(host).to_string())
    }
}

/// A single collected page: crawled, scraped, or synthesized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledPage {
    pub url: String,
    pub title: String,
    /// Markdown-reduced body text.
    pub content: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default)]
    pub review_rating: Option<f64>,
}

impl CrawledPage {
    pub fn new(url: &str, title: &str, content: &str) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            phone: None,
            review_count: None,
            review_rating: None,
        }
    }

    /// Content fingerprint for deduplication.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// The `[tag]` prefix of an external-source title, lowercased.
    pub fn title_tag(&self) -> Option<String> {
        let t = self.title.trim();
        let rest = t.strip_prefix('[')?;
        let end = rest.find(']')?;
        Some(rest[..end].trim().to_lowercase())
    }

    /// Whether this page came from an external profile source (tagged title).
    pub fn is_external_profile(&self) -> bool {
        self.title_tag()
            .is_some_and(|tag| PageType::from_tag(&tag).is_some())
    }
}

/// Semantic page classes. Every collected page gets exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Homepage,
    About,
    Services,
    Products,
    Contact,
    Careers,
    Team,
    Faq,
    Blog,
    News,
    Testimonials,
    Investors,
    Legal,
    Pricing,
    Bbb,
    GoogleMaps,
    Sos,
    Linkedin,
    Other,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Homepage => "homepage",
            Self::About => "about",
            Self::Services => "services",
            Self::Products => "products",
            Self::Contact => "contact",
            Self::Careers => "careers",
            Self::Team => "team",
            Self::Faq => "faq",
            Self::Blog => "blog",
            Self::News => "news",
            Self::Testimonials => "testimonials",
            Self::Investors => "investors",
            Self::Legal => "legal",
            Self::Pricing => "pricing",
            Self::Bbb => "bbb",
            Self::GoogleMaps => "google_maps",
            Self::Sos => "sos",
            Self::Linkedin => "linkedin",
            Self::Other => "other",
        }
    }

    /// Parse a classifier label. Unknown labels map to `Other`.
    pub fn parse_label(s: &str) -> Self {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "homepage" | "home" => Self::Homepage,
            "about" => Self::About,
            "services" => Self::Services,
            "products" => Self::Products,
            "contact" => Self::Contact,
            "careers" => Self::Careers,
            "team" => Self::Team,
            "faq" => Self::Faq,
            "blog" => Self::Blog,
            "news" => Self::News,
            "testimonials" => Self::Testimonials,
            "investors" => Self::Investors,
            "legal" => Self::Legal,
            "pricing" => Self::Pricing,
            "bbb" => Self::Bbb,
            "google_maps" | "maps" => Self::GoogleMaps,
            "sos" => Self::Sos,
            "linkedin" => Self::Linkedin,
            _ => Self::Other,
        }
    }

    /// Map an external-source title tag (`[bbb]`, `[google maps]`, ...) to
    /// its page type. Returns `None` for tags that are not external sources.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "bbb" => Some(Self::Bbb),
            "google_maps" | "maps" => Some(Self::GoogleMaps),
            "sos" => Some(Self::Sos),
            "linkedin" => Some(Self::Linkedin),
            _ => None,
        }
    }
}

impl std::fmt::Display for PageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mapping from page type to the classified pages of that type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageIndex {
    pages: HashMap<PageType, Vec<CrawledPage>>,
}

impl PageIndex {
    pub fn insert(&mut self, page_type: PageType, page: CrawledPage) {
        self.pages.entry(page_type).or_default().push(page);
    }

    pub fn of_type(&self, page_type: PageType) -> &[CrawledPage] {
        self.pages.get(&page_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All pages whose type appears in `types`, in type order.
    pub fn of_types(&self, types: &[PageType]) -> Vec<CrawledPage> {
        types
            .iter()
            .flat_map(|t| self.of_type(*t).iter().cloned())
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }

    pub fn type_count(&self) -> usize {
        self.pages.len()
    }

    pub fn all_pages(&self) -> Vec<&CrawledPage> {
        self.pages.values().flatten().collect()
    }
}

/// An extraction question loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub instructions: String,
    /// Which model tier answers this natively (1..=3).
    pub tier: u8,
    /// One or more field keys, comma-joined.
    pub field_keys: String,
    /// Page types this question can be evaluated against.
    pub page_types: Vec<PageType>,
    /// 0 = must-have, larger = lower priority.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub output_format: Option<String>,
}

impl Question {
    /// Declared field keys, split and trimmed.
    pub fn field_key_list(&self) -> Vec<String> {
        self.field_keys
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn is_multi_field(&self) -> bool {
        self.field_key_list().len() > 1
    }
}

/// A question bound to the concrete pages it runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedQuestion {
    pub question: Question,
    pub pages: Vec<CrawledPage>,
}

/// One extracted value for one field key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub field_key: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub tier: u8,
    pub source: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub data_as_of: Option<DateTime<Utc>>,
}

impl Answer {
    pub fn has_value(&self) -> bool {
        !self.value.is_null()
    }
}

/// A validated, coerced value ready for downstream write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub field_key: String,
    /// Field name in the downstream system.
    pub crm_field: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source: String,
    pub tier: u8,
    #[serde(default)]
    pub data_as_of: Option<DateTime<Utc>>,
}

/// Terminal status of a tracked phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Complete,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Token counts accumulated from LLM responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn absorb(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }

    pub fn is_empty(&self) -> bool {
        *self == TokenUsage::default()
    }
}

/// Outcome of one tracked phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    /// USD cost attributed to this phase.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PhaseResult {
    pub fn complete(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: PhaseStatus::Complete,
            duration_ms: 0,
            error: None,
            usage: TokenUsage::default(),
            cost: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn failed(name: &str, error: &str) -> Self {
        Self {
            status: PhaseStatus::Failed,
            error: Some(error.to_string()),
            ..Self::complete(name)
        }
    }

    pub fn skipped(name: &str, reason: &str) -> Self {
        let mut result = Self {
            status: PhaseStatus::Skipped,
            ..Self::complete(name)
        };
        result
            .metadata
            .insert("reason".into(), serde_json::json!(reason));
        result
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// A deferred downstream write, produced by the quality gate when no
/// record sink is configured so an external batcher can flush several
/// runs together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteIntent {
    pub company_url: String,
    pub quality_score: f64,
    pub field_values: HashMap<String, FieldValue>,
}

/// Final result of an enrichment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub company: Company,
    pub field_values: HashMap<String, FieldValue>,
    pub phases: Vec<PhaseResult>,
    pub report: String,
    pub quality_score: f64,
    pub total_cost: f64,
    pub usage: TokenUsage,
    /// Present when the run had no sink and the record still awaits its
    /// downstream write.
    #[serde(default)]
    pub write_intent: Option<WriteIntent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn company_host_strips_scheme_and_www() {
        let c = Company::new("https://www.acme-industrial.com/about");
        assert_eq!(c.host().as_deref(), Some("acme-industrial.com"));
    }

    #[test]
    fn company_location_prefers_explicit_string() {
        let mut c = Company::new("https://acme.com");
        c.city = Some("Tulsa".into());
        c.state = Some("OK".into());
        assert_eq!(c.location_string().as_deref(), Some("Tulsa, OK"));
        c.location = Some("Tulsa, Oklahoma, USA".into());
        assert_eq!(c.location_string().as_deref(), Some("Tulsa, Oklahoma, USA"));
    }

    #[test]
    fn page_fingerprint_is_stable_and_content_keyed() {
        let a = CrawledPage::new("https://a.com/1", "One", "same body");
        let b = CrawledPage::new("https://a.com/2", "Two", "same body");
        let c = CrawledPage::new("https://a.com/3", "Three", "different body");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn title_tag_extracts_bracket_prefix() {
        let page = CrawledPage::new("u", "[BBB] Acme Industrial Inc", "");
        assert_eq!(page.title_tag().as_deref(), Some("bbb"));
        assert!(page.is_external_profile());

        let plain = CrawledPage::new("u", "About Us", "");
        assert_eq!(plain.title_tag(), None);
        assert!(!plain.is_external_profile());
    }

    #[test]
    fn unknown_bracket_prefix_is_not_external() {
        let page = CrawledPage::new("u", "[DRAFT] Notes", "");
        assert_eq!(page.title_tag().as_deref(), Some("draft"));
        assert!(!page.is_external_profile());
    }

    #[test]
    fn page_type_label_parsing_defaults_to_other() {
        assert_eq!(PageType::parse_label("About"), PageType::About);
        assert_eq!(PageType::parse_label("google-maps"), PageType::GoogleMaps);
        assert_eq!(PageType::parse_label("warehouse"), PageType::Other);
    }

    #[test]
    fn page_type_tag_table() {
        assert_eq!(PageType::from_tag("linkedin"), Some(PageType::Linkedin));
        assert_eq!(PageType::from_tag("Google Maps"), Some(PageType::GoogleMaps));
        assert_eq!(PageType::from_tag("sos"), Some(PageType::Sos));
        assert_eq!(PageType::from_tag("yelp"), None);
    }

    #[test]
    fn page_index_collects_by_type() {
        let mut index = PageIndex::default();
        index.insert(PageType::About, CrawledPage::new("u1", "About", "a"));
        index.insert(PageType::About, CrawledPage::new("u2", "Team", "b"));
        index.insert(PageType::Homepage, CrawledPage::new("u3", "Home", "c"));

        assert_eq!(index.of_type(PageType::About).len(), 2);
        assert_eq!(index.page_count(), 3);
        assert_eq!(
            index.of_types(&[PageType::Homepage, PageType::About]).len(),
            3
        );
        assert!(index.of_type(PageType::Blog).is_empty());
    }

    #[test]
    fn question_field_key_list_splits_and_trims() {
        let q = Question {
            id: "q1".into(),
            text: "t".into(),
            instructions: String::new(),
            tier: 1,
            field_keys: "industry, naics_code , employee_count".into(),
            page_types: vec![PageType::About],
            priority: 0,
            output_format: None,
        };
        assert_eq!(
            q.field_key_list(),
            vec!["industry", "naics_code", "employee_count"]
        );
        assert!(q.is_multi_field());
    }

    #[test]
    fn phase_result_constructors() {
        let ok = PhaseResult::complete("classify");
        assert_eq!(ok.status, PhaseStatus::Complete);
        assert!(ok.error.is_none());

        let failed = PhaseResult::failed("t1_extraction", "circuit open");
        assert_eq!(failed.status, PhaseStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("circuit open"));

        let skipped = PhaseResult::skipped("t3_extraction", "cost_budget_exceeded");
        assert_eq!(skipped.status, PhaseStatus::Skipped);
        assert_eq!(
            skipped.metadata.get("reason").unwrap(),
            "cost_budget_exceeded"
        );
    }

    #[test]
    fn token_usage_absorb_adds_all_counters() {
        let mut total = TokenUsage::default();
        total.absorb(TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_creation_tokens: 50,
            cache_read_tokens: 0,
        });
        total.absorb(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_tokens: 0,
            cache_read_tokens: 40,
        });
        assert_eq!(total.input_tokens, 110);
        assert_eq!(total.output_tokens, 25);
        assert_eq!(total.cache_creation_tokens, 50);
        assert_eq!(total.cache_read_tokens, 40);
    }
}
