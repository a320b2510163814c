//! Question set definition and loading.
//!
//! Questions come from `questions.toml` when present, otherwise from the
//! compiled-in default set. Each question declares the tier that answers
//! it natively, the field keys it extracts, and the page types it can be
//! evaluated against.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::RunMode;
use crate::model::{PageType, Question};

/// Priority ceiling for sourcing mode (P0 and P1 run, the rest are dropped).
pub const SOURCING_PRIORITY_CEILING: u8 = 1;

/// The full questions.toml format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionsFile {
    #[serde(default)]
    pub version: Option<String>,
    pub questions: Vec<Question>,
}

impl QuestionsFile {
    /// Load questions from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read questions file: {}", path.display()))?;
        let file: QuestionsFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse questions TOML: {}", path.display()))?;
        Ok(file)
    }

    /// Save questions to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize questions to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write questions file: {}", path.display()))?;
        Ok(())
    }
}

fn q(
    id: &str,
    text: &str,
    instructions: &str,
    tier: u8,
    field_keys: &str,
    page_types: &[PageType],
    priority: u8,
) -> Question {
    Question {
        id: id.to_string(),
        text: text.to_string(),
        instructions: instructions.to_string(),
        tier,
        field_keys: field_keys.to_string(),
        page_types: page_types.to_vec(),
        priority,
        output_format: None,
    }
}

/// The default question set.
pub fn default_questions() -> Vec<Question> {
    use PageType::*;
    vec![
        q(
            "industry",
            "What industry is this company in?",
            "Name the primary industry in a few words. Prefer the company's own \
             description over directory categories.",
            1,
            "industry, naics_code",
            &[Homepage, About, Services, Bbb, Sos],
            0,
        ),
        q(
            "description",
            "Write a one-paragraph description of what this company does.",
            "Two to four sentences. Cover what they sell, who they sell to, and \
             where they operate.",
            1,
            "description",
            &[Homepage, About, Services, Products],
            0,
        ),
        q(
            "employee_count",
            "How many employees does this company have?",
            "Give a single integer. Use the most recent figure you can find; a \
             LinkedIn range should be collapsed to its midpoint.",
            1,
            "employee_count",
            &[About, Careers, Team, Linkedin, Bbb],
            0,
        ),
        q(
            "year_founded",
            "What year was this company founded?",
            "Four-digit year only.",
            1,
            "year_founded",
            &[About, Homepage, Bbb, Sos],
            1,
        ),
        q(
            "contact",
            "What are the company's phone number and contact email?",
            "Prefer a main office line over department lines.",
            1,
            "phone, email",
            &[Contact, Homepage, GoogleMaps, Bbb],
            1,
        ),
        q(
            "location",
            "Where is this company headquartered?",
            "City, state, and postal code of the primary location.",
            1,
            "address_city, address_state, address_zip",
            &[Contact, About, GoogleMaps, Bbb, Sos],
            1,
        ),
        q(
            "services",
            "What specific services or products does this company offer?",
            "A comma-separated list of concrete offerings, not marketing copy.",
            1,
            "services",
            &[Services, Products, Homepage, Pricing, Faq],
            1,
        ),
        q(
            "ownership",
            "Who owns or leads this company, and is it family-owned?",
            "Name the owner, principal, or CEO if stated. is_family_owned is true \
             only when the company says so.",
            2,
            "owner_name, is_family_owned",
            &[About, Team, Sos, Linkedin, News],
            1,
        ),
        q(
            "business_model",
            "What is this company's business model?",
            "Classify as one of: B2B, B2C, B2B2C, B2G, or a combination. Consider \
             who the paying customer is.",
            2,
            "business_model, customer_segments",
            &[Homepage, About, Services, Pricing],
            1,
        ),
        q(
            "franchise",
            "Is this company a franchise or an independent operator?",
            "Look for franchise disclosure language, 'locally owned and operated' \
             claims, or a parent brand.",
            2,
            "is_franchise",
            &[About, Legal, Faq, Homepage],
            2,
        ),
        q(
            "location_count",
            "How many physical locations does this company operate?",
            "A single integer. Count offices, branches, or stores listed.",
            2,
            "location_count",
            &[Contact, About, GoogleMaps],
            2,
        ),
        q(
            "revenue",
            "Estimate this company's annual revenue.",
            "Reason from employee count, industry, review volume, and any stated \
             figures. Give a single dollar amount.",
            3,
            "revenue_estimate",
            &[About, Services, Linkedin, GoogleMaps, Bbb],
            2,
        ),
    ]
}

/// Load questions from a file, falling back to the default set.
pub fn load_questions_or_default(path: Option<&Path>) -> Result<Vec<Question>> {
    match path {
        Some(p) if p.exists() => {
            let file = QuestionsFile::load(p)?;
            Ok(file.questions)
        }
        _ => Ok(default_questions()),
    }
}

/// Apply the run-mode filter: sourcing keeps only priority ≤ 1 questions.
pub fn filter_for_mode(questions: Vec<Question>, mode: RunMode) -> Vec<Question> {
    match mode {
        RunMode::Full => questions,
        RunMode::Sourcing => questions
            .into_iter()
            .filter(|q| q.priority <= SOURCING_PRIORITY_CEILING)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn default_questions_cover_all_tiers() {
        let questions = default_questions();
        assert!(questions.iter().any(|q| q.tier == 1));
        assert!(questions.iter().any(|q| q.tier == 2));
        assert!(questions.iter().any(|q| q.tier == 3));
    }

    #[test]
    fn default_question_ids_are_unique() {
        let questions = default_questions();
        let mut ids: Vec<&str> = questions.iter().map(|q| q.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), questions.len());
    }

    #[test]
    fn every_default_question_names_at_least_one_page_type() {
        for q in default_questions() {
            assert!(!q.page_types.is_empty(), "question {} has no page types", q.id);
            assert!(!q.field_key_list().is_empty());
        }
    }

    #[test]
    fn load_or_default_without_file_returns_defaults() {
        let questions = load_questions_or_default(None).unwrap();
        assert_eq!(questions.len(), default_questions().len());

        let missing = Path::new("/nonexistent/questions.toml");
        let questions = load_questions_or_default(Some(missing)).unwrap();
        assert_eq!(questions.len(), default_questions().len());
    }

    #[test]
    fn questions_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("questions.toml");

        let file = QuestionsFile {
            version: Some("1".into()),
            questions: default_questions(),
        };
        file.save(&path).unwrap();

        let loaded = QuestionsFile::load(&path).unwrap();
        assert_eq!(loaded.questions, default_questions());
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("questions.toml");
        fs::write(&path, "questions = 3").unwrap();
        assert!(QuestionsFile::load(&path).is_err());
    }

    #[test]
    fn sourcing_mode_drops_low_priority_questions() {
        let questions = default_questions();
        let total = questions.len();
        let filtered = filter_for_mode(questions, RunMode::Sourcing);
        assert!(filtered.len() < total);
        assert!(filtered.iter().all(|q| q.priority <= 1));

        let full = filter_for_mode(default_questions(), RunMode::Full);
        assert_eq!(full.len(), total);
    }
}
