//! Phase 8 report formatting and phase 9 quality gate.

use crate::model::{Company, FieldValue, PhaseResult, PhaseStatus};
use crate::registry::FieldRegistry;
use anyhow::Result;
use std::collections::HashMap;

pub use crate::model::WriteIntent;

/// Downstream writer for validated records. The concrete implementation
/// (CRM, warehouse, queue) lives in the embedding application.
pub trait RecordSink: Send + Sync {
    fn write(&self, company: &Company, values: &HashMap<String, FieldValue>) -> Result<()>;
}

/// Completeness score: mean confidence over the registry's required
/// fields, counting absent fields as zero.
pub fn quality_score(values: &HashMap<String, FieldValue>, registry: &FieldRegistry) -> f64 {
    let required = registry.required_keys();
    if required.is_empty() {
        return if values.is_empty() { 0.0 } else { 1.0 };
    }
    let total: f64 = required
        .iter()
        .map(|key| values.get(*key).map(|v| v.confidence).unwrap_or(0.0))
        .sum();
    total / required.len() as f64
}

/// Human-readable run report.
pub fn format_report(
    company: &Company,
    values: &HashMap<String, FieldValue>,
    phases: &[PhaseResult],
    total_cost: f64,
) -> String {
    let mut out = String::new();
    let name = company.name.as_deref().unwrap_or(&company.url);
    out.push_str(&format!("# Enrichment report: {name}\n"));
    out.push_str(&format!("URL: {}\n\n", company.url));

    out.push_str("## Fields\n");
    if values.is_empty() {
        out.push_str("(no validated field values)\n");
    } else {
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        for key in keys {
            let v = &values[key];
            let rendered = match &v.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!(
                "- {}: {} (confidence {:.2}, {} tier {})\n",
                key, rendered, v.confidence, v.source, v.tier
            ));
        }
    }

    out.push_str("\n## Phases\n");
    for phase in phases {
        let status = phase.status.as_str();
        let mut line = format!("- {}: {} in {}ms", phase.name, status, phase.duration_ms);
        if phase.cost > 0.0 {
            line.push_str(&format!(", ${:.4}", phase.cost));
        }
        if let Some(error) = &phase.error {
            line.push_str(&format!(" ({error})"));
        }
        if phase.status == PhaseStatus::Skipped {
            if let Some(reason) = phase.metadata.get("reason").and_then(|v| v.as_str()) {
                line.push_str(&format!(" ({reason})"));
            }
        }
        out.push_str(&line);
        out.push('\n');
    }

    out.push_str(&format!("\nTotal cost: ${total_cost:.4}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(key: &str, confidence: f64) -> FieldValue {
        FieldValue {
            field_key: key.into(),
            crm_field: key.to_uppercase(),
            value: serde_json::json!("x"),
            confidence,
            source: "t1".into(),
            tier: 1,
            data_as_of: None,
        }
    }

    #[test]
    fn score_is_mean_required_confidence() {
        let registry = FieldRegistry::default();
        let required = registry.required_keys();
        let mut values = HashMap::new();
        // Fill every required field at 0.8
        for key in &required {
            values.insert(key.to_string(), value(key, 0.8));
        }
        let score = quality_score(&values, &registry);
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn missing_required_fields_drag_the_score_down() {
        let registry = FieldRegistry::default();
        let required = registry.required_keys();
        let mut values = HashMap::new();
        values.insert(required[0].to_string(), value(required[0], 1.0));
        let score = quality_score(&values, &registry);
        assert!((score - 1.0 / required.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn empty_values_score_zero() {
        let registry = FieldRegistry::default();
        assert_eq!(quality_score(&HashMap::new(), &registry), 0.0);
    }

    #[test]
    fn report_lists_fields_phases_and_skip_reasons() {
        let company = Company {
            name: Some("Acme Industrial".into()),
            ..Company::new("https://acme.com")
        };
        let mut values = HashMap::new();
        values.insert("industry".to_string(), value("industry", 0.9));

        let phases = vec![
            PhaseResult::complete("classify"),
            PhaseResult::skipped("t3_extraction", "cost_budget_exceeded"),
        ];
        let report = format_report(&company, &values, &phases, 0.1234);

        assert!(report.contains("Acme Industrial"));
        assert!(report.contains("- industry: x (confidence 0.90"));
        assert!(report.contains("classify: complete"));
        assert!(report.contains("t3_extraction: skipped"));
        assert!(report.contains("cost_budget_exceeded"));
        assert!(report.contains("Total cost: $0.1234"));
    }
}
