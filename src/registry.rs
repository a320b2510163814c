//! Field registry: the downstream schema every extracted answer must
//! validate against before it becomes a field value.
//!
//! Each entry maps a field key to its downstream-system field name, value
//! type, and constraints. Coercion is deliberately forgiving about input
//! shape (models return numbers as strings, booleans as "yes") and strict
//! about output type.

use crate::model::{Answer, FieldValue};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Value types the downstream system accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Url,
    Email,
    Phone,
}

/// Schema entry for one field key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field name in the downstream system.
    pub crm_field: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Regex the stringified value must match, when set.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Required fields weigh into the quality score.
    #[serde(default)]
    pub required: bool,
}

impl FieldMapping {
    fn new(crm_field: &str, field_type: FieldType) -> Self {
        Self {
            crm_field: crm_field.to_string(),
            field_type,
            max_length: None,
            pattern: None,
            required: false,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn with_max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    fn with_pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }
}

/// The registry of known field keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRegistry {
    pub fields: HashMap<String, FieldMapping>,
}

impl Default for FieldRegistry {
    fn default() -> Self {
        let mut fields = HashMap::new();
        let mut add = |key: &str, mapping: FieldMapping| {
            fields.insert(key.to_string(), mapping);
        };

        add(
            "company_name",
            FieldMapping::new("Name", FieldType::Text)
                .required()
                .with_max_length(255),
        );
        add("website", FieldMapping::new("Website", FieldType::Url).required());
        add(
            "industry",
            FieldMapping::new("Industry", FieldType::Text)
                .required()
                .with_max_length(255),
        );
        add(
            "naics_code",
            FieldMapping::new("NAICS_Code__c", FieldType::Text).with_pattern(r"^\d{2,6}$"),
        );
        add(
            "description",
            FieldMapping::new("Description", FieldType::Text).with_max_length(32_000),
        );
        add(
            "employee_count",
            FieldMapping::new("NumberOfEmployees", FieldType::Integer).required(),
        );
        add(
            "revenue_estimate",
            FieldMapping::new("AnnualRevenue", FieldType::Float),
        );
        add(
            "year_founded",
            FieldMapping::new("Year_Founded__c", FieldType::Integer).with_pattern(r"^(18|19|20)\d{2}$"),
        );
        add(
            "business_model",
            FieldMapping::new("Business_Model__c", FieldType::Text).with_max_length(80),
        );
        add("services", FieldMapping::new("Services__c", FieldType::Text).with_max_length(4_000));
        add(
            "customer_segments",
            FieldMapping::new("Customer_Segments__c", FieldType::Text).with_max_length(1_000),
        );
        add("phone", FieldMapping::new("Phone", FieldType::Phone));
        add("email", FieldMapping::new("Email__c", FieldType::Email));
        add("address_city", FieldMapping::new("BillingCity", FieldType::Text).with_max_length(120));
        add(
            "address_state",
            FieldMapping::new("BillingState", FieldType::Text).with_max_length(80),
        );
        add(
            "address_zip",
            FieldMapping::new("BillingPostalCode", FieldType::Text).with_max_length(20),
        );
        add("linkedin_url", FieldMapping::new("LinkedIn_URL__c", FieldType::Url));
        add("owner_name", FieldMapping::new("Owner_Name__c", FieldType::Text).with_max_length(255));
        add(
            "is_family_owned",
            FieldMapping::new("Family_Owned__c", FieldType::Boolean),
        );
        add(
            "is_franchise",
            FieldMapping::new("Franchise__c", FieldType::Boolean),
        );
        add(
            "loan_amount",
            FieldMapping::new("PPP_Loan_Amount__c", FieldType::Float),
        );
        add(
            "location_count",
            FieldMapping::new("Location_Count__c", FieldType::Integer),
        );

        Self { fields }
    }
}

impl FieldRegistry {
    /// Load a registry from TOML, or the compiled-in default when the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read field registry: {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse field registry TOML")
    }

    pub fn get(&self, field_key: &str) -> Option<&FieldMapping> {
        self.fields.get(field_key)
    }

    /// Keys marked required, for quality scoring.
    pub fn required_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .fields
            .iter()
            .filter(|(_, m)| m.required)
            .map(|(k, _)| k.as_str())
            .collect();
        keys.sort();
        keys
    }

    /// Validate and coerce an answer into a field value.
    ///
    /// Returns `None` when the field key is unknown, the answer carries no
    /// value, or coercion fails; such answers produce no field value.
    pub fn validate(&self, answer: &Answer) -> Option<FieldValue> {
        let mapping = self.get(&answer.field_key)?;
        if !answer.has_value() {
            return None;
        }
        let value = coerce(mapping, &answer.value)?;
        Some(FieldValue {
            field_key: answer.field_key.clone(),
            crm_field: mapping.crm_field.clone(),
            value,
            confidence: answer.confidence,
            source: answer.source.clone(),
            tier: answer.tier,
            data_as_of: answer.data_as_of,
        })
    }
}

/// Coerce a raw extracted value to the mapping's type.
pub fn coerce(mapping: &FieldMapping, value: &serde_json::Value) -> Option<serde_json::Value> {
    use serde_json::Value;
    match mapping.field_type {
        FieldType::Text => {
            let mut s = stringify(value)?;
            if let Some(max) = mapping.max_length {
                if s.chars().count() > max {
                    s = s.chars().take(max).collect();
                }
            }
            if let Some(pattern) = &mapping.pattern {
                let re = regex::Regex::new(pattern).ok()?;
                if !re.is_match(&s) {
                    return None;
                }
            }
            Some(Value::String(s))
        }
        FieldType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(|i| serde_json::json!(i)),
            Value::String(s) => s.replace(',', "").trim().parse::<i64>().ok().map(|i| serde_json::json!(i)),
            _ => None,
        },
        FieldType::Float => match value {
            Value::Number(n) => n.as_f64().map(|f| serde_json::json!(f)),
            Value::String(s) => {
                let cleaned = s.trim().trim_start_matches(['$', '€', '£']).replace(',', "");
                cleaned.trim().parse::<f64>().ok().map(|f| serde_json::json!(f))
            }
            _ => None,
        },
        FieldType::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(n) => Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            _ => None,
        },
        FieldType::Url => {
            let s = stringify(value)?;
            let s = s.trim().to_string();
            if s.starts_with("http://") || s.starts_with("https://") {
                Some(Value::String(s))
            } else {
                None
            }
        }
        FieldType::Email => {
            let s = stringify(value)?;
            let s = s.trim().to_string();
            if s.contains('@') { Some(Value::String(s)) } else { None }
        }
        FieldType::Phone => {
            let s = stringify(value)?;
            let kept: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.' | ' '))
                .collect();
            let digits = kept.chars().filter(char::is_ascii_digit).count();
            if digits >= 7 {
                Some(Value::String(kept.trim().to_string()))
            } else {
                None
            }
        }
    }
}

fn stringify(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
