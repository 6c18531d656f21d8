//! Turning free-form model replies into plant records.
//!
//! Replies are expected to hold one JSON object, possibly wrapped in prose or
//! a code fence. Every field has a fallback so a sparse reply still produces a
//! complete record.

use std::fmt;

use serde_json::{Map, Value};
use verdant_contracts::plant::{
    CareRecommendation, HealthAssessment, HealthIssue, HealthStatus, Identification, Severity,
};

pub const DEFAULT_COMMON_NAME: &str = "Unknown Plant";
pub const DEFAULT_SCIENTIFIC_NAME: &str = "Species unknown";
pub const DEFAULT_DESCRIPTION: &str = "No description available";
pub const DEFAULT_HEALTH_SUMMARY: &str = "Unable to determine plant health status";
pub const DEFAULT_ISSUE_NAME: &str = "Unspecified issue";
pub const DEFAULT_WATERING: &str = "Water when the top inch of soil feels dry.";
pub const DEFAULT_LIGHT: &str = "Provide bright, indirect light.";
pub const DEFAULT_SOIL: &str = "Use well-draining potting mix.";
pub const DEFAULT_TEMPERATURE: &str = "Keep in normal room temperature (65-75°F/18-24°C).";
pub const DEFAULT_HUMIDITY: &str = "Average humidity levels recommended";
pub const DEFAULT_ADDITIONAL_TIPS: &str = "Regularly check for pests and diseases.";
pub const DEFAULT_HOME_REMEDIES: &str = "No specific home remedies information available.";
pub const DEFAULT_CULTURAL_NOTES: &str =
    "No specific cultural significance information available.";

const MAX_TAGS: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ParseError {}

fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

/// Extracts the span from the first `{` to the last `}` and parses it.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, ParseError> {
    let raw = strip_code_fence(text);
    if raw.is_empty() {
        return Err(ParseError::new("model reply was empty"));
    }
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err(ParseError::new("model reply contained no JSON object"));
    };
    if end < start {
        return Err(ParseError::new("model reply contained no JSON object"));
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(ParseError::new("model reply JSON was not an object")),
        Err(err) => Err(ParseError::new(format!(
            "model reply JSON did not parse: {err}"
        ))),
    }
}

pub fn identification_from(object: &Map<String, Value>) -> Identification {
    Identification {
        common_name: text_field(object, &["name", "commonName"])
            .unwrap_or_else(|| DEFAULT_COMMON_NAME.to_string()),
        scientific_name: text_field(object, &["scientificName", "scientific_name"])
            .unwrap_or_else(|| DEFAULT_SCIENTIFIC_NAME.to_string()),
        confidence_score: confidence_field(object, &["confidence", "confidenceScore"]),
        description: text_field(object, &["description"])
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        tags: tag_list(object.get("tags")),
    }
}

pub fn health_from(object: &Map<String, Value>) -> HealthAssessment {
    let status = text_field(object, &["status"])
        .and_then(|raw| HealthStatus::parse(&raw))
        .unwrap_or(HealthStatus::NeedsAttention);
    let issues = match object.get("issues") {
        Some(Value::Array(rows)) => rows.iter().filter_map(issue_from).collect(),
        _ => Vec::new(),
    };
    HealthAssessment {
        status,
        summary: text_field(object, &["summary"])
            .unwrap_or_else(|| DEFAULT_HEALTH_SUMMARY.to_string()),
        issues,
    }
}

fn issue_from(row: &Value) -> Option<HealthIssue> {
    match row {
        Value::Object(issue) => Some(HealthIssue {
            name: text_field(issue, &["name"]).unwrap_or_else(|| DEFAULT_ISSUE_NAME.to_string()),
            description: text_field(issue, &["description"])
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            severity: text_field(issue, &["severity"])
                .and_then(|raw| Severity::parse(&raw))
                .unwrap_or(Severity::Medium),
            solution: text_field(issue, &["solution"]),
        }),
        Value::String(name) if !name.trim().is_empty() => Some(HealthIssue {
            name: name.trim().to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            severity: Severity::Medium,
            solution: None,
        }),
        _ => None,
    }
}

/// `plant_name` only feeds the fallback summary.
pub fn care_from(object: &Map<String, Value>, plant_name: &str) -> CareRecommendation {
    let field = |keys: &[&str], default: &str| {
        text_field(object, keys).unwrap_or_else(|| default.to_string())
    };
    CareRecommendation {
        watering: field(&["watering"], DEFAULT_WATERING),
        light: field(&["light"], DEFAULT_LIGHT),
        soil: field(&["soil"], DEFAULT_SOIL),
        temperature: field(&["temperature"], DEFAULT_TEMPERATURE),
        humidity: field(&["humidity"], DEFAULT_HUMIDITY),
        additional_tips: field(&["additionalTips"], DEFAULT_ADDITIONAL_TIPS),
        summary: text_field(object, &["summary"]).unwrap_or_else(|| default_care_summary(plant_name)),
        home_remedies: field(&["homeRemedies"], DEFAULT_HOME_REMEDIES),
        cultural_notes: field(
            &["culturalSignificance", "culturalNotes"],
            DEFAULT_CULTURAL_NOTES,
        ),
    }
}

pub fn default_care_summary(plant_name: &str) -> String {
    format!(
        "Care guide for {plant_name}. Water appropriately, provide adequate light, and monitor regularly."
    )
}

/// First key holding a usable value. Null and blank strings count as absent;
/// structured values are rendered as compact JSON text.
fn text_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(value_as_text)
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(rows) if rows.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        structured => serde_json::to_string(structured).ok(),
    }
}

fn confidence_field(object: &Map<String, Value>, keys: &[&str]) -> f64 {
    let parsed = keys.iter().filter_map(|key| object.get(*key)).find_map(|row| match row {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    });
    parsed
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
        .clamp(0.0, 100.0)
}

fn tag_list(value: Option<&Value>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let raw_items: Vec<String> = match value {
        Value::Array(rows) => rows.iter().filter_map(value_as_text).collect(),
        Value::String(text) => text.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let mut cleaned: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for row in raw_items {
        let text = row.split_whitespace().collect::<Vec<&str>>().join(" ");
        if text.is_empty() {
            continue;
        }
        let key = text.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        cleaned.push(text);
        if cleaned.len() >= MAX_TAGS {
            break;
        }
    }
    cleaned
}
