use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub common_name: String,
    pub scientific_name: String,
    /// 0-100.
    pub confidence_score: f64,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    NeedsAttention,
    Unhealthy,
}

impl HealthStatus {
    /// Label shown to users and copied onto plant records by the catalog.
    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::NeedsAttention => "Needs attention",
            Self::Unhealthy => "Unhealthy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "healthy" => Some(Self::Healthy),
            "needsattention" => Some(Self::NeedsAttention),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "minor" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" | "severe" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub status: HealthStatus,
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<HealthIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareRecommendation {
    pub watering: String,
    pub light: String,
    pub soil: String,
    pub temperature: String,
    pub humidity: String,
    pub additional_tips: String,
    pub summary: String,
    pub home_remedies: String,
    pub cultural_notes: String,
}

/// One completed analysis. Never mutated after it is assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plant_id: Option<String>,
    pub captured_at: String,
    /// Storage-sized copy of the analysed image as a `data:` URL.
    pub image: String,
    pub identification: Identification,
    pub health: HealthAssessment,
    pub care: CareRecommendation,
}

impl AnalysisResult {
    pub fn belongs_to(&self, plant_id: &str) -> bool {
        self.plant_id.as_deref() == Some(plant_id)
    }

    pub fn health_label(&self) -> &'static str {
        self.health.status.label()
    }
}
