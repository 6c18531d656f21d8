use std::env;
use std::path::PathBuf;

use verdant_contracts::store::{DEFAULT_QUOTA_BYTES, MAX_STORED_RESULTS};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Pipeline knobs. Every value has a default and environment overrides are
/// clamped into a sane range rather than rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub api_base: String,
    pub primary_model: Option<String>,
    pub secondary_model: Option<String>,
    pub max_dimension: u32,
    pub transcode_quality: u8,
    pub storage_max_dimension: u32,
    pub storage_quality: u8,
    pub max_stored_results: usize,
    pub request_timeout_s: f64,
    pub store_quota_bytes: usize,
    pub home: PathBuf,
    /// Overrides `<home>/store`.
    pub store_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            primary_model: None,
            secondary_model: None,
            max_dimension: 1024,
            transcode_quality: 90,
            storage_max_dimension: 768,
            storage_quality: 60,
            max_stored_results: MAX_STORED_RESULTS,
            request_timeout_s: 90.0,
            store_quota_bytes: DEFAULT_QUOTA_BYTES,
            home: default_home(),
            store_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Self {
            api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            primary_model: get("VERDANT_PRIMARY_MODEL"),
            secondary_model: get("VERDANT_SECONDARY_MODEL"),
            max_dimension: clamped(get("VERDANT_MAX_DIMENSION"), defaults.max_dimension as f64, 128.0, 4096.0)
                as u32,
            transcode_quality: defaults.transcode_quality,
            storage_max_dimension: clamped(
                get("VERDANT_STORAGE_MAX_DIMENSION"),
                defaults.storage_max_dimension as f64,
                64.0,
                2048.0,
            ) as u32,
            storage_quality: defaults.storage_quality,
            max_stored_results: clamped(
                get("VERDANT_MAX_STORED_RESULTS"),
                defaults.max_stored_results as f64,
                1.0,
                500.0,
            ) as usize,
            request_timeout_s: clamped(
                get("VERDANT_REQUEST_TIMEOUT"),
                defaults.request_timeout_s,
                5.0,
                300.0,
            ),
            store_quota_bytes: clamped(
                get("VERDANT_STORE_QUOTA_BYTES"),
                defaults.store_quota_bytes as f64,
                1024.0,
                1024.0 * 1024.0 * 1024.0,
            ) as usize,
            home: get("VERDANT_HOME").map(PathBuf::from).unwrap_or(defaults.home),
            store_dir: get("VERDANT_STORE_DIR").map(PathBuf::from),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| self.home.join("store"))
    }

    pub fn events_path(&self) -> PathBuf {
        self.home.join("events.jsonl")
    }
}

/// `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
pub fn gemini_api_key() -> Option<String> {
    non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn clamped(raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn default_home() -> PathBuf {
    env::var("HOME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| PathBuf::from(value).join(".verdant"))
        .unwrap_or_else(|| PathBuf::from(".verdant"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::PipelineConfig;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]);
        let defaults = PipelineConfig::default();
        assert_eq!(config, defaults);
        assert_eq!(config.max_dimension, 1024);
        assert_eq!(config.max_stored_results, 20);
        assert_eq!(config.storage_quality, 60);
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let config = config_from(&[
            ("GEMINI_API_BASE", "http://localhost:8080/v1beta/"),
            ("VERDANT_PRIMARY_MODEL", " gemini-2.0-flash "),
            ("VERDANT_MAX_DIMENSION", "99999"),
            ("VERDANT_MAX_STORED_RESULTS", "0"),
            ("VERDANT_REQUEST_TIMEOUT", "not-a-number"),
            ("VERDANT_HOME", "/tmp/verdant-home"),
        ]);
        assert_eq!(config.api_base, "http://localhost:8080/v1beta");
        assert_eq!(config.primary_model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(config.max_dimension, 4096);
        assert_eq!(config.max_stored_results, 1);
        assert_eq!(config.request_timeout_s, 90.0);
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/verdant-home/store"));
        assert_eq!(
            config.events_path(),
            PathBuf::from("/tmp/verdant-home/events.jsonl")
        );
    }

    #[test]
    fn store_dir_override_wins_over_home() {
        let config = config_from(&[
            ("VERDANT_HOME", "/tmp/verdant-home"),
            ("VERDANT_STORE_DIR", "/srv/plants"),
        ]);
        assert_eq!(config.store_dir(), PathBuf::from("/srv/plants"));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = config_from(&[("VERDANT_SECONDARY_MODEL", "   ")]);
        assert_eq!(config.secondary_model, None);
    }
}
