//! Configuration management for text-anonymizer

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::options::AnonymizeOptions;
use crate::patterns::PatternTable;

/// Inputs larger than this are rejected unless the config says otherwise.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub options: AnonymizeOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub mode: DetectionMode,
    pub max_input_bytes: usize,
    pub report_overlaps: bool,
    /// Per-category regex overrides, keyed by category name.
    pub patterns: HashMap<String, String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Regex,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            report_overlaps: false,
            patterns: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    #[default]
    Regex,
    Llm,
    #[serde(rename = "regex_llm")]
    RegexLlm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub model: String,
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub prompt_template: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "llama3.2:3b".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            timeout_seconds: 300,
            prompt_template: None,
        }
    }
}

impl Config {
    pub fn get_app_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "text-anonymizer", "text-anonymizer")
            .ok_or_else(|| anyhow::anyhow!("Failed to determine application directories"))
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn get_default_config_path() -> Result<PathBuf> {
        let project_dirs = Self::get_app_dirs()?;
        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("text-anonymizer.toml"))
    }

    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Compiled pattern table for this configuration.
    pub fn pattern_table(&self) -> Result<PatternTable> {
        PatternTable::with_overrides(&self.detection.patterns).map_err(anyhow::Error::from)
    }

    pub fn validate(&self) -> Result<()> {
        self.pattern_table()?;

        if self.detection.max_input_bytes == 0 {
            return Err(anyhow::anyhow!("max_input_bytes must be greater than zero"));
        }

        if let Some(llm) = &self.llm {
            if llm.enabled && llm.timeout_seconds == 0 {
                return Err(anyhow::anyhow!("LLM timeout_seconds must be greater than zero"));
            }
        }

        if self.detection.mode != DetectionMode::Regex
            && !self.llm.as_ref().is_some_and(|llm| llm.enabled)
        {
            tracing::warn!(
                "Detection mode {:?} requested without an enabled [llm] section; falling back to regex at runtime",
                self.detection.mode
            );
        }

        Ok(())
    }
}
