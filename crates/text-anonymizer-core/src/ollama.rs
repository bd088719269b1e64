//! Ollama LLM integration for Named Entity Recognition
//!
//! This module provides integration with Ollama for AI-assisted personal data
//! detection, with support for health checks and response parsing. Entity labels
//! returned by the model are mapped onto anonymizer categories.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::config::LlmConfig;
use crate::detection::DetectedEntity;
use crate::patterns::Category;
use crate::prompt_loader::PromptLoader;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub enabled: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_seconds: 30,
            enabled: false,
        }
    }
}

impl From<&LlmConfig> for OllamaConfig {
    fn from(llm: &LlmConfig) -> Self {
        Self {
            endpoint: llm.endpoint.clone(),
            model: llm.model.clone(),
            timeout_seconds: llm.timeout_seconds,
            enabled: llm.enabled,
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub entities: Vec<LlmDetectedEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmDetectedEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.8
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    config: OllamaConfig,
    prompt_template: String,
}

impl OllamaClient {
    /// Client using the built-in prompt, or the named template from the
    /// prompts directory.
    pub fn new(config: OllamaConfig, prompt_template: Option<&str>) -> Result<Self> {
        let template = match prompt_template {
            None => PromptLoader::builtin().to_string(),
            Some(name) => PromptLoader::new()?.load_prompt(Some(name))?,
        };
        Self::with_template(config, template)
    }

    pub fn with_template(config: OllamaConfig, prompt_template: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            config,
            prompt_template,
        })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    pub async fn extract_entities(&self, text: &str) -> Result<Vec<DetectedEntity>> {
        if !self.config.enabled {
            debug!("Ollama client is disabled, returning empty entities");
            return Ok(vec![]);
        }

        debug!("Sending text to Ollama for LLM detection: {} bytes", text.len());

        let prompt = PromptLoader::format_prompt(&self.prompt_template, text);
        let response = self.call_ollama(&prompt).await?;

        self.parse_llm_response(&response, text)
    }

    async fn call_ollama(&self, prompt: &str) -> Result<String> {
        let request = OllamaRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: 0.0,  // deterministic JSON output
                top_p: 0.1,
                num_predict: 500,
            },
        };

        debug!("Making request to Ollama: {}/api/generate", self.config.endpoint);

        let response = self.client
            .post(format!("{}/api/generate", self.config.endpoint))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Ollama request failed with status {}: {}", status, error_text);
            return Err(anyhow::anyhow!("Ollama request failed: {} - {}", status, error_text));
        }

        let ollama_response: OllamaResponse = response.json().await?;

        if !ollama_response.done {
            warn!("Received incomplete response from Ollama");
        }

        debug!("Received response from Ollama: {} characters", ollama_response.response.len());
        Ok(ollama_response.response)
    }

    fn parse_llm_response(&self, response: &str, original_text: &str) -> Result<Vec<DetectedEntity>> {
        let json_str = self.extract_json_from_response(response)?;

        let llm_response: LlmResponse = serde_json::from_str(&json_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM JSON response: {}", e))?;

        let mut entities = Vec::new();

        for llm_entity in llm_response.entities {
            let category = match llm_entity.entity_type.parse::<Category>() {
                Ok(category) => category,
                Err(_) => {
                    warn!("Skipping LLM entity with unsupported type '{}'", llm_entity.entity_type);
                    continue;
                }
            };

            if llm_entity.value.is_empty() {
                continue;
            }

            let reported = (llm_entity.start < llm_entity.end)
                .then(|| original_text.get(llm_entity.start..llm_entity.end))
                .flatten();

            let (start, end) = match reported {
                Some(actual) if actual == llm_entity.value => (llm_entity.start, llm_entity.end),
                _ => {
                    if llm_entity.start != 0 || llm_entity.end != 0 {
                        debug!(
                            "LLM reported a bad position {}-{} for a '{}' entity, searching instead",
                            llm_entity.start, llm_entity.end, category
                        );
                    }
                    match self.find_entity_position(original_text, &llm_entity.value) {
                        Some(position) => position,
                        None => {
                            warn!("Could not locate a '{}' entity reported by the LLM", category);
                            continue;
                        }
                    }
                }
            };

            entities.push(DetectedEntity {
                category,
                value: llm_entity.value,
                start,
                end,
                confidence: llm_entity.confidence,
            });
        }

        info!("Ollama extracted {} entities", entities.len());
        Ok(entities)
    }

    fn extract_json_from_response(&self, response: &str) -> Result<String> {
        // Ollama sometimes echoes the template's doubled braces
        let fixed_response = response.replace("{{", "{").replace("}}", "}");

        if let Some(start) = fixed_response.find('{') {
            let mut brace_count = 0;
            let mut end_pos = None;

            for (i, ch) in fixed_response[start..].char_indices() {
                match ch {
                    '{' => brace_count += 1,
                    '}' => {
                        brace_count -= 1;
                        if brace_count == 0 {
                            end_pos = Some(start + i);
                            break;
                        }
                    }
                    _ => {}
                }
            }

            if let Some(end_pos) = end_pos {
                let json_str = &fixed_response[start..=end_pos];
                if serde_json::from_str::<serde_json::Value>(json_str).is_ok() {
                    return Ok(json_str.to_string());
                }
            }
        }

        let trimmed = fixed_response.trim();
        if trimmed.starts_with('{')
            && trimmed.ends_with('}')
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
        {
            return Ok(trimmed.to_string());
        }

        Err(anyhow::anyhow!("No valid JSON found in Ollama response"))
    }

    fn find_entity_position(&self, text: &str, entity_value: &str) -> Option<(usize, usize)> {
        text.find(entity_value)
            .map(|start| (start, start + entity_value.len()))
    }

    pub async fn health_check(&self) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        debug!("Performing Ollama health check");

        let response = self.client
            .get(format!("{}/api/tags", self.config.endpoint))
            .send()
            .await?;

        let is_healthy = response.status().is_success();

        if is_healthy {
            info!("Ollama health check passed");
        } else {
            warn!("Ollama health check failed: {}", response.status());
        }

        Ok(is_healthy)
    }
}
