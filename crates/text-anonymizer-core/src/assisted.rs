//! AI-assisted anonymization: LLM-detected spans combined with the regex pipeline

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{Config, DetectionMode};
use crate::detection::DetectedEntity;
use crate::error::AnonymizeError;
use crate::ollama::{OllamaClient, OllamaConfig};
use crate::options::ResolvedOptions;
use crate::pipeline::{replace_spans, AnonymizeResult, Pipeline};
use crate::sanitize::sanitize;

pub struct AssistedAnonymizer {
    pipeline: Pipeline,
    ollama_client: Option<OllamaClient>,
    mode: DetectionMode,
}

impl AssistedAnonymizer {
    pub fn new(pipeline: Pipeline, ollama_client: Option<OllamaClient>, mode: DetectionMode) -> Self {
        Self {
            pipeline,
            ollama_client,
            mode,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let pipeline = Pipeline::from_config(config)?;
        let ollama_client = match config.llm.as_ref().filter(|llm| llm.enabled) {
            Some(llm) => Some(OllamaClient::new(OllamaConfig::from(llm), llm.prompt_template.as_deref())?),
            None => None,
        };

        Ok(Self::new(pipeline, ollama_client, config.detection.mode))
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn anonymize(&self, text: &str, options: &ResolvedOptions) -> Result<AnonymizeResult, AnonymizeError> {
        self.pipeline.validate_input(text)?;

        if self.mode == DetectionMode::Regex || text.is_empty() {
            return self.pipeline.anonymize_with_stats(text, options);
        }

        let llm_entities = match self.llm_entities(text).await {
            Some(entities) => entities,
            None => {
                warn!("LLM detection unavailable, using regex-only detection");
                return self.pipeline.anonymize_with_stats(text, options);
            }
        };

        let kept = select_entities(llm_entities, options);
        let replaced = replace_spans(text, &kept);

        let mut result = AnonymizeResult::default();
        for entity in &kept {
            *result.stats.entry(entity.category).or_insert(0) += 1;
        }
        result.entities = kept;
        debug!("LLM spans replaced: {}", result.entities.len());

        match self.mode {
            DetectionMode::Llm => {
                result.text = sanitize(&replaced)?;
            }
            _ => {
                let regex_result = self.pipeline.anonymize_with_stats(&replaced, options)?;
                for (category, count) in regex_result.stats {
                    *result.stats.entry(category).or_insert(0) += count;
                }
                result.entities.extend(regex_result.entities);
                result.overlaps = regex_result.overlaps;
                result.text = regex_result.text;
            }
        }

        info!(
            "Assisted anonymization ({:?}) made {} replacement(s)",
            self.mode,
            result.total_replacements()
        );
        Ok(result)
    }

    /// `None` when no client is configured or the LLM cannot be reached.
    async fn llm_entities(&self, text: &str) -> Option<Vec<DetectedEntity>> {
        let client = self.ollama_client.as_ref()?;

        if !client.health_check().await.unwrap_or(false) {
            debug!("Ollama not available");
            return None;
        }

        match client.extract_entities(text).await {
            Ok(entities) => Some(entities),
            Err(e) => {
                warn!("Ollama extraction failed: {}", e);
                None
            }
        }
    }
}

/// Entities of enabled categories, sorted, with overlapping spans dropped
/// (the earliest, then longest, span wins).
fn select_entities(mut entities: Vec<DetectedEntity>, options: &ResolvedOptions) -> Vec<DetectedEntity> {
    entities.retain(|e| options.is_enabled(e.category));
    entities.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut kept: Vec<DetectedEntity> = Vec::with_capacity(entities.len());
    for entity in entities {
        if kept.last().is_some_and(|last| entity.start < last.end) {
            continue;
        }
        kept.push(entity);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::AnonymizeOptions;
    use crate::patterns::Category;
    use mockito::{Server, ServerGuard};

    fn entity(category: Category, value: &str, start: usize) -> DetectedEntity {
        DetectedEntity {
            category,
            value: value.to_string(),
            start,
            end: start + value.len(),
            confidence: 0.9,
        }
    }

    async fn ollama_server(llm_reply: &str) -> ServerGuard {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models": []}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!({"response": llm_reply, "done": true}).to_string())
            .create_async()
            .await;
        server
    }

    fn anonymizer(server: &ServerGuard, mode: DetectionMode) -> AssistedAnonymizer {
        let config = OllamaConfig {
            endpoint: server.url(),
            enabled: true,
            ..OllamaConfig::default()
        };
        let client = OllamaClient::new(config, None).unwrap();
        AssistedAnonymizer::new(Pipeline::default(), Some(client), mode)
    }

    #[test]
    fn test_select_entities_drops_overlaps_and_disabled() {
        let entities = vec![
            entity(Category::Names, "Anna", 10),
            entity(Category::Names, "Anna Lee", 10),
            entity(Category::Emails, "x@y.zz", 30),
            entity(Category::Dates, "01.01.2020", 40),
            entity(Category::Names, "Lee", 15),
        ];
        let kept = select_entities(entities, &ResolvedOptions::default());

        let values: Vec<&str> = kept.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["Anna Lee", "x@y.zz"]);
    }

    #[tokio::test]
    async fn test_regex_mode_never_calls_llm() {
        let server = Server::new_async().await;
        let anonymizer = anonymizer(&server, DetectionMode::Regex);

        let result = anonymizer
            .anonymize("Пишите на test@example.com", &ResolvedOptions::default())
            .await
            .unwrap();
        assert!(result.text.contains("[EMAIL]"));
    }

    #[tokio::test]
    async fn test_llm_mode_uses_only_llm_spans() {
        let server = ollama_server(r#"{"entities": [{"type": "address", "value": "Москва"}]}"#).await;
        let anonymizer = anonymizer(&server, DetectionMode::Llm);
        let options = AnonymizeOptions::default().with(Category::Addresses, true).resolve();

        let result = anonymizer
            .anonymize("живу в Москва, почта test@example.com", &options)
            .await
            .unwrap();

        assert_eq!(result.text, "живу в [АДРЕС], почта test@example.com");
        assert_eq!(result.stats.get(&Category::Addresses), Some(&1));
    }

    #[tokio::test]
    async fn test_regex_llm_mode_combines_both() {
        let server = ollama_server(r#"{"entities": [{"type": "person_name", "value": "петров"}]}"#).await;
        let anonymizer = anonymizer(&server, DetectionMode::RegexLlm);

        let result = anonymizer
            .anonymize("пишите петров на test@example.com", &ResolvedOptions::default())
            .await
            .unwrap();

        assert_eq!(result.text, "пишите [ИМЯ] на [EMAIL]");
        assert_eq!(result.stats.get(&Category::Names), Some(&1));
        assert_eq!(result.stats.get(&Category::Emails), Some(&1));
    }

    #[tokio::test]
    async fn test_llm_spans_for_disabled_categories_are_ignored() {
        let server = ollama_server(r#"{"entities": [{"type": "ip_address", "value": "10.0.0.1"}]}"#).await;
        let anonymizer = anonymizer(&server, DetectionMode::Llm);

        let result = anonymizer
            .anonymize("host 10.0.0.1", &ResolvedOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "host 10.0.0.1");
    }

    #[tokio::test]
    async fn test_unreachable_llm_falls_back_to_regex() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(503)
            .create_async()
            .await;
        let anonymizer = anonymizer(&server, DetectionMode::Llm);

        let result = anonymizer
            .anonymize("Пишите на test@example.com", &ResolvedOptions::default())
            .await
            .unwrap();
        assert!(result.text.contains("[EMAIL]"));
    }

    #[tokio::test]
    async fn test_output_is_sanitized_in_llm_mode() {
        let server = ollama_server(r#"{"entities": []}"#).await;
        let anonymizer = anonymizer(&server, DetectionMode::Llm);

        let result = anonymizer
            .anonymize("<b>hello</b><script>x()</script>", &ResolvedOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "hello");
    }

    #[tokio::test]
    async fn test_input_limit_applies_before_llm() {
        let server = Server::new_async().await;
        let client = OllamaClient::new(
            OllamaConfig { endpoint: server.url(), enabled: true, ..OllamaConfig::default() },
            None,
        )
        .unwrap();
        let anonymizer = AssistedAnonymizer::new(
            Pipeline::default().with_max_input_bytes(2),
            Some(client),
            DetectionMode::Llm,
        );

        let err = anonymizer.anonymize("abc", &ResolvedOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
