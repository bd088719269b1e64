//! Entity detection: the strategy seam between "find spans" and "replace spans"

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::AnonymizeError;
use crate::patterns::{Category, PatternTable};

/// A byte span of personal data found in a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEntity {
    pub category: Category,
    pub value: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// Anything that can find spans of one category in a text.
///
/// The regex engine is the default; statistical or LLM detectors plug in
/// behind the same contract.
pub trait EntityDetector: Send + Sync {
    fn detect(&self, text: &str, category: Category) -> Result<Vec<DetectedEntity>, AnonymizeError>;
}

#[derive(Debug, Clone)]
pub struct RegexDetectionEngine {
    table: PatternTable,
}

impl Default for RegexDetectionEngine {
    fn default() -> Self {
        Self::new(PatternTable::builtin().clone())
    }
}

impl RegexDetectionEngine {
    pub fn new(table: PatternTable) -> Self {
        Self { table }
    }

    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self, AnonymizeError> {
        Ok(Self::new(PatternTable::with_overrides(overrides)?))
    }

    pub fn table(&self) -> &PatternTable {
        &self.table
    }

    /// Every match of every category in `text`, sorted by position.
    ///
    /// Matches of different categories may overlap.
    pub fn detect_all(&self, text: &str, categories: &[Category]) -> Vec<DetectedEntity> {
        let mut entities: Vec<DetectedEntity> = categories
            .iter()
            .flat_map(|&category| self.find(text, category))
            .collect();

        entities.sort_by_key(|e| (e.start, e.end));
        entities
    }

    fn find(&self, text: &str, category: Category) -> Vec<DetectedEntity> {
        let entry = self.table.get(category);

        entry
            .regex
            .find_iter(text)
            .filter(|m| entry.guard.accepts(text, m.start(), m.end()))
            .map(|m| DetectedEntity {
                category,
                value: m.as_str().to_string(),
                start: m.start(),
                end: m.end(),
                confidence: entry.confidence,
            })
            .collect()
    }
}

impl EntityDetector for RegexDetectionEngine {
    fn detect(&self, text: &str, category: Category) -> Result<Vec<DetectedEntity>, AnonymizeError> {
        let entities = self.find(text, category);
        debug!("Regex '{}' matched {} span(s)", category, entities.len());
        Ok(entities)
    }
}

/// Two spans of different categories that claim overlapping text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlap {
    pub first: Category,
    pub second: Category,
    pub start: usize,
    pub end: usize,
}

/// Cross-category overlaps in a position-sorted entity list.
pub fn find_overlaps(entities: &[DetectedEntity]) -> Vec<Overlap> {
    let mut overlaps = Vec::new();

    for (i, a) in entities.iter().enumerate() {
        for b in entities[i + 1..].iter().take_while(|b| b.start < a.end) {
            if a.category != b.category {
                overlaps.push(Overlap {
                    first: a.category,
                    second: b.category,
                    start: b.start,
                    end: a.end.min(b.end),
                });
            }
        }
    }

    overlaps
}
