//! Ordered substitution pipeline
//!
//! Categories run one after another over the output of the previous one, in
//! [`Category::PIPELINE_ORDER`]. Each active category's spans are replaced by
//! its placeholder; the result is then passed through the sanitizer.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, DEFAULT_MAX_INPUT_BYTES};
use crate::detection::{find_overlaps, DetectedEntity, EntityDetector, Overlap, RegexDetectionEngine};
use crate::error::{AnonymizeError, ErrorKind};
use crate::options::ResolvedOptions;
use crate::patterns::Category;
use crate::sanitize::sanitize;

/// Progress of one run, 0 to 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

impl Progress {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnonymizeResult {
    pub text: String,
    /// Replacements per category; only categories that ran are present.
    pub stats: BTreeMap<Category, usize>,
    /// Replaced spans, positioned in the text as it was when their category ran.
    pub entities: Vec<DetectedEntity>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overlaps: Vec<Overlap>,
}

impl AnonymizeResult {
    pub fn total_replacements(&self) -> usize {
        self.stats.values().sum()
    }
}

/// Hooks for a controlled run: cooperative cancellation and progress.
#[derive(Default)]
pub struct RunControl<'a> {
    pub cancel: Option<&'a AtomicBool>,
    pub on_progress: Option<&'a mut dyn FnMut(Progress)>,
}

impl RunControl<'_> {
    fn check_cancelled(&self) -> Result<(), AnonymizeError> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(AnonymizeError::terminated()),
            _ => Ok(()),
        }
    }

    fn report(&mut self, percent: u8, message: impl Into<String>) {
        if let Some(callback) = self.on_progress.as_deref_mut() {
            callback(Progress::new(percent, message));
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    detector: Arc<dyn EntityDetector>,
    max_input_bytes: usize,
    report_overlaps: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Arc::new(RegexDetectionEngine::default()))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("max_input_bytes", &self.max_input_bytes)
            .field("report_overlaps", &self.report_overlaps)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(detector: Arc<dyn EntityDetector>) -> Self {
        Self {
            detector,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            report_overlaps: false,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, AnonymizeError> {
        let engine = RegexDetectionEngine::with_overrides(&config.detection.patterns)?;
        Ok(Self::new(Arc::new(engine))
            .with_max_input_bytes(config.detection.max_input_bytes)
            .with_overlap_report(config.detection.report_overlaps))
    }

    pub fn with_max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }

    pub fn with_overlap_report(mut self, enabled: bool) -> Self {
        self.report_overlaps = enabled;
        self
    }

    pub fn anonymize(&self, text: &str, options: &ResolvedOptions) -> Result<String, AnonymizeError> {
        Ok(self.anonymize_with_stats(text, options)?.text)
    }

    pub fn anonymize_with_stats(
        &self,
        text: &str,
        options: &ResolvedOptions,
    ) -> Result<AnonymizeResult, AnonymizeError> {
        self.run(text, options, RunControl::default())
    }

    /// Substitution without the sanitizer pass.
    pub fn substitute(&self, text: &str, options: &ResolvedOptions) -> Result<AnonymizeResult, AnonymizeError> {
        self.validate_input(text)?;
        let mut control = RunControl::default();
        self.substitute_controlled(text, options, &mut control, options.enabled_categories().len() + 1)
    }

    pub fn run(
        &self,
        text: &str,
        options: &ResolvedOptions,
        mut control: RunControl<'_>,
    ) -> Result<AnonymizeResult, AnonymizeError> {
        self.validate_input(text)?;
        control.report(0, "started");

        // One step per active category plus the sanitizer.
        let steps = options.enabled_categories().len() + 1;
        let mut result = self.substitute_controlled(text, options, &mut control, steps)?;

        control.check_cancelled()?;
        result.text = sanitize(&result.text)?;
        control.report(step_percent(steps, steps), "sanitized");

        info!(
            "Anonymized {} bytes: {} replacement(s) across {} active categor(ies)",
            text.len(),
            result.total_replacements(),
            result.stats.len()
        );

        control.report(100, "completed");
        Ok(result)
    }

    pub(crate) fn validate_input(&self, text: &str) -> Result<(), AnonymizeError> {
        if text.len() > self.max_input_bytes {
            return Err(AnonymizeError::validation("input text is too large").with_details(format!(
                "{} bytes exceeds the limit of {} bytes",
                text.len(),
                self.max_input_bytes
            )));
        }
        Ok(())
    }

    fn substitute_controlled(
        &self,
        text: &str,
        options: &ResolvedOptions,
        control: &mut RunControl<'_>,
        steps: usize,
    ) -> Result<AnonymizeResult, AnonymizeError> {
        let mut result = AnonymizeResult::default();

        if self.report_overlaps {
            result.overlaps = self.overlaps_in(text, options)?;
        }

        let mut current = text.to_string();
        for (index, category) in options.enabled_categories().into_iter().enumerate() {
            control.check_cancelled()?;

            let mut entities = if current.is_empty() {
                Vec::new()
            } else {
                self.detector
                    .detect(&current, category)
                    .map_err(|e| attribute_to(category, e))?
            };
            validate_spans(&current, category, &mut entities)?;

            if !entities.is_empty() {
                current = replace_spans(&current, &entities);
            }
            debug!("Replaced {} '{}' span(s)", entities.len(), category);

            result.stats.insert(category, entities.len());
            result.entities.extend(entities);
            control.report(step_percent(index + 1, steps), format!("{} processed", category));
        }

        result.text = current;
        Ok(result)
    }

    fn overlaps_in(&self, text: &str, options: &ResolvedOptions) -> Result<Vec<Overlap>, AnonymizeError> {
        let mut all = Vec::new();
        for category in options.enabled_categories() {
            let entities = self
                .detector
                .detect(text, category)
                .map_err(|e| attribute_to(category, e))?;
            all.extend(entities);
        }
        all.sort_by_key(|e| (e.start, e.end));

        let overlaps = find_overlaps(&all);
        for overlap in &overlaps {
            warn!(
                "Overlapping spans: '{}' and '{}' both claim bytes {}..{}; '{}' runs first",
                overlap.first,
                overlap.second,
                overlap.start,
                overlap.end,
                earlier_in_pipeline(overlap.first, overlap.second)
            );
        }
        Ok(overlaps)
    }
}

/// Detector failures surface as `REGEX_ERROR` naming the failing category.
fn attribute_to(category: Category, err: AnonymizeError) -> AnonymizeError {
    if err.kind == ErrorKind::Regex {
        return err;
    }
    let details = match err.details {
        Some(details) => format!("category={}; {}", category, details),
        None => format!("category={}", category),
    };
    AnonymizeError::new(ErrorKind::Regex, err.message).with_details(details)
}

fn earlier_in_pipeline(a: Category, b: Category) -> Category {
    a.min(b)
}

/// Progress after `done` of `steps` steps, kept below 100 until completion.
fn step_percent(done: usize, steps: usize) -> u8 {
    if steps == 0 {
        return 99;
    }
    ((done * 99) / steps).min(99) as u8
}

/// Sorts and checks a detector's spans before they are spliced.
///
/// Any out-of-range, misaligned, mismatched or overlapping span fails the
/// whole category so that no partially-anonymized text escapes.
fn validate_spans(
    text: &str,
    category: Category,
    entities: &mut [DetectedEntity],
) -> Result<(), AnonymizeError> {
    entities.sort_by_key(|e| (e.start, e.end));

    let mut last_end = 0;
    for entity in entities.iter() {
        let reason = if entity.category != category {
            Some("span reported for another category")
        } else if entity.start >= entity.end {
            Some("empty or inverted span")
        } else if entity.end > text.len() {
            Some("span out of bounds")
        } else if !text.is_char_boundary(entity.start) || !text.is_char_boundary(entity.end) {
            Some("span not on a character boundary")
        } else if text[entity.start..entity.end] != entity.value {
            Some("span does not match the reported value")
        } else if entity.start < last_end {
            Some("overlapping spans")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(AnonymizeError::regex(category, format!("rule for '{}' failed: {}", category, reason))
                .with_details(format!("category={}; span={}..{}", category, entity.start, entity.end)));
        }
        last_end = entity.end;
    }

    Ok(())
}

/// Replaces each (sorted, disjoint) span with its category's placeholder.
pub(crate) fn replace_spans(text: &str, entities: &[DetectedEntity]) -> String {
    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;

    for entity in entities {
        result.push_str(&text[last_end..entity.start]);
        result.push_str(entity.category.placeholder());
        last_end = entity.end;
    }

    result.push_str(&text[last_end..]);
    result
}

/// Anonymizes `text` with the built-in pattern table.
pub fn anonymize(text: &str, options: &ResolvedOptions) -> Result<String, AnonymizeError> {
    Pipeline::default().anonymize(text, options)
}

/// Like [`anonymize`], also returning per-category statistics and spans.
pub fn anonymize_with_stats(text: &str, options: &ResolvedOptions) -> Result<AnonymizeResult, AnonymizeError> {
    Pipeline::default().anonymize_with_stats(text, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::options::AnonymizeOptions;

    struct FixedDetector(Vec<DetectedEntity>);

    impl EntityDetector for FixedDetector {
        fn detect(&self, _text: &str, _category: Category) -> Result<Vec<DetectedEntity>, AnonymizeError> {
            Ok(self.0.clone())
        }
    }

    fn entity(category: Category, value: &str, start: usize) -> DetectedEntity {
        DetectedEntity {
            category,
            value: value.to_string(),
            start,
            end: start + value.len(),
            confidence: 1.0,
        }
    }

    fn only(categories: &[Category]) -> ResolvedOptions {
        AnonymizeOptions::only(categories).resolve()
    }

    #[test]
    fn test_empty_input() {
        for options in [ResolvedOptions::default(), ResolvedOptions::all(), ResolvedOptions::none()] {
            assert_eq!(anonymize("", &options).unwrap(), "");
        }
    }

    #[test]
    fn test_identity_on_no_match() {
        let text = "просто текст без личных данных, all lowercase here.";
        for options in [ResolvedOptions::default(), ResolvedOptions::all(), ResolvedOptions::none()] {
            assert_eq!(anonymize(text, &options).unwrap(), text);
        }
    }

    #[test]
    fn test_stats_and_entities() {
        let text = "Пишите на test@example.com или a@b.org";
        let result = anonymize_with_stats(text, &only(&[Category::Emails])).unwrap();

        assert_eq!(result.text, "Пишите на [EMAIL] или [EMAIL]");
        assert_eq!(result.stats.get(&Category::Emails), Some(&2));
        assert_eq!(result.stats.len(), 1);
        assert_eq!(result.entities.len(), 2);
        assert_eq!(result.entities[0].value, "test@example.com");
        assert_eq!(result.total_replacements(), 2);
    }

    #[test]
    fn test_zero_counts_are_reported_for_active_categories() {
        let result = anonymize_with_stats("nothing here", &ResolvedOptions::default()).unwrap();
        assert_eq!(result.stats.get(&Category::Names), Some(&0));
        assert_eq!(result.stats.get(&Category::Phones), Some(&0));
        assert_eq!(result.stats.get(&Category::Dates), None);
    }

    #[test]
    fn test_date_runs_before_phone() {
        let text = "01.02.2023 +7 999 123 45 67";
        let result = anonymize_with_stats(text, &only(&[Category::Dates, Category::Phones])).unwrap();

        assert_eq!(result.text, "[ДАТА] [ТЕЛЕФОН]");
        let phone = result.entities.iter().find(|e| e.category == Category::Phones).unwrap();
        assert!(!phone.value.contains("2023"));
    }

    #[test]
    fn test_ip_runs_before_phone() {
        let text = "Сервер 192.168.100.200";
        let out = anonymize(text, &only(&[Category::Ips, Category::Phones])).unwrap();
        assert_eq!(out, "Сервер [IP-АДРЕС]");

        // Without the IP rule the broad phone rule claims it
        let out = anonymize(text, &only(&[Category::Phones])).unwrap();
        assert_eq!(out, "Сервер [ТЕЛЕФОН]");
    }

    #[test]
    fn test_output_is_sanitized() {
        let out = anonymize("<b>Иванов</b><script>steal()</script>", &only(&[Category::Names])).unwrap();
        assert_eq!(out, "[ИМЯ]");
    }

    #[test]
    fn test_substitute_skips_sanitizer() {
        let result = Pipeline::default()
            .substitute("<i>Иванов</i>", &only(&[Category::Names]))
            .unwrap();
        assert_eq!(result.text, "<i>[ИМЯ]</i>");
    }

    #[test]
    fn test_input_limit() {
        let pipeline = Pipeline::default().with_max_input_bytes(4);
        let err = pipeline.anonymize("12345", &ResolvedOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(pipeline.anonymize("1234", &ResolvedOptions::default()).is_ok());
    }

    #[test]
    fn test_bad_spans_fail_without_partial_output() {
        let text = "abc def";
        let cases = vec![
            ("out of bounds", entity(Category::Names, "def", 10)),
            ("value mismatch", entity(Category::Names, "xyz", 4)),
            ("empty", DetectedEntity { end: 2, ..entity(Category::Names, "", 2) }),
        ];

        for (case_name, bad) in cases {
            let pipeline = Pipeline::new(Arc::new(FixedDetector(vec![bad])));
            let err = pipeline.anonymize(text, &only(&[Category::Names])).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Regex, "case: {}", case_name);
            assert!(err.details.unwrap().contains("category=names"), "case: {}", case_name);
        }
    }

    struct BrokenDetector;

    impl EntityDetector for BrokenDetector {
        fn detect(&self, _text: &str, _category: Category) -> Result<Vec<DetectedEntity>, AnonymizeError> {
            Err(AnonymizeError::validation("model returned garbage"))
        }
    }

    #[test]
    fn test_detector_failure_is_regex_error() {
        let pipeline = Pipeline::new(Arc::new(BrokenDetector));
        let err = pipeline.anonymize("text", &only(&[Category::Emails])).unwrap_err();

        assert_eq!(err.kind, ErrorKind::Regex);
        assert_eq!(err.message, "model returned garbage");
        assert_eq!(err.details.as_deref(), Some("category=emails"));
    }

    #[test]
    fn test_detector_failure_during_overlap_scan_is_regex_error() {
        let pipeline = Pipeline::new(Arc::new(BrokenDetector)).with_overlap_report(true);
        let err = pipeline.anonymize("text", &only(&[Category::Phones])).unwrap_err();

        assert_eq!(err.kind, ErrorKind::Regex);
        assert_eq!(err.details.as_deref(), Some("category=phones"));
    }

    #[test]
    fn test_overlapping_spans_are_rejected() {
        let text = "abcdef";
        let pipeline = Pipeline::new(Arc::new(FixedDetector(vec![
            entity(Category::Names, "abcd", 0),
            entity(Category::Names, "cdef", 2),
        ])));
        let err = pipeline.anonymize(text, &only(&[Category::Names])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Regex);
    }

    #[test]
    fn test_non_char_boundary_span() {
        let text = "имя";
        let bad = DetectedEntity {
            category: Category::Names,
            value: String::new(),
            start: 1,
            end: 3,
            confidence: 1.0,
        };
        let pipeline = Pipeline::new(Arc::new(FixedDetector(vec![bad])));
        let err = pipeline.anonymize(text, &only(&[Category::Names])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Regex);
    }

    #[test]
    fn test_overlap_report() {
        let pipeline = Pipeline::default().with_overlap_report(true);
        let result = pipeline
            .anonymize_with_stats("addr 192.168.100.200", &only(&[Category::Ips, Category::Phones]))
            .unwrap();

        assert_eq!(result.text, "addr [IP-АДРЕС]");
        assert_eq!(result.overlaps.len(), 1);
        assert_eq!(result.overlaps[0].first, Category::Ips);
        assert_eq!(result.overlaps[0].second, Category::Phones);
    }

    #[test]
    fn test_progress_and_cancellation() {
        let mut events = Vec::new();
        let mut on_progress = |p: Progress| events.push(p);
        let control = RunControl {
            cancel: None,
            on_progress: Some(&mut on_progress),
        };
        Pipeline::default()
            .run("Иванов", &ResolvedOptions::default(), control)
            .unwrap();

        assert_eq!(events.first().unwrap().percent, 0);
        assert_eq!(events.last().unwrap().percent, 100);
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        // start + 3 categories + sanitizer + completed
        assert_eq!(events.len(), 6);

        let cancel = AtomicBool::new(true);
        let control = RunControl {
            cancel: Some(&cancel),
            on_progress: None,
        };
        let err = Pipeline::default()
            .run("Иванов", &ResolvedOptions::default(), control)
            .unwrap_err();
        assert!(err.is_terminated());
    }

    #[test]
    fn test_step_percent() {
        assert_eq!(step_percent(0, 4), 0);
        assert_eq!(step_percent(2, 4), 49);
        assert_eq!(step_percent(4, 4), 99);
    }
}
