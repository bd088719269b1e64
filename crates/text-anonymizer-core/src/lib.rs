pub mod assisted;
pub mod config;
pub mod detection;
pub mod error;
pub mod offload;
pub mod ollama;
pub mod options;
pub mod patterns;
pub mod pipeline;
pub mod prompt_loader;
pub mod sanitize;


pub use assisted::AssistedAnonymizer;
pub use config::{Config, DetectionConfig, DetectionMode, LlmConfig};
pub use detection::{DetectedEntity, EntityDetector, Overlap, RegexDetectionEngine};
pub use error::{AnonymizeError, ErrorKind};
pub use offload::{anonymize_async, Executor, OffloadHost, OffloadTask, Terminator, ThreadExecutor};
pub use ollama::{LlmDetectedEntity, LlmResponse, OllamaClient, OllamaConfig};
pub use options::{resolve_options, AnonymizeOptions, ResolvedOptions};
pub use patterns::{Category, PatternEntry, PatternTable};
pub use pipeline::{anonymize, anonymize_with_stats, AnonymizeResult, Pipeline, Progress, RunControl};
pub use prompt_loader::PromptLoader;
pub use sanitize::{sanitize, sanitize_input};
