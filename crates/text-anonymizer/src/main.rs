//! Text anonymizer command-line interface

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use text_anonymizer_core::{
    AnonymizeError, AnonymizeOptions, AnonymizeResult, AssistedAnonymizer, Category, Config, DetectionMode,
    OffloadHost, Pipeline,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Regex,
    Llm,
    RegexLlm,
}

impl From<ModeArg> for DetectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Regex => DetectionMode::Regex,
            ModeArg::Llm => DetectionMode::Llm,
            ModeArg::RegexLlm => DetectionMode::RegexLlm,
        }
    }
}

fn parse_category(s: &str) -> Result<Category, String> {
    s.parse()
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, help = "Read text from this file instead of stdin")]
    pub input: Option<PathBuf>,

    #[arg(long, value_delimiter = ',', value_parser = parse_category, help = "Categories to replace (names, emails, dates, ips, phones, addresses)")]
    pub enable: Vec<Category>,

    #[arg(long, value_delimiter = ',', value_parser = parse_category, help = "Categories to leave untouched")]
    pub disable: Vec<Category>,

    #[arg(long, value_enum, help = "Detection mode, overrides the configuration file")]
    pub mode: Option<ModeArg>,

    #[arg(long, help = "Run the pipeline on a dedicated worker thread")]
    pub offload: bool,

    #[arg(long, help = "Print the full result (text, stats, entities) as JSON")]
    pub json: bool,

    #[arg(long, default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,

    #[arg(long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Flags from `--enable`/`--disable`; categories not mentioned stay unset.
    pub fn caller_options(&self) -> Result<AnonymizeOptions, AnonymizeError> {
        if let Some(category) = self.enable.iter().find(|c| self.disable.contains(c)) {
            return Err(AnonymizeError::validation(format!(
                "category '{}' is both enabled and disabled",
                category
            )));
        }

        let mut options = AnonymizeOptions::default();
        for category in &self.enable {
            options.set(*category, true);
        }
        for category in &self.disable {
            options.set(*category, false);
        }
        Ok(options)
    }

    pub fn read_input(&self) -> Result<String> {
        match self.input.as_ref() {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file {}", path.display())),
            None => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .context("Failed to read text from stdin")?;
                Ok(text)
            }
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from: {}", config_path.display());
            Config::from_file(config_path)
        }
        None => {
            // Try to load from default location, fallback to default config
            match Config::get_default_config_path() {
                Ok(default_path) if default_path.exists() => {
                    info!("Loading configuration from default location: {}", default_path.display());
                    Config::from_file(&default_path)
                }
                Ok(default_path) => {
                    info!("Creating default configuration at: {}", default_path.display());
                    let config = Config::default();
                    config.to_file(&default_path)?;
                    Ok(config)
                }
                Err(_) => {
                    info!("Using default configuration (could not determine config directory)");
                    Ok(Config::default())
                }
            }
        }
    }
}

async fn run(args: &Args) -> Result<AnonymizeResult> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(mode) = args.mode {
        config.detection.mode = mode.into();
    }
    config.validate()?;
    info!("Configuration validated successfully");

    let options = args.caller_options()?.layered_over(config.options);
    let text = args.read_input()?;

    if args.offload {
        if config.detection.mode != DetectionMode::Regex {
            return Err(AnonymizeError::validation("--offload only supports the regex detection mode").into());
        }
        let host = OffloadHost::new(Arc::new(Pipeline::from_config(&config)?));
        let task = host.submit(text, options)?;
        info!("Waiting for offload task {}", task.id());
        let result = task
            .wait(|progress| debug!("{}% {}", progress.percent, progress.message))
            .await?;
        return Ok(result);
    }

    let anonymizer = AssistedAnonymizer::from_config(&config)?;
    Ok(anonymizer.anonymize(&text, &options.resolve()).await?)
}

/// Tagged JSON for any failure; errors outside the pipeline are reported as
/// validation errors with their cause chain in `details`.
fn error_json(err: &anyhow::Error) -> String {
    match err.downcast_ref::<AnonymizeError>() {
        Some(tagged) => tagged.to_json(),
        None => AnonymizeError::validation(err.to_string())
            .with_details(format!("{:#}", err))
            .to_json(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = args.log_level.parse::<tracing::Level>()
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', defaulting to 'info'", args.log_level);
            tracing::Level::INFO
        });

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&args).await {
        Ok(result) if args.json => match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}", error_json(&anyhow::Error::from(e)));
                std::process::exit(1);
            }
        },
        Ok(result) => print!("{}", result.text),
        Err(e) => {
            eprintln!("{}", error_json(&e));
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("text-anonymizer").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert!(args.input.is_none());
        assert!(args.enable.is_empty());
        assert!(args.mode.is_none());
        assert!(!args.offload);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.caller_options().unwrap(), AnonymizeOptions::default());
    }

    #[test]
    fn test_category_lists() {
        let args = parse(&["--enable", "dates,ip_address", "--disable", "names"]);
        assert_eq!(args.enable, vec![Category::Dates, Category::Ips]);

        let options = args.caller_options().unwrap();
        assert_eq!(options.get(Category::Dates), Some(true));
        assert_eq!(options.get(Category::Ips), Some(true));
        assert_eq!(options.get(Category::Names), Some(false));
        assert_eq!(options.get(Category::Emails), None);
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let result = Args::try_parse_from(["text-anonymizer", "--enable", "ssn"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_conflicting_flags() {
        let args = parse(&["--enable", "phones", "--disable", "phones"]);
        let err = args.caller_options().unwrap_err();
        assert_eq!(err.kind, text_anonymizer_core::ErrorKind::Validation);
    }

    #[test]
    fn test_mode_values() {
        assert_eq!(parse(&["--mode", "regex-llm"]).mode, Some(ModeArg::RegexLlm));
        assert_eq!(DetectionMode::from(ModeArg::Llm), DetectionMode::Llm);
        assert!(Args::try_parse_from(["text-anonymizer", "--mode", "magic"]).is_err());
    }

    #[test]
    fn test_error_json() {
        let tagged: anyhow::Error = AnonymizeError::sanitize("markup is nested too deeply to strip").into();
        assert!(error_json(&tagged).contains(r#""type":"SANITIZE_ERROR""#));

        let other = anyhow::anyhow!("Failed to read input file");
        let value: serde_json::Value = serde_json::from_str(&error_json(&other)).unwrap();
        assert_eq!(value["type"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_run_with_input_file_and_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("input.txt");
        let config = dir.path().join("config.toml");
        std::fs::write(&input, "Сервер 192.168.1.1, почта admin@example.com").unwrap();
        std::fs::write(&config, "[options]\nreplaceIPs = true\n").unwrap();

        let args = parse(&[
            "--input", input.to_str().unwrap(),
            "--config", config.to_str().unwrap(),
            "--disable", "names",
            "--offload",
        ]);
        let result = run(&args).await.unwrap();

        assert_eq!(result.text, "Сервер [IP-АДРЕС], почта [EMAIL]");
    }
}
