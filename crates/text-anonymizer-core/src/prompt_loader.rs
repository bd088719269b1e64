/*
   Manages prompt template loading with built-in fallback and user customization.
   Named templates live as `<name>.md` in the prompts directory; anything missing
   falls back to the template compiled into the binary.
*/

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::warn;
use crate::config::Config;

const BUILTIN_PROMPT: &str = include_str!("templates/builtin_prompt.md");

#[derive(Clone)]
pub struct PromptLoader {
    prompts_dir: PathBuf,
}

impl PromptLoader {
    /// Loader rooted at the platform data directory, seeded with `default.md`.
    pub fn new() -> Result<Self> {
        let project_dirs = Config::get_app_dirs()?;
        Self::with_dir(project_dirs.data_dir().join("prompts"))
    }

    pub fn with_dir<P: AsRef<Path>>(prompts_dir: P) -> Result<Self> {
        let prompts_dir = prompts_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&prompts_dir)?;

        let default_prompt_path = prompts_dir.join("default.md");
        if !default_prompt_path.exists() {
            std::fs::write(&default_prompt_path, BUILTIN_PROMPT)?;
        }

        Ok(Self { prompts_dir })
    }

    pub fn builtin() -> &'static str {
        BUILTIN_PROMPT
    }

    pub fn prompts_dir(&self) -> &Path {
        &self.prompts_dir
    }

    pub fn load_prompt(&self, template_name: Option<&str>) -> Result<String> {
        match template_name {
            None => Ok(BUILTIN_PROMPT.to_string()),
            Some(name) => {
                let prompt_path = self.prompts_dir.join(format!("{}.md", name));
                match std::fs::read_to_string(&prompt_path) {
                    Ok(content) => Ok(content),
                    Err(_) => {
                        warn!("Prompt template '{}' not found, using built-in", name);
                        Ok(BUILTIN_PROMPT.to_string())
                    }
                }
            }
        }
    }

    pub fn format_prompt(template: &str, text: &str) -> String {
        template.replace("{text}", &text.replace('"', r#"\""#))
    }
}
