//! Options resolver: caller flags merged over documented defaults

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AnonymizeError;
use crate::patterns::Category;

/// Partial options as supplied by a caller. Omitted flags fall back to defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_names: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_emails: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_phones: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_dates: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_addresses: Option<bool>,
    #[serde(default, rename = "replaceIPs", skip_serializing_if = "Option::is_none")]
    pub replace_ips: Option<bool>,
}

impl AnonymizeOptions {
    /// Options with exactly the given categories enabled and all others disabled.
    pub fn only(categories: &[Category]) -> Self {
        let mut options = Self::default();
        for category in Category::PIPELINE_ORDER {
            options.set(category, categories.contains(&category));
        }
        options
    }

    pub fn get(&self, category: Category) -> Option<bool> {
        match category {
            Category::Names => self.replace_names,
            Category::Emails => self.replace_emails,
            Category::Phones => self.replace_phones,
            Category::Dates => self.replace_dates,
            Category::Addresses => self.replace_addresses,
            Category::Ips => self.replace_ips,
        }
    }

    pub fn set(&mut self, category: Category, enabled: bool) {
        let slot = match category {
            Category::Names => &mut self.replace_names,
            Category::Emails => &mut self.replace_emails,
            Category::Phones => &mut self.replace_phones,
            Category::Dates => &mut self.replace_dates,
            Category::Addresses => &mut self.replace_addresses,
            Category::Ips => &mut self.replace_ips,
        };
        *slot = Some(enabled);
    }

    pub fn with(mut self, category: Category, enabled: bool) -> Self {
        self.set(category, enabled);
        self
    }

    /// Flags set on `self` win; unset flags are taken from `base`.
    pub fn layered_over(self, base: AnonymizeOptions) -> Self {
        Self {
            replace_names: self.replace_names.or(base.replace_names),
            replace_emails: self.replace_emails.or(base.replace_emails),
            replace_phones: self.replace_phones.or(base.replace_phones),
            replace_dates: self.replace_dates.or(base.replace_dates),
            replace_addresses: self.replace_addresses.or(base.replace_addresses),
            replace_ips: self.replace_ips.or(base.replace_ips),
        }
    }

    /// Parses an options object received as JSON (e.g. from a request body).
    ///
    /// `null` means "no flags". Anything other than an object, or a flag that
    /// is not a boolean, is a `VALIDATION_ERROR`. Unknown keys are ignored.
    pub fn from_value(value: &Value) -> Result<Self, AnonymizeError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| {
                AnonymizeError::validation("options must map flag names to booleans")
                    .with_details(e.to_string())
            }),
            other => Err(AnonymizeError::validation("options must be a JSON object")
                .with_details(format!("got {}", json_type_name(other)))),
        }
    }

    pub fn resolve(&self) -> ResolvedOptions {
        resolve_options(self)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fully-populated options used for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOptions {
    pub replace_names: bool,
    pub replace_emails: bool,
    pub replace_phones: bool,
    pub replace_dates: bool,
    pub replace_addresses: bool,
    #[serde(rename = "replaceIPs")]
    pub replace_ips: bool,
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        Self {
            replace_names: true,
            replace_emails: true,
            replace_phones: true,
            replace_dates: false,
            replace_addresses: false,
            replace_ips: false,
        }
    }
}

impl ResolvedOptions {
    pub fn all() -> Self {
        Self {
            replace_names: true,
            replace_emails: true,
            replace_phones: true,
            replace_dates: true,
            replace_addresses: true,
            replace_ips: true,
        }
    }

    pub fn none() -> Self {
        Self {
            replace_names: false,
            replace_emails: false,
            replace_phones: false,
            replace_dates: false,
            replace_addresses: false,
            replace_ips: false,
        }
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        match category {
            Category::Names => self.replace_names,
            Category::Emails => self.replace_emails,
            Category::Phones => self.replace_phones,
            Category::Dates => self.replace_dates,
            Category::Addresses => self.replace_addresses,
            Category::Ips => self.replace_ips,
        }
    }

    /// Enabled categories in substitution order.
    pub fn enabled_categories(&self) -> Vec<Category> {
        Category::PIPELINE_ORDER
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

impl From<AnonymizeOptions> for ResolvedOptions {
    fn from(partial: AnonymizeOptions) -> Self {
        resolve_options(&partial)
    }
}

/// Fills every omitted flag with its documented default.
pub fn resolve_options(partial: &AnonymizeOptions) -> ResolvedOptions {
    let defaults = ResolvedOptions::default();
    ResolvedOptions {
        replace_names: partial.replace_names.unwrap_or(defaults.replace_names),
        replace_emails: partial.replace_emails.unwrap_or(defaults.replace_emails),
        replace_phones: partial.replace_phones.unwrap_or(defaults.replace_phones),
        replace_dates: partial.replace_dates.unwrap_or(defaults.replace_dates),
        replace_addresses: partial.replace_addresses.unwrap_or(defaults.replace_addresses),
        replace_ips: partial.replace_ips.unwrap_or(defaults.replace_ips),
    }
}
