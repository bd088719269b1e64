//! Pattern table: one matching rule and one placeholder per personal-data category

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::AnonymizeError;

/// Personal-data category. Declaration order is the substitution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Names,
    Emails,
    Dates,
    Ips,
    Phones,
    Addresses,
}

impl Category {
    /// Fixed application order. Dates and IPs run before the broad phone rule.
    pub const PIPELINE_ORDER: [Category; 6] = [
        Category::Names,
        Category::Emails,
        Category::Dates,
        Category::Ips,
        Category::Phones,
        Category::Addresses,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Names => "names",
            Category::Emails => "emails",
            Category::Dates => "dates",
            Category::Ips => "ips",
            Category::Phones => "phones",
            Category::Addresses => "addresses",
        }
    }

    pub fn placeholder(&self) -> &'static str {
        match self {
            Category::Names => "[ИМЯ]",
            Category::Emails => "[EMAIL]",
            Category::Dates => "[ДАТА]",
            Category::Ips => "[IP-АДРЕС]",
            Category::Phones => "[ТЕЛЕФОН]",
            Category::Addresses => "[АДРЕС]",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Accepts category names as well as the entity labels an LLM tends to emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "names" | "name" | "person" | "person_name" => Ok(Category::Names),
            "emails" | "email" | "email_address" => Ok(Category::Emails),
            "dates" | "date" => Ok(Category::Dates),
            "ips" | "ip" | "ip_address" => Ok(Category::Ips),
            "phones" | "phone" | "phone_number" => Ok(Category::Phones),
            "addresses" | "address" => Ok(Category::Addresses),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// Extra acceptance test applied to each raw regex match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchGuard {
    None,
    /// Dotted numbers (dates, IPs): the match must not be glued to a letter or
    /// digit, nor continue into another `.`+digit run (`10.10.10.10`,
    /// `1.2.3.4.5`). A `-` or `/` between two values is a range, so both sides
    /// are accepted.
    Dotted,
    /// Like `Dotted` but any of `.`, `-`, `/` followed by a digit rejects the
    /// match, and at least `min_digits` digits are required.
    Standalone { min_digits: usize },
}

impl MatchGuard {
    pub fn accepts(&self, text: &str, start: usize, end: usize) -> bool {
        let is_separator: fn(char) -> bool = match self {
            MatchGuard::None => return true,
            MatchGuard::Dotted => |c: char| c == '.',
            MatchGuard::Standalone { min_digits } => {
                let digits = text[start..end].chars().filter(|c| c.is_ascii_digit()).count();
                if digits < *min_digits {
                    return false;
                }
                |c: char| matches!(c, '.' | '-' | '/')
            }
        };

        !continues(text[..start].chars().rev(), is_separator)
            && !continues(text[end..].chars(), is_separator)
    }
}

/// True when the next chars glue onto the match: a letter or digit, or a
/// separator followed by a digit.
fn continues(mut chars: impl Iterator<Item = char>, is_separator: fn(char) -> bool) -> bool {
    match chars.next() {
        Some(c) if c.is_alphanumeric() => true,
        Some(c) if is_separator(c) => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub category: Category,
    pub regex: Regex,
    pub guard: MatchGuard,
    pub confidence: f64,
}

impl PatternEntry {
    pub fn placeholder(&self) -> &'static str {
        self.category.placeholder()
    }
}

/// Capitalized word plus up to two capitalized words, or one or two initials
/// (`Петров П. С.`, `Петров П.С.`).
const NAMES_PATTERN: &str = r"\b\p{Lu}\p{Ll}+\b(?:\s+\p{Lu}\.(?:\s*\p{Lu}\.)?|(?:\s+\p{Lu}\p{Ll}+\b){1,2})?";
const EMAILS_PATTERN: &str = r"\b[A-Za-z0-9._%+-]+@(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,}\b";
const DATES_PATTERN: &str = r"\b(?:0?[1-9]|[12]\d|3[01])[./-](?:0?[1-9]|1[0-2])[./-]\d{2,4}\b";
const IPS_PATTERN: &str = r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b";
const PHONES_PATTERN: &str =
    r"(?:\+\d{1,3}[ \t.-]?)?(?:\(\d{1,4}\)|\d{1,4})(?:[ \t.-]?(?:\(\d{1,4}\)|\d{1,4})){1,4}";
/// `г. <City>, <street words> ул. <number>`. Names run earlier in the
/// pipeline and replace the capitalized city, so this rule only fires when
/// names are disabled.
const ADDRESSES_PATTERN: &str =
    r"\bг\.\s*\p{Lu}[\p{L}-]*,\s*(?:\p{L}[\p{L}-]*\s+)+?ул\.\s*\d+[\p{L}\d/]*";

/// Minimum digits for a phone match; shorter digit runs are left alone.
pub const PHONE_MIN_DIGITS: usize = 7;

fn default_pattern(category: Category) -> &'static str {
    match category {
        Category::Names => NAMES_PATTERN,
        Category::Emails => EMAILS_PATTERN,
        Category::Dates => DATES_PATTERN,
        Category::Ips => IPS_PATTERN,
        Category::Phones => PHONES_PATTERN,
        Category::Addresses => ADDRESSES_PATTERN,
    }
}

fn default_guard(category: Category) -> MatchGuard {
    match category {
        Category::Dates | Category::Ips => MatchGuard::Dotted,
        Category::Phones => MatchGuard::Standalone { min_digits: PHONE_MIN_DIGITS },
        _ => MatchGuard::None,
    }
}

fn default_confidence(category: Category) -> f64 {
    match category {
        Category::Names => 0.6,
        Category::Emails | Category::Ips => 0.95,
        Category::Dates => 0.9,
        Category::Phones => 0.85,
        Category::Addresses => 0.8,
    }
}

fn compile(category: Category, pattern: &str) -> Result<Regex, AnonymizeError> {
    Regex::new(pattern).map_err(|e| {
        AnonymizeError::regex(category, format!("invalid pattern for '{}'", category))
            .with_details(format!("category={}; {}", category, e))
    })
}

/// Immutable table of compiled rules, indexed by category.
#[derive(Debug, Clone)]
pub struct PatternTable {
    entries: Vec<PatternEntry>,
}

static DEFAULT_TABLE: Lazy<PatternTable> = Lazy::new(|| {
    let entries = Category::PIPELINE_ORDER
        .iter()
        .map(|&category| PatternEntry {
            category,
            regex: Regex::new(default_pattern(category)).expect("built-in pattern must compile"),
            guard: default_guard(category),
            confidence: default_confidence(category),
        })
        .collect();
    PatternTable { entries }
});

impl PatternTable {
    /// Process-wide table of built-in rules, compiled on first use.
    pub fn builtin() -> &'static PatternTable {
        &DEFAULT_TABLE
    }

    /// Built-in rules with some categories' regexes replaced.
    ///
    /// Keys are category names; an unknown key or a pattern that fails to
    /// compile is a `REGEX_ERROR` naming the category.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self, AnonymizeError> {
        let mut table = Self::builtin().clone();

        for (name, pattern) in overrides {
            let category = Category::from_str(name)
                .map_err(|e| AnonymizeError::validation(format!("invalid pattern override: {}", e)))?;
            let regex = compile(category, pattern)?;
            debug!("Loaded pattern override for '{}'", category);
            table.entries[category.index()].regex = regex;
        }

        Ok(table)
    }

    pub fn get(&self, category: Category) -> &PatternEntry {
        &self.entries[category.index()]
    }

    pub fn entries(&self) -> impl Iterator<Item = &PatternEntry> {
        self.entries.iter()
    }
}
