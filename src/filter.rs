use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{TableIdentifier, TableInfo};

/// Include/exclude glob lists, matched against `namespace:database:table`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TableFilterConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Decides which tables are monitored.
///
/// Exclude patterns win over include patterns. With no include patterns every
/// table that is not excluded is monitored. A pattern that fails to compile
/// never matches anything.
#[derive(Debug, Clone)]
pub struct TableFilter {
    include: Vec<GlobPattern>,
    exclude: Vec<GlobPattern>,
}

impl TableFilter {
    pub fn new(config: &TableFilterConfig) -> Self {
        Self {
            include: config.include.iter().map(|p| GlobPattern::new(p)).collect(),
            exclude: config.exclude.iter().map(|p| GlobPattern::new(p)).collect(),
        }
    }

    /// A filter that monitors everything.
    pub fn allow_all() -> Self {
        Self::new(&TableFilterConfig::default())
    }

    pub fn should_monitor(&self, id: &TableIdentifier) -> bool {
        if self.include.is_empty() && self.exclude.is_empty() {
            return true;
        }

        let key = id.key();
        if self.exclude.iter().any(|p| p.matches(&key)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|p| p.matches(&key))
    }

    pub fn filter_tables(&self, tables: &[TableInfo]) -> Vec<TableIdentifier> {
        tables
            .iter()
            .filter(|t| self.should_monitor(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }
}

// ============================================================
// Glob matching
// ============================================================

/// Shell-style glob: `*` any run of characters, `?` one character,
/// `[abc]` / `[a-z]` / `[!a-z]` classes, `\` escapes the next character.
#[derive(Debug, Clone)]
struct GlobPattern {
    regex: Option<Regex>,
}

impl GlobPattern {
    fn new(pattern: &str) -> Self {
        let regex = glob_to_regex(pattern).and_then(|re| Regex::new(&re).ok());
        if regex.is_none() {
            warn!(pattern, "Invalid table pattern, it will never match");
        }
        Self { regex }
    }

    fn matches(&self, candidate: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(candidate))
    }
}

fn glob_to_regex(pattern: &str) -> Option<String> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => out.push_str(&regex::escape(&chars.next()?.to_string())),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                let mut empty = true;
                while let Some(c) = chars.next() {
                    match c {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '\\' => out.push_str(&regex::escape(&chars.next()?.to_string())),
                        '-' if !empty && chars.peek().is_some_and(|n| *n != ']') => out.push('-'),
                        other => out.push_str(&regex::escape(&other.to_string())),
                    }
                    empty = false;
                }
                if !closed {
                    return None;
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Some(out)
}
