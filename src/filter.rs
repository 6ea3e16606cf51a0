use crate::types::bare_name;

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
enum Rule {
    Glob(Pattern),
    Substring(String),
}

impl Rule {
    fn parse(pattern: &str) -> Self {
        let has_meta = pattern.contains(['*', '?', '[']);
        match Pattern::new(pattern) {
            Ok(glob) if has_meta => Rule::Glob(glob),
            _ => Rule::Substring(pattern.to_lowercase()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Rule::Glob(glob) => glob.matches_with(name, MATCH_OPTIONS),
            Rule::Substring(needle) => name.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Case-insensitive name filter. Patterns containing glob metacharacters are
/// globs over the whole name, anything else is a substring. Both the schema
/// qualified name and the bare object name are tried.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    rules: Vec<Rule>,
}

impl ExcludeFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .map(|p| Rule::parse(&p))
            .collect();
        ExcludeFilter { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        let bare = bare_name(name);
        self.rules
            .iter()
            .any(|rule| rule.matches(name) || rule.matches(bare))
    }
}
