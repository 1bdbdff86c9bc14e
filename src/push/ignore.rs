//! Filenames that never trigger processing.

use crate::config::{RegexEngine, Settings};
use crate::core::DinghyError;

enum Pattern {
    Standard(regex::Regex),
    Fancy(fancy_regex::Regex),
}

impl Pattern {
    fn is_match(&self, path: &str) -> bool {
        match self {
            Pattern::Standard(re) => re.is_match(path),
            Pattern::Fancy(re) => re.is_match(path).unwrap_or_else(|e| {
                tracing::warn!("ignore pattern {} failed on {}: {}", re.as_str(), path, e);
                false
            }),
        }
    }
}

/// Compiled ignore patterns.
///
/// A path is ignored when any pattern matches it anywhere.
pub struct IgnoreFilter {
    patterns: Vec<Pattern>,
}

impl IgnoreFilter {
    pub fn new(patterns: &[String], engine: RegexEngine) -> Result<Self, DinghyError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let compiled = match engine {
                    RegexEngine::Standard => {
                        regex::Regex::new(p).map(Pattern::Standard).map_err(|e| e.to_string())
                    }
                    RegexEngine::Fancy => {
                        fancy_regex::Regex::new(p).map(Pattern::Fancy).map_err(|e| e.to_string())
                    }
                };
                compiled
                    .map_err(|e| DinghyError::Config(format!("invalid ignore pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, DinghyError> {
        Self::new(&settings.ignore_patterns, settings.ignore_regex_engine)
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }

    /// Whether every one of `paths` is ignored. An empty push is not.
    pub fn all_ignored(&self, paths: &[String]) -> bool {
        !self.patterns.is_empty() && !paths.is_empty() && paths.iter().all(|p| self.is_ignored(p))
    }
}
