use anyhow::{Context, Result};
use glob::MatchOptions;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Exclusion patterns are matched without regard to case (`*.TMP` == `*.tmp`)
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A single exclusion rule
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Compiled glob pattern
    pub pattern: glob::Pattern,
    /// Original pattern string (for logging and config round-trips)
    pub pattern_str: String,
    /// Whether pattern contains '/' (affects matching behavior)
    pub has_slash: bool,
    /// Whether pattern ends with '/' (directory-only pattern)
    pub is_dir_only: bool,
}

impl FilterRule {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern_str = pattern.to_string();
        let is_dir_only = pattern.ends_with('/');

        let pattern_for_glob = if is_dir_only {
            pattern.trim_end_matches('/')
        } else {
            pattern
        };

        let has_slash = pattern_for_glob.contains('/');
        let pattern = glob::Pattern::new(pattern_for_glob)
            .with_context(|| format!("Invalid exclude pattern: {}", pattern))?;

        Ok(Self {
            pattern,
            pattern_str,
            has_slash,
            is_dir_only,
        })
    }

    /// Check if this rule matches the given relative path
    ///
    /// - Pattern ending with '/' matches that directory name only
    /// - Pattern containing '/' matches the full relative path
    /// - Otherwise the pattern matches the file (or directory) name
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        if self.is_dir_only {
            if !is_dir {
                return false;
            }
            return path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| self.pattern.matches_with(name, MATCH_OPTIONS))
                .unwrap_or(false);
        }

        if self.has_slash {
            let Some(path_str) = path.to_str() else {
                return false;
            };
            // Normalize Windows separators so one pattern works everywhere
            let normalized = path_str.replace('\\', "/");
            self.pattern.matches_with(&normalized, MATCH_OPTIONS)
        } else {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| self.pattern.matches_with(name, MATCH_OPTIONS))
                .unwrap_or(false)
        }
    }
}

/// Ordered set of exclusion rules applied to every replica walk and apply
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    rules: Vec<FilterRule>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Build from a list of patterns; entries may also hold `;`-separated
    /// lists (`*.mdb;*.jpg;`) as accepted by the config file
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut engine = Self::new();
        for entry in patterns {
            for pattern in entry.as_ref().split(';') {
                engine.add_rule(pattern)?;
            }
        }
        Ok(engine)
    }

    /// Add a rule line; blank lines and `#` comments are ignored
    pub fn add_rule(&mut self, rule: &str) -> Result<()> {
        let rule = rule.trim();
        if rule.is_empty() || rule.starts_with('#') {
            return Ok(());
        }
        self.add_exclude(rule)
    }

    pub fn add_exclude(&mut self, pattern: &str) -> Result<()> {
        let rule = FilterRule::new(pattern)?;
        self.rules.push(rule);
        Ok(())
    }

    /// Load exclusion rules from a file, one pattern per line
    pub fn add_rules_from_file(&mut self, file_path: &Path) -> Result<()> {
        let file = File::open(file_path)
            .with_context(|| format!("Failed to open exclude file: {}", file_path.display()))?;

        let reader = BufReader::new(file);

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.with_context(|| {
                format!("Failed to read line {} from {}", line_num + 1, file_path.display())
            })?;

            self.add_rule(&line).with_context(|| {
                format!("Invalid rule at line {} in {}", line_num + 1, file_path.display())
            })?;
        }

        Ok(())
    }

    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        self.rules.iter().any(|rule| rule.matches(path, is_dir))
    }

    /// Check a relative file path, including every directory above it
    pub fn excludes_file(&self, path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        if self.is_excluded(path, false) {
            return true;
        }
        path.ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .any(|dir| self.is_excluded(dir, true))
    }

    pub fn patterns(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.pattern_str.clone()).collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
