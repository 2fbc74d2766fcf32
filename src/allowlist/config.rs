use std::collections::HashSet;
use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AllowListError {
    #[error("invalid domain pattern on line {line} ({pattern:?}): {source}")]
    InvalidPattern {
        line: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("no domains to proxy, add a domain name to {domains} or {patterns}")]
    Empty { domains: String, patterns: String },
}

/// Domains selected for handshake fragmentation.
///
/// Built once at startup and never mutated afterwards. Exact names are
/// checked first; patterns are tried in file order and the first match wins.
#[derive(Debug, Default)]
pub struct DomainRules {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl DomainRules {
    /// Loads the allow-list and the pattern list from disk.
    ///
    /// A list file that cannot be read is treated as empty, but the two lists
    /// together must name at least one domain.
    pub fn load(domains: &Path, patterns: &Path) -> Result<Self, AllowListError> {
        let rules = Self::parse(&read_list(domains), &read_list(patterns))?;
        if rules.is_empty() {
            return Err(AllowListError::Empty {
                domains: domains.display().to_string(),
                patterns: patterns.display().to_string(),
            });
        }
        Ok(rules)
    }

    /// Parses list contents. One entry per line, `#` starts a comment line.
    pub fn parse(domains: &str, patterns: &str) -> Result<Self, AllowListError> {
        let exact: HashSet<String> = entries(domains).map(|(_, d)| d.to_string()).collect();

        let patterns = entries(patterns)
            .map(|(line, pattern)| {
                Regex::new(pattern).map_err(|source| AllowListError::InvalidPattern {
                    line,
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "loaded {} exact domains and {} patterns",
            exact.len(),
            patterns.len()
        );

        Ok(Self { exact, patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    pub fn exact_count(&self) -> usize {
        self.exact.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub(crate) fn contains(&self, hostname: &str) -> bool {
        self.exact.contains(hostname)
    }

    /// Returns the first pattern (in list order) matching the hostname.
    pub(crate) fn first_match(&self, hostname: &str) -> Option<&Regex> {
        self.patterns.iter().find(|re| re.is_match(hostname))
    }
}

fn read_list(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("failed to read {}: {}", path.display(), e);
            String::new()
        }
    }
}

/// Yields `(line number, entry)` for every non-blank, non-comment line.
fn entries(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .split('\n')
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_matches(['\r', '\n', '\t', ' '])))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that comments, blank lines and CR-LF endings are skipped
    /// and surrounding whitespace is trimmed.
    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let domains = "# blocked sites\r\n\r\n  example.com \r\n\twww.example.org\n#disabled.net\n";
        let rules = DomainRules::parse(domains, "").unwrap();

        assert_eq!(rules.exact_count(), 2);
        assert!(rules.contains("example.com"));
        assert!(rules.contains("www.example.org"));
        assert!(!rules.contains("disabled.net"));
        assert!(!rules.contains("#disabled.net"));
    }

    /// Tests that patterns keep their file order so the first match wins.
    #[test]
    fn patterns_keep_file_order() {
        let rules = DomainRules::parse("", "# cdn\n.*\\.cdn\\.net$\nexample\n").unwrap();

        assert_eq!(rules.pattern_count(), 2);
        let first = rules.first_match("img.example.cdn.net").unwrap();
        assert_eq!(first.as_str(), ".*\\.cdn\\.net$");
        let second = rules.first_match("example.org").unwrap();
        assert_eq!(second.as_str(), "example");
        assert!(rules.first_match("other.org").is_none());
    }

    /// Tests that a malformed pattern is reported with its line number.
    #[test]
    fn malformed_pattern_is_rejected() {
        let err = DomainRules::parse("", "ok\\.com\n\n(unclosed\n").unwrap_err();
        match err {
            AllowListError::InvalidPattern { line, pattern, .. } => {
                assert_eq!(line, 3);
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Tests that two missing list files leave nothing to proxy.
    #[test]
    fn load_refuses_empty_lists() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let domains = dir.join(format!("sni-fragment-proxy-missing-{pid}.txt"));
        let patterns = dir.join(format!("sni-fragment-proxy-missing-regex-{pid}.txt"));

        let err = DomainRules::load(&domains, &patterns).unwrap_err();
        assert!(matches!(err, AllowListError::Empty { .. }));
    }

    /// Tests loading when only one of the two list files exists.
    #[test]
    fn load_with_single_list() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let domains = dir.join(format!("sni-fragment-proxy-domains-{pid}.txt"));
        let patterns = dir.join(format!("sni-fragment-proxy-absent-{pid}.txt"));
        std::fs::write(&domains, "example.com\n").unwrap();

        let rules = DomainRules::load(&domains, &patterns).unwrap();
        std::fs::remove_file(&domains).unwrap();

        assert_eq!(rules.exact_count(), 1);
        assert_eq!(rules.pattern_count(), 0);
    }
}
