use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

use super::config::DomainRules;

/// Decides whether connections to a hostname get their handshake split.
///
/// Decisions are memoized for the lifetime of the process, negative ones
/// included. The rules never change after startup so a cached decision
/// is never overwritten with a different value.
pub struct DomainClassifier {
    rules: Arc<DomainRules>,
    decisions: RwLock<HashMap<String, bool>>,
    /// Number of uncached evaluations performed.
    evaluations: AtomicU64,
}

impl std::fmt::Debug for DomainClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainClassifier")
            .field("rules", &self.rules)
            .field("decisions", &"<RwLock>")
            .field("evaluations", &self.evaluations)
            .finish()
    }
}

impl DomainClassifier {
    pub fn new(rules: Arc<DomainRules>) -> Self {
        Self {
            rules,
            decisions: RwLock::new(HashMap::new()),
            evaluations: AtomicU64::new(0),
        }
    }

    /// Returns true when `hostname` is on the allow-list or matches a pattern.
    ///
    /// Two concurrent first lookups of the same hostname may both evaluate
    /// the rules; they reach the same answer.
    pub fn is_proxied(&self, hostname: &str) -> bool {
        if let Some(decision) = self.cached(hostname) {
            return decision;
        }

        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let decision = self.rules.contains(hostname) || self.rules.first_match(hostname).is_some();

        if let Ok(mut decisions) = self.decisions.write() {
            decisions.entry(hostname.to_string()).or_insert(decision);
        }
        info!("proxify: {} {}", hostname, decision);

        decision
    }

    /// Returns the memoized decision for a hostname, if any.
    pub fn cached(&self, hostname: &str) -> Option<bool> {
        let decisions = self.decisions.read().ok()?;
        decisions.get(hostname).copied()
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}
