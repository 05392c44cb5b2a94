//! Record of installed firewall rules.
//!
//! Every rule is ledgered as soon as it is in place and removed again in
//! reverse order on shutdown, including after a partial startup.

use crate::network::firewall::{RuleInstaller, RuleRecord, RuleRemoval};
use log::{debug, error, info};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of removing every ledgered rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalSummary {
    pub removed: usize,
    pub already_absent: usize,
    pub failed: usize,
}

impl RemovalSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for RemovalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} removed, {} already absent, {} failed",
            self.removed, self.already_absent, self.failed
        )
    }
}

/// Append-only record of every rule the engine installed.
///
/// Rules are removed only as a group, most recent first, so later rules that
/// depend on earlier ones are gone before their dependencies.
#[derive(Debug, Default)]
pub struct RuleLedger {
    rules: Mutex<Vec<RuleRecord>>,
}

impl RuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // Teardown must still see every rule after a worker panicked while
    // holding the lock, so poisoning is ignored here.
    fn rules(&self) -> MutexGuard<'_, Vec<RuleRecord>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a rule immediately after it was installed.
    pub fn record(&self, rule: RuleRecord) {
        debug!("Ledgered rule {}", rule);
        self.rules().push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules().is_empty()
    }

    /// Copy of the ledgered rules in installation order.
    pub fn snapshot(&self) -> Vec<RuleRecord> {
        self.rules().clone()
    }

    /// Removes every ledgered rule in reverse installation order.
    ///
    /// A failed removal is logged and counted; the remaining rules are
    /// still attempted. The ledger is empty afterwards, so a second call
    /// is a no-op.
    pub fn remove_all<I: RuleInstaller + ?Sized>(&self, installer: &I) -> RemovalSummary {
        let rules = std::mem::take(&mut *self.rules());
        let mut summary = RemovalSummary::default();

        for rule in rules.iter().rev() {
            match installer.remove(rule) {
                Ok(RuleRemoval::Removed) => {
                    debug!("Removed rule {}", rule);
                    summary.removed += 1;
                }
                Ok(RuleRemoval::AlreadyAbsent) => {
                    debug!("Rule {} was already absent", rule);
                    summary.already_absent += 1;
                }
                Err(e) => {
                    error!("Failed to remove rule {}: {}", rule, e);
                    summary.failed += 1;
                }
            }
        }

        if !rules.is_empty() {
            info!("Removed firewall rules: {}", summary);
        }
        summary
    }
}
