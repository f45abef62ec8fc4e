mod audit;
mod compliance;

use crate::config::RulesConfig;
use crate::model::{CheckResult, Verdict};
use crate::store::StoreView;
use serde::Serialize;
use std::fmt;

/// Verdict and evidence produced by one check.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub evidence: String,
}

impl Outcome {
    pub fn pass(evidence: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Pass,
            evidence: evidence.into(),
        }
    }

    pub fn warn(evidence: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Warn,
            evidence: evidence.into(),
        }
    }

    pub fn fail(evidence: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Fail,
            evidence: evidence.into(),
        }
    }
}

type CheckFn = Box<dyn Fn(&StoreView) -> Outcome + Send + Sync>;

struct Check {
    name: &'static str,
    eval: CheckFn,
}

/// Ordered list of named checks. Results come back in registration order.
#[derive(Default)]
pub struct Registry {
    checks: Vec<Check>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &'static str, eval: F)
    where
        F: Fn(&StoreView) -> Outcome + Send + Sync + 'static,
    {
        self.checks.push(Check {
            name,
            eval: Box::new(eval),
        });
    }

    pub fn evaluate(&self, view: &StoreView) -> Vec<CheckResult> {
        self.checks
            .iter()
            .map(|check| {
                let outcome = (check.eval)(view);
                CheckResult {
                    name: check.name.to_string(),
                    verdict: outcome.verdict,
                    evidence: outcome.evidence,
                    evaluated_at: view.now,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SecurityRating {
    #[serde(rename = "EXCELLENT")]
    Excellent,
    #[serde(rename = "GOOD")]
    Good,
    #[serde(rename = "NEEDS ATTENTION")]
    NeedsAttention,
}

impl SecurityRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityRating::Excellent => "EXCELLENT",
            SecurityRating::Good => "GOOD",
            SecurityRating::NeedsAttention => "NEEDS ATTENTION",
        }
    }
}

impl fmt::Display for SecurityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingThresholds {
    pub excellent: f64,
    pub good: f64,
}

impl Default for RatingThresholds {
    fn default() -> Self {
        Self {
            excellent: 1.0,
            good: 0.7,
        }
    }
}

impl RatingThresholds {
    /// Both bounds are inclusive. No checks at all rates as fully passed.
    pub fn rate(&self, passed: usize, total: usize) -> SecurityRating {
        let ratio = if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        };
        if ratio >= self.excellent {
            SecurityRating::Excellent
        } else if ratio >= self.good {
            SecurityRating::Good
        } else {
            SecurityRating::NeedsAttention
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub results: Vec<CheckResult>,
    pub passed: usize,
    pub total: usize,
    pub verdict: SecurityRating,
}

pub struct RuleEngine {
    audit: Registry,
    compliance: Registry,
    thresholds: RatingThresholds,
}

impl RuleEngine {
    pub fn new(audit: Registry, compliance: Registry, thresholds: RatingThresholds) -> Self {
        Self {
            audit,
            compliance,
            thresholds,
        }
    }

    pub fn from_config(cfg: &RulesConfig) -> Self {
        Self::new(
            audit::registry(cfg),
            compliance::registry(cfg),
            RatingThresholds {
                excellent: cfg.excellent_ratio,
                good: cfg.good_ratio,
            },
        )
    }

    pub fn run_audit(&self, view: &StoreView) -> AuditReport {
        let results = self.audit.evaluate(view);
        let passed = results
            .iter()
            .filter(|r| r.verdict == Verdict::Pass)
            .count();
        let total = results.len();
        AuditReport {
            verdict: self.thresholds.rate(passed, total),
            results,
            passed,
            total,
        }
    }

    pub fn run_compliance(&self, view: &StoreView) -> Vec<CheckResult> {
        self.compliance.evaluate(view)
    }
}

/// Evidence for a check whose input domain has not been collected yet.
pub(crate) fn not_collected(what: &str) -> String {
    format!("{what} not collected")
}
