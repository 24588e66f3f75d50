// src/validation/mod.rs
//
// Validator contract, the issue ledger that accumulates findings, and
// the scoring/level rules shared by every validator.

pub mod manager;
pub mod metacam;
pub mod transient;

pub use manager::ValidationManager;
pub use metacam::MetaCamValidator;
pub use transient::TransientValidator;

use crate::config::ScoringConfig;
use crate::types::{
    ResultMetadata, Severity, ValidationIssue, ValidationLevel, ValidationResult,
};
use std::path::Path;

/// Every validator: formats it understands and a validate that never
/// panics or errors across the boundary. Failures become issues on the
/// returned result.
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;
    fn supported_formats(&self) -> &'static [&'static str];
    fn validate(&self, root: &Path, level: ValidationLevel) -> ValidationResult;
}

/// Penalty class an error is scored under.
#[derive(Debug, Clone, Copy)]
pub enum Penalty {
    MissingRequired,
    SizeBreach,
    ContentParse,
    OptionalMissing,
    Warning,
}

/// Accumulates findings during a validation run and turns them into a
/// `ValidationResult`. Exact duplicates (same code and path) are
/// dropped so repeated checks cannot double-bill.
pub struct IssueLog {
    scoring: ScoringConfig,
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    penalty_total: f64,
    missing_required: usize,
}

impl IssueLog {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self {
            scoring,
            errors: Vec::new(),
            warnings: Vec::new(),
            penalty_total: 0.0,
            missing_required: 0,
        }
    }

    fn weight(&self, penalty: Penalty) -> f64 {
        match penalty {
            Penalty::MissingRequired => self.scoring.missing_required,
            Penalty::SizeBreach => self.scoring.size_breach,
            Penalty::ContentParse => self.scoring.parse_failure,
            Penalty::OptionalMissing => self.scoring.optional_missing,
            Penalty::Warning => self.scoring.warning,
        }
    }

    fn is_duplicate(list: &[ValidationIssue], issue: &ValidationIssue) -> bool {
        list.iter()
            .any(|e| e.code == issue.code && e.path == issue.path)
    }

    pub fn error(&mut self, issue: ValidationIssue, penalty: Penalty) {
        debug_assert!(issue.severity != Severity::Warning);
        if Self::is_duplicate(&self.errors, &issue) {
            return;
        }
        if matches!(penalty, Penalty::MissingRequired) {
            self.missing_required += 1;
        }
        self.penalty_total += self.weight(penalty);
        self.errors.push(issue);
    }

    pub fn warning(&mut self, issue: ValidationIssue) {
        self.warning_with(issue, Penalty::Warning);
    }

    /// Warning scored under a heavier class, e.g. a missing optional
    /// file.
    pub fn warning_with(&mut self, issue: ValidationIssue, penalty: Penalty) {
        debug_assert!(issue.severity == Severity::Warning);
        if Self::is_duplicate(&self.warnings, &issue) {
            return;
        }
        self.penalty_total += self.weight(penalty);
        self.warnings.push(issue);
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn score(&self) -> f64 {
        (100.0 - self.penalty_total).max(0.0)
    }

    /// Pass/fail per level. Score gates and error tolerance both apply;
    /// critical errors fail every level.
    pub fn is_valid(&self, level: ValidationLevel) -> bool {
        let has_critical = self
            .errors
            .iter()
            .any(|e| e.severity == Severity::Critical);
        if has_critical {
            return false;
        }
        let score = self.score();
        match level {
            ValidationLevel::Strict => {
                self.errors.is_empty() && self.missing_required == 0 && score >= 90.0
            }
            ValidationLevel::Standard => score >= 60.0,
            ValidationLevel::Lenient => self.errors.len() <= 5 && score >= 30.0,
        }
    }

    pub fn finish(
        self,
        level: ValidationLevel,
        validator_type: &str,
        metadata: ResultMetadata,
    ) -> ValidationResult {
        let is_valid = self.is_valid(level);
        let score = self.score();
        let summary = ValidationResult::clamp_summary(format!(
            "Validation {} - Score: {:.1}/100, Errors: {}, Warnings: {}",
            if is_valid { "PASS" } else { "FAIL" },
            score,
            self.errors.len(),
            self.warnings.len()
        ));
        ValidationResult {
            is_valid,
            score,
            errors: self.errors,
            warnings: self.warnings,
            summary,
            validator_type: validator_type.to_string(),
            metadata,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_scoring() -> ScoringConfig {
    ScoringConfig {
        missing_required: 20.0,
        size_breach: 10.0,
        parse_failure: 10.0,
        optional_missing: 5.0,
        warning: 2.0,
    }
}
