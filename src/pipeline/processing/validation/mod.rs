pub mod rules;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::app::ports::RuleProvider;
use crate::domain::{BookRecord, Platform, RawRecord};
use crate::error::{ReconcileError, Result};
use crate::pipeline::processing::identity;
use crate::pipeline::processing::normalize::{self, fields};
use rules::{BusinessRule, FieldType, RuleSet};

/// Which stage of validation produced an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// The raw record could not be normalized at all
    Structure,
    RequiredField,
    TypeMismatch,
    BusinessRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: IssueKind, field: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Every problem found in one pass over a record.
/// `is_valid` is derived from `errors` and cannot drift from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    record_id: String,
    is_valid: bool,
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    checks_run: usize,
}

impl ValidationResult {
    pub fn new(
        record_id: impl Into<String>,
        errors: Vec<ValidationIssue>,
        warnings: Vec<ValidationIssue>,
        checks_run: usize,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            is_valid: errors.is_empty(),
            errors,
            warnings,
            checks_run,
        }
    }

    /// Result for a record that never made it through normalization
    pub fn structural_failure(record_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            record_id,
            vec![ValidationIssue::new(IssueKind::Structure, "record", message)],
            Vec::new(),
            1,
        )
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn errors(&self) -> &[ValidationIssue] {
        &self.errors
    }

    pub fn warnings(&self) -> &[ValidationIssue] {
        &self.warnings
    }

    pub fn checks_run(&self) -> usize {
        self.checks_run
    }

    /// Fraction of checks that raised neither an error nor a warning
    pub fn pass_ratio(&self) -> f64 {
        if self.checks_run == 0 {
            return 1.0;
        }
        let failed = (self.errors.len() + self.warnings.len()).min(self.checks_run);
        (self.checks_run - failed) as f64 / self.checks_run as f64
    }
}

/// Applies per-platform rule sets. Rules are pulled from the provider once, at construction.
pub struct ValidationEngine {
    rules: HashMap<Platform, RuleSet>,
    strict: bool,
}

impl ValidationEngine {
    pub fn new(provider: &dyn RuleProvider) -> Self {
        let rules = Platform::ALL
            .into_iter()
            .filter_map(|p| provider.rules_for_platform(p).map(|r| (p, r)))
            .collect();
        Self { rules, strict: false }
    }

    /// Escalate every warning to an error
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.rules.contains_key(&platform)
    }

    pub fn rules(&self, platform: Platform) -> Option<&RuleSet> {
        self.rules.get(&platform)
    }

    /// Validate an already-normalized record
    pub fn validate(&self, record: &BookRecord, platform: Platform) -> Result<ValidationResult> {
        self.check(&record.to_raw(), record, platform, self.strict)
    }

    /// Validate a normalized record, type-checking the raw values it came from
    pub fn validate_with_raw(
        &self,
        raw: &RawRecord,
        record: &BookRecord,
        platform: Platform,
    ) -> Result<ValidationResult> {
        self.check(raw, record, platform, self.strict)
    }

    /// Required fields, then declared types, then business rules. Nothing short-circuits.
    pub fn check(
        &self,
        raw: &RawRecord,
        record: &BookRecord,
        platform: Platform,
        strict: bool,
    ) -> Result<ValidationResult> {
        let rules = self
            .rules
            .get(&platform)
            .ok_or_else(|| ReconcileError::UnknownPlatform(platform.to_string()))?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut checks_run = 0;

        for field in &rules.required_fields {
            checks_run += 1;
            if !field_present(record, field) {
                errors.push(ValidationIssue::new(
                    IssueKind::RequiredField,
                    field,
                    format!("required field '{}' is missing or blank", field),
                ));
            }
        }

        if let Some(data) = raw.as_object() {
            for (field, expected) in &rules.data_types {
                let Some(value) = fields::lookup(data, field) else {
                    continue;
                };
                checks_run += 1;
                match check_type(value, *expected, platform) {
                    TypeCheck::Ok => {}
                    TypeCheck::Coercible(message) => {
                        warnings.push(ValidationIssue::new(IssueKind::TypeMismatch, field, message))
                    }
                    TypeCheck::Mismatch(message) => {
                        errors.push(ValidationIssue::new(IssueKind::TypeMismatch, field, message))
                    }
                }
            }
        }

        for rule in &rules.business_rules {
            checks_run += 1;
            apply_business_rule(rule, record, &mut errors, &mut warnings);
        }

        if strict {
            errors.append(&mut warnings);
        }

        Ok(ValidationResult::new(record.record_id(), errors, warnings, checks_run))
    }
}

/// Whether a canonical field carries a usable value after normalization
pub(crate) fn field_present(record: &BookRecord, field: &str) -> bool {
    match field {
        fields::ID => !record.source_id.is_empty(),
        fields::TITLE => !record.title.is_empty(),
        fields::AUTHORS => !record.authors.is_empty(),
        fields::PUBLISHER => record.publisher.is_some(),
        fields::ISBN => record.isbn.is_some(),
        fields::PROGRESS => record.progress.is_some(),
        fields::IS_FINISHED => true,
        fields::COVER => record.cover_url.is_some(),
        fields::BOOK_TYPE => record.book_type.is_some(),
        fields::TAGS => !record.tags.is_empty(),
        fields::LAST_READ => record.last_read.is_some(),
        fields::LAST_UPDATED => record.last_updated.is_some(),
        _ => false,
    }
}

enum TypeCheck {
    Ok,
    /// Wrong shape, but the normalizer could coerce it
    Coercible(String),
    Mismatch(String),
}

fn check_type(value: &Value, expected: FieldType, platform: Platform) -> TypeCheck {
    let kind = normalize::value_kind(value);
    match expected {
        FieldType::Text => match value {
            Value::String(_) => TypeCheck::Ok,
            Value::Number(_) => TypeCheck::Coercible(format!("expected text, found {}", kind)),
            _ => TypeCheck::Mismatch(format!("expected text, found {}", kind)),
        },
        FieldType::TextList => match value {
            Value::Array(items) if items.iter().all(|i| i.is_string() || i.is_null()) => TypeCheck::Ok,
            Value::Array(_) => TypeCheck::Coercible("list contains non-text entries".to_string()),
            Value::String(_) => TypeCheck::Coercible("expected a list, found a single string".to_string()),
            _ => TypeCheck::Mismatch(format!("expected a list, found {}", kind)),
        },
        FieldType::Number => match value {
            Value::Number(_) => TypeCheck::Ok,
            _ if normalize::coerce_number(value).is_some() => {
                TypeCheck::Coercible(format!("expected a number, found numeric {}", kind))
            }
            _ => TypeCheck::Mismatch(format!("expected a number, found {}", kind)),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => TypeCheck::Ok,
            _ if normalize::coerce_bool(value).is_some() => {
                TypeCheck::Coercible(format!("expected a boolean, found {}", kind))
            }
            _ => TypeCheck::Mismatch(format!("expected a boolean, found {}", kind)),
        },
        FieldType::Date => {
            if normalize::parse_timestamp(value).is_some() {
                TypeCheck::Ok
            } else {
                TypeCheck::Mismatch(format!("expected a date, found {}", kind))
            }
        }
        FieldType::Url => match value {
            Value::String(s) if s.trim().is_empty() => TypeCheck::Ok,
            Value::String(s) => match normalize::normalize_cover_url(s, platform) {
                Some(resolved) if resolved == s.trim() => TypeCheck::Ok,
                Some(_) => TypeCheck::Coercible("relative URL was resolved".to_string()),
                None => TypeCheck::Coercible("unresolvable URL was blanked".to_string()),
            },
            _ => TypeCheck::Mismatch(format!("expected a URL, found {}", kind)),
        },
    }
}

fn apply_business_rule(
    rule: &BusinessRule,
    record: &BookRecord,
    errors: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<ValidationIssue>,
) {
    match rule {
        BusinessRule::ProgressRange { min, max } => {
            if let Some(p) = record.progress {
                if p < *min || p > *max {
                    errors.push(ValidationIssue::new(
                        IssueKind::BusinessRule,
                        fields::PROGRESS,
                        format!("progress {} outside [{}, {}]", p, min, max),
                    ));
                }
            }
        }
        BusinessRule::NonEmpty { field } => {
            if !field_present(record, field) {
                errors.push(ValidationIssue::new(
                    IssueKind::BusinessRule,
                    field,
                    format!("'{}' must not be empty", field),
                ));
            }
        }
        BusinessRule::MaxLength { field, max } => {
            let len = match field.as_str() {
                fields::TITLE => record.title.chars().count(),
                fields::PUBLISHER => record.publisher.as_deref().map_or(0, |p| p.chars().count()),
                _ => 0,
            };
            if len > *max {
                warnings.push(ValidationIssue::new(
                    IssueKind::BusinessRule,
                    field,
                    format!("'{}' is {} characters, limit is {}", field, len, max),
                ));
            }
        }
        BusinessRule::FinishedImpliesComplete => {
            if let (true, Some(p)) = (record.is_finished, record.progress) {
                if p < 100.0 {
                    warnings.push(ValidationIssue::new(
                        IssueKind::BusinessRule,
                        fields::IS_FINISHED,
                        format!("marked finished at {}% progress", p),
                    ));
                }
            }
        }
        BusinessRule::IsbnChecksum => {
            if let Some(isbn) = &record.isbn {
                if !identity::has_valid_checksum(isbn) {
                    warnings.push(ValidationIssue::new(
                        IssueKind::BusinessRule,
                        fields::ISBN,
                        format!("ISBN '{}' fails its checksum", isbn),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::normalize::{DefaultNormalizer, Normalizer};
    use rules::DefaultRuleProvider;
    use serde_json::json;

    fn engine() -> ValidationEngine {
        ValidationEngine::new(&DefaultRuleProvider::new())
    }

    fn run(raw: Value, platform: Platform) -> ValidationResult {
        let normalized = DefaultNormalizer::new().normalize(&raw, platform).unwrap();
        engine().validate_with_raw(&raw, &normalized.record, platform).unwrap()
    }

    #[test]
    fn test_clean_record_is_valid() {
        let result = run(
            json!({ "id": "1", "title": "Dune", "authors": ["Frank Herbert"], "progress": 20 }),
            Platform::Readmoo,
        );
        assert!(result.is_valid());
        assert!(result.errors().is_empty());
        assert!(result.warnings().is_empty());
        assert_eq!(result.pass_ratio(), 1.0);
    }

    #[test]
    fn test_blank_title_reports_required_field() {
        let result = run(json!({ "id": "3", "title": "" }), Platform::Readmoo);
        assert!(!result.is_valid());
        assert!(result
            .errors()
            .iter()
            .any(|e| e.kind == IssueKind::RequiredField && e.field == "title"));
    }

    #[test]
    fn test_type_failure_does_not_suppress_business_rules() {
        let result = run(
            json!({ "id": "1", "title": "T", "progress": "150", "authors": 7 }),
            Platform::Readmoo,
        );
        let kinds: Vec<_> = result
            .errors()
            .iter()
            .chain(result.warnings())
            .map(|i| (i.kind, i.field.as_str()))
            .collect();
        assert!(kinds.contains(&(IssueKind::TypeMismatch, "authors")));
        assert!(kinds.contains(&(IssueKind::TypeMismatch, "progress")));
        assert!(kinds.contains(&(IssueKind::BusinessRule, "progress")));
        assert!(!result.is_valid());
    }

    #[test]
    fn test_strict_mode_escalates_warnings() {
        let raw = json!({ "id": "1", "title": "T", "author": "Single Author" });
        let normalized = DefaultNormalizer::new().normalize(&raw, Platform::Readmoo).unwrap();

        let lenient = engine().validate_with_raw(&raw, &normalized.record, Platform::Readmoo).unwrap();
        assert!(lenient.is_valid());
        assert_eq!(lenient.warnings().len(), 1);

        let strict = engine()
            .with_strict(true)
            .validate_with_raw(&raw, &normalized.record, Platform::Readmoo)
            .unwrap();
        assert!(!strict.is_valid());
        assert!(strict.warnings().is_empty());
        assert_eq!(strict.errors().len(), 1);
    }

    #[test]
    fn test_kindle_requires_authors() {
        let result = run(json!({ "id": "1", "title": "T" }), Platform::Kindle);
        assert!(result.errors().iter().any(|e| e.field == "authors"));
    }

    #[test]
    fn test_unknown_platform_is_rejected() {
        let engine = ValidationEngine::new(&DefaultRuleProvider::empty());
        let record = BookRecord::blank(Platform::Kobo);
        let err = engine.validate(&record, Platform::Kobo).unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownPlatform(_)));
    }

    #[test]
    fn test_finished_with_partial_progress_warns() {
        let result = run(
            json!({ "id": "1", "title": "T", "progress": 40, "isFinished": true }),
            Platform::Readmoo,
        );
        assert!(result.is_valid());
        assert!(result.warnings().iter().any(|w| w.field == "isFinished"));
    }
}
