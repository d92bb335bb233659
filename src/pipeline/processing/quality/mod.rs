use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::domain::BookRecord;
use crate::error::ReconcileError;
use crate::pipeline::processing::identity;
use crate::pipeline::processing::normalize::fields;
use crate::pipeline::processing::validation::{field_present, IssueKind, ValidationResult};

const COMPLETENESS_WEIGHT: f64 = 0.3;
const VALIDITY_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.2;
const ACCURACY_WEIGHT: f64 = 0.2;

/// Dimensions at or above this are not worth a suggestion
const SUGGESTION_THRESHOLD: f64 = 0.9;
/// Slopes smaller than this many points per step count as flat
const STABLE_SLOPE: f64 = 1.0;
const MAX_PLAUSIBLE_TITLE: usize = 500;

/// How harshly the weighted base is curved into the overall score.
///
/// All policies share the same dimension weights and apply `100 * base^exponent`,
/// so for any record `strict <= balanced <= lenient`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightingPolicy {
    Strict,
    #[default]
    Balanced,
    Lenient,
}

impl WeightingPolicy {
    pub fn exponent(&self) -> f64 {
        match self {
            WeightingPolicy::Strict => 1.5,
            WeightingPolicy::Balanced => 1.0,
            WeightingPolicy::Lenient => 0.7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightingPolicy::Strict => "strict",
            WeightingPolicy::Balanced => "balanced",
            WeightingPolicy::Lenient => "lenient",
        }
    }
}

impl fmt::Display for WeightingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightingPolicy {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(WeightingPolicy::Strict),
            "balanced" => Ok(WeightingPolicy::Balanced),
            "lenient" => Ok(WeightingPolicy::Lenient),
            other => Err(ReconcileError::Config(format!("unknown quality policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityCategory {
    Completeness,
    Validity,
    Consistency,
    Accuracy,
}

impl QualityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCategory::Completeness => "completeness",
            QualityCategory::Validity => "validity",
            QualityCategory::Consistency => "consistency",
            QualityCategory::Accuracy => "accuracy",
        }
    }
}

/// Per-dimension scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityDimensions {
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub accuracy: f64,
}

impl QualityDimensions {
    pub const PERFECT: QualityDimensions = QualityDimensions {
        completeness: 1.0,
        validity: 1.0,
        consistency: 1.0,
        accuracy: 1.0,
    };

    /// Weighted sum of the dimensions, in [0, 1]
    pub fn weighted_base(&self) -> f64 {
        let base = self.completeness * COMPLETENESS_WEIGHT
            + self.validity * VALIDITY_WEIGHT
            + self.consistency * CONSISTENCY_WEIGHT
            + self.accuracy * ACCURACY_WEIGHT;
        base.clamp(0.0, 1.0)
    }

    pub fn get(&self, category: QualityCategory) -> f64 {
        match category {
            QualityCategory::Completeness => self.completeness,
            QualityCategory::Validity => self.validity,
            QualityCategory::Consistency => self.consistency,
            QualityCategory::Accuracy => self.accuracy,
        }
    }

    fn with(mut self, category: QualityCategory, value: f64) -> Self {
        match category {
            QualityCategory::Completeness => self.completeness = value,
            QualityCategory::Validity => self.validity = value,
            QualityCategory::Consistency => self.consistency = value,
            QualityCategory::Accuracy => self.accuracy = value,
        }
        self
    }

    fn categories(&self) -> [(QualityCategory, f64); 4] {
        [
            (QualityCategory::Completeness, self.completeness),
            (QualityCategory::Validity, self.validity),
            (QualityCategory::Consistency, self.consistency),
            (QualityCategory::Accuracy, self.accuracy),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScore {
    pub record_id: String,
    /// Always in [0, 100]
    pub overall_score: f64,
    pub dimensions: QualityDimensions,
    pub policy: WeightingPolicy,
    /// Short issue codes, aggregated by `score_batch`
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDistribution {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCount {
    pub issue: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchQualitySummary {
    pub count: usize,
    pub average: f64,
    pub distribution: QualityDistribution,
    pub common_issues: Vec<IssueCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTrend {
    pub direction: TrendDirection,
    /// Least-squares slope in points per step
    pub change_rate: f64,
    /// One step ahead, clamped to [0, 100]
    pub projection: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub priority: SuggestionPriority,
    pub category: QualityCategory,
    pub recommendation: String,
    /// Overall points gained if this dimension were perfect
    pub expected_improvement: f64,
}

/// Scores records and batches on completeness, validity, consistency and accuracy
#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    policy: WeightingPolicy,
    trend_window: usize,
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new(WeightingPolicy::default())
    }
}

impl QualityAnalyzer {
    pub fn new(policy: WeightingPolicy) -> Self {
        Self {
            policy,
            trend_window: 5,
        }
    }

    pub fn with_trend_window(mut self, window: usize) -> Self {
        self.trend_window = window.max(2);
        self
    }

    pub fn policy(&self) -> WeightingPolicy {
        self.policy
    }

    pub fn trend_window(&self) -> usize {
        self.trend_window
    }

    /// Overall score for a set of dimensions under this analyzer's policy
    pub fn overall(&self, dimensions: &QualityDimensions) -> f64 {
        (100.0 * dimensions.weighted_base().powf(self.policy.exponent())).clamp(0.0, 100.0)
    }

    pub fn score_record(&self, record: &BookRecord, validation: &ValidationResult) -> QualityScore {
        let mut issues = Vec::new();

        let populated = fields::SCORED_FIELDS
            .iter()
            .filter(|f| field_present(record, f))
            .count();
        let completeness = populated as f64 / fields::SCORED_FIELDS.len() as f64;

        let validity = validation.pass_ratio();
        for issue in validation.errors().iter().chain(validation.warnings()) {
            issues.push(format!("{}:{}", issue_kind_code(issue.kind), issue.field));
        }

        let consistency = ratio(consistency_checks(record), &mut issues);
        let accuracy = ratio(accuracy_checks(record), &mut issues);

        let dimensions = QualityDimensions {
            completeness,
            validity,
            consistency,
            accuracy,
        };

        QualityScore {
            record_id: record.record_id().to_string(),
            overall_score: self.overall(&dimensions),
            dimensions,
            policy: self.policy,
            issues,
        }
    }

    pub fn score_batch(&self, scores: &[QualityScore]) -> BatchQualitySummary {
        let mut distribution = QualityDistribution::default();
        let mut issue_counts: BTreeMap<&str, usize> = BTreeMap::new();

        for score in scores {
            match score.overall_score {
                s if s >= 90.0 => distribution.excellent += 1,
                s if s >= 75.0 => distribution.good += 1,
                s if s >= 50.0 => distribution.fair += 1,
                _ => distribution.poor += 1,
            }
            for issue in &score.issues {
                *issue_counts.entry(issue.as_str()).or_insert(0) += 1;
            }
        }

        let average = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.overall_score).sum::<f64>() / scores.len() as f64
        };

        let mut common_issues: Vec<IssueCount> = issue_counts
            .into_iter()
            .map(|(issue, count)| IssueCount {
                issue: issue.to_string(),
                count,
            })
            .collect();
        // BTreeMap iteration already orders names; a stable sort keeps that for ties.
        common_issues.sort_by(|a, b| b.count.cmp(&a.count));

        BatchQualitySummary {
            count: scores.len(),
            average,
            distribution,
            common_issues,
        }
    }

    /// Classify the trailing window of `history` by its least-squares slope
    pub fn trend(&self, history: &[f64]) -> QualityTrend {
        let start = history.len().saturating_sub(self.trend_window);
        let window = &history[start..];

        if window.len() < 2 {
            return QualityTrend {
                direction: TrendDirection::Stable,
                change_rate: 0.0,
                projection: window.last().copied().unwrap_or(0.0).clamp(0.0, 100.0),
            };
        }

        let n = window.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = window.iter().sum::<f64>() / n;
        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in window.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        let slope = num / den;
        let last_fitted = mean_y + slope * (n - 1.0 - mean_x);

        let direction = if slope.abs() < STABLE_SLOPE {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Improving
        } else {
            TrendDirection::Declining
        };

        QualityTrend {
            direction,
            change_rate: slope,
            projection: (last_fitted + slope).clamp(0.0, 100.0),
        }
    }

    /// Suggestions for each weak dimension, weakest first
    pub fn suggest(&self, score: &QualityScore) -> Vec<Suggestion> {
        let mut weak: Vec<(QualityCategory, f64)> = score
            .dimensions
            .categories()
            .into_iter()
            .filter(|(_, value)| *value < SUGGESTION_THRESHOLD)
            .collect();
        weak.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let current = self.overall(&score.dimensions);
        weak.into_iter()
            .map(|(category, value)| {
                let improved = self.overall(&score.dimensions.with(category, 1.0));
                Suggestion {
                    priority: if value < 0.5 {
                        SuggestionPriority::High
                    } else if value < 0.75 {
                        SuggestionPriority::Medium
                    } else {
                        SuggestionPriority::Low
                    },
                    category,
                    recommendation: recommendation(category).to_string(),
                    expected_improvement: (improved - current).max(0.0),
                }
            })
            .collect()
    }
}

/// Bounded record of batch averages, oldest first
#[derive(Debug, Clone)]
pub struct QualityHistory {
    capacity: usize,
    values: VecDeque<f64>,
}

impl QualityHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn values(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn ratio(checks: Vec<(bool, &'static str)>, issues: &mut Vec<String>) -> f64 {
    if checks.is_empty() {
        return 1.0;
    }
    let total = checks.len();
    let mut passed = 0;
    for (ok, code) in checks {
        if ok {
            passed += 1;
        } else {
            issues.push(code.to_string());
        }
    }
    passed as f64 / total as f64
}

fn consistency_checks(record: &BookRecord) -> Vec<(bool, &'static str)> {
    let finished_matches_progress = !record.is_finished || record.progress.map_or(true, |p| p >= 100.0);
    let complete_marked_finished = record.progress.map_or(true, |p| p < 100.0) || record.is_finished;
    let read_before_update = match (record.last_read, record.last_updated) {
        (Some(read), Some(updated)) => read <= updated.date_naive(),
        _ => true,
    };
    vec![
        (finished_matches_progress, "finished_without_full_progress"),
        (complete_marked_finished, "complete_but_not_finished"),
        (read_before_update, "read_after_last_update"),
    ]
}

fn accuracy_checks(record: &BookRecord) -> Vec<(bool, &'static str)> {
    let now = Utc::now();
    let horizon = now + Duration::days(1);

    let progress_in_range = record.progress.map_or(true, |p| (0.0..=100.0).contains(&p));
    let zero_progress_read = record.progress == Some(0.0) && record.last_read.is_some();
    let future_date = record.last_read.is_some_and(|d| d > horizon.date_naive())
        || record.last_updated.is_some_and(|t| t > horizon);
    let title_len = record.title.chars().count();
    let plausible_title = title_len > 0
        && title_len <= MAX_PLAUSIBLE_TITLE
        && record.title.chars().any(char::is_alphanumeric);
    let isbn_ok = record.isbn.as_deref().map_or(true, identity::has_valid_checksum);

    vec![
        (progress_in_range, "progress_out_of_range"),
        (!zero_progress_read, "zero_progress_with_read_date"),
        (!future_date, "future_date"),
        (plausible_title, "implausible_title"),
        (isbn_ok, "isbn_checksum_failed"),
    ]
}

fn issue_kind_code(kind: IssueKind) -> &'static str {
    match kind {
        IssueKind::Structure => "structure",
        IssueKind::RequiredField => "required_field",
        IssueKind::TypeMismatch => "type_mismatch",
        IssueKind::BusinessRule => "business_rule",
    }
}

fn recommendation(category: QualityCategory) -> &'static str {
    match category {
        QualityCategory::Completeness => {
            "Fill in missing fields such as publisher, ISBN and cover from the platform's detail page"
        }
        QualityCategory::Validity => "Fix the validation errors and warnings reported for this record",
        QualityCategory::Consistency => "Reconcile the finished flag, reading progress and reading dates",
        QualityCategory::Accuracy => "Review implausible values such as out-of-range progress or future dates",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;
    use crate::pipeline::processing::validation::ValidationResult;
    use chrono::{NaiveDate, TimeZone};

    fn full_record() -> BookRecord {
        let mut record = BookRecord::blank(Platform::Readmoo);
        record.source_id = "rm-1".to_string();
        record.title = "Snow Crash".to_string();
        record.authors = vec!["Neal Stephenson".to_string()];
        record.publisher = Some("Bantam".to_string());
        record.isbn = Some("9780553380958".to_string());
        record.progress = Some(60.0);
        record.cover_url = Some("https://readmoo.com/c/1.jpg".to_string());
        record.book_type = Some("ebook".to_string());
        record.tags = vec!["sf".to_string()];
        record.last_read = NaiveDate::from_ymd_opt(2024, 2, 1);
        record.last_updated = Some(Utc.with_ymd_and_hms(2024, 2, 2, 8, 0, 0).unwrap());
        identity::attach_identity(record)
    }

    fn clean(checks: usize) -> ValidationResult {
        ValidationResult::new("x", Vec::new(), Vec::new(), checks)
    }

    #[test]
    fn test_complete_consistent_record_scores_full_marks() {
        let score = QualityAnalyzer::default().score_record(&full_record(), &clean(10));
        assert_eq!(score.dimensions, QualityDimensions::PERFECT);
        assert!((score.overall_score - 100.0).abs() < 1e-9);
        assert!(score.issues.is_empty(), "{:?}", score.issues);
    }

    #[test]
    fn test_policies_are_ordered_for_same_input() {
        let mut record = full_record();
        record.publisher = None;
        record.tags.clear();
        record.is_finished = true;
        let validation = clean(8);

        let strict = QualityAnalyzer::new(WeightingPolicy::Strict).score_record(&record, &validation);
        let balanced = QualityAnalyzer::new(WeightingPolicy::Balanced).score_record(&record, &validation);
        let lenient = QualityAnalyzer::new(WeightingPolicy::Lenient).score_record(&record, &validation);

        assert!(strict.overall_score <= balanced.overall_score);
        assert!(balanced.overall_score <= lenient.overall_score);
        assert!(strict.overall_score < lenient.overall_score);
    }

    #[test]
    fn test_finished_flag_disagreeing_with_progress_hurts_consistency() {
        let mut record = full_record();
        record.is_finished = true;
        let score = QualityAnalyzer::default().score_record(&record, &clean(10));
        assert!(score.dimensions.consistency < 1.0);
        assert!(score.issues.contains(&"finished_without_full_progress".to_string()));
    }

    #[test]
    fn test_zero_progress_with_read_date_hurts_accuracy() {
        let mut record = full_record();
        record.progress = Some(0.0);
        let score = QualityAnalyzer::default().score_record(&record, &clean(10));
        assert!((score.dimensions.accuracy - 0.8).abs() < 1e-9);
        assert!(score.issues.contains(&"zero_progress_with_read_date".to_string()));
    }

    #[test]
    fn test_score_batch_distribution_and_common_issues() {
        let analyzer = QualityAnalyzer::default();
        let make = |overall: f64, issues: &[&str]| QualityScore {
            record_id: "r".to_string(),
            overall_score: overall,
            dimensions: QualityDimensions::PERFECT,
            policy: WeightingPolicy::Balanced,
            issues: issues.iter().map(|s| s.to_string()).collect(),
        };
        let summary = analyzer.score_batch(&[
            make(95.0, &["b"]),
            make(80.0, &["a", "b"]),
            make(60.0, &["a", "c"]),
            make(10.0, &["b"]),
        ]);

        assert_eq!(summary.count, 4);
        assert!((summary.average - 61.25).abs() < 1e-9);
        assert_eq!(
            summary.distribution,
            QualityDistribution {
                excellent: 1,
                good: 1,
                fair: 1,
                poor: 1
            }
        );
        let names: Vec<_> = summary.common_issues.iter().map(|i| i.issue.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_trend_classification() {
        let analyzer = QualityAnalyzer::default();

        let up = analyzer.trend(&[50.0, 60.0, 70.0, 80.0, 90.0]);
        assert_eq!(up.direction, TrendDirection::Improving);
        assert!((up.change_rate - 10.0).abs() < 1e-9);
        assert!((up.projection - 100.0).abs() < 1e-9);

        let down = analyzer.trend(&[99.0, 90.0, 80.0, 70.0, 60.0, 50.0]);
        assert_eq!(down.direction, TrendDirection::Declining);
        assert!((down.projection - 40.0).abs() < 1e-9);

        let flat = analyzer.trend(&[70.0, 70.5, 70.0, 70.5]);
        assert_eq!(flat.direction, TrendDirection::Stable);

        let single = analyzer.trend(&[42.0]);
        assert_eq!(single.direction, TrendDirection::Stable);
        assert_eq!(single.change_rate, 0.0);
        assert_eq!(single.projection, 42.0);
    }

    #[test]
    fn test_suggestions_target_weakest_dimensions_first() {
        let analyzer = QualityAnalyzer::default();
        let dimensions = QualityDimensions {
            completeness: 0.4,
            validity: 1.0,
            consistency: 0.7,
            accuracy: 0.85,
        };
        let score = QualityScore {
            record_id: "r".to_string(),
            overall_score: analyzer.overall(&dimensions),
            dimensions,
            policy: WeightingPolicy::Balanced,
            issues: Vec::new(),
        };

        let suggestions = analyzer.suggest(&score);
        let order: Vec<_> = suggestions.iter().map(|s| (s.category, s.priority)).collect();
        assert_eq!(
            order,
            vec![
                (QualityCategory::Completeness, SuggestionPriority::High),
                (QualityCategory::Consistency, SuggestionPriority::Medium),
                (QualityCategory::Accuracy, SuggestionPriority::Low),
            ]
        );
        assert!((suggestions[0].expected_improvement - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = QualityHistory::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            history.push(v);
        }
        assert_eq!(history.values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_policy_parses_from_config_strings() {
        assert_eq!("Strict".parse::<WeightingPolicy>().unwrap(), WeightingPolicy::Strict);
        assert!("harsh".parse::<WeightingPolicy>().is_err());
    }
}
