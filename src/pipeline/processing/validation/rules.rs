use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::app::ports::RuleProvider;
use crate::domain::Platform;
use crate::pipeline::processing::normalize::fields;

/// Declared shape of a raw field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    TextList,
    Number,
    Boolean,
    Date,
    Url,
}

/// Platform business rules evaluated on the normalized record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusinessRule {
    ProgressRange { min: f64, max: f64 },
    NonEmpty { field: String },
    MaxLength { field: String, max: usize },
    FinishedImpliesComplete,
    IsbnChecksum,
}

impl BusinessRule {
    pub fn name(&self) -> &'static str {
        match self {
            BusinessRule::ProgressRange { .. } => "progress_range",
            BusinessRule::NonEmpty { .. } => "non_empty",
            BusinessRule::MaxLength { .. } => "max_length",
            BusinessRule::FinishedImpliesComplete => "finished_implies_complete",
            BusinessRule::IsbnChecksum => "isbn_checksum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub required_fields: Vec<String>,
    pub data_types: BTreeMap<String, FieldType>,
    pub business_rules: Vec<BusinessRule>,
}

impl RuleSet {
    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.business_rules.iter().map(BusinessRule::name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRequirement {
    pub field: String,
    pub required: bool,
    pub field_type: Option<FieldType>,
}

/// Registry of rule sets keyed by platform
pub struct DefaultRuleProvider {
    rule_sets: HashMap<Platform, RuleSet>,
}

impl DefaultRuleProvider {
    /// Create a provider with the built-in rule set for every supported platform
    pub fn new() -> Self {
        let mut rule_sets = HashMap::new();
        for platform in Platform::ALL {
            rule_sets.insert(platform, Self::builtin(platform));
        }
        Self { rule_sets }
    }

    /// A provider with no platforms registered
    pub fn empty() -> Self {
        Self {
            rule_sets: HashMap::new(),
        }
    }

    /// Register or replace the rule set for a platform
    pub fn register(&mut self, platform: Platform, rules: RuleSet) {
        self.rule_sets.insert(platform, rules);
    }

    fn builtin(platform: Platform) -> RuleSet {
        let mut required_fields = vec![fields::ID.to_string(), fields::TITLE.to_string()];
        // Kindle and Kobo library pages always list authors; a missing one means a broken scrape.
        if matches!(platform, Platform::Kindle | Platform::Kobo) {
            required_fields.push(fields::AUTHORS.to_string());
        }

        let data_types = BTreeMap::from([
            (fields::TITLE.to_string(), FieldType::Text),
            (fields::AUTHORS.to_string(), FieldType::TextList),
            (fields::PUBLISHER.to_string(), FieldType::Text),
            (fields::PROGRESS.to_string(), FieldType::Number),
            (fields::IS_FINISHED.to_string(), FieldType::Boolean),
            (fields::COVER.to_string(), FieldType::Url),
            (fields::TAGS.to_string(), FieldType::TextList),
            (fields::LAST_READ.to_string(), FieldType::Date),
            (fields::LAST_UPDATED.to_string(), FieldType::Date),
        ]);

        let business_rules = vec![
            BusinessRule::ProgressRange { min: 0.0, max: 100.0 },
            BusinessRule::NonEmpty {
                field: fields::TITLE.to_string(),
            },
            BusinessRule::MaxLength {
                field: fields::TITLE.to_string(),
                max: 500,
            },
            BusinessRule::FinishedImpliesComplete,
            BusinessRule::IsbnChecksum,
        ];

        RuleSet {
            required_fields,
            data_types,
            business_rules,
        }
    }
}

impl Default for DefaultRuleProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleProvider for DefaultRuleProvider {
    fn rules_for_platform(&self, platform: Platform) -> Option<RuleSet> {
        self.rule_sets.get(&platform).cloned()
    }

    fn is_rule_supported(&self, platform: Platform, rule_name: &str) -> bool {
        self.rule_sets
            .get(&platform)
            .map(|rules| rules.rule_names().any(|name| name == rule_name))
            .unwrap_or(false)
    }

    fn field_requirements(&self, platform: Platform) -> Vec<FieldRequirement> {
        let Some(rules) = self.rule_sets.get(&platform) else {
            return Vec::new();
        };
        let mut names: Vec<&String> = rules.data_types.keys().collect();
        for field in &rules.required_fields {
            if !names.contains(&field) {
                names.push(field);
            }
        }
        names
            .into_iter()
            .map(|field| FieldRequirement {
                field: field.clone(),
                required: rules.required_fields.contains(field),
                field_type: rules.data_types.get(field).copied(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_has_every_platform() {
        let provider = DefaultRuleProvider::new();
        for platform in Platform::ALL {
            assert!(provider.rules_for_platform(platform).is_some(), "{platform}");
        }
        assert!(DefaultRuleProvider::empty().rules_for_platform(Platform::Kobo).is_none());
    }

    #[test]
    fn test_rule_support_lookup() {
        let provider = DefaultRuleProvider::new();
        assert!(provider.is_rule_supported(Platform::Readmoo, "progress_range"));
        assert!(!provider.is_rule_supported(Platform::Readmoo, "price_range"));
    }

    #[test]
    fn test_field_requirements_mark_required_fields() {
        let provider = DefaultRuleProvider::new();
        let reqs = provider.field_requirements(Platform::Kindle);
        let authors = reqs.iter().find(|r| r.field == fields::AUTHORS).unwrap();
        assert!(authors.required);
        assert_eq!(authors.field_type, Some(FieldType::TextList));

        let id = reqs.iter().find(|r| r.field == fields::ID).unwrap();
        assert!(id.required);
        assert_eq!(id.field_type, None);
    }
}
