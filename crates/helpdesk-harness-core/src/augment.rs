//! Query augmentation: widen recall with keyword- and category-padded
//! variants of the reformulated question.

use std::collections::{BTreeMap, HashSet};

use crate::models::QueryData;

/// Built-in category → context terms table.
pub const DEFAULT_CATEGORY_TERMS: &[(&str, &str)] = &[
    ("technical", "problem error bug"),
    ("authentication", "login sign-in access"),
    ("projects_tasks", "project task creation"),
    ("collaboration", "team sharing notification"),
    ("integrations", "integration API connection"),
    ("billing", "plan price payment"),
    ("security", "security 2FA permission"),
    ("onboarding", "getting started setup guide"),
];

#[derive(Debug, Clone)]
pub struct QueryAugmenter {
    category_terms: BTreeMap<String, String>,
    max_keywords: usize,
}

impl Default for QueryAugmenter {
    fn default() -> Self {
        Self {
            category_terms: DEFAULT_CATEGORY_TERMS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            max_keywords: 3,
        }
    }
}

impl QueryAugmenter {
    pub fn new(category_terms: BTreeMap<String, String>, max_keywords: usize) -> Self {
        Self {
            category_terms,
            max_keywords,
        }
    }

    /// Built-in table with `overrides` merged on top.
    pub fn with_overrides(overrides: &BTreeMap<String, String>, max_keywords: usize) -> Self {
        let mut augmenter = Self {
            max_keywords,
            ..Self::default()
        };
        for (category, terms) in overrides {
            augmenter
                .category_terms
                .insert(category.trim().to_lowercase(), terms.clone());
        }
        augmenter
    }

    pub fn category_terms(&self, category: &str) -> Option<&str> {
        self.category_terms
            .get(&category.trim().to_lowercase())
            .map(String::as_str)
    }

    /// Candidate queries for `query`, deduplicated in first-occurrence order.
    ///
    /// Element 0 is always the reformulation itself. Then, when present:
    /// the reformulation followed by the leading keywords, and the
    /// reformulation followed by the category's context terms.
    pub fn augment(&self, query: &QueryData) -> Vec<String> {
        let base = query.reformulation.trim();
        let mut variants = vec![base.to_string()];

        let keywords: Vec<&str> = query
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .take(self.max_keywords)
            .collect();
        if !keywords.is_empty() {
            variants.push(format!("{} {}", base, keywords.join(" ")));
        }

        if let Some(terms) = self.category_terms(&query.category) {
            variants.push(format!("{} {}", base, terms));
        }

        let mut seen = HashSet::new();
        variants.retain(|v| seen.insert(v.clone()));
        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(keywords: &[&str], category: &str) -> QueryData {
        QueryData {
            reformulation: "How to enable two-factor authentication".into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            category: category.into(),
            documents: Vec::new(),
        }
    }

    #[test]
    fn test_augment_base_only() {
        let out = QueryAugmenter::default().augment(&query(&[], "unknown"));
        assert_eq!(out, vec!["How to enable two-factor authentication"]);
    }

    #[test]
    fn test_augment_keywords_truncated_to_three() {
        let out = QueryAugmenter::default().augment(&query(&["2fa", "enable", "account", "phone"], ""));
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[1],
            "How to enable two-factor authentication 2fa enable account"
        );
    }

    #[test]
    fn test_augment_category_terms() {
        let out = QueryAugmenter::default().augment(&query(&["2fa"], "security"));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "How to enable two-factor authentication");
        assert_eq!(
            out[2],
            "How to enable two-factor authentication security 2FA permission"
        );
    }

    #[test]
    fn test_augment_dedup_preserves_order() {
        let mut overrides = BTreeMap::new();
        overrides.insert("custom".to_string(), "2fa".to_string());
        let augmenter = QueryAugmenter::with_overrides(&overrides, 3);
        let out = augmenter.augment(&query(&["2fa"], "custom"));
        assert_eq!(
            out,
            vec![
                "How to enable two-factor authentication",
                "How to enable two-factor authentication 2fa",
            ]
        );
    }

    #[test]
    fn test_overrides_replace_builtin() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Billing".to_string(), "invoice refund".to_string());
        let augmenter = QueryAugmenter::with_overrides(&overrides, 3);
        assert_eq!(augmenter.category_terms("billing"), Some("invoice refund"));
        assert_eq!(augmenter.category_terms("security"), Some("security 2FA permission"));
    }

    #[test]
    fn test_augment_deterministic() {
        let q = query(&["a1", "b2"], "technical");
        let augmenter = QueryAugmenter::default();
        assert_eq!(augmenter.augment(&q), augmenter.augment(&q));
    }
}
