//! Routing: request category to an ordered list of stages.

use crate::error::RoutingError;
use std::collections::HashMap;

/// Ordered stages, each a group of worker ids run concurrently.
pub type StagePlan = Vec<Vec<String>>;

/// Category used when nothing more specific applies.
pub const FALLBACK_CATEGORY: &str = "general";

/// Decides which units run, and in which stage, for a category.
///
/// Must be deterministic and free of side effects.
pub trait Router: Send + Sync {
    fn route(&self, category: &str) -> Result<StagePlan, RoutingError>;
}

impl<F> Router for F
where
    F: Fn(&str) -> Result<StagePlan, RoutingError> + Send + Sync,
{
    fn route(&self, category: &str) -> Result<StagePlan, RoutingError> {
        self(category)
    }
}

/// Fixed category → stages table, falling back to the `general` route.
#[derive(Debug, Clone, Default)]
pub struct TableRouter {
    routes: HashMap<String, StagePlan>,
}

impl TableRouter {
    pub fn new(routes: HashMap<String, StagePlan>) -> Self {
        Self { routes }
    }

    pub fn with_route(mut self, category: impl Into<String>, plan: StagePlan) -> Self {
        self.routes.insert(category.into(), plan);
        self
    }
}

impl Router for TableRouter {
    fn route(&self, category: &str) -> Result<StagePlan, RoutingError> {
        self.routes
            .get(category)
            .or_else(|| self.routes.get(FALLBACK_CATEGORY))
            .cloned()
            .ok_or_else(|| {
                RoutingError(format!(
                    "no route for '{}' and no '{}' fallback",
                    category, FALLBACK_CATEGORY
                ))
            })
    }
}

/// One keyword rule of the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierRule {
    pub category: String,
    pub keywords: Vec<String>,
}

/// Derives a category from free-text query keywords.
///
/// Rules are tried in order; the first with a keyword contained in the
/// lower-cased query wins.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<ClassifierRule>,
    default_category: String,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(Vec::new(), FALLBACK_CATEGORY)
    }
}

impl KeywordClassifier {
    pub fn new(rules: Vec<ClassifierRule>, default_category: impl Into<String>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| ClassifierRule {
                category: rule.category,
                keywords: rule.keywords.iter().map(|k| k.to_lowercase()).collect(),
            })
            .collect();

        Self {
            rules,
            default_category: default_category.into(),
        }
    }

    pub fn classify(&self, query: &str) -> &str {
        let query = query.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| !k.is_empty() && query.contains(k.as_str()))
            })
            .map(|rule| rule.category.as_str())
            .unwrap_or(&self.default_category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(stages: &[&[&str]]) -> StagePlan {
        stages
            .iter()
            .map(|s| s.iter().map(|id| id.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_table_router_fallback() {
        let router = TableRouter::default()
            .with_route("urgent", plan(&[&["a", "b"], &["c"]]))
            .with_route("general", plan(&[&["a"]]));

        assert_eq!(router.route("urgent").unwrap(), plan(&[&["a", "b"], &["c"]]));
        assert_eq!(router.route("unknown").unwrap(), plan(&[&["a"]]));
    }

    #[test]
    fn test_table_router_without_fallback_errors() {
        let router = TableRouter::default().with_route("urgent", plan(&[&["a"]]));
        assert!(router.route("trade").is_err());
    }

    #[test]
    fn test_closure_router() {
        let router = |category: &str| -> Result<StagePlan, RoutingError> {
            if category == "urgent" {
                Ok(vec![vec!["a".to_string()]])
            } else {
                Err(RoutingError("unsupported".to_string()))
            }
        };
        assert!(router.route("urgent").is_ok());
        assert!(Router::route(&router, "other").is_err());
    }

    #[test]
    fn test_keyword_classifier() {
        let classifier = KeywordClassifier::new(
            vec![
                ClassifierRule {
                    category: "waiver".to_string(),
                    keywords: vec!["Waiver".to_string(), "pickup".to_string()],
                },
                ClassifierRule {
                    category: "trade".to_string(),
                    keywords: vec!["trade".to_string()],
                },
            ],
            "general",
        );

        assert_eq!(classifier.classify("Best WAIVER pickups?"), "waiver");
        assert_eq!(classifier.classify("should I trade him"), "trade");
        assert_eq!(classifier.classify("how is my team"), "general");
    }
}
