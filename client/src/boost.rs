//! Declarative boost rules evaluated against the current shopping context.
//!
//! Evaluation is pure: the same rule and context always yield the same
//! fragments. A clause that reads a metafield the context doesn't carry yet
//! makes the whole evaluation report [`Evaluation::RequiresFetch`] so the
//! caller can fetch it once and evaluate again.

use crate::error::{Result, SearchError};
use crate::query::{typed_value, Field, Operator, Predicate, QueryNode, Value};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value as Json;
use std::collections::HashMap;
use tracing::warn;

const METAFIELD_PREFIX: &str = "metafield:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseSource {
    /// A field of the product (or its variants) in context.
    Product,
    /// Always applies.
    Static,
    /// A request parameter of the current visit.
    Session,
    /// The logged-in customer's tags or country.
    Customer,
}

/// How source values turn into target operands.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mapping {
    #[default]
    Identity,
    /// Keep values matching a `*` glob, e.g. `color-*`.
    Wildcard { pattern: String },
    /// Split values into lowercase words.
    Words,
    /// Translate through a lookup table; unmapped values are dropped.
    Table { entries: IndexMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BoostClause {
    pub source: ClauseSource,
    /// Product field, `metafield:ns.key`, request parameter, or `tags`/`country`.
    #[serde(default)]
    pub source_field: Option<String>,
    /// Field the fragment filters on. Defaults to the source field.
    #[serde(default, deserialize_with = "de_target_field")]
    pub target_field: Option<Field>,
    #[serde(default)]
    pub mapping: Mapping,
    /// Operand for `static` clauses, or for `customer` clauses that boost a fixed value.
    #[serde(default)]
    pub value: Option<String>,
    pub weight: f64,
}

fn de_target_field<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Field>, D::Error> {
    let spelling: Option<String> = Option::deserialize(deserializer)?;
    spelling
        .map(|s| s.parse::<Field>().map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BoostRule {
    pub name: String,
    pub clauses: Vec<BoostClause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetafieldRef {
    pub namespace: String,
    pub key: String,
}

impl MetafieldRef {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for MetafieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Customer {
    pub tags: Vec<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoostContext {
    /// Product entity as returned by the service or the storefront.
    pub product: Option<Json>,
    pub customer: Option<Customer>,
    pub session_params: HashMap<String, String>,
    /// Fetched metafield values; `Json::Null` records "fetched, absent".
    pub metafields: HashMap<MetafieldRef, Json>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Ready(Vec<QueryNode>),
    /// Metafields to fetch before the rule can be evaluated.
    RequiresFetch(Vec<MetafieldRef>),
}

impl BoostRule {
    pub fn evaluate(&self, context: &BoostContext) -> Result<Evaluation> {
        let mut fragments = Vec::new();
        let mut missing = Vec::new();
        for clause in &self.clauses {
            match clause.evaluate(context)? {
                Evaluation::Ready(nodes) => fragments.extend(nodes),
                Evaluation::RequiresFetch(refs) => {
                    for r in refs {
                        if !missing.contains(&r) {
                            missing.push(r);
                        }
                    }
                }
            }
        }
        if missing.is_empty() {
            Ok(Evaluation::Ready(fragments))
        } else {
            Ok(Evaluation::RequiresFetch(missing))
        }
    }

    /// Reject clauses that could never evaluate, naming the rule.
    pub fn validate(&self) -> Result<()> {
        for (i, clause) in self.clauses.iter().enumerate() {
            clause.validate().map_err(|e| {
                let msg = match e {
                    SearchError::Config(msg) => msg,
                    other => other.to_string(),
                };
                SearchError::Config(format!("boost rule '{}' clause {}: {}", self.name, i + 1, msg))
            })?;
        }
        Ok(())
    }

    /// Metafields any clause of this rule reads.
    pub fn metafield_refs(&self) -> Vec<MetafieldRef> {
        self.clauses.iter().filter_map(BoostClause::metafield_ref).collect()
    }
}

impl BoostClause {
    fn metafield_ref(&self) -> Option<MetafieldRef> {
        if self.source != ClauseSource::Product {
            return None;
        }
        let rest = self.source_field.as_deref()?.strip_prefix(METAFIELD_PREFIX)?;
        let (namespace, key) = rest.split_once('.')?;
        Some(MetafieldRef::new(namespace, key))
    }

    fn source_field(&self) -> Result<&str> {
        self.source_field.as_deref().ok_or_else(|| {
            SearchError::Config(format!("{:?} boost clause needs a source_field", self.source))
        })
    }

    fn target(&self) -> Result<Field> {
        if let Some(field) = &self.target_field {
            return Ok(field.clone());
        }
        let source = self.source_field()?;
        if source.starts_with(METAFIELD_PREFIX) {
            return Err(SearchError::Config(format!(
                "boost clause on '{}' needs a target_field",
                source
            )));
        }
        source.parse()
    }

    pub fn evaluate(&self, context: &BoostContext) -> Result<Evaluation> {
        let values = match self.source {
            ClauseSource::Static => {
                let value = self.value.clone().ok_or_else(|| {
                    SearchError::Config("static boost clause needs a value".to_string())
                })?;
                vec![value]
            }
            ClauseSource::Session => context
                .session_params
                .get(self.source_field()?)
                .cloned()
                .into_iter()
                .collect(),
            ClauseSource::Customer => {
                let Some(customer) = &context.customer else {
                    return Ok(Evaluation::Ready(Vec::new()));
                };
                match self.source_field()? {
                    "tags" | "tag" => customer.tags.clone(),
                    "country" => customer.country.clone().into_iter().collect(),
                    other => {
                        return Err(SearchError::Config(format!(
                            "customer boost clause reads 'tags' or 'country', not '{}'",
                            other
                        )))
                    }
                }
            }
            ClauseSource::Product => {
                if let Some(reference) = self.metafield_ref() {
                    match context.metafields.get(&reference) {
                        Some(value) => json_strings(value),
                        None => return Ok(Evaluation::RequiresFetch(vec![reference])),
                    }
                } else {
                    let Some(product) = &context.product else {
                        return Ok(Evaluation::Ready(Vec::new()));
                    };
                    product_values(product, self.source_field()?)
                }
            }
        };

        let mut matches = self.mapping.apply(&values)?;
        if self.source == ClauseSource::Customer {
            if let Some(fixed) = &self.value {
                matches = if matches.is_empty() {
                    Vec::new()
                } else {
                    vec![fixed.clone()]
                };
            }
        }
        if matches.is_empty() {
            return Ok(Evaluation::Ready(Vec::new()));
        }

        let target = self.target()?;
        let predicates: Vec<Predicate> = matches
            .iter()
            .filter_map(|raw| {
                let operand = typed_value(&target, raw).unwrap_or_else(|_| Value::from(raw.as_str()));
                match Predicate::new(target.clone(), Operator::Eq, operand) {
                    Ok(predicate) => Some(predicate),
                    Err(e) => {
                        warn!(value = %raw, target = %target, error = %e, "Skipping boost value");
                        None
                    }
                }
            })
            .collect();
        if predicates.is_empty() {
            return Ok(Evaluation::Ready(Vec::new()));
        }

        // Spread the clause weight over the usable matches.
        let weight = self.weight / predicates.len() as f64;
        Ok(Evaluation::Ready(
            predicates
                .into_iter()
                .map(|p| QueryNode::Predicate(p.weighted(weight)))
                .collect(),
        ))
    }

    /// Check the clause shape without a context.
    pub fn validate(&self) -> Result<()> {
        if !self.weight.is_finite() {
            return Err(SearchError::Config(format!(
                "boost clause weight must be finite, got {}",
                self.weight
            )));
        }
        match self.source {
            ClauseSource::Static => {
                if self.value.is_none() {
                    return Err(SearchError::Config(
                        "static boost clause needs a value".to_string(),
                    ));
                }
            }
            ClauseSource::Customer => match self.source_field()? {
                "tags" | "tag" | "country" => {}
                other => {
                    return Err(SearchError::Config(format!(
                        "customer boost clause reads 'tags' or 'country', not '{}'",
                        other
                    )))
                }
            },
            ClauseSource::Product | ClauseSource::Session => {
                self.source_field()?;
            }
        }
        self.target().map_err(|e| match e {
            SearchError::Config(msg) => SearchError::Config(msg),
            other => SearchError::Config(format!("boost clause target: {}", other)),
        })?;
        if let Mapping::Wildcard { pattern } = &self.mapping {
            glob_regex(pattern)?;
        }
        Ok(())
    }
}

impl Mapping {
    /// Map and de-duplicate, keeping first-seen order.
    fn apply(&self, values: &[String]) -> Result<Vec<String>> {
        let mapped: Vec<String> = match self {
            Mapping::Identity => values.to_vec(),
            Mapping::Wildcard { pattern } => {
                let regex = glob_regex(pattern)?;
                values.iter().filter(|v| regex.is_match(v)).cloned().collect()
            }
            Mapping::Words => values
                .iter()
                .flat_map(|v| {
                    v.split(|c: char| !c.is_alphanumeric())
                        .filter(|w| !w.is_empty())
                        .map(str::to_lowercase)
                        .collect::<Vec<_>>()
                })
                .collect(),
            Mapping::Table { entries } => values
                .iter()
                .filter_map(|v| entries.get(v).cloned())
                .collect(),
        };
        let mut unique = Vec::with_capacity(mapped.len());
        for value in mapped {
            if !value.is_empty() && !unique.contains(&value) {
                unique.push(value);
            }
        }
        Ok(unique)
    }
}

fn glob_regex(pattern: &str) -> Result<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^(?i){}$", escaped.join(".*")))
        .map_err(|e| SearchError::Config(format!("invalid wildcard pattern '{}': {}", pattern, e)))
}

/// Values of `field` on the product, falling back to its variants.
fn product_values(product: &Json, field: &str) -> Vec<String> {
    if let Some(value) = product.get(field) {
        return json_strings(value);
    }
    product
        .get("variants")
        .and_then(Json::as_array)
        .map(|variants| {
            variants
                .iter()
                .filter_map(|variant| variant.get(field))
                .flat_map(json_strings)
                .collect()
        })
        .unwrap_or_default()
}

fn json_strings(value: &Json) -> Vec<String> {
    match value {
        Json::String(s) => vec![s.clone()],
        Json::Number(n) => vec![n.to_string()],
        Json::Bool(b) => vec![b.to_string()],
        Json::Array(items) => items.iter().flat_map(json_strings).collect(),
        Json::Null | Json::Object(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clause(source: ClauseSource, source_field: &str, target: &str, mapping: Mapping, weight: f64) -> BoostClause {
        BoostClause {
            source,
            source_field: Some(source_field.to_string()),
            target_field: Some(target.parse().unwrap()),
            mapping,
            value: None,
            weight,
        }
    }

    fn weights(evaluation: Evaluation) -> Vec<(String, f64)> {
        let Evaluation::Ready(nodes) = evaluation else {
            panic!("expected fragments");
        };
        nodes
            .into_iter()
            .map(|node| match node {
                QueryNode::Predicate(p) => (p.operand.to_string(), p.weight.unwrap_or_default()),
                other => panic!("unexpected node {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_wildcard_weight_split_across_matches() {
        let rule = BoostRule {
            name: "similar colours".to_string(),
            clauses: vec![clause(
                ClauseSource::Product,
                "tags",
                "tag",
                Mapping::Wildcard {
                    pattern: "color-*".to_string(),
                },
                10.0,
            )],
        };
        let context = BoostContext {
            product: Some(json!({
                "tags": ["color-red", "color-blue", "sale", "color-green", "Color-Black", "color-white"]
            })),
            ..BoostContext::default()
        };

        let fragments = weights(rule.evaluate(&context).unwrap());
        assert_eq!(fragments.len(), 5);
        for (_, weight) in &fragments {
            assert!((weight - 2.0).abs() < f64::EPSILON);
        }
        assert_eq!(fragments[0].0, "color-red");
        let total: f64 = fragments.iter().map(|(_, w)| w).sum();
        assert!((total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_words_from_title() {
        let rule = BoostRule {
            name: "title words".to_string(),
            clauses: vec![clause(ClauseSource::Product, "title", "tag", Mapping::Words, 3.0)],
        };
        let context = BoostContext {
            product: Some(json!({"title": "Wool Socks - wool blend"})),
            ..BoostContext::default()
        };
        let fragments = weights(rule.evaluate(&context).unwrap());
        let words: Vec<_> = fragments.iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(words, vec!["wool", "socks", "blend"]);
        assert!((fragments[0].1 - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_product_field_falls_back_to_variants() {
        let rule = BoostRule {
            name: "same sku family".to_string(),
            clauses: vec![clause(ClauseSource::Product, "sku", "sku", Mapping::Identity, 1.0)],
        };
        let context = BoostContext {
            product: Some(json!({"variants": [{"sku": "A-1"}, {"sku": "A-2"}]})),
            ..BoostContext::default()
        };
        assert_eq!(weights(rule.evaluate(&context).unwrap()).len(), 2);
    }

    #[test]
    fn test_static_and_session_clauses() {
        let mut static_clause = clause(ClauseSource::Static, "vendor", "vendor", Mapping::Identity, 4.0);
        static_clause.value = Some("Acme".to_string());
        let session_clause = clause(
            ClauseSource::Session,
            "utm_campaign",
            "tag",
            Mapping::Table {
                entries: IndexMap::from([("summer".to_string(), "summer-sale".to_string())]),
            },
            2.0,
        );
        let rule = BoostRule {
            name: "campaign".to_string(),
            clauses: vec![static_clause, session_clause],
        };

        let without_param = weights(rule.evaluate(&BoostContext::default()).unwrap());
        assert_eq!(without_param, vec![("Acme".to_string(), 4.0)]);

        let mut context = BoostContext::default();
        context
            .session_params
            .insert("utm_campaign".to_string(), "summer".to_string());
        let with_param = weights(rule.evaluate(&context).unwrap());
        assert_eq!(with_param[1], ("summer-sale".to_string(), 2.0));
    }

    #[test]
    fn test_customer_tag_boosts_fixed_value() {
        let mut wholesale = clause(
            ClauseSource::Customer,
            "tags",
            "product_type",
            Mapping::Wildcard {
                pattern: "wholesale*".to_string(),
            },
            5.0,
        );
        wholesale.value = Some("Bulk".to_string());
        let rule = BoostRule {
            name: "wholesale".to_string(),
            clauses: vec![wholesale],
        };

        assert!(weights(rule.evaluate(&BoostContext::default()).unwrap()).is_empty());

        let context = BoostContext {
            customer: Some(Customer {
                tags: vec!["wholesale-eu".to_string(), "wholesale-us".to_string()],
                country: None,
            }),
            ..BoostContext::default()
        };
        assert_eq!(
            weights(rule.evaluate(&context).unwrap()),
            vec![("Bulk".to_string(), 5.0)]
        );
    }

    #[test]
    fn test_metafield_requires_fetch_then_evaluates() {
        let rule = BoostRule {
            name: "pairs with".to_string(),
            clauses: vec![clause(
                ClauseSource::Product,
                "metafield:custom.pairs_with",
                "handle",
                Mapping::Identity,
                6.0,
            )],
        };
        let reference = MetafieldRef::new("custom", "pairs_with");
        assert_eq!(rule.metafield_refs(), vec![reference.clone()]);

        let mut context = BoostContext::default();
        assert_eq!(
            rule.evaluate(&context).unwrap(),
            Evaluation::RequiresFetch(vec![reference.clone()])
        );

        context
            .metafields
            .insert(reference, json!(["belt", "scarf", "hat"]));
        let fragments = weights(rule.evaluate(&context).unwrap());
        assert_eq!(fragments.len(), 3);
        assert!((fragments[2].1 - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clause_deserializes_from_config() {
        let clause: BoostClause = toml::from_str(
            r#"
            source = "product"
            source_field = "tags"
            target_field = "option:Color"
            weight = 2.5
            mapping = { type = "wildcard", pattern = "colour-*" }
            "#,
        )
        .unwrap();
        assert_eq!(clause.target_field, Some(Field::option("Color")));
        assert_eq!(
            clause.mapping,
            Mapping::Wildcard {
                pattern: "colour-*".to_string()
            }
        );

        let bad = toml::from_str::<BoostClause>(
            r#"
            source = "product"
            target_field = "colour"
            weight = 1.0
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_values_not_fitting_target_are_skipped() {
        let rule = BoostRule {
            name: "compare at".to_string(),
            clauses: vec![clause(
                ClauseSource::Product,
                "compare_at",
                "compare_at_price",
                Mapping::Identity,
                6.0,
            )],
        };
        let context = BoostContext {
            product: Some(json!({"compare_at": ["n/a", "19.5", "42"]})),
            ..BoostContext::default()
        };
        let fragments = weights(rule.evaluate(&context).unwrap());
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|(_, w)| (w - 3.0).abs() < f64::EPSILON));

        let unusable = BoostContext {
            product: Some(json!({"compare_at": "n/a"})),
            ..BoostContext::default()
        };
        assert_eq!(rule.evaluate(&unusable).unwrap(), Evaluation::Ready(Vec::new()));
    }

    #[test]
    fn test_validate_rejects_broken_clauses() {
        let good = clause(ClauseSource::Product, "tags", "tag", Mapping::Identity, 1.0);
        assert!(good.validate().is_ok());

        let mut static_without_value = clause(ClauseSource::Static, "vendor", "vendor", Mapping::Identity, 1.0);
        static_without_value.value = None;
        let customer_city = clause(ClauseSource::Customer, "city", "tag", Mapping::Identity, 1.0);
        let mut metafield_without_target =
            clause(ClauseSource::Product, "metafield:custom.pairs", "handle", Mapping::Identity, 1.0);
        metafield_without_target.target_field = None;
        let mut no_source = clause(ClauseSource::Session, "utm", "tag", Mapping::Identity, 1.0);
        no_source.source_field = None;
        let bad_weight = clause(ClauseSource::Product, "tags", "tag", Mapping::Identity, f64::NAN);

        for broken in [
            static_without_value,
            customer_city,
            metafield_without_target,
            no_source,
            bad_weight,
        ] {
            let rule = BoostRule {
                name: "broken".to_string(),
                clauses: vec![good.clone(), broken],
            };
            let err = rule.validate().unwrap_err();
            assert!(
                matches!(&err, SearchError::Config(msg) if msg.starts_with("boost rule 'broken' clause 2")),
                "{:?}",
                err
            );
        }
    }
}
