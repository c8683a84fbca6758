//! Expression-tree types for catalog queries and their JSON wire encoding.

use crate::error::{Result, SearchError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as Json};
use std::str::FromStr;

pub const QUANTITATIVE_FIELDS: &[&str] = &[
    "id",
    "price",
    "grams",
    "compare_at_price",
    "inventory_quantity",
    "priority",
];

pub const QUALITATIVE_FIELDS: &[&str] = &[
    "handle",
    "title",
    "option1",
    "option2",
    "option3",
    "product_type",
    "vendor",
    "tag",
    "tags",
    "sku",
];

pub const BOOLEAN_FIELDS: &[&str] = &["available"];

const OPTION_KEY: &str = "option";
const PRODUCT_METAFIELD_KEY: &str = "product-metafield";
const VARIANT_METAFIELD_KEY: &str = "variant-metafield";
const PRODUCT_CUSTOM_FIELD_KEY: &str = "product-custom-field";
const VARIANT_CUSTOM_FIELD_KEY: &str = "variant-custom-field";
const WEIGHT_KEY: &str = "weight";

/// Comparison operators understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Ne,
    Prefix,
    In,
    NotIn,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Prefix => "^",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }

    /// `in` and `not_in` take a list operand, everything else a scalar.
    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl FromStr for Operator {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Lte),
            ">=" => Ok(Operator::Gte),
            "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            "^" => Ok(Operator::Prefix),
            "in" => Ok(Operator::In),
            "not_in" => Ok(Operator::NotIn),
            _ => Err(SearchError::invalid_query(format!("unknown operator '{}'", s))),
        }
    }
}

/// Which operator set and operand type a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Quantitative,
    Qualitative,
    Boolean,
    /// Metafields and custom fields: typed by the merchant, so anything goes.
    Any,
}

impl FieldKind {
    pub fn allows(&self, operator: Operator) -> bool {
        use Operator::*;
        match self {
            FieldKind::Quantitative => matches!(operator, Lt | Gt | Lte | Gte | Eq | Ne | In | NotIn),
            FieldKind::Qualitative => matches!(operator, Eq | Ne | Prefix | In | NotIn),
            FieldKind::Boolean => matches!(operator, Eq | Ne),
            FieldKind::Any => true,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldKind::Quantitative, Value::Integer(_) | Value::Number(_)) => true,
            (FieldKind::Qualitative, Value::String(_)) => true,
            (FieldKind::Boolean, Value::Boolean(_)) => true,
            (FieldKind::Any, Value::List(_)) => false,
            (FieldKind::Any, _) => true,
            _ => false,
        }
    }
}

/// A queryable field, either from the fixed vocabulary or qualified by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Named(String),
    Option(String),
    ProductMetafield { namespace: String, key: String },
    VariantMetafield { namespace: String, key: String },
    ProductCustomField(String),
    VariantCustomField(String),
}

impl Field {
    /// A field from the fixed vocabulary. Unknown names are rejected.
    pub fn named(name: &str) -> Result<Self> {
        if field_kind_of(name).is_some() {
            Ok(Field::Named(name.to_string()))
        } else {
            Err(SearchError::invalid_query(format!("unknown field '{}'", name)))
        }
    }

    pub fn option(name: impl Into<String>) -> Self {
        Field::Option(name.into())
    }

    pub fn product_metafield(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Field::ProductMetafield {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    pub fn variant_metafield(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Field::VariantMetafield {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Named(name) => field_kind_of(name).unwrap_or(FieldKind::Any),
            Field::Option(_) => FieldKind::Qualitative,
            _ => FieldKind::Any,
        }
    }

    /// Wrap an operator map in this field's qualifier levels.
    fn wrap(&self, inner: Json) -> (String, Json) {
        fn single(key: &str, value: Json) -> Json {
            let mut map = Map::new();
            map.insert(key.to_string(), value);
            Json::Object(map)
        }
        match self {
            Field::Named(name) => (name.clone(), inner),
            Field::Option(name) => (OPTION_KEY.to_string(), single(name, inner)),
            Field::ProductMetafield { namespace, key } => (
                PRODUCT_METAFIELD_KEY.to_string(),
                single(namespace, single(key, inner)),
            ),
            Field::VariantMetafield { namespace, key } => (
                VARIANT_METAFIELD_KEY.to_string(),
                single(namespace, single(key, inner)),
            ),
            Field::ProductCustomField(name) => {
                (PRODUCT_CUSTOM_FIELD_KEY.to_string(), single(name, inner))
            }
            Field::VariantCustomField(name) => {
                (VARIANT_CUSTOM_FIELD_KEY.to_string(), single(name, inner))
            }
        }
    }

    /// Identifier form used in the `options` attribute.
    pub fn to_json(&self) -> Json {
        let qualified = |qualifier: &str, inner: Json| {
            let mut map = Map::new();
            map.insert(qualifier.to_string(), inner);
            Json::Object(map)
        };
        let metafield = |qualifier: &str, namespace: &str, key: &str| {
            let mut inner = Map::new();
            inner.insert(namespace.to_string(), Json::String(key.to_string()));
            qualified(qualifier, Json::Object(inner))
        };
        match self {
            Field::Named(name) => Json::String(name.clone()),
            Field::Option(name) => qualified(OPTION_KEY, Json::String(name.clone())),
            Field::ProductCustomField(name) => {
                qualified(PRODUCT_CUSTOM_FIELD_KEY, Json::String(name.clone()))
            }
            Field::VariantCustomField(name) => {
                qualified(VARIANT_CUSTOM_FIELD_KEY, Json::String(name.clone()))
            }
            Field::ProductMetafield { namespace, key } => {
                metafield(PRODUCT_METAFIELD_KEY, namespace, key)
            }
            Field::VariantMetafield { namespace, key } => {
                metafield(VARIANT_METAFIELD_KEY, namespace, key)
            }
        }
    }

    pub fn from_json(value: &Json) -> Result<Self> {
        if let Json::String(name) = value {
            return Field::named(name);
        }
        let unrecognised = || SearchError::Decode(format!("unrecognised field identifier: {}", value));
        let (qualifier, inner) = single_entry(value).map_err(|_| unrecognised())?;
        match (qualifier.as_str(), inner) {
            (OPTION_KEY, Json::String(name)) => Ok(Field::Option(name.clone())),
            (PRODUCT_CUSTOM_FIELD_KEY, Json::String(name)) => {
                Ok(Field::ProductCustomField(name.clone()))
            }
            (VARIANT_CUSTOM_FIELD_KEY, Json::String(name)) => {
                Ok(Field::VariantCustomField(name.clone()))
            }
            (PRODUCT_METAFIELD_KEY | VARIANT_METAFIELD_KEY, ns) => {
                let (namespace, key) = single_entry(ns).map_err(|_| unrecognised())?;
                let key = key.as_str().ok_or_else(unrecognised)?;
                Ok(if qualifier == PRODUCT_METAFIELD_KEY {
                    Field::product_metafield(namespace.as_str(), key)
                } else {
                    Field::variant_metafield(namespace.as_str(), key)
                })
            }
            _ => Err(unrecognised()),
        }
    }
}

fn field_kind_of(name: &str) -> Option<FieldKind> {
    if QUANTITATIVE_FIELDS.contains(&name) {
        Some(FieldKind::Quantitative)
    } else if QUALITATIVE_FIELDS.contains(&name) {
        Some(FieldKind::Qualitative)
    } else if BOOLEAN_FIELDS.contains(&name) {
        Some(FieldKind::Boolean)
    } else {
        None
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Named(name) => write!(f, "{}", name),
            Field::Option(name) => write!(f, "{}:{}", OPTION_KEY, name),
            Field::ProductMetafield { namespace, key } => {
                write!(f, "{}:{}.{}", PRODUCT_METAFIELD_KEY, namespace, key)
            }
            Field::VariantMetafield { namespace, key } => {
                write!(f, "{}:{}.{}", VARIANT_METAFIELD_KEY, namespace, key)
            }
            Field::ProductCustomField(name) => write!(f, "{}:{}", PRODUCT_CUSTOM_FIELD_KEY, name),
            Field::VariantCustomField(name) => write!(f, "{}:{}", VARIANT_CUSTOM_FIELD_KEY, name),
        }
    }
}

/// Parses the configuration spelling: `vendor`, `option:Color`,
/// `product-metafield:ns.key`, `variant-custom-field:name`.
impl FromStr for Field {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        let Some((qualifier, rest)) = s.split_once(':') else {
            return Field::named(s.trim());
        };
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(SearchError::invalid_query(format!("missing qualifier name in '{}'", s)));
        }
        let metafield = |rest: &str| -> Result<(String, String)> {
            rest.split_once('.')
                .map(|(ns, key)| (ns.to_string(), key.to_string()))
                .ok_or_else(|| {
                    SearchError::invalid_query(format!("metafield must be 'namespace.key': '{}'", s))
                })
        };
        match qualifier.trim() {
            OPTION_KEY => Ok(Field::Option(rest.to_string())),
            PRODUCT_METAFIELD_KEY => {
                let (namespace, key) = metafield(rest)?;
                Ok(Field::ProductMetafield { namespace, key })
            }
            VARIANT_METAFIELD_KEY => {
                let (namespace, key) = metafield(rest)?;
                Ok(Field::VariantMetafield { namespace, key })
            }
            PRODUCT_CUSTOM_FIELD_KEY => Ok(Field::ProductCustomField(rest.to_string())),
            VARIANT_CUSTOM_FIELD_KEY => Ok(Field::VariantCustomField(rest.to_string())),
            other => Err(SearchError::invalid_query(format!("unknown field qualifier '{}'", other))),
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        Field::from_json(&value).map_err(D::Error::custom)
    }
}

/// Operand of a field predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn to_json(&self) -> Json {
        match self {
            Value::String(s) => Json::String(s.clone()),
            Value::Integer(i) => Json::from(*i),
            Value::Number(n) => Json::from(*n),
            Value::Boolean(b) => Json::Bool(*b),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    pub fn from_json(value: &Json) -> Result<Self> {
        match value {
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Bool(b) => Ok(Value::Boolean(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Number(f))
                } else {
                    Err(SearchError::Decode(format!("unsupported number: {}", n)))
                }
            }
            Json::Array(items) => Ok(Value::List(
                items.iter().map(Value::from_json).collect::<Result<_>>()?,
            )),
            other => Err(SearchError::Decode(format!("unsupported operand: {}", other))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// A leaf of the expression tree: `field operator operand`, optionally weighted for boosting.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: Field,
    pub operator: Operator,
    pub operand: Value,
    pub weight: Option<f64>,
}

impl Predicate {
    /// Checked constructor: operator must belong to the field's operator set and the
    /// operand must have the arity and type the operator expects.
    pub fn new(field: Field, operator: Operator, operand: Value) -> Result<Self> {
        let kind = field.kind();
        if !kind.allows(operator) {
            return Err(SearchError::invalid_query(format!(
                "operator '{}' is not valid for field '{}'",
                operator, field
            )));
        }
        match (&operand, operator.takes_list()) {
            (Value::List(items), true) => {
                if let Some(bad) = items.iter().find(|v| !kind.accepts(v)) {
                    return Err(SearchError::invalid_query(format!(
                        "operand '{}' does not fit field '{}'",
                        bad, field
                    )));
                }
            }
            (Value::List(_), false) => {
                return Err(SearchError::invalid_query(format!(
                    "operator '{}' on '{}' takes a single operand, got a list",
                    operator, field
                )));
            }
            (_, true) => {
                return Err(SearchError::invalid_query(format!(
                    "operator '{}' on '{}' takes a list operand",
                    operator, field
                )));
            }
            (scalar, false) => {
                if !kind.accepts(scalar) {
                    return Err(SearchError::invalid_query(format!(
                        "operand '{}' does not fit field '{}'",
                        scalar, field
                    )));
                }
            }
        }
        Ok(Self {
            field,
            operator,
            operand,
            weight: None,
        })
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Node of a query expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    Predicate(Predicate),
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    All(Vec<QueryNode>),
    Not(Vec<QueryNode>),
    /// Disjunctive facet slots, one per option category. Matching semantics of an `And`.
    Facets(Vec<QueryNode>),
    /// Range facet filters, composed apart from `Facets`.
    Boundaries(Vec<QueryNode>),
}

impl QueryNode {
    /// The empty disjunction: a positional placeholder for a category with no active filter.
    pub fn empty_or() -> Self {
        QueryNode::Or(Vec::new())
    }

    fn shape(&self) -> Shape<'_> {
        match self {
            QueryNode::Predicate(p) => Shape::Leaf(p),
            QueryNode::And(c) => Shape::Composite("and", c),
            QueryNode::Or(c) => Shape::Composite("or", c),
            QueryNode::All(c) => Shape::Composite("all", c),
            QueryNode::Not(c) => Shape::Composite("not", c),
            QueryNode::Facets(c) => Shape::Composite("facets", c),
            QueryNode::Boundaries(c) => Shape::Composite("boundaries", c),
        }
    }

    pub fn children(&self) -> &[QueryNode] {
        match self.shape() {
            Shape::Leaf(_) => &[],
            Shape::Composite(_, children) => children,
        }
    }

    /// Number of leaf predicates in this subtree.
    pub fn predicate_count(&self) -> usize {
        match self {
            QueryNode::Predicate(_) => 1,
            _ => self.children().iter().map(QueryNode::predicate_count).sum(),
        }
    }

    /// Apply a boost weight to every leaf in this subtree.
    pub fn with_weight(self, weight: f64) -> Self {
        let reweigh = |children: Vec<QueryNode>| -> Vec<QueryNode> {
            children.into_iter().map(|c| c.with_weight(weight)).collect()
        };
        match self {
            QueryNode::Predicate(p) => QueryNode::Predicate(p.weighted(weight)),
            QueryNode::And(c) => QueryNode::And(reweigh(c)),
            QueryNode::Or(c) => QueryNode::Or(reweigh(c)),
            QueryNode::All(c) => QueryNode::All(reweigh(c)),
            QueryNode::Not(c) => QueryNode::Not(reweigh(c)),
            QueryNode::Facets(c) => QueryNode::Facets(reweigh(c)),
            QueryNode::Boundaries(c) => QueryNode::Boundaries(reweigh(c)),
        }
    }

    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        match self.shape() {
            Shape::Leaf(p) => {
                let mut ops = Map::new();
                ops.insert(p.operator.symbol().to_string(), p.operand.to_json());
                let (key, wrapped) = p.field.wrap(Json::Object(ops));
                map.insert(key, wrapped);
                if let Some(weight) = p.weight {
                    map.insert(WEIGHT_KEY.to_string(), Json::from(weight));
                }
            }
            Shape::Composite(key, children) => {
                map.insert(
                    key.to_string(),
                    Json::Array(children.iter().map(QueryNode::to_json).collect()),
                );
            }
        }
        Json::Object(map)
    }

    pub fn from_json(value: &Json) -> Result<Self> {
        let Json::Object(map) = value else {
            return Err(SearchError::Decode(format!("query node must be an object: {}", value)));
        };
        let weight = match map.get(WEIGHT_KEY) {
            Some(w) => Some(w.as_f64().ok_or_else(|| {
                SearchError::Decode(format!("weight must be a number: {}", w))
            })?),
            None => None,
        };
        let mut entries = map.iter().filter(|(k, _)| k.as_str() != WEIGHT_KEY);
        let (key, body) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(SearchError::Decode(format!(
                    "query node must have exactly one key: {}",
                    value
                )))
            }
        };

        if let Json::Array(items) = body {
            let children = items.iter().map(QueryNode::from_json).collect::<Result<Vec<_>>>()?;
            let node = match key.as_str() {
                "and" => QueryNode::And(children),
                "or" => QueryNode::Or(children),
                "all" => QueryNode::All(children),
                "not" => QueryNode::Not(children),
                "facets" => QueryNode::Facets(children),
                "boundaries" => QueryNode::Boundaries(children),
                other => {
                    return Err(SearchError::Decode(format!("unknown composite '{}'", other)))
                }
            };
            return Ok(node);
        }

        let (field, ops) = match key.as_str() {
            OPTION_KEY => {
                let (name, ops) = single_entry(body)?;
                (Field::Option(name.clone()), ops)
            }
            PRODUCT_CUSTOM_FIELD_KEY => {
                let (name, ops) = single_entry(body)?;
                (Field::ProductCustomField(name.clone()), ops)
            }
            VARIANT_CUSTOM_FIELD_KEY => {
                let (name, ops) = single_entry(body)?;
                (Field::VariantCustomField(name.clone()), ops)
            }
            PRODUCT_METAFIELD_KEY | VARIANT_METAFIELD_KEY => {
                let (namespace, inner) = single_entry(body)?;
                let (meta_key, ops) = single_entry(inner)?;
                let field = if key == PRODUCT_METAFIELD_KEY {
                    Field::product_metafield(namespace.as_str(), meta_key.as_str())
                } else {
                    Field::variant_metafield(namespace.as_str(), meta_key.as_str())
                };
                (field, ops)
            }
            name => (Field::named(name).map_err(|e| SearchError::Decode(e.to_string()))?, body),
        };
        let (symbol, operand) = single_entry(ops)?;
        let operator: Operator = symbol.parse()?;
        let operand = Value::from_json(operand)?;
        let mut predicate = Predicate::new(field, operator, operand)?;
        predicate.weight = weight;
        Ok(QueryNode::Predicate(predicate))
    }
}

enum Shape<'a> {
    Leaf(&'a Predicate),
    Composite(&'static str, &'a [QueryNode]),
}

fn single_entry(value: &Json) -> Result<(&String, &Json)> {
    let expected = || SearchError::Decode(format!("expected a single-key object, got {}", value));
    match value {
        Json::Object(map) if map.len() == 1 => map.iter().next().ok_or_else(expected),
        _ => Err(expected()),
    }
}

impl From<Predicate> for QueryNode {
    fn from(p: Predicate) -> Self {
        QueryNode::Predicate(p)
    }
}

impl Serialize for QueryNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        QueryNode::from_json(&value).map_err(D::Error::custom)
    }
}
