use super::types::{Field, Operator, Predicate, QueryNode, Value};
use crate::error::{Result, SearchError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Upper bound the service accepts for `rows`.
pub const MAX_ROWS: u32 = 1000;

/// Operator and operand for a field predicate.
///
/// A bare value means `==`; a `(operator, value)` pair names the operator, either
/// as an [`Operator`] or by its wire symbol (`">="`, `"^"`, `"not_in"`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    operator: ConditionOp,
    operand: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum ConditionOp {
    Implicit,
    Explicit(Operator),
    Symbol(String),
}

impl Condition {
    pub fn new(operator: Operator, operand: impl Into<Value>) -> Self {
        Self {
            operator: ConditionOp::Explicit(operator),
            operand: operand.into(),
        }
    }

    pub fn eq(operand: impl Into<Value>) -> Self {
        Self {
            operator: ConditionOp::Implicit,
            operand: operand.into(),
        }
    }

    fn resolve(self) -> Result<(Operator, Value)> {
        let operator = match self.operator {
            ConditionOp::Implicit => Operator::Eq,
            ConditionOp::Explicit(op) => op,
            ConditionOp::Symbol(symbol) => symbol.parse()?,
        };
        Ok((operator, self.operand))
    }
}

macro_rules! condition_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Condition {
                fn from(operand: $t) -> Self {
                    Condition::eq(operand)
                }
            }

            impl From<(Operator, $t)> for Condition {
                fn from((operator, operand): (Operator, $t)) -> Self {
                    Condition::new(operator, operand)
                }
            }

            impl From<(&str, $t)> for Condition {
                fn from((symbol, operand): (&str, $t)) -> Self {
                    Condition {
                        operator: ConditionOp::Symbol(symbol.to_string()),
                        operand: operand.into(),
                    }
                }
            }
        )*
    };
}

condition_from!(
    &str,
    String,
    i64,
    i32,
    u32,
    f64,
    bool,
    Value,
    Vec<&str>,
    Vec<String>,
    Vec<i64>,
    Vec<i32>,
    Vec<f64>,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountBehavior {
    Approximate,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionBehavior {
    None,
    Exists,
    Approximate,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl std::fmt::Display for SortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "asc"),
            SortDirection::Desc => write!(f, "desc"),
        }
    }
}

/// Whether each variant is returned: `false`, `"flag"` (mark matching variants) or `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllVariants {
    Off,
    Flag,
    On,
}

impl Serialize for AllVariants {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AllVariants::Off => serializer.serialize_bool(false),
            AllVariants::Flag => serializer.serialize_str("flag"),
            AllVariants::On => serializer.serialize_bool(true),
        }
    }
}

impl<'de> Deserialize<'de> for AllVariants {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Bool(false) => Ok(AllVariants::Off),
            serde_json::Value::Bool(true) => Ok(AllVariants::On),
            serde_json::Value::String(s) if s == "flag" => Ok(AllVariants::Flag),
            other => Err(serde::de::Error::custom(format!(
                "allVariants must be false, \"flag\" or true, got {}",
                other
            ))),
        }
    }
}

/// A sort order. Two orders are equal when their [`SortOrder::id`] matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortOrder {
    pub field: String,
    pub direction: SortDirection,
    #[serde(rename = "name", default, skip_serializing)]
    pub display_name: String,
}

impl SortOrder {
    pub fn new(field: impl Into<String>, direction: SortDirection, display_name: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction,
            display_name: display_name.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.field, self.direction)
    }
}

impl PartialEq for SortOrder {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

/// Request attribute set. `None` fields are left off the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_behavior: Option<CountBehavior>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Field>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option_behavior: Option<OptionBehavior>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option_disjunctive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spell_check: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_variants: Option<AllVariants>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boosts: Vec<QueryNode>,
}

impl Attributes {
    /// Scalars from `other` win; boost lists concatenate.
    pub fn merge(self, other: Attributes) -> Attributes {
        let mut boosts = self.boosts;
        boosts.extend(other.boosts);
        Attributes {
            count: other.count.or(self.count),
            count_behavior: other.count_behavior.or(self.count_behavior),
            options: other.options.or(self.options),
            option_behavior: other.option_behavior.or(self.option_behavior),
            option_disjunctive: other.option_disjunctive.or(self.option_disjunctive),
            search: other.search.or(self.search),
            collection: other.collection.or(self.collection),
            sort: other.sort.or(self.sort),
            auto_correct: other.auto_correct.or(self.auto_correct),
            spell_check: other.spell_check.or(self.spell_check),
            rows: other.rows.or(self.rows),
            page: other.page.or(self.page),
            fields: other.fields.or(self.fields),
            split: other.split.or(self.split),
            all_variants: other.all_variants.or(self.all_variants),
            locale: other.locale.or(self.locale),
            currency: other.currency.or(self.currency),
            targets: other.targets.or(self.targets),
            boosts,
        }
    }
}

/// Generates one typed accessor per vocabulary field, e.g. `query.price((">=", 10))?`.
macro_rules! field_accessors {
    ($($name:ident),* $(,)?) => {
        $(
            pub fn $name(self, condition: impl Into<Condition>) -> Result<Self> {
                self.field(Field::Named(stringify!($name).to_string()), condition)
            }
        )*
    };
}

/// Immutable-style query builder. Every method consumes the query and returns the
/// extended value; node lists concatenate and scalar attributes are last-write-wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    nodes: Vec<QueryNode>,
    attributes: Attributes,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    field_accessors!(
        id,
        price,
        grams,
        compare_at_price,
        inventory_quantity,
        priority,
        handle,
        title,
        option1,
        option2,
        option3,
        product_type,
        vendor,
        tag,
        tags,
        sku,
        available,
    );

    /// Add a predicate on any field. Operator/operand mismatches fail here, before any request.
    pub fn field(mut self, field: Field, condition: impl Into<Condition>) -> Result<Self> {
        let (operator, operand) = condition.into().resolve()?;
        let predicate = Predicate::new(field, operator, operand)?;
        self.nodes.push(QueryNode::Predicate(predicate));
        Ok(self)
    }

    pub fn option(self, name: &str, condition: impl Into<Condition>) -> Result<Self> {
        self.field(Field::option(name), condition)
    }

    pub fn product_metafield(
        self,
        namespace: &str,
        key: &str,
        condition: impl Into<Condition>,
    ) -> Result<Self> {
        self.field(Field::product_metafield(namespace, key), condition)
    }

    pub fn variant_metafield(
        self,
        namespace: &str,
        key: &str,
        condition: impl Into<Condition>,
    ) -> Result<Self> {
        self.field(Field::variant_metafield(namespace, key), condition)
    }

    pub fn product_custom_field(self, name: &str, condition: impl Into<Condition>) -> Result<Self> {
        self.field(Field::ProductCustomField(name.to_string()), condition)
    }

    pub fn variant_custom_field(self, name: &str, condition: impl Into<Condition>) -> Result<Self> {
        self.field(Field::VariantCustomField(name.to_string()), condition)
    }

    pub fn node(mut self, node: QueryNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(&self) -> &[QueryNode] {
        &self.nodes
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Combine two queries: nodes and boosts concatenate, `other`'s scalar attributes win.
    pub fn merge(mut self, other: Query) -> Self {
        self.nodes.extend(other.nodes);
        self.attributes = self.attributes.merge(other.attributes);
        self
    }

    /// Collapse this query's filter nodes into a single node, if it has any.
    fn collapse(nodes: Vec<QueryNode>) -> Option<QueryNode> {
        match nodes.len() {
            0 => None,
            1 => nodes.into_iter().next(),
            _ => Some(QueryNode::And(nodes)),
        }
    }

    fn combine<I, F>(parts: I, wrap: F) -> Self
    where
        I: IntoIterator<Item = Query>,
        F: FnOnce(Vec<QueryNode>) -> QueryNode,
    {
        let mut children = Vec::new();
        let mut attributes = Attributes::default();
        for part in parts {
            attributes = attributes.merge(part.attributes);
            children.extend(Self::collapse(part.nodes));
        }
        Self {
            nodes: vec![wrap(children)],
            attributes,
        }
    }

    pub fn and<I: IntoIterator<Item = Query>>(parts: I) -> Self {
        Self::combine(parts, QueryNode::And)
    }

    /// Disjunction of the parts. With no parts this is the explicit empty `or`.
    pub fn or<I: IntoIterator<Item = Query>>(parts: I) -> Self {
        Self::combine(parts, QueryNode::Or)
    }

    pub fn all<I: IntoIterator<Item = Query>>(parts: I) -> Self {
        Self::combine(parts, QueryNode::All)
    }

    pub fn not<I: IntoIterator<Item = Query>>(parts: I) -> Self {
        Self::combine(parts, QueryNode::Not)
    }

    /// Tag fragments as disjunctive facet slots. Does not change what matches.
    pub fn facets<I: IntoIterator<Item = Query>>(parts: I) -> Self {
        Self::combine(parts, QueryNode::Facets)
    }

    pub fn boundaries<I: IntoIterator<Item = Query>>(parts: I) -> Self {
        Self::combine(parts, QueryNode::Boundaries)
    }

    /// Add `query`'s filters as boost fragments carrying `weight`.
    pub fn boost(mut self, weight: f64, query: Query) -> Self {
        self.attributes
            .boosts
            .extend(query.nodes.into_iter().map(|n| n.with_weight(weight)));
        self.attributes.boosts.extend(query.attributes.boosts);
        self
    }

    /// Add an already-weighted boost fragment.
    pub fn boost_node(mut self, node: QueryNode) -> Self {
        self.attributes.boosts.push(node);
        self
    }

    pub fn count(mut self, count: bool) -> Self {
        self.attributes.count = Some(count);
        self
    }

    pub fn count_behavior(mut self, behavior: CountBehavior) -> Self {
        self.attributes.count_behavior = Some(behavior);
        self
    }

    pub fn options(mut self, fields: Vec<Field>) -> Self {
        self.attributes.options = Some(fields);
        self
    }

    pub fn option_behavior(mut self, behavior: OptionBehavior) -> Self {
        self.attributes.option_behavior = Some(behavior);
        self
    }

    pub fn option_disjunctive(mut self, disjunctive: bool) -> Self {
        self.attributes.option_disjunctive = Some(disjunctive);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.attributes.search = Some(text.into());
        self
    }

    pub fn collection(mut self, handle: impl Into<String>) -> Self {
        self.attributes.collection = Some(handle.into());
        self
    }

    pub fn sort(mut self, order: SortOrder) -> Self {
        self.attributes.sort = Some(order);
        self
    }

    pub fn auto_correct(mut self, enabled: bool) -> Self {
        self.attributes.auto_correct = Some(enabled);
        self
    }

    pub fn spell_check(mut self, enabled: bool) -> Self {
        self.attributes.spell_check = Some(enabled);
        self
    }

    /// Page size. Values above [`MAX_ROWS`] are rejected by [`Query::build`].
    pub fn paginate(mut self, rows: u32) -> Self {
        self.attributes.rows = Some(rows);
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.attributes.page = Some(page);
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.attributes.fields = Some(fields);
        self
    }

    pub fn split(mut self, split: impl Into<String>) -> Self {
        self.attributes.split = Some(split.into());
        self
    }

    pub fn all_variants(mut self, mode: AllVariants) -> Self {
        self.attributes.all_variants = Some(mode);
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.attributes.locale = Some(locale.into());
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.attributes.currency = Some(currency.into());
        self
    }

    pub fn targets(mut self, targets: Vec<String>) -> Self {
        self.attributes.targets = Some(targets);
        self
    }

    /// Merge attribute defaults underneath this query's own attributes.
    pub fn with_defaults(mut self, defaults: &Attributes) -> Self {
        self.attributes = defaults.clone().merge(self.attributes);
        self
    }

    /// Validate limits and freeze into a request.
    pub fn build(self) -> Result<QueryRequest> {
        if let Some(rows) = self.attributes.rows {
            if rows > MAX_ROWS {
                return Err(SearchError::invalid_query(format!(
                    "rows must be at most {}, got {}",
                    MAX_ROWS, rows
                )));
            }
        }
        if self.attributes.page == Some(0) {
            return Err(SearchError::invalid_query("page numbers start at 1"));
        }
        Ok(QueryRequest {
            query: self.nodes,
            attributes: self.attributes,
        })
    }
}

/// A composed request, built fresh for every dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: Vec<QueryNode>,
    pub attributes: Attributes,
}

impl QueryRequest {
    pub fn predicate_count(&self) -> usize {
        self.query.iter().map(QueryNode::predicate_count).sum()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
