mod builder;
mod parser;
mod types;

pub use builder::{
    AllVariants, Attributes, Condition, CountBehavior, OptionBehavior, Query, QueryRequest,
    SortDirection, SortOrder, MAX_ROWS,
};
pub use parser::parse_filter;
pub(crate) use parser::typed_value;
pub use types::{
    Field, FieldKind, Operator, Predicate, QueryNode, Value, BOOLEAN_FIELDS, QUALITATIVE_FIELDS,
    QUANTITATIVE_FIELDS,
};
