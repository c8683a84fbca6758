//! Client for a hosted catalog search service.
//!
//! Queries are composed with the [`query`] algebra, kept in sync with
//! reactive [`state`] and [`facet`] models, batched by the [`guard`] and sent
//! through the [`dispatcher`], which handles retries, host failover, the
//! service session and the optional storefront [`fallback`].

pub mod boost;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod facet;
pub mod fallback;
pub mod guard;
pub mod query;
pub mod reactive;
pub mod response;
pub mod session;
pub mod state;
pub mod store;

pub use client::{MetafieldSource, Mutation, SearchClient};
pub use config::Config;
pub use error::{Result, SearchError};
pub use query::{Field, Query, QueryNode, QueryRequest};
pub use response::SearchResponse;
