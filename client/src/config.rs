use crate::boost::BoostRule;
use crate::error::{Result, SearchError};
use crate::facet::{FacetSpec, Selection};
use crate::query::{
    AllVariants, Attributes, CountBehavior, Field, OptionBehavior, SortOrder, MAX_ROWS,
};
use crate::state::DEFAULT_ROWS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration. Facet entries are resolved into [`FacetSpec`]s while loading.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub service: ServiceConfig,
    pub session: SessionConfig,
    pub degraded_mode: DegradedModeConfig,
    pub defaults: DefaultsConfig,
    pub facets: Vec<FacetSpec>,
    pub sort_orders: Vec<SortOrder>,
    pub boost_rules: Vec<BoostRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    pub hosts: Vec<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Longest GET URL before switching to POST.
    #[serde(default = "default_max_get_length")]
    pub max_get_length: usize,
    #[serde(default)]
    pub force_post: bool,
    /// Fail requests the service answered with warnings.
    #[serde(default)]
    pub strict_warnings: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl ServiceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            path: default_path(),
            retry_delay_ms: default_retry_delay_ms(),
            max_get_length: default_max_get_length(),
            force_post: false,
            strict_warnings: false,
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionConfig {
    /// JSON file backing the session; in-memory when unset.
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            ttl_seconds: default_session_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DegradedModeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Storefront base URL whose native endpoints are used as the fallback.
    pub storefront_url: Option<String>,
    #[serde(default = "default_degraded_window")]
    pub window_seconds: u64,
}

impl DegradedModeConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl Default for DegradedModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storefront_url: None,
            window_seconds: default_degraded_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_rows")]
    pub rows: u32,
    pub locale: Option<String>,
    pub currency: Option<String>,
    pub split: Option<String>,
    pub all_variants: Option<AllVariants>,
    pub count_behavior: Option<CountBehavior>,
    pub option_behavior: Option<OptionBehavior>,
    /// Filter-language expressions applied to every request.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl DefaultsConfig {
    /// Attributes every request starts from.
    pub fn to_attributes(&self) -> Attributes {
        Attributes {
            rows: Some(self.rows),
            locale: self.locale.clone(),
            currency: self.currency.clone(),
            split: self.split.clone(),
            all_variants: self.all_variants,
            count_behavior: self.count_behavior,
            option_behavior: self.option_behavior,
            ..Attributes::default()
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            locale: None,
            currency: None,
            split: None,
            all_variants: None,
            count_behavior: None,
            option_behavior: None,
            filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawFacetKind {
    Option,
    Boundary,
}

/// A `[[facets]]` entry as written.
#[derive(Debug, Deserialize)]
struct RawFacet {
    kind: RawFacetKind,
    field: String,
    #[serde(default)]
    selection: Option<Selection>,
    locale: Option<String>,
    label: Option<String>,
    #[serde(default)]
    values: Vec<String>,
}

impl RawFacet {
    fn resolve(self) -> Result<FacetSpec> {
        let field: Field = self
            .field
            .parse()
            .map_err(|e| SearchError::Config(format!("facet '{}': {}", self.field, e)))?;
        match self.kind {
            RawFacetKind::Option => Ok(FacetSpec::Option {
                field,
                label: self.label,
                locale: self.locale,
                selection: self.selection.unwrap_or_default(),
                values: self.values,
            }),
            RawFacetKind::Boundary => {
                if self.selection.is_some() || !self.values.is_empty() {
                    return Err(SearchError::Config(format!(
                        "boundary facet '{}' takes no selection or values",
                        self.field
                    )));
                }
                Ok(FacetSpec::Boundary {
                    field,
                    label: self.label,
                    locale: self.locale,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    service: ServiceConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    degraded_mode: DegradedModeConfig,
    #[serde(default)]
    defaults: DefaultsConfig,
    #[serde(default)]
    facets: Vec<RawFacet>,
    #[serde(default)]
    sort_orders: Vec<SortOrder>,
    #[serde(default)]
    boost_rules: Vec<BoostRule>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SearchError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            SearchError::Config(msg) => {
                SearchError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;

        if raw.service.hosts.is_empty() {
            return Err(SearchError::Config("service.hosts must not be empty".to_string()));
        }
        if !raw.service.path.starts_with('/') {
            return Err(SearchError::Config(format!(
                "service.path must start with '/', got '{}'",
                raw.service.path
            )));
        }
        if raw.degraded_mode.enabled && raw.degraded_mode.storefront_url.is_none() {
            return Err(SearchError::Config(
                "degraded_mode.enabled requires degraded_mode.storefront_url".to_string(),
            ));
        }
        if raw.defaults.rows == 0 || raw.defaults.rows > MAX_ROWS {
            return Err(SearchError::Config(format!(
                "defaults.rows must be between 1 and {}, got {}",
                MAX_ROWS, raw.defaults.rows
            )));
        }
        for filter in &raw.defaults.filters {
            crate::query::parse_filter(filter)
                .map_err(|e| SearchError::Config(format!("defaults.filters '{}': {}", filter, e)))?;
        }

        for rule in &raw.boost_rules {
            rule.validate()?;
        }

        let facets = raw
            .facets
            .into_iter()
            .map(RawFacet::resolve)
            .collect::<Result<Vec<_>>>()?;
        for (i, facet) in facets.iter().enumerate() {
            if facets[..i].iter().any(|f| f.field() == facet.field()) {
                return Err(SearchError::Config(format!(
                    "facet '{}' is configured twice",
                    facet.field()
                )));
            }
        }

        Ok(Self {
            service: raw.service,
            session: raw.session,
            degraded_mode: raw.degraded_mode,
            defaults: raw.defaults,
            facets,
            sort_orders: raw.sort_orders,
            boost_rules: raw.boost_rules,
        })
    }

    /// Find a configured sort order by its `field-direction` id.
    pub fn sort_order(&self, id: &str) -> Option<&SortOrder> {
        self.sort_orders.iter().find(|order| order.id() == id)
    }
}

// Default functions
fn default_path() -> String {
    "/query".to_string()
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_max_get_length() -> usize {
    2000
}

fn default_timeout() -> u64 {
    30
}

fn default_session_ttl() -> u64 {
    1800
}

fn default_degraded_window() -> u64 {
    300
}

fn default_rows() -> u32 {
    DEFAULT_ROWS
}
