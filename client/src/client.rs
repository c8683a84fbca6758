//! The search client: reactive state, facets and boost rules feeding one
//! coalesced request at a time through the dispatcher.
//!
//! Every public operation is a guarded block. Its mutations land on
//! [`SearchState`] fields or the facet model, whose listeners count them on
//! the [`QueryGuard`]; when the outermost block closes the guard issues one
//! request for the final state. Changing the search text, collection, sort or
//! facet selection moves back to page 1 inside the same block.

use crate::boost::{BoostContext, BoostRule, Customer, Evaluation, MetafieldRef};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, ReqwestTransport};
use crate::error::{Result, SearchError};
use crate::facet::FacetModel;
use crate::facet::FacetSpec;
use crate::fallback::StorefrontFallback;
use crate::guard::QueryGuard;
use crate::query::{
    parse_filter, Attributes, Field, Query, QueryNode, QueryRequest, SortOrder, MAX_ROWS,
};
use crate::reactive::{ReactiveField, ReactiveList};
use crate::response::SearchResponse;
use crate::session::Session;
use crate::state::SearchState;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use tracing::{debug, warn};

/// Looks up metafield values boost rules depend on.
#[async_trait]
pub trait MetafieldSource: Send + Sync {
    /// `Ok(None)` when the metafield is not set.
    async fn fetch(&self, reference: &MetafieldRef) -> Result<Option<Json>>;
}

/// One state change applied inside a guarded block.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Search(Option<String>),
    Collection(Option<String>),
    SortBy(Option<SortOrder>),
    Page(u32),
    Paginate(u32),
    ToggleFacetValue { field: Field, value: String },
    SelectRange { field: Field, min: f64, max: f64 },
    ClearFacet(Field),
    ClearAllFacets,
}

type Guard = QueryGuard<SearchResponse>;

pub struct SearchClient {
    state: Rc<SearchState>,
    facets: RefCell<FacetModel>,
    /// Bumped on every facet selection change.
    facet_selection: ReactiveField<u64>,
    /// Bumped when a response changes facet counts or range edges.
    facet_counts: ReactiveField<u64>,
    results: ReactiveField<Option<SearchResponse>>,
    recent_searches: ReactiveList<String>,
    defaults: Attributes,
    base_filters: Vec<QueryNode>,
    boost_rules: Vec<BoostRule>,
    boost_context: RefCell<BoostContext>,
    metafield_source: Option<Box<dyn MetafieldSource>>,
    guard: Rc<Guard>,
    dispatcher: Dispatcher,
}

impl SearchClient {
    /// `defaults` seeds the state fields it covers and sits underneath every request.
    pub fn new(dispatcher: Dispatcher, facets: &[FacetSpec], defaults: Attributes) -> Self {
        let state = Rc::new(SearchState::new());
        if let Some(rows) = defaults.rows {
            state.rows().set(rows);
        }
        state.locale().set(defaults.locale.clone());
        state.currency().set(defaults.currency.clone());
        state.split().set(defaults.split.clone());
        state.all_variants().set(defaults.all_variants);

        let recent_searches = ReactiveList::new();
        recent_searches.set_all(dispatcher.session().recent_searches());

        let client = Self {
            state,
            facets: RefCell::new(FacetModel::new(facets)),
            facet_selection: ReactiveField::new(0),
            facet_counts: ReactiveField::new(0),
            results: ReactiveField::new(None),
            recent_searches,
            defaults,
            base_filters: Vec::new(),
            boost_rules: Vec::new(),
            boost_context: RefCell::new(BoostContext::default()),
            metafield_source: None,
            guard: Rc::new(QueryGuard::new()),
            dispatcher,
        };
        client.wire();
        client
    }

    /// Build the client a configuration file describes, with its HTTP
    /// transport, session store and optional storefront fallback.
    pub fn from_config(config: &Config) -> Result<Self> {
        let session = Rc::new(Session::open(&config.session)?);

        let transport = ReqwestTransport::new(config.service.timeout())?;
        let mut dispatcher = Dispatcher::new(Box::new(transport), config.service.clone(), session);
        if config.degraded_mode.enabled {
            if let Some(url) = &config.degraded_mode.storefront_url {
                let fallback = StorefrontFallback::new(url, config.service.timeout())?;
                dispatcher = dispatcher.with_fallback(Box::new(fallback), config.degraded_mode.window());
            }
        }

        let mut base_filters = Vec::new();
        for filter in &config.defaults.filters {
            base_filters.extend(parse_filter(filter)?);
        }

        Ok(Self::new(dispatcher, &config.facets, config.defaults.to_attributes())
            .with_base_filters(base_filters)
            .with_boost_rules(config.boost_rules.clone()))
    }

    /// Add filters applied to every request ahead of the facet slots.
    pub fn with_base_filters(mut self, filters: Vec<QueryNode>) -> Self {
        self.base_filters.extend(filters);
        self
    }

    pub fn with_boost_rules(mut self, rules: Vec<BoostRule>) -> Self {
        self.boost_rules = rules;
        self
    }

    pub fn with_metafield_source(mut self, source: Box<dyn MetafieldSource>) -> Self {
        self.metafield_source = Some(source);
        self
    }

    fn wire(&self) {
        let state = &self.state;
        resets_page(state.search(), &self.guard, state);
        resets_page(state.collection(), &self.guard, state);
        resets_page(state.sort(), &self.guard, state);
        resets_page(&self.facet_selection, &self.guard, state);
        triggers(state.page(), &self.guard);
        triggers(state.rows(), &self.guard);
        triggers(state.split(), &self.guard);
        triggers(state.locale(), &self.guard);
        triggers(state.currency(), &self.guard);
        triggers(state.all_variants(), &self.guard);
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn facets(&self) -> Ref<'_, FacetModel> {
        self.facets.borrow()
    }

    pub fn facet_selection(&self) -> &ReactiveField<u64> {
        &self.facet_selection
    }

    pub fn facet_counts(&self) -> &ReactiveField<u64> {
        &self.facet_counts
    }

    /// The most recent response, published after facets are reconciled.
    pub fn results(&self) -> &ReactiveField<Option<SearchResponse>> {
        &self.results
    }

    pub fn recent_searches(&self) -> &ReactiveList<String> {
        &self.recent_searches
    }

    pub fn session(&self) -> &Rc<Session> {
        self.dispatcher.session()
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn set_product(&self, product: Option<Json>) {
        self.boost_context.borrow_mut().product = product;
    }

    pub fn set_customer(&self, customer: Option<Customer>) {
        self.boost_context.borrow_mut().customer = customer;
    }

    pub fn set_session_param(&self, key: impl Into<String>, value: impl Into<String>) {
        self.boost_context
            .borrow_mut()
            .session_params
            .insert(key.into(), value.into());
    }

    /// Apply `mutations` as one block and issue at most one request for the result.
    ///
    /// Returns `Ok(None)` when nothing needed a request, or when an enclosing
    /// block is still open and will issue it instead.
    /// Every mutation is checked before any is applied, so a rejected batch
    /// leaves the state untouched.
    pub async fn batch(&self, mutations: Vec<Mutation>) -> Result<Option<SearchResponse>> {
        self.check(&mutations)?;
        self.guard
            .run(
                || {
                    for mutation in mutations {
                        self.apply(mutation)?;
                    }
                    Ok(())
                },
                || self.execute(),
            )
            .await
    }

    pub async fn search(&self, text: impl Into<String>) -> Result<Option<SearchResponse>> {
        let text = text.into();
        let text = (!text.trim().is_empty()).then_some(text);
        self.batch(vec![Mutation::Search(text)]).await
    }

    pub async fn collection(&self, handle: Option<String>) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::Collection(handle)]).await
    }

    pub async fn sort_by(&self, order: Option<SortOrder>) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::SortBy(order)]).await
    }

    pub async fn page(&self, page: u32) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::Page(page)]).await
    }

    pub async fn paginate(&self, rows: u32) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::Paginate(rows)]).await
    }

    pub async fn toggle_facet_value(&self, field: &Field, value: &str) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::ToggleFacetValue {
            field: field.clone(),
            value: value.to_string(),
        }])
        .await
    }

    pub async fn select_range(&self, field: &Field, min: f64, max: f64) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::SelectRange {
            field: field.clone(),
            min,
            max,
        }])
        .await
    }

    pub async fn clear_facet(&self, field: &Field) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::ClearFacet(field.clone())]).await
    }

    pub async fn clear_all_facets(&self) -> Result<Option<SearchResponse>> {
        self.batch(vec![Mutation::ClearAllFacets]).await
    }

    /// Re-issue the current state even though nothing changed.
    pub async fn refresh(&self) -> Result<Option<SearchResponse>> {
        self.guard
            .run(
                || {
                    self.guard.trigger();
                    Ok(())
                },
                || self.execute(),
            )
            .await
    }

    /// Issue a request for changes made directly on the state fields.
    pub async fn flush(&self) -> Result<Option<SearchResponse>> {
        if self.guard.is_collecting() {
            return Ok(None);
        }
        self.guard.settle(|| self.execute()).await.transpose()
    }

    /// The request the current state would send, without sending it. Boost
    /// rules still waiting on metafields are left out.
    pub fn compose(&self) -> Result<QueryRequest> {
        let mut boosts = Vec::new();
        for rule in &self.boost_rules {
            match rule.evaluate(&self.boost_context.borrow())? {
                Evaluation::Ready(fragments) => boosts.extend(fragments),
                Evaluation::RequiresFetch(missing) => {
                    debug!(rule = %rule.name, missing = missing.len(), "Boost rule needs metafields")
                }
            }
        }
        self.compose_with(boosts)
    }

    /// Dry-run `mutations` against a copy of the facet model.
    fn check(&self, mutations: &[Mutation]) -> Result<()> {
        let mut trial = self.facets.borrow().clone();
        for mutation in mutations {
            match mutation {
                Mutation::Paginate(rows) if *rows > MAX_ROWS => {
                    return Err(SearchError::invalid_query(format!(
                        "rows must be at most {}, got {}",
                        MAX_ROWS, rows
                    )));
                }
                Mutation::ToggleFacetValue { field, value } => {
                    trial.toggle(field, value)?;
                }
                Mutation::SelectRange { field, min, max } => {
                    trial.select_range(field, *min, *max)?;
                }
                Mutation::ClearFacet(field) => {
                    trial.clear_facet(field)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply(&self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Search(text) => self.state.search().set(text),
            Mutation::Collection(handle) => self.state.collection().set(handle),
            Mutation::SortBy(order) => self.state.sort().set(order),
            Mutation::Page(page) => self.state.page().set(page),
            Mutation::Paginate(rows) => self.state.rows().set(rows),
            Mutation::ToggleFacetValue { field, value } => {
                self.facets.borrow_mut().toggle(&field, &value)?;
                self.bump(&self.facet_selection);
            }
            Mutation::SelectRange { field, min, max } => {
                self.facets.borrow_mut().select_range(&field, min, max)?;
                self.bump(&self.facet_selection);
            }
            Mutation::ClearFacet(field) => {
                let cleared = self.facets.borrow_mut().clear_facet(&field)?;
                if cleared {
                    self.bump(&self.facet_selection);
                }
            }
            Mutation::ClearAllFacets => {
                let cleared = self.facets.borrow_mut().clear_all();
                if cleared {
                    self.bump(&self.facet_selection);
                }
            }
        }
        Ok(())
    }

    fn bump(&self, revision: &ReactiveField<u64>) {
        revision.set(revision.get().wrapping_add(1));
    }

    fn compose_with(&self, boosts: Vec<QueryNode>) -> Result<QueryRequest> {
        let attributes = self
            .defaults
            .clone()
            .merge(self.session().default_attributes())
            .merge(self.state.snapshot().to_attributes());
        let composition = self.facets.borrow().compose(attributes.locale.as_deref())?;

        let mut query = Query::new().with_defaults(&attributes);
        for filter in &self.base_filters {
            query = query.node(filter.clone());
        }
        if let Some(slots) = composition.facets {
            query = query.node(slots);
        }
        if let Some(ranges) = composition.boundaries {
            query = query.node(ranges);
        }
        if !composition.options.is_empty() {
            query = query.options(composition.options).option_disjunctive(true);
        }
        for boost in boosts {
            query = query.boost_node(boost);
        }
        query.build()
    }

    async fn execute(&self) -> Result<SearchResponse> {
        let boosts = self.resolve_boosts().await?;
        let request = self.compose_with(boosts)?;
        let response = self.dispatcher.dispatch(&request).await?;
        self.absorb(&request, &response);
        Ok(response)
    }

    async fn resolve_boosts(&self) -> Result<Vec<QueryNode>> {
        let mut boosts = Vec::new();
        for rule in &self.boost_rules {
            let mut evaluation = rule.evaluate(&self.boost_context.borrow())?;
            if let Evaluation::RequiresFetch(missing) = &evaluation {
                let missing = missing.clone();
                self.fetch_metafields(&missing).await?;
                evaluation = rule.evaluate(&self.boost_context.borrow())?;
            }
            match evaluation {
                Evaluation::Ready(fragments) => boosts.extend(fragments),
                Evaluation::RequiresFetch(missing) => {
                    warn!(rule = %rule.name, missing = missing.len(), "Skipping boost rule, metafields unavailable")
                }
            }
        }
        Ok(boosts)
    }

    /// Fetch and cache metafields. Absent ones are cached as `null` so they
    /// are only asked for once.
    async fn fetch_metafields(&self, references: &[MetafieldRef]) -> Result<()> {
        for reference in references {
            if self.boost_context.borrow().metafields.contains_key(reference) {
                continue;
            }
            let value = match &self.metafield_source {
                Some(source) => {
                    debug!(metafield = %reference, "Fetching metafield for boost rule");
                    source.fetch(reference).await?.unwrap_or(Json::Null)
                }
                None => Json::Null,
            };
            self.boost_context
                .borrow_mut()
                .metafields
                .insert(reference.clone(), value);
        }
        Ok(())
    }

    fn absorb(&self, request: &QueryRequest, response: &SearchResponse) {
        let changed = self.facets.borrow_mut().reconcile(
            request.attributes.locale.as_deref(),
            &response.options,
            &response.boundaries,
        );
        if changed {
            self.bump(&self.facet_counts);
        }

        if let Some(term) = &request.attributes.search {
            match self.session().record_search(term) {
                Ok(()) => self.recent_searches.set_all(self.session().recent_searches()),
                Err(e) => warn!("Failed to record search: {}", e),
            }
        }
        self.results.set(Some(response.clone()));
    }
}

fn triggers<T: Clone + 'static>(field: &ReactiveField<T>, guard: &Rc<Guard>) {
    let guard = guard.clone();
    field.listen(move |_| guard.trigger());
}

fn resets_page<T: Clone + 'static>(field: &ReactiveField<T>, guard: &Rc<Guard>, state: &Rc<SearchState>) {
    let guard = guard.clone();
    let state = Rc::downgrade(state);
    field.listen(move |_| {
        guard.trigger();
        if let Some(state) = state.upgrade() {
            if state.page().get() != 1 {
                state.page().set(1);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::dispatcher::{HttpRequest, HttpResponse, Transport, TransportError};
    use crate::facet::Selection;
    use crate::query::{Operator, Predicate, SortDirection, Value};
    use crate::store::{KeyValueStore, MemoryStore};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const BODY: &str = r#"{
        "products": [{"id": 1}],
        "count": 1,
        "options": [{"Acme": 4, "Globex": 2}, {"Red": 1}],
        "boundaries": [[5.0, 80.0]]
    }"#;

    /// Answers every request with the same body after yielding once.
    struct FakeService {
        body: String,
        sent: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl Transport for Arc<FakeService> {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());
            tokio::task::yield_now().await;
            Ok(HttpResponse {
                status: 200,
                headers: HashMap::new(),
                body: self.body.clone(),
            })
        }
    }

    impl FakeService {
        fn requests(&self) -> Vec<QueryRequest> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|r| QueryRequest::decode(r.body.as_deref().unwrap()).unwrap())
                .collect()
        }
    }

    struct CountingMetafields {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MetafieldSource for Arc<CountingMetafields> {
        async fn fetch(&self, reference: &MetafieldRef) -> Result<Option<Json>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            assert_eq!(reference.to_string(), "custom.style");
            Ok(Some(json!("boho")))
        }
    }

    fn field(name: &str) -> Field {
        Field::named(name).unwrap()
    }

    fn specs() -> Vec<FacetSpec> {
        vec![
            FacetSpec::Option {
                field: field("vendor"),
                label: None,
                locale: None,
                selection: Selection::Multi,
                values: Vec::new(),
            },
            FacetSpec::Option {
                field: Field::option("Color"),
                label: None,
                locale: None,
                selection: Selection::Single,
                values: Vec::new(),
            },
            FacetSpec::Boundary {
                field: field("price"),
                label: None,
                locale: None,
            },
        ]
    }

    fn client() -> (SearchClient, Arc<FakeService>) {
        let service = Arc::new(FakeService {
            body: BODY.to_string(),
            sent: Mutex::new(Vec::new()),
        });
        let store: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        let session = Rc::new(Session::load(store, None).unwrap());
        let config = ServiceConfig {
            hosts: vec!["https://a.example".to_string()],
            retry_delay_ms: 0,
            force_post: true,
            ..ServiceConfig::default()
        };
        let dispatcher = Dispatcher::new(Box::new(service.clone()), config, session);
        (SearchClient::new(dispatcher, &specs(), Attributes::default()), service)
    }

    fn facet_slots(request: &QueryRequest) -> Vec<QueryNode> {
        request
            .query
            .iter()
            .find_map(|node| match node {
                QueryNode::Facets(slots) => Some(slots.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_batch_issues_single_request() {
        let (client, service) = client();
        let response = client
            .batch(vec![
                Mutation::ToggleFacetValue {
                    field: field("vendor"),
                    value: "Acme".to_string(),
                },
                Mutation::SortBy(Some(SortOrder::new("price", SortDirection::Asc, "Price"))),
                Mutation::Paginate(48),
                Mutation::Page(2),
            ])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.total(), 1);
        assert_eq!(service.requests().len(), 1);
        assert_eq!(client.guard().requests_issued(), 1);

        let request = &service.requests()[0];
        assert_eq!(request.attributes.rows, Some(48));
        assert_eq!(request.attributes.page, Some(2));
        assert_eq!(request.attributes.sort.as_ref().unwrap().id(), "price-asc");
        assert_eq!(request.attributes.option_disjunctive, Some(true));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let (client, service) = client();
        assert_eq!(client.batch(Vec::new()).await.unwrap(), None);
        assert_eq!(client.flush().await.unwrap(), None);
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn test_filter_change_resets_page() {
        let (client, service) = client();
        client.page(3).await.unwrap();
        client.toggle_facet_value(&field("vendor"), "Acme").await.unwrap();
        client.page(2).await.unwrap();
        client.search("socks").await.unwrap();

        let pages: Vec<_> = service
            .requests()
            .iter()
            .map(|r| r.attributes.page)
            .collect();
        assert_eq!(pages, vec![Some(3), Some(1), Some(2), Some(1)]);
    }

    #[tokio::test]
    async fn test_facet_slots_stay_positional() {
        let (client, service) = client();
        client.toggle_facet_value(&field("vendor"), "Acme").await.unwrap();
        client.toggle_facet_value(&field("vendor"), "Acme").await.unwrap();
        client.toggle_facet_value(&Field::option("Color"), "Red").await.unwrap();

        let requests = service.requests();
        let acme = QueryNode::Predicate(
            Predicate::new(field("vendor"), Operator::Eq, Value::from("Acme")).unwrap(),
        );
        let red = QueryNode::Predicate(
            Predicate::new(Field::option("Color"), Operator::Eq, Value::from("Red")).unwrap(),
        );
        assert_eq!(facet_slots(&requests[0]), vec![QueryNode::Or(vec![acme]), QueryNode::empty_or()]);
        assert_eq!(facet_slots(&requests[1]), vec![QueryNode::empty_or(), QueryNode::empty_or()]);
        assert_eq!(facet_slots(&requests[2]), vec![QueryNode::empty_or(), QueryNode::Or(vec![red])]);
        for request in &requests {
            assert_eq!(
                request.attributes.options,
                Some(vec![field("vendor"), Field::option("Color")])
            );
        }
    }

    #[tokio::test]
    async fn test_response_counts_reconciled_and_published() {
        let (client, _service) = client();
        let counts_seen = Rc::new(RefCell::new(Vec::new()));
        let seen = counts_seen.clone();
        client.facet_counts().listen(move |revision| seen.borrow_mut().push(*revision));

        client.toggle_facet_value(&field("vendor"), "Acme").await.unwrap();

        let facets = client.facets();
        let vendor = facets.facet(&field("vendor")).unwrap();
        assert_eq!(vendor.value("Acme").unwrap().count, Some(4));
        assert_eq!(vendor.value("Globex").unwrap().count, Some(2));
        assert_eq!(facets.facet(&field("price")).unwrap().bounds(), Some((5.0, 80.0)));
        assert_eq!(*counts_seen.borrow(), vec![1]);
        assert!(client.results().with(|r| r.is_some()));
    }

    #[tokio::test]
    async fn test_mutation_during_flight_is_coalesced() {
        let (client, service) = client();
        let vendor = field("vendor");
        let (first, second) = tokio::join!(
            client.search("socks"),
            client.toggle_facet_value(&vendor, "Acme")
        );

        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();
        assert_eq!(first, second);

        let requests = service.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(facet_slots(&requests[1])[0].children().len(), 1);
        assert_eq!(requests[1].attributes.search.as_deref(), Some("socks"));
    }

    #[tokio::test]
    async fn test_invalid_facet_mutation_sends_nothing() {
        let (client, service) = client();
        let err = client
            .toggle_facet_value(&field("title"), "anything")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no facet configured"));
        assert!(client.select_range(&field("price"), 10.0, 1.0).await.is_err());
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_state_untouched() {
        let (client, service) = client();
        let err = client
            .batch(vec![
                Mutation::Search(Some("socks".to_string())),
                Mutation::ToggleFacetValue {
                    field: field("vendor"),
                    value: "Acme".to_string(),
                },
                Mutation::ToggleFacetValue {
                    field: field("title"),
                    value: "x".to_string(),
                },
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no facet configured"));
        assert_eq!(client.state().search().get(), None);
        assert!(!client.facets().is_active());
        assert_eq!(client.guard().pending(), 0);

        let err = client
            .batch(vec![Mutation::Page(3), Mutation::Paginate(MAX_ROWS + 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidQuery(_)));
        assert_eq!(client.state().page().get(), 1);
        assert_eq!(client.guard().pending(), 0);

        client.search("boots").await.unwrap();
        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert!(facet_slots(&requests[0])[0].children().is_empty());
    }

    #[tokio::test]
    async fn test_boost_metafield_fetched_once() {
        let (client, service) = client();
        let metafields = Arc::new(CountingMetafields {
            fetches: AtomicUsize::new(0),
        });
        let rules: Vec<BoostRule> = toml::from_str::<HashMap<String, Vec<BoostRule>>>(
            r#"
[[rules]]
name = "same style"

[[rules.clauses]]
source = "product"
source_field = "metafield:custom.style"
target_field = "tag"
weight = 2.0
"#,
        )
        .unwrap()
        .remove("rules")
        .unwrap();
        let client = client
            .with_boost_rules(rules)
            .with_metafield_source(Box::new(metafields.clone()));
        client.set_product(Some(json!({"id": 1})));

        assert!(client.compose().unwrap().attributes.boosts.is_empty());
        client.refresh().await.unwrap();
        client.refresh().await.unwrap();

        assert_eq!(metafields.fetches.load(Ordering::SeqCst), 1);
        let requests = service.requests();
        assert_eq!(requests.len(), 2);
        let boost = Predicate::new(field("tag"), Operator::Eq, Value::from("boho"))
            .unwrap()
            .weighted(2.0);
        assert_eq!(requests[1].attributes.boosts, vec![QueryNode::Predicate(boost)]);
        assert_eq!(client.compose().unwrap().attributes.boosts.len(), 1);
    }

    #[tokio::test]
    async fn test_searches_recorded_in_session() {
        let (client, _service) = client();
        client.search("Socks").await.unwrap();
        client.search("boots").await.unwrap();
        client.search("socks").await.unwrap();
        client.search("   ").await.unwrap();

        assert_eq!(client.recent_searches().items(), vec!["socks", "boots"]);
        assert_eq!(client.session().recent_searches(), vec!["socks", "boots"]);
    }

    #[tokio::test]
    async fn test_direct_state_changes_wait_for_flush() {
        let (client, service) = client();
        client.state().collection().set(Some("shoes".to_string()));
        client.state().rows().set(12);
        assert_eq!(client.guard().pending(), 2);
        assert!(service.requests().is_empty());

        client.flush().await.unwrap();
        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].attributes.collection.as_deref(), Some("shoes"));
        assert_eq!(requests[0].attributes.rows, Some(12));
    }
}
