//! Per-shopper session state shared by the dispatcher and the client.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::query::Attributes;
use crate::store::{now_unix, JsonFileStore, KeyValueStore, MemoryStore};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

pub const SESSION_KEY: &str = "catalog-search.session";
pub const MAX_RECENT_SEARCHES: usize = 10;

/// The persisted part of a [`Session`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Host that last answered successfully; tried first on the next request.
    #[serde(default)]
    pub successful_host: Option<String>,
    #[serde(default)]
    pub default_attributes: Attributes,
    /// Unix seconds until which the primary service is bypassed.
    #[serde(default)]
    pub degraded_until: Option<i64>,
    #[serde(default)]
    pub recent_searches: Vec<String>,
}

/// Session constructed once and handed to every component that needs it.
///
/// Each mutation writes the whole state back to the store with the configured TTL.
pub struct Session {
    store: Rc<dyn KeyValueStore>,
    ttl: Option<Duration>,
    state: RefCell<SessionState>,
}

impl Session {
    /// Restore the session from `store`, or start a fresh one.
    pub fn load(store: Rc<dyn KeyValueStore>, ttl: Option<Duration>) -> Result<Self> {
        let state = match store.get(SESSION_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => SessionState::default(),
        };
        Ok(Self {
            store,
            ttl,
            state: RefCell::new(state),
        })
    }

    /// Open the session the configuration describes: file-backed when a
    /// `store_path` is set, in-memory otherwise.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let store: Rc<dyn KeyValueStore> = match &config.store_path {
            Some(path) => Rc::new(JsonFileStore::load(path)?),
            None => Rc::new(MemoryStore::new()),
        };
        Self::load(store, config.ttl())
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.borrow().session_id.clone()
    }

    pub fn set_session_id(&self, id: &str) -> Result<()> {
        if self.state.borrow().session_id.as_deref() == Some(id) {
            return Ok(());
        }
        debug!(session_id = %id, "Captured session id");
        self.update(|state| state.session_id = Some(id.to_string()))
    }

    pub fn successful_host(&self) -> Option<String> {
        self.state.borrow().successful_host.clone()
    }

    pub fn set_successful_host(&self, host: &str) -> Result<()> {
        if self.state.borrow().successful_host.as_deref() == Some(host) {
            return Ok(());
        }
        self.update(|state| state.successful_host = Some(host.to_string()))
    }

    pub fn default_attributes(&self) -> Attributes {
        self.state.borrow().default_attributes.clone()
    }

    pub fn set_default_attributes(&self, attributes: Attributes) -> Result<()> {
        self.update(|state| state.default_attributes = attributes)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.state.borrow().degraded_until, Some(until) if until > now_unix())
    }

    pub fn degraded_until(&self) -> Option<i64> {
        self.state.borrow().degraded_until
    }

    pub fn enter_degraded(&self, window: Duration) -> Result<()> {
        let until = now_unix() + window.as_secs() as i64;
        self.update(|state| state.degraded_until = Some(until))
    }

    pub fn clear_degraded(&self) -> Result<()> {
        if self.state.borrow().degraded_until.is_none() {
            return Ok(());
        }
        self.update(|state| state.degraded_until = None)
    }

    /// Most recent first.
    pub fn recent_searches(&self) -> Vec<String> {
        self.state.borrow().recent_searches.clone()
    }

    /// Record a search term, moving an existing case-insensitive match to the front.
    pub fn record_search(&self, term: &str) -> Result<()> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(());
        }
        self.update(|state| {
            let lowered = term.to_lowercase();
            state
                .recent_searches
                .retain(|existing| existing.to_lowercase() != lowered);
            state.recent_searches.insert(0, term.to_string());
            state.recent_searches.truncate(MAX_RECENT_SEARCHES);
        })
    }

    /// Forget everything and drop the persisted entry.
    pub fn clear(&self) -> Result<()> {
        *self.state.borrow_mut() = SessionState::default();
        self.store.remove(SESSION_KEY)
    }

    fn update(&self, apply: impl FnOnce(&mut SessionState)) -> Result<()> {
        let value = {
            let mut state = self.state.borrow_mut();
            apply(&mut state);
            serde_json::to_value(&*state)?
        };
        self.store.set(SESSION_KEY, value, self.ttl)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.borrow())
            .field("ttl", &self.ttl)
            .finish()
    }
}
