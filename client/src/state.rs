//! The fixed registry of search attributes the client tracks.

use crate::query::{AllVariants, Attributes, SortOrder};
use crate::reactive::ReactiveField;

pub const DEFAULT_ROWS: u32 = 24;

/// Generates `SearchState`, one `ReactiveField` per entry with a typed
/// accessor, and a plain-value `StateSnapshot` mirroring it.
macro_rules! search_state {
    ($( $(#[$doc:meta])* $name:ident : $ty:ty = $default:expr $(=> $preset:expr)? ),* $(,)?) => {
        pub struct SearchState {
            $( $name: ReactiveField<$ty>, )*
        }

        #[derive(Debug, Clone, PartialEq)]
        pub struct StateSnapshot {
            $( pub $name: $ty, )*
        }

        impl SearchState {
            pub const FIELD_NAMES: &'static [&'static str] = &[$( stringify!($name) ),*];

            pub fn new() -> Self {
                Self {
                    $(
                        $name: {
                            let field = ReactiveField::new($default);
                            $( field.set_preset($preset); )?
                            field
                        },
                    )*
                }
            }

            $(
                $(#[$doc])*
                pub fn $name(&self) -> &ReactiveField<$ty> {
                    &self.$name
                }
            )*

            pub fn snapshot(&self) -> StateSnapshot {
                StateSnapshot {
                    $( $name: self.$name.get(), )*
                }
            }
        }
    };
}

search_state! {
    /// Free-text search; `None` browses.
    search: Option<String> = None,
    /// Collection handle the results are scoped to.
    collection: Option<String> = None,
    sort: Option<SortOrder> = None,
    /// 1-based page number.
    page: u32 = 1 => |page: u32| page.max(1),
    /// Results per page. Values above `MAX_ROWS` are kept and fail when the request is built.
    rows: u32 = DEFAULT_ROWS => |rows: u32| rows.max(1),
    split: Option<String> = None,
    locale: Option<String> = None,
    currency: Option<String> = None,
    all_variants: Option<AllVariants> = None,
}

impl Default for SearchState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SearchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

impl StateSnapshot {
    /// Request attributes for the current state. Unset optional fields stay off the wire.
    pub fn to_attributes(&self) -> Attributes {
        Attributes {
            search: self.search.clone().filter(|s| !s.trim().is_empty()),
            collection: self.collection.clone(),
            sort: self.sort.clone(),
            page: Some(self.page),
            rows: Some(self.rows),
            split: self.split.clone(),
            locale: self.locale.clone(),
            currency: self.currency.clone(),
            all_variants: self.all_variants,
            ..Attributes::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;
    use crate::query::{Query, SortDirection, MAX_ROWS};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_defaults() {
        let state = SearchState::new();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.page, 1);
        assert_eq!(snapshot.rows, DEFAULT_ROWS);
        assert_eq!(snapshot.search, None);
        assert_eq!(SearchState::FIELD_NAMES.len(), 9);
        assert_eq!(SearchState::FIELD_NAMES[0], "search");
    }

    #[test]
    fn test_presets_floor_page_and_rows() {
        let state = SearchState::new();
        state.page().set(0);
        state.rows().set(0);
        assert_eq!(state.page().get(), 1);
        assert_eq!(state.rows().get(), 1);
    }

    #[test]
    fn test_oversized_rows_rejected_when_built() {
        let state = SearchState::new();
        state.rows().set(MAX_ROWS + 1);
        assert_eq!(state.rows().get(), MAX_ROWS + 1);
        let err = Query::new()
            .with_defaults(&state.snapshot().to_attributes())
            .build()
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidQuery(_)));
    }

    #[test]
    fn test_field_listeners_are_independent() {
        let state = SearchState::new();
        let sort_changes = Rc::new(Cell::new(0));
        let c = sort_changes.clone();
        state.sort().listen(move |_| c.set(c.get() + 1));

        state.search().set(Some("socks".to_string()));
        state
            .sort()
            .set(Some(SortOrder::new("price", SortDirection::Asc, "Price")));
        assert_eq!(sort_changes.get(), 1);
    }

    #[test]
    fn test_snapshot_attributes_drop_blank_search() {
        let state = SearchState::new();
        state.search().set(Some("   ".to_string()));
        state.collection().set(Some("shoes".to_string()));
        let attributes = state.snapshot().to_attributes();
        assert_eq!(attributes.search, None);
        assert_eq!(attributes.collection.as_deref(), Some("shoes"));
        assert_eq!(attributes.page, Some(1));
        assert_eq!(attributes.rows, Some(DEFAULT_ROWS));
    }
}
