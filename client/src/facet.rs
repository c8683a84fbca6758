//! Facets, their values, and the disjunctive count protocol.
//!
//! Every option facet owns one positional slot in the `facets` node of each
//! request, in configuration order, whether or not it filters anything. The
//! service strips slot `i` when counting values for facet `i`, so the counts
//! returned in `options[i]` describe "every other active filter applied".
//! Boundary facets are composed apart, into the `boundaries` node.

use crate::error::{Result, SearchError};
use crate::query::{typed_value, Field, Operator, Predicate, QueryNode, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetKind {
    Option,
    Boundary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    Single,
    #[default]
    Multi,
}

/// A facet definition, resolved once when configuration is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum FacetSpec {
    Option {
        field: Field,
        label: Option<String>,
        locale: Option<String>,
        selection: Selection,
        /// Values known before the first response arrives.
        values: Vec<String>,
    },
    Boundary {
        field: Field,
        label: Option<String>,
        locale: Option<String>,
    },
}

impl FacetSpec {
    pub fn field(&self) -> &Field {
        match self {
            FacetSpec::Option { field, .. } | FacetSpec::Boundary { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetValue {
    pub name: String,
    pub raw_value: String,
    pub enabled: bool,
    /// `None` until a response has counted this value.
    pub count: Option<u64>,
}

impl FacetValue {
    fn new(raw_value: &str) -> Self {
        Self {
            name: raw_value.to_string(),
            raw_value: raw_value.to_string(),
            enabled: false,
            count: None,
        }
    }

    /// A value whose last count dropped to zero. It stays listed.
    pub fn is_inactive(&self) -> bool {
        self.count == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Facet {
    field: Field,
    kind: FacetKind,
    label: String,
    locale: Option<String>,
    selection: Selection,
    values: IndexMap<String, FacetValue>,
    range: Option<(f64, f64)>,
    bounds: Option<(f64, f64)>,
}

impl Facet {
    pub fn from_spec(spec: &FacetSpec) -> Self {
        match spec {
            FacetSpec::Option {
                field,
                label,
                locale,
                selection,
                values,
            } => Self {
                field: field.clone(),
                kind: FacetKind::Option,
                label: label.clone().unwrap_or_else(|| field.to_string()),
                locale: locale.clone(),
                selection: *selection,
                values: values
                    .iter()
                    .map(|raw| (raw.clone(), FacetValue::new(raw)))
                    .collect(),
                range: None,
                bounds: None,
            },
            FacetSpec::Boundary {
                field,
                label,
                locale,
            } => Self {
                field: field.clone(),
                kind: FacetKind::Boundary,
                label: label.clone().unwrap_or_else(|| field.to_string()),
                locale: locale.clone(),
                selection: Selection::Single,
                values: IndexMap::new(),
                range: None,
                bounds: None,
            },
        }
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn kind(&self) -> FacetKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Values in first-seen order.
    pub fn values(&self) -> impl Iterator<Item = &FacetValue> {
        self.values.values()
    }

    pub fn value(&self, raw: &str) -> Option<&FacetValue> {
        self.values.get(raw)
    }

    pub fn enabled_values(&self) -> impl Iterator<Item = &FacetValue> {
        self.values.values().filter(|v| v.enabled)
    }

    /// Selected range of a boundary facet.
    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    /// Edges reported by the last response for a boundary facet.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.bounds
    }

    pub fn is_active(&self) -> bool {
        match self.kind {
            FacetKind::Option => self.values.values().any(|v| v.enabled),
            FacetKind::Boundary => self.range.is_some(),
        }
    }

    /// Whether the facet is shown for `locale`. Unrestricted facets apply everywhere.
    pub fn applies_to(&self, locale: Option<&str>) -> bool {
        match (&self.locale, locale) {
            (None, _) => true,
            (Some(own), Some(current)) => own.eq_ignore_ascii_case(current),
            (Some(_), None) => false,
        }
    }

    /// Flip a value, creating it if unseen. Single-selection facets drop
    /// every other value when one is enabled. Returns the new state.
    pub fn toggle(&mut self, raw: &str) -> Result<bool> {
        self.require(FacetKind::Option)?;
        let enabled = !self.values.get(raw).map(|v| v.enabled).unwrap_or(false);
        if enabled && self.selection == Selection::Single {
            for value in self.values.values_mut() {
                value.enabled = false;
            }
        }
        self.values
            .entry(raw.to_string())
            .or_insert_with(|| FacetValue::new(raw))
            .enabled = enabled;
        Ok(enabled)
    }

    pub fn select_range(&mut self, min: f64, max: f64) -> Result<()> {
        self.require(FacetKind::Boundary)?;
        if min.is_nan() || max.is_nan() || min > max {
            return Err(SearchError::invalid_query(format!(
                "range for '{}' must have min <= max, got [{}, {}]",
                self.field, min, max
            )));
        }
        self.range = Some((min, max));
        Ok(())
    }

    /// Drop every selection. Returns whether anything was selected.
    pub fn clear(&mut self) -> bool {
        let was_active = self.is_active();
        for value in self.values.values_mut() {
            value.enabled = false;
        }
        self.range = None;
        was_active
    }

    fn require(&self, kind: FacetKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(SearchError::invalid_query(format!(
                "facet '{}' is a {:?} facet",
                self.field, self.kind
            )))
        }
    }

    /// This facet's own filter; the empty `or` when nothing is selected.
    pub fn filter(&self) -> Result<QueryNode> {
        match self.kind {
            FacetKind::Option => {
                let predicates = self
                    .enabled_values()
                    .map(|value| {
                        let operand = typed_value(&self.field, &value.raw_value)
                            .unwrap_or_else(|_| Value::from(value.raw_value.as_str()));
                        Predicate::new(self.field.clone(), Operator::Eq, operand)
                            .map(QueryNode::Predicate)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(QueryNode::Or(predicates))
            }
            FacetKind::Boundary => match self.range {
                Some((min, max)) => Ok(QueryNode::And(vec![
                    Predicate::new(self.field.clone(), Operator::Gte, Value::Number(min))?.into(),
                    Predicate::new(self.field.clone(), Operator::Lte, Value::Number(max))?.into(),
                ])),
                None => Ok(QueryNode::empty_or()),
            },
        }
    }

    /// Fold one response count map in. Returns whether anything changed.
    fn reconcile_counts(&mut self, counts: &IndexMap<String, u64>) -> bool {
        let mut changed = false;
        for value in self.values.values_mut() {
            let count = Some(counts.get(&value.raw_value).copied().unwrap_or(0));
            if value.count != count {
                value.count = count;
                changed = true;
            }
        }
        for (raw, count) in counts {
            if !self.values.contains_key(raw) {
                let mut value = FacetValue::new(raw);
                value.count = Some(*count);
                self.values.insert(raw.clone(), value);
                changed = true;
            }
        }
        changed
    }
}

/// The facet part of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetComposition {
    /// One slot per option facet, present whenever any option facet applies.
    pub facets: Option<QueryNode>,
    /// One slot per boundary facet.
    pub boundaries: Option<QueryNode>,
    /// Fields to count, aligned with the `facets` slots.
    pub options: Vec<Field>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetModel {
    facets: Vec<Facet>,
}

impl FacetModel {
    pub fn new(specs: &[FacetSpec]) -> Self {
        Self {
            facets: specs.iter().map(Facet::from_spec).collect(),
        }
    }

    /// Replace every facet. Values and selections are discarded.
    pub fn reconfigure(&mut self, specs: &[FacetSpec]) {
        *self = Self::new(specs);
    }

    pub fn facets(&self) -> &[Facet] {
        &self.facets
    }

    pub fn facet(&self, field: &Field) -> Option<&Facet> {
        self.facets.iter().find(|f| &f.field == field)
    }

    fn facet_mut(&mut self, field: &Field) -> Result<&mut Facet> {
        self.facets
            .iter_mut()
            .find(|f| &f.field == field)
            .ok_or_else(|| SearchError::invalid_query(format!("no facet configured for '{}'", field)))
    }

    fn of_kind<'a>(
        &'a self,
        kind: FacetKind,
        locale: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Facet> + 'a {
        self.facets
            .iter()
            .filter(move |f| f.kind == kind && f.applies_to(locale))
    }

    pub fn option_facets<'a>(&'a self, locale: Option<&'a str>) -> impl Iterator<Item = &'a Facet> + 'a {
        self.of_kind(FacetKind::Option, locale)
    }

    pub fn boundary_facets<'a>(&'a self, locale: Option<&'a str>) -> impl Iterator<Item = &'a Facet> + 'a {
        self.of_kind(FacetKind::Boundary, locale)
    }

    pub fn toggle(&mut self, field: &Field, raw: &str) -> Result<bool> {
        self.facet_mut(field)?.toggle(raw)
    }

    pub fn select_range(&mut self, field: &Field, min: f64, max: f64) -> Result<()> {
        self.facet_mut(field)?.select_range(min, max)
    }

    pub fn clear_facet(&mut self, field: &Field) -> Result<bool> {
        Ok(self.facet_mut(field)?.clear())
    }

    pub fn clear_all(&mut self) -> bool {
        self.facets
            .iter_mut()
            .fold(false, |changed, facet| facet.clear() || changed)
    }

    pub fn is_active(&self) -> bool {
        self.facets.iter().any(Facet::is_active)
    }

    pub fn compose(&self, locale: Option<&str>) -> Result<FacetComposition> {
        let mut composition = FacetComposition::default();

        let mut slots = Vec::new();
        for facet in self.option_facets(locale) {
            slots.push(facet.filter()?);
            composition.options.push(facet.field.clone());
        }
        if !slots.is_empty() {
            composition.facets = Some(QueryNode::Facets(slots));
        }

        let ranges = self
            .boundary_facets(locale)
            .map(Facet::filter)
            .collect::<Result<Vec<_>>>()?;
        if !ranges.is_empty() {
            composition.boundaries = Some(QueryNode::Boundaries(ranges));
        }

        Ok(composition)
    }

    /// Fold response counts and edges back in, positionally against the
    /// facets that [`FacetModel::compose`] emitted for the same locale.
    /// Returns whether any count or edge changed.
    pub fn reconcile(
        &mut self,
        locale: Option<&str>,
        options: &[IndexMap<String, u64>],
        boundaries: &[(f64, f64)],
    ) -> bool {
        let mut changed = false;
        let mut option_index = 0;
        let mut boundary_index = 0;
        for facet in self.facets.iter_mut().filter(|f| f.applies_to(locale)) {
            match facet.kind {
                FacetKind::Option => {
                    if let Some(counts) = options.get(option_index) {
                        changed |= facet.reconcile_counts(counts);
                    }
                    option_index += 1;
                }
                FacetKind::Boundary => {
                    if let Some(&edges) = boundaries.get(boundary_index) {
                        if facet.bounds != Some(edges) {
                            facet.bounds = Some(edges);
                            changed = true;
                        }
                    }
                    boundary_index += 1;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<FacetSpec> {
        vec![
            FacetSpec::Option {
                field: Field::named("vendor").unwrap(),
                label: Some("Brand".to_string()),
                locale: None,
                selection: Selection::Multi,
                values: vec!["Acme".to_string()],
            },
            FacetSpec::Boundary {
                field: Field::named("price").unwrap(),
                label: None,
                locale: None,
            },
            FacetSpec::Option {
                field: Field::option("Color"),
                label: None,
                locale: None,
                selection: Selection::Multi,
                values: vec![],
            },
            FacetSpec::Option {
                field: Field::option("Size"),
                label: None,
                locale: None,
                selection: Selection::Single,
                values: vec![],
            },
        ]
    }

    fn slot_fields(composition: &FacetComposition) -> Vec<Option<Field>> {
        let Some(QueryNode::Facets(slots)) = &composition.facets else {
            panic!("expected facets node");
        };
        slots
            .iter()
            .map(|slot| match slot.children().first() {
                Some(QueryNode::Predicate(p)) => Some(p.field.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_one_slot_per_option_facet_in_stable_order() {
        let mut model = FacetModel::new(&specs());
        let vendor = Field::named("vendor").unwrap();
        let color = Field::option("Color");
        let size = Field::option("Size");

        let empty = model.compose(None).unwrap();
        assert_eq!(slot_fields(&empty), vec![None, None, None]);
        assert_eq!(empty.options, vec![vendor.clone(), color.clone(), size.clone()]);

        model.toggle(&size, "M").unwrap();
        let first = model.compose(None).unwrap();
        assert_eq!(slot_fields(&first), vec![None, None, Some(size.clone())]);

        model.toggle(&vendor, "Acme").unwrap();
        model.toggle(&color, "Red").unwrap();
        model.toggle(&color, "Blue").unwrap();
        let second = model.compose(None).unwrap();
        assert_eq!(
            slot_fields(&second),
            vec![Some(vendor.clone()), Some(color.clone()), Some(size.clone())]
        );
        assert_eq!(second.options, empty.options);

        model.toggle(&color, "Red").unwrap();
        model.toggle(&color, "Blue").unwrap();
        let third = model.compose(None).unwrap();
        assert_eq!(slot_fields(&third), vec![Some(vendor), None, Some(size)]);
    }

    #[test]
    fn test_option_slot_is_or_of_enabled_values() {
        let mut model = FacetModel::new(&specs());
        let color = Field::option("Color");
        model.toggle(&color, "Red").unwrap();
        model.toggle(&color, "Blue").unwrap();

        let facet = model.facet(&color).unwrap();
        let QueryNode::Or(children) = facet.filter().unwrap() else {
            panic!("expected or");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(
            children[1].to_json(),
            serde_json::json!({"option": {"Color": {"==": "Blue"}}})
        );
    }

    #[test]
    fn test_boundaries_composed_apart_from_facets() {
        let mut model = FacetModel::new(&specs());
        let price = Field::named("price").unwrap();

        let idle = model.compose(None).unwrap();
        assert_eq!(idle.boundaries, Some(QueryNode::Boundaries(vec![QueryNode::empty_or()])));

        model.select_range(&price, 10.0, 50.0).unwrap();
        let composition = model.compose(None).unwrap();
        let Some(QueryNode::Boundaries(ranges)) = &composition.boundaries else {
            panic!("expected boundaries");
        };
        assert_eq!(ranges[0].predicate_count(), 2);
        assert_eq!(slot_fields(&composition).len(), 3);
        assert!(!composition.options.contains(&price));
    }

    #[test]
    fn test_select_range_validation() {
        let mut model = FacetModel::new(&specs());
        let price = Field::named("price").unwrap();
        assert!(model.select_range(&price, 50.0, 10.0).is_err());
        assert!(model.select_range(&Field::option("Color"), 1.0, 2.0).is_err());
        assert!(model.toggle(&price, "10").is_err());
        assert!(model.toggle(&Field::named("tag").unwrap(), "x").is_err());
    }

    #[test]
    fn test_single_selection_replaces_previous_value() {
        let mut model = FacetModel::new(&specs());
        let size = Field::option("Size");
        model.toggle(&size, "S").unwrap();
        model.toggle(&size, "M").unwrap();

        let enabled: Vec<_> = model
            .facet(&size)
            .unwrap()
            .enabled_values()
            .map(|v| v.raw_value.clone())
            .collect();
        assert_eq!(enabled, vec!["M".to_string()]);
    }

    #[test]
    fn test_reconcile_creates_updates_and_never_removes() {
        let mut model = FacetModel::new(&specs());
        let vendor = Field::named("vendor").unwrap();
        let color = Field::option("Color");

        let options = vec![
            IndexMap::from([("Acme".to_string(), 4), ("Globex".to_string(), 2)]),
            IndexMap::from([("Red".to_string(), 7)]),
            IndexMap::new(),
        ];
        assert!(model.reconcile(None, &options, &[(5.0, 120.0)]));

        let vendor_facet = model.facet(&vendor).unwrap();
        assert_eq!(vendor_facet.value("Acme").unwrap().count, Some(4));
        assert_eq!(vendor_facet.value("Globex").unwrap().count, Some(2));
        assert_eq!(model.facet(&color).unwrap().value("Red").unwrap().count, Some(7));
        assert_eq!(
            model.facet(&Field::named("price").unwrap()).unwrap().bounds(),
            Some((5.0, 120.0))
        );

        let options = vec![
            IndexMap::from([("Acme".to_string(), 1)]),
            IndexMap::from([("Red".to_string(), 7)]),
            IndexMap::new(),
        ];
        assert!(model.reconcile(None, &options, &[(5.0, 120.0)]));
        let globex = model.facet(&vendor).unwrap().value("Globex").unwrap();
        assert_eq!(globex.count, Some(0));
        assert!(globex.is_inactive());

        assert!(!model.reconcile(None, &options, &[(5.0, 120.0)]));
    }

    #[test]
    fn test_locale_restricted_facets_leave_the_slot_list() {
        let mut all = specs();
        all.push(FacetSpec::Option {
            field: Field::option("Farbe"),
            label: None,
            locale: Some("de".to_string()),
            selection: Selection::Multi,
            values: vec![],
        });
        let model = FacetModel::new(&all);

        assert_eq!(model.compose(Some("en")).unwrap().options.len(), 3);
        assert_eq!(model.compose(Some("DE")).unwrap().options.len(), 4);
        assert_eq!(model.compose(None).unwrap().options.len(), 3);
    }

    #[test]
    fn test_clear_all_and_reconfigure() {
        let mut model = FacetModel::new(&specs());
        assert!(!model.clear_all());

        model.toggle(&Field::option("Color"), "Red").unwrap();
        assert!(model.is_active());
        assert!(model.clear_all());
        assert!(!model.is_active());
        assert!(model.facet(&Field::option("Color")).unwrap().value("Red").is_some());

        model.reconfigure(&specs()[..1]);
        assert_eq!(model.facets().len(), 1);
    }
}
