//! # Query Engine
//!
//! Pure evaluation of the route list view: filter, sort, aggregate and
//! paginate a catalog against the current activation state.
//!
//! Nothing here holds state, so the shell can call [`evaluate`] on every
//! parameter change.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ActivationState, Route};

/// Page size the list view starts with.
pub const DEFAULT_PAGE_SIZE: usize = 100;

// ============================================================================
// Query Parameters
// ============================================================================

/// Sort order of the route list. Both keys sort descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Profit,
    #[serde(alias = "dist")]
    Distance,
}

/// Filter on the activation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageFilter {
    #[default]
    All,
    Used,
    Unused,
}

impl UsageFilter {
    fn accepts(self, active: bool) -> bool {
        match self {
            UsageFilter::All => true,
            UsageFilter::Used => active,
            UsageFilter::Unused => !active,
        }
    }
}

/// Exact-match filter on a string field. On the wire, `"all"` means no filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldFilter {
    #[default]
    All,
    Exact(String),
}

impl FieldFilter {
    const ALL: &'static str = "all";

    pub fn matches(&self, value: &str) -> bool {
        match self {
            FieldFilter::All => true,
            FieldFilter::Exact(expected) => expected == value,
        }
    }
}

impl From<&str> for FieldFilter {
    fn from(value: &str) -> Self {
        if value == Self::ALL {
            FieldFilter::All
        } else {
            FieldFilter::Exact(value.to_string())
        }
    }
}

impl From<String> for FieldFilter {
    fn from(value: String) -> Self {
        if value == Self::ALL {
            FieldFilter::All
        } else {
            FieldFilter::Exact(value)
        }
    }
}

impl fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldFilter::All => f.write_str(Self::ALL),
            FieldFilter::Exact(value) => f.write_str(value),
        }
    }
}

impl Serialize for FieldFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(FieldFilter::from)
    }
}

/// View parameters owned by the shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    /// Case-insensitive substring of name or IATA code; empty matches all
    pub search_term: String,
    pub sort_key: SortKey,
    pub usage_filter: UsageFilter,
    pub aircraft_filter: FieldFilter,
    pub origin_filter: FieldFilter,
    /// Routes per page; 0 shows everything on one page
    pub page_size: usize,
    /// 1-based page index; not clamped by [`evaluate`]
    pub current_page: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            search_term: String::new(),
            sort_key: SortKey::Profit,
            usage_filter: UsageFilter::All,
            aircraft_filter: FieldFilter::All,
            origin_filter: FieldFilter::All,
            page_size: DEFAULT_PAGE_SIZE,
            current_page: 1,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Summary figures shown above the route list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    /// Routes flagged active anywhere in the activation map
    pub active_count: usize,
    /// Sum of profit over the filtered routes (all pages)
    pub estimated_profit: f64,
    /// Size of the unfiltered catalog
    pub catalog_count: usize,
}

/// Output of [`evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub page: Vec<Route>,
    pub total_pages: usize,
    /// Number of routes that passed the filters
    pub total_count: usize,
    pub aggregates: Aggregates,
}

/// Distinct values available to the aircraft and origin dropdowns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub aircraft: Vec<String>,
    pub origins: Vec<String>,
}

// ============================================================================
// Evaluation
// ============================================================================

/// Filter, sort, aggregate and paginate `routes`.
///
/// Ties keep catalog order. An out-of-range `current_page` (including 0)
/// yields an empty page rather than being clamped.
pub fn evaluate(routes: &[Route], activation: &ActivationState, params: &QueryParams) -> QueryResult {
    let needle = params.search_term.to_lowercase();

    let mut filtered: Vec<&Route> = routes
        .iter()
        .filter(|r| {
            matches_search(r, &needle)
                && params.usage_filter.accepts(activation.is_active(&r.id))
                && params.aircraft_filter.matches(&r.aircraft)
                && params.origin_filter.matches(&r.origin)
        })
        .collect();

    // sort_by is stable, so equal keys stay in catalog order
    match params.sort_key {
        SortKey::Profit => filtered.sort_by(|a, b| descending(a.profit, b.profit)),
        SortKey::Distance => filtered.sort_by(|a, b| descending(a.dist, b.dist)),
    }

    let total_count = filtered.len();
    let aggregates = Aggregates {
        active_count: activation.active_count(),
        estimated_profit: filtered.iter().map(|r| r.profit).sum(),
        catalog_count: routes.len(),
    };

    let (page, total_pages) = if params.page_size == 0 {
        (filtered.into_iter().cloned().collect(), 1)
    } else {
        let total_pages = total_count.div_ceil(params.page_size).max(1);
        let page = match params.current_page.checked_sub(1) {
            Some(index) => {
                let start = index.saturating_mul(params.page_size);
                filtered
                    .into_iter()
                    .skip(start)
                    .take(params.page_size)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };
        (page, total_pages)
    };

    QueryResult {
        page,
        total_pages,
        total_count,
        aggregates,
    }
}

fn matches_search(route: &Route, needle: &str) -> bool {
    needle.is_empty()
        || route.name.to_lowercase().contains(needle)
        || route.iata.to_lowercase().contains(needle)
}

/// Total descending order on a numeric field. NaN ranks as 0, like an
/// unparsable import cell.
fn descending(a: f64, b: f64) -> Ordering {
    rank(b).total_cmp(&rank(a))
}

fn rank(value: f64) -> f64 {
    // Also folds -0.0 into 0.0 so the two stay equal under total_cmp
    if value.is_nan() || value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Clamp a requested page into `[1, total_pages]`.
pub fn clamp_page(current_page: usize, total_pages: usize) -> usize {
    current_page.clamp(1, total_pages.max(1))
}

/// Distinct aircraft and origins in first-seen catalog order.
///
/// Derived from the catalog on demand so the dropdowns can never drift from
/// the data they filter.
pub fn filter_options(routes: &[Route]) -> FilterOptions {
    let mut seen_aircraft = HashSet::new();
    let mut seen_origins = HashSet::new();
    let mut options = FilterOptions::default();

    for route in routes {
        if seen_aircraft.insert(route.aircraft.as_str()) {
            options.aircraft.push(route.aircraft.clone());
        }
        if seen_origins.insert(route.origin.as_str()) {
            options.origins.push(route.origin.clone());
        }
    }

    options
}

/// Format fractional hours as `"{h}h {m}m"`.
pub fn format_duration(hours: f64) -> String {
    if !hours.is_finite() {
        return "0h 0m".to_string();
    }
    let h = hours.floor();
    let m = ((hours - h) * 60.0).round();
    format!("{}h {}m", h as i64, m as i64)
}

// ============================================================================
// Tests
// ============================================================================
