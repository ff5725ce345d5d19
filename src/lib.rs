//! # Route Hub
//!
//! Flight-route catalog pipeline: import parsing, per-user document sync and
//! a pure query engine for the route list view.
//!
//! This library provides:
//! - Tolerant parsing of delimited route exports into [`Route`] records
//! - A [`SyncClient`] that mirrors a user's catalog and activation state
//!   from an injected [`DocumentStore`] with optimistic local writes
//! - [`evaluate`], a deterministic filter/sort/paginate pass with aggregates
//!
//! ## Features
//!
//! - **`http`** - Enable the REST document store ([`HttpStore`])
//! - **`persistence`** - Enable the SQLite document store ([`SqliteStore`])
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_hub::{evaluate, parse, ActivationState, QueryParams, UsageFilter};
//!
//! let raw = "dest.id,dest.name,dest.iata,profit_pt\n\
//!            1,Lisboa,LIS,1200\n\
//!            2,Porto,OPO,800\n";
//! let routes = parse(raw, "jfk_mc214.csv");
//!
//! let mut activation = ActivationState::new();
//! activation.set("1", true);
//!
//! let params = QueryParams {
//!     usage_filter: UsageFilter::Used,
//!     ..QueryParams::default()
//! };
//! let result = evaluate(&routes, &activation, &params);
//! assert_eq!(result.page.len(), 1);
//! assert_eq!(result.aggregates.estimated_profit, 1200.0);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{CatalogError, Result};

// Import parsing
pub mod parser;
pub use parser::{
    parse, parse_with, summarize, FallbackIds, ImportOptions, ImportSummary, LabelHints,
};

// Query engine (filter, sort, aggregate, paginate)
pub mod query;
pub use query::{
    clamp_page, evaluate, filter_options, format_duration, Aggregates, FieldFilter,
    FilterOptions, QueryParams, QueryResult, SortKey, UsageFilter,
};

// Document store abstraction and implementations
pub mod store;
#[cfg(feature = "http")]
pub use store::{HttpStore, HttpStoreConfig};
#[cfg(feature = "persistence")]
pub use store::SqliteStore;
pub use store::{DocumentPath, DocumentStore, MemoryStore, PathScheme, Subscription};

// Catalog/activation synchronisation
pub mod sync;
pub use sync::{
    ActivationDocument, CatalogDocument, ConnectionState, DocumentKind, SyncClient, SyncConfig,
    SyncEvent, SyncStats, WriteAck,
};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RouteHubRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// Placeholder destination name when the import has none.
pub const DEFAULT_NAME: &str = "Destino";
/// Placeholder destination country.
pub const DEFAULT_COUNTRY: &str = "País";
/// Placeholder destination IATA code.
pub const DEFAULT_IATA: &str = "???";
/// Placeholder aircraft when neither a column nor the source label names one.
pub const DEFAULT_AIRCRAFT: &str = "Aeronave";
/// Placeholder origin airport.
pub const DEFAULT_ORIGIN: &str = "Origem";
/// Placeholder stopover country.
pub const DEFAULT_STOPOVER_COUNTRY: &str = "Desconhecido";
/// Market share used when the import has no usable value.
pub const DEFAULT_MARKET: f64 = 45.0;

/// A seat-count or price cell, kept exactly as the import provided it.
///
/// Exports disagree on whether these columns are quoted, so both numbers and
/// text are accepted and handed downstream untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    /// Numeric reading of the value; text is parsed leniently, 0 if unparsable.
    pub fn as_f64(&self) -> f64 {
        match self {
            RawValue::Number(n) if n.is_finite() => *n,
            RawValue::Number(_) => 0.0,
            RawValue::Text(s) => parser::parse_number(s),
        }
    }
}

impl Default for RawValue {
    fn default() -> Self {
        RawValue::Number(0.0)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(n) => write!(f, "{}", n),
            RawValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Number(n)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

/// Per-cabin values: economy (`y`), business (`j`) and first (`f`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeatClasses {
    #[serde(default)]
    pub y: RawValue,
    #[serde(default)]
    pub j: RawValue,
    #[serde(default)]
    pub f: RawValue,
}

impl SeatClasses {
    pub fn new(y: impl Into<RawValue>, j: impl Into<RawValue>, f: impl Into<RawValue>) -> Self {
        Self {
            y: y.into(),
            j: j.into(),
            f: f.into(),
        }
    }

    /// Sum of the three cabins read as numbers.
    pub fn total(&self) -> f64 {
        self.y.as_f64() + self.j.as_f64() + self.f.as_f64()
    }
}

/// Mandatory intermediate airport on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stopover {
    pub iata: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_stopover_country")]
    pub country: String,
}

/// One importable flight-route opportunity.
///
/// Field names match the stored catalog document. Every field except `id`
/// has a default so documents written by older clients still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_iata")]
    pub iata: String,
    /// Great-circle distance in kilometers
    #[serde(default)]
    pub dist: f64,
    /// Block time in hours
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub config: SeatClasses,
    #[serde(default)]
    pub prices: SeatClasses,
    /// Expected profit per flight
    #[serde(default)]
    pub profit: f64,
    /// Market share percentage
    #[serde(default = "default_market")]
    pub market: f64,
    #[serde(default)]
    pub stopover: Option<Stopover>,
    #[serde(default = "default_aircraft")]
    pub aircraft: String,
    #[serde(default = "default_origin")]
    pub origin: String,
}

impl Route {
    /// Create a route with placeholder values for everything but the id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: default_name(),
            country: default_country(),
            iata: default_iata(),
            dist: 0.0,
            time: 0.0,
            config: SeatClasses::default(),
            prices: SeatClasses::default(),
            profit: 0.0,
            market: DEFAULT_MARKET,
            stopover: None,
            aircraft: default_aircraft(),
            origin: default_origin(),
        }
    }

    /// A route without a stopover.
    pub fn is_direct(&self) -> bool {
        self.stopover.is_none()
    }
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}

fn default_iata() -> String {
    DEFAULT_IATA.to_string()
}

fn default_aircraft() -> String {
    DEFAULT_AIRCRAFT.to_string()
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

fn default_stopover_country() -> String {
    DEFAULT_STOPOVER_COUNTRY.to_string()
}

fn default_market() -> f64 {
    DEFAULT_MARKET
}

/// Opaque, stable user identity supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Route id to "in operational use" flag.
///
/// Entries outlive the catalog: ids that a later import dropped stay in the
/// map and are simply never looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivationState(BTreeMap<String, bool>);

impl ActivationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing ids count as inactive.
    pub fn is_active(&self, route_id: &str) -> bool {
        self.0.get(route_id).copied().unwrap_or(false)
    }

    pub fn set(&mut self, route_id: impl Into<String>, active: bool) {
        self.0.insert(route_id.into(), active);
    }

    /// Flip the flag for one id and return the new value.
    pub fn toggle(&mut self, route_id: &str) -> bool {
        let next = !self.is_active(route_id);
        self.0.insert(route_id.to_string(), next);
        next
    }

    /// Number of entries set to true, over the whole map.
    pub fn active_count(&self) -> usize {
        self.0.values().filter(|&&v| v).count()
    }

    pub fn get(&self, route_id: &str) -> Option<bool> {
        self.0.get(route_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl From<BTreeMap<String, bool>> for ActivationState {
    fn from(map: BTreeMap<String, bool>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, bool)> for ActivationState {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
