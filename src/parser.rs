//! # Route Import Parser
//!
//! Turns a delimited route export into an ordered list of [`Route`] records.
//!
//! Imports are user-supplied exports of uneven quality, so parsing never
//! fails: missing or malformed cells fall back to the placeholder values and
//! numeric cells that do not parse become 0.
//!
//! The first row is a header naming columns by key (`dest.id`, `dest.name`,
//! `direct_dist`, `profit_pt`, ...). Unknown columns are ignored. Cells are
//! split naively on the delimiter; quoting is not supported.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use log::debug;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    Route, SeatClasses, RawValue, Stopover, DEFAULT_AIRCRAFT, DEFAULT_COUNTRY, DEFAULT_IATA,
    DEFAULT_MARKET, DEFAULT_NAME, DEFAULT_ORIGIN, DEFAULT_STOPOVER_COUNTRY,
};

// Recognized header keys
const COL_ID: &str = "dest.id";
const COL_NAME: &str = "dest.name";
const COL_COUNTRY: &str = "dest.country";
const COL_IATA: &str = "dest.iata";
const COL_DIST: &str = "direct_dist";
const COL_TIME: &str = "time";
const COL_CFG_Y: &str = "cfg.y";
const COL_CFG_J: &str = "cfg.j";
const COL_CFG_F: &str = "cfg.f";
const COL_TKT_Y: &str = "tkt.y";
const COL_TKT_J: &str = "tkt.j";
const COL_TKT_F: &str = "tkt.f";
const COL_PROFIT: &str = "profit_pt";
const COL_STOP_IATA: &str = "stop.iata";
const COL_STOP_NAME: &str = "stop.name";
const COL_STOP_COUNTRY: &str = "stop.country";
const COL_MARKET: &str = "market";
const COL_AIRCRAFT: &str = "aircraft";
const COL_ORIGIN: &str = "origin";

/// Prefix for ids derived from row content.
const HASH_ID_PREFIX: &str = "row-";
/// Bytes of the SHA-256 digest kept in a content-hash id (16 hex chars).
const HASH_ID_BYTES: usize = 8;

static DEFAULT_OPTIONS: Lazy<ImportOptions> = Lazy::new(ImportOptions::default);

// ============================================================================
// Configuration
// ============================================================================

/// Substring tables used to tag a whole import from its source label.
///
/// Tokens are matched case-insensitively against the label (usually the
/// export's file name). The first matching entry wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelHints {
    /// (token, aircraft name) pairs
    pub aircraft: Vec<(String, String)>,
    /// (token, origin airport) pairs
    pub origins: Vec<(String, String)>,
}

impl Default for LabelHints {
    fn default() -> Self {
        Self {
            aircraft: vec![("mc214".to_string(), "MC-21-400".to_string())],
            origins: vec![("jfk".to_string(), "JFK".to_string())],
        }
    }
}

impl LabelHints {
    /// Aircraft name implied by the label, if any.
    pub fn aircraft_for(&self, label: &str) -> Option<&str> {
        Self::lookup(&self.aircraft, label)
    }

    /// Origin airport implied by the label, if any.
    pub fn origin_for(&self, label: &str) -> Option<&str> {
        Self::lookup(&self.origins, label)
    }

    fn lookup<'a>(table: &'a [(String, String)], label: &str) -> Option<&'a str> {
        let label = label.to_lowercase();
        table
            .iter()
            .find(|(token, _)| !token.is_empty() && label.contains(&token.to_lowercase()))
            .map(|(_, value)| value.as_str())
    }
}

/// How to build an id for rows that have no `dest.id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackIds {
    /// Hash of the row text. Re-importing the same file yields the same ids,
    /// so activation entries keep pointing at their routes.
    #[default]
    ContentHash,
    /// `{row index}-{import time in ms}`. Unique per import but changes on
    /// every re-import.
    RowTimestamp,
}

/// Import parsing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOptions {
    /// Cell delimiter
    pub delimiter: char,
    /// Label-based aircraft/origin inference tables
    pub hints: LabelHints,
    /// Id strategy for rows without `dest.id`
    pub fallback_ids: FallbackIds,
    /// Import time used by [`FallbackIds::RowTimestamp`]; now when unset
    pub imported_at_ms: Option<i64>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            hints: LabelHints::default(),
            fallback_ids: FallbackIds::default(),
            imported_at_ms: None,
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse an import with the default options.
///
/// `source_label` is the import's name (e.g. its file name) and is only used
/// to infer aircraft and origin.
pub fn parse(raw_text: &str, source_label: &str) -> Vec<Route> {
    parse_with(raw_text, source_label, &DEFAULT_OPTIONS)
}

/// Parse an import with explicit options. Output preserves row order.
pub fn parse_with(raw_text: &str, source_label: &str, options: &ImportOptions) -> Vec<Route> {
    let mut lines = raw_text.lines();

    let header: Vec<&str> = match lines.next() {
        Some(line) => line
            .trim_start_matches('\u{feff}')
            .split(options.delimiter)
            .map(str::trim)
            .collect(),
        None => return Vec::new(),
    };

    // Later duplicates win, same as assigning cells into a keyed record
    let columns: HashMap<&str, usize> = header
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect();

    let label_aircraft = options.hints.aircraft_for(source_label);
    let label_origin = options.hints.origin_for(source_label);
    let imported_at_ms = options
        .imported_at_ms
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let mut used_ids: HashSet<String> = HashSet::new();

    let routes: Vec<Route> = lines
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            let row = Row::split(line, options.delimiter, &columns);

            let base_id = match row.get(COL_ID) {
                Some(id) => id.to_string(),
                None => fallback_id(options.fallback_ids, index, imported_at_ms, line),
            };
            let id = unique_id(base_id, &mut used_ids);

            let stopover = row.get(COL_STOP_IATA).map(|iata| Stopover {
                iata: iata.to_string(),
                name: row.get(COL_STOP_NAME).map(str::to_string),
                country: row.text_or(COL_STOP_COUNTRY, DEFAULT_STOPOVER_COUNTRY),
            });

            Route {
                id,
                name: row.text_or(COL_NAME, DEFAULT_NAME),
                country: row.text_or(COL_COUNTRY, DEFAULT_COUNTRY),
                iata: row.text_or(COL_IATA, DEFAULT_IATA),
                dist: row.number(COL_DIST).max(0.0),
                time: row.number(COL_TIME).max(0.0),
                config: SeatClasses {
                    y: row.raw(COL_CFG_Y),
                    j: row.raw(COL_CFG_J),
                    f: row.raw(COL_CFG_F),
                },
                prices: SeatClasses {
                    y: row.raw(COL_TKT_Y),
                    j: row.raw(COL_TKT_J),
                    f: row.raw(COL_TKT_F),
                },
                profit: row.number(COL_PROFIT),
                market: market_share(row.number(COL_MARKET)),
                stopover,
                aircraft: row
                    .get(COL_AIRCRAFT)
                    .or(label_aircraft)
                    .unwrap_or(DEFAULT_AIRCRAFT)
                    .to_string(),
                origin: row
                    .get(COL_ORIGIN)
                    .or(label_origin)
                    .unwrap_or(DEFAULT_ORIGIN)
                    .to_string(),
            }
        })
        .collect();

    debug!(
        "[Parser] {} routes from '{}' ({} columns)",
        routes.len(),
        source_label,
        header.len()
    );
    routes
}

/// One body row with cells resolved by header key.
struct Row<'a> {
    cells: Vec<&'a str>,
    columns: &'a HashMap<&'a str, usize>,
}

impl<'a> Row<'a> {
    fn split(line: &'a str, delimiter: char, columns: &'a HashMap<&'a str, usize>) -> Self {
        Self {
            cells: line.split(delimiter).map(str::trim).collect(),
            columns,
        }
    }

    /// Non-empty cell for a column; empty and missing cells are both `None`.
    fn get(&self, key: &str) -> Option<&'a str> {
        self.columns
            .get(key)
            .and_then(|&i| self.cells.get(i).copied())
            .filter(|cell| !cell.is_empty())
    }

    fn text_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn number(&self, key: &str) -> f64 {
        self.get(key).map(parse_number).unwrap_or(0.0)
    }

    fn raw(&self, key: &str) -> RawValue {
        self.get(key)
            .map(|cell| RawValue::Text(cell.to_string()))
            .unwrap_or_default()
    }
}

/// Market share rounded to 2 decimals; 0 or unparsable falls back to the default.
fn market_share(value: f64) -> f64 {
    let rounded = (value * 100.0).round() / 100.0;
    if rounded == 0.0 || !rounded.is_finite() {
        DEFAULT_MARKET
    } else {
        rounded
    }
}

fn fallback_id(strategy: FallbackIds, index: usize, imported_at_ms: i64, line: &str) -> String {
    match strategy {
        FallbackIds::ContentHash => {
            let digest = Sha256::digest(line.trim().as_bytes());
            let hex: String = digest[..HASH_ID_BYTES]
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            format!("{}{}", HASH_ID_PREFIX, hex)
        }
        FallbackIds::RowTimestamp => format!("{}-{}", index, imported_at_ms),
    }
}

/// Keep ids unique within one import: repeats get `#2`, `#3`, ...
fn unique_id(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}#{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Lenient number parsing: the longest leading decimal literal, else 0.
///
/// `"812km"` reads as 812 and `" 3.5h"` as 3.5. Non-finite results are 0.
pub(crate) fn parse_number(text: &str) -> f64 {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }

    if digits == 0 {
        return 0.0;
    }

    // Exponent only counts when digits follow it
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end]
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

// ============================================================================
// Import Summary
// ============================================================================

/// Counters describing a parsed import, for logging and import feedback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub route_count: usize,
    pub stopover_count: usize,
    /// Routes that fell back to the placeholder destination name
    pub unnamed_count: usize,
    pub total_profit: f64,
}

/// Summarize a parsed import.
pub fn summarize(routes: &[Route]) -> ImportSummary {
    routes.iter().fold(ImportSummary::default(), |mut acc, r| {
        acc.route_count += 1;
        if r.stopover.is_some() {
            acc.stopover_count += 1;
        }
        if r.name == DEFAULT_NAME {
            acc.unnamed_count += 1;
        }
        acc.total_profit += r.profit;
        acc
    })
}

// ============================================================================
// Tests
// ============================================================================
