//! FFI bindings for mobile platforms (iOS/Android).
//!
//! Parsing and query evaluation are exposed to Kotlin and Swift. Structured
//! inputs and outputs cross the boundary as JSON strings so the shell can
//! keep using its own route models. All FFI functions are prefixed with
//! `ffi_` to avoid naming conflicts with the internal API.

use crate::{
    clamp_page, evaluate, filter_options, format_duration, init_logging, parse, summarize,
    ActivationState, QueryParams, Route,
};
use log::{info, warn};

// ============================================================================
// Import
// ============================================================================

/// Import counters returned to the shell.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiImportSummary {
    pub route_count: u32,
    pub stopover_count: u32,
    pub unnamed_count: u32,
    pub total_profit: f64,
}

/// Parse a delimited export into routes.
///
/// Returns a JSON array of routes.
#[uniffi::export]
pub fn ffi_parse_routes(raw_text: String, source_label: String) -> String {
    init_logging();
    let routes = parse(&raw_text, &source_label);
    info!(
        "[RouteHubRust] Parsed {} routes from '{}'",
        routes.len(),
        source_label
    );
    serde_json::to_string(&routes).unwrap_or_else(|_| "[]".to_string())
}

/// Summarize an import without keeping the parsed routes.
#[uniffi::export]
pub fn ffi_summarize_import(raw_text: String, source_label: String) -> FfiImportSummary {
    init_logging();
    let summary = summarize(&parse(&raw_text, &source_label));
    FfiImportSummary {
        route_count: summary.route_count as u32,
        stopover_count: summary.stopover_count as u32,
        unnamed_count: summary.unnamed_count as u32,
        total_profit: summary.total_profit,
    }
}

// ============================================================================
// Query
// ============================================================================

/// Evaluate a query over a catalog.
///
/// # Arguments
/// * `routes_json` - JSON array of routes
/// * `activation_json` - JSON object mapping route id to bool
/// * `params_json` - JSON query params; missing fields take defaults
///
/// Malformed input is logged and treated as empty.
#[uniffi::export]
pub fn ffi_evaluate(routes_json: String, activation_json: String, params_json: String) -> String {
    init_logging();
    let routes = decode_routes(&routes_json);
    let activation: ActivationState = serde_json::from_str(&activation_json).unwrap_or_else(|e| {
        warn!("[RouteHubRust] Invalid activation JSON: {}", e);
        ActivationState::new()
    });
    let params: QueryParams = serde_json::from_str(&params_json).unwrap_or_else(|e| {
        warn!("[RouteHubRust] Invalid query params JSON: {}", e);
        QueryParams::default()
    });

    let result = evaluate(&routes, &activation, &params);
    info!(
        "[RouteHubRust] Query: {} of {} routes match, page {}/{}",
        result.total_count,
        routes.len(),
        params.current_page,
        result.total_pages
    );
    serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string())
}

/// Aircraft and origin dropdown values for a catalog, as JSON.
#[uniffi::export]
pub fn ffi_filter_options(routes_json: String) -> String {
    init_logging();
    let options = filter_options(&decode_routes(&routes_json));
    serde_json::to_string(&options).unwrap_or_else(|_| "{}".to_string())
}

#[uniffi::export]
pub fn ffi_clamp_page(current_page: u32, total_pages: u32) -> u32 {
    clamp_page(current_page as usize, total_pages as usize) as u32
}

/// Flight time as `"{h}h {m}m"`.
#[uniffi::export]
pub fn ffi_format_duration(hours: f64) -> String {
    format_duration(hours)
}

fn decode_routes(routes_json: &str) -> Vec<Route> {
    serde_json::from_str(routes_json).unwrap_or_else(|e| {
        warn!("[RouteHubRust] Invalid routes JSON: {}", e);
        Vec::new()
    })
}
