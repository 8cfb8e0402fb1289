//! Debug-only diagnostics surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::debug_handler;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::lookup_host;
use tracing::info;

use crate::directory::token::DOMAIN_RE;
use crate::error::{GatewayError, Result};
use crate::proxy::util::proxy_url;
use crate::state::APIState;

#[derive(Deserialize)]
pub struct DomainQuery {
    pub domain: Option<String>,
}

fn required_domain(query: DomainQuery) -> std::result::Result<String, GatewayError> {
    let domain = query
        .domain
        .ok_or_else(|| GatewayError::Input("missing 'domain' query parameter".to_string()))?
        .to_ascii_lowercase();
    if !DOMAIN_RE.is_match(&domain) {
        return Err(GatewayError::Input(format!(
            "'{domain}' is not a valid hostname"
        )));
    }
    Ok(domain)
}

/// `GET /admin/diagnostic`: process state snapshot.
#[debug_handler]
pub async fn diagnostic(State(state): State<Arc<APIState>>) -> Json<Value> {
    let (backup_entries, backup_sources) = state.directory.backup_info();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "base_domain": state.config.base_domain,
        "db_file": state.config.db_file,
        "token_length": state.config.token_length,
        "tokens": state.directory.len(),
        "backup": { "entries": backup_entries, "sources": backup_sources },
        "resolver_cache": state.resolver.len(),
    }))
}

/// `GET /admin/test-connection?domain=…`: DNS plus HTTP and HTTPS
/// probes, the whole run bounded by the admin watchdog so a stuck probe
/// cannot monopolise the connection.
#[debug_handler]
pub async fn test_connection(
    State(state): State<Arc<APIState>>,
    Query(query): Query<DomainQuery>,
) -> Result<Json<Value>> {
    let domain = required_domain(query)?;
    let budget = Duration::from_millis(state.config.timeouts.admin_probe_ms);
    match tokio::time::timeout(budget, probe(state, domain.clone())).await {
        Ok(report) => Ok(Json(report)),
        Err(_) => Ok(Json(json!({ "domain": domain, "error": "probe timed out" }))),
    }
}

async fn probe(state: Arc<APIState>, domain: String) -> Value {
    let started = Instant::now();
    let dns = match lookup_host((domain.as_str(), 443)).await {
        Ok(addrs) => {
            let addresses: Vec<String> = addrs.map(|addr| addr.ip().to_string()).collect();
            json!({
                "ok": !addresses.is_empty(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "addresses": addresses,
            })
        }
        Err(err) => json!({
            "ok": false,
            "elapsed_ms": started.elapsed().as_millis() as u64,
            "error": err.to_string(),
        }),
    };

    let http = probe_scheme(&state, "http", &domain).await;
    let https = probe_scheme(&state, "https", &domain).await;

    json!({ "domain": domain, "dns": dns, "http": http, "https": https })
}

async fn probe_scheme(state: &APIState, scheme: &str, domain: &str) -> Value {
    let started = Instant::now();
    match state.client.head(format!("{scheme}://{domain}/")).send().await {
        Ok(response) => json!({
            "ok": true,
            "status": response.status().as_u16(),
            "elapsed_ms": started.elapsed().as_millis() as u64,
        }),
        Err(err) => json!({
            "ok": false,
            "error": err.to_string(),
            "elapsed_ms": started.elapsed().as_millis() as u64,
        }),
    }
}

/// `GET /admin/reload-tokens`: synchronous directory reload.
#[debug_handler]
pub async fn reload_tokens(State(state): State<Arc<APIState>>) -> Json<Value> {
    let tokens = state.directory.force_reload();
    info!(tokens, "token database reloaded by admin");
    Json(json!({ "reloaded": true, "tokens": tokens }))
}

/// `GET /admin/add-test-token?domain=…`: forced allocation.
#[debug_handler]
pub async fn add_test_token(
    State(state): State<Arc<APIState>>,
    Query(query): Query<DomainQuery>,
) -> Result<Json<Value>> {
    let domain = required_domain(query)?;
    let token = state
        .directory
        .token_for_domain(&domain, state.config.default_protocol);
    let proxy = proxy_url(&state.config.base_domain, &token, "/");
    Ok(Json(json!({ "token": token, "domain": domain, "proxy": proxy })))
}
