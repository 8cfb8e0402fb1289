//! Origin conversion: allocate (or look up) the token for a URL and
//! describe or redirect to its proxied location.

use std::sync::Arc;

use axum::debug_handler;
use axum::extract::{Path, Query, State};
use axum::http::{header::LOCATION, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::directory::token::DOMAIN_RE;
use crate::error::{GatewayError, Result};
use crate::proxy::util::proxy_url;
use crate::state::{APIState, Protocol};

use super::pages;

#[derive(Deserialize)]
pub struct ConvertQuery {
    pub url: Option<String>,
}

#[derive(Serialize)]
pub struct ConvertResponse {
    pub original: String,
    pub domain: String,
    pub token: String,
    pub proxy: String,
}

pub struct Conversion {
    pub original: String,
    pub domain: String,
    pub protocol: Protocol,
    pub token: String,
    pub proxy: String,
}

/// Parse a user-supplied URL, canonicalise its hostname, and map it to a
/// token. The path and query ride along into the proxied URL.
pub fn convert_url(state: &APIState, raw: &str) -> std::result::Result<Conversion, GatewayError> {
    let parsed =
        Url::parse(raw).map_err(|err| GatewayError::Input(format!("invalid url '{raw}': {err}")))?;
    let protocol = Protocol::from_scheme(parsed.scheme())
        .ok_or_else(|| GatewayError::Input(format!("unsupported scheme '{}'", parsed.scheme())))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::Input(format!("url '{raw}' has no host")))?
        .to_ascii_lowercase();
    // One leading www. label folds into the canonical domain; the
    // rewriter already treats both as the same origin.
    let domain = match host.strip_prefix("www.") {
        Some(rest) if rest.contains('.') => rest.to_string(),
        _ => host,
    };
    if !DOMAIN_RE.is_match(&domain) {
        return Err(GatewayError::Input(format!(
            "'{domain}' is not a valid hostname"
        )));
    }

    let token = state.directory.token_for_domain(&domain, protocol);
    let mut path_and_query = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }
    let proxy = proxy_url(&state.config.base_domain, &token, &path_and_query);

    Ok(Conversion {
        original: raw.to_string(),
        domain,
        protocol,
        token,
        proxy,
    })
}

/// `GET /`: home page, or the allocate-and-redirect shortcut when a
/// `url` query is present.
#[debug_handler]
pub async fn index(
    State(state): State<Arc<APIState>>,
    Query(query): Query<ConvertQuery>,
) -> Response {
    match query.url {
        None => pages::home_page(&state.config).into_response(),
        Some(raw) => match convert_url(&state, &raw) {
            Ok(conversion) => {
                (StatusCode::FOUND, [(LOCATION, conversion.proxy)], "").into_response()
            }
            Err(err) => pages::error_response(&state.config, &err),
        },
    }
}

/// `GET /convert?url=…`: JSON description of the proxied location.
#[debug_handler]
pub async fn get_convert(
    State(state): State<Arc<APIState>>,
    Query(query): Query<ConvertQuery>,
) -> Result<Json<ConvertResponse>> {
    let raw = query
        .url
        .ok_or_else(|| GatewayError::Input("missing 'url' query parameter".to_string()))?;
    let conversion = convert_url(&state, &raw)?;
    Ok(Json(ConvertResponse {
        original: conversion.original,
        domain: conversion.domain,
        token: conversion.token,
        proxy: conversion.proxy,
    }))
}

/// `GET /test-token/:token`: resolve one token for diagnostics.
#[debug_handler]
pub async fn test_token(
    State(state): State<Arc<APIState>>,
    Path(token): Path<String>,
) -> Response {
    match state.directory.domain_info_from_token(&token) {
        Some(entry) => {
            let proxy = proxy_url(&state.config.base_domain, &token, "/");
            Json(json!({
                "token": token,
                "targetInfo": entry,
                "proxyUrl": proxy,
            }))
            .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown token '{token}'") })),
        )
            .into_response(),
    }
}
