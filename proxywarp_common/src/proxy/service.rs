use std::{sync::Arc, time::Duration, usize};

use axum::{
    body::{to_bytes, Body},
    debug_handler,
    extract::{Host, Request, State},
    http::HeaderValue,
    response::Response,
};
use hyper::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, REFERER,
    USER_AGENT, X_FRAME_OPTIONS,
};
use hyper::HeaderMap;
use tracing::{debug, error, warn};

use crate::api::pages;
use crate::directory::TokenEntry;
use crate::error::GatewayError;
use crate::rewriting::rewriter::{RewriteTarget, Rewriter};
use crate::state::ProxyState;

use super::util;

/// Entry point of the reverse-proxy path. A hard watchdog wraps the
/// whole request so a stuck resolution or upstream can never leave the
/// client connection hanging; on expiry a 504 page is emitted.
#[debug_handler]
pub async fn proxy(
    State(state): State<Arc<ProxyState>>,
    Host(host): Host,
    req: Request,
) -> Response {
    let watchdog = Duration::from_millis(state.config.timeouts.router_watchdog_ms);
    let config = state.config.clone();
    match tokio::time::timeout(watchdog, dispatch(state, host, req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!("router watchdog expired before a response started");
            pages::error_response(&config, &GatewayError::GatewayTimeout)
        }
    }
}

async fn dispatch(state: Arc<ProxyState>, host: String, req: Request) -> Response {
    let Some(token) = util::host_token(&state.config.base_domain, &host) else {
        return pages::error_response(
            &state.config,
            &GatewayError::Input(format!("host '{host}' does not name a proxy subdomain")),
        );
    };

    let referer = req
        .headers()
        .get(REFERER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let Some(target) = resolve(&state, &token, referer.as_deref()) else {
        warn!(token = %token, "no upstream resolved for subdomain");
        return pages::error_response(&state.config, &GatewayError::UnknownToken(token));
    };

    debug!(
        token = %token,
        domain = %target.domain,
        method = %req.method(),
        path = %req.uri().path(),
        "proxying request"
    );

    match forward(&state, &token, &target, req).await {
        Ok(response) => response,
        Err(err) => {
            error!(token = %token, error = %err, "proxy request failed");
            pages::error_response(&state.config, &err)
        }
    }
}

/// Resolution pipeline: resolver cache, then directory, then `Referer`
/// recovery, then one forced reload. Whatever resolves is memoised under
/// the incoming token so sub-resources on the same subdomain hit the
/// cache for one TTL.
fn resolve(state: &ProxyState, token: &str, referer: Option<&str>) -> Option<TokenEntry> {
    if let Some(hit) = state.resolver.get(token) {
        return Some(hit);
    }

    let resolved = state
        .directory
        .domain_info_from_token(token)
        .or_else(|| {
            let recovered = util::referer_token(&state.config.base_domain, referer?)?;
            debug!(token = %token, referer_token = %recovered, "recovering upstream via referer");
            state.directory.domain_info_from_token(&recovered)
        })
        .or_else(|| {
            state.directory.force_reload();
            state.directory.domain_info_from_token(token)
        });

    if let Some(entry) = &resolved {
        state.resolver.insert(token, entry.clone());
    }
    resolved
}

/// Upstream-bound copy of the client headers. The host and the identity
/// headers are replaced, the encoding negotiation is left to the
/// upstream client so it can transparently decompress, and forwarding
/// artifacts are dropped.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    filtered.extend(
        headers
            .iter()
            .filter(|(name, _)| {
                !matches!(
                    name.as_str(),
                    "host"
                        | "accept-encoding"
                        | "content-length"
                        | "connection"
                        | "user-agent"
                        | "referer"
                        | "x-forwarded-host"
                        | "x-forwarded-proto"
                )
            })
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    filtered
}

/// Downstream header policy: drop everything that would prevent framing
/// or script access, then pin the permissive CORS set and the legacy
/// `ALLOWALL` marker.
fn build_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    headers.extend(
        upstream
            .iter()
            .filter(|(name, _)| {
                !matches!(
                    name.as_str(),
                    "x-frame-options"
                        | "content-security-policy"
                        | "content-security-policy-report-only"
                        | "feature-policy"
                        | "permissions-policy"
                        | "connection"
                        | "transfer-encoding"
                )
            })
            .map(|(name, value)| (name.clone(), value.clone())),
    );

    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, X-Requested-With, Content-Type, Accept, Authorization"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("ALLOWALL"));
    headers
}

async fn forward(
    state: &ProxyState,
    token: &str,
    target: &TokenEntry,
    req: Request,
) -> Result<Response, GatewayError> {
    if target.domain.is_empty() {
        return Err(GatewayError::Internal(
            "resolved target carries no domain".to_string(),
        ));
    }
    let origin = format!("{}://{}", target.protocol, target.domain);

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_url = format!("{origin}{path_and_query}");

    let body_bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|err| GatewayError::Internal(format!("failed to read request body: {err}")))?;

    let response = state
        .client
        .request(parts.method, upstream_url.as_str())
        .headers(filter_request_headers(&parts.headers))
        .header(USER_AGENT, state.config.user_agent.as_str())
        .header(REFERER, format!("{origin}/"))
        .body(body_bytes.to_vec())
        .send()
        .await
        .map_err(|err| GatewayError::Upstream(err.to_string()))?;

    let mut headers = build_response_headers(response.headers());
    let status = response.status().as_u16();
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim_start()
        .starts_with("text/html");

    let body = if is_html {
        // The rewriter owns the whole body from here on.
        headers.remove(CONTENT_ENCODING);
        let raw = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?
            .to_vec();
        let rewrite_target = RewriteTarget {
            token,
            domain: &target.domain,
        };
        let rewritten = match state.html_rewriter.rewrite(raw, &rewrite_target) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "error rewriting HTML");
                b"<html><body><h1>Error rewriting HTML</h1></body></html>".to_vec()
            }
        };
        headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        Body::from(rewritten)
    } else {
        Body::from_stream(response.bytes_stream())
    };

    let mut out = Response::builder()
        .status(status)
        .body(body)
        .map_err(|err| GatewayError::Internal(format!("failed to build response: {err}")))?;
    *out.headers_mut() = headers;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectorySettings, TokenDirectory};
    use crate::resolver::ResolverCache;
    use crate::rewriting::html::html_rewriter::HtmlRewriter;
    use crate::state::{Config, Protocol};
    use axum::http::StatusCode;
    use std::path::PathBuf;

    fn temp_db(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "proxywarp-proxy-test-{}-{}.json",
            tag,
            std::process::id()
        ))
    }

    fn test_state(tag: &str) -> (Arc<ProxyState>, PathBuf) {
        let config = Arc::new(Config {
            base_domain: "proxywarp.com".to_string(),
            db_file: temp_db(tag),
            ..Config::default()
        });
        let db = config.db_file.clone();
        let directory = TokenDirectory::open(DirectorySettings::from_config(&config));
        let state = Arc::new(ProxyState {
            config: config.clone(),
            client: reqwest::Client::new(),
            directory,
            resolver: ResolverCache::new(Duration::from_secs(30)),
            html_rewriter: Arc::new(HtmlRewriter::new(config)),
        });
        (state, db)
    }

    #[tokio::test]
    async fn resolve_prefers_the_cache_and_falls_back_to_the_directory() {
        let (state, db) = test_state("resolve");
        let token = state
            .directory
            .token_for_domain("example.com", Protocol::Https);

        let first = resolve(&state, &token, None).expect("directory resolution");
        assert_eq!(first.domain, "example.com");
        assert!(state.resolver.get(&token).is_some(), "result is memoised");

        let second = resolve(&state, &token, None).expect("cache resolution");
        assert_eq!(second.domain, "example.com");
        let _ = std::fs::remove_file(db);
    }

    #[tokio::test]
    async fn resolve_recovers_sub_resources_via_the_referer() {
        let (state, db) = test_state("referer");
        let known = state
            .directory
            .token_for_domain("example.com", Protocol::Https);

        let recovered = resolve(
            &state,
            "unknown",
            Some(&format!("https://{known}.proxywarp.com/page")),
        )
        .expect("referer recovery");
        assert_eq!(recovered.domain, "example.com");
        // Adopted upstream is cached under the *incoming* token.
        assert!(state.resolver.get("unknown").is_some());
        let _ = std::fs::remove_file(db);
    }

    #[tokio::test]
    async fn resolve_gives_up_on_a_token_nobody_knows() {
        let (state, db) = test_state("gone");
        assert!(resolve(&state, "nosuch", Some("https://example.com/")).is_none());
        assert!(state.resolver.get("nosuch").is_none());
        let _ = std::fs::remove_file(db);
    }

    #[tokio::test]
    async fn unknown_subdomain_is_answered_with_a_400_page() {
        let (state, db) = test_state("unknown-400");
        let req = Request::builder()
            .uri("/style.css")
            .body(Body::empty())
            .expect("request");

        let response = dispatch(state, "nosuch.proxywarp.com".to_string(), req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let page = String::from_utf8_lossy(&body);
        assert!(page.contains("Unknown Proxy Token"));
        let _ = std::fs::remove_file(db);
    }

    #[test]
    fn response_headers_are_scrubbed_and_overridden() {
        let mut upstream = HeaderMap::new();
        upstream.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        upstream.insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'none'"),
        );
        upstream.insert(
            "content-security-policy-report-only",
            HeaderValue::from_static("default-src 'none'"),
        );
        upstream.insert("feature-policy", HeaderValue::from_static("camera 'none'"));
        upstream.insert(
            "permissions-policy",
            HeaderValue::from_static("geolocation=()"),
        );
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

        let headers = build_response_headers(&upstream);

        assert_eq!(
            headers.get(X_FRAME_OPTIONS).map(|v| v.as_bytes()),
            Some(&b"ALLOWALL"[..])
        );
        assert!(headers.get("content-security-policy").is_none());
        assert!(headers.get("content-security-policy-report-only").is_none());
        assert!(headers.get("feature-policy").is_none());
        assert!(headers.get("permissions-policy").is_none());
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).map(|v| v.as_bytes()),
            Some(&b"*"[..])
        );
        assert_eq!(
            headers
                .get(ACCESS_CONTROL_ALLOW_METHODS)
                .map(|v| v.as_bytes()),
            Some(&b"GET, POST, PUT, PATCH, DELETE, OPTIONS"[..])
        );
        assert!(headers.get(ACCESS_CONTROL_ALLOW_HEADERS).is_some());
        assert_eq!(
            headers
                .get(ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .map(|v| v.as_bytes()),
            Some(&b"true"[..])
        );
        // Untouched upstream headers survive.
        assert_eq!(
            headers.get(CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"text/html"[..])
        );
    }

    #[test]
    fn request_headers_drop_forwarding_artifacts_but_keep_credentials() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert("host", HeaderValue::from_static("abc123.proxywarp.com"));
        client_headers.insert("x-forwarded-host", HeaderValue::from_static("proxywarp.com"));
        client_headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        client_headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        client_headers.insert("user-agent", HeaderValue::from_static("Browser/1.0"));
        client_headers.insert("cookie", HeaderValue::from_static("session=1"));
        client_headers.insert("authorization", HeaderValue::from_static("Bearer x"));

        let filtered = filter_request_headers(&client_headers);

        assert!(filtered.get("host").is_none());
        assert!(filtered.get("x-forwarded-host").is_none());
        assert!(filtered.get("x-forwarded-proto").is_none());
        assert!(filtered.get("accept-encoding").is_none());
        assert!(filtered.get("user-agent").is_none());
        assert!(filtered.get("cookie").is_some());
        assert!(filtered.get("authorization").is_some());
    }
}
