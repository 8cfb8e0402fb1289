pub mod api;
pub mod directory;
pub mod error;
pub mod proxy;
pub mod resolver;
pub mod rewriting;
pub mod state;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Host, Request, State},
    handler::Handler,
    routing::any,
};
use reqwest::redirect::Policy;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::info;

use directory::{DirectorySettings, TokenDirectory};
use error::Result;
use resolver::ResolverCache;
use rewriting::html::html_rewriter::HtmlRewriter;
use state::{APIState, Config, ProxyState, SharedState};

/// Bind the configured address and run the gateway. A bind failure is
/// fatal and surfaces out of `main` with a non-zero exit.
pub async fn serve<F>(config: Arc<Config>, graceful_shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(config.host)
        .await
        .with_context(|| format!("failed to bind {}", config.host))?;
    serve_with_listener(listener, config, graceful_shutdown).await
}

/// Run the gateway on an already-bound listener. Split out of [`serve`]
/// so tests can bind an ephemeral port themselves.
pub async fn serve_with_listener<F>(
    listener: TcpListener,
    config: Arc<Config>,
    graceful_shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let directory = TokenDirectory::open(DirectorySettings::from_config(&config));
    directory.spawn_maintenance();
    let resolver = ResolverCache::new(Duration::from_millis(config.cache.ttl_ms));

    let client = reqwest::Client::builder()
        .redirect(Policy::limited(5))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .zstd(true)
        .timeout(Duration::from_millis(config.timeouts.proxy_request_ms))
        .read_timeout(Duration::from_millis(config.timeouts.proxy_request_ms))
        .build()?;

    let proxystate = ProxyState {
        config: config.clone(),
        client: client.clone(),
        directory: directory.clone(),
        resolver: resolver.clone(),
        html_rewriter: Arc::new(HtmlRewriter::new(config.clone())),
    };
    let proxyrouter = proxy::service::proxy.with_state(Arc::new(proxystate));

    let apistate = APIState {
        config: config.clone(),
        directory: directory.clone(),
        resolver,
        client,
        started_at: Instant::now(),
    };
    let apirouter = api::service::service(Arc::new(apistate));

    let sharedstate = SharedState {
        config: config.clone(),
    };

    let app = any(
        |State(state): State<SharedState>, Host(host): Host, req: Request| async move {
            if proxy::util::host_token(&state.config.base_domain, &host).is_some() {
                return proxyrouter.oneshot(req).await;
            }
            apirouter.oneshot(req).await
        },
    )
    .with_state(sharedstate);

    let address = listener.local_addr().context("listener has no address")?;
    info!(address = %address, base_domain = %config.base_domain, "gateway listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(graceful_shutdown)
        .await
        .context("server error")?;

    // Whatever the debounce timer still owes the disk goes out now.
    directory.flush();
    Ok(())
}
