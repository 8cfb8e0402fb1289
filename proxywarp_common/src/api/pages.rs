//! Inline HTML surfaces: the home page and the shared error page.

use axum::response::{Html, IntoResponse, Response};

use crate::error::GatewayError;
use crate::state::Config;

static HOME_TEMPLATE: &str = include_str!("home.html");
static ERROR_TEMPLATE: &str = include_str!("error.html");

pub fn home_page(config: &Config) -> Html<String> {
    Html(HOME_TEMPLATE.replace("__BASE_DOMAIN__", &escape(&config.base_domain)))
}

/// Render the shared error page. The error detail chain is only exposed
/// when the gateway runs in debug mode.
pub fn error_page(config: &Config, err: &GatewayError) -> String {
    let detail = if config.debug {
        format!("<pre>{}</pre>\n", escape(&format!("{err:?}")))
    } else {
        String::new()
    };
    ERROR_TEMPLATE
        .replace("__STATUS__", err.status().as_str())
        .replace("__TITLE__", err.title())
        .replace("__MESSAGE__", &escape(&err.to_string()))
        .replace("__DETAIL__", &detail)
}

pub fn error_response(config: &Config, err: &GatewayError) -> Response {
    (err.status(), Html(error_page(config, err))).into_response()
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
