//! The client-side navigation interceptor, delivered as an inline script
//! block parametrised per rewritten page.

/// Attribute marking an already-instrumented document.
pub const INJECTED_MARKER: &str = "data-proxywarp-injected";

static TEMPLATE: &str = include_str!("interceptor.js");

/// Build the inline `<script>` block for one `(token, base domain,
/// upstream domain)` triple. Plain placeholder substitution; the values
/// are a token (`[a-z0-9]+`) and two hostnames, so no quoting hazards.
pub fn interceptor_block(token: &str, base_domain: &str, domain: &str) -> String {
    let payload = TEMPLATE
        .replace("__TOKEN__", token)
        .replace("__BASE_DOMAIN__", base_domain)
        .replace("__UPSTREAM_DOMAIN__", domain);
    format!("<script {INJECTED_MARKER}=\"true\">\n{payload}</script>")
}
