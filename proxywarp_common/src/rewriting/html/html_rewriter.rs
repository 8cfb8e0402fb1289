//! Regex-driven rewriting of upstream HTML.
//!
//! The body is buffered and decoded as UTF-8, the transformations below
//! run in a fixed order, and the caller recomputes `Content-Length`.
//! Everything is a best-effort textual rewrite; malformed HTML never
//! aborts a response. Binary payloads mislabelled as HTML may be
//! corrupted, which is an accepted limitation of the contract.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::error::Result;
use crate::proxy::util::proxy_url;
use crate::rewriting::rewriter::{RewriteTarget, Rewriter};
use crate::state::Config;

use super::script;

static ABS_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\s)(href|src)=["']/([^"']*)["']"#).expect("valid absolute-path regex")
});

static FORM_ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<form([^>]*)action=["']([^"']*)["']"#).expect("valid form-action regex")
});

static BASE_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<base[\s>/]").expect("valid base-tag regex"));

static HEAD_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<head(\s[^>]*)?>").expect("valid head regex"));

static BODY_CLOSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</body>").expect("valid body-close regex"));

pub struct HtmlRewriter {
    config: Arc<Config>,
}

impl HtmlRewriter {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Rule 1: absolute URLs pointing at the upstream origin itself, on
    /// `href`/`src` attributes. Already-proxied URLs carry the base
    /// domain instead of the upstream one and fall through untouched.
    fn rewrite_origin_urls(&self, html: String, target: &RewriteTarget<'_>) -> Result<String> {
        let pattern = format!(
            r#"(?i)(href|src)=["'](?:https?:)?//(?:www\.)?{}([^"']*)["']"#,
            regex::escape(target.domain)
        );
        let re = Regex::new(&pattern)?;
        let base = &self.config.base_domain;
        Ok(re
            .replace_all(&html, |caps: &Captures| {
                format!(
                    r#"{}="{}""#,
                    &caps[1],
                    proxy_url(base, target.token, &caps[2])
                )
            })
            .into_owned())
    }

    /// Rule 2: absolute-path URLs on `href`/`src`. The leading whitespace
    /// is part of the match and is preserved.
    fn rewrite_absolute_paths(&self, html: String, target: &RewriteTarget<'_>) -> String {
        let base = &self.config.base_domain;
        ABS_PATH_RE
            .replace_all(&html, |caps: &Captures| {
                format!(
                    r#"{}{}="{}""#,
                    &caps[1],
                    &caps[2],
                    proxy_url(base, target.token, &format!("/{}", &caps[3]))
                )
            })
            .into_owned()
    }

    /// Rule 3: form actions. Same-origin absolute actions and rooted
    /// paths are proxied; anything already on the base domain, any
    /// foreign origin and any relative action stays as-is.
    fn rewrite_form_actions(&self, html: String, target: &RewriteTarget<'_>) -> String {
        let base = &self.config.base_domain;
        FORM_ACTION_RE
            .replace_all(&html, |caps: &Captures| {
                let action = &caps[2];
                let rewritten = if action.contains(base.as_str()) {
                    action.to_string()
                } else if action.starts_with("http") {
                    match Url::parse(action) {
                        Ok(parsed) => {
                            let host = parsed.host_str().unwrap_or_default();
                            if host == target.domain
                                || host == format!("www.{}", target.domain)
                            {
                                let mut path_and_query = parsed.path().to_string();
                                if let Some(query) = parsed.query() {
                                    path_and_query.push('?');
                                    path_and_query.push_str(query);
                                }
                                proxy_url(base, target.token, &path_and_query)
                            } else {
                                action.to_string()
                            }
                        }
                        Err(_) => action.to_string(),
                    }
                } else if action.starts_with('/') {
                    proxy_url(base, target.token, action)
                } else {
                    action.to_string()
                };
                format!(r#"<form{}action="{}""#, &caps[1], rewritten)
            })
            .into_owned()
    }

    /// Rule 4: inject a `<base>` tag right after the opening `<head>` so
    /// relative references resolve under the proxied origin. Documents
    /// that already declare one are left alone.
    fn inject_base_tag(&self, html: String, target: &RewriteTarget<'_>) -> String {
        if BASE_TAG_RE.is_match(&html) {
            return html;
        }
        let Some(head) = HEAD_OPEN_RE.find(&html) else {
            return html;
        };
        let tag = format!(
            "\n<base href=\"{}\">\n",
            proxy_url(&self.config.base_domain, target.token, "/")
        );
        let mut out = String::with_capacity(html.len() + tag.len());
        out.push_str(&html[..head.end()]);
        out.push_str(&tag);
        out.push_str(&html[head.end()..]);
        out
    }

    /// Rule 5: inject the navigation interceptor right before `</body>`,
    /// or append it when the tag is missing. A document that already
    /// carries the injection marker is left alone, which keeps the whole
    /// rewriter idempotent on its own output.
    fn inject_client_script(&self, html: String, target: &RewriteTarget<'_>) -> String {
        if html.contains(script::INJECTED_MARKER) {
            return html;
        }
        let block = script::interceptor_block(
            target.token,
            &self.config.base_domain,
            target.domain,
        );
        if BODY_CLOSE_RE.is_match(&html) {
            BODY_CLOSE_RE
                .replace(&html, |_: &Captures| format!("{block}\n</body>"))
                .into_owned()
        } else {
            let mut out = html;
            out.push_str(&block);
            out
        }
    }
}

impl Rewriter for HtmlRewriter {
    fn rewrite(&self, input: Vec<u8>, target: &RewriteTarget<'_>) -> Result<Vec<u8>> {
        let html = String::from_utf8_lossy(&input).into_owned();
        let html = self.rewrite_origin_urls(html, target)?;
        let html = self.rewrite_absolute_paths(html, target);
        let html = self.rewrite_form_actions(html, target);
        let html = self.inject_base_tag(html, target);
        let html = self.inject_client_script(html, target);
        Ok(html.into_bytes())
    }
}
