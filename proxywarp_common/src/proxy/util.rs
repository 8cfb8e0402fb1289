//! Host-header math: token extraction, referer recovery and proxied URL
//! construction.

use url::Url;

/// Extract the token label chain from a request `Host`.
///
/// Returns `None` when the host belongs to the management surface: empty,
/// the base domain itself, or anything that is not a child of it.
pub fn host_token(base_domain: &str, host: &str) -> Option<String> {
    let host = match host.rfind(':') {
        Some(index) => &host[..index],
        None => host,
    };
    let host = host.to_ascii_lowercase();
    let base = base_domain.to_ascii_lowercase();

    if host.is_empty() || host == base {
        return None;
    }
    let token = host.strip_suffix(&format!(".{base}"))?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Recover a token from a `Referer` URL whose hostname is a child of the
/// base domain. This is how sub-resources on an unknown subdomain find
/// their upstream.
pub fn referer_token(base_domain: &str, referer: &str) -> Option<String> {
    let url = Url::parse(referer).ok()?;
    host_token(base_domain, url.host_str()?)
}

/// `https://<token>.<base_domain><path>`, with a leading `/` guaranteed
/// whenever a path is supplied.
pub fn proxy_url(base_domain: &str, token: &str, path_and_query: &str) -> String {
    let mut path = path_and_query.to_string();
    if !path.is_empty() && !path.starts_with('/') {
        path.insert(0, '/');
    }
    format!("https://{token}.{base_domain}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_token_extracts_the_subdomain_label() {
        assert_eq!(
            host_token("proxywarp.com", "abc123.proxywarp.com"),
            Some("abc123".to_string())
        );
        assert_eq!(
            host_token("proxywarp.com", "ABC123.PROXYWARP.COM:3000"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn management_hosts_yield_no_token() {
        assert_eq!(host_token("proxywarp.com", ""), None);
        assert_eq!(host_token("proxywarp.com", "proxywarp.com"), None);
        assert_eq!(host_token("proxywarp.com", "proxywarp.com:3000"), None);
        assert_eq!(host_token("proxywarp.com", "example.com"), None);
        assert_eq!(host_token("proxywarp.com", "evilproxywarp.com"), None);
        assert_eq!(host_token("proxywarp.com", ".proxywarp.com"), None);
    }

    #[test]
    fn nested_labels_are_kept_whole() {
        assert_eq!(
            host_token("proxywarp.com", "a.b.proxywarp.com"),
            Some("a.b".to_string())
        );
    }

    #[test]
    fn referer_token_parses_the_url_host() {
        assert_eq!(
            referer_token("proxywarp.com", "https://abc123.proxywarp.com/page?x=1"),
            Some("abc123".to_string())
        );
        assert_eq!(
            referer_token("proxywarp.com", "https://example.com/page"),
            None
        );
        assert_eq!(referer_token("proxywarp.com", "not a url"), None);
    }

    #[test]
    fn proxy_url_normalises_the_path() {
        assert_eq!(
            proxy_url("proxywarp.com", "abc123", "/foo?bar=1"),
            "https://abc123.proxywarp.com/foo?bar=1"
        );
        assert_eq!(
            proxy_url("proxywarp.com", "abc123", "foo"),
            "https://abc123.proxywarp.com/foo"
        );
        assert_eq!(
            proxy_url("proxywarp.com", "abc123", ""),
            "https://abc123.proxywarp.com"
        );
    }
}
