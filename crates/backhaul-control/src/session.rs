//! Sticky-session binding between an external caller and a tunnel
//!
//! The session token is a plain cookie carrying the tunnel id literally.
//! That is acceptable only because the id is nothing more than a registry
//! key: every use re-validates liveness against the registry, so a forged
//! or stale cookie can at worst select a tunnel that is publicly selectable
//! anyway, or fail. No server-side session state exists.

use crate::error::RelayError;
use crate::registry::TunnelRegistry;
use http::header::COOKIE;
use http::HeaderMap;

/// Cookie carrying the selected tunnel id
pub const COOKIE_NAME: &str = "tunnel";

/// Bind a caller to a tunnel id.
///
/// Fails with `UnknownTunnel` if the id is not currently registered;
/// otherwise returns the `Set-Cookie` value. Selection does not reserve the
/// tunnel — any number of sessions may bind to the same id.
pub fn select(registry: &TunnelRegistry, id: &str) -> Result<String, RelayError> {
    if registry.lookup(id).is_none() {
        return Err(RelayError::UnknownTunnel(id.to_string()));
    }
    Ok(format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        COOKIE_NAME, id
    ))
}

/// Extract the tunnel id from the request's cookies.
///
/// Returns `None` when the cookie is missing or malformed; liveness is the
/// registry's concern, not this function's.
pub fn resolve(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            if name.trim() == COOKIE_NAME && !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Tunnel;
    use http::HeaderValue;
    use tokio::sync::mpsc;

    fn headers_with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_select_live_tunnel() {
        let registry = TunnelRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(Tunnel::new("abc", tx));

        let cookie = select(&registry, "abc").unwrap();
        assert_eq!(cookie, "tunnel=abc; Path=/; HttpOnly; SameSite=Lax");
    }

    #[tokio::test]
    async fn test_select_unknown_tunnel_fails() {
        let registry = TunnelRegistry::new();
        let result = select(&registry, "nobody");
        assert!(matches!(result, Err(RelayError::UnknownTunnel(id)) if id == "nobody"));
    }

    #[test]
    fn test_resolve_single_cookie() {
        let headers = headers_with_cookie("tunnel=abc");
        assert_eq!(resolve(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn test_resolve_among_other_cookies() {
        let headers = headers_with_cookie("theme=dark; tunnel=abc; lang=en");
        assert_eq!(resolve(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn test_resolve_missing_or_malformed() {
        assert_eq!(resolve(&HeaderMap::new()), None);
        assert_eq!(resolve(&headers_with_cookie("theme=dark")), None);
        assert_eq!(resolve(&headers_with_cookie("tunnel=")), None);
        assert_eq!(resolve(&headers_with_cookie("tunnel")), None);
        assert_eq!(resolve(&headers_with_cookie("garbage;;=;")), None);
    }

    #[test]
    fn test_resolve_does_not_match_prefixed_names() {
        let headers = headers_with_cookie("not-tunnel=abc");
        assert_eq!(resolve(&headers), None);
    }
}
