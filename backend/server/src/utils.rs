use std::net::{IpAddr, SocketAddr};

use axum::http::{
    HeaderMap,
    header::{AUTHORIZATION, HeaderName},
};

use crate::error::AppError;

const FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Token from `Authorization: Bearer <token>`.
///
/// A missing header means a first-time voter. A header that is present but not
/// a bearer token is rejected rather than silently minting a new identity.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AppError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };

    let value = value.to_str().map_err(|_| AppError::InvalidIdentity)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AppError::InvalidIdentity)?
        .trim();

    if token.is_empty() {
        return Ok(None);
    }

    Ok(Some(token))
}

/// Address the rate limit is keyed on.
///
/// Each trusted proxy appends the address it received the request from, so
/// with `trusted_hops` proxies the client is that many entries from the right.
/// Anything further left was written by the client and is ignored. Without
/// trusted proxies, or when the header is too short or unparsable, the socket
/// peer is used.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted_hops: usize) -> String {
    let peer_ip = peer.ip().to_string();

    if trusted_hops == 0 {
        return peer_ip;
    }

    let hops: Vec<&str> = headers
        .get_all(FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .collect();

    hops.len()
        .checked_sub(trusted_hops)
        .and_then(|index| hops[index].parse::<IpAddr>().ok())
        .map(|ip| ip.to_string())
        .unwrap_or(peer_ip)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn peer() -> SocketAddr {
        "198.51.100.9:4321".parse().unwrap()
    }

    fn forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers).unwrap(), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).unwrap(), Some("abc123"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert!(matches!(
            bearer_token(&headers),
            Err(AppError::InvalidIdentity)
        ));
    }

    #[test]
    fn test_forwarded_for_ignored_without_trusted_proxies() {
        assert_eq!(client_ip(&HeaderMap::new(), peer(), 0), "198.51.100.9");
        assert_eq!(
            client_ip(&forwarded("203.0.113.7"), peer(), 0),
            "198.51.100.9"
        );
    }

    #[test]
    fn test_forged_leftmost_hop_is_ignored() {
        let keys: Vec<String> = [
            "10.9.9.0, 203.0.113.7",
            "10.9.9.1, 203.0.113.7",
            "10.9.9.2, 203.0.113.7",
        ]
        .into_iter()
        .map(|value| client_ip(&forwarded(value), peer(), 1))
        .collect();

        assert_eq!(keys, vec!["203.0.113.7"; 3]);
    }

    #[test]
    fn test_client_ip_counts_hops_from_the_right() {
        let headers = forwarded("10.9.9.0, 203.0.113.7, 172.16.0.2");

        assert_eq!(client_ip(&headers, peer(), 1), "172.16.0.2");
        assert_eq!(client_ip(&headers, peer(), 2), "203.0.113.7");
    }

    #[test]
    fn test_short_or_garbled_header_falls_back_to_peer() {
        assert_eq!(client_ip(&HeaderMap::new(), peer(), 1), "198.51.100.9");
        assert_eq!(
            client_ip(&forwarded("203.0.113.7"), peer(), 2),
            "198.51.100.9"
        );
        assert_eq!(
            client_ip(&forwarded("not-an-ip"), peer(), 1),
            "198.51.100.9"
        );
    }
}
