//! 请求凭证与客户端 IP 提取

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::{header, HeaderMap};

/// 按优先级提取请求携带的凭证:
/// Authorization: Bearer <cred> > Authorization: <cred> >
/// X-Auth-Token > 查询参数 token
pub fn extract_credential(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let auth = auth.trim();
        if let Some(bearer) = auth.strip_prefix("Bearer ") {
            return Some(bearer.trim().to_string());
        }
        if !auth.is_empty() {
            return Some(auth.to_string());
        }
    }
    if let Some(token) = headers.get("x-auth-token").and_then(|v| v.to_str().ok()) {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    query.get("token").filter(|t| !t.is_empty()).cloned()
}

/// 限流用的客户端标识:
/// X-Forwarded-For 第一段 > X-Real-IP > 对端地址
///
/// 这些头只用于本地限流, 不赋予其他信任。
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.1:5555".parse().unwrap()
    }

    #[test]
    fn test_credential_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert("x-auth-token", HeaderValue::from_static("def"));
        let mut query = HashMap::new();
        query.insert("token".to_string(), "ghi".to_string());

        assert_eq!(extract_credential(&headers, &query).as_deref(), Some("abc"));

        headers.remove(header::AUTHORIZATION);
        assert_eq!(extract_credential(&headers, &query).as_deref(), Some("def"));

        headers.remove("x-auth-token");
        assert_eq!(extract_credential(&headers, &query).as_deref(), Some("ghi"));

        query.clear();
        assert_eq!(extract_credential(&headers, &query), None);
    }

    #[test]
    fn test_bare_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc"));
        assert_eq!(
            extract_credential(&headers, &HashMap::new()).as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn test_client_ip_forwarded_first() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, peer()), "1.2.3.4");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, peer()), "9.9.9.9");

        assert_eq!(client_ip(&HeaderMap::new(), peer()), "10.0.0.1");
    }

    #[test]
    fn test_empty_forwarded_for_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(client_ip(&headers, peer()), "10.0.0.1");
    }
}
