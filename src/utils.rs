use axum::http::HeaderMap;
use std::net::IpAddr;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Current Unix time in seconds
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Extracts client IP address from HTTP request headers
///
/// Checks headers in order of priority:
/// 1. X-Forwarded-For (first IP in the chain, if present)
/// 2. X-Real-IP (single IP, if present)
/// 3. Falls back to provided direct IP (from connection)
///
/// # Security Note
/// X-Forwarded-For can be spoofed by clients, so it should only be trusted
/// if the request comes through a trusted proxy/load balancer.
pub fn extract_client_ip(headers: &HeaderMap, direct_ip: Option<IpAddr>) -> String {
    // "client, proxy1, proxy2" -> client
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    if let Some(ip) = forwarded {
        return normalize_ip(ip);
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    if let Some(ip) = real_ip {
        return normalize_ip(ip);
    }

    if let Some(ip) = direct_ip {
        return normalize_ip(ip);
    }

    "unknown".to_string()
}

/// `X-User-Id` header, if present and non-empty
pub fn extract_user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_USER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Normalizes IP address to string format (removes brackets for IPv6)
fn normalize_ip(ip: IpAddr) -> String {
    let ip_str = ip.to_string();
    ip_str
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}
