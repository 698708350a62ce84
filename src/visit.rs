//! What the request layer hands the store about a visitor.

use std::net::SocketAddr;

use http::HeaderMap;

use crate::models::{NewClick, SourceType};

pub const UNKNOWN: &str = "unknown";

/// Client metadata pulled from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
    /// Empty for direct visits.
    pub referrer: String,
}

impl ClientInfo {
    pub fn from_headers(headers: &HeaderMap, addr: Option<SocketAddr>) -> Self {
        Self {
            ip: extract_ip(headers, addr).unwrap_or_else(|| UNKNOWN.to_owned()),
            user_agent: header_str(headers, "user-agent")
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN)
                .to_owned(),
            referrer: header_str(headers, "referer").unwrap_or("").trim().to_owned(),
        }
    }

    /// The click to record for this visitor.
    pub fn click_for(&self, short_code: &str, via_qr: bool) -> NewClick {
        NewClick {
            short_code: short_code.to_owned(),
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            referrer: self.referrer.clone(),
            source_type: SourceType::classify(via_qr, &self.referrer),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Client IP: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// socket address.
fn extract_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> Option<String> {
    // X-Forwarded-For can be a comma-separated list; take the first entry.
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(ip) = xff.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_owned());
            }
        }
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip").map(str::trim) {
        if !real_ip.is_empty() {
            return Some(real_ip.to_owned());
        }
    }

    addr.map(|a| a.ip().to_string())
}
