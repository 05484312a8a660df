use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, RETRY_AFTER};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::Error;

/// Engine and promise state share plain mutexes; a panic mid-settlement
/// must not wedge every later caller, so poisoning is ignored.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn normalize_method(method: &str) -> Result<Method, Error> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        "TRACE" => Ok(Method::TRACE),
        "CONNECT" => Ok(Method::CONNECT),
        _ => Err(Error::InvalidMethod {
            method: method.to_owned(),
        }),
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let trimmed_base = base_url.trim_end_matches('/');
    let trimmed_path = path.trim_start_matches('/');
    if trimmed_base.is_empty() {
        return trimmed_path.to_owned();
    }
    if trimmed_path.is_empty() {
        return trimmed_base.to_owned();
    }
    format!("{trimmed_base}/{trimmed_path}")
}

pub(crate) fn is_absolute_url(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

pub(crate) fn effective_port(uri: &Uri) -> Option<u16> {
    if let Some(port) = uri.port_u16() {
        return Some(port);
    }
    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => Some(443),
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => Some(80),
        _ => None,
    }
}

/// Pool bucket key for a transfer handle: lowercased host plus effective
/// port, so handles carrying one origin's connection state never serve
/// another origin.
pub(crate) fn host_key(uri: &Uri) -> Option<String> {
    let host = uri.host()?.to_ascii_lowercase();
    match effective_port(uri) {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host),
    }
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let header_text = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = header_text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let retry_at = httpdate::parse_http_date(header_text).ok()?;
    Some(retry_at.duration_since(now).unwrap_or(Duration::ZERO))
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> Method {
    let downgrade = status == StatusCode::SEE_OTHER
        || (*method == Method::POST
            && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND));
    if downgrade {
        Method::GET
    } else {
        method.clone()
    }
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    let location = headers.get(LOCATION)?;
    Some(location.to_str().ok()?.to_owned())
}

pub(crate) fn same_origin(left: &Uri, right: &Uri) -> bool {
    let schemes_match = match (left.scheme_str(), right.scheme_str()) {
        (Some(left_scheme), Some(right_scheme)) => left_scheme.eq_ignore_ascii_case(right_scheme),
        _ => false,
    };
    let hosts_match = match (left.host(), right.host()) {
        (Some(left_host), Some(right_host)) => left_host.eq_ignore_ascii_case(right_host),
        _ => false,
    };
    schemes_match && hosts_match && effective_port(left) == effective_port(right)
}

fn uri_carries_userinfo(uri: &Uri) -> bool {
    uri.authority()
        .is_some_and(|authority| authority.as_str().contains('@'))
}

/// Resolves a Location header against the uri that produced it. Targets
/// outside http(s) or carrying userinfo are refused; the userinfo check
/// repeats after reparsing because the two parsers can disagree on where
/// the authority ends.
pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let current = url::Url::parse(&current_uri.to_string()).ok()?;
    let target = current.join(location).ok()?;
    if !matches!(target.scheme(), "http" | "https") {
        return None;
    }
    if !target.username().is_empty() || target.password().is_some() {
        return None;
    }
    let reparsed: Uri = target.as_str().parse().ok()?;
    if uri_carries_userinfo(&reparsed) {
        return None;
    }
    Some(reparsed)
}

pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut HeaderMap,
    downgraded_to_get: bool,
    crossed_origin: bool,
) {
    if downgraded_to_get {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if crossed_origin {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }
}
