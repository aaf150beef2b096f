//! Typed parsers for the WebDAV request headers the engine consumes.

use headers::{self, Header, HeaderMapExt};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::SystemTime;

use crate::errors::DavError;
use crate::DavResult;

lazy_static! {
    static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    static ref X_EXPECTED_ENTITY_LENGTH: HeaderName =
        HeaderName::from_static("x-expected-entity-length");
}

/// The `Depth` request header (RFC4918 §10.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    /// One level further down. Infinity stays infinity.
    pub fn decrement(self) -> Depth {
        match self {
            Depth::Zero | Depth::One => Depth::Zero,
            Depth::Infinity => Depth::Infinity,
        }
    }
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.to_str().map(str::trim) {
            Ok("0") => Ok(Depth::Zero),
            Ok("1") => Ok(Depth::One),
            Ok(s) if s.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(s)));
    }
}

/// The raw `Destination` header. Resolution against the server prefix
/// happens in the dispatcher.
#[derive(Debug, Clone)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(Destination(s.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(v) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(v));
        }
    }
}

/// `X-Expected-Entity-Length`, sent by macOS Finder on chunked PUTs.
#[derive(Debug, Clone, Copy)]
pub struct XExpectedEntityLength(pub u64);

impl Header for XExpectedEntityLength {
    fn name() -> &'static HeaderName {
        &X_EXPECTED_ENTITY_LENGTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(XExpectedEntityLength)
            .ok_or_else(headers::Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(v) = HeaderValue::from_str(&self.0.to_string()) {
            values.extend(std::iter::once(v));
        }
    }
}

/// Parse the `Overwrite` header: `T`/`F`, defaulting to `T` when absent.
/// Any other value is a client error.
pub fn overwrite(headers: &HeaderMap) -> DavResult<bool> {
    match headers.get("overwrite") {
        None => Ok(true),
        Some(value) => match value.to_str().map(str::trim) {
            Ok(s) if s.eq_ignore_ascii_case("t") => Ok(true),
            Ok(s) if s.eq_ignore_ascii_case("f") => Ok(false),
            _ => Err(DavError::BadRequest(
                "The HTTP Overwrite header should be either T or F".to_string(),
            )),
        },
    }
}

/// Normalize an entity tag for comparison, tolerating clients that
/// escape the quotes (`\"etag\"` means the same as `"etag"`).
pub fn normalize_etag(tag: &str) -> String {
    tag.trim().replace("\\\"", "\"")
}

/// Split an `If-Match`/`If-None-Match` style header into etags.
pub fn etag_list(value: &str) -> Vec<String> {
    value.split(',').map(normalize_etag).collect()
}

/// A single byte range from a `Range: bytes=start-end` header.
///
/// Both bounds are optional: `start-` is a prefix range, `-count` a
/// suffix range. Anything more complicated (multiple ranges, other
/// units) is ignored, which simply disables partial responses.
pub fn byte_range(headers: &HeaderMap) -> Option<(Option<u64>, Option<u64>)> {
    let value = headers.get("range")?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let mut parts = spec.splitn(2, '-');
    let start = parts.next()?.trim();
    let end = parts.next()?.trim();
    let start = if start.is_empty() {
        None
    } else {
        Some(start.parse::<u64>().ok()?)
    };
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    if start.is_none() && end.is_none() {
        return None;
    }
    Some((start, end))
}

/// The `If-Range` header: either an entity tag or an HTTP date.
#[derive(Debug, Clone)]
pub enum IfRange {
    ETag(String),
    Date(SystemTime),
}

pub fn if_range(headers: &HeaderMap) -> Option<IfRange> {
    let value = headers.get("if-range")?;
    let s = value.to_str().ok()?.trim();
    if s.starts_with('"') || s.starts_with("W/") || s.starts_with("\\\"") {
        return Some(IfRange::ETag(normalize_etag(s)));
    }
    let mut once = std::iter::once(value);
    headers::Date::decode(&mut once)
        .ok()
        .map(|d| IfRange::Date(d.into()))
}

/// Parse an HTTP date carried in a non-standard slot.
pub fn http_date(value: &HeaderValue) -> Option<SystemTime> {
    let mut once = std::iter::once(value);
    headers::Date::decode(&mut once).ok().map(|d| d.into())
}

/// `Prefer: return=minimal`, with the legacy `Brief: t` fallback.
pub fn prefer_minimal(headers: &HeaderMap) -> bool {
    if let Some(value) = headers.get("prefer") {
        if let Ok(s) = value.to_str() {
            if s.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("return=minimal"))
            {
                return true;
            }
        }
    }
    matches!(
        headers.get("brief").and_then(|v| v.to_str().ok()),
        Some(s) if s.trim().eq_ignore_ascii_case("t")
    )
}

/// Typed get on a header map, shared helper for the handlers.
pub fn typed_get<H: Header>(headers: &HeaderMap) -> Option<H> {
    headers.typed_get::<H>()
}
