use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use headers::Header;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use time::format_description::well_known::Rfc3339;
use time::macros::offset;

use crate::errors::DavError;
use crate::DavResult;

/// HTTP methods supported by the engine, WebDAV methods included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DavMethod {
    Head,
    Get,
    Put,
    Options,
    PropFind,
    PropPatch,
    MkCol,
    Copy,
    Move,
    Delete,
    Report,
}

impl DavMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DavMethod::Head => "HEAD",
            DavMethod::Get => "GET",
            DavMethod::Put => "PUT",
            DavMethod::Options => "OPTIONS",
            DavMethod::PropFind => "PROPFIND",
            DavMethod::PropPatch => "PROPPATCH",
            DavMethod::MkCol => "MKCOL",
            DavMethod::Copy => "COPY",
            DavMethod::Move => "MOVE",
            DavMethod::Delete => "DELETE",
            DavMethod::Report => "REPORT",
        }
    }

    pub const ALL: [DavMethod; 11] = [
        DavMethod::Head,
        DavMethod::Get,
        DavMethod::Put,
        DavMethod::Options,
        DavMethod::PropFind,
        DavMethod::PropPatch,
        DavMethod::MkCol,
        DavMethod::Copy,
        DavMethod::Move,
        DavMethod::Delete,
        DavMethod::Report,
    ];
}

bitflags! {
    /// Set of allowed methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DavMethodSet: u32 {
        const HEAD = 0x0001;
        const GET = 0x0002;
        const PUT = 0x0004;
        const OPTIONS = 0x0008;
        const PROPFIND = 0x0010;
        const PROPPATCH = 0x0020;
        const MKCOL = 0x0040;
        const COPY = 0x0080;
        const MOVE = 0x0100;
        const DELETE = 0x0200;
        const REPORT = 0x0400;

        const HTTP_RO = Self::HEAD.bits() | Self::GET.bits() | Self::OPTIONS.bits();
        const HTTP_RW = Self::HTTP_RO.bits() | Self::PUT.bits();
        const WEBDAV_RO = Self::HTTP_RO.bits()
            | Self::PROPFIND.bits()
            | Self::REPORT.bits();
        const WEBDAV_RW = 0x07ff;
    }
}

impl DavMethodSet {
    pub fn from_method(method: DavMethod) -> DavMethodSet {
        match method {
            DavMethod::Head => DavMethodSet::HEAD,
            DavMethod::Get => DavMethodSet::GET,
            DavMethod::Put => DavMethodSet::PUT,
            DavMethod::Options => DavMethodSet::OPTIONS,
            DavMethod::PropFind => DavMethodSet::PROPFIND,
            DavMethod::PropPatch => DavMethodSet::PROPPATCH,
            DavMethod::MkCol => DavMethodSet::MKCOL,
            DavMethod::Copy => DavMethodSet::COPY,
            DavMethod::Move => DavMethodSet::MOVE,
            DavMethod::Delete => DavMethodSet::DELETE,
            DavMethod::Report => DavMethodSet::REPORT,
        }
    }

    pub fn contains_method(&self, method: DavMethod) -> bool {
        self.contains(DavMethodSet::from_method(method))
    }
}

// translate method into our own enum that has webdav methods as well.
pub fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    let m = match *m {
        http::Method::HEAD => DavMethod::Head,
        http::Method::GET => DavMethod::Get,
        http::Method::PUT => DavMethod::Put,
        http::Method::DELETE => DavMethod::Delete,
        http::Method::OPTIONS => DavMethod::Options,
        _ => match m.as_str() {
            "PROPFIND" => DavMethod::PropFind,
            "PROPPATCH" => DavMethod::PropPatch,
            "MKCOL" => DavMethod::MkCol,
            "COPY" => DavMethod::Copy,
            "MOVE" => DavMethod::Move,
            "REPORT" => DavMethod::Report,
            _ => {
                return Err(DavError::UnknownDavMethod);
            }
        },
    };
    Ok(m)
}

// Characters that need escaping in the path part of a URL.
const HREF_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'%')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|');

/// Strip leading/trailing slashes and collapse empty segments.
///
/// The engine identifies resources by these normalized relative paths;
/// the root collection is the empty string.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a normalized path into (parent, basename).
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Join a normalized path and a child name.
pub fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", path, name)
    }
}

/// Percent-decode and normalize the path of a request URI, stripping
/// the configured prefix. Dot segments are refused outright.
pub fn uri_to_path(uri: &http::Uri, prefix: &str) -> DavResult<String> {
    let raw = uri.path();
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| DavError::BadRequest("invalid percent-encoding in request path".into()))?;
    if decoded.split('/').any(|s| s == "." || s == "..") {
        return Err(DavError::BadRequest("dot segments not allowed".into()));
    }
    let path = match decoded.strip_prefix(prefix) {
        Some(rest) if prefix.is_empty() || rest.is_empty() || rest.starts_with('/') => rest,
        _ => return Err(DavError::NotFound),
    };
    Ok(normalize_path(path))
}

/// Build the href for a multi-status response entry. Collections get
/// a trailing slash.
pub fn href_for_path(prefix: &str, path: &str, is_collection: bool) -> String {
    let mut href = String::new();
    href.push_str(prefix);
    href.push('/');
    if !path.is_empty() {
        let encoded = path
            .split('/')
            .map(|seg| utf8_percent_encode(seg, HREF_ENCODE).to_string())
            .collect::<Vec<_>>()
            .join("/");
        href.push_str(&encoded);
        if is_collection {
            href.push('/');
        }
    }
    href
}

pub fn systemtime_to_offsetdatetime(t: SystemTime) -> time::OffsetDateTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(t) => {
            let tm = time::OffsetDateTime::from_unix_timestamp(t.as_secs() as i64).unwrap();
            tm.to_offset(offset!(UTC))
        }
        Err(_) => time::OffsetDateTime::UNIX_EPOCH.to_offset(offset!(UTC)),
    }
}

pub fn systemtime_to_httpdate(t: SystemTime) -> String {
    let d = headers::Date::from(t);
    let mut v = Vec::new();
    d.encode(&mut v);
    v[0].to_str().unwrap().to_owned()
}

pub fn systemtime_to_rfc3339(t: SystemTime) -> String {
    // 1996-12-19T16:39:57Z
    systemtime_to_offsetdatetime(t).format(&Rfc3339).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_rfc3339() {
        assert!(systemtime_to_rfc3339(UNIX_EPOCH) == "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_path("/foo/bar/"), "foo/bar");
        assert_eq!(normalize_path("//foo///bar"), "foo/bar");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_split_join() {
        assert_eq!(split_path("foo/bar/baz"), ("foo/bar", "baz"));
        assert_eq!(split_path("foo"), ("", "foo"));
        assert_eq!(join_path("", "foo"), "foo");
        assert_eq!(join_path("foo", "bar"), "foo/bar");
    }

    #[test]
    fn test_uri_to_path() {
        let uri: http::Uri = "/dir/hello%20world".parse().unwrap();
        assert_eq!(uri_to_path(&uri, "").unwrap(), "dir/hello world");
        let uri: http::Uri = "/dav/dir/".parse().unwrap();
        assert_eq!(uri_to_path(&uri, "/dav").unwrap(), "dir");
        let uri: http::Uri = "/dir/../etc".parse().unwrap();
        assert!(uri_to_path(&uri, "").is_err());
    }

    #[test]
    fn test_href() {
        assert_eq!(href_for_path("", "", true), "/");
        assert_eq!(href_for_path("", "a b", false), "/a%20b");
        assert_eq!(href_for_path("/dav", "dir", true), "/dav/dir/");
    }
}
