//! Error taxonomy of the protocol engine.
//!
//! Every domain failure carries the HTTP status it renders as. Errors
//! propagate uncaught through the event chain up to the top-level
//! dispatch boundary, which turns them into a `{DAV:}error` document.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use http::StatusCode;
use xmltree::Element;

use crate::xml::{self, PropName};

pub type DavResult<T> = Result<T, DavError>;

#[derive(Debug)]
pub enum DavError {
    BadRequest(String),
    NotAuthenticated,
    PaymentRequired,
    Forbidden(String),
    NotFound,
    MethodNotAllowed,
    Conflict(String),
    /// Optionally names the conditional header that failed.
    PreconditionFailed(Option<&'static str>),
    LengthRequired,
    Locked,
    UnsupportedMediaType,
    RequestedRangeNotSatisfiable,
    ReportNotSupported,
    InvalidResourceType,
    InvalidSyncToken,
    TooManyMatches,
    NotImplemented(String),
    ServiceUnavailable,
    InsufficientStorage,
    UnknownDavMethod,
    XmlParseError(String),
    IoError(io::Error),
    Status(StatusCode),
    Internal(String),
}

impl DavError {
    pub fn statuscode(&self) -> StatusCode {
        use DavError::*;
        match self {
            BadRequest(_) => StatusCode::BAD_REQUEST,
            NotAuthenticated => StatusCode::UNAUTHORIZED,
            PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Forbidden(_) => StatusCode::FORBIDDEN,
            NotFound => StatusCode::NOT_FOUND,
            MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Conflict(_) => StatusCode::CONFLICT,
            PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            LengthRequired => StatusCode::LENGTH_REQUIRED,
            Locked => StatusCode::LOCKED,
            UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RequestedRangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ReportNotSupported => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            InvalidResourceType => StatusCode::FORBIDDEN,
            InvalidSyncToken => StatusCode::FORBIDDEN,
            TooManyMatches => StatusCode::FORBIDDEN,
            NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            XmlParseError(_) => StatusCode::BAD_REQUEST,
            IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Status(sc) => *sc,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Extra response headers contributed by this error.
    pub fn http_headers(&self) -> Vec<(&'static str, String)> {
        match self {
            DavError::PreconditionFailed(Some(header)) => {
                vec![("X-Sabre-Ew-Gross", format!("Failed precondition: {}", header))]
            }
            _ => Vec::new(),
        }
    }

    /// Exception-specific child elements of the `{DAV:}error` body.
    pub fn serialize(&self) -> Option<Element> {
        match self {
            DavError::InvalidResourceType => {
                Some(xml::empty_element(&PropName::dav("valid-resourcetype")))
            }
            DavError::InvalidSyncToken => {
                Some(xml::empty_element(&PropName::dav("valid-sync-token")))
            }
            DavError::ReportNotSupported => {
                Some(xml::empty_element(&PropName::dav("supported-report")))
            }
            DavError::TooManyMatches => {
                Some(xml::empty_element(&PropName::dav("number-of-matches-within-limits")))
            }
            _ => None,
        }
    }

    /// Short symbolic name, used in the error body.
    pub fn name(&self) -> &'static str {
        use DavError::*;
        match self {
            BadRequest(_) => "BadRequest",
            NotAuthenticated => "NotAuthenticated",
            PaymentRequired => "PaymentRequired",
            Forbidden(_) => "Forbidden",
            NotFound => "NotFound",
            MethodNotAllowed => "MethodNotAllowed",
            Conflict(_) => "Conflict",
            PreconditionFailed(_) => "PreconditionFailed",
            LengthRequired => "LengthRequired",
            Locked => "Locked",
            UnsupportedMediaType => "UnsupportedMediaType",
            RequestedRangeNotSatisfiable => "RequestedRangeNotSatisfiable",
            ReportNotSupported => "ReportNotSupported",
            InvalidResourceType => "InvalidResourceType",
            InvalidSyncToken => "InvalidSyncToken",
            TooManyMatches => "TooManyMatches",
            NotImplemented(_) => "NotImplemented",
            ServiceUnavailable => "ServiceUnavailable",
            InsufficientStorage => "InsufficientStorage",
            UnknownDavMethod => "NotImplemented",
            XmlParseError(_) => "BadRequest",
            IoError(_) => "InternalServerError",
            Status(_) => "HttpError",
            Internal(_) => "InternalServerError",
        }
    }

    /// Whether the connection should be closed after this error.
    pub fn must_close(&self) -> bool {
        matches!(
            self,
            DavError::UnknownDavMethod | DavError::MethodNotAllowed | DavError::LengthRequired
        )
    }
}

impl fmt::Display for DavError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DavError::*;
        match self {
            BadRequest(msg) | Forbidden(msg) | Conflict(msg) | NotImplemented(msg)
            | XmlParseError(msg) | Internal(msg) => {
                if msg.is_empty() {
                    write!(f, "{}", self.name())
                } else {
                    write!(f, "{}", msg)
                }
            }
            PreconditionFailed(Some(h)) => write!(f, "precondition failed: {}", h),
            IoError(e) => write!(f, "{}", e),
            Status(sc) => write!(f, "{}", sc),
            _ => write!(f, "{}", self.name()),
        }
    }
}

impl StdError for DavError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            DavError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => DavError::NotFound,
            io::ErrorKind::PermissionDenied => DavError::Forbidden(String::new()),
            _ => DavError::IoError(e),
        }
    }
}

impl From<StatusCode> for DavError {
    fn from(sc: StatusCode) -> Self {
        DavError::Status(sc)
    }
}

impl From<xmltree::ParseError> for DavError {
    fn from(e: xmltree::ParseError) -> Self {
        DavError::XmlParseError(e.to_string())
    }
}

impl From<::xml::writer::Error> for DavError {
    fn from(e: ::xml::writer::Error) -> Self {
        DavError::Internal(format!("xml writer: {}", e))
    }
}
