//! Conditional request handling: `If-Match`, `If-None-Match`, the date
//! preconditions, and the WebDAV `If` header (RFC4918 §10.4).
//!
//! The `If` header is parsed into a list of [`IfCondition`]s, one per
//! parenthesized clause. State tokens start out invalid; the
//! `validate_tokens` event lets a lock system mark the ones it knows.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::davheaders::{self, normalize_etag};
use crate::errors::DavError;
use crate::event::Flow;
use crate::node::{node_etag, DavNode};
use crate::server::{DavContext, DavServer};
use crate::util::DavMethod;
use crate::DavResult;

lazy_static! {
    static ref IF_HEADER: regex::Regex = regex::Regex::new(
        r#"(?:<(?P<uri>[^>]*)>\s*)?\(\s*(?P<not>(?i:Not)\s+)?(?:<(?P<token>[^>]*)>\s*)?(?:\[(?P<etag>[^\]]*)\]\s*)?\)"#
    )
    .unwrap();
}

/// One state-token / etag term of an `If` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfToken {
    pub negate: bool,
    pub token: Option<String>,
    pub etag: Option<String>,
    /// Set by `validate_tokens` handlers; unknown tokens stay invalid.
    pub valid: bool,
}

/// One parenthesized clause, tied to a resource. `uri: None` targets
/// the request resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfCondition {
    pub uri: Option<String>,
    pub tokens: Vec<IfToken>,
}

/// Parse an `If` header value. Untagged clauses attach to the most
/// recently named resource, or to the request resource if none was
/// named yet. Clauses belonging to the same resource are alternatives:
/// the resource's precondition holds when any one of them matches.
pub fn parse_if_header(value: &str) -> Vec<IfCondition> {
    let mut conditions: Vec<IfCondition> = Vec::new();
    let mut current_uri: Option<String> = None;

    for caps in IF_HEADER.captures_iter(value) {
        if let Some(uri) = caps.name("uri") {
            current_uri = Some(uri.as_str().to_string());
        }
        let token = IfToken {
            negate: caps.name("not").is_some(),
            token: caps.name("token").map(|m| m.as_str().to_string()),
            etag: caps
                .name("etag")
                .map(|m| normalize_etag(m.as_str()))
                .filter(|etag| !etag.is_empty()),
            valid: false,
        };
        if token.token.is_none() && token.etag.is_none() {
            continue;
        }
        match conditions.iter_mut().find(|c| c.uri == current_uri) {
            Some(cond) => cond.tokens.push(token),
            None => conditions.push(IfCondition {
                uri: current_uri.clone(),
                tokens: vec![token],
            }),
        }
    }
    conditions
}

impl IfToken {
    /// Whether this term matches, given the resource's current etag.
    /// The token part must have been validated, the etag part must
    /// equal the live etag; negation flips the combined result.
    pub fn matches(&self, live_etag: Option<&str>) -> bool {
        let token_ok = self.token.is_none() || self.valid;
        let etag_ok = match &self.etag {
            None => true,
            Some(etag) => token_ok && live_etag == Some(etag.as_str()),
        };
        (token_ok && etag_ok) != self.negate
    }
}

fn unix_secs(t: SystemTime) -> Option<u64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

// HTTP dates have one-second granularity.
fn not_modified_since(node_mtime: Option<SystemTime>, header: SystemTime) -> bool {
    match (node_mtime.and_then(unix_secs), unix_secs(header)) {
        (Some(mtime), Some(since)) => mtime <= since,
        _ => false,
    }
}

async fn live_etag(server: &DavServer, path: &str) -> Option<String> {
    match server.tree().node_for_path(path).await {
        Ok(node) => node_etag(&*node),
        Err(_) => None,
    }
}

/// How the precondition chain left the request.
pub(crate) enum PreconditionOutcome {
    /// All checks passed, run the method handler.
    Proceed,
    /// Answer `304 Not Modified`, carrying the entity tag if the
    /// resource has one.
    NotModified(Option<String>),
}

/// Evaluate every conditional header on the request, in the order the
/// protocol requires. Precondition failures are errors; a cache
/// revalidation hit on GET/HEAD comes back as
/// [`PreconditionOutcome::NotModified`].
pub(crate) async fn check_preconditions(
    server: &DavServer,
    ctx: &mut DavContext,
) -> DavResult<PreconditionOutcome> {
    let node: Option<Arc<dyn DavNode>> = server.tree().node_for_path(&ctx.path).await.ok();
    let read_request = matches!(ctx.method, DavMethod::Get | DavMethod::Head);
    let mut if_none_match_present = false;

    if let Some(value) = ctx.headers.get("if-match").and_then(|v| v.to_str().ok()) {
        let node = node.as_ref().ok_or(DavError::PreconditionFailed(Some("If-Match")))?;
        if value.trim() != "*" {
            let etag = node_etag(&**node);
            let matched = etag
                .as_deref()
                .map(|etag| davheaders::etag_list(value).iter().any(|t| t == etag))
                .unwrap_or(false);
            if !matched {
                return Err(DavError::PreconditionFailed(Some("If-Match")));
            }
        }
    }

    if let Some(value) = ctx.headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
        if_none_match_present = true;
        if let Some(node) = node.as_ref() {
            let failed = if value.trim() == "*" {
                true
            } else {
                node_etag(&**node)
                    .as_deref()
                    .map(|etag| davheaders::etag_list(value).iter().any(|t| t == etag))
                    .unwrap_or(false)
            };
            if failed {
                if read_request {
                    return Ok(PreconditionOutcome::NotModified(node_etag(&**node)));
                }
                return Err(DavError::PreconditionFailed(Some("If-None-Match")));
            }
        }
    }

    // If-None-Match takes precedence over If-Modified-Since.
    if read_request && !if_none_match_present {
        if let Some(since) = ctx.headers.get("if-modified-since").and_then(davheaders::http_date) {
            if let Some(node) = node.as_ref() {
                if not_modified_since(node.last_modified(), since) {
                    return Ok(PreconditionOutcome::NotModified(node_etag(&**node)));
                }
            }
        }
    }

    if let Some(since) = ctx
        .headers
        .get("if-unmodified-since")
        .and_then(davheaders::http_date)
    {
        if let Some(node) = node.as_ref() {
            if !not_modified_since(node.last_modified(), since) {
                return Err(DavError::PreconditionFailed(Some("If-Unmodified-Since")));
            }
        }
    }

    let mut conditions = match ctx.headers.get("if").and_then(|v| v.to_str().ok()) {
        Some(value) => parse_if_header(value),
        None => Vec::new(),
    };
    if !conditions.is_empty() {
        for handler in server.events().validate_tokens.iter() {
            if handler(server, ctx, &mut conditions).await? == Flow::Handled {
                break;
            }
        }
        for condition in &conditions {
            let path = match &condition.uri {
                None => ctx.path.clone(),
                Some(uri) => server.resolve_href(uri)?,
            };
            let mut etag: Option<Option<String>> = None;
            let mut success = false;
            for token in &condition.tokens {
                // Fetch the etag lazily, once per resource.
                let live = if token.etag.is_some() {
                    if etag.is_none() {
                        etag = Some(live_etag(server, &path).await);
                    }
                    etag.as_ref().and_then(|e| e.as_deref())
                } else {
                    None
                };
                if token.matches(live) {
                    success = true;
                    break;
                }
            }
            if !success {
                return Err(DavError::PreconditionFailed(Some("If")));
            }
        }
    }

    Ok(PreconditionOutcome::Proceed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_single_token() {
        let conds = parse_if_header("(<opaquelocktoken:deadbeef>)");
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].uri, None);
        assert_eq!(
            conds[0].tokens[0].token.as_deref(),
            Some("opaquelocktoken:deadbeef")
        );
        assert!(!conds[0].tokens[0].negate);
        assert_eq!(conds[0].tokens[0].etag, None);
    }

    #[test]
    fn negated_token_and_etag() {
        let conds = parse_if_header(r#"(Not <urn:x> ["etag-1"])"#);
        assert_eq!(conds.len(), 1);
        let t = &conds[0].tokens[0];
        assert!(t.negate);
        assert_eq!(t.token.as_deref(), Some("urn:x"));
        assert_eq!(t.etag.as_deref(), Some("\"etag-1\""));
    }

    #[test]
    fn tagged_resources_group_clauses() {
        let conds = parse_if_header(
            r#"<http://example.org/a> (<urn:t1>) (<urn:t2>) </b> (["x"])"#,
        );
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].uri.as_deref(), Some("http://example.org/a"));
        assert_eq!(conds[0].tokens.len(), 2);
        assert_eq!(conds[1].uri.as_deref(), Some("/b"));
        assert_eq!(conds[1].tokens[0].etag.as_deref(), Some("\"x\""));
    }

    #[test]
    fn untagged_after_tagged_inherits_resource() {
        let conds = parse_if_header(r#"</a> (<urn:t1>) (Not <urn:t2>)"#);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].tokens.len(), 2);
    }

    #[test]
    fn empty_clause_is_dropped() {
        assert!(parse_if_header("()").is_empty());
        assert!(parse_if_header("garbage").is_empty());
    }

    #[test]
    fn token_match_logic() {
        let valid = IfToken {
            negate: false,
            token: Some("urn:t".to_string()),
            etag: None,
            valid: true,
        };
        assert!(valid.matches(None));

        let invalid = IfToken { valid: false, ..valid.clone() };
        assert!(!invalid.matches(None));

        let negated = IfToken { negate: true, ..invalid.clone() };
        assert!(negated.matches(None));

        let etag_only = IfToken {
            negate: false,
            token: None,
            etag: Some("\"a\"".to_string()),
            valid: false,
        };
        assert!(etag_only.matches(Some("\"a\"")));
        assert!(!etag_only.matches(Some("\"b\"")));
        assert!(!etag_only.matches(None));

        // Token must be valid for the etag part to count.
        let both = IfToken {
            negate: false,
            token: Some("urn:t".to_string()),
            etag: Some("\"a\"".to_string()),
            valid: false,
        };
        assert!(!both.matches(Some("\"a\"")));
    }

    #[test]
    fn second_granularity_comparison() {
        use std::time::Duration;
        let t = UNIX_EPOCH + Duration::from_millis(10_500);
        let header = UNIX_EPOCH + Duration::from_secs(10);
        // Sub-second difference rounds away.
        assert!(not_modified_since(Some(t), header));
        let later = UNIX_EPOCH + Duration::from_secs(11);
        assert!(!not_modified_since(Some(later), header));
    }
}
