use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{Response, StatusCode};

use crate::body::Body;
use crate::errors::DavError;
use crate::event::Flow;
use crate::server::{DavContext, DavServer};
use crate::util::{href_for_path, split_path};
use crate::xml::{self, MkCol, MultiStatus, PropName, NS_DAV};
use crate::DavResult;

// RFC5689 extended MKCOL body. A plain MKCOL has no body at all; a
// body must carry an explicit resourcetype.
fn parse_mkcol(data: &[u8]) -> DavResult<MkCol> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(MkCol::plain_collection());
    }
    let root = xml::expect("mkcol", data)?;
    let mut mkcol = MkCol::default();
    let mut saw_resourcetype = false;
    for set in xml::child_elements(&root) {
        if set.name != "set" || set.namespace.as_deref() != Some(NS_DAV) {
            continue;
        }
        for prop in xml::child_elements(set) {
            if prop.name != "prop" || prop.namespace.as_deref() != Some(NS_DAV) {
                continue;
            }
            for value in xml::child_elements(prop) {
                let name = PropName::of_element(value);
                if name == PropName::dav("resourcetype") {
                    saw_resourcetype = true;
                    mkcol.resource_type =
                        xml::child_elements(value).map(PropName::of_element).collect();
                } else {
                    mkcol.properties.insert(name, value.clone());
                }
            }
        }
    }
    if !saw_resourcetype {
        return Err(DavError::BadRequest(
            "mkcol body without a {DAV:}resourcetype property".to_string(),
        ));
    }
    Ok(mkcol)
}

fn is_xml_content_type(ct: &str) -> bool {
    let ct = ct.split(';').next().unwrap_or("").trim();
    ct.eq_ignore_ascii_case("application/xml") || ct.eq_ignore_ascii_case("text/xml")
}

pub(crate) fn http_mkcol<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        if !ctx.body.data().is_empty() {
            let ct = ctx
                .headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/xml");
            if !is_xml_content_type(ct) {
                return Err(DavError::UnsupportedMediaType);
            }
        }
        let mkcol = parse_mkcol(ctx.body.data())?;

        if server.tree().node_exists(&ctx.path).await? {
            return Err(DavError::MethodNotAllowed);
        }
        let (parent_path, _) = split_path(&ctx.path);
        let parent = server
            .tree()
            .node_for_path(parent_path)
            .await
            .map_err(|_| DavError::Conflict("parent collection does not exist".to_string()))?;
        if parent.as_collection().is_none() {
            return Err(DavError::Conflict("parent node is not a collection".to_string()));
        }

        match server.create_collection(&ctx.path, mkcol).await? {
            None => {
                let res = Response::builder()
                    .status(StatusCode::CREATED)
                    .header("Content-Length", "0")
                    .body(Body::empty())
                    .unwrap_or_default();
                ctx.respond(res);
            }
            Some(pp) => {
                // Created, but some of the requested properties failed.
                let href = href_for_path(server.prefix(), &ctx.path, true);
                let mut ms = MultiStatus::new()?;
                ms.add_response(&href, pp.result_for_multi_status())?;
                let body = ms.finish()?;
                let res = Response::builder()
                    .status(StatusCode::MULTI_STATUS)
                    .header("Content-Type", "application/xml; charset=utf-8")
                    .body(Body::from(body))
                    .unwrap_or_default();
                ctx.respond(res);
            }
        }
        Ok(Flow::Handled)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_extended_bodies() {
        let mkcol = parse_mkcol(b"").unwrap();
        assert!(mkcol.is_plain_collection());

        let body = br#"<?xml version="1.0"?>
            <D:mkcol xmlns:D="DAV:" xmlns:Z="urn:example">
              <D:set><D:prop>
                <D:resourcetype><D:collection/><Z:special/></D:resourcetype>
                <Z:flavor>blue</Z:flavor>
              </D:prop></D:set>
            </D:mkcol>"#;
        let mkcol = parse_mkcol(body).unwrap();
        assert!(!mkcol.is_plain_collection());
        assert_eq!(mkcol.resource_type.len(), 2);
        assert!(mkcol
            .properties
            .contains_key(&PropName::new("urn:example", "flavor")));
    }

    #[test]
    fn body_without_resourcetype_is_rejected() {
        let body = br#"<?xml version="1.0"?>
            <D:mkcol xmlns:D="DAV:">
              <D:set><D:prop><D:displayname>x</D:displayname></D:prop></D:set>
            </D:mkcol>"#;
        assert!(parse_mkcol(body).is_err());
    }
}
