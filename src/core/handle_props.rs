//! PROPFIND and PROPPATCH, plus the property event handlers that
//! resolve the live `DAV:` properties and route the rest to the node.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{Response, StatusCode};
use xmltree::XMLNode;

use crate::body::Body;
use crate::davheaders::{self, Depth};
use crate::errors::DavError;
use crate::event::Flow;
use crate::node::DavNode;
use crate::propfind::{PropFind, PropFindType};
use crate::proppatch::{PatchCallback, PatchResult, PropPatch};
use crate::server::{DavContext, DavServer};
use crate::util::{href_for_path, systemtime_to_httpdate, systemtime_to_rfc3339};
use crate::xml::{self, MultiStatus, PropName, NS_CALENDARSERVER, NS_DAV};
use crate::DavResult;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

fn parse_propfind(data: &[u8]) -> DavResult<(PropFindType, Vec<PropName>)> {
    // An empty body means allprop.
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok((PropFindType::AllProps, Vec::new()));
    }
    let root = xml::expect("propfind", data)?;
    for child in xml::child_elements(&root) {
        if child.namespace.as_deref() != Some(NS_DAV) {
            continue;
        }
        match child.name.as_str() {
            "allprop" => return Ok((PropFindType::AllProps, Vec::new())),
            "propname" => return Ok((PropFindType::PropName, Vec::new())),
            "prop" => {
                let names = xml::child_elements(child).map(PropName::of_element).collect();
                return Ok((PropFindType::Normal, names));
            }
            _ => {}
        }
    }
    Err(DavError::XmlParseError(
        "propfind body without prop, allprop or propname".to_string(),
    ))
}

pub(crate) fn http_propfind<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let depth = davheaders::typed_get::<Depth>(&ctx.headers).unwrap_or(Depth::Infinity);
        let depth = if depth == Depth::Infinity && !server.propfind_depth_infinity() {
            Depth::One
        } else {
            depth
        };

        let (request_type, names) = parse_propfind(ctx.body.data())?;
        let propfind = PropFind::new(ctx.path.clone(), request_type, names, depth);
        let results = server.get_properties_for_path(&ctx.path, &propfind).await?;
        // Prefer: return=minimal is acknowledged via Vary only; the
        // multi-status always lists the 404 properties.
        let mut ms = MultiStatus::new()?;
        let mut content_location = None;
        for (i, (is_collection, pf)) in results.iter().enumerate() {
            let href = href_for_path(server.prefix(), pf.path(), *is_collection);
            if i == 0 && *is_collection && !ctx.uri.path().ends_with('/') {
                content_location = Some(href.clone());
            }
            ms.add_response(&href, pf.result_for_multi_status())?;
        }
        let body = ms.finish()?;

        let mut res = Response::builder()
            .status(StatusCode::MULTI_STATUS)
            .header("Content-Type", XML_CONTENT_TYPE)
            .header("Vary", "Brief,Prefer");
        if let Some(loc) = content_location {
            res = res.header("Content-Location", loc);
        }
        ctx.respond(res.body(Body::from(body)).unwrap_or_default());
        Ok(Flow::Handled)
    }
    .boxed()
}

fn parse_proppatch(data: &[u8]) -> DavResult<HashMap<PropName, Option<xmltree::Element>>> {
    let root = xml::expect("propertyupdate", data)?;
    let mut mutations = HashMap::new();
    for child in xml::child_elements(&root) {
        if child.namespace.as_deref() != Some(NS_DAV) {
            continue;
        }
        let is_set = match child.name.as_str() {
            "set" => true,
            "remove" => false,
            _ => continue,
        };
        for prop in xml::child_elements(child) {
            if prop.name != "prop" || prop.namespace.as_deref() != Some(NS_DAV) {
                continue;
            }
            for value in xml::child_elements(prop) {
                let name = PropName::of_element(value);
                let value = if is_set { Some(value.clone()) } else { None };
                mutations.insert(name, value);
            }
        }
    }
    Ok(mutations)
}

pub(crate) fn http_proppatch<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let node = server.tree().node_for_path(&ctx.path).await?;
        let mutations = parse_proppatch(ctx.body.data())?;
        let pp = server.update_properties(&ctx.path, mutations).await?;

        let ok = pp
            .result()
            .values()
            .all(|status| !status.is_client_error() && !status.is_server_error());

        if ok && davheaders::prefer_minimal(&ctx.headers) {
            let res = Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header("Content-Length", "0")
                .header("Vary", "Brief,Prefer")
                .body(Body::empty())
                .unwrap_or_default();
            ctx.respond(res);
            return Ok(Flow::Handled);
        }

        let href = href_for_path(server.prefix(), &ctx.path, node.as_collection().is_some());
        let mut ms = MultiStatus::new()?;
        ms.add_response(&href, pp.result_for_multi_status())?;
        let body = ms.finish()?;

        let res = Response::builder()
            .status(StatusCode::MULTI_STATUS)
            .header("Content-Type", XML_CONTENT_TYPE)
            .header("Vary", "Brief,Prefer")
            .body(Body::from(body))
            .unwrap_or_default();
        ctx.respond(res);
        Ok(Flow::Handled)
    }
    .boxed()
}

// The live properties every backend gets for free.
pub(crate) fn prop_find_live<'a>(
    server: &'a DavServer,
    pf: &'a mut PropFind,
    node: &'a Arc<dyn DavNode>,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let resourcetype = PropName::dav("resourcetype");
        pf.handle(&resourcetype, || {
            let mut elem = xml::empty_element(&resourcetype);
            if node.as_collection().is_some() {
                elem.children
                    .push(XMLNode::Element(xml::empty_element(&PropName::dav("collection"))));
            }
            Some(elem)
        });

        let getlastmodified = PropName::dav("getlastmodified");
        pf.handle(&getlastmodified, || {
            node.last_modified()
                .map(|mtime| xml::text_element(&getlastmodified, systemtime_to_httpdate(mtime)))
        });

        let creationdate = PropName::dav("creationdate");
        pf.handle(&creationdate, || {
            node.created()
                .map(|t| xml::text_element(&creationdate, systemtime_to_rfc3339(t)))
        });

        if let Some(file) = node.as_file() {
            let getcontentlength = PropName::dav("getcontentlength");
            pf.handle(&getcontentlength, || {
                file.size()
                    .map(|size| xml::text_element(&getcontentlength, size.to_string()))
            });
            let getetag = PropName::dav("getetag");
            pf.handle(&getetag, || {
                file.etag().map(|etag| xml::text_element(&getetag, etag))
            });
            let getcontenttype = PropName::dav("getcontenttype");
            pf.handle(&getcontenttype, || {
                file.content_type()
                    .map(|ct| xml::text_element(&getcontenttype, ct))
            });
        }

        let quota_used = PropName::dav("quota-used-bytes");
        let quota_available = PropName::dav("quota-available-bytes");
        let wants_quota = pf.status(&quota_used) == Some(StatusCode::NOT_FOUND)
            || pf.status(&quota_available) == Some(StatusCode::NOT_FOUND);
        if wants_quota {
            if let Some(quota) = node.as_quota() {
                // One backend call answers both properties.
                let (used, available) = quota.quota_info().await?;
                pf.handle(&quota_used, || {
                    Some(xml::text_element(&quota_used, used.to_string()))
                });
                pf.handle(&quota_available, || {
                    available.map(|avail| xml::text_element(&quota_available, avail.to_string()))
                });
            }
        }

        let report_set = PropName::dav("supported-report-set");
        pf.handle(&report_set, || {
            let mut set = xml::empty_element(&report_set);
            for report in server.supported_reports() {
                let mut supported = xml::empty_element(&PropName::dav("supported-report"));
                let mut wrapper = xml::empty_element(&PropName::dav("report"));
                wrapper
                    .children
                    .push(XMLNode::Element(xml::empty_element(&report)));
                supported.children.push(XMLNode::Element(wrapper));
                set.children.push(XMLNode::Element(supported));
            }
            Some(set)
        });

        let method_set = PropName::dav("supported-method-set");
        pf.handle(&method_set, || {
            let mut set = xml::empty_element(&method_set);
            for method in server.allowed_methods() {
                let mut supported = xml::empty_element(&PropName::dav("supported-method"));
                supported
                    .attributes
                    .insert("name".to_string(), method.to_string());
                set.children.push(XMLNode::Element(supported));
            }
            Some(set)
        });

        Ok(Flow::Continue)
    }
    .boxed()
}

// Everything still unresolved is offered to the node's own property
// storage in a single batch.
pub(crate) fn prop_find_node<'a>(
    _server: &'a DavServer,
    pf: &'a mut PropFind,
    node: &'a Arc<dyn DavNode>,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        if let Some(props) = node.as_properties() {
            let names = pf.load_404_properties();
            if !names.is_empty() {
                let found = props.properties(&names).await?;
                for (name, value) in found {
                    pf.set(&name, Some(value), None);
                }
            }
        }
        Ok(Flow::Continue)
    }
    .boxed()
}

// Derived properties that depend on the outcome of the earlier passes.
pub(crate) fn prop_find_late<'a>(
    _server: &'a DavServer,
    pf: &'a mut PropFind,
    _node: &'a Arc<dyn DavNode>,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        // CalendarServer clients ask for getctag; it mirrors sync-token.
        let getctag = PropName::new(NS_CALENDARSERVER, "getctag");
        if pf.status(&getctag) == Some(StatusCode::NOT_FOUND) {
            let token = pf
                .get(&PropName::dav("sync-token"))
                .and_then(xml::element_text);
            if let Some(token) = token {
                pf.set(&getctag, Some(xml::text_element(&getctag, token)), None);
            }
        }
        Ok(Flow::Continue)
    }
    .boxed()
}

// Refuse writes to the protected live properties before the node
// handler can claim them.
pub(crate) fn prop_patch_protected<'a>(
    server: &'a DavServer,
    pp: &'a mut PropPatch,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        for name in server.protected_properties() {
            if pp.mutations().contains_key(name) {
                pp.set_result_code(name, StatusCode::FORBIDDEN);
            }
        }
        Ok(Flow::Continue)
    }
    .boxed()
}

// Hand whatever is left to the node's property storage.
pub(crate) fn prop_patch_node<'a>(
    server: &'a DavServer,
    pp: &'a mut PropPatch,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let node = server.tree().node_for_path(pp.path()).await?;
        if node.as_properties().is_none() {
            return Ok(Flow::Continue);
        }
        pp.handle_remaining(PatchCallback::Multi(Box::new(move |mutations| {
            async move {
                let props = node.as_properties().ok_or_else(|| {
                    DavError::Internal("node lost its property capability".to_string())
                })?;
                let ok = props
                    .patch_properties(mutations.into_iter().collect())
                    .await?;
                Ok(PatchResult::Ok(ok))
            }
            .boxed()
        })));
        Ok(Flow::Continue)
    }
    .boxed()
}
