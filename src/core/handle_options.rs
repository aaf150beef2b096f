use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use headers::HeaderMapExt;
use http::Response;

use crate::body::Body;
use crate::event::Flow;
use crate::server::{DavContext, DavServer};
use crate::DavResult;

pub(crate) fn http_options<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();

        let dav = server.dav_features().join(", ");
        h.insert("DAV", dav.parse().map_err(|_| crate::errors::DavError::Internal("DAV header".into()))?);
        h.insert("MS-Author-Via", http::HeaderValue::from_static("DAV"));
        h.insert("Accept-Ranges", http::HeaderValue::from_static("bytes"));
        h.typed_insert(headers::ContentLength(0));

        let allow = server.allowed_methods().join(", ");
        if let Ok(value) = allow.parse() {
            h.insert("Allow", value);
        }

        ctx.respond(res);
        Ok(Flow::Handled)
    }
    .boxed()
}
