use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use http::StatusCode;

use crate::davheaders::{self, XExpectedEntityLength};
use crate::errors::DavError;
use crate::event::Flow;
use crate::node::FileBody;
use crate::server::{DavContext, DavServer, RequestBody, WriteOutcome};
use crate::util::split_path;
use crate::DavResult;

pub(crate) fn http_put<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        // Partial updates are not supported.
        if ctx.headers.contains_key("content-range") {
            return Err(DavError::BadRequest(
                "Content-Range on PUT is not allowed".to_string(),
            ));
        }

        let exists = server.tree().node_exists(&ctx.path).await?;
        if exists {
            let node = server.tree().node_for_path(&ctx.path).await?;
            if node.as_collection().is_some() {
                return Err(DavError::Conflict("PUT is not allowed on a collection".to_string()));
            }
        } else {
            let (parent, _) = split_path(&ctx.path);
            let parent = server
                .tree()
                .node_for_path(parent)
                .await
                .map_err(|_| DavError::Conflict("parent collection does not exist".to_string()))?;
            if parent.as_collection().is_none() {
                return Err(DavError::Conflict("parent node is not a collection".to_string()));
            }
        }

        let mut stream = match ctx.body.take() {
            RequestBody::Stream(body) => body,
            _ => crate::body::Body::empty(),
        };

        // Look at the first non-empty chunk before touching the backend.
        let mut first = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.is_empty() {
                first = Some(chunk);
                break;
            }
        }

        // Intercepting the macOS Finder problem of 0-length PUT requests
        // that announce their real size out of band. Storing the empty
        // body would destroy the file the Finder is about to upload.
        if first.is_none() {
            if let Some(XExpectedEntityLength(expected)) =
                davheaders::typed_get::<XExpectedEntityLength>(&ctx.headers)
            {
                if expected > 0 {
                    return Err(DavError::Forbidden(
                        "PUT with 0-length body while X-Expected-Entity-Length is set".to_string(),
                    ));
                }
            }
        }

        let data = FileBody::Stream(Box::pin(
            futures_util::stream::iter(first.map(Ok)).chain(stream),
        ));

        let outcome = if exists {
            server.update_file(&ctx.path, data).await?
        } else {
            server.create_file(&ctx.path, data).await?
        };

        match outcome {
            WriteOutcome::Vetoed => {
                if ctx.response.is_none() {
                    return Err(DavError::Forbidden("the file write was blocked".to_string()));
                }
            }
            WriteOutcome::Written { etag } => {
                let status = if exists {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::CREATED
                };
                let mut res = http::Response::builder()
                    .status(status)
                    .header("Content-Length", "0");
                if let Some(etag) = etag {
                    res = res.header("ETag", etag);
                }
                ctx.respond(res.body(crate::body::Body::empty()).unwrap_or_default());
            }
        }
        Ok(Flow::Handled)
    }
    .boxed()
}
