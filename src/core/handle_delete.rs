use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::StatusCode;

use crate::errors::DavError;
use crate::event::Flow;
use crate::server::{DavContext, DavServer};
use crate::DavResult;

pub(crate) fn http_delete<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        if ctx.path.is_empty() {
            return Err(DavError::Forbidden("the root collection cannot be deleted".to_string()));
        }

        let events = server.events();
        if server.emit_path_event(&events.before_unbind, &ctx.path).await? == Flow::Handled {
            if ctx.response.is_none() {
                return Err(DavError::Forbidden("the delete was blocked".to_string()));
            }
            return Ok(Flow::Handled);
        }

        server.tree().delete(&ctx.path).await?;
        server.emit_path_event(&events.after_unbind, &ctx.path).await?;

        ctx.respond_status(StatusCode::NO_CONTENT);
        Ok(Flow::Handled)
    }
    .boxed()
}
