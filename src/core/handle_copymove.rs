use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::StatusCode;

use crate::errors::DavError;
use crate::event::Flow;
use crate::server::{DavContext, DavServer};
use crate::DavResult;

pub(crate) fn http_copy<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let (destination, dest_exists) =
            server.copy_and_move_info(&ctx.path, &ctx.headers).await?;
        // 404 when the source is missing.
        server.tree().node_for_path(&ctx.path).await?;

        let events = server.events();
        if dest_exists
            && server
                .emit_path_event(&events.before_unbind, &destination)
                .await?
                == Flow::Handled
        {
            return blocked(ctx);
        }
        if server
            .emit_path_event(&events.before_bind, &destination)
            .await?
            == Flow::Handled
        {
            return blocked(ctx);
        }
        if dest_exists {
            server.tree().delete(&destination).await?;
            server
                .emit_path_event(&events.after_unbind, &destination)
                .await?;
        }

        server.tree().copy(&ctx.path, &destination).await?;
        server.emit_path_event(&events.after_bind, &destination).await?;

        respond_copymove(ctx, dest_exists);
        Ok(Flow::Handled)
    }
    .boxed()
}

pub(crate) fn http_move<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let (destination, dest_exists) =
            server.copy_and_move_info(&ctx.path, &ctx.headers).await?;
        server.tree().node_for_path(&ctx.path).await?;

        let events = server.events();
        if dest_exists
            && server
                .emit_path_event(&events.before_unbind, &destination)
                .await?
                == Flow::Handled
        {
            return blocked(ctx);
        }
        if server
            .emit_path_event(&events.before_unbind, &ctx.path)
            .await?
            == Flow::Handled
        {
            return blocked(ctx);
        }
        if server
            .emit_path_event(&events.before_bind, &destination)
            .await?
            == Flow::Handled
        {
            return blocked(ctx);
        }
        if server
            .emit_move_event(&events.before_move, &ctx.path, &destination)
            .await?
            == Flow::Handled
        {
            return blocked(ctx);
        }

        // The destination only goes away once every observer has had a
        // chance to veto the whole operation.
        if dest_exists {
            server.tree().delete(&destination).await?;
            server
                .emit_path_event(&events.after_unbind, &destination)
                .await?;
        }

        server.tree().move_node(&ctx.path, &destination).await?;

        // afterMove fires first so observers see both names, then the
        // source unbind, then the destination bind.
        server
            .emit_move_event(&events.after_move, &ctx.path, &destination)
            .await?;
        server
            .emit_path_event(&events.after_unbind, &ctx.path)
            .await?;
        server
            .emit_path_event(&events.after_bind, &destination)
            .await?;

        respond_copymove(ctx, dest_exists);
        Ok(Flow::Handled)
    }
    .boxed()
}

fn blocked(ctx: &mut DavContext) -> DavResult<Flow> {
    if ctx.response.is_none() {
        return Err(DavError::Forbidden("the operation was blocked".to_string()));
    }
    Ok(Flow::Handled)
}

fn respond_copymove(ctx: &mut DavContext, overwrote: bool) {
    let status = if overwrote {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    };
    ctx.respond_status(status);
}
