use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::errors::DavError;
use crate::event::Flow;
use crate::server::{DavContext, DavServer};
use crate::xml;
use crate::DavResult;

pub(crate) fn http_report<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        let data = ctx.body.take();
        let report = xml::parse(data.data())?;

        for handler in server.events().report.iter() {
            if handler(server, ctx, &report).await? == Flow::Handled {
                if ctx.response.is_none() {
                    return Err(DavError::Internal(
                        "a report handler claimed the report without a response".to_string(),
                    ));
                }
                return Ok(Flow::Handled);
            }
        }
        Err(DavError::ReportNotSupported)
    }
    .boxed()
}
