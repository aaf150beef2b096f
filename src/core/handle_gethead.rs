use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use headers::HeaderMapExt;
use http::{Response, StatusCode};

use crate::body::Body;
use crate::davheaders::{self, IfRange};
use crate::errors::DavError;
use crate::event::Flow;
use crate::node::FileBody;
use crate::server::{DavContext, DavServer};
use crate::util::systemtime_to_httpdate;
use crate::DavResult;

pub(crate) fn http_get<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    get_or_head(server, ctx, true).boxed()
}

pub(crate) fn http_head<'a>(
    server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        if get_or_head(server, ctx, false).await? == Flow::Handled {
            return Ok(Flow::Handled);
        }
        // HEAD must succeed even where GET would not be implemented,
        // so clients can probe collections. The real status goes in a
        // diagnostic header.
        let res = Response::builder()
            .status(StatusCode::OK)
            .header("X-Sabre-Real-Status", "501 Not Implemented")
            .header("Content-Length", "0")
            .body(Body::empty())
            .unwrap_or_default();
        ctx.respond(res);
        Ok(Flow::Handled)
    }
    .boxed()
}

async fn get_or_head(
    server: &DavServer,
    ctx: &mut DavContext,
    include_body: bool,
) -> DavResult<Flow> {
    let node = server.tree().node_for_path(&ctx.path).await?;
    let file = match node.as_file() {
        // GET on something that is not a file is left to other plugins.
        None => return Ok(Flow::Continue),
        Some(file) => file,
    };
    let size = file.size();

    // A range only applies when the If-Range precondition holds.
    let mut range = davheaders::byte_range(&ctx.headers);
    if range.is_some() {
        if let Some(if_range) = davheaders::if_range(&ctx.headers) {
            let valid = match if_range {
                IfRange::ETag(tag) => file.etag().as_deref() == Some(tag.as_str()),
                IfRange::Date(date) => node
                    .last_modified()
                    .map(|mtime| unix_secs(mtime) <= unix_secs(date))
                    .unwrap_or(false),
            };
            if !valid {
                range = None;
            }
        }
    }

    let mut status = StatusCode::OK;
    let mut span: Option<(u64, u64)> = None;
    if let (Some(range), Some(size)) = (range, size) {
        let (start, end) = match range {
            (Some(start), Some(end)) => {
                if start > end || start >= size {
                    return Err(DavError::RequestedRangeNotSatisfiable);
                }
                (start, end.min(size.saturating_sub(1)))
            }
            (Some(start), None) => {
                if start >= size {
                    return Err(DavError::RequestedRangeNotSatisfiable);
                }
                (start, size - 1)
            }
            (None, Some(count)) => {
                if count == 0 || size == 0 {
                    return Err(DavError::RequestedRangeNotSatisfiable);
                }
                (size.saturating_sub(count), size - 1)
            }
            (None, None) => return Err(DavError::RequestedRangeNotSatisfiable),
        };
        status = StatusCode::PARTIAL_CONTENT;
        span = Some((start, end));
    }

    let mut res = Response::builder().status(status);
    {
        let h = res.headers_mut().ok_or(DavError::Internal("response builder".into()))?;
        h.insert("Accept-Ranges", http::HeaderValue::from_static("bytes"));
        let ct = file
            .content_type()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        if let Ok(value) = ct.parse() {
            h.insert("Content-Type", value);
        }
        if let Some(etag) = file.etag() {
            if let Ok(value) = etag.parse() {
                h.insert("ETag", value);
            }
        }
        if let Some(mtime) = node.last_modified() {
            if let Ok(value) = systemtime_to_httpdate(mtime).parse() {
                h.insert("Last-Modified", value);
            }
        }
        match span {
            Some((start, end)) => {
                h.typed_insert(headers::ContentLength(end - start + 1));
                if let Some(size) = size {
                    if let Ok(value) = format!("bytes {}-{}/{}", start, end, size).parse() {
                        h.insert("Content-Range", value);
                    }
                }
            }
            None => {
                if let Some(size) = size {
                    h.typed_insert(headers::ContentLength(size));
                }
            }
        }
    }

    let body = if include_body {
        match file.get().await? {
            FileBody::Bytes(data) => match span {
                Some((start, end)) => {
                    let end = ((end + 1) as usize).min(data.len());
                    let start = (start as usize).min(end);
                    Body::from(data.slice(start..end))
                }
                None => Body::from(data),
            },
            FileBody::Stream(stream) => match span {
                Some((start, end)) => clipped_stream(stream, start, end - start + 1),
                None => Body::stream(stream),
            },
        }
    } else {
        Body::empty()
    };

    ctx.respond(res.body(body).unwrap_or_default());
    Ok(Flow::Handled)
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// Serve a window out of a chunk stream without buffering it whole.
fn clipped_stream(mut inner: BoxStream<'static, io::Result<Bytes>>, skip: u64, take: u64) -> Body {
    let mut skip = skip;
    let mut take = take;
    Body::stream(async_stream::stream! {
        while let Some(chunk) = inner.next().await {
            let mut chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if skip > 0 {
                if (chunk.len() as u64) <= skip {
                    skip -= chunk.len() as u64;
                    continue;
                }
                chunk = chunk.slice(skip as usize..);
                skip = 0;
            }
            if take == 0 {
                return;
            }
            if (chunk.len() as u64) > take {
                chunk = chunk.slice(..take as usize);
            }
            take -= chunk.len() as u64;
            yield Ok(chunk);
        }
    })
}
