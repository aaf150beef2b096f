//
// End-to-end tests running full requests against the in-memory backend.
//
use std::sync::Arc;

use dav_engine::{
    memfs, Body, DavContext, DavMethod, DavPlugin, DavResult, DavServer, EventBus, Flow,
};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use http::{Request, Response, StatusCode};

const HELLO_ETAG: &str = "\"5d41402abc4b2a76b9719d911017c592\"";

fn server() -> DavServer {
    let _ = env_logger::builder().is_test(true).try_init();
    DavServer::builder(memfs::new()).build()
}

fn request(method: &str, uri: &str) -> http::request::Builder {
    Request::builder().method(method).uri(uri)
}

async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    let mut body = resp.into_body();
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

async fn body_string(resp: Response<Body>) -> String {
    String::from_utf8(body_bytes(resp).await).unwrap()
}

async fn put(server: &DavServer, uri: &str, data: &str) -> Response<Body> {
    let req = request("PUT", uri).body(Body::from(data.to_string())).unwrap();
    server.handle(req).await
}

async fn mkcol(server: &DavServer, uri: &str) -> Response<Body> {
    let req = request("MKCOL", uri).body(Body::empty()).unwrap();
    server.handle(req).await
}

#[tokio::test]
async fn put_then_get_roundtrip() {
    let server = server();

    let resp = put(&server, "/file1", "hello").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers()["etag"], HELLO_ETAG);

    let req = request("GET", "/file1").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["etag"], HELLO_ETAG);
    assert_eq!(resp.headers()["content-length"], "5");
    assert_eq!(body_bytes(resp).await, b"hello");
}

#[tokio::test]
async fn put_with_failing_if_match_leaves_content_alone() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let req = request("PUT", "/file1")
        .header("If-Match", "\"wrongetag\"")
        .body(Body::from("overwritten"))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    assert!(resp.headers().contains_key("x-sabre-ew-gross"));

    let req = request("GET", "/file1").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(body_bytes(resp).await, b"hello");
}

#[tokio::test]
async fn if_match_on_missing_target_fails() {
    let server = server();
    let req = request("PUT", "/nope")
        .header("If-Match", "\"anything\"")
        .body(Body::from("data"))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn move_onto_itself_is_forbidden() {
    let server = server();
    assert_eq!(mkcol(&server, "/coll1").await.status(), StatusCode::CREATED);

    let req = request("MOVE", "/coll1")
        .header("Destination", "/coll1")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn copy_into_own_subtree_conflicts() {
    let server = server();
    mkcol(&server, "/coll1").await;

    let req = request("COPY", "/coll1")
        .header("Destination", "/coll1/subcol")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn copy_refuses_overwrite_when_told_to() {
    let server = server();
    put(&server, "/a", "one").await;
    put(&server, "/b", "two").await;

    let req = request("COPY", "/a")
        .header("Destination", "/b")
        .header("Overwrite", "F")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn move_renames_the_file() {
    let server = server();
    put(&server, "/old", "hello").await;

    let req = request("MOVE", "/old")
        .header("Destination", "/new")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = request("GET", "/old").body(Body::empty()).unwrap();
    assert_eq!(server.handle(req).await.status(), StatusCode::NOT_FOUND);
    let req = request("GET", "/new").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(body_bytes(resp).await, b"hello");
}

#[tokio::test]
async fn mkcol_body_requires_resourcetype() {
    let server = server();
    let body = r#"<?xml version="1.0"?>
        <D:mkcol xmlns:D="DAV:">
          <D:set><D:prop><D:displayname>x</D:displayname></D:prop></D:set>
        </D:mkcol>"#;
    let req = request("MKCOL", "/newcoll")
        .header("Content-Type", "application/xml")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mkcol_body_must_be_xml() {
    let server = server();
    let req = request("MKCOL", "/newcoll")
        .header("Content-Type", "text/plain")
        .body(Body::from("not xml"))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn mkcol_on_existing_resource() {
    let server = server();
    mkcol(&server, "/coll1").await;
    assert_eq!(
        mkcol(&server, "/coll1").await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );
}

#[tokio::test]
async fn propfind_depth_zero_mixes_found_and_missing() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let body = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:prop><D:resourcetype/><Z:unknown/></D:prop>
        </D:propfind>"#;
    let req = request("PROPFIND", "/file1")
        .header("Depth", "0")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    let body = body_string(resp).await;
    assert!(body.contains("resourcetype"));
    assert!(body.contains("unknown"));
    assert!(body.contains("HTTP/1.1 200 OK"));
    assert!(body.contains("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn propfind_depth_one_lists_children() {
    let server = server();
    mkcol(&server, "/c").await;
    put(&server, "/c/f", "data").await;

    let req = request("PROPFIND", "/c")
        .header("Depth", "1")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    let body = body_string(resp).await;
    assert!(body.contains("/c/</"));
    assert!(body.contains("/c/f</"));
    assert!(body.contains("getlastmodified"));
}

#[tokio::test]
async fn range_request_serves_a_window() {
    let server = server();
    put(&server, "/r", "Hello, ranges").await;

    let req = request("GET", "/r")
        .header("Range", "bytes=2-5")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()["content-range"], "bytes 2-5/13");
    assert_eq!(resp.headers()["content-length"], "4");
    assert_eq!(body_bytes(resp).await, b"llo,");
}

#[tokio::test]
async fn range_outside_the_file_is_unsatisfiable() {
    let server = server();
    put(&server, "/r", "Hello, ranges").await;

    for range in ["bytes=100-200", "bytes=8-4"] {
        let req = request("GET", "/r")
            .header("Range", range)
            .body(Body::empty())
            .unwrap();
        let resp = server.handle(req).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{}", range);
    }
}

#[tokio::test]
async fn if_none_match_suppresses_if_modified_since() {
    let server = server();
    put(&server, "/file1", "hello").await;

    // Matching If-None-Match on GET turns into 304 regardless of dates.
    // The 304 repeats the entity tag so caches can revalidate.
    let req = request("GET", "/file1")
        .header("If-None-Match", HELLO_ETAG)
        .header("If-Modified-Since", "Mon, 01 Jan 1990 00:00:00 GMT")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(resp.headers()["etag"], HELLO_ETAG);

    // A non-matching If-None-Match makes the date check moot, even one
    // that on its own would have answered 304.
    let req = request("GET", "/file1")
        .header("If-None-Match", "\"other\"")
        .header("If-Modified-Since", "Fri, 01 Jan 2038 00:00:00 GMT")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn if_modified_since_alone_still_applies() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let req = request("GET", "/file1")
        .header("If-Modified-Since", "Fri, 01 Jan 2038 00:00:00 GMT")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(resp.headers()["etag"], HELLO_ETAG);
}

#[tokio::test]
async fn options_advertises_compliance() {
    let server = server();
    let req = request("OPTIONS", "/").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let dav = resp.headers()["dav"].to_str().unwrap();
    assert!(dav.contains("1"));
    assert!(dav.contains("3"));
    assert!(dav.contains("extended-mkcol"));
    assert_eq!(resp.headers()["ms-author-via"], "DAV");
    let allow = resp.headers()["allow"].to_str().unwrap();
    assert!(allow.contains("PROPFIND"));
    assert!(allow.contains("MKCOL"));
}

#[tokio::test]
async fn get_on_collection_is_not_implemented_but_head_succeeds() {
    let server = server();
    mkcol(&server, "/c").await;

    let req = request("GET", "/c").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);

    let req = request("HEAD", "/c").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-sabre-real-status"));
    assert!(body_bytes(resp).await.is_empty());
}

#[tokio::test]
async fn delete_removes_subtree() {
    let server = server();
    mkcol(&server, "/c").await;
    put(&server, "/c/f", "data").await;

    let req = request("DELETE", "/c").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = request("GET", "/c/f").body(Body::empty()).unwrap();
    assert_eq!(server.handle(req).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_of_the_root_is_forbidden() {
    let server = server();
    let req = request("DELETE", "/").body(Body::empty()).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn proppatch_protected_property_fails_the_batch() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop>
            <D:getetag>"fake"</D:getetag>
            <Z:color>blue</Z:color>
          </D:prop></D:set>
        </D:propertyupdate>"#;
    let req = request("PROPPATCH", "/file1").body(Body::from(body)).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 403 Forbidden"));
    assert!(body.contains("HTTP/1.1 424 Failed Dependency"));
}

#[tokio::test]
async fn proppatch_minimal_success_is_204() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:color>blue</Z:color></D:prop></D:set>
        </D:propertyupdate>"#;
    let req = request("PROPPATCH", "/file1")
        .header("Prefer", "return=minimal")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // The dead property is now reported by PROPFIND.
    let body = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:prop><Z:color/></D:prop>
        </D:propfind>"#;
    let req = request("PROPFIND", "/file1")
        .header("Depth", "0")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(req).await;
    let body = body_string(resp).await;
    assert!(body.contains("blue"));
    assert!(body.contains("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn proppatch_on_missing_node_is_404() {
    let server = server();
    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:color>blue</Z:color></D:prop></D:set>
        </D:propertyupdate>"#;
    let req = request("PROPPATCH", "/nope").body(Body::from(body)).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unclaimed_report_is_unsupported() {
    let server = server();
    let body = r#"<?xml version="1.0"?><Z:strange-report xmlns:Z="urn:example"/>"#;
    let req = request("REPORT", "/").body(Body::from(body)).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let body = body_string(resp).await;
    assert!(body.contains("supported-report"));
}

#[tokio::test]
async fn put_into_missing_parent_conflicts() {
    let server = server();
    let resp = put(&server, "/nodir/file", "data").await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unexpected_body_is_rejected() {
    let server = server();
    let req = request("DELETE", "/whatever")
        .body(Body::from("should not be here"))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn prefix_is_stripped_and_rendered_in_hrefs() {
    let server = DavServer::builder(memfs::new()).strip_prefix("/dav").build();

    let req = request("PUT", "/dav/file1")
        .body(Body::from("hello"))
        .unwrap();
    assert_eq!(server.handle(req).await.status(), StatusCode::CREATED);

    let req = request("PROPFIND", "/dav/file1")
        .header("Depth", "0")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    assert!(body_string(resp).await.contains("/dav/file1"));

    // Outside the prefix nothing exists.
    let req = request("GET", "/other/file1").body(Body::empty()).unwrap();
    assert_eq!(server.handle(req).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proppatch_removal_reports_no_content_per_property() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:color>blue</Z:color></D:prop></D:set>
        </D:propertyupdate>"#;
    let req = request("PROPPATCH", "/file1").body(Body::from(body)).unwrap();
    assert_eq!(server.handle(req).await.status(), StatusCode::MULTI_STATUS);

    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:remove><D:prop><Z:color/></D:prop></D:remove>
        </D:propertyupdate>"#;
    let req = request("PROPPATCH", "/file1").body(Body::from(body)).unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 204 No Content"));
    assert!(!body.contains("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn creationdate_is_reported_in_rfc3339() {
    let server = server();
    put(&server, "/file1", "hello").await;

    let body = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:">
          <D:prop><D:creationdate/></D:prop>
        </D:propfind>"#;
    let req = request("PROPFIND", "/file1")
        .header("Depth", "0")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 200 OK"));
    let value = body
        .split("<D:creationdate>")
        .nth(1)
        .and_then(|rest| rest.split('<').next())
        .unwrap();
    // 1996-12-19T16:39:57Z
    assert_eq!(value.len(), 20);
    assert!(value.ends_with('Z'));
}

struct ReadOnlyGuard;

impl DavPlugin for ReadOnlyGuard {
    fn name(&self) -> &'static str {
        "read-only-guard"
    }

    fn initialize(&self, events: &mut EventBus) {
        events.on_before_method(DavMethod::Put, Box::new(deny_put));
    }
}

fn deny_put<'a>(
    _server: &'a DavServer,
    ctx: &'a mut DavContext,
) -> BoxFuture<'a, DavResult<Flow>> {
    async move {
        ctx.respond_status(StatusCode::FORBIDDEN);
        Ok(Flow::Handled)
    }
    .boxed()
}

#[tokio::test]
async fn per_method_before_handler_claims_only_its_verb() {
    let server = DavServer::builder(memfs::new()).plugin(ReadOnlyGuard).build();

    let resp = put(&server, "/file1", "hello").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Other verbs run as usual.
    let resp = mkcol(&server, "/coll1").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn requests_can_be_served_from_spawned_tasks() {
    let server = Arc::new(server());
    put(&server, "/a", "one").await;
    mkcol(&server, "/d").await;

    let task = {
        let server = server.clone();
        tokio::spawn(async move {
            let req = request("COPY", "/a")
                .header("Destination", "/d/a")
                .body(Body::empty())
                .unwrap();
            server.handle(req).await.status()
        })
    };
    assert_eq!(task.await.unwrap(), StatusCode::CREATED);
}
