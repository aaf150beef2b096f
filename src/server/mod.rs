//
// This module contains the main entry point of the library,
// DavServer: the event-driven request dispatcher.
//
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use bytes::buf::Buf;
use futures_util::stream::Stream;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::{Body, StreamBody};
use crate::conditional;
use crate::davheaders::{self, Depth};
use crate::errors::DavError;
use crate::event::{EventBus, Flow, Handlers, MethodHandler, PathHandler};
use crate::node::{DavNode, FileBody};
use crate::propfind::PropFind;
use crate::proppatch::PropPatch;
use crate::tree::Tree;
use crate::util::{dav_method, join_path, split_path, uri_to_path, DavMethod, DavMethodSet};
use crate::xml::{MkCol, PropName};
use crate::DavResult;

// Methods whose body is read up-front are capped at this size; PUT
// streams and has no limit.
const MAX_BODY_PREREAD: usize = 65536;

/// A plugin bundles a set of event handlers plus the protocol surface
/// it contributes (compliance classes, methods, report types).
pub trait DavPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subscribe handlers. Called once, when the server is built.
    fn initialize(&self, events: &mut EventBus);

    /// Tokens for the `DAV:` compliance header.
    fn features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Extra methods for the `Allow` header.
    fn http_methods(&self) -> DavMethodSet {
        DavMethodSet::empty()
    }

    /// Report root elements this plugin answers.
    fn supported_reports(&self) -> Vec<PropName> {
        Vec::new()
    }
}

/// The request body as the method handlers see it.
pub enum RequestBody {
    None,
    /// Pre-read, for the XML-carrying methods.
    Data(Vec<u8>),
    /// Streaming, for PUT.
    Stream(Body),
}

impl RequestBody {
    pub fn take(&mut self) -> RequestBody {
        std::mem::replace(self, RequestBody::None)
    }

    pub fn data(&self) -> &[u8] {
        match self {
            RequestBody::Data(data) => data,
            _ => &[],
        }
    }
}

/// Per-request state threaded through the event handlers.
pub struct DavContext {
    pub method: DavMethod,
    /// Decoded request path, relative to the prefix.
    pub path: String,
    pub headers: http::HeaderMap,
    pub uri: http::Uri,
    pub body: RequestBody,
    /// Set by whichever handler answers the request.
    pub response: Option<Response<Body>>,
}

impl DavContext {
    pub fn respond(&mut self, response: Response<Body>) {
        self.response = Some(response);
    }

    /// An empty response with just a status code.
    pub fn respond_status(&mut self, status: StatusCode) {
        let resp = Response::builder()
            .status(status)
            .header("Content-Length", "0")
            .body(Body::empty())
            .unwrap_or_default();
        self.response = Some(resp);
    }
}

/// Result of a file write that went through the event chain.
pub enum WriteOutcome {
    Written { etag: Option<String> },
    /// An event handler blocked the write. It may have set a response
    /// of its own; if not, the method handler turns this into a 403.
    Vetoed,
}

/// Configuration of the server.
pub struct DavServerBuilder {
    prefix: String,
    root: Arc<dyn DavNode>,
    allow: DavMethodSet,
    plugins: Vec<Arc<dyn DavPlugin>>,
    propfind_depth_infinity: bool,
    debug_exceptions: bool,
    expose_version: bool,
    protected_properties: Vec<PropName>,
}

fn default_protected_properties() -> Vec<PropName> {
    [
        "getcontentlength",
        "getetag",
        "getlastmodified",
        "quota-available-bytes",
        "quota-used-bytes",
        "resourcetype",
        "supported-method-set",
        "supported-report-set",
    ]
    .iter()
    .map(|name| PropName::dav(*name))
    .collect()
}

impl DavServerBuilder {
    pub fn new(root: Arc<dyn DavNode>) -> DavServerBuilder {
        DavServerBuilder {
            prefix: String::new(),
            root,
            allow: DavMethodSet::WEBDAV_RW,
            plugins: Vec::new(),
            propfind_depth_infinity: false,
            debug_exceptions: false,
            expose_version: true,
            protected_properties: default_protected_properties(),
        }
    }

    /// Prefix to be stripped off before translating the rest of
    /// the request path to a node path.
    pub fn strip_prefix(self, prefix: impl Into<String>) -> Self {
        let mut this = self;
        this.prefix = prefix.into();
        if this.prefix == "/" {
            this.prefix.clear();
        }
        this
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(self, allow: DavMethodSet) -> Self {
        let mut this = self;
        this.allow = allow;
        this
    }

    /// Allow `Depth: infinity` on PROPFIND. Off by default; infinite
    /// requests are clamped to depth 1.
    pub fn propfind_depth_infinity(self, enable: bool) -> Self {
        let mut this = self;
        this.propfind_depth_infinity = enable;
        this
    }

    /// Include backtraces in `{DAV:}error` bodies.
    pub fn debug_exceptions(self, enable: bool) -> Self {
        let mut this = self;
        this.debug_exceptions = enable;
        this
    }

    /// Send the server version in an `X-Sabre-Version` header.
    pub fn expose_version(self, enable: bool) -> Self {
        let mut this = self;
        this.expose_version = enable;
        this
    }

    /// Replace the set of properties PROPPATCH may never touch.
    pub fn protected_properties(self, props: Vec<PropName>) -> Self {
        let mut this = self;
        this.protected_properties = props;
        this
    }

    pub fn plugin(self, plugin: impl DavPlugin + 'static) -> Self {
        let mut this = self;
        this.plugins.push(Arc::new(plugin));
        this
    }

    pub fn build(self) -> DavServer {
        let core: Arc<dyn DavPlugin> = Arc::new(crate::core::CorePlugin::new());
        let mut plugins = vec![core];
        plugins.extend(self.plugins);

        let mut events = EventBus::default();
        for plugin in &plugins {
            plugin.initialize(&mut events);
        }

        DavServer {
            prefix: self.prefix,
            tree: Tree::new(self.root),
            events,
            plugins,
            allow: self.allow,
            propfind_depth_infinity: self.propfind_depth_infinity,
            debug_exceptions: self.debug_exceptions,
            expose_version: self.expose_version,
            protected_properties: self.protected_properties,
        }
    }
}

/// The webdav server struct.
///
/// Dispatches requests to event handlers subscribed by the plugins;
/// the built-in [`crate::core::CorePlugin`] covers the base protocol.
pub struct DavServer {
    prefix: String,
    tree: Tree,
    events: EventBus,
    plugins: Vec<Arc<dyn DavPlugin>>,
    allow: DavMethodSet,
    propfind_depth_infinity: bool,
    debug_exceptions: bool,
    expose_version: bool,
    protected_properties: Vec<PropName>,
}

impl DavServer {
    /// Return a configuration builder.
    pub fn builder(root: Arc<dyn DavNode>) -> DavServerBuilder {
        DavServerBuilder::new(root)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn plugins(&self) -> &[Arc<dyn DavPlugin>] {
        &self.plugins
    }

    pub fn propfind_depth_infinity(&self) -> bool {
        self.propfind_depth_infinity
    }

    pub fn protected_properties(&self) -> &[PropName] {
        &self.protected_properties
    }

    /// Report roots answered by any plugin.
    pub fn supported_reports(&self) -> Vec<PropName> {
        self.plugins
            .iter()
            .flat_map(|p| p.supported_reports())
            .collect()
    }

    /// Methods for the `Allow` header.
    pub fn allowed_methods(&self) -> Vec<&'static str> {
        let mut extra = DavMethodSet::empty();
        for plugin in &self.plugins {
            extra |= plugin.http_methods();
        }
        DavMethod::ALL
            .iter()
            .filter(|m| self.allow.contains_method(**m) || extra.contains_method(**m))
            .map(|m| m.as_str())
            .collect()
    }

    /// Compliance classes for the `DAV:` header.
    pub fn dav_features(&self) -> Vec<&'static str> {
        let mut features = vec!["1", "3", "extended-mkcol"];
        for plugin in &self.plugins {
            for feature in plugin.features() {
                if !features.contains(&feature) {
                    features.push(feature);
                }
            }
        }
        features
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        self.handle_inner(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    /// Used with webserver frameworks that have not
    /// opted to use the `http_body` crate just yet.
    pub async fn handle_stream<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>> + Send + 'static,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        self.handle_inner(req).await
    }

    // Turn any DavError results into a HTTP error response.
    async fn handle_inner<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        let is_ms = req
            .headers()
            .get("user-agent")
            .and_then(|s| s.to_str().ok())
            .map(|s| s.contains("Microsoft"))
            .unwrap_or(false);

        match self.handle2(req).await {
            Ok(mut resp) => {
                debug!("== END REQUEST result OK");
                self.add_version_header(&mut resp);
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                for handler in self.events.exception.iter() {
                    handler(self, &err).await;
                }
                let mut resp = Response::builder();
                if is_ms && err.statuscode() == StatusCode::NOT_FOUND {
                    // This is an attempt to convince Windows to not
                    // cache a 404 NOT_FOUND for 30-60 seconds.
                    //
                    // That is a problem since windows caches the NOT_FOUND in a
                    // case-insensitive way. So if "www" does not exist, but "WWW" does,
                    // and you do a "dir www" and then a "dir WWW" the second one
                    // will fail.
                    resp = resp
                        .header("Cache-Control", "no-store, no-cache, must-revalidate")
                        .header("Pragma", "no-cache")
                        .header("Expires", "0")
                        .header("Vary", "*");
                }
                for (name, value) in err.http_headers() {
                    resp = resp.header(name, value);
                }
                resp = resp
                    .status(err.statuscode())
                    .header("Content-Type", "application/xml; charset=utf-8");
                if err.must_close() {
                    resp = resp.header("Connection", "close");
                }
                let body = crate::xml::error_document(&err, self.debug_exceptions);
                let mut resp = resp.body(Body::from(body)).unwrap_or_default();
                self.add_version_header(&mut resp);
                resp
            }
        }
    }

    fn add_version_header(&self, resp: &mut Response<Body>) {
        if self.expose_version {
            if let Ok(value) = http::HeaderValue::from_str(env!("CARGO_PKG_VERSION")) {
                resp.headers_mut().insert("x-sabre-version", value);
            }
        }
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> DavResult<Response<Body>>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        let (parts, body) = req.into_parts();
        let body = Body::from_http_body(body);

        // translate HTTP method to Webdav method.
        let method = match dav_method(&parts.method) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", parts.method, parts.uri);
                return Err(e);
            }
        };

        // see if method is allowed.
        if !self.allow.contains_method(method) {
            debug!("method {} not allowed on request {}", parts.method, parts.uri);
            return Err(DavError::MethodNotAllowed);
        }

        // make sure the request path is valid.
        let path = uri_to_path(&parts.uri, &self.prefix)?;

        // PUT is the only handler that reads the body itself. All the
        // other handlers either expect no body, or a pre-read Vec<u8>.
        let body = match method {
            DavMethod::Put => RequestBody::Stream(body),
            _ => {
                let data = body.read_to_end(MAX_BODY_PREREAD).await?;
                // Not all methods accept a body.
                let accepts_body = matches!(
                    method,
                    DavMethod::PropFind
                        | DavMethod::PropPatch
                        | DavMethod::MkCol
                        | DavMethod::Report
                );
                if !accepts_body && !data.is_empty() {
                    return Err(DavError::UnsupportedMediaType);
                }
                if data.is_empty() {
                    RequestBody::None
                } else {
                    RequestBody::Data(data)
                }
            }
        };

        debug!("== START REQUEST {:?} /{}", method, path);

        let mut ctx = DavContext {
            method,
            path,
            headers: parts.headers,
            uri: parts.uri,
            body,
            response: None,
        };
        self.invoke_method(&mut ctx).await?;
        ctx.response.ok_or_else(|| {
            DavError::Internal("a handler claimed the request without producing a response".to_string())
        })
    }

    async fn invoke_method(&self, ctx: &mut DavContext) -> DavResult<()> {
        if let Some(handlers) = self.events.before_method.get(&ctx.method) {
            if self.emit_method_event(handlers, ctx).await? {
                return Ok(());
            }
        }
        if self.emit_method_event(&self.events.before, ctx).await? {
            return Ok(());
        }

        match conditional::check_preconditions(self, ctx).await? {
            conditional::PreconditionOutcome::NotModified(etag) => {
                let mut res = Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header("Content-Length", "0");
                if let Some(etag) = etag {
                    res = res.header("ETag", etag);
                }
                ctx.respond(res.body(Body::empty()).unwrap_or_default());
            }
            conditional::PreconditionOutcome::Proceed => {
                let mut handled = match self.events.method.get(&ctx.method) {
                    Some(handlers) => self.emit_method_event(handlers, ctx).await?,
                    None => false,
                };
                if !handled {
                    handled = self.emit_method_event(&self.events.method_any, ctx).await?;
                }
                if !handled {
                    return Err(DavError::NotImplemented(format!(
                        "no handler for {}",
                        ctx.method.as_str()
                    )));
                }
            }
        }

        if let Some(handlers) = self.events.after_method.get(&ctx.method) {
            self.emit_method_event(handlers, ctx).await?;
        }
        self.emit_method_event(&self.events.after, ctx).await?;
        Ok(())
    }

    async fn emit_method_event(
        &self,
        handlers: &Handlers<MethodHandler>,
        ctx: &mut DavContext,
    ) -> DavResult<bool> {
        for handler in handlers.iter() {
            if handler(self, ctx).await? == Flow::Handled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) async fn emit_path_event(
        &self,
        handlers: &Handlers<PathHandler>,
        path: &str,
    ) -> DavResult<Flow> {
        for handler in handlers.iter() {
            if handler(self, path).await? == Flow::Handled {
                return Ok(Flow::Handled);
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) async fn emit_move_event(
        &self,
        handlers: &Handlers<crate::event::MoveHandler>,
        source: &str,
        destination: &str,
    ) -> DavResult<Flow> {
        for handler in handlers.iter() {
            if handler(self, source, destination).await? == Flow::Handled {
                return Ok(Flow::Handled);
            }
        }
        Ok(Flow::Continue)
    }

    /// Run the `propFind` chain for one node.
    pub async fn emit_prop_find(
        &self,
        propfind: &mut PropFind,
        node: &Arc<dyn DavNode>,
    ) -> DavResult<()> {
        for handler in self.events.prop_find.iter() {
            if handler(self, propfind, node).await? == Flow::Handled {
                break;
            }
        }
        Ok(())
    }

    /// Resolve an href (absolute URL or absolute path) to a node path
    /// under the configured prefix.
    pub fn resolve_href(&self, href: &str) -> DavResult<String> {
        let path = match href.find("://") {
            Some(pos) => {
                let rest = &href[pos + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "/",
                }
            }
            None => href,
        };
        let uri: http::Uri = path
            .parse()
            .map_err(|_| DavError::BadRequest(format!("invalid href: {}", href)))?;
        uri_to_path(&uri, &self.prefix)
    }

    /// Validate a COPY or MOVE request: destination resolution, the
    /// `Overwrite` header, and the structural conflicts.
    /// Returns (destination path, destination exists).
    pub async fn copy_and_move_info(
        &self,
        path: &str,
        headers: &http::HeaderMap,
    ) -> DavResult<(String, bool)> {
        let destination = headers
            .get("destination")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DavError::BadRequest("The destination header was not supplied".to_string()))?;
        let destination = self.resolve_href(destination)?;

        if destination == path {
            return Err(DavError::Forbidden(
                "source and destination are identical".to_string(),
            ));
        }
        if destination.starts_with(&format!("{}/", path)) {
            return Err(DavError::Conflict(
                "the destination may not be part of the same subtree as the source".to_string(),
            ));
        }

        let (dest_parent, _) = split_path(&destination);
        let parent = self
            .tree
            .node_for_path(dest_parent)
            .await
            .map_err(|_| DavError::Conflict("the destination parent does not exist".to_string()))?;
        if parent.as_collection().is_none() {
            return Err(DavError::UnsupportedMediaType);
        }

        let exists = self.tree.node_exists(&destination).await?;
        if exists && !davheaders::overwrite(headers)? {
            return Err(DavError::PreconditionFailed(Some("Overwrite")));
        }
        Ok((destination, exists))
    }

    /// Resolve properties for a path and, depth permitting, everything
    /// below it. The traversal is flat: a work list of (path, depth)
    /// pairs, so arbitrarily deep trees do not recurse.
    pub async fn get_properties_for_path(
        &self,
        path: &str,
        propfind: &PropFind,
    ) -> DavResult<Vec<(bool, PropFind)>> {
        let mut result = Vec::new();
        let mut work = vec![(path.to_string(), propfind.depth())];

        while let Some((path, depth)) = work.pop() {
            let node = self.tree.node_for_path(&path).await?;
            let is_collection = node.as_collection().is_some();

            let mut pf = propfind.for_child(path.clone(), depth);
            self.emit_prop_find(&mut pf, &node).await?;
            result.push((is_collection, pf));

            if is_collection && depth != Depth::Zero {
                for child in self.tree.children(&path).await? {
                    work.push((join_path(&path, &child.name()), depth.decrement()));
                }
            }
        }
        Ok(result)
    }

    /// Resolve the same property set for a flat list of paths, batching
    /// sibling lookups. Paths that do not resolve are skipped.
    pub async fn get_properties_for_multiple_paths(
        &self,
        paths: &[String],
        names: Vec<PropName>,
    ) -> DavResult<HashMap<String, (bool, PropFind)>> {
        let nodes = self.tree.multiple_nodes(paths).await?;
        let mut result = HashMap::new();
        for (path, node) in nodes {
            let mut pf = PropFind::new(
                path.clone(),
                crate::propfind::PropFindType::Normal,
                names.clone(),
                Depth::Zero,
            );
            self.emit_prop_find(&mut pf, &node).await?;
            result.insert(path, (node.as_collection().is_some(), pf));
        }
        Ok(result)
    }

    /// Run a property update through the `propPatch` chain and commit.
    pub async fn update_properties(
        &self,
        path: &str,
        mutations: HashMap<PropName, Option<xmltree::Element>>,
    ) -> DavResult<PropPatch> {
        let mut pp = PropPatch::new(path, mutations);
        for handler in self.events.prop_patch.iter() {
            if handler(self, &mut pp).await? == Flow::Handled {
                break;
            }
        }
        pp.commit().await?;
        Ok(pp)
    }

    /// Create a new file through the bind/create events.
    pub async fn create_file(&self, path: &str, data: FileBody) -> DavResult<WriteOutcome> {
        if self.emit_path_event(&self.events.before_bind, path).await? == Flow::Handled {
            return Ok(WriteOutcome::Vetoed);
        }
        if self
            .emit_path_event(&self.events.before_create_file, path)
            .await?
            == Flow::Handled
        {
            return Ok(WriteOutcome::Vetoed);
        }

        let (parent_path, name) = split_path(path);
        let parent = self.tree.node_for_path(parent_path).await?;
        let collection = parent
            .as_collection()
            .ok_or_else(|| DavError::Conflict("parent node is not a collection".to_string()))?;
        let etag = collection.create_file(name, data).await?;
        self.tree.mark_dirty(parent_path);

        self.emit_path_event(&self.events.after_create_file, path).await?;
        self.emit_path_event(&self.events.after_bind, path).await?;
        Ok(WriteOutcome::Written { etag })
    }

    /// Replace the content of an existing file.
    pub async fn update_file(&self, path: &str, data: FileBody) -> DavResult<WriteOutcome> {
        if self
            .emit_path_event(&self.events.before_write_content, path)
            .await?
            == Flow::Handled
        {
            return Ok(WriteOutcome::Vetoed);
        }

        let node = self.tree.node_for_path(path).await?;
        let file = node
            .as_file()
            .ok_or_else(|| DavError::Conflict("target is not a file".to_string()))?;
        let etag = file.put(data).await?;
        self.tree.mark_dirty(path);

        self.emit_path_event(&self.events.after_write_content, path)
            .await?;
        Ok(WriteOutcome::Written { etag })
    }

    /// Create a collection. On success with leftover properties that
    /// could not be applied, the per-property failure statuses are
    /// returned for a multi-status body.
    pub async fn create_collection(
        &self,
        path: &str,
        mut mkcol: MkCol,
    ) -> DavResult<Option<PropPatch>> {
        if self.emit_path_event(&self.events.before_bind, path).await? == Flow::Handled {
            return Err(DavError::Forbidden("collection creation was blocked".to_string()));
        }

        let (parent_path, name) = split_path(path);
        let parent = self.tree.node_for_path(parent_path).await?;
        let collection = parent
            .as_collection()
            .ok_or(DavError::Conflict("parent node is not a collection".to_string()))?;

        match parent.as_extended_mkcol() {
            Some(extended) => {
                extended.create_extended_collection(name, &mut mkcol).await?;
            }
            None => {
                if !mkcol.is_plain_collection() {
                    return Err(DavError::InvalidResourceType);
                }
                collection.create_directory(name).await?;
            }
        }
        self.tree.mark_dirty(parent_path);

        let mut failed = None;
        if !mkcol.properties.is_empty() {
            let mutations = mkcol
                .properties
                .into_iter()
                .map(|(k, v)| (k, Some(v)))
                .collect();
            let pp = self.update_properties(path, mutations).await?;
            let ok = pp
                .result()
                .values()
                .all(|status| !status.is_client_error() && !status.is_server_error());
            if !ok {
                failed = Some(pp);
            }
        }

        self.emit_path_event(&self.events.after_bind, path).await?;
        Ok(failed)
    }
}
