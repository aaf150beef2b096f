//! An event-driven WebDAV protocol engine.
//!
//! The [`DavServer`] dispatches parsed HTTP requests to event handlers.
//! The bundled core plugin implements the base protocol (RFC4918 class
//! 1 and 3 plus extended MKCOL): OPTIONS, GET/HEAD with ranges, PUT,
//! DELETE, MKCOL, COPY/MOVE, PROPFIND/PROPPATCH and REPORT routing,
//! with the full set of conditional-request checks in front.
//!
//! Storage is pluggable: a backend exposes its hierarchy through the
//! [`DavNode`](node::DavNode) capability traits, and everything beyond
//! plain files and collections (dead properties, quota, batched
//! lookups) is an optional capability. The `memfs` feature provides an
//! in-memory backend.
//!
//! ```
//! use dav_engine::DavServer;
//!
//! # async fn example() {
//! let server = DavServer::builder(dav_engine::memfs::new())
//!     .strip_prefix("/dav")
//!     .build();
//!
//! let req = http::Request::builder()
//!     .method("OPTIONS")
//!     .uri("/dav/")
//!     .body(dav_engine::Body::empty())
//!     .unwrap();
//! let resp = server.handle(req).await;
//! assert!(resp.headers().contains_key("DAV"));
//! # }
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod body;
pub mod conditional;
pub mod core;
pub mod davheaders;
pub mod errors;
pub mod event;
#[cfg(feature = "memfs")]
pub mod memfs;
pub mod node;
pub mod propfind;
pub mod proppatch;
pub mod server;
pub mod tree;
pub mod util;
pub mod xml;

pub use crate::body::Body;
pub use crate::errors::{DavError, DavResult};
pub use crate::event::{EventBus, Flow};
pub use crate::server::{
    DavContext, DavPlugin, DavServer, DavServerBuilder, RequestBody, WriteOutcome,
};
pub use crate::util::{DavMethod, DavMethodSet};
