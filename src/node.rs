//! Backend interfaces: the node capability traits.
//!
//! A storage backend exposes its hierarchy as [`DavNode`] objects. The
//! base trait carries identity and lifetime; everything else is an
//! optional capability reached through an explicit downcast query
//! (`as_file`, `as_collection`, ...). The engine never assumes more
//! than the capabilities a node reports.
//!
//! All potentially blocking operations return boxed futures, written as
//! `async move { .. }.boxed()` in the implementations.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::xml::{MkCol, PropName};
use crate::DavResult;

/// Boxed future alias used throughout the node traits.
pub type NodeFuture<'a, T> = BoxFuture<'a, DavResult<T>>;

/// File content, either fully buffered or a chunk stream.
///
/// Streams are drained in bounded chunks; the engine never buffers a
/// whole stream unless the operation requires it.
pub enum FileBody {
    Bytes(Bytes),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl FileBody {
    pub fn empty() -> FileBody {
        FileBody::Bytes(Bytes::new())
    }

    /// Buffer the whole body. Used by backends that store contiguous
    /// blobs, and by the recursive tree copy.
    pub async fn into_bytes(self) -> DavResult<Bytes> {
        match self {
            FileBody::Bytes(b) => Ok(b),
            FileBody::Stream(mut s) => {
                let mut buf = Vec::new();
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl From<Bytes> for FileBody {
    fn from(b: Bytes) -> FileBody {
        FileBody::Bytes(b)
    }
}

impl From<Vec<u8>> for FileBody {
    fn from(b: Vec<u8>) -> FileBody {
        FileBody::Bytes(Bytes::from(b))
    }
}

/// The base node interface.
pub trait DavNode: Send + Sync {
    /// Last path segment of this node.
    fn name(&self) -> String;

    /// Rename in place. Only called for a move within the same parent.
    fn rename<'a>(&'a self, new_name: &'a str) -> NodeFuture<'a, ()>;

    fn last_modified(&self) -> Option<SystemTime> {
        None
    }

    fn created(&self) -> Option<SystemTime> {
        None
    }

    /// Remove this node from its parent.
    fn delete<'a>(&'a self) -> NodeFuture<'a, ()>;

    fn as_file(&self) -> Option<&dyn DavFile> {
        None
    }
    fn as_collection(&self) -> Option<&dyn DavCollection> {
        None
    }
    fn as_properties(&self) -> Option<&dyn DavProperties> {
        None
    }
    fn as_quota(&self) -> Option<&dyn DavQuota> {
        None
    }
    fn as_multi_get(&self) -> Option<&dyn DavMultiGet> {
        None
    }
    fn as_extended_mkcol(&self) -> Option<&dyn DavExtendedMkCol> {
        None
    }
    fn as_move_target(&self) -> Option<&dyn DavMoveTarget> {
        None
    }
}

/// A leaf node with byte content.
pub trait DavFile: DavNode {
    fn get<'a>(&'a self) -> NodeFuture<'a, FileBody>;

    /// Replace the content. Returns the new etag when the backend can
    /// produce one cheaply.
    fn put<'a>(&'a self, data: FileBody) -> NodeFuture<'a, Option<String>>;

    fn size(&self) -> Option<u64>;
    fn etag(&self) -> Option<String>;
    fn content_type(&self) -> Option<String>;
}

/// A node with children.
pub trait DavCollection: DavNode {
    /// Look up a direct child. Fails with `NotFound`.
    fn child<'a>(&'a self, name: &'a str) -> NodeFuture<'a, Arc<dyn DavNode>>;

    fn children<'a>(&'a self) -> NodeFuture<'a, Vec<Arc<dyn DavNode>>>;

    /// Boolean existence probe; never signals absence through an error.
    fn child_exists<'a>(&'a self, name: &'a str) -> NodeFuture<'a, bool>;

    /// Create a file child. Returns the new etag if known.
    fn create_file<'a>(&'a self, name: &'a str, data: FileBody) -> NodeFuture<'a, Option<String>>;

    fn create_directory<'a>(&'a self, name: &'a str) -> NodeFuture<'a, ()>;
}

/// Dead-property storage on a node.
pub trait DavProperties: DavNode {
    /// Fetch properties by name. An empty name list requests all stored
    /// properties (used when copying a node).
    fn properties<'a>(
        &'a self,
        names: &'a [PropName],
    ) -> NodeFuture<'a, HashMap<PropName, xmltree::Element>>;

    /// Apply a batch of mutations (`None` removes). Returns false when
    /// the batch was refused; partial application is the backend's
    /// responsibility to avoid.
    fn patch_properties<'a>(
        &'a self,
        mutations: Vec<(PropName, Option<xmltree::Element>)>,
    ) -> NodeFuture<'a, bool>;
}

/// Storage quota reporting for a collection.
pub trait DavQuota: DavCollection {
    /// (used bytes, available bytes if known)
    fn quota_info<'a>(&'a self) -> NodeFuture<'a, (u64, Option<u64>)>;
}

/// Batched child lookup, to avoid per-path round-trips.
pub trait DavMultiGet: DavCollection {
    fn multiple_children<'a>(
        &'a self,
        names: &'a [String],
    ) -> NodeFuture<'a, Vec<Arc<dyn DavNode>>>;
}

/// Extended-collection creation (RFC5689), for backends with richer
/// resource types than plain `{DAV:}collection`.
pub trait DavExtendedMkCol: DavCollection {
    /// Create a child collection from the full MKCOL payload. The
    /// backend removes every property it handled from `mkcol`; leftovers
    /// go through the regular property-update path afterwards.
    fn create_extended_collection<'a>(
        &'a self,
        name: &'a str,
        mkcol: &'a mut MkCol,
    ) -> NodeFuture<'a, ()>;
}

/// A collection that can accept a cross-parent move directly.
pub trait DavMoveTarget: DavCollection {
    /// Returns false when the node cannot be accepted, in which case
    /// the tree falls back to copy + delete.
    fn move_into<'a>(
        &'a self,
        new_name: &'a str,
        source_path: &'a str,
        source: &'a Arc<dyn DavNode>,
    ) -> NodeFuture<'a, bool>;
}

/// Etag of a node, if its capabilities provide one.
pub fn node_etag(node: &dyn DavNode) -> Option<String> {
    node.as_file().and_then(|f| f.etag())
}
