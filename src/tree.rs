//! Path-to-node resolution over a backend, with a lookup cache and the
//! structural operations (copy, move, delete) built on the node
//! capability traits.
//!
//! The cache maps normalized paths to resolved nodes so that a request
//! touching the same subtree repeatedly (a PROPFIND traversal, the
//! precondition checks plus the method handler) resolves each path
//! once. Mutating operations purge the affected prefix with
//! [`Tree::mark_dirty`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::errors::DavError;
use crate::node::{DavNode, FileBody};
use crate::util::{join_path, split_path};
use crate::DavResult;

pub struct Tree {
    root: Arc<dyn DavNode>,
    cache: Mutex<HashMap<String, Arc<dyn DavNode>>>,
}

impl Tree {
    pub fn new(root: Arc<dyn DavNode>) -> Tree {
        Tree {
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a normalized path to a node. The empty path is the root.
    pub fn node_for_path<'a>(&'a self, path: &'a str) -> BoxFuture<'a, DavResult<Arc<dyn DavNode>>> {
        async move {
            if path.is_empty() {
                return Ok(self.root.clone());
            }
            if let Some(node) = self.cache.lock().get(path) {
                return Ok(node.clone());
            }
            let (parent_path, name) = split_path(path);
            let parent = self.node_for_path(parent_path).await?;
            let collection = parent.as_collection().ok_or(DavError::NotFound)?;
            let node = collection.child(name).await?;
            self.cache.lock().insert(path.to_string(), node.clone());
            Ok(node)
        }
        .boxed()
    }

    /// Existence probe. Uses the parent's `child_exists` so that a
    /// missing node is an answer, not an error.
    pub async fn node_exists(&self, path: &str) -> DavResult<bool> {
        if path.is_empty() {
            return Ok(true);
        }
        if self.cache.lock().contains_key(path) {
            return Ok(true);
        }
        let (parent_path, name) = split_path(path);
        let parent = match self.node_for_path(parent_path).await {
            Ok(node) => node,
            Err(DavError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        match parent.as_collection() {
            Some(collection) => collection.child_exists(name).await,
            None => Ok(false),
        }
    }

    /// Children of a collection, cached under their full paths.
    pub async fn children(&self, path: &str) -> DavResult<Vec<Arc<dyn DavNode>>> {
        let node = self.node_for_path(path).await?;
        let collection = node
            .as_collection()
            .ok_or_else(|| DavError::Conflict(format!("{} is not a collection", path)))?;
        let children = collection.children().await?;
        let mut cache = self.cache.lock();
        for child in &children {
            cache.insert(join_path(path, &child.name()), child.clone());
        }
        Ok(children)
    }

    /// Resolve many paths at once, batching siblings through the
    /// parent's multi-get capability when it has one. Paths that do not
    /// resolve are left out of the result.
    pub async fn multiple_nodes(
        &self,
        paths: &[String],
    ) -> DavResult<Vec<(String, Arc<dyn DavNode>)>> {
        let mut by_parent: HashMap<String, Vec<String>> = HashMap::new();
        for path in paths {
            let (parent, name) = split_path(path);
            by_parent
                .entry(parent.to_string())
                .or_default()
                .push(name.to_string());
        }

        let mut result = Vec::new();
        for (parent_path, names) in by_parent {
            let parent = match self.node_for_path(&parent_path).await {
                Ok(node) => node,
                Err(DavError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            match parent.as_multi_get() {
                Some(mg) => {
                    let nodes = mg.multiple_children(&names).await?;
                    let mut cache = self.cache.lock();
                    for node in nodes {
                        let path = join_path(&parent_path, &node.name());
                        cache.insert(path.clone(), node.clone());
                        result.push((path, node));
                    }
                }
                None => {
                    for name in names {
                        let path = join_path(&parent_path, &name);
                        match self.node_for_path(&path).await {
                            Ok(node) => result.push((path, node)),
                            Err(DavError::NotFound) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// Recursive copy. Dead properties travel with the node when both
    /// ends support them.
    pub async fn copy(&self, source: &str, destination: &str) -> DavResult<()> {
        let source_node = self.node_for_path(source).await?;
        let (dest_parent_path, dest_name) = split_path(destination);
        let dest_parent = self.node_for_path(dest_parent_path).await?;
        self.copy_node(&source_node, &dest_parent, dest_name).await?;
        self.mark_dirty(destination);
        Ok(())
    }

    fn copy_node<'a>(
        &'a self,
        source: &'a Arc<dyn DavNode>,
        dest_parent: &'a Arc<dyn DavNode>,
        name: &'a str,
    ) -> BoxFuture<'a, DavResult<()>> {
        async move {
            let parent = dest_parent
                .as_collection()
                .ok_or_else(|| DavError::Conflict("copy destination parent is not a collection".to_string()))?;

            if let Some(file) = source.as_file() {
                let body = file.get().await?;
                let data = body.into_bytes().await?;
                parent.create_file(name, FileBody::Bytes(data)).await?;
            } else if let Some(collection) = source.as_collection() {
                parent.create_directory(name).await?;
                let new_parent = parent.child(name).await?;
                for child in collection.children().await? {
                    let child_name = child.name();
                    self.copy_node(&child, &new_parent, &child_name).await?;
                }
            } else {
                return Err(DavError::Forbidden(
                    "source node is neither a file nor a collection".to_string(),
                ));
            }

            if let Some(props) = source.as_properties() {
                let all = props.properties(&[]).await?;
                if !all.is_empty() {
                    let copy = parent.child(name).await?;
                    if let Some(dest_props) = copy.as_properties() {
                        let mutations = all.into_iter().map(|(k, v)| (k, Some(v))).collect();
                        dest_props.patch_properties(mutations).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Move a node. A move within one parent is a rename; across
    /// parents the destination may accept the node directly, otherwise
    /// it degrades to copy plus delete.
    pub async fn move_node(&self, source: &str, destination: &str) -> DavResult<()> {
        let (source_parent, _) = split_path(source);
        let (dest_parent_path, dest_name) = split_path(destination);

        if source_parent == dest_parent_path {
            let node = self.node_for_path(source).await?;
            node.rename(dest_name).await?;
        } else {
            let source_node = self.node_for_path(source).await?;
            let dest_parent = self.node_for_path(dest_parent_path).await?;
            let moved = match dest_parent.as_move_target() {
                Some(target) => target.move_into(dest_name, source, &source_node).await?,
                None => false,
            };
            if !moved {
                self.copy_node(&source_node, &dest_parent, dest_name).await?;
                source_node.delete().await?;
            }
        }
        self.mark_dirty(source);
        self.mark_dirty(destination);
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> DavResult<()> {
        let node = self.node_for_path(path).await?;
        node.delete().await?;
        self.mark_dirty(path);
        Ok(())
    }

    /// Purge the cache for a path and everything below it.
    pub fn mark_dirty(&self, path: &str) {
        let prefix = format!("{}/", path);
        self.cache
            .lock()
            .retain(|key, _| key != path && !key.starts_with(&prefix));
    }
}
