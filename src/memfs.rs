//! Simple in-memory node backend.
//!
//! Mostly useful for testing and demos: a tree of directories and
//! files held behind per-node mutexes, with dead-property storage,
//! quota reporting and batched child lookup. Etags are quoted MD5
//! sums of the file content.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use xmltree::Element;

use crate::errors::DavError;
use crate::node::{
    DavCollection, DavExtendedMkCol, DavFile, DavMultiGet, DavNode, DavProperties, DavQuota,
    FileBody, NodeFuture,
};
use crate::xml::{MkCol, PropName};

/// Create an empty in-memory tree and return its root collection.
pub fn new() -> Arc<dyn DavNode> {
    MemDir::new_root()
}

#[derive(Clone)]
enum MemEntry {
    Dir(Arc<MemDir>),
    File(Arc<MemFile>),
}

impl MemEntry {
    fn as_node(&self) -> Arc<dyn DavNode> {
        match self {
            MemEntry::Dir(d) => d.clone(),
            MemEntry::File(f) => f.clone(),
        }
    }
}

pub struct MemDir {
    self_ref: Weak<MemDir>,
    inner: Mutex<DirInner>,
}

struct DirInner {
    name: String,
    parent: Weak<MemDir>,
    children: HashMap<String, MemEntry>,
    props: HashMap<PropName, Element>,
    mtime: SystemTime,
    crtime: SystemTime,
}

pub struct MemFile {
    inner: Mutex<FileInner>,
}

struct FileInner {
    name: String,
    parent: Weak<MemDir>,
    data: Bytes,
    props: HashMap<PropName, Element>,
    mtime: SystemTime,
    crtime: SystemTime,
}

fn content_etag(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn guess_content_type(name: &str) -> Option<String> {
    mime_guess::from_path(name).first_raw().map(|m| m.to_string())
}

impl MemDir {
    fn new_root() -> Arc<MemDir> {
        let now = SystemTime::now();
        Arc::new_cyclic(|weak| MemDir {
            self_ref: weak.clone(),
            inner: Mutex::new(DirInner {
                name: String::new(),
                parent: Weak::new(),
                children: HashMap::new(),
                props: HashMap::new(),
                mtime: now,
                crtime: now,
            }),
        })
    }

    fn new_child(&self, name: &str) -> Arc<MemDir> {
        let parent = self.self_ref.clone();
        let now = SystemTime::now();
        Arc::new_cyclic(|weak| MemDir {
            self_ref: weak.clone(),
            inner: Mutex::new(DirInner {
                name: name.to_string(),
                parent,
                children: HashMap::new(),
                props: HashMap::new(),
                mtime: now,
                crtime: now,
            }),
        })
    }

    fn used_bytes(&self) -> u64 {
        let children: Vec<MemEntry> = self.inner.lock().children.values().cloned().collect();
        children
            .iter()
            .map(|entry| match entry {
                MemEntry::File(f) => f.inner.lock().data.len() as u64,
                MemEntry::Dir(d) => d.used_bytes(),
            })
            .sum()
    }

    fn remove_child(&self, name: &str) -> Option<MemEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.children.remove(name);
        if entry.is_some() {
            inner.mtime = SystemTime::now();
        }
        entry
    }
}

impl DavNode for MemDir {
    fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    fn rename<'a>(&'a self, new_name: &'a str) -> NodeFuture<'a, ()> {
        async move {
            let (parent, old_name) = {
                let inner = self.inner.lock();
                (inner.parent.upgrade(), inner.name.clone())
            };
            let parent = parent.ok_or(DavError::Forbidden("the root collection cannot be renamed".to_string()))?;
            let entry = parent
                .remove_child(&old_name)
                .ok_or(DavError::NotFound)?;
            self.inner.lock().name = new_name.to_string();
            parent
                .inner
                .lock()
                .children
                .insert(new_name.to_string(), entry);
            Ok(())
        }
        .boxed()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        Some(self.inner.lock().mtime)
    }

    fn created(&self) -> Option<SystemTime> {
        Some(self.inner.lock().crtime)
    }

    fn delete<'a>(&'a self) -> NodeFuture<'a, ()> {
        async move {
            let (parent, name) = {
                let inner = self.inner.lock();
                (inner.parent.upgrade(), inner.name.clone())
            };
            let parent = parent.ok_or(DavError::Forbidden("the root collection cannot be deleted".to_string()))?;
            parent.remove_child(&name).ok_or(DavError::NotFound)?;
            Ok(())
        }
        .boxed()
    }

    fn as_collection(&self) -> Option<&dyn DavCollection> {
        Some(self)
    }
    fn as_properties(&self) -> Option<&dyn DavProperties> {
        Some(self)
    }
    fn as_quota(&self) -> Option<&dyn DavQuota> {
        Some(self)
    }
    fn as_multi_get(&self) -> Option<&dyn DavMultiGet> {
        Some(self)
    }
    fn as_extended_mkcol(&self) -> Option<&dyn DavExtendedMkCol> {
        Some(self)
    }
}

impl DavCollection for MemDir {
    fn child<'a>(&'a self, name: &'a str) -> NodeFuture<'a, Arc<dyn DavNode>> {
        async move {
            self.inner
                .lock()
                .children
                .get(name)
                .map(|entry| entry.as_node())
                .ok_or(DavError::NotFound)
        }
        .boxed()
    }

    fn children<'a>(&'a self) -> NodeFuture<'a, Vec<Arc<dyn DavNode>>> {
        async move {
            Ok(self
                .inner
                .lock()
                .children
                .values()
                .map(|entry| entry.as_node())
                .collect())
        }
        .boxed()
    }

    fn child_exists<'a>(&'a self, name: &'a str) -> NodeFuture<'a, bool> {
        async move { Ok(self.inner.lock().children.contains_key(name)) }.boxed()
    }

    fn create_file<'a>(&'a self, name: &'a str, data: FileBody) -> NodeFuture<'a, Option<String>> {
        async move {
            let data = data.into_bytes().await?;
            let etag = content_etag(&data);
            let now = SystemTime::now();
            let file = Arc::new(MemFile {
                inner: Mutex::new(FileInner {
                    name: name.to_string(),
                    parent: self.self_ref.clone(),
                    data,
                    props: HashMap::new(),
                    mtime: now,
                    crtime: now,
                }),
            });
            let mut inner = self.inner.lock();
            inner.children.insert(name.to_string(), MemEntry::File(file));
            inner.mtime = SystemTime::now();
            Ok(Some(etag))
        }
        .boxed()
    }

    fn create_directory<'a>(&'a self, name: &'a str) -> NodeFuture<'a, ()> {
        async move {
            let dir = self.new_child(name);
            let mut inner = self.inner.lock();
            if inner.children.contains_key(name) {
                return Err(DavError::Conflict(format!("{} already exists", name)));
            }
            inner.children.insert(name.to_string(), MemEntry::Dir(dir));
            inner.mtime = SystemTime::now();
            Ok(())
        }
        .boxed()
    }
}

impl DavProperties for MemDir {
    fn properties<'a>(
        &'a self,
        names: &'a [PropName],
    ) -> NodeFuture<'a, HashMap<PropName, Element>> {
        async move {
            let props = &self.inner.lock().props;
            Ok(select_props(props, names))
        }
        .boxed()
    }

    fn patch_properties<'a>(
        &'a self,
        mutations: Vec<(PropName, Option<Element>)>,
    ) -> NodeFuture<'a, bool> {
        async move {
            apply_props(&mut self.inner.lock().props, mutations);
            Ok(true)
        }
        .boxed()
    }
}

impl DavQuota for MemDir {
    fn quota_info<'a>(&'a self) -> NodeFuture<'a, (u64, Option<u64>)> {
        async move { Ok((self.used_bytes(), None)) }.boxed()
    }
}

impl DavMultiGet for MemDir {
    fn multiple_children<'a>(&'a self, names: &'a [String]) -> NodeFuture<'a, Vec<Arc<dyn DavNode>>> {
        async move {
            let inner = self.inner.lock();
            Ok(names
                .iter()
                .filter_map(|name| inner.children.get(name).map(|entry| entry.as_node()))
                .collect())
        }
        .boxed()
    }
}

impl DavExtendedMkCol for MemDir {
    fn create_extended_collection<'a>(
        &'a self,
        name: &'a str,
        mkcol: &'a mut MkCol,
    ) -> NodeFuture<'a, ()> {
        async move {
            // Plain collections only; anything fancier is for richer
            // backends.
            if !mkcol.is_plain_collection() {
                return Err(DavError::InvalidResourceType);
            }
            self.create_directory(name).await?;
            if !mkcol.properties.is_empty() {
                let node = self.child(name).await?;
                if let Some(props) = node.as_properties() {
                    let mutations = mkcol
                        .properties
                        .drain()
                        .map(|(k, v)| (k, Some(v)))
                        .collect();
                    props.patch_properties(mutations).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }
}

impl DavNode for MemFile {
    fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    fn rename<'a>(&'a self, new_name: &'a str) -> NodeFuture<'a, ()> {
        async move {
            let (parent, old_name) = {
                let inner = self.inner.lock();
                (inner.parent.upgrade(), inner.name.clone())
            };
            let parent = parent.ok_or(DavError::NotFound)?;
            let entry = parent.remove_child(&old_name).ok_or(DavError::NotFound)?;
            self.inner.lock().name = new_name.to_string();
            parent
                .inner
                .lock()
                .children
                .insert(new_name.to_string(), entry);
            Ok(())
        }
        .boxed()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        Some(self.inner.lock().mtime)
    }

    fn created(&self) -> Option<SystemTime> {
        Some(self.inner.lock().crtime)
    }

    fn delete<'a>(&'a self) -> NodeFuture<'a, ()> {
        async move {
            let (parent, name) = {
                let inner = self.inner.lock();
                (inner.parent.upgrade(), inner.name.clone())
            };
            let parent = parent.ok_or(DavError::NotFound)?;
            parent.remove_child(&name).ok_or(DavError::NotFound)?;
            Ok(())
        }
        .boxed()
    }

    fn as_file(&self) -> Option<&dyn DavFile> {
        Some(self)
    }
    fn as_properties(&self) -> Option<&dyn DavProperties> {
        Some(self)
    }
}

impl DavFile for MemFile {
    fn get<'a>(&'a self) -> NodeFuture<'a, FileBody> {
        async move { Ok(FileBody::Bytes(self.inner.lock().data.clone())) }.boxed()
    }

    fn put<'a>(&'a self, data: FileBody) -> NodeFuture<'a, Option<String>> {
        async move {
            let data = data.into_bytes().await?;
            let etag = content_etag(&data);
            let mut inner = self.inner.lock();
            inner.data = data;
            inner.mtime = SystemTime::now();
            Ok(Some(etag))
        }
        .boxed()
    }

    fn size(&self) -> Option<u64> {
        Some(self.inner.lock().data.len() as u64)
    }

    fn etag(&self) -> Option<String> {
        Some(content_etag(&self.inner.lock().data))
    }

    fn content_type(&self) -> Option<String> {
        guess_content_type(&self.inner.lock().name)
    }
}

impl DavProperties for MemFile {
    fn properties<'a>(
        &'a self,
        names: &'a [PropName],
    ) -> NodeFuture<'a, HashMap<PropName, Element>> {
        async move {
            let props = &self.inner.lock().props;
            Ok(select_props(props, names))
        }
        .boxed()
    }

    fn patch_properties<'a>(
        &'a self,
        mutations: Vec<(PropName, Option<Element>)>,
    ) -> NodeFuture<'a, bool> {
        async move {
            apply_props(&mut self.inner.lock().props, mutations);
            Ok(true)
        }
        .boxed()
    }
}

fn select_props(
    props: &HashMap<PropName, Element>,
    names: &[PropName],
) -> HashMap<PropName, Element> {
    if names.is_empty() {
        return props.clone();
    }
    names
        .iter()
        .filter_map(|name| props.get(name).map(|value| (name.clone(), value.clone())))
        .collect()
}

fn apply_props(props: &mut HashMap<PropName, Element>, mutations: Vec<(PropName, Option<Element>)>) {
    for (name, value) in mutations {
        match value {
            Some(value) => {
                props.insert(name, value);
            }
            None => {
                props.remove(&name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_lifecycle() {
        let root = MemDir::new_root();
        let etag = root
            .create_file("hello.txt", FileBody::from(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(etag.as_deref(), Some("\"5d41402abc4b2a76b9719d911017c592\""));

        let node = root.child("hello.txt").await.unwrap();
        let file = node.as_file().unwrap();
        assert_eq!(file.size(), Some(5));
        assert_eq!(file.content_type().as_deref(), Some("text/plain"));

        let new_etag = file.put(FileBody::from(b"changed!".to_vec())).await.unwrap();
        assert_ne!(new_etag, etag);
        assert_eq!(file.size(), Some(8));

        node.delete().await.unwrap();
        assert!(!root.child_exists("hello.txt").await.unwrap());
    }

    #[tokio::test]
    async fn rename_keeps_entry() {
        let root = MemDir::new_root();
        root.create_directory("old").await.unwrap();
        let node = root.child("old").await.unwrap();
        node.rename("new").await.unwrap();
        assert!(!root.child_exists("old").await.unwrap());
        assert!(root.child_exists("new").await.unwrap());
        assert_eq!(node.name(), "new");
    }

    #[tokio::test]
    async fn quota_counts_recursively() {
        let root = MemDir::new_root();
        root.create_file("a", FileBody::from(b"12345".to_vec()))
            .await
            .unwrap();
        root.create_directory("sub").await.unwrap();
        let sub = root.child("sub").await.unwrap();
        sub.as_collection()
            .unwrap()
            .create_file("b", FileBody::from(b"123".to_vec()))
            .await
            .unwrap();
        let (used, available) = root.as_quota().unwrap().quota_info().await.unwrap();
        assert_eq!(used, 8);
        assert_eq!(available, None);
    }

    #[tokio::test]
    async fn dead_properties_roundtrip() {
        let root = MemDir::new_root();
        root.create_file("f", FileBody::empty()).await.unwrap();
        let node = root.child("f").await.unwrap();
        let props = node.as_properties().unwrap();
        let name = PropName::new("urn:example", "color");
        let value = crate::xml::text_element(&name, "green");
        assert!(props
            .patch_properties(vec![(name.clone(), Some(value))])
            .await
            .unwrap());
        let found = props.properties(&[name.clone()]).await.unwrap();
        assert_eq!(
            found.get(&name).and_then(crate::xml::element_text).as_deref(),
            Some("green")
        );
        props.patch_properties(vec![(name.clone(), None)]).await.unwrap();
        assert!(props.properties(&[name]).await.unwrap().is_empty());
    }
}
