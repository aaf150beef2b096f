//! The PROPPATCH request value object.
//!
//! One `PropPatch` carries the full mutation batch of a property
//! update. Handlers on the `propPatch` event claim the names they are
//! responsible for; anything left unclaimed fails the whole batch with
//! 403, and a failing claim demotes every other pending mutation to
//! 424 Failed Dependency. Updates are atomic: either everything is
//! applied, or nothing is.

use std::collections::{HashMap, HashSet};

use futures_util::future::BoxFuture;
use http::StatusCode;
use xmltree::Element;

use crate::errors::DavError;
use crate::xml::{self, PropName};
use crate::DavResult;

/// What a patch callback reports back.
pub enum PatchResult {
    /// Success / generic failure for every claimed name.
    Ok(bool),
    /// One status for a single claimed name.
    Status(StatusCode),
    /// A status per claimed name.
    PerProp(HashMap<PropName, StatusCode>),
}

type PatchFuture = BoxFuture<'static, DavResult<PatchResult>>;

/// A deferred mutation handler, registered by `handle` or
/// `handle_remaining` and invoked during `commit`.
pub enum PatchCallback {
    /// Claims one name; must not return `PatchResult::PerProp`.
    Single(Box<dyn FnOnce(Option<Element>) -> PatchFuture + Send>),
    /// Claims a group of names; must not return `PatchResult::Status`.
    Multi(Box<dyn FnOnce(HashMap<PropName, Option<Element>>) -> PatchFuture + Send>),
}

pub struct PropPatch {
    path: String,
    mutations: HashMap<PropName, Option<Element>>,
    result: HashMap<PropName, StatusCode>,
    /// Names with an explicit status; they can no longer be claimed.
    finalized: HashSet<PropName>,
    callbacks: Vec<(Vec<PropName>, PatchCallback)>,
}

/// Pending marker: claimed, waiting for commit.
const PENDING: StatusCode = StatusCode::ACCEPTED;

impl PropPatch {
    /// `None` values are removals.
    pub fn new(path: impl Into<String>, mutations: HashMap<PropName, Option<Element>>) -> PropPatch {
        let result = mutations
            .keys()
            .map(|name| (name.clone(), StatusCode::FORBIDDEN))
            .collect();
        PropPatch {
            path: path.into(),
            mutations,
            result,
            finalized: HashSet::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mutations(&self) -> &HashMap<PropName, Option<Element>> {
        &self.mutations
    }

    /// Claim a single name. No-op when the batch does not touch it or
    /// another handler already claimed it.
    pub fn handle(&mut self, name: &PropName, callback: PatchCallback) {
        if self.finalized.contains(name) || self.result.get(name) != Some(&StatusCode::FORBIDDEN) {
            return;
        }
        self.result.insert(name.clone(), PENDING);
        self.callbacks.push((vec![name.clone()], callback));
    }

    /// Claim a group of names in one go. Names the batch does not touch,
    /// or that another handler already claimed, are left out; when
    /// nothing remains the callback is dropped. By convention this is a
    /// `PatchCallback::Multi`.
    pub fn handle_multi(&mut self, names: &[PropName], callback: PatchCallback) {
        let names: Vec<PropName> = names
            .iter()
            .filter(|name| {
                !self.finalized.contains(*name)
                    && self.result.get(*name) == Some(&StatusCode::FORBIDDEN)
            })
            .cloned()
            .collect();
        if names.is_empty() {
            return;
        }
        for name in &names {
            self.result.insert(name.clone(), PENDING);
        }
        self.callbacks.push((names, callback));
    }

    /// Claim every name that is still unclaimed. The callback receives
    /// the full remaining mutation map; by convention this is a
    /// `PatchCallback::Multi`.
    pub fn handle_remaining(&mut self, callback: PatchCallback) {
        let names = self.remaining();
        if names.is_empty() {
            return;
        }
        for name in &names {
            self.result.insert(name.clone(), PENDING);
        }
        self.callbacks.push((names, callback));
    }

    /// Names of mutations no handler has claimed yet.
    pub fn remaining(&self) -> Vec<PropName> {
        self.result
            .iter()
            .filter(|(name, status)| {
                **status == StatusCode::FORBIDDEN && !self.finalized.contains(*name)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record a final status for one name without deferring to commit.
    pub fn set_result_code(&mut self, name: &PropName, status: StatusCode) {
        if self.result.contains_key(name) {
            self.result.insert(name.clone(), status);
            self.finalized.insert(name.clone());
        }
    }

    /// Record a final status for every unclaimed name.
    pub fn set_remaining_result_code(&mut self, status: StatusCode) {
        for name in self.remaining() {
            self.result.insert(name.clone(), status);
            self.finalized.insert(name);
        }
    }

    /// Run the claimed callbacks in registration order.
    ///
    /// Any pre-existing failure (an unclaimed 403, an explicit error
    /// status) aborts before the first callback runs. A callback
    /// failure stops the remaining callbacks. On failure every pending
    /// mutation, including successfully committed ones, reports 424.
    /// Returns whether the whole batch succeeded.
    pub async fn commit(&mut self) -> DavResult<bool> {
        let mut failed = self
            .result
            .values()
            .any(|status| status.is_client_error() || status.is_server_error());

        let callbacks = std::mem::take(&mut self.callbacks);
        for (names, callback) in callbacks {
            if failed {
                continue;
            }
            match callback {
                PatchCallback::Single(f) => {
                    let name = match names.into_iter().next() {
                        Some(name) => name,
                        None => continue,
                    };
                    let value = self.mutations.get(&name).cloned().flatten();
                    match f(value).await? {
                        PatchResult::Ok(true) => {}
                        PatchResult::Ok(false) => {
                            self.result.insert(name, StatusCode::FORBIDDEN);
                            failed = true;
                        }
                        PatchResult::Status(status) => {
                            if status.is_client_error() || status.is_server_error() {
                                failed = true;
                            }
                            self.result.insert(name, status);
                        }
                        PatchResult::PerProp(_) => {
                            return Err(DavError::Internal(
                                "single-property patch callback returned a result map".to_string(),
                            ));
                        }
                    }
                }
                PatchCallback::Multi(f) => {
                    let batch: HashMap<PropName, Option<Element>> = names
                        .iter()
                        .map(|name| (name.clone(), self.mutations.get(name).cloned().flatten()))
                        .collect();
                    match f(batch).await? {
                        PatchResult::Ok(true) => {}
                        PatchResult::Ok(false) => {
                            for name in names {
                                self.result.insert(name, StatusCode::FORBIDDEN);
                            }
                            failed = true;
                        }
                        PatchResult::PerProp(statuses) => {
                            for (name, status) in statuses {
                                if status.is_client_error() || status.is_server_error() {
                                    failed = true;
                                }
                                self.result.insert(name, status);
                            }
                        }
                        PatchResult::Status(_) => {
                            return Err(DavError::Internal(
                                "group patch callback returned a single status".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        // A committed removal answers 204, a committed set 200.
        for (name, status) in self.result.iter_mut() {
            if *status == PENDING {
                *status = if failed {
                    StatusCode::FAILED_DEPENDENCY
                } else if matches!(self.mutations.get(name), Some(None)) {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::OK
                };
            }
        }
        Ok(!failed)
    }

    pub fn result(&self) -> &HashMap<PropName, StatusCode> {
        &self.result
    }

    /// Bucket the result by status for a multi-status response. Values
    /// are never echoed back, only empty property elements.
    pub fn result_for_multi_status(&self) -> HashMap<StatusCode, Vec<Element>> {
        let mut buckets: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        for (name, status) in &self.result {
            buckets
                .entry(*status)
                .or_default()
                .push(xml::empty_element(name));
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Arc;

    fn batch(names: &[&str]) -> HashMap<PropName, Option<Element>> {
        names
            .iter()
            .map(|n| {
                (
                    PropName::dav(*n),
                    Some(xml::text_element(&PropName::dav(*n), "v")),
                )
            })
            .collect()
    }

    fn single_ok() -> PatchCallback {
        PatchCallback::Single(Box::new(|_| async { Ok(PatchResult::Ok(true)) }.boxed()))
    }

    #[tokio::test]
    async fn unclaimed_fails_everything() {
        let mut pp = PropPatch::new("node", batch(&["a", "b"]));
        pp.handle(&PropName::dav("a"), single_ok());
        // "b" was never claimed.
        assert!(!pp.commit().await.unwrap());
        assert_eq!(pp.result()[&PropName::dav("a")], StatusCode::FAILED_DEPENDENCY);
        assert_eq!(pp.result()[&PropName::dav("b")], StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn all_claimed_succeeds() {
        let mut pp = PropPatch::new("node", batch(&["a", "b"]));
        pp.handle(&PropName::dav("a"), single_ok());
        pp.handle_remaining(PatchCallback::Multi(Box::new(|_| {
            async { Ok(PatchResult::Ok(true)) }.boxed()
        })));
        assert!(pp.commit().await.unwrap());
        assert_eq!(pp.result()[&PropName::dav("a")], StatusCode::OK);
        assert_eq!(pp.result()[&PropName::dav("b")], StatusCode::OK);
    }

    #[tokio::test]
    async fn failure_short_circuits_later_callbacks() {
        let mut pp = PropPatch::new("node", batch(&["a", "b"]));
        pp.handle(
            &PropName::dav("a"),
            PatchCallback::Single(Box::new(|_| async { Ok(PatchResult::Ok(false)) }.boxed())),
        );
        pp.handle(
            &PropName::dav("b"),
            PatchCallback::Single(Box::new(|_| {
                async { panic!("must not run after a failure") }.boxed()
            })),
        );
        assert!(!pp.commit().await.unwrap());
        assert_eq!(pp.result()[&PropName::dav("a")], StatusCode::FORBIDDEN);
        assert_eq!(pp.result()[&PropName::dav("b")], StatusCode::FAILED_DEPENDENCY);
    }

    #[tokio::test]
    async fn per_prop_statuses_merge() {
        let mut pp = PropPatch::new("node", batch(&["a", "b"]));
        pp.handle_remaining(PatchCallback::Multi(Box::new(|muts| {
            async move {
                let statuses = muts
                    .keys()
                    .map(|name| {
                        let status = if name.name == "a" {
                            StatusCode::OK
                        } else {
                            StatusCode::CONFLICT
                        };
                        (name.clone(), status)
                    })
                    .collect();
                Ok(PatchResult::PerProp(statuses))
            }
            .boxed()
        })));
        assert!(!pp.commit().await.unwrap());
        // "a" keeps its explicit 200 even though the batch failed.
        assert_eq!(pp.result()[&PropName::dav("a")], StatusCode::OK);
        assert_eq!(pp.result()[&PropName::dav("b")], StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn contract_violation_is_internal_error() {
        let mut pp = PropPatch::new("node", batch(&["a"]));
        pp.handle(
            &PropName::dav("a"),
            PatchCallback::Single(Box::new(|_| {
                async { Ok(PatchResult::PerProp(HashMap::new())) }.boxed()
            })),
        );
        assert!(pp.commit().await.is_err());
    }

    #[tokio::test]
    async fn committed_removal_reports_no_content() {
        let mut mutations = batch(&["a"]);
        mutations.insert(PropName::dav("b"), None);
        let mut pp = PropPatch::new("node", mutations);
        pp.handle_remaining(PatchCallback::Multi(Box::new(|_| {
            async { Ok(PatchResult::Ok(true)) }.boxed()
        })));
        assert!(pp.commit().await.unwrap());
        assert_eq!(pp.result()[&PropName::dav("a")], StatusCode::OK);
        assert_eq!(pp.result()[&PropName::dav("b")], StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn handle_multi_claims_only_present_names() {
        let mut pp = PropPatch::new("node", batch(&["a", "b"]));
        let claimed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = claimed.clone();
        pp.handle_multi(
            &[PropName::dav("a"), PropName::dav("other")],
            PatchCallback::Multi(Box::new(move |muts| {
                async move {
                    seen.lock().unwrap().extend(muts.into_keys());
                    Ok(PatchResult::Ok(true))
                }
                .boxed()
            })),
        );
        pp.handle(&PropName::dav("b"), single_ok());
        assert!(pp.commit().await.unwrap());
        assert_eq!(&*claimed.lock().unwrap(), &[PropName::dav("a")]);
    }

    #[tokio::test]
    async fn double_claim_is_ignored() {
        let mut pp = PropPatch::new("node", batch(&["a"]));
        pp.handle(&PropName::dav("a"), single_ok());
        pp.handle(
            &PropName::dav("a"),
            PatchCallback::Single(Box::new(|_| {
                async { panic!("second claim must not run") }.boxed()
            })),
        );
        assert!(pp.commit().await.unwrap());
        assert_eq!(pp.result()[&PropName::dav("a")], StatusCode::OK);
    }

    #[tokio::test]
    async fn explicit_error_status_aborts() {
        let mut pp = PropPatch::new("node", batch(&["a", "b"]));
        pp.set_result_code(&PropName::dav("a"), StatusCode::CONFLICT);
        pp.handle(&PropName::dav("b"), single_ok());
        assert!(!pp.commit().await.unwrap());
        assert_eq!(pp.result()[&PropName::dav("b")], StatusCode::FAILED_DEPENDENCY);
    }
}
