//! The PROPFIND request value object.
//!
//! One `PropFind` describes the property set requested for one node.
//! Every requested name starts out at 404; handlers on the `propFind`
//! event resolve names one by one, and `items_left` lets later (and
//! more expensive) handlers skip their work entirely once everything
//! has been answered.

use std::collections::HashMap;

use http::StatusCode;
use xmltree::Element;

use crate::davheaders::Depth;
use crate::xml::{self, PropName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropFindType {
    /// An explicit `<prop>` list.
    Normal,
    /// `<allprop>` or an empty request body.
    AllProps,
    /// `<propname>`: names only, no values.
    PropName,
}

/// Default property set seeded for an allprop request.
pub(crate) fn allprop_names() -> Vec<PropName> {
    [
        "getlastmodified",
        "getcontentlength",
        "resourcetype",
        "quota-used-bytes",
        "quota-available-bytes",
        "getetag",
        "getcontenttype",
    ]
    .iter()
    .map(|n| PropName::dav(*n))
    .collect()
}

#[derive(Clone)]
pub struct PropFind {
    path: String,
    depth: Depth,
    request_type: PropFindType,
    result: HashMap<PropName, (StatusCode, Option<Element>)>,
    items_left: usize,
}

impl PropFind {
    pub fn new(path: impl Into<String>, request_type: PropFindType, names: Vec<PropName>, depth: Depth) -> PropFind {
        let names = match request_type {
            PropFindType::Normal => names,
            PropFindType::AllProps | PropFindType::PropName => allprop_names(),
        };
        let mut result = HashMap::new();
        for name in names {
            result.insert(name, (StatusCode::NOT_FOUND, None));
        }
        let items_left = result.len();
        PropFind {
            path: path.into(),
            depth,
            request_type,
            result,
            items_left,
        }
    }

    /// A fresh, unresolved copy of this request for a descendant node,
    /// used by the depth traversal.
    pub fn for_child(&self, path: impl Into<String>, depth: Depth) -> PropFind {
        let mut pf = self.clone();
        pf.path = path.into();
        pf.depth = depth;
        pf
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn depth(&self) -> Depth {
        self.depth
    }

    pub fn request_type(&self) -> PropFindType {
        self.request_type
    }

    pub fn is_all_props(&self) -> bool {
        self.request_type == PropFindType::AllProps
    }

    /// Resolve a property lazily. The thunk only runs while the name is
    /// still unresolved; a `None` result leaves it at 404.
    pub fn handle<F>(&mut self, name: &PropName, value: F)
    where
        F: FnOnce() -> Option<Element>,
    {
        if self.items_left == 0 {
            return;
        }
        match self.result.get(name) {
            Some((status, _)) if *status == StatusCode::NOT_FOUND => {}
            _ => return,
        }
        if let Some(elem) = value() {
            self.items_left -= 1;
            self.result
                .insert(name.clone(), (StatusCode::OK, Some(elem)));
        }
    }

    /// Explicitly set a property value and/or status.
    ///
    /// Without an explicit status, a missing value means 404 and a
    /// present one 200. For allprop requests an unseeded name is added
    /// to the result; otherwise it is ignored, since the client never
    /// asked for it.
    pub fn set(&mut self, name: &PropName, value: Option<Element>, status: Option<StatusCode>) {
        let status = status.unwrap_or(if value.is_none() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::OK
        });
        match self.result.get(name) {
            None => {
                if self.request_type != PropFindType::AllProps {
                    return;
                }
                if status == StatusCode::NOT_FOUND {
                    self.items_left += 1;
                }
                self.result.insert(name.clone(), (status, value));
            }
            Some((old_status, _)) => {
                if *old_status == StatusCode::NOT_FOUND && status != StatusCode::NOT_FOUND {
                    self.items_left -= 1;
                } else if *old_status != StatusCode::NOT_FOUND && status == StatusCode::NOT_FOUND {
                    self.items_left += 1;
                }
                self.result.insert(name.clone(), (status, value));
            }
        }
    }

    pub fn get(&self, name: &PropName) -> Option<&Element> {
        match self.result.get(name) {
            Some((_, Some(elem))) => Some(elem),
            _ => None,
        }
    }

    pub fn status(&self, name: &PropName) -> Option<StatusCode> {
        self.result.get(name).map(|(status, _)| *status)
    }

    /// Names still unresolved. Cheap early-out when nothing is left.
    pub fn load_404_properties(&self) -> Vec<PropName> {
        if self.items_left == 0 {
            return Vec::new();
        }
        self.result
            .iter()
            .filter(|(_, (status, _))| *status == StatusCode::NOT_FOUND)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Bucket the result by status code for a multi-status response.
    ///
    /// Allprop requests drop the 404 bucket: the client asked for
    /// "whatever you have", so absence is not an error. Propname
    /// requests report names only.
    pub fn result_for_multi_status(&self) -> HashMap<StatusCode, Vec<Element>> {
        let mut buckets: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        for (name, (status, value)) in &self.result {
            if *status == StatusCode::NOT_FOUND && self.request_type == PropFindType::AllProps {
                continue;
            }
            let elem = match value {
                Some(elem) if self.request_type != PropFindType::PropName => elem.clone(),
                _ => xml::empty_element(name),
            };
            buckets.entry(*status).or_default().push(elem);
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn text(s: &str) -> Element {
        xml::text_element(&PropName::dav("x"), s)
    }

    fn new_normal(names: &[&str]) -> PropFind {
        PropFind::new(
            "file",
            PropFindType::Normal,
            names.iter().map(|n| PropName::dav(*n)).collect(),
            Depth::Zero,
        )
    }

    #[test]
    fn handle_is_lazy_once_resolved() {
        let mut pf = new_normal(&["getetag"]);
        let name = PropName::dav("getetag");
        let calls = Cell::new(0);

        pf.handle(&name, || {
            calls.set(calls.get() + 1);
            Some(text("one"))
        });
        assert_eq!(calls.get(), 1);
        assert_eq!(pf.status(&name), Some(StatusCode::OK));

        // Resolved: the second thunk must not run.
        pf.handle(&name, || {
            calls.set(calls.get() + 1);
            Some(text("two"))
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn handle_skips_when_nothing_left() {
        let mut pf = new_normal(&["a"]);
        pf.set(&PropName::dav("a"), Some(text("v")), None);
        let calls = Cell::new(0);
        pf.handle(&PropName::dav("b"), || {
            calls.set(calls.get() + 1);
            Some(text("x"))
        });
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn handle_none_leaves_404() {
        let mut pf = new_normal(&["a"]);
        let name = PropName::dav("a");
        pf.handle(&name, || None);
        assert_eq!(pf.status(&name), Some(StatusCode::NOT_FOUND));
        assert_eq!(pf.load_404_properties(), vec![name]);
    }

    #[test]
    fn set_unseeded_ignored_for_normal() {
        let mut pf = new_normal(&["a"]);
        pf.set(&PropName::dav("extra"), Some(text("v")), None);
        assert_eq!(pf.status(&PropName::dav("extra")), None);
    }

    #[test]
    fn set_unseeded_added_for_allprops() {
        let mut pf = PropFind::new("x", PropFindType::AllProps, Vec::new(), Depth::Zero);
        let extra = PropName::new("urn:example", "extra");
        pf.set(&extra, Some(text("v")), None);
        assert_eq!(pf.status(&extra), Some(StatusCode::OK));
    }

    #[test]
    fn allprops_drops_404_bucket() {
        let mut pf = PropFind::new("x", PropFindType::AllProps, Vec::new(), Depth::Zero);
        pf.set(&PropName::dav("getetag"), Some(text("\"e\"")), None);
        let buckets = pf.result_for_multi_status();
        assert!(buckets.contains_key(&StatusCode::OK));
        assert!(!buckets.contains_key(&StatusCode::NOT_FOUND));
    }

    #[test]
    fn normal_keeps_404_bucket() {
        let pf = new_normal(&["unknown"]);
        let buckets = pf.result_for_multi_status();
        assert_eq!(buckets[&StatusCode::NOT_FOUND].len(), 1);
    }

    #[test]
    fn explicit_status_set() {
        let mut pf = new_normal(&["a"]);
        let name = PropName::dav("a");
        pf.set(&name, None, Some(StatusCode::FORBIDDEN));
        assert_eq!(pf.status(&name), Some(StatusCode::FORBIDDEN));
        // 404 -> 403 transition consumed the pending item.
        assert!(pf.load_404_properties().is_empty());
    }
}
