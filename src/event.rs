//! The typed event registry that plugins hook into.
//!
//! Every extension point is a named field with its own handler
//! signature, so a plugin cannot subscribe a handler with the wrong
//! shape and the compiler checks every emit site. Handlers run in
//! ascending priority order (ties keep subscription order); a handler
//! returns [`Flow::Handled`] to claim the event and stop propagation,
//! or [`Flow::Continue`] to let the next handler run.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use xmltree::Element;

use crate::conditional::IfCondition;
use crate::errors::DavError;
use crate::node::DavNode;
use crate::propfind::PropFind;
use crate::proppatch::PropPatch;
use crate::server::{DavContext, DavServer};
use crate::util::DavMethod;
use crate::DavResult;

/// What an event handler tells the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep running the remaining handlers.
    Continue,
    /// The event is dealt with; stop propagation.
    Handled,
}

/// Default handler priority. Lower runs earlier.
pub const PRIO_DEFAULT: u32 = 100;

pub type MethodHandler =
    Box<dyn for<'a> Fn(&'a DavServer, &'a mut DavContext) -> BoxFuture<'a, DavResult<Flow>> + Send + Sync>;

pub type PropFindHandler = Box<
    dyn for<'a> Fn(
            &'a DavServer,
            &'a mut PropFind,
            &'a Arc<dyn DavNode>,
        ) -> BoxFuture<'a, DavResult<Flow>>
        + Send
        + Sync,
>;

pub type PropPatchHandler =
    Box<dyn for<'a> Fn(&'a DavServer, &'a mut PropPatch) -> BoxFuture<'a, DavResult<Flow>> + Send + Sync>;

/// Handlers for events that carry a single path (bind/unbind, file
/// creation and content writes).
pub type PathHandler =
    Box<dyn for<'a> Fn(&'a DavServer, &'a str) -> BoxFuture<'a, DavResult<Flow>> + Send + Sync>;

/// Handlers for move events: (source, destination).
pub type MoveHandler = Box<
    dyn for<'a> Fn(&'a DavServer, &'a str, &'a str) -> BoxFuture<'a, DavResult<Flow>> + Send + Sync,
>;

/// Handlers that get to validate the state tokens of an `If` header.
/// A handler marks the conditions it recognizes as valid in place.
pub type TokenHandler = Box<
    dyn for<'a> Fn(
            &'a DavServer,
            &'a mut DavContext,
            &'a mut [IfCondition],
        ) -> BoxFuture<'a, DavResult<Flow>>
        + Send
        + Sync,
>;

/// Handlers for REPORT bodies. The element is the parsed report root;
/// an unclaimed report ends up as `ReportNotSupported`.
pub type ReportHandler = Box<
    dyn for<'a> Fn(
            &'a DavServer,
            &'a mut DavContext,
            &'a Element,
        ) -> BoxFuture<'a, DavResult<Flow>>
        + Send
        + Sync,
>;

/// Observers of request failures, for logging and cleanup. They cannot
/// change the response.
pub type ExceptionHandler =
    Box<dyn for<'a> Fn(&'a DavServer, &'a DavError) -> BoxFuture<'a, ()> + Send + Sync>;

/// A priority-ordered handler list.
pub struct Handlers<H> {
    entries: Vec<(u32, H)>,
}

impl<H> Default for Handlers<H> {
    fn default() -> Handlers<H> {
        Handlers { entries: Vec::new() }
    }
}

impl<H> Handlers<H> {
    pub fn add(&mut self, priority: u32, handler: H) {
        self.entries.push((priority, handler));
        // Stable: equal priorities keep subscription order.
        self.entries.sort_by_key(|(priority, _)| *priority);
    }

    pub fn iter(&self) -> impl Iterator<Item = &H> {
        self.entries.iter().map(|(_, handler)| handler)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All extension points of the engine. Plugins receive this once, in
/// [`crate::server::DavPlugin::initialize`], and subscribe what they need.
#[derive(Default)]
pub struct EventBus {
    /// Runs before method dispatch; may answer the request outright.
    pub before: Handlers<MethodHandler>,
    /// Like `before`, but only for one verb. These run ahead of the
    /// generic `before` list.
    pub before_method: HashMap<DavMethod, Handlers<MethodHandler>>,
    /// Per-method handlers.
    pub method: HashMap<DavMethod, Handlers<MethodHandler>>,
    /// Handlers that run for any method not claimed by a per-method one.
    pub method_any: Handlers<MethodHandler>,
    /// Runs after a method handler produced a response.
    pub after: Handlers<MethodHandler>,
    /// Like `after`, but only for one verb. These run ahead of the
    /// generic `after` list.
    pub after_method: HashMap<DavMethod, Handlers<MethodHandler>>,

    pub prop_find: Handlers<PropFindHandler>,
    pub prop_patch: Handlers<PropPatchHandler>,

    pub before_bind: Handlers<PathHandler>,
    pub after_bind: Handlers<PathHandler>,
    pub before_unbind: Handlers<PathHandler>,
    pub after_unbind: Handlers<PathHandler>,

    pub before_move: Handlers<MoveHandler>,
    pub after_move: Handlers<MoveHandler>,

    pub before_create_file: Handlers<PathHandler>,
    pub after_create_file: Handlers<PathHandler>,
    pub before_write_content: Handlers<PathHandler>,
    pub after_write_content: Handlers<PathHandler>,

    pub validate_tokens: Handlers<TokenHandler>,
    pub report: Handlers<ReportHandler>,
    pub exception: Handlers<ExceptionHandler>,
}

impl EventBus {
    /// Subscribe a per-method handler at the default priority.
    pub fn on_method(&mut self, method: DavMethod, handler: MethodHandler) {
        self.on_method_prio(method, PRIO_DEFAULT, handler);
    }

    pub fn on_method_prio(&mut self, method: DavMethod, priority: u32, handler: MethodHandler) {
        self.method.entry(method).or_default().add(priority, handler);
    }

    /// Subscribe to the before-dispatch event for one verb only.
    pub fn on_before_method(&mut self, method: DavMethod, handler: MethodHandler) {
        self.before_method
            .entry(method)
            .or_default()
            .add(PRIO_DEFAULT, handler);
    }

    /// Subscribe to the after-dispatch event for one verb only.
    pub fn on_after_method(&mut self, method: DavMethod, handler: MethodHandler) {
        self.after_method
            .entry(method)
            .or_default()
            .add(PRIO_DEFAULT, handler);
    }
}
