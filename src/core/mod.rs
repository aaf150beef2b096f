//! The built-in plugin implementing the base protocol: method handlers
//! for the HTTP and WebDAV verbs plus the property handlers for the
//! live `DAV:` properties.

use crate::event::EventBus;
use crate::server::DavPlugin;
use crate::util::DavMethod;
use crate::xml::PropName;

mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod handle_report;

/// Protected live properties run before the node handler.
const PRIO_PROTECTED: u32 = 90;
/// Dead-property resolution from the node backend.
const PRIO_NODE_PROPS: u32 = 120;
/// Late pass for derived properties.
const PRIO_LATE: u32 = 200;

#[derive(Default)]
pub struct CorePlugin;

impl CorePlugin {
    pub fn new() -> CorePlugin {
        CorePlugin
    }
}

impl DavPlugin for CorePlugin {
    fn name(&self) -> &'static str {
        "core"
    }

    fn initialize(&self, events: &mut EventBus) {
        events.on_method(DavMethod::Options, Box::new(handle_options::http_options));
        events.on_method(DavMethod::Get, Box::new(handle_gethead::http_get));
        events.on_method(DavMethod::Head, Box::new(handle_gethead::http_head));
        events.on_method(DavMethod::Put, Box::new(handle_put::http_put));
        events.on_method(DavMethod::Delete, Box::new(handle_delete::http_delete));
        events.on_method(DavMethod::MkCol, Box::new(handle_mkcol::http_mkcol));
        events.on_method(DavMethod::Copy, Box::new(handle_copymove::http_copy));
        events.on_method(DavMethod::Move, Box::new(handle_copymove::http_move));
        events.on_method(DavMethod::PropFind, Box::new(handle_props::http_propfind));
        events.on_method(DavMethod::PropPatch, Box::new(handle_props::http_proppatch));
        events.on_method(DavMethod::Report, Box::new(handle_report::http_report));

        events
            .prop_find
            .add(crate::event::PRIO_DEFAULT, Box::new(handle_props::prop_find_live));
        events
            .prop_find
            .add(PRIO_NODE_PROPS, Box::new(handle_props::prop_find_node));
        events
            .prop_find
            .add(PRIO_LATE, Box::new(handle_props::prop_find_late));

        events
            .prop_patch
            .add(PRIO_PROTECTED, Box::new(handle_props::prop_patch_protected));
        events
            .prop_patch
            .add(PRIO_LATE, Box::new(handle_props::prop_patch_node));
    }

    fn features(&self) -> Vec<&'static str> {
        // Compliance classes 1 and 3 plus extended-mkcol come from the
        // server itself.
        Vec::new()
    }

    fn supported_reports(&self) -> Vec<PropName> {
        Vec::new()
    }
}
