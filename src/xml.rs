//! XML service: parsing request documents, Clark-notation property
//! names, and writing multi-status / error response documents.
//!
//! Parsed values are `xmltree::Element`s; serialization goes through
//! the `xml-rs` event writer so we control prefixes and namespaces.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

use http::StatusCode;
use xml::common::XmlVersion;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as XmlWEvent};
use xmltree::{Element, XMLNode};

use crate::errors::DavError;
use crate::DavResult;

pub const NS_DAV: &str = "DAV:";
pub const NS_SABRE: &str = "http://sabredav.org/ns";
pub const NS_CALENDARSERVER: &str = "http://calendarserver.org/ns/";

/// An XML-qualified property name, written in Clark notation as
/// `{namespace}localname`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropName {
    pub namespace: String,
    pub name: String,
}

impl PropName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> PropName {
        PropName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Shorthand for a name in the `DAV:` namespace.
    pub fn dav(name: impl Into<String>) -> PropName {
        PropName::new(NS_DAV, name)
    }

    /// Parse `{namespace}name`. A bare name gets an empty namespace.
    pub fn parse_clark(s: &str) -> DavResult<PropName> {
        if let Some(rest) = s.strip_prefix('{') {
            match rest.find('}') {
                Some(pos) if pos + 1 < rest.len() => {
                    Ok(PropName::new(&rest[..pos], &rest[pos + 1..]))
                }
                _ => Err(DavError::BadRequest(format!("invalid clark notation: {}", s))),
            }
        } else if s.is_empty() {
            Err(DavError::BadRequest("empty property name".to_string()))
        } else {
            Ok(PropName::new("", s))
        }
    }

    pub fn clark(&self) -> String {
        format!("{{{}}}{}", self.namespace, self.name)
    }

    /// The qualified name of a parsed element.
    pub fn of_element(elem: &Element) -> PropName {
        PropName::new(elem.namespace.as_deref().unwrap_or(""), elem.name.as_str())
    }
}

impl fmt::Display for PropName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clark())
    }
}

/// A parsed MKCOL payload: the requested resource types plus any
/// initial properties. Backends with extended-collection support take
/// the whole struct and remove the properties they handled.
#[derive(Debug, Default)]
pub struct MkCol {
    pub resource_type: Vec<PropName>,
    pub properties: HashMap<PropName, Element>,
}

impl MkCol {
    /// A plain `{DAV:}collection` request (empty MKCOL body).
    pub fn plain_collection() -> MkCol {
        MkCol {
            resource_type: vec![PropName::dav("collection")],
            properties: HashMap::new(),
        }
    }

    pub fn is_plain_collection(&self) -> bool {
        self.resource_type.len() == 1 && self.resource_type[0] == PropName::dav("collection")
    }
}

/// Parse an XML document body.
pub fn parse(data: &[u8]) -> DavResult<Element> {
    Element::parse(Cursor::new(data)).map_err(DavError::from)
}

/// Parse an XML document and require a specific `DAV:` root element.
pub fn expect(root: &str, data: &[u8]) -> DavResult<Element> {
    let elem = parse(data)?;
    if elem.name != root || elem.namespace.as_deref() != Some(NS_DAV) {
        return Err(DavError::XmlParseError(format!(
            "expected {{DAV:}}{} document, got {}",
            root,
            PropName::of_element(&elem)
        )));
    }
    Ok(elem)
}

/// An empty element with the given qualified name.
pub fn empty_element(name: &PropName) -> Element {
    let mut elem = Element::new(&name.name);
    elem.namespace = Some(name.namespace.clone());
    elem
}

/// An element with the given qualified name and text content.
pub fn text_element(name: &PropName, text: impl Into<String>) -> Element {
    let mut elem = empty_element(name);
    elem.children.push(XMLNode::Text(text.into()));
    elem
}

/// Child elements of an element (ignoring text/comment nodes).
pub fn child_elements(elem: &Element) -> impl Iterator<Item = &Element> {
    elem.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

/// Flat text content of an element.
pub fn element_text(elem: &Element) -> Option<String> {
    elem.get_text().map(|t| t.into_owned())
}

fn prefix_for(ns: &str) -> Option<&'static str> {
    match ns {
        NS_DAV => Some("D"),
        NS_SABRE => Some("S"),
        NS_CALENDARSERVER => Some("CS"),
        _ => None,
    }
}

// Serialize an element tree. Elements in well-known namespaces use the
// prefixes declared on the document root; anything else gets an inline
// default-namespace declaration.
fn write_element<W: std::io::Write>(
    w: &mut EventWriter<W>,
    elem: &Element,
) -> DavResult<()> {
    let ns = elem.namespace.as_deref().unwrap_or("");
    let qname;
    let mut ev = match prefix_for(ns) {
        Some(pfx) => {
            qname = format!("{}:{}", pfx, elem.name);
            XmlWEvent::start_element(qname.as_str())
        }
        None if ns.is_empty() => XmlWEvent::start_element(elem.name.as_str()),
        None => XmlWEvent::start_element(elem.name.as_str()).attr("xmlns", ns),
    };
    for (name, value) in &elem.attributes {
        ev = ev.attr(name.as_str(), value);
    }
    w.write(ev)?;
    for child in &elem.children {
        match child {
            XMLNode::Element(e) => write_element(w, e)?,
            XMLNode::Text(t) => w.write(XmlWEvent::characters(t))?,
            _ => {}
        }
    }
    w.write(XmlWEvent::end_element())?;
    Ok(())
}

fn new_writer<'a>(root: impl Into<XmlWEvent<'a>>) -> DavResult<EventWriter<Vec<u8>>> {
    let mut w = EventWriter::new_with_config(
        Vec::new(),
        EmitterConfig::new()
            .normalize_empty_elements(true)
            .perform_indent(false),
    );
    w.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    w.write(root)?;
    Ok(w)
}

/// Incremental writer for a `{DAV:}multistatus` document.
pub struct MultiStatus {
    w: EventWriter<Vec<u8>>,
}

impl MultiStatus {
    pub fn new() -> DavResult<MultiStatus> {
        let root = XmlWEvent::start_element("D:multistatus")
            .ns("D", NS_DAV)
            .ns("S", NS_SABRE)
            .ns("CS", NS_CALENDARSERVER);
        Ok(MultiStatus { w: new_writer(root)? })
    }

    /// One `{DAV:}response` with per-status `propstat` blocks.
    pub fn add_response(
        &mut self,
        href: &str,
        propstat: HashMap<StatusCode, Vec<Element>>,
    ) -> DavResult<()> {
        self.w.write(XmlWEvent::start_element("D:response"))?;
        self.w.write(XmlWEvent::start_element("D:href"))?;
        self.w.write(XmlWEvent::characters(href))?;
        self.w.write(XmlWEvent::end_element())?;

        let mut statuses: Vec<&StatusCode> = propstat.keys().collect();
        statuses.sort();
        for status in statuses {
            self.w.write(XmlWEvent::start_element("D:propstat"))?;
            self.w.write(XmlWEvent::start_element("D:prop"))?;
            for elem in &propstat[status] {
                write_element(&mut self.w, elem)?;
            }
            self.w.write(XmlWEvent::end_element())?;
            self.w.write(XmlWEvent::start_element("D:status"))?;
            self.w.write(XmlWEvent::characters(&status_line(*status)))?;
            self.w.write(XmlWEvent::end_element())?;
            self.w.write(XmlWEvent::end_element())?;
        }

        self.w.write(XmlWEvent::end_element())?;
        Ok(())
    }

    pub fn finish(mut self) -> DavResult<Vec<u8>> {
        self.w.write(XmlWEvent::end_element())?;
        Ok(self.w.into_inner())
    }
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

/// Render a `{DAV:}error` document for a failed request.
pub fn error_document(err: &DavError, debug: bool) -> Vec<u8> {
    // Writing this document cannot itself fail (the sink is a Vec);
    // fall back to an empty body if it somehow does.
    fn build(err: &DavError, debug: bool) -> DavResult<Vec<u8>> {
        let root = XmlWEvent::start_element("D:error")
            .ns("D", NS_DAV)
            .ns("S", NS_SABRE);
        let mut w = new_writer(root)?;

        w.write(XmlWEvent::start_element("S:exception"))?;
        w.write(XmlWEvent::characters(err.name()))?;
        w.write(XmlWEvent::end_element())?;

        w.write(XmlWEvent::start_element("S:message"))?;
        w.write(XmlWEvent::characters(&err.to_string()))?;
        w.write(XmlWEvent::end_element())?;

        if debug {
            w.write(XmlWEvent::start_element("S:backtrace"))?;
            w.write(XmlWEvent::characters(&format!("{:?}", err)))?;
            w.write(XmlWEvent::end_element())?;
        }

        if let Some(extra) = err.serialize() {
            write_element(&mut w, &extra)?;
        }

        w.write(XmlWEvent::end_element())?;
        Ok(w.into_inner())
    }
    build(err, debug).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clark_roundtrip() {
        let p = PropName::parse_clark("{DAV:}resourcetype").unwrap();
        assert_eq!(p, PropName::dav("resourcetype"));
        assert_eq!(p.clark(), "{DAV:}resourcetype");
        assert!(PropName::parse_clark("{DAV:").is_err());
        assert_eq!(
            PropName::parse_clark("displayname").unwrap(),
            PropName::new("", "displayname")
        );
    }

    #[test]
    fn expect_checks_root() {
        let body = br#"<?xml version="1.0"?><D:propfind xmlns:D="DAV:"><D:allprop/></D:propfind>"#;
        assert!(expect("propfind", body).is_ok());
        assert!(expect("propertyupdate", body).is_err());
    }

    #[test]
    fn multistatus_shape() {
        let mut ms = MultiStatus::new().unwrap();
        let mut map = HashMap::new();
        map.insert(
            StatusCode::OK,
            vec![text_element(&PropName::dav("displayname"), "x")],
        );
        map.insert(StatusCode::NOT_FOUND, vec![empty_element(&PropName::dav("missing"))]);
        ms.add_response("/file", map).unwrap();
        let out = String::from_utf8(ms.finish().unwrap()).unwrap();
        assert!(out.contains("<D:multistatus"));
        assert!(out.contains("<D:href>/file</D:href>"));
        assert!(out.contains("HTTP/1.1 200 OK"));
        assert!(out.contains("HTTP/1.1 404 Not Found"));
        assert!(out.contains("<D:displayname>x</D:displayname>"));
    }

    #[test]
    fn error_body() {
        let out = error_document(&DavError::InvalidResourceType, false);
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("<D:error"));
        assert!(s.contains("<S:exception>InvalidResourceType</S:exception>"));
        assert!(s.contains("valid-resourcetype"));
    }
}
