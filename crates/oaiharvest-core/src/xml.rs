//! Owned XML tree for OAI-PMH responses and harvested records.
//!
//! Built from `quick-xml` events. Every element remembers the namespace
//! bindings in scope where it was parsed, so any subtree can be written out
//! as a standalone document without losing its prefixes. Lookups go by
//! local name, which lets OAI-PMH 1.1 and 2.0 shapes share one code path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::AppError;

/// Prefix to namespace-URI bindings; the default namespace uses the empty prefix.
pub type Namespaces = Arc<BTreeMap<String, String>>;

/// A child of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its attributes, children, and namespace scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    scope: Namespaces,
}

impl Element {
    /// Creates an empty element with the given qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            scope: Namespaces::default(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(&text.into());
        self
    }

    /// Sets an attribute, replacing an existing one with the same name.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    /// Parses a complete document and returns its root element.
    pub fn parse(bytes: &[u8]) -> Result<Element, AppError> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(start) => {
                    let scope = stack.last().map(|p| p.scope.clone()).unwrap_or_default();
                    stack.push(Element::open(&start, scope)?);
                }
                Event::Empty(start) => {
                    let scope = stack.last().map(|p| p.scope.clone()).unwrap_or_default();
                    let element = Element::open(&start, scope)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| AppError::XmlError("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = text
                            .unescape()
                            .map_err(|e| AppError::XmlError(e.to_string()))?;
                        parent.push_text(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.push_text(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(AppError::XmlError(
                "document ended inside an open element".to_string(),
            ));
        }
        root.ok_or_else(|| AppError::XmlError("document has no root element".to_string()))
    }

    pub fn parse_str(xml: &str) -> Result<Element, AppError> {
        Self::parse(xml.as_bytes())
    }

    fn open(start: &BytesStart<'_>, inherited: Namespaces) -> Result<Element, AppError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        let mut declared = Vec::new();

        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| AppError::XmlError(e.to_string()))?
                .into_owned();
            if key == "xmlns" {
                declared.push((String::new(), value.clone()));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                declared.push((prefix.to_string(), value.clone()));
            }
            attributes.push((key, value));
        }

        let scope = if declared.is_empty() {
            inherited
        } else {
            let mut bindings = (*inherited).clone();
            bindings.extend(declared);
            Arc::new(bindings)
        };

        Ok(Element {
            name,
            attributes,
            children: Vec::new(),
            scope,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Qualified name as written in the document.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// Namespace URI of this element, if bound.
    pub fn namespace(&self) -> Option<&str> {
        self.scope
            .get(self.prefix().unwrap_or(""))
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
    }

    /// Attribute by exact qualified name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute by local name, ignoring any prefix.
    pub fn attr_local(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.rsplit(':').next() == Some(local) && !k.starts_with("xmlns"))
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Child elements, skipping text.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// First child element with the given local name.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local)
    }

    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.local_name() == local)
    }

    /// Follows a path of child local names.
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |current, step| current.child(step))
    }

    /// All descendant elements with the given local name, in document order.
    pub fn descendants(&self, local: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        collect_descendants(self, local, &mut found);
        found
    }

    /// Concatenated text of this element and all its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    /// Text of the first child with the given local name, trimmed.
    pub fn child_text(&self, local: &str) -> Option<String> {
        self.child(local).map(|e| e.text().trim().to_string())
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Writes this element as a standalone document with an XML declaration.
    ///
    /// Namespace bindings inherited from ancestors are re-declared on the
    /// root so the output parses on its own.
    pub fn to_document(&self, indent: bool) -> Result<Vec<u8>, AppError> {
        let mut writer = if indent {
            Writer::new_with_indent(Vec::new(), b' ', 2)
        } else {
            Writer::new(Vec::new())
        };
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_error)?;
        self.write_into(&mut writer, true)?;
        Ok(writer.into_inner())
    }

    /// Standalone serialization without declaration or indentation.
    pub fn to_xml_string(&self) -> Result<String, AppError> {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer, true)?;
        String::from_utf8(writer.into_inner()).map_err(|e| AppError::XmlError(e.to_string()))
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>, standalone: bool) -> Result<(), AppError> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        if standalone {
            for (prefix, uri) in self.scope.iter() {
                let key = if prefix.is_empty() {
                    "xmlns".to_string()
                } else {
                    format!("xmlns:{prefix}")
                };
                if self.attr(&key).is_none() {
                    start.push_attribute((key.as_str(), uri.as_str()));
                }
            }
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(start)).map_err(write_error)?;
            return Ok(());
        }

        writer.write_event(Event::Start(start)).map_err(write_error)?;
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_into(writer, false)?,
                Node::Text(t) => writer
                    .write_event(Event::Text(BytesText::new(t)))
                    .map_err(write_error)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(write_error)?;
        Ok(())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_xml_string() {
            Ok(xml) => f.write_str(&xml),
            Err(_) => write!(f, "<{}/>", self.name),
        }
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), AppError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(AppError::XmlError(
            "document has more than one root element".to_string(),
        )),
    }
}

fn collect_descendants<'a>(element: &'a Element, local: &str, found: &mut Vec<&'a Element>) {
    for child in element.elements() {
        if child.local_name() == local {
            found.push(child);
        }
        collect_descendants(child, local, found);
    }
}

fn collect_text(element: &Element, out: &mut String) {
    for node in &element.children {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => collect_text(e, out),
        }
    }
}

fn write_error(e: impl fmt::Display) -> AppError {
    AppError::XmlError(e.to_string())
}

/// Collapses every run of whitespace into a single space and trims the ends.
pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
