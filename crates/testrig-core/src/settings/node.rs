//! A small owned XML tree that keeps everything it does not understand.
//!
//! Attribute order, comments, CDATA sections and unknown elements all
//! survive a parse/serialize cycle, so editing one node never drops user
//! content elsewhere in the document.

use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::error::{SettingsError, SettingsResult};

/// Child content of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlContent {
    Element(XmlNode),
    Text(String),
    CData(String),
    Comment(String),
}

/// An element with ordered attributes and mixed children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlContent>,
}

impl XmlNode {
    /// An empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(XmlContent::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    /// Attribute value, matched case-sensitively.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute lookup ignoring the case of the attribute name.
    pub fn attr_ignore_case(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter_map(|c| match c {
            XmlContent::Element(node) => Some(node),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlNode> {
        self.children.iter_mut().filter_map(|c| match c {
            XmlContent::Element(node) => Some(node),
            _ => None,
        })
    }

    /// First child element named `name`.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.elements().find(|n| n.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        self.elements_mut().find(|n| n.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.elements().filter(move |n| n.name == name)
    }

    /// Follow a path of element names from this node.
    pub fn find_path(&self, path: &[&str]) -> Option<&XmlNode> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Return the first child with `name`, appending an empty one if absent.
    pub fn ensure_child(&mut self, name: &str) -> &mut XmlNode {
        let index = match self
            .children
            .iter()
            .position(|c| matches!(c, XmlContent::Element(n) if n.name == name))
        {
            Some(index) => index,
            None => {
                self.children.push(XmlContent::Element(XmlNode::new(name)));
                self.children.len() - 1
            }
        };
        match &mut self.children[index] {
            XmlContent::Element(node) => node,
            _ => unreachable!("position matched an element"),
        }
    }

    /// Walk `path`, creating only the missing elements.
    pub fn ensure_path(&mut self, path: &[&str]) -> &mut XmlNode {
        path.iter()
            .fold(self, |node, name| node.ensure_child(name))
    }

    /// Append `child` after the existing content.
    pub fn push_child(&mut self, child: XmlNode) {
        self.children.push(XmlContent::Element(child));
    }

    /// Concatenated text and CDATA content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                XmlContent::Text(t) | XmlContent::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replace text content, leaving child elements and comments alone.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children
            .retain(|c| !matches!(c, XmlContent::Text(_) | XmlContent::CData(_)));
        self.children.push(XmlContent::Text(text.into()));
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> SettingsResult<XmlNode> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(element_from(&start)?),
                Event::Empty(start) => {
                    let node = element_from(&start)?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| SettingsError::Malformed("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|e| SettingsError::Malformed(e.to_string()))?;
                    if let Some(parent) = stack.last_mut() {
                        if !value.trim().is_empty() {
                            parent.children.push(XmlContent::Text(value.into_owned()));
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                        parent.children.push(XmlContent::CData(value));
                    }
                }
                Event::Comment(comment) => {
                    if let Some(parent) = stack.last_mut() {
                        let value = String::from_utf8_lossy(&comment.into_inner()).into_owned();
                        parent.children.push(XmlContent::Comment(value));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(SettingsError::Malformed(format!(
                "element <{}> is never closed",
                open.name
            )));
        }
        root.ok_or(SettingsError::MissingRoot)
    }

    /// Serialize as an indented document with an XML declaration.
    pub fn to_xml(&self) -> SettingsResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        write_node(&mut writer, self)?;
        String::from_utf8(writer.into_inner()).map_err(|e| SettingsError::Malformed(e.to_string()))
    }
}

fn element_from(start: &BytesStart<'_>) -> SettingsResult<XmlNode> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut node = XmlNode::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SettingsError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| SettingsError::Malformed(e.to_string()))?
            .into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> SettingsResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlContent::Element(node)),
        None if root.is_none() => *root = Some(node),
        None => {
            return Err(SettingsError::Malformed(format!(
                "second root element <{}>",
                node.name
            )))
        }
    }
    Ok(())
}

fn write_node<W: std::io::Write>(writer: &mut Writer<W>, node: &XmlNode) -> SettingsResult<()> {
    let mut start = BytesStart::new(node.name.as_str());
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if node.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &node.children {
        match child {
            XmlContent::Element(inner) => write_node(writer, inner)?,
            XmlContent::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
            XmlContent::CData(text) => {
                writer.write_event(Event::CData(BytesCData::new(text.as_str())))?
            }
            XmlContent::Comment(text) => {
                writer.write_event(Event::Comment(BytesText::from_escaped(text.as_str())))?
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(node.name.as_str())))?;
    Ok(())
}
