// src/archive/xml.rs

//! Minimal queryable element tree built on quick-xml
//!
//! Namespaces are ignored: elements and attributes are addressed by their
//! local name.

use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated text and CDATA content directly inside this element
    pub text: String,
}

impl Element {
    /// Parse a document and return its root element
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    stack.push(Self::from_start(&e)?);
                }
                Ok(Event::Empty(e)) => {
                    let element = Self::from_start(&e)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::MalformedManifest(e.to_string()))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        Error::MalformedManifest("unexpected closing tag".to_string())
                    })?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::MalformedManifest(format!(
                        "XML error at position {}: {}",
                        reader.buffer_position(),
                        e
                    )));
                }
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(Error::MalformedManifest(
                "unexpected end of document".to_string(),
            ));
        }

        root.ok_or_else(|| Error::MalformedManifest("document has no root element".to_string()))
    }

    fn from_start(e: &BytesStart) -> Result<Self> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| Error::MalformedManifest(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            // xmlns declarations are not data
            if key == "xmlns" || attr.key.as_ref().starts_with(b"xmlns:") {
                continue;
            }
            let value = attr
                .unescape_value()
                .map_err(|e| Error::MalformedManifest(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }

        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => *root = Some(element),
            None => {
                return Err(Error::MalformedManifest(
                    "document has more than one root element".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Value of an attribute
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child element with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All child elements with the given name, in document order
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Text content with surrounding whitespace removed
    pub fn text(&self) -> &str {
        self.text.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<package name="com.example.plugin" xmlns="http://example.com/package">
    <packageinformation>
        <packagename>Plugin &amp; Co</packagename>
        <packagename language="de"><![CDATA[Erweiterung]]></packagename>
    </packageinformation>
    <empty flag="1"/>
</package>"#;

        let root = Element::parse(xml).unwrap();
        assert_eq!(root.name, "package");
        assert_eq!(root.attr("name"), Some("com.example.plugin"));
        assert_eq!(root.attr("xmlns"), None);

        let info = root.child("packageinformation").unwrap();
        let names: Vec<_> = info.children_named("packagename").collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].text(), "Plugin & Co");
        assert_eq!(names[1].attr("language"), Some("de"));
        assert_eq!(names[1].text(), "Erweiterung");

        assert_eq!(root.child("empty").unwrap().attr("flag"), Some("1"));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(
            Element::parse("<package><a></package>"),
            Err(Error::MalformedManifest(_))
        ));
        assert!(matches!(
            Element::parse("<package>"),
            Err(Error::MalformedManifest(_))
        ));
        assert!(matches!(Element::parse(""), Err(Error::MalformedManifest(_))));
        assert!(matches!(
            Element::parse("<a/><b/>"),
            Err(Error::MalformedManifest(_))
        ));
    }
}
