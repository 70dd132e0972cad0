//! Minimal element tree over `quick-xml` events.
//!
//! Both upstreams return small documents, so they are materialized fully and
//! navigated by local name. Namespaces and prefixes are ignored and name
//! matching is case-insensitive.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("malformed xml at byte {position}: {message}")]
    Malformed { position: usize, message: String },
    #[error("unexpected document shape: {0}")]
    UnexpectedShape(String),
    #[error("soap fault: {0}")]
    Fault(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    fn named(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Trimmed text content, `None` when blank.
    pub fn text(&self) -> Option<&str> {
        let text = self.text.trim();
        (!text.is_empty()).then_some(text)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.is(name))
    }

    /// First element along a `/`-separated path of child names.
    pub fn find(&self, path: &str) -> Option<&XmlElement> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, step| node.child(step))
    }

    /// Every element reachable along the path, fanning out at each step.
    pub fn find_all(&self, path: &str) -> Vec<&XmlElement> {
        let mut current = vec![self];
        for step in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|node| node.children.iter().filter(move |c| c.is(step)))
                .collect();
        }
        current
    }

    pub fn text_at(&self, path: &str) -> Option<String> {
        self.find(path).and_then(XmlElement::text).map(str::to_string)
    }

    /// Depth-first descendants with the given name. Matching elements are not
    /// searched further.
    pub fn descendants(&self, name: &str) -> Vec<&XmlElement> {
        let mut out = Vec::new();
        collect_descendants(self, name, &mut out);
        out
    }
}

fn collect_descendants<'a>(node: &'a XmlElement, name: &str, out: &mut Vec<&'a XmlElement>) {
    for child in &node.children {
        if child.is(name) {
            out.push(child);
        } else {
            collect_descendants(child, name, out);
        }
    }
}

pub fn parse_document(body: &[u8]) -> Result<XmlElement, XmlError> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| malformed(&reader, e.to_string()))?;
        match event {
            Event::Start(start) => {
                let mut element = XmlElement::named(local_name(start.local_name().as_ref()));
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| malformed(&reader, e.to_string()))?;
                    let value = attr
                        .unescape_value()
                        .map_err(|e| malformed(&reader, e.to_string()))?;
                    element
                        .attributes
                        .push((local_name(attr.key.local_name().as_ref()), value.into_owned()));
                }
                stack.push(element);
            }
            Event::Empty(start) => {
                let mut element = XmlElement::named(local_name(start.local_name().as_ref()));
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| malformed(&reader, e.to_string()))?;
                    let value = attr
                        .unescape_value()
                        .map_err(|e| malformed(&reader, e.to_string()))?;
                    element
                        .attributes
                        .push((local_name(attr.key.local_name().as_ref()), value.into_owned()));
                }
                attach(&mut stack, &mut root, element)
                    .map_err(|message| malformed(&reader, message))?;
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| malformed(&reader, e.to_string()))?;
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(malformed(&reader, "text outside the root element".into())),
                }
            }
            Event::CData(data) => {
                let bytes = data.into_inner();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| malformed(&reader, "unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, element)
                    .map_err(|message| malformed(&reader, message))?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(XmlError::Malformed {
            position: body.len(),
            message: format!("unclosed element <{}>", open.name),
        });
    }
    root.ok_or_else(|| XmlError::Malformed {
        position: 0,
        message: "document has no root element".to_string(),
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(format!("second root element <{}>", element.name)),
    }
}

fn malformed(reader: &Reader<&[u8]>, message: String) -> XmlError {
    XmlError::Malformed {
        position: reader.buffer_position(),
        message,
    }
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Unwraps a SOAP 1.1 envelope. A `Fault` in the body becomes
/// [`XmlError::Fault`]; a document that is not an envelope is returned as is.
pub fn soap_body(root: &XmlElement) -> Result<&XmlElement, XmlError> {
    if !root.is("Envelope") {
        return Ok(root);
    }
    let body = root
        .child("Body")
        .ok_or_else(|| XmlError::UnexpectedShape("soap envelope without Body".to_string()))?;
    if let Some(fault) = body.child("Fault") {
        let reason = fault
            .text_at("faultstring")
            .or_else(|| fault.text_at("Reason/Text"))
            .unwrap_or_else(|| "unspecified fault".to_string());
        return Err(XmlError::Fault(reason));
    }
    Ok(body)
}

/// First bytes of a body for error reports.
pub fn snippet(body: &[u8]) -> String {
    const MAX: usize = 160;
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
