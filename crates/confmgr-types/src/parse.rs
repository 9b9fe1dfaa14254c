//! XML parser producing [`XmlNode`] trees.
//!
//! A single-pass recursive-descent parser covering the XML subset that
//! appears on the NETCONF wire: elements, attributes, character data with
//! entity references, comments, CDATA sections, and namespace declarations.
//! Prefixes are resolved to URIs during the parse; the resulting tree stores
//! resolved namespaces only.

use std::collections::HashMap;

use thiserror::Error;

use crate::xml::XmlNode;

/// Errors from [`parse_xml`]. The offset is a byte position in the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XmlParseError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("expected '{expected}' at byte {offset}")]
    Expected { expected: char, offset: usize },

    #[error("invalid element name at byte {0}")]
    InvalidName(usize),

    #[error("mismatched closing tag '{found}' at byte {offset}, expected '{expected}'")]
    MismatchedTag {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("undeclared namespace prefix '{prefix}' at byte {offset}")]
    UndeclaredPrefix { prefix: String, offset: usize },

    #[error("unknown entity reference '&{0};'")]
    UnknownEntity(String),

    #[error("trailing content after document element at byte {0}")]
    TrailingContent(usize),

    #[error("no document element found")]
    NoElement,
}

/// Parses a complete XML document into a single root [`XmlNode`].
pub fn parse_xml(input: &str) -> Result<XmlNode, XmlParseError> {
    let mut parser = Parser {
        input: input.as_bytes(),
        pos: 0,
    };
    parser.skip_misc();
    if parser.at_end() {
        return Err(XmlParseError::NoElement);
    }
    let root = parser.parse_element(&HashMap::new())?;
    parser.skip_misc();
    if !parser.at_end() {
        return Err(XmlParseError::TrailingContent(parser.pos));
    }
    Ok(root)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, c: u8) -> Result<(), XmlParseError> {
        match self.bump() {
            Some(b) if b == c => Ok(()),
            Some(_) => Err(XmlParseError::Expected {
                expected: c as char,
                offset: self.pos - 1,
            }),
            None => Err(XmlParseError::UnexpectedEof(self.pos)),
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s.as_bytes())
    }

    fn skip_until(&mut self, s: &str) -> Result<(), XmlParseError> {
        while !self.at_end() {
            if self.starts_with(s) {
                self.pos += s.len();
                return Ok(());
            }
            self.pos += 1;
        }
        Err(XmlParseError::UnexpectedEof(self.pos))
    }

    /// Skips whitespace, processing instructions, and comments.
    fn skip_misc(&mut self) {
        loop {
            self.skip_ws();
            if self.starts_with("<?") {
                if self.skip_until("?>").is_err() {
                    return;
                }
            } else if self.starts_with("<!--") {
                if self.skip_until("-->").is_err() {
                    return;
                }
            } else {
                return;
            }
        }
    }

    fn parse_name(&mut self) -> Result<String, XmlParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(XmlParseError::InvalidName(start));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_quoted(&mut self) -> Result<String, XmlParseError> {
        let quote = match self.bump() {
            Some(q @ (b'"' | b'\'')) => q,
            Some(_) => {
                return Err(XmlParseError::Expected {
                    expected: '"',
                    offset: self.pos - 1,
                })
            }
            None => return Err(XmlParseError::UnexpectedEof(self.pos)),
        };
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == quote {
                let raw = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                self.pos += 1;
                return decode_entities(&raw);
            }
            self.pos += 1;
        }
        Err(XmlParseError::UnexpectedEof(self.pos))
    }

    /// Parses one element. `ns_scope` maps prefixes to URIs; the empty-string
    /// key is the default namespace.
    fn parse_element(
        &mut self,
        ns_scope: &HashMap<String, String>,
    ) -> Result<XmlNode, XmlParseError> {
        self.expect(b'<')?;
        let tag_offset = self.pos;
        let qname = self.parse_name()?;

        let mut raw_attrs: Vec<(String, String)> = Vec::new();
        let mut scope = ns_scope.clone();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'/') | Some(b'>') | None => break,
                _ => {}
            }
            let attr_name = self.parse_name()?;
            self.skip_ws();
            self.expect(b'=')?;
            self.skip_ws();
            let value = self.parse_quoted()?;
            if attr_name == "xmlns" {
                scope.insert(String::new(), value);
            } else if let Some(prefix) = attr_name.strip_prefix("xmlns:") {
                scope.insert(prefix.to_string(), value);
            } else {
                // Attribute prefixes are dropped; only the local name matters
                // to the backend (e.g. nc:operation and operation are the same).
                let local = attr_name.rsplit(':').next().unwrap_or(&attr_name);
                raw_attrs.push((local.to_string(), value));
            }
        }

        let (prefix, local) = split_qname(&qname);
        let namespace = match prefix {
            Some(p) => Some(scope.get(p).cloned().ok_or(XmlParseError::UndeclaredPrefix {
                prefix: p.to_string(),
                offset: tag_offset,
            })?),
            None => scope.get("").cloned(),
        };

        let mut node = XmlNode::new(local);
        if let Some(ns) = namespace {
            node.set_namespace(ns);
        }
        for (name, value) in raw_attrs {
            node.set_attr(name, value);
        }

        // Self-closing?
        if self.peek() == Some(b'/') {
            self.pos += 1;
            self.expect(b'>')?;
            return Ok(node);
        }
        self.expect(b'>')?;

        // Content: text, children, comments, CDATA, then the closing tag.
        let mut text = String::new();
        loop {
            if self.at_end() {
                return Err(XmlParseError::UnexpectedEof(self.pos));
            }
            if self.starts_with("</") {
                self.pos += 2;
                let close_offset = self.pos;
                let close = self.parse_name()?;
                self.skip_ws();
                self.expect(b'>')?;
                if close != qname {
                    return Err(XmlParseError::MismatchedTag {
                        expected: qname,
                        found: close,
                        offset: close_offset,
                    });
                }
                break;
            } else if self.starts_with("<!--") {
                self.skip_until("-->")?;
            } else if self.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let start = self.pos;
                self.skip_until("]]>")?;
                text.push_str(&String::from_utf8_lossy(
                    &self.input[start..self.pos - 3],
                ));
            } else if self.peek() == Some(b'<') {
                let child = self.parse_element(&scope)?;
                node.push(child);
            } else {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b'<' {
                        break;
                    }
                    self.pos += 1;
                }
                let raw = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                text.push_str(&decode_entities(&raw)?);
            }
        }

        let trimmed = text.trim();
        if !trimmed.is_empty() {
            node.set_body(Some(trimmed.to_string()));
        }
        Ok(node)
    }
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn decode_entities(s: &str) -> Result<String, XmlParseError> {
    if !s.contains('&') {
        return Ok(s.to_string());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &s[i + 1..];
        let Some(end) = rest.find(';') else {
            return Err(XmlParseError::UnknownEntity(rest.to_string()));
        };
        let entity = &rest[..end];
        match entity {
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "amp" => out.push('&'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()));
                match code.and_then(char::from_u32) {
                    Some(c) => out.push(c),
                    None => return Err(XmlParseError::UnknownEntity(entity.to_string())),
                }
            }
        }
        // Skip over the consumed entity.
        for _ in 0..end + 1 {
            chars.next();
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple() {
        let node = parse_xml("<x>7</x>").unwrap();
        assert_eq!(node.name(), "x");
        assert_eq!(node.body(), Some("7"));
    }

    #[test]
    fn test_parse_default_namespace() {
        let node = parse_xml(r#"<x xmlns="urn:ex">7</x>"#).unwrap();
        assert_eq!(node.namespace(), Some("urn:ex"));
    }

    #[test]
    fn test_parse_prefixed_namespace() {
        let node = parse_xml(r#"<ex:x xmlns:ex="urn:ex">7</ex:x>"#).unwrap();
        assert_eq!(node.name(), "x");
        assert_eq!(node.namespace(), Some("urn:ex"));
    }

    #[test]
    fn test_namespace_inherited_by_children() {
        let node = parse_xml(r#"<a xmlns="urn:ex"><b>1</b></a>"#).unwrap();
        assert_eq!(node.children()[0].namespace(), Some("urn:ex"));
    }

    #[test]
    fn test_undeclared_prefix_rejected() {
        let err = parse_xml("<ex:x>7</ex:x>").unwrap_err();
        assert!(matches!(err, XmlParseError::UndeclaredPrefix { .. }));
    }

    #[test]
    fn test_parse_attributes_and_self_closing() {
        let node = parse_xml(r#"<rpc message-id="42"><get/></rpc>"#).unwrap();
        assert_eq!(node.attr("message-id"), Some("42"));
        assert_eq!(node.children()[0].name(), "get");
    }

    #[test]
    fn test_attribute_prefix_stripped() {
        let node = parse_xml(
            r#"<x xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0" nc:operation="delete"/>"#,
        )
        .unwrap();
        assert_eq!(node.attr("operation"), Some("delete"));
    }

    #[test]
    fn test_entities_decoded() {
        let node = parse_xml("<m>a &lt; b &amp; c &#65;</m>").unwrap();
        assert_eq!(node.body(), Some("a < b & c A"));
    }

    #[test]
    fn test_comments_and_decl_skipped() {
        let node = parse_xml("<?xml version=\"1.0\"?><!-- hi --><x><!-- in -->1</x>").unwrap();
        assert_eq!(node.body(), Some("1"));
    }

    #[test]
    fn test_cdata() {
        let node = parse_xml("<m><![CDATA[a <raw> b]]></m>").unwrap();
        assert_eq!(node.body(), Some("a <raw> b"));
    }

    #[test]
    fn test_mismatched_tag() {
        let err = parse_xml("<a><b></a></b>").unwrap_err();
        assert!(matches!(err, XmlParseError::MismatchedTag { .. }));
    }

    #[test]
    fn test_truncated_input() {
        let err = parse_xml("<edit-config><target><cand").unwrap_err();
        assert!(matches!(err, XmlParseError::UnexpectedEof(_)));
    }

    #[test]
    fn test_trailing_content() {
        let err = parse_xml("<a/><b/>").unwrap_err();
        assert!(matches!(err, XmlParseError::TrailingContent(_)));
    }

    #[test]
    fn test_roundtrip_render() {
        let text = r#"<edit-config><target><candidate/></target><config><x xmlns="urn:ex">7</x></config></edit-config>"#;
        let node = parse_xml(text).unwrap();
        assert_eq!(node.render(), text);
    }
}
