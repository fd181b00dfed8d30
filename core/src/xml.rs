//! Minimal XML reading and writing for the CIM-XML codec.
//!
//! # Design
//! CIM-XML needs far less than a general XML stack: no namespaces, no
//! DTD validation, a bounded response size. The writer emits well-formed
//! UTF-8 with standard escaping and rejects characters XML 1.0 cannot
//! carry. The reader is a single-pass scanner that builds an element tree
//! and records the line/column of every element, so schema violations
//! found later still point at the offending input.
//!
//! Whitespace handling is split by layer: the reader keeps text nodes
//! verbatim; consumers use [`XmlElement::elements`] (which skips
//! whitespace-only text between elements) for structure and
//! [`XmlElement::text`] where character content is significant.

use crate::error::WbemError;

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Streaming XML writer. Elements are opened with [`start`](Self::start),
/// attributed while still open, and closed in LIFO order; an element with
/// no content is emitted in the short `<X/>` form.
pub struct XmlWriter {
    buf: String,
    stack: Vec<&'static str>,
    tag_open: bool,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self {
            buf: String::from("<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n"),
            stack: Vec::new(),
            tag_open: false,
        }
    }

    pub fn start(&mut self, name: &'static str) {
        self.close_open_tag();
        self.buf.push('<');
        self.buf.push_str(name);
        self.stack.push(name);
        self.tag_open = true;
    }

    /// Add an attribute to the element opened by the latest `start`.
    pub fn attr(&mut self, key: &'static str, value: &str) -> Result<(), WbemError> {
        debug_assert!(self.tag_open, "attr() outside an open start tag");
        let escaped = escape(value)?;
        self.buf.push(' ');
        self.buf.push_str(key);
        self.buf.push_str("=\"");
        self.buf.push_str(&escaped);
        self.buf.push('"');
        Ok(())
    }

    pub fn text(&mut self, content: &str) -> Result<(), WbemError> {
        self.close_open_tag();
        self.buf.push_str(&escape(content)?);
        Ok(())
    }

    pub fn end(&mut self) {
        let name = self.stack.pop().expect("end() without matching start()");
        if self.tag_open {
            self.buf.push_str("/>");
            self.tag_open = false;
        } else {
            self.buf.push_str("</");
            self.buf.push_str(name);
            self.buf.push('>');
        }
    }

    /// Shorthand for a childless element carrying only text.
    pub fn text_element(&mut self, name: &'static str, content: &str) -> Result<(), WbemError> {
        self.start(name);
        self.text(content)?;
        self.end();
        Ok(())
    }

    pub fn finish(mut self) -> String {
        debug_assert!(self.stack.is_empty(), "unclosed elements at finish()");
        self.close_open_tag();
        self.buf
    }

    fn close_open_tag(&mut self) {
        if self.tag_open {
            self.buf.push('>');
            self.tag_open = false;
        }
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape text for element content or attribute values. Characters outside
/// the XML 1.0 character range are not representable and are rejected.
fn escape(s: &str) -> Result<String, WbemError> {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => {
                return Err(WbemError::model(format!(
                    "character U+{:04X} cannot be represented in XML 1.0",
                    c as u32
                )));
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub line: u32,
    pub column: u32,
}

impl XmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Child elements, skipping whitespace-only text between them.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    /// Concatenated character content, verbatim.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let XmlNode::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// True when the element holds no child elements and no non-whitespace
    /// text.
    pub fn is_hollow(&self) -> bool {
        self.children.iter().all(|n| match n {
            XmlNode::Element(_) => false,
            XmlNode::Text(t) => t.trim().is_empty(),
        })
    }

    pub(crate) fn parse_error(&self, message: impl Into<String>) -> WbemError {
        WbemError::parse_at(message.into(), self.line, self.column)
    }
}

/// Parse a complete document and return its root element.
pub fn parse_document(input: &str) -> Result<XmlElement, WbemError> {
    let mut scanner = Scanner::new(input);
    scanner.skip_misc()?;
    let root = scanner.element()?;
    scanner.skip_misc()?;
    if !scanner.at_end() {
        return Err(scanner.error("content after document root"));
    }
    Ok(root)
}

struct Scanner<'a> {
    input: &'a [u8],
    text: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            input: text.as_bytes(),
            text,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> WbemError {
        WbemError::parse_at(message.into(), self.line, self.column)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else if b & 0xC0 != 0x80 {
            // count characters, not continuation bytes
            self.column += 1;
        }
        Some(b)
    }

    fn eat(&mut self, expected: &str) -> bool {
        if self.text[self.pos..].starts_with(expected) {
            for _ in 0..expected.len() {
                self.bump();
            }
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.bump();
        }
    }

    /// Skip whitespace, the XML declaration, processing instructions,
    /// comments, and a DOCTYPE, in any order, outside the root element.
    fn skip_misc(&mut self) -> Result<(), WbemError> {
        loop {
            self.skip_whitespace();
            if self.eat("<?") {
                self.skip_until("?>")?;
            } else if self.text[self.pos..].starts_with("<!--") {
                self.comment()?;
            } else if self.eat("<!DOCTYPE") {
                self.skip_until(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_until(&mut self, terminator: &str) -> Result<(), WbemError> {
        while !self.at_end() {
            if self.eat(terminator) {
                return Ok(());
            }
            self.bump();
        }
        Err(self.error(format!("unterminated construct, expected {terminator:?}")))
    }

    fn comment(&mut self) -> Result<(), WbemError> {
        if !self.eat("<!--") {
            return Err(self.error("expected comment"));
        }
        self.skip_until("-->")
    }

    fn name(&mut self) -> Result<String, WbemError> {
        let start = self.pos;
        match self.peek() {
            Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b':' => {
                self.bump();
            }
            _ => return Err(self.error("expected a name")),
        }
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'.' | b'-') {
                self.bump();
            } else {
                break;
            }
        }
        Ok(self.text[start..self.pos].to_string())
    }

    fn element(&mut self) -> Result<XmlElement, WbemError> {
        let (line, column) = (self.line, self.column);
        if self.bump() != Some(b'<') {
            return Err(self.error("expected element"));
        }
        let name = self.name()?;
        let mut attrs: Vec<(String, String)> = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.bump();
                    if self.bump() != Some(b'>') {
                        return Err(self.error("expected '>' after '/'"));
                    }
                    return Ok(XmlElement {
                        name,
                        attrs,
                        children: Vec::new(),
                        line,
                        column,
                    });
                }
                Some(b'>') => {
                    self.bump();
                    break;
                }
                Some(_) => {
                    let key = self.name()?;
                    self.skip_whitespace();
                    if self.bump() != Some(b'=') {
                        return Err(self.error(format!("attribute {key:?} lacks '='")));
                    }
                    self.skip_whitespace();
                    let quote = match self.bump() {
                        Some(q @ (b'"' | b'\'')) => q,
                        _ => return Err(self.error(format!("attribute {key:?} value not quoted"))),
                    };
                    let value = self.quoted_value(quote)?;
                    if attrs.iter().any(|(k, _)| *k == key) {
                        return Err(self.error(format!("duplicate attribute {key:?}")));
                    }
                    attrs.push((key, value));
                }
                None => return Err(self.error("unexpected end of input in start tag")),
            }
        }

        let children = self.content(&name)?;
        Ok(XmlElement {
            name,
            attrs,
            children,
            line,
            column,
        })
    }

    fn quoted_value(&mut self, quote: u8) -> Result<String, WbemError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                Some(q) if q == quote => {
                    self.bump();
                    return Ok(out);
                }
                Some(b'&') => out.push(self.entity()?),
                Some(b'<') => return Err(self.error("'<' in attribute value")),
                Some(_) => {
                    let start = self.pos;
                    self.bump();
                    while let Some(b) = self.peek() {
                        if b == quote || b == b'&' || b == b'<' {
                            break;
                        }
                        self.bump();
                    }
                    out.push_str(&self.text[start..self.pos]);
                }
                None => return Err(self.error("unterminated attribute value")),
            }
        }
    }

    fn content(&mut self, parent: &str) -> Result<Vec<XmlNode>, WbemError> {
        let mut children = Vec::new();
        let mut pending = String::new();
        loop {
            match self.peek() {
                Some(b'<') => {
                    if self.text[self.pos..].starts_with("</") {
                        if !pending.is_empty() {
                            children.push(XmlNode::Text(std::mem::take(&mut pending)));
                        }
                        self.eat("</");
                        let name = self.name()?;
                        if name != parent {
                            return Err(self.error(format!(
                                "end tag </{name}> does not match <{parent}>"
                            )));
                        }
                        self.skip_whitespace();
                        if self.bump() != Some(b'>') {
                            return Err(self.error("expected '>' in end tag"));
                        }
                        return Ok(children);
                    } else if self.text[self.pos..].starts_with("<!--") {
                        self.comment()?;
                    } else if self.eat("<![CDATA[") {
                        let start = self.pos;
                        loop {
                            if self.text[self.pos..].starts_with("]]>") {
                                break;
                            }
                            if self.bump().is_none() {
                                return Err(self.error("unterminated CDATA section"));
                            }
                        }
                        pending.push_str(&self.text[start..self.pos]);
                        self.eat("]]>");
                    } else if self.text[self.pos..].starts_with("<?") {
                        self.eat("<?");
                        self.skip_until("?>")?;
                    } else {
                        if !pending.is_empty() {
                            children.push(XmlNode::Text(std::mem::take(&mut pending)));
                        }
                        children.push(XmlNode::Element(self.element()?));
                    }
                }
                Some(b'&') => pending.push(self.entity()?),
                Some(_) => {
                    let start = self.pos;
                    self.bump();
                    while let Some(b) = self.peek() {
                        if b == b'<' || b == b'&' {
                            break;
                        }
                        self.bump();
                    }
                    pending.push_str(&self.text[start..self.pos]);
                }
                None => {
                    return Err(self.error(format!("unexpected end of input inside <{parent}>")))
                }
            }
        }
    }

    fn entity(&mut self) -> Result<char, WbemError> {
        debug_assert_eq!(self.peek(), Some(b'&'));
        self.bump();
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b';' {
                break;
            }
            self.bump();
        }
        let body = &self.text[start..self.pos];
        if self.bump() != Some(b';') {
            return Err(self.error("unterminated entity reference"));
        }
        match body {
            "amp" => Ok('&'),
            "lt" => Ok('<'),
            "gt" => Ok('>'),
            "quot" => Ok('"'),
            "apos" => Ok('\''),
            _ => {
                let code = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = body.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| self.error(format!("unknown entity &{body};")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_emits_short_form_for_empty_elements() {
        let mut w = XmlWriter::new();
        w.start("OUTER");
        w.attr("NAME", "x").unwrap();
        w.start("INNER");
        w.end();
        w.end();
        let out = w.finish();
        assert!(out.ends_with("<OUTER NAME=\"x\"><INNER/></OUTER>"));
    }

    #[test]
    fn writer_escapes_content_and_attributes() {
        let mut w = XmlWriter::new();
        w.start("E");
        w.attr("A", "a<b&\"c\"").unwrap();
        w.text("1 < 2 & 3 > 2").unwrap();
        w.end();
        let out = w.finish();
        assert!(out.contains("A=\"a&lt;b&amp;&quot;c&quot;\""));
        assert!(out.contains(">1 &lt; 2 &amp; 3 &gt; 2</E>"));
    }

    #[test]
    fn writer_rejects_control_characters() {
        let mut w = XmlWriter::new();
        w.start("E");
        assert!(w.text("bad\u{0}byte").is_err());
        assert!(w.text("bell\u{7}").is_err());
        assert!(w.text("tab\tand\nnewline\rok").is_ok());
    }

    #[test]
    fn parse_simple_tree() {
        let root = parse_document(
            "<?xml version=\"1.0\"?>\n<A X=\"1\"><B>text</B><C/></A>",
        )
        .unwrap();
        assert_eq!(root.name, "A");
        assert_eq!(root.attr("X"), Some("1"));
        let kids: Vec<&str> = root.elements().map(|e| e.name.as_str()).collect();
        assert_eq!(kids, ["B", "C"]);
        assert_eq!(root.elements().next().unwrap().text(), "text");
    }

    #[test]
    fn parse_decodes_entities() {
        let root = parse_document("<V A=\"&quot;q&quot;\">&lt;&amp;&gt;&#65;&#x42;</V>").unwrap();
        assert_eq!(root.text(), "<&>AB");
        assert_eq!(root.attr("A"), Some("\"q\""));
    }

    #[test]
    fn parse_preserves_text_whitespace() {
        let root = parse_document("<V>  two  spaces  </V>").unwrap();
        assert_eq!(root.text(), "  two  spaces  ");
    }

    #[test]
    fn elements_skip_interelement_whitespace() {
        let root = parse_document("<A>\n  <B/>\n  <C/>\n</A>").unwrap();
        assert_eq!(root.elements().count(), 2);
        assert!(root.is_hollow() == false);
        let hollow = parse_document("<A>\n   \n</A>").unwrap();
        assert!(hollow.is_hollow());
    }

    #[test]
    fn parse_reports_positions() {
        let err = parse_document("<A>\n  <B></C>\n</A>").unwrap_err();
        match err {
            WbemError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_mismatched_tags() {
        assert!(parse_document("<A><B></A></B>").is_err());
        assert!(parse_document("<A>").is_err());
        assert!(parse_document("<A/><B/>").is_err());
    }

    #[test]
    fn parse_rejects_duplicate_attributes() {
        assert!(parse_document("<A X=\"1\" X=\"2\"/>").is_err());
    }

    #[test]
    fn parse_skips_comments_and_cdata_is_text() {
        let root = parse_document("<A><!-- note --><![CDATA[<raw&>]]></A>").unwrap();
        assert_eq!(root.text(), "<raw&>");
        assert_eq!(root.elements().count(), 0);
    }

    #[test]
    fn element_positions_are_recorded() {
        let root = parse_document("<A>\n  <B/>\n</A>").unwrap();
        let b = root.elements().next().unwrap();
        assert_eq!((b.line, b.column), (2, 3));
    }
}
