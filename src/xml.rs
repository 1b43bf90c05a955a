//! Small XML helpers shared by control parsing and the XML plugins.
//!
//! Paths are absolute element paths such as `/order/currency`; the first
//! segment must name the document root and each further segment selects the
//! first child element with that name.

use crate::error::XmlError;
use quick_xml::escape::escape;
use roxmltree::{Document, Node, ParsingOptions};

pub fn parse(source: &str) -> Result<Document<'_>, XmlError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Ok(Document::parse_with_options(source, options)?)
}

pub(crate) fn segments(path: &str) -> Result<Vec<&str>, XmlError> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Err(XmlError::InvalidPath(path.to_string()));
    };
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(XmlError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// First element child of `node` named `name`.
pub fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

pub fn select<'a, 'i>(doc: &'a Document<'i>, path: &str) -> Result<Node<'a, 'i>, XmlError> {
    let parts = segments(path)?;
    let root = doc.root_element();
    if root.tag_name().name() != parts[0] {
        return Err(XmlError::PathNotFound(path.to_string()));
    }
    parts[1..]
        .iter()
        .try_fold(root, |node, name| child(node, name))
        .ok_or_else(|| XmlError::PathNotFound(path.to_string()))
}

/// Concatenated text of every descendant text node.
pub fn text_of(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

pub fn select_text(doc: &Document<'_>, path: &str) -> Result<String, XmlError> {
    select(doc, path).map(text_of)
}

/// Replace the text content of the leaf element at `path`, leaving every other
/// byte of `source` untouched.
pub fn replace_text(source: &str, path: &str, value: &str) -> Result<String, XmlError> {
    let doc = parse(source)?;
    let node = select(&doc, path)?;
    if node.children().any(|n| n.is_element()) {
        return Err(XmlError::NotALeaf(path.to_string()));
    }

    let range = node.range();
    let open_end = start_tag_end(source, range.start)
        .ok_or_else(|| XmlError::PathNotFound(path.to_string()))?;
    let escaped = escape(value);

    if source[..open_end].ends_with("/>") {
        let head = source[range.start..open_end - 2].trim_end();
        let qname = qualified_name(&source[range.start + 1..]);
        Ok(format!(
            "{}{}>{}</{}>{}",
            &source[..range.start],
            head,
            escaped,
            qname,
            &source[range.end..]
        ))
    } else {
        let close_start = source[..range.end]
            .rfind("</")
            .ok_or_else(|| XmlError::PathNotFound(path.to_string()))?;
        Ok(format!(
            "{}{}{}",
            &source[..open_end],
            escaped,
            &source[close_start..]
        ))
    }
}

/// Byte offset just past the `>` closing the start tag that begins at `start`.
fn start_tag_end(source: &str, start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, c) in source[start..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '>') => return Some(start + offset + 1),
            _ => {}
        }
    }
    None
}

fn qualified_name(tag: &str) -> &str {
    let end = tag
        .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .unwrap_or(tag.len());
    &tag[..end]
}

/// Raw markup between an element's start and end tags.
pub fn inner_source<'i>(source: &'i str, node: Node<'_, 'i>) -> &'i str {
    let range = node.range();
    let Some(open_end) = start_tag_end(source, range.start) else {
        return "";
    };
    if source[..open_end].ends_with("/>") {
        return "";
    }
    match source[..range.end].rfind("</") {
        Some(close_start) if close_start >= open_end => &source[open_end..close_start],
        _ => "",
    }
}
