use crate::error::ControlError;
use crate::plugin::PluginDescriptor;
use crate::xml;
use roxmltree::Node;
use std::collections::HashSet;
use std::fmt;

const ROOT: &str = "plugin";
const PLUGIN_CHILDREN: &[&str] = &[
    "name",
    "action",
    "type",
    "version",
    "work",
    "url",
    "destinations",
];
const DESTINATION_CHILDREN: &[&str] = &["input", "output", "replyto"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    New,
    Update,
    Stop,
}

impl Action {
    /// Case-insensitive; surrounding whitespace is ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("new") {
            Some(Action::New)
        } else if value.eq_ignore_ascii_case("update") {
            Some(Action::Update)
        } else if value.eq_ignore_ascii_case("stop") {
            Some(Action::Stop)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::New => "new",
            Action::Update => "update",
            Action::Stop => "stop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed control request. Keeps the source document so it can be
/// persisted byte-for-byte apart from the action.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub action: Action,
    pub descriptor: PluginDescriptor,
    source: String,
}

impl ControlMessage {
    /// Parse a control document. With `validated`, the element structure is
    /// checked strictly before any field is read.
    pub fn parse(source: &str, validated: bool) -> Result<Self, ControlError> {
        let doc = xml::parse(source).map_err(|e| ControlError::malformed(e.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != ROOT {
            return Err(ControlError::malformed(format!(
                "root element must be <{ROOT}>, found <{}>",
                root.tag_name().name()
            )));
        }
        if validated {
            check_structure(root)?;
        }

        let text = |path: &str| {
            xml::select(&doc, path)
                .map(|node| xml::text_of(node).trim().to_string())
                .unwrap_or_default()
        };

        let name = text("/plugin/name");
        if name.is_empty() {
            return Err(ControlError::malformed("missing plugin name"));
        }
        if name.contains(|c: char| c == '/' || c == '\\') || name.contains("..") {
            return Err(ControlError::malformed(format!(
                "plugin name '{name}' is not a valid file name"
            )));
        }

        let action_text = text("/plugin/action");
        let action = Action::parse(&action_text).ok_or_else(|| {
            ControlError::malformed(format!("unknown action requested: '{action_text}'"))
        })?;

        let mut descriptor = PluginDescriptor::new(name, text("/plugin/type"));
        descriptor.version = text("/plugin/version");
        descriptor.input = text("/plugin/destinations/input");
        descriptor.output = text("/plugin/destinations/output");
        descriptor.reply_to = text("/plugin/destinations/replyto");
        descriptor.archive = Some(text("/plugin/url")).filter(|url| !url.is_empty());
        descriptor.work = xml::select(&doc, "/plugin/work")
            .map(|work| work_content(source, work))
            .unwrap_or_default();

        if validated && action != Action::Stop {
            if descriptor.type_name.is_empty() {
                return Err(ControlError::malformed(format!(
                    "<type> is required for '{action}'"
                )));
            }
            if descriptor.input.is_empty() {
                return Err(ControlError::malformed(format!(
                    "<destinations><input> is required for '{action}'"
                )));
            }
        }

        Ok(Self {
            action,
            descriptor,
            source: source.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Version equality, ignoring case and surrounding whitespace.
    pub fn check_version(&self, expected: &str) -> Result<(), ControlError> {
        let actual = self.descriptor.version.trim();
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(ControlError::VersionMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// The source document with its action rewritten to `new`, so a replay
    /// always recreates.
    pub fn to_persisted_xml(&self) -> Result<String, ControlError> {
        xml::replace_text(&self.source, "/plugin/action", Action::New.as_str())
            .map_err(|e| ControlError::malformed(e.to_string()))
    }
}

/// Text content for plain configuration, raw markup for embedded documents.
fn work_content(source: &str, work: Node<'_, '_>) -> String {
    if work.children().any(|n| n.is_element()) {
        xml::inner_source(source, work).trim().to_string()
    } else {
        xml::text_of(work).trim().to_string()
    }
}

fn check_structure(root: Node<'_, '_>) -> Result<(), ControlError> {
    check_children(root, PLUGIN_CHILDREN)?;
    for required in ["name", "action"] {
        if xml::child(root, required).is_none() {
            return Err(ControlError::malformed(format!(
                "<{ROOT}> is missing <{required}>"
            )));
        }
    }
    if let Some(destinations) = xml::child(root, "destinations") {
        check_children(destinations, DESTINATION_CHILDREN)?;
    }
    for leaf in ["name", "action", "type", "version", "url"] {
        if let Some(node) = xml::child(root, leaf) {
            if node.children().any(|n| n.is_element()) {
                return Err(ControlError::malformed(format!(
                    "<{leaf}> must contain text only"
                )));
            }
        }
    }
    Ok(())
}

fn check_children(parent: Node<'_, '_>, allowed: &[&str]) -> Result<(), ControlError> {
    let parent_name = parent.tag_name().name();
    let mut seen = HashSet::new();
    for child in parent.children() {
        if child.is_text() {
            if child.text().is_some_and(|t| !t.trim().is_empty()) {
                return Err(ControlError::malformed(format!(
                    "unexpected text inside <{parent_name}>"
                )));
            }
            continue;
        }
        if !child.is_element() {
            continue;
        }
        let name = child.tag_name().name();
        if !allowed.contains(&name) {
            return Err(ControlError::malformed(format!(
                "unexpected element <{name}> inside <{parent_name}>"
            )));
        }
        if !seen.insert(name) {
            return Err(ControlError::malformed(format!(
                "duplicate element <{name}> inside <{parent_name}>"
            )));
        }
    }
    Ok(())
}
