use crate::bus::BusMessage;
use crate::error::PluginError;
use crate::plugin::{MessageContext, Plugin, PluginSpec};
use crate::xml;
use async_trait::async_trait;
use quick_xml::escape::escape;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(String),
}

/// Renders an XML template, filling `{{/path}}` placeholders from the input document.
#[derive(Debug)]
pub struct XmlTransform {
    segments: Vec<Segment>,
}

impl XmlTransform {
    pub const TYPE_NAME: &'static str = "pipeline.plugin.XmlTransform";

    pub fn create(spec: &PluginSpec) -> Result<Box<dyn Plugin>, PluginError> {
        Ok(Box::new(Self::from_template(&spec.work)?))
    }

    pub fn from_template(template: &str) -> Result<Self, PluginError> {
        if template.trim().is_empty() {
            return Err(PluginError::EmptyTemplate);
        }
        xml::parse(template).map_err(|e| PluginError::InvalidTemplate {
            reason: e.to_string(),
        })?;

        let pattern = Regex::new(r"\{\{\s*([^}]*?)\s*\}\}").map_err(|e| {
            PluginError::InvalidTemplate {
                reason: format!("Invalid placeholder pattern: {e}"),
            }
        })?;

        let mut segments = Vec::new();
        let mut last = 0;
        for captures in pattern.captures_iter(template) {
            let (Some(whole), Some(path)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            xml::segments(path.as_str()).map_err(|e| PluginError::InvalidTemplate {
                reason: e.to_string(),
            })?;
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            segments.push(Segment::Value(path.as_str().to_string()));
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, input: &str) -> Result<String, PluginError> {
        if input.trim().is_empty() {
            return Err(PluginError::InvalidPayload {
                reason: "empty input document".to_string(),
            });
        }
        let doc = xml::parse(input)?;

        let mut output = String::with_capacity(input.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Value(path) => {
                    let value = xml::select_text(&doc, path)?;
                    output.push_str(&escape(value.as_str()));
                }
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Plugin for XmlTransform {
    async fn on_message(
        &self,
        message: &BusMessage,
        _context: &MessageContext,
    ) -> Result<Option<String>, PluginError> {
        self.render(&message.payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XmlError;

    const TEMPLATE: &str =
        "<invoice lang=\"en\">\n  <to>{{/order/customer}}</to>\n  <total>{{ /order/total }}</total>\n</invoice>";

    #[test]
    fn test_render_is_byte_exact() {
        let transform = XmlTransform::from_template(TEMPLATE).unwrap();
        let output = transform
            .render("<order><customer>Ann &amp; Bob</customer><total>12.50</total></order>")
            .unwrap();
        assert_eq!(
            output,
            "<invoice lang=\"en\">\n  <to>Ann &amp; Bob</to>\n  <total>12.50</total>\n</invoice>"
        );
    }

    #[test]
    fn test_empty_template_is_rejected() {
        assert!(matches!(
            XmlTransform::from_template("  \n"),
            Err(PluginError::EmptyTemplate)
        ));
    }

    #[test]
    fn test_malformed_template_is_rejected() {
        let err = XmlTransform::from_template("<invoice><to></invoice>").unwrap_err();
        assert!(matches!(err, PluginError::InvalidTemplate { .. }));
        assert!(err.is_configuration());

        let err = XmlTransform::from_template("<a>{{relative/path}}</a>").unwrap_err();
        assert!(matches!(err, PluginError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_unresolvable_path_fails_the_message() {
        let transform = XmlTransform::from_template(TEMPLATE).unwrap();
        let err = transform.render("<order><total>1</total></order>").unwrap_err();
        assert!(matches!(err, PluginError::Xml(XmlError::PathNotFound(_))));
        assert!(matches!(
            transform.render(""),
            Err(PluginError::InvalidPayload { .. })
        ));
    }
}
