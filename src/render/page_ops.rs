//! Named in-page operations
//!
//! The renderer only ever evaluates the fixed scripts defined here. Arguments
//! are JSON-encoded into the templates, so no caller-provided code reaches the
//! page. The set is versioned by [`crate::render::RENDER_PROTOCOL`]; changing a
//! script means bumping the protocol.

use crate::capture::options::Region;
use crate::error::RenderError;
use chromiumoxide::Page;
use serde_json::Value;
use tracing::{debug, instrument};

/// Stylesheet injected before every render
pub const DEFAULT_STYLES: &str = "body { background: #fff; }";

/// An operation the renderer can run inside the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOp {
    /// Insert a stylesheet as the first child of `document.head`
    InjectStyle(String),
    /// Page-relative bounding rectangle of the element with this id
    ElementRect(String),
}

impl PageOp {
    /// Stable operation name
    pub fn name(&self) -> &'static str {
        match self {
            PageOp::InjectStyle(_) => "inject-style",
            PageOp::ElementRect(_) => "get-element-rect",
        }
    }

    /// Script evaluated for this operation
    pub fn script(&self) -> String {
        match self {
            PageOp::InjectStyle(css) => format!(
                r#"
                (() => {{
                    const style = document.createElement('style');
                    style.setAttribute('type', 'text/css');
                    style.appendChild(document.createTextNode({css}));
                    const head = document.head || document.documentElement;
                    head.insertBefore(style, head.firstChild);
                    return true;
                }})()
                "#,
                css = json_literal(css)
            ),
            PageOp::ElementRect(id) => format!(
                r#"
                (() => {{
                    const element = document.getElementById({id});
                    if (!element) {{
                        return null;
                    }}
                    const rect = element.getBoundingClientRect();
                    return {{
                        top: rect.top + window.scrollY,
                        left: rect.left + window.scrollX,
                        width: rect.width,
                        height: rect.height
                    }};
                }})()
                "#,
                id = json_literal(id)
            ),
        }
    }

    /// Evaluate the operation and return its JSON result
    #[instrument(skip(page), fields(op = self.name()))]
    pub async fn run(&self, page: &Page) -> Result<Value, RenderError> {
        let result = page
            .evaluate(self.script().as_str())
            .await
            .map_err(|e| RenderError::PageOpFailed {
                op: self.name(),
                message: e.to_string(),
            })?;

        let value = result.value().cloned().unwrap_or(Value::Null);
        debug!("Page operation result: {}", value);
        Ok(value)
    }
}

/// Insert the default white-background stylesheet
pub async fn inject_default_styles(page: &Page) -> Result<(), RenderError> {
    PageOp::InjectStyle(DEFAULT_STYLES.to_string())
        .run(page)
        .await
        .map(|_| ())
}

/// Bounds of the element with `id`, or `None` when it is absent
pub async fn element_rect(page: &Page, id: &str) -> Result<Option<Region>, RenderError> {
    let op = PageOp::ElementRect(id.to_string());
    let value = op.run(page).await?;
    parse_rect(value).map_err(|message| RenderError::PageOpFailed {
        op: op.name(),
        message,
    })
}

fn parse_rect(value: Value) -> Result<Option<Region>, String> {
    serde_json::from_value::<Option<Region>>(value).map_err(|e| e.to_string())
}

fn json_literal(text: &str) -> String {
    // A JSON string is a valid JS string literal
    Value::String(text.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_names() {
        assert_eq!(PageOp::InjectStyle(String::new()).name(), "inject-style");
        assert_eq!(PageOp::ElementRect(String::new()).name(), "get-element-rect");
    }

    #[test]
    fn test_inject_style_script_embeds_css_as_literal() {
        let script = PageOp::InjectStyle(DEFAULT_STYLES.to_string()).script();
        assert!(script.contains(r#""body { background: #fff; }""#));
        assert!(script.contains("insertBefore(style, head.firstChild)"));
    }

    #[test]
    fn test_element_rect_script_escapes_id() {
        let script = PageOp::ElementRect("a\"); alert(1); (\"".to_string()).script();
        assert!(script.contains(r#"getElementById("a\"); alert(1); (\"")"#));
    }

    #[test]
    fn test_parse_rect_found() {
        let rect = parse_rect(json!({"top": 10.0, "left": 5.0, "width": 300.0, "height": 90.0}))
            .unwrap()
            .unwrap();
        assert_eq!(rect.top, 10.0);
        assert_eq!(rect.width, 300.0);
    }

    #[test]
    fn test_parse_rect_missing_element() {
        assert_eq!(parse_rect(Value::Null).unwrap(), None);
    }

    #[test]
    fn test_parse_rect_garbage() {
        assert!(parse_rect(json!("nope")).is_err());
    }
}
