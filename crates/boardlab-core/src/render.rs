//! Device template rendering.
//!
//! Device configurations are stored as templates and rendered per job with
//! `${{ ... }}` substitution before being parsed as YAML.

use regex::Regex;
use std::collections::HashMap;

/// Variables available when rendering a device template.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Job context values (`context:` block of the definition).
    pub context: HashMap<String, String>,
    /// Device identity variables (hostname, device_type).
    pub device: HashMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `${{ ... }}` expressions in a template.
    ///
    /// Supports:
    /// - `${{ context.KEY }}` - job context value
    /// - `${{ device.KEY }}` - device identity value
    /// - `${{ KEY }}` - job context value (shorthand)
    ///
    /// Unknown expressions render as the empty string.
    pub fn render(&self, template: &str) -> String {
        let re = Regex::new(r"\$\{\{\s*([^}]+)\s*\}\}").unwrap();

        re.replace_all(template, |caps: &regex::Captures| {
            let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
            self.resolve(expr)
        })
        .to_string()
    }

    fn resolve(&self, expr: &str) -> String {
        if let Some(key) = expr.strip_prefix("context.") {
            return self.context.get(key).cloned().unwrap_or_default();
        }
        if let Some(key) = expr.strip_prefix("device.") {
            return self.device.get(key).cloned().unwrap_or_default();
        }
        self.context.get(expr).cloned().unwrap_or_default()
    }
}
