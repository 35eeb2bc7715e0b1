//! `${{ ... }}` placeholder rendering.
//!
//! Workflow strings may reference the matrix cell they run in. Rendering is
//! pure: the caller supplies every value.

use crate::error::Result;
use crate::error::UnknownPlaceholderSnafu;
use crate::error::UnterminatedPlaceholderSnafu;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Placeholder names accepted in workflow strings.
pub const KNOWN_PLACEHOLDERS: &[&str] = &["matrix.os", "matrix.version", "matrix.id", "workflow.name"];

/// Values substituted into workflow strings.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    /// Workflow name.
    pub workflow: &'a str,
    /// Matrix OS value.
    pub os: &'a str,
    /// Matrix version value.
    pub version: &'a str,
    /// Sanitized cell id.
    pub cell_id: &'a str,
}

impl TemplateVars<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "matrix.os" => Some(self.os),
            "matrix.version" => Some(self.version),
            "matrix.id" => Some(self.cell_id),
            "workflow.name" => Some(self.workflow),
            _ => None,
        }
    }
}

/// List the placeholder names used in a template.
///
/// ```
/// use tessera_ci_core::verified::placeholder_names;
///
/// let names = placeholder_names("py${{ matrix.version }}-${{matrix.os}}").unwrap();
/// assert_eq!(names, vec!["matrix.version", "matrix.os"]);
/// ```
pub fn placeholder_names(template: &str) -> Result<Vec<&str>> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            return UnterminatedPlaceholderSnafu { template }.fail();
        };
        names.push(after_open[..end].trim());
        rest = &after_open[end + CLOSE.len()..];
    }
    Ok(names)
}

/// Check that every placeholder in `template` is known.
pub fn validate_template(template: &str) -> Result<()> {
    for name in placeholder_names(template)? {
        if !KNOWN_PLACEHOLDERS.contains(&name) {
            return UnknownPlaceholderSnafu { name, template }.fail();
        }
    }
    Ok(())
}

/// True if the template varies between matrix cells.
pub fn references_matrix(template: &str) -> bool {
    placeholder_names(template)
        .map(|names| names.iter().any(|n| n.starts_with("matrix.")))
        .unwrap_or(false)
}

/// Substitute placeholders.
///
/// ```
/// use tessera_ci_core::verified::{render_template, TemplateVars};
///
/// let vars = TemplateVars { workflow: "ci", os: "ubuntu-22.04", version: "3.11", cell_id: "ubuntu-22.04-3.11" };
/// assert_eq!(render_template("python${{ matrix.version }}", &vars).unwrap(), "python3.11");
/// ```
pub fn render_template(template: &str, vars: &TemplateVars<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            return UnterminatedPlaceholderSnafu { template }.fail();
        };
        let name = after_open[..end].trim();
        match vars.lookup(name) {
            Some(value) => out.push_str(value),
            None => return UnknownPlaceholderSnafu { name, template }.fail(),
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}
