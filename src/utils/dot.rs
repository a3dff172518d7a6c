//! DOT format utilities for graph visualization.
//!
//! Used by [`crate::ir::Graph::to_dot`] to render built graphs with Graphviz.

/// Escapes a string for safe use in DOT format labels and identifiers.
///
/// Handles quotes, backslashes, newlines, and angle brackets.
#[must_use]
pub fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "")
        .replace('<', "\\<")
        .replace('>', "\\>")
}
