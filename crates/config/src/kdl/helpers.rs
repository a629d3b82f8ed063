//! KDL parsing helper functions.
//!
//! Common utilities for extracting values from KDL nodes.

/// Convert a byte offset to line and column numbers (1-indexed)
pub fn offset_to_line_col(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in content.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Helper to get the first argument of a node as an integer
pub fn get_first_arg_int(node: &kdl::KdlNode) -> Option<i128> {
    node.entries().first().and_then(|e| e.value().as_integer())
}

/// Helper to get the first argument of a node as a string
pub fn get_first_arg_string(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Helper to find a named property entry of a node
pub fn get_property<'a>(node: &'a kdl::KdlNode, name: &str) -> Option<&'a kdl::KdlEntry> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
}

/// Render an entry the way it was written, e.g. `cached=16` or `"foo"`.
pub fn entry_token(entry: &kdl::KdlEntry) -> String {
    match entry.name() {
        Some(name) => format!("{}={}", name.value(), entry.value()),
        None => entry.value().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_to_line_col() {
        let content = "a\nbc\nd";
        assert_eq!(offset_to_line_col(content, 0), (1, 1));
        assert_eq!(offset_to_line_col(content, 3), (2, 2));
        assert_eq!(offset_to_line_col(content, 5), (3, 1));
    }

    #[test]
    fn test_entry_token() {
        let doc: kdl::KdlDocument = "keepalive cached=16 \"x y\"".parse().unwrap();
        let node = &doc.nodes()[0];
        assert_eq!(entry_token(&node.entries()[0]), "cached=16");
        assert_eq!(entry_token(&node.entries()[1]), "\"x y\"");
    }
}
