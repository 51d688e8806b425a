//! YAML fragments emitted by the block generators.

/// Marker rendered for an empty sequence.
pub const EMPTY_SEQUENCE: &str = "[]";

/// Quotes `value` as a YAML double-quoted scalar.
#[must_use]
pub fn yaml_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// Block sequence of quoted items nested under a key at `indent`.
///
/// The result starts with a newline so the key line keeps only the key. An
/// empty item list renders as [`EMPTY_SEQUENCE`] on the key line.
#[must_use]
pub fn quoted_sequence<S: AsRef<str>>(items: &[S], indent: usize) -> String {
    if items.is_empty() {
        return String::from(EMPTY_SEQUENCE);
    }
    let pad = " ".repeat(indent + 2);
    items
        .iter()
        .map(|item| format!("\n{pad}- {}", yaml_quote(item.as_ref())))
        .collect()
}

/// Flow sequence such as `[10.0.0.53, 1.1.1.1]`.
#[must_use]
pub fn inline_sequence<S: AsRef<str>>(items: &[S]) -> String {
    let joined: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    format!("[{}]", joined.join(", "))
}
