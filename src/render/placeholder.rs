//! Placeholder scanning shared by the block generators and the leaf pass.

/// Column of the first non-space character on the last line of `text`.
fn trailing_line_indent(text: &str) -> usize {
    text.rsplit('\n')
        .next()
        .unwrap_or_default()
        .chars()
        .take_while(|ch| *ch == ' ')
        .count()
}

/// Replaces every `{{name}}` with the output of `render`.
///
/// `render` receives the indentation of the line the placeholder sits on so
/// block generators can nest their sequences beneath it. When a replacement
/// starts with a newline, trailing spaces before the placeholder are dropped
/// to keep the key line clean.
pub(crate) fn replace_placeholder(
    text: &str,
    name: &str,
    mut render: impl FnMut(usize) -> String,
) -> String {
    let needle = format!("{{{{{name}}}}}");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some((before, after)) = rest.split_once(needle.as_str()) {
        out.push_str(before);
        let replacement = render(trailing_line_indent(&out));
        if replacement.starts_with('\n') {
            let kept = out.trim_end_matches(' ').len();
            out.truncate(kept);
        }
        out.push_str(&replacement);
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Replaces every `{{path}}` for which `resolve` returns a value and keeps
/// the others verbatim. `resolve` also receives the indentation of the
/// placeholder's line. Substituted text is never rescanned, and a
/// replacement starting with a newline drops the trailing spaces before it.
pub(crate) fn substitute_each(
    template: &str,
    mut resolve: impl FnMut(&str, usize) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((before, after_open)) = rest.split_once("{{") {
        out.push_str(before);
        let Some((inner, after_close)) = after_open.split_once("}}") else {
            out.push_str("{{");
            rest = after_open;
            break;
        };
        if inner.contains("{{") {
            out.push_str("{{");
            rest = after_open;
            continue;
        }
        match resolve(inner.trim(), trailing_line_indent(&out)) {
            Some(value) => {
                if value.starts_with('\n') {
                    let kept = out.trim_end_matches(' ').len();
                    out.truncate(kept);
                }
                out.push_str(&value);
            }
            None => {
                out.push_str("{{");
                out.push_str(inner);
                out.push_str("}}");
            }
        }
        rest = after_close;
    }
    out.push_str(rest);
    out
}
