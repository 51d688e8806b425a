//! Lookup context for the generic leaf pass.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::primary_user::PrimaryUser;

/// Derived placeholder for the meta-data instance identifier.
pub const INSTANCE_ID_KEY: &str = "instance.id";

/// Read-only view over the parameter tree plus derived values.
///
/// Derived values shadow tree leaves of the same dotted path. The tree itself
/// is borrowed and never modified.
#[derive(Clone, Debug)]
pub struct RenderContext<'a> {
    tree: &'a Value,
    derived: BTreeMap<String, String>,
}

impl<'a> RenderContext<'a> {
    /// Creates a context backed by `tree` with no derived values.
    #[must_use]
    pub const fn new(tree: &'a Value) -> Self {
        Self {
            tree,
            derived: BTreeMap::new(),
        }
    }

    /// Adds or replaces a derived value.
    #[must_use]
    pub fn with_derived(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.derived.insert(path.into(), value.into());
        self
    }

    /// Exposes the legacy `user.name` / `user.password` pair.
    #[must_use]
    pub fn with_primary(self, primary: &PrimaryUser) -> Self {
        primary
            .legacy_fields()
            .into_iter()
            .fold(self, |context, (path, value)| context.with_derived(path, value))
    }

    /// Resolves a dotted path to its scalar text.
    ///
    /// Strings are returned verbatim, numbers and booleans in display form and
    /// null as an empty string. Missing paths and composite values yield
    /// `None`. Numeric segments index into sequences.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<String> {
        if let Some(value) = self.derived.get(path) {
            return Some(value.clone());
        }
        if path.is_empty() {
            return None;
        }
        let mut node = self.tree;
        for segment in path.split('.') {
            node = match node {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        scalar_text(node)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn tree() -> Value {
        json!({
            "vm": {"name": "web01", "cpus": 4, "thin": true, "notes": null},
            "disks": [{"size_gb": 60}],
            "user": {"name": "from-tree"}
        })
    }

    #[rstest]
    #[case("vm.name", Some("web01"))]
    #[case("vm.cpus", Some("4"))]
    #[case("vm.thin", Some("true"))]
    #[case("vm.notes", Some(""))]
    #[case("disks.0.size_gb", Some("60"))]
    #[case("disks.1.size_gb", None)]
    #[case("vm", None)]
    #[case("vm.missing", None)]
    #[case("", None)]
    fn resolves_scalar_leaves(#[case] path: &str, #[case] expected: Option<&str>) {
        let tree = tree();
        let context = RenderContext::new(&tree);
        assert_eq!(context.lookup(path).as_deref(), expected);
    }

    #[test]
    fn derived_values_shadow_the_tree() {
        let tree = tree();
        let primary = PrimaryUser {
            number: 1,
            name: String::from("ops"),
            password: String::from("pw"),
        };
        let context = RenderContext::new(&tree).with_primary(&primary);
        assert_eq!(context.lookup("user.name").as_deref(), Some("ops"));
        assert_eq!(context.lookup("user.password").as_deref(), Some("pw"));
        assert_eq!(tree.pointer("/user/name"), Some(&json!("from-tree")));
    }
}
