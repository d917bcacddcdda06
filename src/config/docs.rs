//! Example configuration and markdown documentation, generated from the schema.

use serde_json::{Map, Value};

use super::display_path;
use super::schema::{schema, walk_leaves, OptionSpec, SchemaNode};

/// A configuration document with every setting set to its example value.
pub fn example_document() -> Value {
    fn build(node: &SchemaNode) -> Value {
        match node {
            SchemaNode::Leaf(spec) => spec.example_value().clone(),
            SchemaNode::Group(entries) => {
                let mut map = Map::new();
                for (key, child) in entries {
                    map.insert((*key).to_string(), build(child));
                }
                Value::Object(map)
            }
        }
    }
    build(&schema())
}

/// Markdown documentation of the configuration settings, split into
/// required and optional sections.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocs {
    pub required: String,
    pub optional: String,
}

impl ConfigDocs {
    pub fn generate() -> Self {
        let root = schema();
        let mut docs = ConfigDocs::default();
        walk_leaves(&root, &mut |keys, spec| {
            let section = if spec.required && spec.default.is_null() {
                &mut docs.required
            } else {
                &mut docs.optional
            };
            section.push_str(&entry(keys, spec));
        });
        docs
    }

    pub fn render(&self) -> String {
        format!(
            "## Configuration\n\n### Required\n\n{}\n### Optional\n\n{}",
            self.required, self.optional
        )
    }
}

fn entry(keys: &[&str], spec: &OptionSpec) -> String {
    let mut out = format!("#### {}\n\n", display_path(keys));
    if !spec.default.is_null() {
        out.push_str(&format!("***default***: `{}`\n\n", spec.default));
    }
    if let Some(example) = &spec.example {
        out.push_str(&format!("***example:*** `{example}`\n\n"));
    }
    if !spec.help.is_empty() {
        out.push_str(spec.help);
        out.push_str("\n\n");
    }
    out.push_str("---\n\n");
    out
}
