//! Tool descriptors and the alias-sanitizing rule used to generate stable
//! in-sandbox identifiers from arbitrary downstream tool names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool advertised by a downstream server, annotated with its sanitized
/// in-sandbox alias.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub server_name: String,
    pub tool_name: String,
    pub alias: String,
    pub description: String,
    pub input_schema: Value,
}

/// Sanitizes `name` into a valid-looking Python identifier fragment: ASCII
/// alphanumerics and underscores survive (lowercased); any run of other
/// characters collapses to a single underscore; a leading digit or empty
/// result gets a leading underscore.
pub fn sanitize_alias(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
            prev_sep = false;
        } else if !prev_sep {
            out.push('_');
            prev_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let mut result = if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    };
    if result.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        result.insert(0, '_');
    }
    result
}

/// Assigns unique aliases to each `(server, tool)` pair in order, suffixing
/// collisions with `_2`, `_3`, ... in first-seen order.
pub fn assign_aliases<'a, I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut seen: HashMap<String, u32> = HashMap::new();
    items
        .into_iter()
        .map(|(_server, tool)| {
            let base = sanitize_alias(tool);
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_punctuation_and_case() {
        assert_eq!(sanitize_alias("Git.Status"), "git_status");
        assert_eq!(sanitize_alias("  spaced out  "), "spaced_out");
        assert_eq!(sanitize_alias("already_ok"), "already_ok");
    }

    #[test]
    fn leading_digit_gets_prefixed() {
        assert_eq!(sanitize_alias("123go"), "_123go");
    }

    #[test]
    fn empty_name_becomes_underscore() {
        assert_eq!(sanitize_alias("!!!"), "_");
    }

    #[test]
    fn collisions_get_numeric_suffixes_in_order() {
        let aliases = assign_aliases([("a", "echo"), ("b", "echo!"), ("c", "echo")]);
        assert_eq!(aliases, vec!["echo", "echo_2", "echo_3"]);
    }
}
