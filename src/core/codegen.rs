//! TW-005: HCL generation for worker artifacts.
//!
//! Produces the text of `worker-providers.tf`, `worker.auto.tfvars` and the
//! `locals` block of `worker-locals.tf`. Output is a pure function of the
//! input; map iteration follows declaration order.

use super::reference::RemoteReference;
use super::types::ProviderConfig;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt::Write as _;

const INDENT: &str = "  ";

/// Quote a string as an HCL literal. Interpolation and directive openers
/// are escaped so values are never evaluated.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Bare HCL identifiers need no quoting as object keys or attribute names.
pub fn is_bare_key(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn key(s: &str) -> String {
    if is_bare_key(s) {
        s.to_string()
    } else {
        quote(s)
    }
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Array(_) | Value::Object(_))
}

/// Render a JSON-like value in native HCL syntax at nesting depth `depth`.
pub fn render_value(v: &Value, depth: usize) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        Value::Array(items) if items.iter().all(is_scalar) => {
            let parts: Vec<String> = items.iter().map(|i| render_value(i, depth)).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Array(items) => {
            let pad = INDENT.repeat(depth + 1);
            let mut out = String::from("[\n");
            for item in items {
                let _ = writeln!(out, "{}{},", pad, render_value(item, depth + 1));
            }
            out.push_str(&INDENT.repeat(depth));
            out.push(']');
            out
        }
        Value::Object(map) if map.is_empty() => "{}".to_string(),
        Value::Object(map) => {
            let pad = INDENT.repeat(depth + 1);
            let mut out = String::from("{\n");
            for (k, item) in map {
                let _ = writeln!(out, "{}{} = {}", pad, key(k), render_value(item, depth + 1));
            }
            out.push_str(&INDENT.repeat(depth));
            out.push('}');
            out
        }
    }
}

/// `worker.auto.tfvars`: one `name = value` per variable.
pub fn render_tfvars(vars: &IndexMap<String, Value>) -> String {
    let mut out = String::new();
    for (name, value) in vars {
        let _ = writeln!(out, "{} = {}", key(name), render_value(value, 0));
    }
    out
}

/// `worker-providers.tf`: provider blocks, then `required_providers`.
pub fn render_providers(
    providers: &IndexMap<String, ProviderConfig>,
    subset: Option<&[String]>,
) -> String {
    let chosen: Vec<(&String, &ProviderConfig)> = providers
        .iter()
        .filter(|(name, _)| subset.is_none_or(|s| s.iter().any(|n| n == *name)))
        .collect();

    let mut out = String::new();
    for (name, provider) in &chosen {
        let _ = writeln!(out, "provider {} {{", quote(name));
        for (attr, value) in &provider.vars {
            let _ = writeln!(out, "{}{} = {}", INDENT, key(attr), render_value(value, 1));
        }
        out.push_str("}\n\n");
    }

    out.push_str("terraform {\n");
    let _ = writeln!(out, "{}required_providers {{", INDENT);
    for (name, provider) in &chosen {
        let source = provider
            .requirements
            .source
            .clone()
            .unwrap_or_else(|| format!("hashicorp/{}", name));
        let _ = writeln!(out, "{0}{0}{1} = {{", INDENT, key(name));
        let _ = writeln!(out, "{0}{0}{0}source = {1}", INDENT, quote(&source));
        let _ = writeln!(
            out,
            "{0}{0}{0}version = {1}",
            INDENT,
            quote(&provider.requirements.version)
        );
        let _ = writeln!(out, "{0}{0}}}", INDENT);
    }
    let _ = writeln!(out, "{}}}", INDENT);
    out.push_str("}\n");
    out
}

/// The `locals` block binding each remote var to its data-source expression.
pub fn render_locals(remote_vars: &IndexMap<String, RemoteReference>) -> String {
    let mut out = String::from("locals {\n");
    for (name, reference) in remote_vars {
        let _ = writeln!(out, "{}{} = {}", INDENT, key(name), reference.data_expression());
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProviderRequirements;
    use serde_json::json;

    fn provider(version: &str, source: Option<&str>, vars: Value) -> ProviderConfig {
        let vars = match vars {
            Value::Object(m) => m.into_iter().collect(),
            _ => IndexMap::new(),
        };
        ProviderConfig {
            requirements: ProviderRequirements {
                version: version.to_string(),
                source: source.map(str::to_string),
            },
            vars,
        }
    }

    #[test]
    fn test_tw005_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
        assert_eq!(quote("line\nnext"), "\"line\\nnext\"");
        assert_eq!(quote("${var.x}"), "\"$${var.x}\"");
        assert_eq!(quote("%{ if }"), "\"%%{ if }\"");
        assert_eq!(quote("cost $5 or 10%"), "\"cost $5 or 10%\"");
    }

    #[test]
    fn test_tw005_scalars() {
        assert_eq!(render_value(&json!(null), 0), "null");
        assert_eq!(render_value(&json!(true), 0), "true");
        assert_eq!(render_value(&json!(42), 0), "42");
        assert_eq!(render_value(&json!(1.5), 0), "1.5");
        assert_eq!(render_value(&json!("x"), 0), "\"x\"");
    }

    #[test]
    fn test_tw005_lists() {
        assert_eq!(render_value(&json!([]), 0), "[]");
        assert_eq!(render_value(&json!(["a", 1, false]), 0), "[\"a\", 1, false]");
        assert_eq!(
            render_value(&json!([{"a": 1}]), 0),
            "[\n  {\n    a = 1\n  },\n]"
        );
    }

    #[test]
    fn test_tw005_objects_quote_non_identifier_keys() {
        let v = json!({"env": "dev", "cost-center": 7, "has space": "y", "9lives": 1});
        assert_eq!(
            render_value(&v, 0),
            "{\n  env = \"dev\"\n  cost-center = 7\n  \"has space\" = \"y\"\n  \"9lives\" = 1\n}"
        );
        assert_eq!(render_value(&json!({}), 0), "{}");
    }

    #[test]
    fn test_tw005_tfvars() {
        let mut vars = IndexMap::new();
        vars.insert("environment".to_string(), json!("dev"));
        vars.insert("replicas".to_string(), json!(3));
        vars.insert("tags".to_string(), json!({"team": "infra"}));
        assert_eq!(
            render_tfvars(&vars),
            "environment = \"dev\"\nreplicas = 3\ntags = {\n  team = \"infra\"\n}\n"
        );
    }

    #[test]
    fn test_tw005_providers_all() {
        let mut providers = IndexMap::new();
        providers.insert(
            "aws".to_string(),
            provider("5.40.0", Some("hashicorp/aws"), json!({"region": "us-west-2"})),
        );
        providers.insert("random".to_string(), provider("3.6.0", None, json!({})));
        let out = render_providers(&providers, None);
        assert!(out.starts_with("provider \"aws\" {\n  region = \"us-west-2\"\n}\n"));
        assert!(out.contains("provider \"random\" {\n}\n"));
        assert!(out.contains("    aws = {\n      source = \"hashicorp/aws\"\n      version = \"5.40.0\"\n    }\n"));
        assert!(out.contains("source = \"hashicorp/random\""));
    }

    #[test]
    fn test_tw005_providers_subset_keeps_global_order() {
        let mut providers = IndexMap::new();
        providers.insert("aws".to_string(), provider("5", None, json!({})));
        providers.insert("google".to_string(), provider("6", None, json!({})));
        providers.insert("random".to_string(), provider("3", None, json!({})));
        let subset = vec!["random".to_string(), "aws".to_string()];
        let out = render_providers(&providers, Some(subset.as_slice()));
        assert!(!out.contains("google"));
        let aws = out.find("provider \"aws\"").unwrap();
        let random = out.find("provider \"random\"").unwrap();
        assert!(aws < random);
    }

    #[test]
    fn test_tw005_providers_empty_subset() {
        let mut providers = IndexMap::new();
        providers.insert("aws".to_string(), provider("5", None, json!({})));
        let out = render_providers(&providers, Some(&[][..]));
        assert!(!out.contains("provider \"aws\""));
        assert!(out.contains("required_providers {\n  }\n"));
    }

    #[test]
    fn test_tw005_locals() {
        let mut remote = IndexMap::new();
        remote.insert(
            "subnet".to_string(),
            RemoteReference::parse("network.outputs.subnet_id").unwrap(),
        );
        assert_eq!(
            render_locals(&remote),
            "locals {\n  subnet = data.terraform_remote_state.network.outputs.subnet_id\n}\n"
        );
    }

    #[test]
    fn test_tw005_deterministic() {
        let mut vars = IndexMap::new();
        vars.insert("b".to_string(), json!({"z": 1, "a": [1, 2]}));
        vars.insert("a".to_string(), json!("x"));
        assert_eq!(render_tfvars(&vars), render_tfvars(&vars.clone()));
    }
}
