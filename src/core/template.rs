//! TW-011: Config file templating.
//!
//! Substitutes `{{ var.NAME }}` (from `--config-var`) and `{{ env.NAME }}`
//! before the YAML is parsed. Unknown names are errors.

use super::env::EnvProvider;
use indexmap::IndexMap;

/// Resolve all template variables in a string.
pub fn resolve_template(
    template: &str,
    vars: &IndexMap<String, String>,
    env: &dyn EnvProvider,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(name) = key.strip_prefix("var.") {
            vars.get(name)
                .cloned()
                .ok_or_else(|| format!("unknown config var: {}", name))?
        } else if let Some(name) = key.strip_prefix("env.") {
            env.var(name)
                .ok_or_else(|| format!("environment variable not set: {}", name))?
        } else {
            return Err(format!("unknown template variable: {}", key));
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Parse `KEY=VALUE` pairs from `--config-var`.
pub fn parse_config_vars(pairs: &[String]) -> Result<IndexMap<String, String>, String> {
    let mut vars = IndexMap::new();
    for pair in pairs {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| format!("config var '{}' is not KEY=VALUE", pair))?;
        if k.trim().is_empty() {
            return Err(format!("config var '{}' has an empty key", pair));
        }
        vars.insert(k.trim().to_string(), v.to_string());
    }
    Ok(vars)
}
