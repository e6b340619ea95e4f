use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::ConfigError;

// ${VAR} or ${VAR:-fallback}
static ENV_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex")
});

/// Expand `${VAR}` references in every string of `value` using `vars`.
pub fn interpolate_env(value: &mut Value, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if ENV_REF.is_match(s) {
                *s = expand(s, vars)?;
            }
        }
        Value::Object(obj) => {
            for v in obj.values_mut() {
                interpolate_env(v, vars)?;
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                interpolate_env(v, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand(input: &str, vars: &HashMap<String, String>) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_REF.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match (vars.get(name), caps.get(2)) {
            (Some(value), _) => value.clone(),
            (None, Some(fallback)) => {
                debug!(var = name, "environment variable unset, using fallback");
                fallback.as_str().to_string()
            }
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnv { var }),
        None => Ok(expanded.into_owned()),
    }
}
