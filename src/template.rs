use indexmap::{IndexMap, IndexSet};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

use crate::config::NullRendering;
use crate::environment::EnvironmentSnapshot;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}\s](?:[^{}]*[^{}\s])?)\s*\}\}")
            .expect("Valid regex pattern for placeholders")
    })
}

/// Outcome of substituting a single field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionResult {
    pub value: String,
    /// Keys that were found in the environment, in first-seen order
    pub resolved: IndexSet<String>,
    /// Placeholders left literal because the key is missing
    pub unresolved: IndexSet<String>,
}

/// `Number.prototype.toString()` of a double.
///
/// `{:e}` yields the shortest digits that round-trip; they are laid out in
/// plain or exponential form by the same thresholds JavaScript uses.
pub fn js_number_string(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }

    let scientific = format!("{:e}", f.abs());
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    let body = if k <= n && n <= 21 {
        format!("{}{}", digits, "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{}.{}", int, frac)
    } else if -6 < n && n <= 0 {
        format!("0.{}{}", "0".repeat((-n) as usize), digits)
    } else {
        let (first, rest) = digits.split_at(1);
        let e = n - 1;
        let sign = if e < 0 { '-' } else { '+' };
        if rest.is_empty() {
            format!("{}e{}{}", first, sign, e.abs())
        } else {
            format!("{}.{}e{}{}", first, rest, sign, e.abs())
        }
    };

    if f < 0.0 { format!("-{}", body) } else { body }
}

/// Render a scalar the way it appears inside a header value.
///
/// Numbers render as JavaScript's `String(number)` would.
pub fn render_scalar(value: &Value, null_rendering: NullRendering) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => match null_rendering {
            NullRendering::Empty => String::new(),
            NullRendering::Literal => "null".to_string(),
        },
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                n.to_string()
            } else {
                n.as_f64()
                    .map(js_number_string)
                    .unwrap_or_else(|| n.to_string())
            }
        }
        other => other.to_string(),
    }
}

/// Replaces `{{key}}` placeholders with environment values
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEngine {
    null_rendering: NullRendering,
}

impl TemplateEngine {
    pub fn new(null_rendering: NullRendering) -> Self {
        Self { null_rendering }
    }

    /// Single pass over `field`; inserted text is never rescanned and
    /// placeholders for missing keys stay byte-for-byte unchanged.
    pub fn substitute(&self, field: &str, env: &EnvironmentSnapshot) -> SubstitutionResult {
        let mut resolved = IndexSet::new();
        let mut unresolved = IndexSet::new();

        let value = placeholder_pattern()
            .replace_all(field, |caps: &Captures<'_>| {
                let key = &caps[1];
                match env.get(key) {
                    Some(value) => {
                        resolved.insert(key.to_string());
                        render_scalar(value, self.null_rendering)
                    }
                    None => {
                        unresolved.insert(key.to_string());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();

        SubstitutionResult {
            value,
            resolved,
            unresolved,
        }
    }

    /// Substitute every value of a header map, keeping names and order
    pub fn substitute_headers(
        &self,
        headers: &IndexMap<String, String>,
        env: &EnvironmentSnapshot,
    ) -> IndexMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| (name.clone(), self.substitute(value, env).value))
            .collect()
    }
}

/// Substitute with the default `null` rendering
pub fn substitute(field: &str, env: &EnvironmentSnapshot) -> String {
    TemplateEngine::default().substitute(field, env).value
}
