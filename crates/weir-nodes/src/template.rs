//! Jinja template rendering shared by the parser, fetch, and conditional
//! nodes.
//!
//! The environment carries two regex filters (`regex_replace`,
//! `regex_findall`) that flow authors use inside parser templates.

use std::collections::HashMap;

use minijinja::value::Value as TemplateValue;
use minijinja::{Environment, Error, ErrorKind};
use serde_json::Value;

use weir_types::{Result, WeirError};

fn regex_replace(
    input: String,
    pattern: String,
    replacement: String,
) -> std::result::Result<String, Error> {
    let re = regex::Regex::new(&pattern).map_err(|err| {
        Error::new(ErrorKind::InvalidOperation, format!("invalid pattern: {err}"))
    })?;
    Ok(re.replace_all(&input, replacement.as_str()).into_owned())
}

fn regex_findall(input: String, pattern: String) -> std::result::Result<Vec<String>, Error> {
    let re = regex::Regex::new(&pattern).map_err(|err| {
        Error::new(ErrorKind::InvalidOperation, format!("invalid pattern: {err}"))
    })?;
    Ok(re
        .find_iter(&input)
        .map(|m| m.as_str().to_string())
        .collect())
}

/// Environment with the flow-author filter set installed.
pub fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_filter("regex_replace", regex_replace);
    env.add_filter("regex_findall", regex_findall);
    env
}

/// Render a template against a map of parameters.
pub fn render(template: &str, params: &HashMap<String, Value>) -> Result<String> {
    let env = environment();
    env.render_str(template, TemplateValue::from_serialize(params))
        .map_err(|err| WeirError::Template(err.to_string()))
}

/// Render against an arbitrary serializable context.
pub fn render_with<S: serde::Serialize>(template: &str, context: &S) -> Result<String> {
    let env = environment();
    env.render_str(template, TemplateValue::from_serialize(context))
        .map_err(|err| WeirError::Template(err.to_string()))
}

/// Decode a string as JSON where possible, leaving other values untouched.
/// Parser inputs pass through this so templates can address nested fields.
pub fn soft_json_parse(value: &Value) -> Value {
    match value {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_plain_substitution() {
        let out = render("item={{ x }}", &params(&[("x", json!(1))])).unwrap();
        assert_eq!(out, "item=1");
    }

    #[test]
    fn renders_nested_fields_after_soft_parse() {
        let raw = json!("{\"name\": \"ada\"}");
        let parsed = soft_json_parse(&raw);
        let out = render("hello {{ user.name }}", &params(&[("user", parsed)])).unwrap();
        assert_eq!(out, "hello ada");
    }

    #[test]
    fn inline_if_expression() {
        let out = render(
            "{{ 'yes' if value|trim else 'no' }}",
            &params(&[("value", json!("x"))]),
        )
        .unwrap();
        assert_eq!(out, "yes");

        let out = render(
            "{{ 'yes' if value|trim else 'no' }}",
            &params(&[("value", json!(""))]),
        )
        .unwrap();
        assert_eq!(out, "no");
    }

    #[test]
    fn regex_replace_filter() {
        let out = render(
            "{{ text | regex_replace('[0-9]+', '#') }}",
            &params(&[("text", json!("a1b22c"))]),
        )
        .unwrap();
        assert_eq!(out, "a#b#c");
    }

    #[test]
    fn regex_findall_filter() {
        let out = render(
            "{{ text | regex_findall('[0-9]+') | join(',') }}",
            &params(&[("text", json!("a1b22c"))]),
        )
        .unwrap();
        assert_eq!(out, "1,22");
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = render("{{ unclosed", &HashMap::new()).unwrap_err();
        assert!(matches!(err, WeirError::Template(_)));
    }

    #[test]
    fn soft_json_parse_keeps_invalid_strings() {
        assert_eq!(soft_json_parse(&json!("not json")), json!("not json"));
        assert_eq!(soft_json_parse(&json!("[1,2]")), json!([1, 2]));
        assert_eq!(soft_json_parse(&json!(5)), json!(5));
    }
}
