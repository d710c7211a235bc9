//! `{{variable}}` placeholders in request templates

use serde::{Deserialize, Serialize};

use super::context::VariableContext;
use crate::error::{GleipError, Result};
use crate::http::{Headers, HttpRequest};

/// Replace every `{{name}}` with its bound value.
///
/// Whitespace inside the braces is ignored. An unterminated `{{` is kept
/// literally; a placeholder whose name is not bound is an error.
pub fn substitute(input: &str, variables: &VariableContext) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let name = rest[open + 2..open + 2 + close].trim();
        let value = variables
            .get(name)
            .ok_or_else(|| GleipError::UnboundVariable(name.to_string()))?;

        output.push_str(&rest[..open]);
        output.push_str(value);
        rest = &rest[open + 2 + close + 2..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Stored request with placeholders in any part
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: String,
    pub url: String,

    #[serde(default)]
    pub headers: Vec<(String, String)>,

    #[serde(default)]
    pub body: String,
}

impl RequestTemplate {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// Resolve placeholders into a concrete request
    pub fn render(&self, variables: &VariableContext) -> Result<HttpRequest> {
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| Ok((substitute(k, variables)?, substitute(v, variables)?)))
            .collect::<Result<Headers>>()?;

        Ok(HttpRequest {
            method: substitute(&self.method, variables)?.to_uppercase(),
            url: substitute(&self.url, variables)?,
            headers,
            body: substitute(&self.body, variables)?.into_bytes(),
        })
    }
}

impl From<&HttpRequest> for RequestTemplate {
    fn from(request: &HttpRequest) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            body: request.body_text(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> VariableContext {
        let mut ctx = VariableContext::new();
        for (k, v) in pairs {
            ctx.set(k, v);
        }
        ctx
    }

    #[test]
    fn test_substitutes_bound_variables() {
        let ctx = vars(&[("token", "abc123"), ("id", "7")]);
        assert_eq!(
            substitute("/api/{{ id }}?t={{token}}", &ctx).unwrap(),
            "/api/7?t=abc123"
        );
        assert_eq!(substitute("no placeholders", &ctx).unwrap(), "no placeholders");
        assert_eq!(substitute("open {{ only", &ctx).unwrap(), "open {{ only");
    }

    #[test]
    fn test_unbound_variable_is_an_error() {
        let err = substitute("Bearer {{token}}", &VariableContext::new()).unwrap_err();
        assert!(matches!(err, GleipError::UnboundVariable(ref name) if name == "token"));
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let ctx = vars(&[("a", "{{b}}")]);
        assert_eq!(substitute("{{a}}", &ctx).unwrap(), "{{b}}");
    }

    #[test]
    fn test_render_covers_every_part() {
        let template = RequestTemplate::new("{{verb}}", "http://host/{{path}}")
            .with_header("Authorization", "Bearer {{token}}")
            .with_body(r#"{"user":"{{user}}"}"#);
        let ctx = vars(&[("verb", "post"), ("path", "login"), ("token", "abc123"), ("user", "ada")]);

        let request = template.render(&ctx).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "http://host/login");
        assert_eq!(request.headers.get("authorization"), Some("Bearer abc123"));
        assert_eq!(request.body_text(), r#"{"user":"ada"}"#);
    }
}
