//! Built-in chef actions
//!
//! Every action is a pure `&str -> String` function. Action names are
//! matched loosely: case, `_`, `-` and spaces are ignored, so `Base64 Decode`
//! and `base64_decode` name the same action.

use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::ActionError;

type Options = HashMap<String, String>;
type ActionResult = Result<String, ActionError>;

/// Canonical names of every built-in action
pub const ACTION_NAMES: &[&str] = &[
    "base64_encode",
    "base64_decode",
    "url_encode",
    "url_decode",
    "hex_encode",
    "hex_decode",
    "html_encode",
    "html_decode",
    "md5",
    "sha256",
    "uppercase",
    "lowercase",
    "reverse",
    "trim",
    "replace",
    "regex_replace",
    "prefix",
    "suffix",
    "json_extract",
];

fn normalize(action_type: &str) -> String {
    action_type
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Run one action on `input`. An empty action type is the identity.
pub fn run(action_type: &str, options: &Options, input: &str) -> ActionResult {
    let name = normalize(action_type);
    match name.as_str() {
        "" => Ok(input.to_string()),
        "base64encode" => Ok(base64_encode(input)),
        "base64decode" => base64_decode(input),
        "urlencode" => Ok(url_encode(input)),
        "urldecode" => url_decode(input),
        "hexencode" => Ok(hex_encode(input)),
        "hexdecode" => hex_decode(input),
        "htmlencode" => Ok(html_encode(input)),
        "htmldecode" => Ok(html_decode(input)),
        "md5" => Ok(format!("{:x}", md5::compute(input.as_bytes()))),
        "sha256" => Ok(hex_encode_bytes(&Sha256::digest(input.as_bytes()))),
        "uppercase" => Ok(input.to_uppercase()),
        "lowercase" => Ok(input.to_lowercase()),
        "reverse" => Ok(input.chars().rev().collect()),
        "trim" => Ok(input.trim().to_string()),
        "replace" => {
            let find = required(options, "find")?;
            if find.is_empty() {
                return Err(ActionError::InvalidOption {
                    name: "find".into(),
                    reason: "must not be empty".into(),
                });
            }
            Ok(input.replace(find, optional(options, "replace")))
        }
        "regexreplace" => {
            let pattern = required(options, "pattern")?;
            let regex = Regex::new(pattern).map_err(|e| ActionError::InvalidOption {
                name: "pattern".into(),
                reason: e.to_string(),
            })?;
            Ok(regex
                .replace_all(input, optional(options, "replace"))
                .into_owned())
        }
        "prefix" => Ok(format!("{}{}", required(options, "value")?, input)),
        "suffix" => Ok(format!("{}{}", input, required(options, "value")?)),
        "jsonextract" => json_extract(input, required(options, "path")?),
        _ => Err(ActionError::UnknownAction(action_type.to_string())),
    }
}

fn required<'a>(options: &'a Options, name: &str) -> Result<&'a str, ActionError> {
    options
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ActionError::MissingOption(name.to_string()))
}

fn optional<'a>(options: &'a Options, name: &str) -> &'a str {
    options.get(name).map(String::as_str).unwrap_or("")
}

fn utf8(bytes: Vec<u8>) -> ActionResult {
    String::from_utf8(bytes)
        .map_err(|_| ActionError::InvalidInput("decoded bytes are not valid UTF-8".into()))
}

/// Base64 encode a string
pub fn base64_encode(input: &str) -> String {
    general_purpose::STANDARD.encode(input.as_bytes())
}

/// Base64 decode, accepting padded or unpadded standard alphabet
pub fn base64_decode(input: &str) -> ActionResult {
    let trimmed = input.trim();
    let bytes = general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| ActionError::InvalidInput(e.to_string()))?;
    utf8(bytes)
}

/// URL encode (percent encoding) a string
pub fn url_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            // Unreserved characters (RFC 3986)
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

pub fn url_decode(input: &str) -> ActionResult {
    urlencoding::decode(input)
        .map(|s| s.into_owned())
        .map_err(|e| ActionError::InvalidInput(e.to_string()))
}

/// Lowercase hex of the UTF-8 bytes
pub fn hex_encode(input: &str) -> String {
    hex_encode_bytes(input.as_bytes())
}

fn hex_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hex_decode(input: &str) -> ActionResult {
    let digits: Vec<u8> = input.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(ActionError::InvalidInput("odd number of hex digits".into()));
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        let text = std::str::from_utf8(pair).unwrap_or("");
        let byte = u8::from_str_radix(text, 16)
            .map_err(|_| ActionError::InvalidInput(format!("invalid hex digits {:?}", text)))?;
        bytes.push(byte);
    }
    utf8(bytes)
}

/// HTML entity encode the characters that matter in markup
pub fn html_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for ch in input.chars() {
        match ch {
            '<' => encoded.push_str("&lt;"),
            '>' => encoded.push_str("&gt;"),
            '&' => encoded.push_str("&amp;"),
            '"' => encoded.push_str("&quot;"),
            '\'' => encoded.push_str("&#x27;"),
            _ => encoded.push(ch),
        }
    }
    encoded
}

/// Decode named and numeric entities; unknown entities are left untouched
pub fn html_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];

        let decoded = candidate
            .find(';')
            .filter(|&end| end <= 12)
            .and_then(|end| decode_entity(&candidate[1..end]).map(|ch| (ch, end)));

        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = entity.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Look up a dotted path (`data.items.0.id`) in a JSON document
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Render a JSON value as a variable: strings unquoted, everything else as JSON
pub fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_extract(input: &str, path: &str) -> ActionResult {
    let document: Value =
        serde_json::from_str(input).map_err(|e| ActionError::InvalidInput(format!("not JSON: {}", e)))?;
    json_path(&document, path)
        .map(json_to_string)
        .ok_or_else(|| ActionError::InvalidInput(format!("path '{}' not found", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> Options {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_names_are_matched_loosely() {
        let none = Options::new();
        assert_eq!(run("Base64 Encode", &none, "hi").unwrap(), "aGk=");
        assert_eq!(run("base64-encode", &none, "hi").unwrap(), "aGk=");
        assert_eq!(run("", &none, "same").unwrap(), "same");
        assert!(matches!(run("rot13", &none, "x"), Err(ActionError::UnknownAction(_))));
    }

    #[test]
    fn test_every_listed_name_is_known() {
        let options = opts(&[("find", "a"), ("pattern", "a"), ("value", "v"), ("path", "a")]);
        for name in ACTION_NAMES {
            let result = run(name, &options, "{\"a\":1}");
            assert!(
                !matches!(result, Err(ActionError::UnknownAction(_))),
                "{} not dispatched",
                name
            );
        }
    }

    #[test]
    fn test_base64_decode_rejects_malformed() {
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), "hello");
        assert_eq!(base64_decode("aGVsbG8").unwrap(), "hello");
        assert!(matches!(base64_decode("***"), Err(ActionError::InvalidInput(_))));
    }

    #[test]
    fn test_url_and_hex() {
        assert_eq!(url_encode("a b&c"), "a%20b%26c");
        assert_eq!(url_decode("a%20b%26c").unwrap(), "a b&c");
        assert_eq!(hex_encode("AB"), "4142");
        assert_eq!(hex_decode("41 42").unwrap(), "AB");
        assert!(hex_decode("414").is_err());
        assert!(hex_decode("zz").is_err());
    }

    #[test]
    fn test_html_round_trip_and_entities() {
        let encoded = html_encode("<a href=\"x\">'&'</a>");
        assert_eq!(encoded, "&lt;a href=&quot;x&quot;&gt;&#x27;&amp;&#x27;&lt;/a&gt;");
        assert_eq!(html_decode(&encoded), "<a href=\"x\">'&'</a>");
        assert_eq!(html_decode("&#65;&#x42; & &bogus;"), "AB & &bogus;");
    }

    #[test]
    fn test_digests() {
        let none = Options::new();
        assert_eq!(run("md5", &none, "hello").unwrap(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            run("sha256", &none, "hello").unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_option_actions() {
        assert_eq!(run("replace", &opts(&[("find", "cat"), ("replace", "dog")]), "cat cat").unwrap(), "dog dog");
        assert_eq!(
            run("regex_replace", &opts(&[("pattern", r"(\d+)"), ("replace", "<$1>")]), "a1b22").unwrap(),
            "a<1>b<22>"
        );
        assert_eq!(run("prefix", &opts(&[("value", "Bearer ")]), "tok").unwrap(), "Bearer tok");
        assert!(matches!(run("suffix", &Options::new(), "x"), Err(ActionError::MissingOption(_))));
        assert!(matches!(
            run("regex_replace", &opts(&[("pattern", "(")]), "x"),
            Err(ActionError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_json_extract() {
        let doc = r#"{"data":{"items":[{"id":7,"name":"first"}]}}"#;
        assert_eq!(run("json_extract", &opts(&[("path", "data.items.0.name")]), doc).unwrap(), "first");
        assert_eq!(run("json_extract", &opts(&[("path", "data.items.0.id")]), doc).unwrap(), "7");
        assert!(run("json_extract", &opts(&[("path", "data.missing")]), doc).is_err());
        assert!(run("json_extract", &opts(&[("path", "a")]), "not json").is_err());
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn base64_round_trips(s in any::<String>()) {
                prop_assert_eq!(base64_decode(&base64_encode(&s)).unwrap(), s);
            }

            #[test]
            fn hex_and_url_round_trip(s in any::<String>()) {
                prop_assert_eq!(hex_decode(&hex_encode(&s)).unwrap(), s.clone());
                prop_assert_eq!(url_decode(&url_encode(&s)).unwrap(), s);
            }

            #[test]
            fn malformed_base64_is_invalid_input(
                s in "[A-Za-z0-9+/]{0,16}[!@#$%^&*(){}<>?]{1,3}[A-Za-z0-9+/]{0,16}"
            ) {
                prop_assert!(matches!(base64_decode(&s), Err(ActionError::InvalidInput(_))));
            }

            #[test]
            fn malformed_hex_is_invalid_input(s in "[0-9a-f]{0,12}[g-zG-Z][0-9a-f]{0,12}") {
                prop_assert!(matches!(hex_decode(&s), Err(ActionError::InvalidInput(_))));
            }

            #[test]
            fn non_utf8_payload_is_invalid_input(
                bytes in proptest::collection::vec(any::<u8>(), 1..32)
                    .prop_filter("not utf-8", |b| std::str::from_utf8(b).is_err())
            ) {
                let encoded = general_purpose::STANDARD.encode(&bytes);
                prop_assert!(matches!(base64_decode(&encoded), Err(ActionError::InvalidInput(_))));
            }
        }
    }
}
