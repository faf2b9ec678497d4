//! Tolerant parsing of model output.
//!
//! Models wrap JSON in prose or code fences, so every consumer of a
//! generation response goes through [`parse_model_output`]: find the first
//! balanced `{...}` block, parse it, deserialize it. The result is tagged
//! rather than an error so callers decide their own fallback.

use serde::de::DeserializeOwned;

/// Outcome of parsing model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Malformed(String),
}

impl<T> ParseOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            ParseOutcome::Parsed(v) => Some(v),
            ParseOutcome::Malformed(_) => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseOutcome<U> {
        match self {
            ParseOutcome::Parsed(v) => ParseOutcome::Parsed(f(v)),
            ParseOutcome::Malformed(reason) => ParseOutcome::Malformed(reason),
        }
    }
}

/// Byte range of the first balanced top-level `{...}` block in `text`.
///
/// Braces inside JSON strings (including escaped quotes) are ignored.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first JSON object in `text` as `T`.
pub fn parse_model_output<T: DeserializeOwned>(text: &str) -> ParseOutcome<T> {
    let Some(block) = first_json_object(text) else {
        return ParseOutcome::Malformed("no JSON object in output".to_string());
    };
    let value: serde_json::Value = match serde_json::from_str(block) {
        Ok(v) => v,
        Err(e) => return ParseOutcome::Malformed(format!("invalid JSON: {e}")),
    };
    match serde_json::from_value(value) {
        Ok(v) => ParseOutcome::Parsed(v),
        Err(e) => ParseOutcome::Malformed(format!("unexpected shape: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        title: String,
    }

    #[test]
    fn extracts_object_from_prose_and_fences() {
        let text = "Sure! Here it is:\n```json\n{\"title\": \"Hello\"}\n```\nAnything else?";
        assert_eq!(
            parse_model_output::<Reply>(text),
            ParseOutcome::Parsed(Reply {
                title: "Hello".to_string()
            })
        );
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_block() {
        let text = r#"{"title": "a } tricky \" { value"} trailing {"#;
        assert_eq!(
            first_json_object(text),
            Some(r#"{"title": "a } tricky \" { value"}"#)
        );
    }

    #[test]
    fn nested_objects_are_kept_whole() {
        let text = r#"x {"a": {"b": {"c": 1}}, "d": 2} y"#;
        assert_eq!(first_json_object(text), Some(r#"{"a": {"b": {"c": 1}}, "d": 2}"#));
    }

    #[test]
    fn malformed_cases_are_tagged() {
        assert!(matches!(
            parse_model_output::<Reply>("no json here"),
            ParseOutcome::Malformed(_)
        ));
        assert!(matches!(
            parse_model_output::<Reply>("{\"title\": "),
            ParseOutcome::Malformed(_)
        ));
        assert!(matches!(
            parse_model_output::<Reply>("{\"other\": 1}"),
            ParseOutcome::Malformed(r) if r.contains("unexpected shape")
        ));
    }
}
