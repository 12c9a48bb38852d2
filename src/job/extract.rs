//! Pull a JSON payload out of prose.
//!
//! Tools tend to wrap their answer in explanation. A fenced ```json block
//! is preferred when present; otherwise the first object or array that
//! parses wins.

use serde_json::Value;

const FENCE: &str = "```";

/// First JSON object or array embedded in `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    fenced_json(text).or_else(|| embedded_json(text))
}

fn fenced_json(text: &str) -> Option<Value> {
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after = &rest[open + FENCE.len()..];
        let (info, body) = after.split_once('\n')?;
        let close = body.find(FENCE)?;
        let info = info.trim();
        if (info.is_empty() || info.eq_ignore_ascii_case("json"))
            && let Ok(value @ (Value::Object(_) | Value::Array(_))) =
                serde_json::from_str::<Value>(body[..close].trim())
        {
            return Some(value);
        }
        rest = &body[close + FENCE.len()..];
    }
    None
}

fn embedded_json(text: &str) -> Option<Value> {
    text.char_indices()
        .filter(|&(_, c)| c == '{' || c == '[')
        .find_map(|(at, _)| {
            let mut stream = serde_json::Deserializer::from_str(&text[at..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value @ (Value::Object(_) | Value::Array(_)))) => Some(value),
                _ => None,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_fenced_block() {
        let text = "Found {one} issue.\n```json\n{\"issues\": [1]}\n```\nDone.";
        assert_eq!(extract_json(text), Some(json!({"issues": [1]})));
    }

    #[test]
    fn skips_fences_in_other_languages() {
        let text = "```text\nnot json\n```\nresult: {\"ok\": true}";
        assert_eq!(extract_json(text), Some(json!({"ok": true})));
    }

    #[test]
    fn finds_object_after_stray_braces() {
        let text = "the {path} had [notes] but {\"score\": 3, \"tags\": [\"a\"]} trailing";
        assert_eq!(extract_json(text), Some(json!({"score": 3, "tags": ["a"]})));
    }

    #[test]
    fn nothing_to_find() {
        assert_eq!(extract_json("no payload here"), None);
        assert_eq!(extract_json("{broken"), None);
    }
}
