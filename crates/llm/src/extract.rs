//! Pull a JSON object out of a free-form LLM reply.
//!
//! Models asked for "JSON only" still wrap the payload in prose or a fenced
//! code block often enough that both shapes must be handled.  A fenced
//! ```` ```json ```` block wins; otherwise the span from the first `{` to
//! the last `}` is tried as-is.

use serde::de::DeserializeOwned;

pub fn extract_json_object<T: DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fenced) = fenced_block(response) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Some(value);
        }
    }

    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn fenced_block(response: &str) -> Option<&str> {
    let after_open = &response[response.find("```json")? + "```json".len()..];
    let body_start = after_open.find(|c: char| !c.is_whitespace())?;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct NewCharacter {
        name: String,
        role: String,
    }

    #[test]
    fn extracts_fenced_block() {
        let raw = "A newcomer!\n```json\n{\"name\":\"Kaelen\",\"role\":\"Blacksmith\"}\n```\nEnjoy.";
        let parsed: NewCharacter = extract_json_object(raw).unwrap();
        assert_eq!(parsed.name, "Kaelen");
        assert_eq!(parsed.role, "Blacksmith");
    }

    #[test]
    fn extracts_bare_object_with_surrounding_prose() {
        let raw = "Decision: {\"name\":\"Mira\",\"role\":\"Scribe\"} and that is all.";
        let parsed: NewCharacter = extract_json_object(raw).unwrap();
        assert_eq!(parsed.name, "Mira");
    }

    #[test]
    fn fenced_block_wins_over_bare_object() {
        let raw = "{\"name\":\"Wrong\",\"role\":\"x\"}\n```json\n{\"name\":\"Right\",\"role\":\"y\"}\n```";
        let parsed: NewCharacter = extract_json_object(raw).unwrap();
        assert_eq!(parsed.name, "Right");
    }

    #[test]
    fn nested_braces_survive() {
        let raw = r#"{"name":"Kaelen","role":"{disputed}"}"#;
        let parsed: NewCharacter = extract_json_object(raw).unwrap();
        assert_eq!(parsed.role, "{disputed}");
    }

    #[test]
    fn empty_object_parses_as_value() {
        let parsed: serde_json::Value = extract_json_object("{}").unwrap();
        assert_eq!(parsed, serde_json::json!({}));
    }

    #[test]
    fn plain_text_yields_none() {
        assert!(extract_json_object::<serde_json::Value>("no structure here").is_none());
        assert!(extract_json_object::<serde_json::Value>("").is_none());
    }

    #[test]
    fn two_bare_objects_do_not_merge() {
        let raw = r#"{"name":"A","role":"r"} and {"name":"B","role":"r"}"#;
        assert!(extract_json_object::<NewCharacter>(raw).is_none());
    }
}
