//! Cleanup for JSON produced by language models.

use anyhow::{Context, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([\]}])").unwrap());
static ADJACENT_OBJECTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\}\s*\{").unwrap());
static ADJACENT_ARRAYS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\]\s*\[").unwrap());

/// Field names models tend to invent, and the name they stand for.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("panel_id", "id"),
    ("scene_id", "id"),
    ("location_name", "location"),
    ("character_name", "name"),
    ("char_name", "name"),
    ("visual_description", "description"),
    ("panel_description", "description"),
    ("dialog", "dialogue"),
    ("script_title", "title"),
    ("story_synopsis", "synopsis"),
];

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

/// Cut away prose before the first `{`/`[` and after the last `}`/`]`.
fn json_body(s: &str) -> &str {
    let start = s.find(['{', '[']);
    let end = s.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if start < end => &s[start..=end],
        _ => s,
    }
}

/// Fix the structural slips that break strict parsing.
pub fn repair_json(text: &str) -> String {
    let text = TRAILING_COMMA.replace_all(text, "$1");
    let text = ADJACENT_OBJECTS.replace_all(&text, "}, {");
    ADJACENT_ARRAYS.replace_all(&text, "], [").into_owned()
}

/// Rename aliased keys to their canonical names, recursively.
///
/// A key whose canonical name is already present is left alone.
pub fn canonicalize_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut renamed = Map::with_capacity(map.len());
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                let Some(mut v) = map.remove(&key) else {
                    continue;
                };
                canonicalize_keys(&mut v);
                let lower = key.to_lowercase();
                let target = FIELD_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == lower)
                    .map(|(_, canonical)| canonical.to_string())
                    .filter(|canonical| !map.contains_key(canonical) && !renamed.contains_key(canonical))
                    .unwrap_or(key);
                renamed.insert(target, v);
            }
            *map = renamed;
        }
        Value::Array(items) => items.iter_mut().for_each(canonicalize_keys),
        _ => {}
    }
}

/// Parse model output into `T`, repairing it first when needed.
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let stripped = strip_code_blocks(raw);
    let body = json_body(&stripped);

    let mut value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => {
            let repaired = repair_json(body);
            serde_json::from_str(&repaired)
                .with_context(|| format!("Failed to parse JSON even after repair: {}", repaired))?
        }
    };
    canonicalize_keys(&mut value);
    serde_json::from_value(value).with_context(|| format!("JSON does not match expected shape: {}", body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_repair_trailing_commas_and_missing_separators() {
        let broken = r#"{"panels": [{"id": 1,} {"id": 2}],}"#;
        let fixed = repair_json(broken);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["panels"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_aliases_are_mapped_recursively() {
        let mut v: Value = serde_json::from_str(
            r#"{"script_title": "Harbor", "scenes": [{"scene_id": 1, "location_name": "Dock",
                "panels": [{"panel_id": 4, "visual_description": "Ava waits", "dialog": []}]}]}"#,
        )
        .unwrap();
        canonicalize_keys(&mut v);
        assert_eq!(v["title"], "Harbor");
        assert_eq!(v["scenes"][0]["id"], 1);
        assert_eq!(v["scenes"][0]["location"], "Dock");
        assert_eq!(v["scenes"][0]["panels"][0]["id"], 4);
        assert_eq!(v["scenes"][0]["panels"][0]["description"], "Ava waits");
        assert!(v["scenes"][0]["panels"][0]["dialogue"].is_array());
    }

    #[test]
    fn test_alias_does_not_clobber_canonical_key() {
        let mut v: Value = serde_json::from_str(r#"{"id": 7, "panel_id": 9}"#).unwrap();
        canonicalize_keys(&mut v);
        assert_eq!(v["id"], 7);
        assert_eq!(v["panel_id"], 9);
    }

    #[test]
    fn test_parse_lenient_handles_prose_and_fences() {
        #[derive(Deserialize)]
        struct Profile {
            name: String,
            description: String,
        }
        let raw = "Sure! Here it is:\n```json\n{\"character_name\": \"Ava\", \"description\": \"red coat\",}\n```";
        let p: Profile = parse_lenient(raw).unwrap();
        assert_eq!(p.name, "Ava");
        assert_eq!(p.description, "red coat");
    }

    #[test]
    fn test_parse_lenient_reports_garbage() {
        let err = parse_lenient::<Value>("no json here").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
