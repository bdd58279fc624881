//! Extract a structured list from semi-structured model output.
//!
//! Accepted shapes, tried in order:
//! 1. a fenced code block (optionally tagged, e.g. `json`) whose body is a JSON array;
//! 2. the first bare bracketed JSON array embedded in free text.
//!
//! Malformed input yields `None`; this function never panics.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});

/// Return the first JSON array found in `text`, or `None`.
pub fn extract_structured_list(text: &str) -> Option<Vec<Value>> {
    fenced_array(text).or_else(|| bare_array(text))
}

fn fenced_array(text: &str) -> Option<Vec<Value>> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|body| match serde_json::from_str::<Value>(body.as_str().trim()) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        })
}

fn bare_array(text: &str) -> Option<Vec<Value>> {
    text.char_indices()
        .filter(|(_, ch)| *ch == '[')
        .find_map(|(start, _)| {
            // Parse one value starting at this bracket and ignore trailing prose.
            let mut stream =
                serde_json::Deserializer::from_str(text.get(start..)?).into_iter::<Value>();
            match stream.next() {
                Some(Ok(Value::Array(items))) => Some(items),
                _ => None,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_block_is_preferred() {
        let text = concat!(
            "Plan below [not json]\n",
            "```json\n[{\"title\": \"a\"}, {\"title\": \"b\"}]\n```\n",
            "and [1, 2]",
        );
        let items = extract_structured_list(text).expect("list");
        assert_eq!(items, vec![json!({"title": "a"}), json!({"title": "b"})]);
    }

    #[test]
    fn untagged_fence_is_accepted() {
        let text = "```\n[{\"title\": \"only\"}]\n```";
        assert_eq!(extract_structured_list(text).expect("list").len(), 1);
    }

    #[test]
    fn bare_array_inside_prose() {
        let text = "Here you go: [{\"title\": \"x [nested]\", \"params\": {\"k\": [1]}}] -- done";
        let items = extract_structured_list(text).expect("list");
        assert_eq!(items[0]["title"], "x [nested]");
        assert_eq!(items[0]["params"]["k"], json!([1]));
    }

    #[test]
    fn skips_leading_brackets_that_are_not_json() {
        let text = "[WIP] see list: [\"a\", \"b\"]";
        assert_eq!(
            extract_structured_list(text),
            Some(vec![json!("a"), json!("b")])
        );
    }

    #[test]
    fn malformed_fence_falls_back_to_bare_array() {
        let text = "```json\n[{\"title\": }\n```\nfallback [{\"title\": \"ok\"}]";
        let items = extract_structured_list(text).expect("list");
        assert_eq!(items, vec![json!({"title": "ok"})]);
    }

    #[test]
    fn none_when_absent_or_malformed() {
        assert_eq!(extract_structured_list(""), None);
        assert_eq!(extract_structured_list("no list here"), None);
        assert_eq!(extract_structured_list("[unterminated"), None);
        assert_eq!(extract_structured_list("```json\n{\"title\": \"obj\"}\n```"), None);
    }
}
