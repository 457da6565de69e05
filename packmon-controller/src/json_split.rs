//! Cursor-based splitting of a serialized JSON object into MTU-sized
//! fragments.
//!
//! The splitter walks the already-serialized string by top-level
//! elements; fragments are assembled by concatenation, never by
//! re-serialization. A set of common keys (`type`, `time`, `addr`) is
//! re-prefixed into every fragment so each piece stands alone.

/// Find the raw value text of `"key":` at the top of `json`.
fn find_value<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    let bytes = json.as_bytes();
    let needle = format!("\"{key}\":");
    let key_pos = json.find(&needle)?;
    let mut start = key_pos + needle.len();
    while start < bytes.len() && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    if start >= bytes.len() {
        return None;
    }
    let end = if bytes[start] == b'"' {
        let mut position = start + 1;
        loop {
            let offset = json[position..].find('"')?;
            position += offset;
            if bytes[position - 1] != b'\\' {
                break position + 1;
            }
            position += 1;
        }
    } else {
        let comma = json[start..].find(',').map(|offset| start + offset);
        let brace = json[start..].find('}').map(|offset| start + offset);
        match (comma, brace) {
            (Some(comma), Some(brace)) => comma.min(brace),
            (Some(comma), None) => comma,
            (None, Some(brace)) => brace,
            (None, None) => return None,
        }
    };
    Some(&json[start..end])
}

/// Scan the next top-level `"key":value` element starting at `start`;
/// returns the element text (including a trailing comma when present)
/// and the position after it.
fn find_next_element(json: &str, start: usize) -> Option<(&str, usize)> {
    let bytes = json.as_bytes();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut from = start;
    let mut index = start;
    while index < bytes.len() {
        let byte = bytes[index];
        if byte == b'"' && (index == start || bytes[index - 1] != b'\\') {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            match byte {
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((&json[from..=index], index + 1));
                    }
                    if depth < 0 {
                        // The document's closing brace: yield whatever
                        // trails as the final element.
                        if index > from {
                            return Some((&json[from..index], index + 1));
                        }
                        return None;
                    }
                }
                b',' => {
                    if index == from {
                        from += 1;
                    }
                    if index != start && depth == 0 {
                        return Some((&json[from..=index], index + 1));
                    }
                }
                _ => {}
            }
        }
        index += 1;
    }
    None
}

pub struct JsonSplitter {
    split_length: usize,
    common_keys: Vec<String>,
}

impl JsonSplitter {
    #[must_use]
    pub fn new(split_length: usize, common_keys: &[&str]) -> Self {
        Self {
            split_length,
            common_keys: common_keys.iter().map(ToString::to_string).collect(),
        }
    }

    /// Emit fragments of at most `split_length` bytes (element counts
    /// included for logging). An element that alone exceeds the budget is
    /// emitted oversized; the transport reports it.
    pub fn split(&self, json: &str, emit: &mut dyn FnMut(&str, usize)) {
        let mut common = String::new();
        for key in &self.common_keys {
            if let Some(value) = find_value(json, key) {
                if !common.is_empty() {
                    common.push(',');
                }
                common.push_str(&format!("\"{key}\":{value}"));
            }
        }
        if !common.is_empty() {
            common.push(',');
        }

        let mut current = String::new();
        let mut elements = 0;
        let mut cursor = 1; // past the opening brace
        while let Some((element, next)) = find_next_element(json, cursor) {
            cursor = next;
            if self
                .common_keys
                .iter()
                .any(|key| element.starts_with(&format!("\"{key}\":")))
            {
                continue;
            }
            if (1 + common.len()) + current.len() + (element.len() + 1) < self.split_length {
                if !current.is_empty() && !current.ends_with(',') {
                    current.push(',');
                }
                current.push_str(element);
                elements += 1;
            } else {
                if !current.is_empty() {
                    emit(&assemble(&common, &current), elements);
                }
                current = element.to_string();
                elements = 1;
            }
        }
        if !current.is_empty() {
            emit(&assemble(&common, &current), elements);
        }
    }
}

fn assemble(common: &str, body: &str) -> String {
    let trimmed = body.strip_suffix(',').unwrap_or(body);
    format!("{{{common}{trimmed}}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const PAYLOAD: &str = r#"{"type":"data","time":"2024-07-15T10:00:00Z","addr":"aabbcc","tmp":{"bms":{"V":52.1,"I":-3.0},"bat":{"avg":25.5,"val":[25.0,25.5,26.0]}},"fan":68,"alm":"TEMP_WARN"}"#;

    #[test]
    fn small_payload_is_one_fragment() {
        let splitter = JsonSplitter::new(4096, &["type", "time", "addr"]);
        let mut fragments = Vec::new();
        splitter.split(PAYLOAD, &mut |fragment, _| fragments.push(fragment.to_string()));
        assert_eq!(fragments.len(), 1);
        let parsed: Value = serde_json::from_str(&fragments[0]).expect("valid json");
        assert_eq!(parsed["type"], "data");
        assert_eq!(parsed["fan"], 68);
    }

    #[test]
    fn fragments_parse_and_carry_common_keys() {
        let splitter = JsonSplitter::new(100, &["type", "time", "addr"]);
        let mut fragments = Vec::new();
        splitter.split(PAYLOAD, &mut |fragment, elements| {
            assert!(elements >= 1);
            fragments.push(fragment.to_string());
        });
        assert!(fragments.len() > 1, "expected a split");
        for fragment in &fragments {
            let parsed: Value = serde_json::from_str(fragment)
                .unwrap_or_else(|fault| panic!("fragment not valid json: {fault}: {fragment}"));
            assert_eq!(parsed["type"], "data", "common key missing in {fragment}");
            assert_eq!(parsed["time"], "2024-07-15T10:00:00Z");
            assert_eq!(parsed["addr"], "aabbcc");
        }
    }

    #[test]
    fn every_body_element_survives_the_split() {
        let splitter = JsonSplitter::new(120, &["type", "time", "addr"]);
        let mut merged = serde_json::Map::new();
        splitter.split(PAYLOAD, &mut |fragment, _| {
            let parsed: Value = serde_json::from_str(fragment).expect("valid json");
            for (key, value) in parsed.as_object().expect("object") {
                merged.insert(key.clone(), value.clone());
            }
        });
        let original: Value = serde_json::from_str(PAYLOAD).expect("valid json");
        for (key, value) in original.as_object().expect("object") {
            assert_eq!(merged.get(key), Some(value), "lost element {key}");
        }
    }

    #[test]
    fn string_values_with_braces_do_not_confuse_the_walker() {
        let json = r#"{"type":"data","note":"a{b}c,d","n":1}"#;
        let splitter = JsonSplitter::new(4096, &["type"]);
        let mut fragments = Vec::new();
        splitter.split(json, &mut |fragment, _| fragments.push(fragment.to_string()));
        assert_eq!(fragments.len(), 1);
        let parsed: Value = serde_json::from_str(&fragments[0]).expect("valid json");
        assert_eq!(parsed["note"], "a{b}c,d");
        assert_eq!(parsed["n"], 1);
    }

    #[test]
    fn find_value_handles_string_and_scalar() {
        assert_eq!(find_value(PAYLOAD, "type"), Some("\"data\""));
        assert_eq!(find_value(PAYLOAD, "fan"), Some("68"));
        assert_eq!(find_value(PAYLOAD, "missing"), None);
    }
}
