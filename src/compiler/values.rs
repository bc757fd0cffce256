//! Value plumbing: yield collection, argument stringification, directory
//! merging, and path cleanup.

use serde_json::Value;

/// Append `outputs` to `dest`, spreading each output one level deep.
///
/// With no outputs the destination passes through unchanged (an absent
/// destination becomes the empty sequence). Otherwise the destination is
/// coerced to a sequence and every output is appended, sequences contributing
/// their elements instead of themselves. Nesting below that first level is
/// preserved.
pub(crate) fn yield_to(dest: Option<Value>, outputs: Vec<Value>) -> Value {
    if outputs.is_empty() {
        return dest.unwrap_or_else(|| Value::Array(Vec::new()));
    }
    let mut items = match dest {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(existing)) => existing,
        Some(scalar) => vec![scalar],
    };
    for output in outputs {
        match output {
            Value::Array(elements) => items.extend(elements),
            other => items.push(other),
        }
    }
    Value::Array(items)
}

/// Render a scalar for use as a command-line argument. Strings pass through
/// without quotes; everything else uses its JSON rendering.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Flatten a value into the flat list of stringified scalars it contains.
/// Unlike [`yield_to`] this flattens through every nesting level.
pub(crate) fn to_string_collection(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().flat_map(to_string_collection).collect(),
        other => vec![stringify(other)],
    }
}

/// Collapse a sequence of file paths to their deepest common directory.
///
/// Returns `None` when the value is not a non-empty sequence of strings or
/// the common prefix contains no separator; callers then use the value as-is.
/// The file indexer reports a directory input as the list of files inside it,
/// which this undoes for services that expect the directory itself.
pub(crate) fn merge_to_dir(value: &Value) -> Option<String> {
    let Value::Array(items) = value else {
        return None;
    };
    let paths: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
    if paths.is_empty() || paths.len() != items.len() {
        return None;
    }
    let mut prefix = paths[0].to_string();
    for path in &paths[1..] {
        let common = prefix
            .bytes()
            .zip(path.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(common);
    }
    let separator = prefix.rfind('/')?;
    if separator == 0 {
        Some("/".to_string())
    } else {
        Some(prefix[..separator].to_string())
    }
}

/// Collapse runs of `/` into one. Path components are never reordered.
pub(crate) fn normalize_separators(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    let mut previous_was_separator = false;
    for c in path.chars() {
        if c == '/' {
            if !previous_was_separator {
                normalized.push(c);
            }
            previous_was_separator = true;
        } else {
            normalized.push(c);
            previous_was_separator = false;
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn yield_to_without_outputs_passes_destination_through() {
        assert_eq!(yield_to(None, Vec::new()), json!([]));
        assert_eq!(yield_to(Some(json!("a")), Vec::new()), json!("a"));
    }

    #[test]
    fn yield_to_appends_and_spreads_one_level() {
        assert_eq!(yield_to(None, vec![json!("b")]), json!(["b"]));
        assert_eq!(yield_to(Some(json!("a")), vec![json!("b")]), json!(["a", "b"]));
        assert_eq!(
            yield_to(Some(json!("a")), vec![json!("b"), json!([]), json!("c")]),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            yield_to(
                Some(json!(["a", "b"])),
                vec![json!("c"), json!([]), json!(["d", "e"])]
            ),
            json!(["a", "b", "c", "d", "e"])
        );
    }

    #[test]
    fn yield_to_preserves_nesting_below_the_first_level() {
        assert_eq!(
            yield_to(
                Some(json!(["a", "b"])),
                vec![json!("c"), json!([]), json!(["d", ["e"]])]
            ),
            json!(["a", "b", "c", "d", ["e"]])
        );
    }

    #[test]
    fn yield_to_treats_null_destination_as_empty() {
        assert_eq!(yield_to(Some(Value::Null), vec![json!("x")]), json!(["x"]));
    }

    #[test]
    fn to_string_collection_flattens_recursively() {
        assert_eq!(
            to_string_collection(&json!(["a", ["b", ["c"]], 1, true])),
            vec!["a", "b", "c", "1", "true"]
        );
        assert_eq!(to_string_collection(&json!("solo")), vec!["solo"]);
    }

    #[test]
    fn merge_to_dir_finds_common_parent() {
        assert_eq!(
            merge_to_dir(&json!(["/data/in/a.txt", "/data/in/b.txt"])),
            Some("/data/in".to_string())
        );
        assert_eq!(
            merge_to_dir(&json!(["/data/in/sub/a.txt", "/data/in/b.txt"])),
            Some("/data/in".to_string())
        );
        assert_eq!(
            merge_to_dir(&json!(["/data/only.txt"])),
            Some("/data".to_string())
        );
    }

    #[test]
    fn merge_to_dir_rejects_non_path_collections() {
        assert_eq!(merge_to_dir(&json!("not-a-list")), None);
        assert_eq!(merge_to_dir(&json!([])), None);
        assert_eq!(merge_to_dir(&json!(["/a.txt", 5])), None);
        assert_eq!(merge_to_dir(&json!(["a.txt", "b.txt"])), None);
    }

    #[test]
    fn merge_to_dir_stops_at_root() {
        assert_eq!(
            merge_to_dir(&json!(["/a.txt", "/b.txt"])),
            Some("/".to_string())
        );
    }

    #[test]
    fn normalize_separators_collapses_runs() {
        assert_eq!(normalize_separators("/tmp//out///x.bin"), "/tmp/out/x.bin");
        assert_eq!(normalize_separators("relative/path"), "relative/path");
    }
}
