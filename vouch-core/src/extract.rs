//! Pulling codes and user ids out of authority responses.
//!
//! The authority's response shapes have changed over time. Known field
//! paths are tried in priority order first; only if none of them holds a
//! usable value is the whole document scanned, up to [`MAX_SCAN_DEPTH`]
//! levels deep. A fallback hit is logged as a warning, since it means
//! the upstream contract drifted.

use serde_json::Value;

/// Dotted paths that have carried the login code, most recent shape first.
pub const CODE_PATHS: &[&str] = &[
    "code",
    "data.code",
    "verification_code",
    "data.verification_code",
    "user.code",
    "data.user.code",
    "otp",
];

/// Dotted paths that have carried the user id, most recent shape first.
pub const USER_ID_PATHS: &[&str] = &[
    "user_id",
    "userId",
    "data.user_id",
    "data.userId",
    "user.id",
    "data.user.id",
    "id",
    "data.id",
];

/// How deep the fallback scan descends into nested objects and arrays.
pub const MAX_SCAN_DEPTH: usize = 8;

/// Where a value was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// One of the known paths
    Known(&'static str),
    /// Only through the fallback scan, at the given path
    Fallback(String),
}

impl Source {
    /// Whether the value came from the fallback scan
    pub fn is_fallback(&self) -> bool {
        matches!(self, Source::Fallback(_))
    }
}

/// A value found in a response, and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// The extracted value
    pub value: String,
    /// Where it was found
    pub source: Source,
}

/// Find a code of exactly `digits` digits.
///
/// Numbers are accepted too, and zero padded, since some responses
/// serialized the code as an integer.
pub fn extract_code(response: &Value, digits: usize) -> Option<Extracted> {
    let as_code = |value: &Value| code_value(value, digits);

    if let Some(found) = known(response, CODE_PATHS, &as_code) {
        return Some(found);
    }

    let found = scan(response, &as_code, &|key| key.to_lowercase().contains("code"))?;
    tracing::warn!(
        path = ?found.source,
        "Found a code outside the known response fields, the authority's response shape may have changed"
    );
    Some(found)
}

/// Find the user id.
pub fn extract_user_id(response: &Value) -> Option<Extracted> {
    if let Some(found) = known(response, USER_ID_PATHS, &id_value) {
        return Some(found);
    }

    let found = scan(response, &id_value, &|key| {
        let key = key.to_lowercase();
        key == "id" || key.ends_with("_id") || key.ends_with("userid")
    })?;
    tracing::warn!(
        path = ?found.source,
        "Found a user id outside the known response fields, the authority's response shape may have changed"
    );
    Some(found)
}

/// Look up a dotted path like `data.user.code`.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

fn known(
    response: &Value,
    paths: &'static [&'static str],
    accept: &dyn Fn(&Value) -> Option<String>,
) -> Option<Extracted> {
    paths.iter().find_map(|path| {
        let value = accept(lookup(response, path)?)?;
        Some(Extracted {
            value,
            source: Source::Known(*path),
        })
    })
}

fn scan(
    response: &Value,
    accept: &dyn Fn(&Value) -> Option<String>,
    key_matches: &dyn Fn(&str) -> bool,
) -> Option<Extracted> {
    let mut stack = vec![(response, String::new(), 0usize)];

    while let Some((value, path, depth)) = stack.pop() {
        if depth >= MAX_SCAN_DEPTH {
            continue;
        }

        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = join(&path, key);
                    if key_matches(key) {
                        if let Some(value) = accept(child) {
                            return Some(Extracted {
                                value,
                                source: Source::Fallback(child_path),
                            });
                        }
                    }
                    stack.push((child, child_path, depth + 1));
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    stack.push((child, join(&path, &index.to_string()), depth + 1));
                }
            }
            _ => {}
        }
    }

    None
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn code_value(value: &Value, digits: usize) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (s.len() == digits && s.bytes().all(|b| b.is_ascii_digit())).then(|| s.to_string())
        }
        Value::Number(n) => {
            let n = n.as_u64()?;
            let padded = format!("{n:0>digits$}");
            (padded.len() == digits).then_some(padded)
        }
        _ => None,
    }
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefers_known_paths_in_order() {
        let response = json!({
            "data": { "code": "111111" },
            "code": "482913",
        });

        let found = extract_code(&response, 6).unwrap();
        assert_eq!(found.value, "482913");
        assert_eq!(found.source, Source::Known("code"));
    }

    #[test]
    fn test_skips_known_paths_with_unusable_values() {
        let response = json!({
            "code": "not-a-code",
            "data": { "verification_code": 4829 },
        });

        let found = extract_code(&response, 6).unwrap();
        assert_eq!(found.value, "004829");
        assert_eq!(found.source, Source::Known("data.verification_code"));
    }

    #[test_log::test]
    fn test_falls_back_to_scan_and_flags_it() {
        let response = json!({
            "result": [{ "meta": { "loginCode": "482913" } }],
        });

        let found = extract_code(&response, 6).unwrap();
        assert_eq!(found.value, "482913");
        assert_eq!(
            found.source,
            Source::Fallback("result.0.meta.loginCode".to_string())
        );
        assert!(found.source.is_fallback());
    }

    #[test]
    fn test_scan_is_depth_bounded() {
        let mut response = json!({ "code_holder": "482913" });
        for _ in 0..MAX_SCAN_DEPTH {
            response = json!({ "nested": response });
        }

        assert_eq!(extract_code(&response, 6), None);
    }

    #[test]
    fn test_missing_code() {
        let response = json!({ "status": "ok", "data": { "code": "12" } });
        assert_eq!(extract_code(&response, 6), None);
    }

    #[test]
    fn test_user_id_from_number_and_nested() {
        assert_eq!(
            extract_user_id(&json!({ "userId": 42 })).unwrap().value,
            "42"
        );

        let found = extract_user_id(&json!({ "data": { "user": { "id": "u-7" } } })).unwrap();
        assert_eq!(found.value, "u-7");
        assert_eq!(found.source, Source::Known("data.user.id"));

        let found = extract_user_id(&json!({ "payload": { "owner_id": "u-9" } })).unwrap();
        assert_eq!(found.source, Source::Fallback("payload.owner_id".to_string()));
    }
}
