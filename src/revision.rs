//! Revision playback over change pre-images.
//!
//! Each change row stores the *previous* values of exactly the fields that
//! differed, so only the current row and the change log are persisted.
//! Revision `n` (numbered from 0, oldest first) is the state *before*
//! change `n` happened; revision `N` is the current row itself.
//!
//! Reconstruction walks backwards: overlaying the pre-images of change
//! `N-1`, then `N-2`, … down to change `n` onto the current state yields
//! the state at revision `n`.

use serde_json::{Map, Value};

/// Reconstruct revision `n` from the current serialised state and the
/// ordered change log (oldest first).
///
/// `n == changes.len()` returns the current state unchanged. Callers are
/// expected to have range-checked `n` against the revision count.
pub fn reconstruct(
    current: &Map<String, Value>,
    changes: &[Map<String, Value>],
    n: usize,
) -> Map<String, Value> {
    let mut state = current.clone();
    for changed in changes[n..].iter().rev() {
        for (field, old_value) in changed {
            state.insert(field.clone(), old_value.clone());
        }
    }
    state
}

/// The value of `field` at revision `n`, i.e. *before* change `n` happened.
///
/// Checks change `n` itself first, then the later changes in order (their
/// pre-image is the value that was current until they happened), and falls
/// back to the live state.
pub fn value_at<'a>(
    current: &'a Map<String, Value>,
    changes: &'a [Map<String, Value>],
    field: &str,
    n: usize,
) -> Option<&'a Value> {
    for changed in &changes[n..] {
        if let Some(value) = changed.get(field) {
            return Some(value);
        }
    }
    current.get(field)
}

/// The diff recorded by change `n`, as `field → (old, new)` pairs.
///
/// The new value of a field is the next later pre-image of that field, or
/// the live value if no later change touched it.
pub fn diff_at(
    current: &Map<String, Value>,
    changes: &[Map<String, Value>],
    n: usize,
) -> Map<String, Value> {
    let mut diff = Map::new();
    for (field, old_value) in &changes[n] {
        let new_value = value_at(current, changes, field, n + 1)
            .cloned()
            .unwrap_or(Value::Null);
        diff.insert(
            field.clone(),
            serde_json::json!({ "old": old_value, "new": new_value }),
        );
    }
    diff
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn no_changes_returns_current() {
        let current = map(json!({"title": "t"}));
        let rebuilt = reconstruct(&current, &[], 0);
        assert_eq!(rebuilt, current);
    }

    #[test]
    fn replay_reconstructs_every_revision() {
        // v0 has title and content; edit 1 changes the title, edit 2 the content.
        let current = map(json!({"title": "Some really nice title",
                                 "content": "Some very neat content but changed."}));
        let changes = vec![
            map(json!({"title": "Some nice title"})),
            map(json!({"content": "Some very neat content."})),
        ];

        let v0 = reconstruct(&current, &changes, 0);
        assert_eq!(v0["title"], json!("Some nice title"));
        assert_eq!(v0["content"], json!("Some very neat content."));

        let v1 = reconstruct(&current, &changes, 1);
        assert_eq!(v1["title"], json!("Some really nice title"));
        assert_eq!(v1["content"], json!("Some very neat content."));

        let v2 = reconstruct(&current, &changes, 2);
        assert_eq!(v2, current);
    }

    #[test]
    fn untouched_fields_keep_the_current_value() {
        let current = map(json!({"name": "Name1", "description": "New description"}));
        let changes = vec![
            map(json!({"name": "Name1", "description": "Original description"})),
            map(json!({"name": "Name2"})),
        ];

        let v0 = reconstruct(&current, &changes, 0);
        assert_eq!(v0["name"], json!("Name1"));
        assert_eq!(v0["description"], json!("Original description"));

        let v1 = reconstruct(&current, &changes, 1);
        assert_eq!(v1["name"], json!("Name2"));
        assert_eq!(v1["description"], json!("New description"));
    }

    #[test]
    fn value_at_prefers_own_change_then_later_ones() {
        let current = map(json!({"title": "v2"}));
        let changes = vec![map(json!({"title": "v0"})), map(json!({"title": "v1"}))];

        assert_eq!(value_at(&current, &changes, "title", 0), Some(&json!("v0")));
        assert_eq!(value_at(&current, &changes, "title", 1), Some(&json!("v1")));
        assert_eq!(value_at(&current, &changes, "title", 2), Some(&json!("v2")));
    }

    #[test]
    fn diff_pairs_old_with_next_known_value() {
        let current = map(json!({"title": "v2", "content": "c"}));
        let changes = vec![map(json!({"title": "v0"})), map(json!({"title": "v1"}))];

        let d0 = diff_at(&current, &changes, 0);
        assert_eq!(d0["title"], json!({"old": "v0", "new": "v1"}));

        let d1 = diff_at(&current, &changes, 1);
        assert_eq!(d1["title"], json!({"old": "v1", "new": "v2"}));
    }
}
