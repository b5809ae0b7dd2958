//! Path-addressed modifications and minimal diff computation.
//!
//! A [`Mod`] describes one change to a JSON value. For `set`, `insert` and
//! `delete` the last path segment addresses a slot inside its parent; for
//! `append` the path addresses the sequence itself. A `set` with an empty
//! path replaces the whole value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SyncError;

/// One step of a path into a nested value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Position in a sequence.
    Index(usize),
    /// Key in a map.
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Kind of modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Set,
    Insert,
    Delete,
    Append,
}

/// A single modification to a topic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mod {
    pub op: Op,
    pub path: Vec<PathSegment>,
    #[serde(default)]
    pub payload: Value,
}

impl Mod {
    pub fn set(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: Op::Set,
            path,
            payload: value,
        }
    }

    pub fn insert(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: Op::Insert,
            path,
            payload: value,
        }
    }

    pub fn delete(path: Vec<PathSegment>) -> Self {
        Self {
            op: Op::Delete,
            path,
            payload: Value::Null,
        }
    }

    pub fn append(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: Op::Append,
            path,
            payload: value,
        }
    }

    /// Apply this modification to `target` in place.
    pub fn apply(&self, target: &mut Value) -> Result<(), SyncError> {
        if self.op == Op::Append {
            let node = resolve_mut(target, &self.path)?;
            let Value::Array(seq) = node else {
                return Err(SyncError::InvalidPath(render_path(&self.path)));
            };
            seq.push(self.payload.clone());
            return Ok(());
        }

        let Some((last, parent_path)) = self.path.split_last() else {
            if self.op == Op::Set {
                *target = self.payload.clone();
                return Ok(());
            }
            return Err(SyncError::InvalidPath(render_path(&self.path)));
        };

        let parent = resolve_mut(target, parent_path)?;
        let applied = match (self.op, parent, last) {
            (Op::Set, Value::Object(map), PathSegment::Key(key)) => {
                map.insert(key.clone(), self.payload.clone());
                true
            }
            (Op::Set, Value::Array(seq), PathSegment::Index(index)) if *index < seq.len() => {
                seq[*index] = self.payload.clone();
                true
            }
            (Op::Insert, Value::Array(seq), PathSegment::Index(index)) if *index <= seq.len() => {
                seq.insert(*index, self.payload.clone());
                true
            }
            (Op::Delete, Value::Object(map), PathSegment::Key(key)) => map.remove(key).is_some(),
            (Op::Delete, Value::Array(seq), PathSegment::Index(index)) if *index < seq.len() => {
                seq.remove(*index);
                true
            }
            _ => false,
        };

        if applied {
            Ok(())
        } else {
            Err(SyncError::InvalidPath(render_path(&self.path)))
        }
    }
}

fn resolve_mut<'a>(
    mut node: &'a mut Value,
    path: &[PathSegment],
) -> Result<&'a mut Value, SyncError> {
    for segment in path {
        let next = match (node, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(seq), PathSegment::Index(index)) => seq.get_mut(*index),
            _ => None,
        };
        node = next.ok_or_else(|| SyncError::InvalidPath(render_path(path)))?;
    }
    Ok(node)
}

fn render_path(path: &[PathSegment]) -> String {
    let segments: Vec<String> = path
        .iter()
        .map(|segment| match segment {
            PathSegment::Index(index) => index.to_string(),
            PathSegment::Key(key) => key.clone(),
        })
        .collect();
    format!("/{}", segments.join("/"))
}

/// Compute the modifications that turn `old` into `new`.
///
/// Maps are diffed key by key and recursed into. Sequences that shifted
/// (entries dropped from the front, entries added at the back) become
/// appends followed by deletes at index 0; other sequence edits are
/// expressed relative to the common prefix and suffix.
pub fn compute_mods(old: &Value, new: &Value) -> Vec<Mod> {
    let mut mods = Vec::new();
    diff_into(&mut Vec::new(), old, new, &mut mods);
    mods
}

fn diff_into(path: &mut Vec<PathSegment>, old: &Value, new: &Value, out: &mut Vec<Mod>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(before), Value::Object(after)) => diff_map(path, before, after, out),
        (Value::Array(before), Value::Array(after)) => diff_sequence(path, before, after, out),
        _ => out.push(Mod::set(path.clone(), new.clone())),
    }
}

fn diff_map(
    path: &mut Vec<PathSegment>,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    out: &mut Vec<Mod>,
) {
    for key in before.keys() {
        if !after.contains_key(key) {
            path.push(PathSegment::Key(key.clone()));
            out.push(Mod::delete(path.clone()));
            path.pop();
        }
    }
    for (key, value) in after {
        path.push(PathSegment::Key(key.clone()));
        match before.get(key) {
            Some(previous) => diff_into(path, previous, value, out),
            None => out.push(Mod::set(path.clone(), value.clone())),
        }
        path.pop();
    }
}

fn diff_sequence(
    path: &mut Vec<PathSegment>,
    before: &[Value],
    after: &[Value],
    out: &mut Vec<Mod>,
) {
    // Sliding window: a suffix of the old sequence is a prefix of the new one.
    let shifted = (0..before.len()).find(|&dropped| {
        let kept = &before[dropped..];
        kept.len() <= after.len() && after.starts_with(kept)
    });
    if let Some(dropped) = shifted {
        let kept = before.len() - dropped;
        for value in &after[kept..] {
            out.push(Mod::append(path.clone(), value.clone()));
        }
        for _ in 0..dropped {
            path.push(PathSegment::Index(0));
            out.push(Mod::delete(path.clone()));
            path.pop();
        }
        return;
    }

    let prefix = before
        .iter()
        .zip(after)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = before[prefix..]
        .iter()
        .rev()
        .zip(after[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_middle = &before[prefix..before.len() - suffix];
    let new_middle = &after[prefix..after.len() - suffix];
    let paired = old_middle.len().min(new_middle.len());

    for offset in 0..paired {
        path.push(PathSegment::Index(prefix + offset));
        diff_into(path, &old_middle[offset], &new_middle[offset], out);
        path.pop();
    }

    if new_middle.len() > paired {
        for (offset, value) in new_middle.iter().enumerate().skip(paired) {
            let index = prefix + offset;
            if suffix == 0 {
                out.push(Mod::append(path.clone(), value.clone()));
            } else {
                path.push(PathSegment::Index(index));
                out.push(Mod::insert(path.clone(), value.clone()));
                path.pop();
            }
        }
    } else {
        for _ in paired..old_middle.len() {
            path.push(PathSegment::Index(prefix + paired));
            out.push(Mod::delete(path.clone()));
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn replay(old: &Value, mods: &[Mod]) -> Value {
        let mut value = old.clone();
        for m in mods {
            m.apply(&mut value).unwrap();
        }
        value
    }

    #[test]
    fn test_identical_values_produce_no_mods() {
        let value = json!({"a": [1, 2, {"b": null}]});
        assert!(compute_mods(&value, &value).is_empty());
    }

    #[test]
    fn test_map_key_changes_are_minimal() {
        let old = json!({"keep": 1, "change": {"x": 1, "y": 2}, "drop": true});
        let new = json!({"keep": 1, "change": {"x": 1, "y": 3}, "add": "new"});
        let mods = compute_mods(&old, &new);

        assert_eq!(
            mods,
            vec![
                Mod::delete(vec!["drop".into()]),
                Mod::set(vec!["add".into()], json!("new")),
                Mod::set(vec!["change".into(), "y".into()], json!(3)),
            ]
        );
        assert_eq!(replay(&old, &mods), new);
    }

    #[test]
    fn test_sequence_rotation_is_append_then_delete_oldest() {
        let old = json!([1, 2, 3]);
        let new = json!([2, 3, 4]);
        let mods = compute_mods(&old, &new);

        assert_eq!(
            mods,
            vec![
                Mod::append(vec![], json!(4)),
                Mod::delete(vec![0.into()]),
            ]
        );
        assert_eq!(replay(&old, &mods), new);
    }

    #[test]
    fn test_sequence_middle_insert_and_delete() {
        let old = json!(["a", "b", "c"]);
        let new = json!(["a", "x", "y", "c"]);
        let mods = compute_mods(&old, &new);
        assert_eq!(
            mods,
            vec![
                Mod::set(vec![1.into()], json!("x")),
                Mod::insert(vec![2.into()], json!("y")),
            ]
        );
        assert_eq!(replay(&old, &mods), new);

        let mods = compute_mods(&new, &old);
        assert_eq!(replay(&new, &mods), old);
    }

    #[test]
    fn test_type_change_sets_whole_slot() {
        let old = json!({"a": [1]});
        let new = json!({"a": {"b": 1}});
        assert_eq!(
            compute_mods(&old, &new),
            vec![Mod::set(vec!["a".into()], json!({"b": 1}))]
        );
        assert_eq!(
            compute_mods(&json!(1), &json!("root")),
            vec![Mod::set(vec![], json!("root"))]
        );
    }

    #[test]
    fn test_set_null_survives_wire_format() {
        let m = Mod::set(vec!["k".into()], Value::Null);
        let json = serde_json::to_string(&m).unwrap();
        let decoded: Mod = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_apply_rejects_missing_locations() {
        let mut value = json!({"a": [1]});
        assert!(Mod::delete(vec!["missing".into()]).apply(&mut value).is_err());
        assert!(Mod::delete(vec!["a".into(), 3.into()]).apply(&mut value).is_err());
        assert!(Mod::append(vec![], json!(1)).apply(&mut value).is_err());
        assert!(Mod::insert(vec!["a".into(), 5.into()], json!(0)).apply(&mut value).is_err());
        assert!(Mod::delete(vec![]).apply(&mut value).is_err());
        assert_eq!(value, json!({"a": [1]}));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            (-5i64..5).prop_map(Value::from),
            "[a-c]{0,2}".prop_map(Value::from),
        ]
    }

    fn nested() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        // Replaying computed mods onto the old value always yields the new value
        #[test]
        fn mods_transform_old_into_new(old in nested(), new in nested()) {
            let mods = compute_mods(&old, &new);
            prop_assert_eq!(replay(&old, &mods), new);
        }
    }
}
