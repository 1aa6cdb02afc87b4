//! Delta records and their reference application semantics.
//!
//! Array channels carry [`ListDelta`] records; object channels carry
//! [`Patch`] records. The `apply_*` functions are the normative semantics —
//! clients in other languages implement the same rules.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An incremental update to an array-shaped channel snapshot.
///
/// Items are JSON objects carrying an `id` field; `add` appends, `remove`
/// deletes by id, `update` shallow-merges onto the existing item, and
/// `append` attaches a streaming fragment (message channels).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListDelta {
    Add {
        #[serde(flatten)]
        item: Value,
    },
    Remove {
        #[serde(flatten)]
        item: Value,
    },
    Update {
        #[serde(flatten)]
        item: Value,
    },
    Append {
        message: Value,
    },
}

/// A shallow-merge update to an object-shaped channel snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Patch {
    Patch {
        #[serde(flatten)]
        fields: Value,
    },
}

impl Patch {
    pub fn new(fields: Value) -> Self {
        Patch::Patch { fields }
    }
}

fn item_id(item: &Value) -> Option<&str> {
    item.get("id").and_then(Value::as_str)
}

/// Apply a list delta to a snapshot array.
///
/// Unknown ids on `remove`/`update` leave the list untouched; `append` adds
/// its message at the end like `add`.
pub fn apply_list_delta(items: &mut Vec<Value>, delta: &ListDelta) {
    match delta {
        ListDelta::Add { item } => items.push(item.clone()),
        ListDelta::Append { message } => items.push(message.clone()),
        ListDelta::Remove { item } => {
            if let Some(id) = item_id(item) {
                items.retain(|existing| item_id(existing) != Some(id));
            }
        }
        ListDelta::Update { item } => {
            let Some(id) = item_id(item) else { return };
            for existing in items.iter_mut() {
                if item_id(existing) == Some(id) {
                    shallow_merge(existing, item);
                    return;
                }
            }
        }
    }
}

/// Apply an object patch to a snapshot object.
pub fn apply_patch(snapshot: &mut Value, patch: &Patch) {
    let Patch::Patch { fields } = patch;
    shallow_merge(snapshot, fields);
}

fn shallow_merge(target: &mut Value, source: &Value) {
    let Some(source) = source.as_object() else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Some(target) = target.as_object_mut() else {
        return;
    };
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_appends() {
        let mut items = vec![json!({"id": "a"})];
        apply_list_delta(
            &mut items,
            &ListDelta::Add {
                item: json!({"id": "b"}),
            },
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["id"], "b");
    }

    #[test]
    fn remove_deletes_by_id() {
        let mut items = vec![json!({"id": "a"}), json!({"id": "b"})];
        apply_list_delta(
            &mut items,
            &ListDelta::Remove {
                item: json!({"id": "a"}),
            },
        );
        assert_eq!(items, vec![json!({"id": "b"})]);
    }

    #[test]
    fn update_shallow_merges() {
        let mut items = vec![json!({"id": "a", "status": "starting", "hostname": "h"})];
        apply_list_delta(
            &mut items,
            &ListDelta::Update {
                item: json!({"id": "a", "status": "running"}),
            },
        );
        assert_eq!(items[0]["status"], "running");
        assert_eq!(items[0]["hostname"], "h");
    }

    #[test]
    fn update_unknown_id_is_noop() {
        let mut items = vec![json!({"id": "a"})];
        apply_list_delta(
            &mut items,
            &ListDelta::Update {
                item: json!({"id": "zzz", "status": "running"}),
            },
        );
        assert_eq!(items, vec![json!({"id": "a"})]);
    }

    #[test]
    fn delta_wire_format_is_flat() {
        let delta = ListDelta::Update {
            item: json!({"id": "a", "status": "running"}),
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["id"], "a");
        assert_eq!(value["status"], "running");
    }

    #[test]
    fn patch_shallow_merges_object() {
        let mut snapshot = json!({"actual": "stopped", "retryCount": 0});
        apply_patch(
            &mut snapshot,
            &Patch::new(json!({"actual": "starting", "retryCount": 1})),
        );
        assert_eq!(snapshot["actual"], "starting");
        assert_eq!(snapshot["retryCount"], 1);
    }

    #[test]
    fn patch_wire_format() {
        let patch = Patch::new(json!({"errorMessage": "boom"}));
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(value["type"], "patch");
        assert_eq!(value["errorMessage"], "boom");
    }
}
