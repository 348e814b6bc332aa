//! Union-schema inference over a capture file.
//!
//! Walks every JSON message body and accumulates, per path: a bitmask of
//! observed value types, the maximum string length, per-key presence counts
//! for objects and a merged element subtree for arrays. The result is
//! rendered as a JSON-Schema style summary.

use crate::{CaptureReader, CaptureResult};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const T_BOOL: u32 = 1 << 1;
pub const T_INT: u32 = 1 << 2;
pub const T_NUM: u32 = 1 << 3;
pub const T_STR: u32 = 1 << 4;
pub const T_OBJ: u32 = 1 << 5;
pub const T_ARR: u32 = 1 << 6;

#[derive(Debug, Default, Clone)]
pub struct SchemaNode {
    pub types: u32,
    pub max_strlen: usize,
    pub props: BTreeMap<String, SchemaNode>,
    pub prop_present: BTreeMap<String, u64>,
    pub seen_objects: u64,
    pub items: Option<Box<SchemaNode>>,
}

impl SchemaNode {
    pub fn observe(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(_) => self.types |= T_BOOL,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    self.types |= T_INT;
                } else {
                    self.types |= T_NUM;
                }
            }
            Value::String(s) => {
                self.types |= T_STR;
                self.max_strlen = self.max_strlen.max(s.len());
            }
            Value::Array(items) => {
                self.types |= T_ARR;
                let node = self.items.get_or_insert_with(Default::default);
                for item in items {
                    node.observe(item);
                }
            }
            Value::Object(map) => {
                self.types |= T_OBJ;
                self.seen_objects += 1;
                for (key, item) in map {
                    *self.prop_present.entry(key.clone()).or_insert(0) += 1;
                    self.props.entry(key.clone()).or_default().observe(item);
                }
            }
        }
    }

    pub fn merge(&mut self, other: &SchemaNode) {
        self.types |= other.types;
        self.max_strlen = self.max_strlen.max(other.max_strlen);
        if other.seen_objects > 0 {
            self.seen_objects += other.seen_objects;
            for (key, node) in &other.props {
                self.props.entry(key.clone()).or_default().merge(node);
            }
            for (key, count) in &other.prop_present {
                *self.prop_present.entry(key.clone()).or_insert(0) += count;
            }
        }
        if let Some(items) = &other.items {
            self.items
                .get_or_insert_with(Default::default)
                .merge(items);
        }
    }

    fn type_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.types & T_BOOL != 0 {
            names.push("boolean");
        }
        if self.types & T_INT != 0 {
            names.push("integer");
        }
        if self.types & T_NUM != 0 {
            names.push("number");
        }
        if self.types & T_STR != 0 {
            names.push("string");
        }
        if self.types & T_OBJ != 0 {
            names.push("object");
        }
        if self.types & T_ARR != 0 {
            names.push("array");
        }
        names
    }

    /// JSON-Schema flavored summary of this subtree.
    pub fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        let names = self.type_names();
        match names.len() {
            0 => {}
            1 => {
                out.insert("type".into(), json!(names[0]));
            }
            _ => {
                out.insert("type".into(), json!(names));
            }
        }
        if self.types & T_STR != 0 {
            out.insert("maxLength".into(), json!(self.max_strlen));
        }
        if self.types & T_OBJ != 0 {
            out.insert("seenObjects".into(), json!(self.seen_objects));
            let mut props = Map::new();
            for (key, node) in &self.props {
                let mut prop = node.to_json_schema();
                if let (Value::Object(obj), Some(count)) =
                    (&mut prop, self.prop_present.get(key))
                {
                    obj.insert("presentCount".into(), json!(count));
                }
                props.insert(key.clone(), prop);
            }
            out.insert("properties".into(), Value::Object(props));
        }
        if let Some(items) = &self.items {
            out.insert("items".into(), items.to_json_schema());
        }
        Value::Object(out)
    }
}

/// Walk the file and infer a union schema, optionally restricted to one
/// topic. Unparsable bodies are skipped.
pub fn infer_schema(path: &Path, topic: Option<&str>) -> CaptureResult<Value> {
    let mut reader = CaptureReader::open(path)?;
    let mut root = SchemaNode::default();
    while let Some(msg) = reader.next_message()? {
        if let Some(filter) = topic {
            if msg.topic != filter {
                continue;
            }
        }
        if let Ok(value) = serde_json::from_slice::<Value>(&msg.data) {
            root.observe(&value);
        }
    }
    Ok(root.to_json_schema())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{CaptureMessage, CaptureWriter};

    #[test]
    fn observe_tracks_types_and_presence() {
        let mut node = SchemaNode::default();
        node.observe(&json!({"a": 1, "s": "hello"}));
        node.observe(&json!({"a": 2.5, "arr": [1, "x"]}));

        let schema = node.to_json_schema();
        assert_eq!(schema["seenObjects"], 2);
        assert_eq!(schema["properties"]["a"]["type"], json!(["integer", "number"]));
        assert_eq!(schema["properties"]["a"]["presentCount"], 2);
        assert_eq!(schema["properties"]["s"]["presentCount"], 1);
        assert_eq!(schema["properties"]["s"]["maxLength"], 5);
        assert_eq!(
            schema["properties"]["arr"]["items"]["type"],
            json!(["integer", "string"])
        );
    }

    #[test]
    fn merge_unions_subtrees() {
        let mut a = SchemaNode::default();
        a.observe(&json!({"x": 1}));
        let mut b = SchemaNode::default();
        b.observe(&json!({"x": "long-string", "y": true}));

        a.merge(&b);
        let schema = a.to_json_schema();
        assert_eq!(schema["seenObjects"], 2);
        assert_eq!(schema["properties"]["x"]["type"], json!(["integer", "string"]));
        assert_eq!(schema["properties"]["x"]["maxLength"], 11);
        assert_eq!(schema["properties"]["y"]["type"], "boolean");
    }

    #[test]
    fn infer_over_file_respects_topic_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.mcap");
        let mut w = CaptureWriter::create(&path).unwrap();
        let a = w.add_schema("a_0", "a", "{}").unwrap();
        let b = w.add_schema("b_0", "b", "{}").unwrap();
        w.write_message(&CaptureMessage {
            channel_id: a,
            sequence: 0,
            log_time: 1,
            publish_time: 1,
            data: b"{\"v\":1}",
        })
        .unwrap();
        w.write_message(&CaptureMessage {
            channel_id: b,
            sequence: 0,
            log_time: 2,
            publish_time: 2,
            data: b"{\"other\":true}",
        })
        .unwrap();
        let path = w.close().unwrap();

        let schema = infer_schema(&path, Some("a")).unwrap();
        assert!(schema["properties"].get("v").is_some());
        assert!(schema["properties"].get("other").is_none());
    }
}
