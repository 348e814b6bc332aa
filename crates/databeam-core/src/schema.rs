//! Data schemas: one per capture-log channel.
//!
//! A schema names a topic and a flat set of typed properties. The
//! serialized form is a JSON-Schema object so offline tools can interpret
//! the captured rows.

use serde_json::{json, Map, Value};

/// Replace anything outside `[a-zA-Z0-9_-]` so property names stay valid
/// channel names in the capture log.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct DataSchema {
    topic: String,
    dtype_name: String,
    properties: Map<String, Value>,
}

impl DataSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = topic.into();
    }

    pub fn set_dtype_name(&mut self, dtype_name: impl Into<String>) {
        self.dtype_name = dtype_name.into();
    }

    /// Add a property with a plain JSON-Schema type like `"number"`.
    pub fn add_property(&mut self, name: &str, prop_type: &str) {
        self.properties
            .insert(sanitize_name(name), json!({ "type": prop_type }));
    }

    /// Add a property described by an arbitrary JSON-Schema fragment.
    pub fn add_property_extended(&mut self, name: &str, prop: Value) {
        self.properties.insert(sanitize_name(name), prop);
    }

    /// Topic this schema publishes and captures under; empty means "use the
    /// module name" (resolved at registration time).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Schema type name; empty means `<module_type>_<index>` (resolved at
    /// registration time).
    pub fn dtype_name(&self) -> &str {
        &self.dtype_name
    }

    pub fn schema_string(&self) -> String {
        json!({
            "type": "object",
            "properties": Value::Object(self.properties.clone()),
        })
        .to_string()
    }
}
