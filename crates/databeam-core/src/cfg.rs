//! Default-config factory.
//!
//! Modules describe their configuration as typed entries with optional UI
//! properties. The serialized form is the flat field map plus a
//! `config_properties` object the frontend uses for rendering:
//!
//! ```json
//! {
//!   "method": "average",
//!   "channels": ["channel"],
//!   "config_properties": {
//!     "method": { "display_type": "select", "options": ["average", "median"] },
//!     "channels": { "flags": ["resizeable"] }
//!   }
//! }
//! ```

use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    key: String,
    value: Value,
    label: Option<String>,
    select: Vec<String>,
    indent: Option<u32>,
    visible: Option<String>,
    flag_resizeable: bool,
    flag_button: bool,
    flag_hidden: bool,
}

impl ConfigEntry {
    fn new(key: &str, value: Value) -> Self {
        Self {
            key: key.to_string(),
            value,
            label: None,
            select: Vec::new(),
            indent: None,
            visible: None,
            flag_resizeable: false,
            flag_button: false,
            flag_hidden: false,
        }
    }

    pub fn label(&mut self, label: &str) -> &mut Self {
        self.label = Some(label.to_string());
        self
    }

    /// Render as a selection box restricted to `options`.
    pub fn select<S: Into<String>>(&mut self, options: impl IntoIterator<Item = S>) -> &mut Self {
        self.select = options.into_iter().map(Into::into).collect();
        self
    }

    /// Indentation level, clamped to 1..=50. Zero is ignored.
    pub fn indent(&mut self, indent: u32) -> &mut Self {
        if indent > 0 {
            self.indent = Some(indent.min(50));
        }
        self
    }

    pub fn visible_if(&mut self, key: &str, key_value: &str) -> &mut Self {
        self.visible = Some(format!("{key}={key_value}"));
        self
    }

    pub fn visible_if_bool(&mut self, key: &str, key_value: bool) -> &mut Self {
        self.visible = Some(format!("{key}={}", if key_value { "True" } else { "False" }));
        self
    }

    pub fn resizeable(&mut self) -> &mut Self {
        self.flag_resizeable = true;
        self
    }

    pub fn button(&mut self) -> &mut Self {
        self.flag_button = true;
        self
    }

    pub fn hidden(&mut self) -> &mut Self {
        self.flag_hidden = true;
        self
    }

    fn has_properties(&self) -> bool {
        self.label.is_some()
            || !self.select.is_empty()
            || self.indent.is_some()
            || self.visible.is_some()
            || self.flag_resizeable
            || self.flag_button
            || self.flag_hidden
    }

    fn properties(&self) -> Value {
        let mut props = Map::new();
        if let Some(label) = &self.label {
            props.insert("label".into(), json!(label));
        }
        if !self.select.is_empty() {
            props.insert("display_type".into(), json!("select"));
            props.insert("options".into(), json!(self.select));
        }
        if let Some(indent) = self.indent {
            props.insert("indent".into(), json!(indent));
        }
        if let Some(visible) = &self.visible {
            props.insert("visible".into(), json!(visible));
        }
        let mut flags: Vec<&str> = Vec::new();
        if self.flag_resizeable {
            flags.push("resizeable");
        }
        if self.flag_button {
            flags.push("button");
        }
        if self.flag_hidden {
            flags.push("hidden");
        }
        if !flags.is_empty() {
            props.insert("flags".into(), json!(flags));
        }
        Value::Object(props)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigFactory {
    entries: Vec<ConfigEntry>,
}

impl ConfigFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: &str, value: Value) -> &mut ConfigEntry {
        let idx = self.entries.len();
        self.entries.push(ConfigEntry::new(key, value));
        &mut self.entries[idx]
    }

    pub fn string(&mut self, key: &str, value: &str) -> &mut ConfigEntry {
        self.push(key, json!(value))
    }

    pub fn integer(&mut self, key: &str, value: i64) -> &mut ConfigEntry {
        self.push(key, json!(value))
    }

    pub fn number(&mut self, key: &str, value: f64) -> &mut ConfigEntry {
        self.push(key, json!(value))
    }

    pub fn boolean(&mut self, key: &str, value: bool) -> &mut ConfigEntry {
        self.push(key, json!(value))
    }

    pub fn string_array<S: Into<String>>(
        &mut self,
        key: &str,
        values: impl IntoIterator<Item = S>,
    ) -> &mut ConfigEntry {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        self.push(key, json!(values))
    }

    pub fn integer_array(&mut self, key: &str, values: Vec<i64>) -> &mut ConfigEntry {
        self.push(key, json!(values))
    }

    pub fn number_array(&mut self, key: &str, values: Vec<f64>) -> &mut ConfigEntry {
        self.push(key, json!(values))
    }

    pub fn boolean_array(&mut self, key: &str, values: Vec<bool>) -> &mut ConfigEntry {
        self.push(key, json!(values))
    }

    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        for entry in &self.entries {
            fields.insert(entry.key.clone(), entry.value.clone());
        }
        let mut properties = Map::new();
        for entry in &self.entries {
            if entry.has_properties() {
                properties.insert(entry.key.clone(), entry.properties());
            }
        }
        if !properties.is_empty() {
            fields.insert("config_properties".into(), Value::Object(properties));
        }
        Value::Object(fields)
    }

    pub fn to_json_str(&self) -> String {
        self.to_json().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_and_properties() {
        let mut cfg = ConfigFactory::new();
        cfg.string("input_module", "module/topic");
        cfg.string_array("channels", ["channel"]).resizeable();
        cfg.string("timebase", "samples").select(["samples", "time"]);
        cfg.number("timebase_value", 10.0);

        let v = cfg.to_json();
        assert_eq!(v["input_module"], "module/topic");
        assert_eq!(v["timebase_value"], 10.0);
        assert_eq!(v["config_properties"]["timebase"]["display_type"], "select");
        assert_eq!(
            v["config_properties"]["channels"]["flags"],
            json!(["resizeable"])
        );
        // no properties requested for input_module
        assert!(v["config_properties"].get("input_module").is_none());
    }

    #[test]
    fn button_and_hidden_set_their_own_flags() {
        let mut cfg = ConfigFactory::new();
        cfg.boolean("trigger", false).button();
        cfg.string("internal", "x").hidden();

        let v = cfg.to_json();
        assert_eq!(v["config_properties"]["trigger"]["flags"], json!(["button"]));
        assert_eq!(
            v["config_properties"]["internal"]["flags"],
            json!(["hidden"])
        );
    }

    #[test]
    fn indent_is_clamped() {
        let mut cfg = ConfigFactory::new();
        cfg.integer("a", 1).indent(120);
        cfg.integer("b", 2).indent(0);
        let v = cfg.to_json();
        assert_eq!(v["config_properties"]["a"]["indent"], 50);
        assert!(v["config_properties"].get("b").is_none());
    }

    #[test]
    fn visible_if_renders_condition() {
        let mut cfg = ConfigFactory::new();
        cfg.string("path", "/tmp").visible_if_bool("advanced", true);
        let v = cfg.to_json();
        assert_eq!(
            v["config_properties"]["path"]["visible"],
            "advanced=True"
        );
    }
}
