//! Wire message taxonomy.
//!
//! Every payload on the bus is JSON text. Command discriminators are small
//! integers on the wire; they deserialize into the enums below via
//! `From<u8>` so unknown values degrade to `Unspecified` instead of failing
//! the whole frame.

use serde::{Deserialize, Serialize};

// =========================================================================
// Status
// =========================================================================

/// Carried by every reply. `error == true` means `message` holds a
/// human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Status {
    pub error: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn err(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: true,
            title: title.into(),
            message: message.into(),
        }
    }
}

// =========================================================================
// Module registry
// =========================================================================

/// Module identity as known to the controller.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModuleIdentity {
    pub name: String,
    #[serde(rename = "type")]
    pub module_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ModuleRegistryCmd {
    Unspecified,
    Register,
    Remove,
    List,
}

impl From<u8> for ModuleRegistryCmd {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Register,
            2 => Self::Remove,
            3 => Self::List,
            _ => Self::Unspecified,
        }
    }
}

impl From<ModuleRegistryCmd> for u8 {
    fn from(v: ModuleRegistryCmd) -> u8 {
        match v {
            ModuleRegistryCmd::Unspecified => 0,
            ModuleRegistryCmd::Register => 1,
            ModuleRegistryCmd::Remove => 2,
            ModuleRegistryCmd::List => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRegistryQuery {
    pub cmd: ModuleRegistryCmd,
    pub module: ModuleIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModuleRegistryReply {
    pub status: Status,
}

// =========================================================================
// Start/stop
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum StartStopCmd {
    Unspecified,
    Start,
    Stop,
}

impl From<u8> for StartStopCmd {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Start,
            2 => Self::Stop,
            _ => Self::Unspecified,
        }
    }
}

impl From<StartStopCmd> for u8 {
    fn from(v: StartStopCmd) -> u8 {
        match v {
            StartStopCmd::Unspecified => 0,
            StartStopCmd::Start => 1,
            StartStopCmd::Stop => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartStop {
    pub cmd: StartStopCmd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartStopReply {
    pub status: Status,
}

// =========================================================================
// Per-module data configuration (live/capture policy)
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleDataConfig {
    pub enable_capturing: bool,
    pub enable_live_all_samples: bool,
    pub enable_live_fixed_rate: bool,
    pub live_rate_hz: f32,
}

impl Default for ModuleDataConfig {
    fn default() -> Self {
        Self {
            enable_capturing: true,
            enable_live_all_samples: false,
            enable_live_fixed_rate: false,
            live_rate_hz: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ModuleDataConfigCmd {
    Unspecified,
    Set,
    Get,
}

impl From<u8> for ModuleDataConfigCmd {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Set,
            2 => Self::Get,
            _ => Self::Unspecified,
        }
    }
}

impl From<ModuleDataConfigCmd> for u8 {
    fn from(v: ModuleDataConfigCmd) -> u8 {
        match v {
            ModuleDataConfigCmd::Unspecified => 0,
            ModuleDataConfigCmd::Set => 1,
            ModuleDataConfigCmd::Get => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDataConfigQuery {
    pub cmd: ModuleDataConfigCmd,
    #[serde(default)]
    pub module_data_config: ModuleDataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDataConfigReply {
    pub status: Status,
    pub module_data_config: ModuleDataConfig,
}

// =========================================================================
// Module configuration
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ModuleConfigCmd {
    Unspecified,
    Set,
    Get,
    GetDefault,
}

impl From<u8> for ModuleConfigCmd {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Set,
            2 => Self::Get,
            3 => Self::GetDefault,
            _ => Self::Unspecified,
        }
    }
}

impl From<ModuleConfigCmd> for u8 {
    fn from(v: ModuleConfigCmd) -> u8 {
        match v {
            ModuleConfigCmd::Unspecified => 0,
            ModuleConfigCmd::Set => 1,
            ModuleConfigCmd::Get => 2,
            ModuleConfigCmd::GetDefault => 3,
        }
    }
}

/// `cfg_json` is JSON text transported as a string field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfigQuery {
    pub cmd: ModuleConfigCmd,
    #[serde(default)]
    pub cfg_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfigReply {
    pub status: Status,
    #[serde(default)]
    pub cfg_json: String,
}

// =========================================================================
// Config events (UI buttons)
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ConfigEventCmd {
    Unspecified,
    Button,
}

impl From<u8> for ConfigEventCmd {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Button,
            _ => Self::Unspecified,
        }
    }
}

impl From<ConfigEventCmd> for u8 {
    fn from(v: ConfigEventCmd) -> u8 {
        match v {
            ConfigEventCmd::Unspecified => 0,
            ConfigEventCmd::Button => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfigEvent {
    pub cmd: ConfigEventCmd,
    #[serde(default)]
    pub cfg_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfigEventReply {
    pub status: Status,
}

// =========================================================================
// Measurements, documentation, schemas
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeasurementInfo {
    pub name: String,
    #[serde(default)]
    pub run_id: i32,
    #[serde(default)]
    pub run_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentationReply {
    pub html_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetSchemasReply {
    pub topic_names: Vec<String>,
}

// =========================================================================
// External deployments
// =========================================================================

/// Empty query body; the controller answers with the registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExternalDataBeamQuery {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExternalDataBeamReply {
    pub db_id_list: Vec<String>,
    pub hostname_list: Vec<String>,
}

// =========================================================================
// Jobs
// =========================================================================

/// On-wire form of a controller-tracked job. `data` is job-kind specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub done: bool,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitReply {
    pub id: i64,
}
