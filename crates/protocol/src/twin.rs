//! Twin document model.
//!
//! The twin pairs a `desired` section (operator intent) with a `reported`
//! section (device-observed state). Change specifications live under the
//! `changeSpec` property of both sections, keyed by change spec name.
//!
//! Action identity is positional: an action is addressed by its report part
//! name and its index in that part's array, never by its content.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    CHANGE_SPEC_PROPERTY, DEVICE_STATE_AFTER_RESTART_PROPERTY, DEVICE_STATE_PROPERTY,
    KNOWN_IDENTITIES_PROPERTY,
};

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceState {
    #[default]
    Uninitialized,
    Provisioning,
    Ready,
    Busy,
}

/// Execution status of a single action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusType {
    #[default]
    Idle,
    Pending,
    InProgress,
    Success,
    Failed,
}

impl StatusType {
    /// Returns `true` for `Success` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Full twin document as fetched from the cloud.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: TwinDesired,
    #[serde(default)]
    pub reported: TwinReported,
}

/// Desired section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinDesired {
    #[serde(rename = "changeSpec", default)]
    pub change_spec: BTreeMap<String, ChangeSpec>,
}

/// Reported section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinReported {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub change_spec: BTreeMap<String, ReportedChangeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_state: Option<DeviceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_state_after_service_restart: Option<DeviceState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_identities: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub custom: Value,
    /// Properties this agent does not interpret, kept so patches round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TwinReported {
    /// Merges a property patch into this section.
    ///
    /// Objects merge key by key, `null` removes a key, everything else
    /// (arrays included) replaces the previous value.
    pub fn apply_patch(&mut self, patch: &ReportedPatch) -> Result<(), serde_json::Error> {
        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, &patch.to_value());
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Desired change specifications
// ---------------------------------------------------------------------------

/// A versioned bundle of desired actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSpec {
    pub id: String,
    /// Report part name -> positional action array.
    #[serde(default)]
    pub patch: BTreeMap<String, Vec<TwinAction>>,
}

/// A desired action. The `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TwinAction {
    Download(DownloadAction),
    Upload(UploadAction),
    PeriodicUpload(PeriodicUploadAction),
    Execute(ExecuteAction),
    /// Any action type this agent does not know how to run.
    #[serde(other)]
    Unsupported,
}

impl TwinAction {
    /// Short name used in logs and result texts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Download(_) => "download",
            Self::Upload(_) => "upload",
            Self::PeriodicUpload(_) => "periodicUpload",
            Self::Execute(_) => "execute",
            Self::Unsupported => "unsupported",
        }
    }

    /// Returns `false` when the operator disabled the action.
    pub fn enabled(&self) -> bool {
        match self {
            Self::Download(a) => a.enabled,
            Self::Upload(a) => a.enabled,
            Self::PeriodicUpload(a) => a.enabled,
            Self::Execute(a) => a.enabled,
            Self::Unsupported => true,
        }
    }

    /// Operator-assigned action id (empty when not set).
    pub fn action_id(&self) -> &str {
        match self {
            Self::Download(a) => &a.action_id,
            Self::Upload(a) => &a.action_id,
            Self::PeriodicUpload(a) => &a.action_id,
            Self::Execute(a) => &a.action_id,
            Self::Unsupported => "",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Downloads a file pushed by the cloud in chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAction {
    #[serde(default)]
    pub action_id: String,
    /// Name of the file on the cloud side.
    pub file_name: String,
    /// Destination on the device; may start with a `${KEY}` root placeholder.
    #[serde(default)]
    pub dest_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub unzip: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// How an upload moves bytes to the cloud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadMethod {
    /// Whole-object PUT through a SAS URI.
    #[default]
    Blob,
    /// Client-driven chunks over the D2C message channel.
    Stream,
}

/// Uploads files matching a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAction {
    #[serde(default)]
    pub action_id: String,
    /// Source path; the last component may contain `*` and `?` wildcards.
    pub file_name: String,
    #[serde(default)]
    pub method: UploadMethod,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Repeats an upload on a fixed interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicUploadAction {
    #[serde(default)]
    pub action_id: String,
    pub file_name: String,
    #[serde(default)]
    pub method: UploadMethod,
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Runs a command on the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAction {
    #[serde(default)]
    pub action_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Reported change specifications
// ---------------------------------------------------------------------------

/// Mirror of a [`ChangeSpec`] holding per-action outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedChangeSpec {
    pub id: String,
    #[serde(default)]
    pub patch: BTreeMap<String, Vec<TwinActionReported>>,
}

impl ReportedChangeSpec {
    /// Creates an empty report for change spec `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            patch: BTreeMap::new(),
        }
    }

    /// Returns the report at `(part, index)` if one exists.
    pub fn report(&self, part: &str, index: usize) -> Option<&TwinActionReported> {
        self.patch.get(part).and_then(|reports| reports.get(index))
    }

    /// Returns the report at `(part, index)`, padding the part's array with
    /// empty reports as needed.
    pub fn entry_mut(&mut self, part: &str, index: usize) -> &mut TwinActionReported {
        let reports = self.patch.entry(part.to_string()).or_default();
        if reports.len() <= index {
            reports.resize_with(index + 1, TwinActionReported::default);
        }
        &mut reports[index]
    }

    /// Grows the part's array to at least `len` entries.
    pub fn pad_to(&mut self, part: &str, len: usize) {
        let reports = self.patch.entry(part.to_string()).or_default();
        if reports.len() < len {
            reports.resize_with(len, TwinActionReported::default);
        }
    }
}

/// Outcome of one desired action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinActionReported {
    #[serde(default)]
    pub status: StatusType,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_text: String,
    #[serde(rename = "checkSum", default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub periodic_reported: BTreeMap<String, TwinActionReported>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl TwinActionReported {
    /// Sets status and progress and stamps the update time.
    pub fn set_status(&mut self, status: StatusType, progress: u8) {
        self.status = status;
        self.progress = progress.min(100);
        self.last_updated = Some(Utc::now());
    }

    /// Marks the action as running at `progress` percent.
    pub fn in_progress(&mut self, progress: u8) {
        self.set_status(StatusType::InProgress, progress);
    }

    /// Marks the action as completed.
    pub fn succeed(&mut self, text: impl Into<String>) {
        self.set_status(StatusType::Success, 100);
        self.result_code = 0;
        self.result_text = text.into();
    }

    /// Marks the action as failed with a result code and text.
    pub fn fail(&mut self, code: i32, text: impl Into<String>) {
        let progress = self.progress;
        self.set_status(StatusType::Failed, progress);
        self.result_code = code;
        self.result_text = text.into();
    }
}

// ---------------------------------------------------------------------------
// Property patches
// ---------------------------------------------------------------------------

/// A partial update of the reported section keyed by top-level property name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportedPatch(Map<String, Value>);

impl ReportedPatch {
    /// Patch replacing one named change spec.
    pub fn change_spec(name: &str, spec: &ReportedChangeSpec) -> Result<Self, serde_json::Error> {
        let mut specs = Map::new();
        specs.insert(name.to_string(), serde_json::to_value(spec)?);
        Ok(Self::single(CHANGE_SPEC_PROPERTY, Value::Object(specs)))
    }

    /// Patch setting the mirrored device state.
    pub fn device_state(state: DeviceState) -> Self {
        Self::single(DEVICE_STATE_PROPERTY, state_value(state))
    }

    /// Patch setting (or clearing, with `None`) the restart marker.
    pub fn state_after_restart(state: Option<DeviceState>) -> Self {
        let value = state.map(state_value).unwrap_or(Value::Null);
        Self::single(DEVICE_STATE_AFTER_RESTART_PROPERTY, value)
    }

    /// Patch replacing the known identity list.
    pub fn known_identities(ids: &[String]) -> Self {
        let list = ids.iter().cloned().map(Value::String).collect();
        Self::single(KNOWN_IDENTITIES_PROPERTY, Value::Array(list))
    }

    fn single(name: &str, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(name.to_string(), value);
        Self(map)
    }

    /// Top-level property names touched by this patch.
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns the patch as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

fn state_value(state: DeviceState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

/// JSON merge: objects merge recursively, `null` deletes, other values replace.
pub fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_json(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
