use crate::domain::param::{ParamValue, ValidationError};
use crate::domain::tally::TallyState;
use crate::paramspec::{self, Decode, GroupSpec, ParamSpec, SetDescriptor};
use crate::session::{ApiCommand, CommandSink};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_SIZE: usize = 64;

/// Change notifications observed by UI, MIDI and tally collaborators.
/// One event per parameter; a multi-parameter emits a single event for the
/// composite even when several of its wire fields changed in the same poll.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    Changed { group: &'static str, param: &'static str, value: ParamValue },
    ParamError { group: &'static str, param: &'static str, reason: String },
    /// Connection lost; values are retained but no longer live.
    Stale,
}

/// State of one parameter: the mirrored value plus edit arbitration.
#[derive(Debug)]
pub struct Parameter {
    spec: &'static ParamSpec,
    current: Option<ParamValue>,
    last_remote: Option<ParamValue>,
    pending: Option<ParamValue>,
    dirty: bool,
    error: Option<String>,
    updated_at: Option<Instant>,
}

impl Parameter {
    fn new(spec: &'static ParamSpec) -> Self {
        Parameter {
            spec,
            current: None,
            last_remote: None,
            pending: None,
            dirty: false,
            error: None,
            updated_at: None,
        }
    }

    /// Apply a remote-driven value. Writes `last_remote`; writes through to
    /// `current` only when no local edit is pending, so an in-flight user
    /// write is never clobbered by a poll racing it.
    fn remote_update(&mut self, value: ParamValue) -> bool {
        self.updated_at = Some(Instant::now());
        self.last_remote = Some(value.clone());
        if self.dirty {
            return false;
        }
        if self.current.as_ref() == Some(&value) {
            return false;
        }
        self.current = Some(value);
        true
    }

    /// Apply a local write: remember the user's intent and flag dirty until
    /// the session resolves the command.
    fn local_set(&mut self, value: ParamValue) -> bool {
        self.updated_at = Some(Instant::now());
        self.pending = Some(value.clone());
        self.dirty = true;
        self.error = None;
        if self.current.as_ref() == Some(&value) {
            return false;
        }
        self.current = Some(value);
        true
    }

    fn resolve_write(&mut self) {
        self.dirty = false;
        self.pending = None;
        self.error = None;
    }

    /// The write did not stick: fall back to what the camera last reported.
    fn fail_write(&mut self, reason: &str) -> bool {
        self.dirty = false;
        self.pending = None;
        self.error = Some(reason.to_string());
        if self.last_remote == self.current {
            return false;
        }
        self.current = self.last_remote.clone();
        true
    }

    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            current: self.current.clone(),
            last_remote: self.last_remote.clone(),
            pending: self.pending.clone(),
            dirty: self.dirty,
            error: self.error.clone(),
        }
    }
}

/// Read-only view of a parameter's arbitration state.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSnapshot {
    pub current: Option<ParamValue>,
    pub last_remote: Option<ParamValue>,
    pub pending: Option<ParamValue>,
    pub dirty: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
struct GroupState {
    spec: &'static GroupSpec,
    params: BTreeMap<&'static str, Parameter>,
}

impl GroupState {
    fn new(spec: &'static GroupSpec) -> Self {
        let params = spec.params.iter().map(|p| (p.name, Parameter::new(p))).collect();
        GroupState { spec, params }
    }
}

/// In-memory mirror of one camera. Created alongside the device session and
/// retained across reconnects so observers keep a stable reference.
#[derive(Debug)]
pub struct DeviceModel {
    id: String,
    device_index: u32,
    model_name: Option<String>,
    serial_number: Option<String>,
    api_version: Option<String>,
    resolution: Option<String>,
    groups: BTreeMap<&'static str, GroupState>,
    changes: broadcast::Sender<ModelEvent>,
    commands: CommandSink,
    stale: bool,
}

impl DeviceModel {
    pub fn new(id: impl Into<String>, device_index: u32, commands: CommandSink) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        let groups = paramspec::REGISTRY.iter().copied().map(|g| (g.name, GroupState::new(g))).collect();
        DeviceModel {
            id: id.into(),
            device_index,
            model_name: None,
            serial_number: None,
            api_version: None,
            resolution: None,
            groups,
            changes,
            commands,
            stale: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn set_device_index(&mut self, index: u32) {
        self.device_index = index;
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    /// Subscribe to parameter changes. This is the single observation surface
    /// for all collaborators; individual values are read with [`value`](Self::value).
    pub fn observe(&self) -> broadcast::Receiver<ModelEvent> {
        self.changes.subscribe()
    }

    pub fn value(&self, group: &str, param: &str) -> Option<ParamValue> {
        self.groups.get(group)?.params.get(param)?.current.clone()
    }

    pub fn param(&self, group: &str, param: &str) -> Option<ParamSnapshot> {
        Some(self.groups.get(group)?.params.get(param)?.snapshot())
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Record the `GetSystemInfo` response taken at connect time.
    pub fn apply_system_info(&mut self, data: &Value) {
        self.model_name = data["Model"].as_str().map(str::to_string);
        self.serial_number = data["Serial"].as_str().map(str::to_string);
        self.api_version = data["ApiVersion"].as_str().map(str::to_string);
        self.resolution = data["Resolution"].as_str().map(str::to_string);
    }

    /// Route a poll (or command) response for the given group into the
    /// parameter mirror. Emits one change event per changed parameter and a
    /// single event per changed multi-parameter.
    pub fn apply_poll(&mut self, group_name: &str, data: &Value) {
        self.stale = false;
        let Some(group) = self.groups.get_mut(group_name) else {
            warn!(group = group_name, "⚠️ Poll response for unknown group");
            return;
        };

        let mut changed: BTreeSet<&'static str> = BTreeSet::new();
        let mut touched: BTreeSet<&'static str> = BTreeSet::new();
        for field in group.spec.fields {
            let Some(raw) = resolve_path(data, field.path) else {
                if !field.optional {
                    debug!(group = group_name, path = field.path, "⚠️ Missing field in poll response");
                }
                continue;
            };
            let Some(value) = decode_value(field.decode, raw) else {
                warn!(group = group_name, path = field.path, "⚠️ Could not decode field value {}", raw);
                continue;
            };
            touched.insert(field.param);
            let param = group.params.get_mut(field.param).expect("registry declares every poll field");
            if param.remote_update(value) {
                changed.insert(field.param);
            }
        }

        derive_group(group, &touched, &mut changed);
        self.emit_changes(group_name, &changed);
    }

    /// The shared `GetCamStatus` response carries every CamStatus group.
    pub fn apply_cam_status(&mut self, data: &Value) {
        let names: Vec<&'static str> = self
            .groups
            .values()
            .filter(|g| g.spec.poll == paramspec::PollSource::CamStatus)
            .map(|g| g.spec.name)
            .collect();
        for name in names {
            self.apply_poll(name, data);
        }
    }

    /// Local write from a UI surface or the tally router. Validates, applies
    /// the edit-arbitration path and enqueues the session command.
    pub async fn set_param(
        &mut self,
        group_name: &str,
        param_name: &str,
        value: ParamValue,
    ) -> Result<(), SetParamError> {
        let group = self
            .groups
            .get(group_name)
            .ok_or_else(|| SetParamError::UnknownParameter { path: format!("{}.{}", group_name, param_name) })?;
        let spec = group
            .spec
            .param(param_name)
            .ok_or_else(|| SetParamError::UnknownParameter { path: format!("{}.{}", group_name, param_name) })?;
        let set = spec.set.as_ref().ok_or(SetParamError::Validation(ValidationError::ReadOnly))?;

        if let Some((guard_param, guard_value)) = set.rejected_when {
            let guard = self.value(group_name, guard_param);
            if guard.as_ref().and_then(|v| v.as_text()) == Some(guard_value) {
                return Err(SetParamError::Validation(ValidationError::Rejected {
                    reason: format!("{} is {}", guard_param, guard_value),
                }));
            }
        }
        spec.value.validate(&value).map_err(SetParamError::Validation)?;

        let command = self.build_set_command(group_name, spec.name, &set.descriptor, &value)?;

        let group = self.groups.get_mut(group_name).expect("group looked up above");
        let param = group.params.get_mut(param_name).expect("param looked up above");
        let emit = param.local_set(value.clone());
        let mut changed: BTreeSet<&'static str> = BTreeSet::new();
        if emit {
            changed.insert(spec.name);
        }
        recompute_composites(group, &mut changed);
        self.emit_changes(group_name, &changed);

        self.commands.put(command).await;
        Ok(())
    }

    /// Tally write path used by the router. Applies program and preview
    /// together and sends a single `SetStudioTally` indication.
    pub async fn set_tally(&mut self, state: TallyState) {
        let group = self.groups.get_mut("tally").expect("tally group is compile-time");
        let mut changed: BTreeSet<&'static str> = BTreeSet::new();
        if group.params.get_mut("program").expect("registry").local_set(ParamValue::Bool(state.program)) {
            changed.insert("program");
        }
        if group.params.get_mut("preview").expect("registry").local_set(ParamValue::Bool(state.preview)) {
            changed.insert("preview");
        }
        self.emit_changes("tally", &changed);

        self.commands
            .put(ApiCommand {
                key: "tally.indication".to_string(),
                command: "SetStudioTally",
                params: Some(json!({ "Indication": state.indication() })),
                origin: Some(("tally", if state.program { "program" } else { "preview" })),
            })
            .await;
    }

    pub fn tally_state(&self) -> TallyState {
        TallyState {
            program: self.value("tally", "program").and_then(|v| v.as_bool()).unwrap_or(false),
            preview: self.value("tally", "preview").and_then(|v| v.as_bool()).unwrap_or(false),
        }
    }

    /// Called by the session when the command for the given origin completed;
    /// the response is routed separately as a poll.
    pub fn command_resolved(&mut self, origin: (&'static str, &'static str)) {
        if let Some(param) = self.groups.get_mut(origin.0).and_then(|g| g.params.get_mut(origin.1)) {
            param.resolve_write();
        }
        if origin.0 == "tally" {
            // A single indication resolves both tally booleans.
            let group = self.groups.get_mut("tally").expect("tally group is compile-time");
            for name in ["program", "preview"] {
                group.params.get_mut(name).expect("registry").resolve_write();
            }
        }
    }

    /// Called by the session after the retry budget is exhausted: revert to
    /// the last remote value and surface the error annotation.
    pub fn command_failed(&mut self, origin: (&'static str, &'static str), reason: &str) {
        let mut changed: BTreeSet<&'static str> = BTreeSet::new();
        if let Some(group) = self.groups.get_mut(origin.0) {
            if let Some(param) = group.params.get_mut(origin.1) {
                if param.fail_write(reason) {
                    changed.insert(param.spec.name);
                }
            }
            recompute_composites(group, &mut changed);
        }
        self.emit_changes(origin.0, &changed);
        let _ = self.changes.send(ModelEvent::ParamError {
            group: origin.0,
            param: origin.1,
            reason: reason.to_string(),
        });
    }

    /// On disconnect parameters keep their last-seen values but are flagged
    /// stale until the next successful poll.
    pub fn mark_stale(&mut self) {
        if !self.stale {
            self.stale = true;
            let _ = self.changes.send(ModelEvent::Stale);
        }
    }

    /// Preset slot whose stored position matches the live zoom position.
    pub fn active_zoom_preset(&self) -> Option<&'static str> {
        let zoom = self.value("lens", "zoom_pos")?.as_int()?;
        for (slot, param) in [("A", "preset_a"), ("B", "preset_b"), ("C", "preset_c")] {
            let stored = self.value("preset_zoom", param)?.as_int()?;
            if stored >= 0 && stored == zoom {
                return Some(slot);
            }
        }
        None
    }

    /// Move the live zoom to the position stored in the given preset slot.
    /// Slots holding the empty sentinel are left alone.
    pub async fn recall_zoom_preset(&mut self, slot: &str) -> Result<(), SetParamError> {
        let param = paramspec::zoom_preset_param(slot)
            .ok_or_else(|| SetParamError::UnknownParameter { path: format!("preset_zoom.{}", slot) })?;
        let stored = self.value("preset_zoom", param).and_then(|v| v.as_int());
        let Some(position) = stored.filter(|p| *p >= 0) else {
            return Ok(());
        };
        self.commands
            .put(ApiCommand {
                key: "preset_zoom.recall".to_string(),
                command: paramspec::ZOOM_RECALL_COMMAND,
                params: Some(json!({ "Position": position })),
                origin: None,
            })
            .await;
        Ok(())
    }

    fn emit_changes(&self, group: &str, changed: &BTreeSet<&'static str>) {
        let Some(state) = self.groups.get(group) else { return };
        for name in changed {
            if let Some(param) = state.params.get(name) {
                if let Some(value) = &param.current {
                    let _ = self.changes.send(ModelEvent::Changed {
                        group: state.spec.name,
                        param: name,
                        value: value.clone(),
                    });
                }
            }
        }
    }

    fn build_set_command(
        &self,
        group: &str,
        param: &'static str,
        descriptor: &SetDescriptor,
        value: &ParamValue,
    ) -> Result<ApiCommand, SetParamError> {
        let key = format!("{}.{}", group, param);
        let group_static = self.groups.get(group).expect("group looked up by caller").spec.name;
        let origin = Some((group_static, param));
        let command = match descriptor {
            SetDescriptor::WebButton { kind, on, off } => {
                let button = if value.as_bool().unwrap_or(true) { on } else { off };
                ApiCommand {
                    key,
                    command: "SetWebButtonEvent",
                    params: Some(json!({ "Kind": kind, "Button": button })),
                    origin,
                }
            }
            SetDescriptor::WebButtonChoice { kind } => {
                let button = value.as_text().ok_or(SetParamError::Validation(ValidationError::TypeMismatch))?;
                ApiCommand {
                    key,
                    command: "SetWebButtonEvent",
                    params: Some(json!({ "Kind": kind, "Button": button })),
                    origin,
                }
            }
            SetDescriptor::WebSlider { kind } => ApiCommand {
                key,
                command: "SetWebSliderEvent",
                params: Some(json!({ "Kind": kind, "Position": value.as_int() })),
                origin,
            },
            SetDescriptor::PaintXy => {
                let scale = |name: &str| self.value(group, name).and_then(|v| v.as_int()).unwrap_or(64);
                let normalized = |name: &'static str| {
                    if name == param {
                        value.as_int().unwrap_or(0)
                    } else {
                        self.value(group, name).and_then(|v| v.as_int()).unwrap_or(0)
                    }
                };
                let red = (normalized("red_normalized") + scale("red_scale") / 2).clamp(0, scale("red_scale"));
                let blue = (normalized("blue_normalized") + scale("blue_scale") / 2).clamp(0, scale("blue_scale"));
                ApiCommand {
                    key: "paint.wb".to_string(),
                    command: "SetWebXYFieldEvent",
                    params: Some(json!({ "Kind": "WhPaintRB", "XPosition": blue, "YPosition": red })),
                    origin,
                }
            }
            SetDescriptor::StudioTally => {
                let state = match (param, value.as_bool().unwrap_or(false)) {
                    ("program", on) => TallyState { program: on, ..self.tally_state() },
                    ("preview", on) => TallyState { preview: on, ..self.tally_state() },
                    _ => self.tally_state(),
                };
                ApiCommand {
                    key: "tally.indication".to_string(),
                    command: "SetStudioTally",
                    params: Some(json!({ "Indication": state.indication() })),
                    origin,
                }
            }
            SetDescriptor::NtpServer => {
                let address = value.as_text().ok_or(SetParamError::Validation(ValidationError::TypeMismatch))?;
                ApiCommand {
                    key,
                    command: "SetNTPServer",
                    params: Some(json!({ "Address": address })),
                    origin,
                }
            }
            SetDescriptor::ZoomPreset { id } => ApiCommand {
                key,
                command: "SetPresetZoomPosition",
                params: Some(json!({ "ID": id, "Position": value.as_int() })),
                origin,
            },
        };
        Ok(command)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SetParamError {
    #[error("unknown parameter '{path}'")]
    UnknownParameter { path: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = data;
    for key in path.split('.') {
        node = node.get(key)?;
    }
    Some(node)
}

fn decode_value(decode: Decode, raw: &Value) -> Option<ParamValue> {
    match decode {
        Decode::Int => match raw {
            Value::Number(n) => n.as_i64().map(ParamValue::Int),
            Value::String(s) => s.trim().parse::<i64>().ok().map(ParamValue::Int),
            _ => None,
        },
        Decode::Text => match raw {
            Value::String(s) => Some(ParamValue::text(s.trim())),
            Value::Number(n) => Some(ParamValue::text(n.to_string())),
            _ => None,
        },
        Decode::OnOffBool => raw.as_str().map(|s| ParamValue::Bool(s.contains("On"))),
        Decode::SignedInt => match raw {
            Value::Number(n) => n.as_i64().map(ParamValue::Int),
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    trimmed.trim_start_matches('+').parse::<i64>().ok().map(ParamValue::Int)
                }
            }
            _ => None,
        },
        Decode::GainDb => raw.as_str().and_then(|s| {
            s.trim().trim_start_matches('A').trim_end_matches("dB").parse::<i64>().ok().map(ParamValue::Int)
        }),
    }
}

/// Group-specific derivations applied after wire fields are routed. Derived
/// parameters follow the remote-update path so pending local writes on them
/// are preserved.
fn derive_group(group: &mut GroupState, touched: &BTreeSet<&'static str>, changed: &mut BTreeSet<&'static str>) {
    match group.spec.name {
        "tally" => {
            if touched.contains("tally_status") {
                let status = group.params["tally_status"].current.clone();
                let status = status.as_ref().and_then(|v| v.as_text()).unwrap_or("");
                let program = ParamValue::Bool(status == "Program");
                let preview = ParamValue::Bool(status == "Preview");
                if group.params.get_mut("program").expect("registry").remote_update(program) {
                    changed.insert("program");
                }
                if group.params.get_mut("preview").expect("registry").remote_update(preview) {
                    changed.insert("preview");
                }
            }
        }
        "paint" => {
            for (norm, pos, scale) in
                [("red_normalized", "red_pos", "red_scale"), ("blue_normalized", "blue_pos", "blue_scale")]
            {
                if !(touched.contains(pos) || touched.contains(scale)) {
                    continue;
                }
                let pos = group.params[pos].current.as_ref().and_then(|v| v.as_int());
                let scale = group.params[scale].current.as_ref().and_then(|v| v.as_int());
                if let (Some(pos), Some(scale)) = (pos, scale) {
                    let value = ParamValue::Int(pos - scale / 2);
                    if group.params.get_mut(norm).expect("registry").remote_update(value) {
                        changed.insert(norm);
                    }
                }
            }
        }
        "battery" => derive_battery(group, touched, changed),
        "ntp" => {
            if touched.contains("status") {
                let status = group.params["status"].current.clone();
                let status = status.as_ref().and_then(|v| v.as_text()).unwrap_or("");
                // "Syncronized" is the camera's own spelling.
                let synced = ParamValue::Bool(status == "Syncronized");
                let master = ParamValue::Bool(status == "Master");
                if group.params.get_mut("synchronized").expect("registry").remote_update(synced) {
                    changed.insert("synchronized");
                }
                if group.params.get_mut("sync_master").expect("registry").remote_update(master) {
                    changed.insert("sync_master");
                }
            }
        }
        "lens" => {
            // Cameras report focus modes outside the documented set; fold
            // them into Unknown rather than dropping the update.
            if touched.contains("focus_mode") {
                let known = matches!(
                    group.params["focus_mode"].current.as_ref().and_then(|v| v.as_text()),
                    Some("AFFace" | "AF" | "MFOnePush" | "MF" | "MFFace" | "Unknown")
                );
                if !known && group.params.get_mut("focus_mode").expect("registry").remote_update(ParamValue::text("Unknown"))
                {
                    changed.insert("focus_mode");
                }
            }
        }
        _ => {}
    }
    recompute_composites(group, changed);
}

/// Battery reports one of time/capacity/voltage through an `Info` selector
/// plus a raw `Value`; the level byte encodes the charging state.
fn derive_battery(group: &mut GroupState, touched: &BTreeSet<&'static str>, changed: &mut BTreeSet<&'static str>) {
    if touched.contains("level") {
        if let Some(level) = group.params["level"].current.as_ref().and_then(|v| v.as_int()) {
            let state = match level {
                0 => "NoBattery",
                2 => "Error",
                3..=9 => "OnBattery",
                10..=12 | 14 => "Charging",
                1 | 13 => "Charged",
                _ => "Unknown",
            };
            if group.params.get_mut("state").expect("registry").remote_update(ParamValue::text(state)) {
                changed.insert("state");
            }
        }
    }

    if touched.contains("info") || touched.contains("value") {
        let info = group.params["info"].current.clone();
        let info = info.as_ref().and_then(|v| v.as_text()).unwrap_or("");
        let raw = group.params["value"].current.clone();
        let raw = raw.as_ref().and_then(|v| v.as_text()).and_then(|s| s.trim().parse::<i64>().ok());
        let (minutes, percent, voltage) = match (info, raw) {
            ("Time", Some(v)) => (v, -1, -1),
            ("Capacity", Some(v)) => (-1, v, -1),
            ("Voltage", Some(v)) => (-1, -1, v),
            _ => (-1, -1, -1),
        };
        for (name, value) in [("minutes", minutes), ("percent", percent), ("voltage_x10", voltage)] {
            if group.params.get_mut(name).expect("registry").remote_update(ParamValue::Int(value)) {
                changed.insert(name);
            }
        }
    }
}

/// Rebuild composite values for multi-parameters whose components changed.
/// Each composite yields at most one change event per apply.
fn recompute_composites(group: &mut GroupState, changed: &mut BTreeSet<&'static str>) {
    let multis: Vec<&'static ParamSpec> = group.spec.params.iter().filter(|p| !p.components.is_empty()).collect();
    for multi in multis {
        if !multi.components.iter().any(|c| changed.contains(c)) {
            continue;
        }
        let mut parts = Vec::with_capacity(multi.components.len());
        let mut complete = true;
        for component in multi.components {
            match group.params.get(component).and_then(|p| p.current.clone()) {
                Some(value) => parts.push(value),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            continue;
        }
        if group.params.get_mut(multi.name).expect("registry").remote_update(ParamValue::Composite(parts)) {
            changed.insert(multi.name);
        }
    }
}
