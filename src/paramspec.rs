//! Declarative catalog of every camera parameter the engine mirrors.
//!
//! For each group this declares how to poll it (either a set of dotted field
//! paths into the shared `GetCamStatus` response, or a dedicated api command)
//! and, per parameter, how to apply a user change (api command plus parameter
//! template). The registry is read-only at runtime; the device model and the
//! sessions consume it, and UI collaborators read it instead of redeclaring
//! parameter metadata.

use crate::domain::param::ValueSpec;

/// Where a group's values come from on each poll cycle.
#[derive(Debug, PartialEq)]
pub enum PollSource {
    /// Resolved against the shared `GetCamStatus` response issued every poll.
    CamStatus,
    /// Dedicated api command, issued on full polls only. Subject to
    /// capability probing: a failure on the first attempt disables the group
    /// for the session lifetime.
    Command(&'static str),
}

/// How a raw wire field is turned into a parameter value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decode {
    /// JSON number or numeric string to integer.
    Int,
    /// String taken as-is (leading/trailing spaces stripped).
    Text,
    /// `"On"`/`"Off"` (or a string containing `"On"`) to bool.
    OnOffBool,
    /// Signed numeric string such as `"-12"` or `" +3"`.
    SignedInt,
    /// Gain display value such as `"12dB"` or `"A18dB"` to integer dB.
    GainDb,
}

/// One field mapping within a group's poll response.
#[derive(Debug)]
pub struct PollField {
    pub param: &'static str,
    /// Dotted path into the response `Data` object, e.g. `Iris.Position`.
    pub path: &'static str,
    pub decode: Decode,
    /// Missing paths are tolerated for optional fields (older camera models
    /// omit them); required fields missing count as a protocol error.
    pub optional: bool,
}

/// The api request template used to apply a user change.
#[derive(Debug, PartialEq)]
pub enum SetDescriptor {
    /// `SetWebButtonEvent {Kind, Button}` where the button is chosen from the
    /// bool value (`on` / `off` variant).
    WebButton { kind: &'static str, on: &'static str, off: &'static str },
    /// `SetWebButtonEvent {Kind, Button}` with the choice value passed
    /// through as the button name.
    WebButtonChoice { kind: &'static str },
    /// `SetWebSliderEvent {Kind, Position}`.
    WebSlider { kind: &'static str },
    /// `SetWebXYFieldEvent {Kind: WhPaintRB, XPosition: blue, YPosition: red}`
    /// carrying both paint channels raw (0..=scale).
    PaintXy,
    /// `SetStudioTally {Indication}` with Off / Program / Preview.
    StudioTally,
    /// `SetNTPServer {Address}`.
    NtpServer,
    /// `SetPresetZoomPosition {ID, Position}` for the named preset slot.
    ZoomPreset { id: &'static str },
}

/// Set descriptor plus the local rejection rule, if any.
#[derive(Debug)]
pub struct SetSpec {
    pub descriptor: SetDescriptor,
    /// The write is refused locally (no HTTP traffic) while the named
    /// sibling parameter equals the given value.
    pub rejected_when: Option<(&'static str, &'static str)>,
}

#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub value: ValueSpec,
    pub set: Option<SetSpec>,
    /// Single-step increment/decrement buttons, where the api offers them:
    /// `SetWebButtonEvent {Kind, Button: up / down}`.
    pub adjust: Option<AdjustSpec>,
    /// Component parameter names when this is a multi-parameter whose
    /// composite value is derived from several wire fields. Empty otherwise.
    pub components: &'static [&'static str],
    /// True for values computed from other fields of the same group rather
    /// than read off the wire directly.
    pub derived: bool,
}

#[derive(Debug, PartialEq)]
pub struct AdjustSpec {
    pub kind: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

#[derive(Debug)]
pub struct GroupSpec {
    pub name: &'static str,
    pub poll: PollSource,
    pub fields: &'static [PollField],
    pub params: &'static [ParamSpec],
}

impl GroupSpec {
    pub fn param(&self, name: &str) -> Option<&'static ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Continuous motion commands driven by a spring-centered control. Refreshed
/// at the motion heartbeat until released; release sends `Stop` at speed 0.
/// Wire form: `SeesawSwitchOperation {Kind, Direction, Speed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MotionKind {
    Zoom,
    Focus,
    MasterBlack,
}

impl MotionKind {
    pub fn seesaw_kind(self) -> &'static str {
        match self {
            MotionKind::Zoom => "ZoomSeesaw",
            MotionKind::Focus => "FocusSeesaw",
            MotionKind::MasterBlack => "MasterBlackSeesaw",
        }
    }

    /// Direction names for positive and negative speeds. Positive is
    /// tele / far / up.
    pub fn directions(self) -> (&'static str, &'static str) {
        match self {
            MotionKind::Zoom => ("Tele", "Wide"),
            MotionKind::Focus => ("Far", "Near"),
            MotionKind::MasterBlack => ("Up", "Down"),
        }
    }

    /// Queue key: repeated heartbeats for the same control coalesce.
    pub fn queue_key(self) -> &'static str {
        match self {
            MotionKind::Zoom => "motion.zoom",
            MotionKind::Focus => "motion.focus",
            MotionKind::MasterBlack => "motion.master_black",
        }
    }
}

const fn plain(name: &'static str, value: ValueSpec) -> ParamSpec {
    ParamSpec { name, value, set: None, adjust: None, components: &[], derived: false }
}

const fn free_text(name: &'static str) -> ParamSpec {
    plain(name, ValueSpec::Choice { choices: &[] })
}

pub static CAMERA: GroupSpec = GroupSpec {
    name: "camera",
    poll: PollSource::CamStatus,
    fields: &[
        PollField { param: "status", path: "Camera.Status", decode: Decode::Text, optional: false },
        PollField { param: "mode", path: "Camera.Mode", decode: Decode::Text, optional: false },
        PollField { param: "timecode", path: "Camera.TC", decode: Decode::Text, optional: false },
        PollField { param: "menu_status", path: "Camera.MenuStatus", decode: Decode::OnOffBool, optional: false },
    ],
    params: &[
        plain("status", ValueSpec::Choice { choices: &["NoCard", "Stop", "Standby", "Rec", "RecPause"] }),
        plain("mode", ValueSpec::Choice { choices: &["Normal", "Pre", "Clip", "Frame", "Interval", "Variable"] }),
        free_text("timecode"),
        plain("menu_status", ValueSpec::Bool),
        // Remote menu navigation; the value is the button pressed.
        ParamSpec {
            name: "menu_button",
            value: ValueSpec::Choice {
                choices: &["Display", "Status", "Menu", "Cancel", "Set", "Up", "Down", "Left", "Right"],
            },
            set: Some(SetSpec {
                descriptor: SetDescriptor::WebButtonChoice { kind: "Menu" },
                rejected_when: None,
            }),
            adjust: None,
            components: &[],
            derived: false,
        },
    ],
};

pub static EXPOSURE: GroupSpec = GroupSpec {
    name: "exposure",
    poll: PollSource::CamStatus,
    fields: &[
        PollField { param: "mode", path: "Exposure.Status", decode: Decode::Text, optional: true },
        PollField { param: "iris_mode", path: "Iris.Status", decode: Decode::Text, optional: false },
        PollField { param: "iris_fstop", path: "Iris.Value", decode: Decode::Text, optional: false },
        PollField { param: "iris_pos", path: "Iris.Position", decode: Decode::Int, optional: false },
        PollField { param: "gain_mode", path: "Gain.Status", decode: Decode::Text, optional: false },
        PollField { param: "gain_pos", path: "Gain.Value", decode: Decode::GainDb, optional: false },
        PollField { param: "shutter_mode", path: "Shutter.Status", decode: Decode::Text, optional: false },
        PollField { param: "shutter_value", path: "Shutter.Value", decode: Decode::Text, optional: false },
        PollField { param: "master_black_pos", path: "MasterBlack.Value", decode: Decode::SignedInt, optional: false },
    ],
    params: &[
        plain("mode", ValueSpec::Choice { choices: &["Auto", "Manual", "IrisPriority", "ShutterPriority"] }),
        plain("iris_mode", ValueSpec::Choice { choices: &["Manual", "Auto", "AutoAELock"] }),
        free_text("iris_fstop"),
        ParamSpec {
            name: "iris_pos",
            value: ValueSpec::Int { min: 0, max: 255, step: Some(1) },
            set: Some(SetSpec {
                descriptor: SetDescriptor::WebSlider { kind: "IrisBar" },
                rejected_when: Some(("iris_mode", "Auto")),
            }),
            adjust: Some(AdjustSpec { kind: "Iris", up: "Open1", down: "Close1" }),
            components: &[],
            derived: false,
        },
        plain(
            "gain_mode",
            ValueSpec::Choice { choices: &["ManualL", "ManualM", "ManualH", "AGC", "AlcAELock", "LoLux", "Variable"] },
        ),
        ParamSpec {
            name: "gain_pos",
            value: ValueSpec::Int { min: -6, max: 24, step: Some(1) },
            set: None,
            adjust: Some(AdjustSpec { kind: "Gain", up: "Up1", down: "Down1" }),
            components: &[],
            derived: false,
        },
        plain("shutter_mode", ValueSpec::Choice { choices: &["Off", "Manual", "Step", "Variable", "Eei"] }),
        free_text("shutter_value"),
        ParamSpec {
            name: "master_black_pos",
            value: ValueSpec::Int { min: -50, max: 50, step: Some(1) },
            set: None,
            adjust: Some(AdjustSpec { kind: "MasterBlack", up: "Up1", down: "Down1" }),
            components: &[],
            derived: false,
        },
        // Iris as the surfaces see it: position, f-stop label and mode move
        // together in one poll response.
        ParamSpec {
            name: "iris",
            value: ValueSpec::Composite,
            set: None,
            adjust: None,
            components: &["iris_pos", "iris_fstop", "iris_mode"],
            derived: true,
        },
    ],
};

pub static PAINT: GroupSpec = GroupSpec {
    name: "paint",
    poll: PollSource::CamStatus,
    fields: &[
        PollField { param: "white_balance_mode", path: "Whb.Status", decode: Decode::Text, optional: false },
        PollField { param: "color_temp", path: "Whb.Value", decode: Decode::Text, optional: false },
        PollField { param: "red_scale", path: "Whb.WhPRScale", decode: Decode::Int, optional: false },
        PollField { param: "red_pos", path: "Whb.WhPRPosition", decode: Decode::Int, optional: false },
        PollField { param: "red_value", path: "Whb.WhPRValue", decode: Decode::SignedInt, optional: false },
        PollField { param: "blue_scale", path: "Whb.WhPBScale", decode: Decode::Int, optional: false },
        PollField { param: "blue_pos", path: "Whb.WhPBPosition", decode: Decode::Int, optional: false },
        PollField { param: "blue_value", path: "Whb.WhPBValue", decode: Decode::SignedInt, optional: false },
        PollField { param: "detail_pos", path: "Detail.Value", decode: Decode::SignedInt, optional: false },
    ],
    params: &[
        ParamSpec {
            name: "white_balance_mode",
            value: ValueSpec::Choice {
                choices: &["Preset", "A", "B", "Faw", "FawAELock", "Awb", "OnePush", "3200K", "5600K", "Manual"],
            },
            set: Some(SetSpec {
                descriptor: SetDescriptor::WebButtonChoice { kind: "Whb" },
                rejected_when: None,
            }),
            adjust: None,
            components: &[],
            derived: false,
        },
        free_text("color_temp"),
        plain("red_scale", ValueSpec::Int { min: 0, max: 64, step: None }),
        plain("red_pos", ValueSpec::Int { min: 0, max: 64, step: Some(1) }),
        plain("red_value", ValueSpec::Int { min: -32, max: 32, step: None }),
        plain("blue_scale", ValueSpec::Int { min: 0, max: 64, step: None }),
        plain("blue_pos", ValueSpec::Int { min: 0, max: 64, step: Some(1) }),
        plain("blue_value", ValueSpec::Int { min: -32, max: 32, step: None }),
        // Normalized paint positions (raw minus half the scale). Writes carry
        // both channels raw through SetWebXYFieldEvent.
        ParamSpec {
            name: "red_normalized",
            value: ValueSpec::Int { min: -32, max: 32, step: Some(1) },
            set: Some(SetSpec { descriptor: SetDescriptor::PaintXy, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: true,
        },
        ParamSpec {
            name: "blue_normalized",
            value: ValueSpec::Int { min: -32, max: 32, step: Some(1) },
            set: Some(SetSpec { descriptor: SetDescriptor::PaintXy, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: true,
        },
        ParamSpec {
            name: "detail_pos",
            value: ValueSpec::Int { min: -10, max: 10, step: Some(1) },
            set: None,
            adjust: Some(AdjustSpec { kind: "Detail", up: "Up", down: "Down" }),
            components: &[],
            derived: false,
        },
        ParamSpec {
            name: "wb_paint",
            value: ValueSpec::Composite,
            set: None,
            adjust: None,
            components: &["red_normalized", "blue_normalized"],
            derived: true,
        },
    ],
};

pub static TALLY: GroupSpec = GroupSpec {
    name: "tally",
    poll: PollSource::CamStatus,
    fields: &[
        PollField { param: "tally_priority", path: "TallyLamp.Priority", decode: Decode::Text, optional: false },
        PollField { param: "tally_status", path: "TallyLamp.StudioTally", decode: Decode::Text, optional: false },
    ],
    params: &[
        plain("tally_priority", ValueSpec::Choice { choices: &["Camera", "Web"] }),
        plain("tally_status", ValueSpec::Choice { choices: &["Off", "Program", "Preview"] }),
        ParamSpec {
            name: "program",
            value: ValueSpec::Bool,
            set: Some(SetSpec { descriptor: SetDescriptor::StudioTally, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: true,
        },
        ParamSpec {
            name: "preview",
            value: ValueSpec::Bool,
            set: Some(SetSpec { descriptor: SetDescriptor::StudioTally, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: true,
        },
    ],
};

pub static NTP: GroupSpec = GroupSpec {
    name: "ntp",
    poll: PollSource::Command("GetNTPStatus"),
    fields: &[
        PollField { param: "address", path: "Address", decode: Decode::Text, optional: false },
        PollField { param: "tc_sync", path: "TcSync", decode: Decode::OnOffBool, optional: true },
        PollField { param: "status", path: "Status", decode: Decode::Text, optional: false },
    ],
    params: &[
        ParamSpec {
            name: "address",
            value: ValueSpec::Choice { choices: &[] },
            set: Some(SetSpec { descriptor: SetDescriptor::NtpServer, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: false,
        },
        plain("tc_sync", ValueSpec::Bool),
        free_text("status"),
        plain("synchronized", ValueSpec::Bool),
        plain("sync_master", ValueSpec::Bool),
    ],
};

pub static BATTERY: GroupSpec = GroupSpec {
    name: "battery",
    poll: PollSource::CamStatus,
    fields: &[
        PollField { param: "info", path: "Battery.Info", decode: Decode::Text, optional: false },
        PollField { param: "level", path: "Battery.Level", decode: Decode::Int, optional: false },
        PollField { param: "value", path: "Battery.Value", decode: Decode::Text, optional: false },
    ],
    params: &[
        plain("info", ValueSpec::Choice { choices: &["Time", "Capacity", "Voltage"] }),
        plain("level", ValueSpec::Int { min: 0, max: 14, step: None }),
        free_text("value"),
        plain(
            "state",
            ValueSpec::Choice { choices: &["Unknown", "Error", "NoBattery", "OnBattery", "Charging", "Charged"] },
        ),
        // Minutes remaining, capacity percent, voltage in tenths of a volt.
        // -1 where the camera reports a different info kind.
        plain("minutes", ValueSpec::Int { min: -1, max: i64::MAX, step: None }),
        plain("percent", ValueSpec::Int { min: -1, max: 100, step: None }),
        plain("voltage_x10", ValueSpec::Int { min: -1, max: i64::MAX, step: None }),
        ParamSpec {
            name: "charge",
            value: ValueSpec::Composite,
            set: None,
            adjust: None,
            components: &["state", "minutes", "percent", "voltage_x10"],
            derived: true,
        },
    ],
};

pub static LENS: GroupSpec = GroupSpec {
    name: "lens",
    poll: PollSource::CamStatus,
    fields: &[
        PollField { param: "focus_mode", path: "Focus.Status", decode: Decode::Text, optional: false },
        PollField { param: "focus_value", path: "Focus.Value", decode: Decode::Text, optional: false },
        PollField { param: "zoom_pos", path: "Zoom.Position", decode: Decode::Int, optional: false },
        PollField { param: "zoom_value", path: "Zoom.DisplayValue", decode: Decode::Text, optional: false },
    ],
    params: &[
        ParamSpec {
            name: "focus_mode",
            value: ValueSpec::Choice { choices: &["Unknown", "AFFace", "AF", "MFOnePush", "MF", "MFFace"] },
            set: Some(SetSpec {
                // Auto / Manual per the target mode family.
                descriptor: SetDescriptor::WebButtonChoice { kind: "Focus" },
                rejected_when: None,
            }),
            adjust: None,
            components: &[],
            derived: false,
        },
        free_text("focus_value"),
        ParamSpec {
            name: "zoom_pos",
            value: ValueSpec::Int { min: 0, max: 499, step: Some(1) },
            set: Some(SetSpec {
                descriptor: SetDescriptor::WebSlider { kind: "ZoomBar" },
                rejected_when: None,
            }),
            adjust: None,
            components: &[],
            derived: false,
        },
        free_text("zoom_value"),
        ParamSpec {
            name: "focus_push_auto",
            value: ValueSpec::Bool,
            set: Some(SetSpec {
                descriptor: SetDescriptor::WebButton { kind: "Focus", on: "PushAuto", off: "PushAuto" },
                rejected_when: None,
            }),
            adjust: None,
            components: &[],
            derived: false,
        },
    ],
};

pub static PRESET_ZOOM: GroupSpec = GroupSpec {
    name: "preset_zoom",
    poll: PollSource::Command("GetPresetZoomPosition"),
    fields: &[
        PollField { param: "preset_a", path: "A", decode: Decode::Int, optional: false },
        PollField { param: "preset_b", path: "B", decode: Decode::Int, optional: false },
        PollField { param: "preset_c", path: "C", decode: Decode::Int, optional: false },
    ],
    params: &[
        // -1 marks an empty slot.
        ParamSpec {
            name: "preset_a",
            value: ValueSpec::Int { min: -1, max: 499, step: None },
            set: Some(SetSpec { descriptor: SetDescriptor::ZoomPreset { id: "A" }, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: false,
        },
        ParamSpec {
            name: "preset_b",
            value: ValueSpec::Int { min: -1, max: 499, step: None },
            set: Some(SetSpec { descriptor: SetDescriptor::ZoomPreset { id: "B" }, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: false,
        },
        ParamSpec {
            name: "preset_c",
            value: ValueSpec::Int { min: -1, max: 499, step: None },
            set: Some(SetSpec { descriptor: SetDescriptor::ZoomPreset { id: "C" }, rejected_when: None }),
            adjust: None,
            components: &[],
            derived: false,
        },
    ],
};

/// Recalling a stored preset moves the live zoom there:
/// `SetZoomCtrl {Position}` with the slot's stored position. Slots holding
/// the empty sentinel (-1) are never recalled.
pub const ZOOM_RECALL_COMMAND: &str = "SetZoomCtrl";

/// Parameter backing a preset slot name.
pub fn zoom_preset_param(slot: &str) -> Option<&'static str> {
    match slot {
        "A" => Some("preset_a"),
        "B" => Some("preset_b"),
        "C" => Some("preset_c"),
        _ => None,
    }
}

pub static REGISTRY: &[&GroupSpec] = &[&CAMERA, &EXPOSURE, &PAINT, &TALLY, &NTP, &BATTERY, &LENS, &PRESET_ZOOM];

pub fn group(name: &str) -> Option<&'static GroupSpec> {
    REGISTRY.iter().find(|g| g.name == name).copied()
}
