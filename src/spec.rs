//! Parameter spec registry.
//!
//! A compile-time catalog of every camera parameter the engine mirrors:
//! for each group the poll command and for each parameter the wire field,
//! the value type with its range or enumeration, and how a user change is
//! encoded on the wire. Given a parameter name this registry answers both
//! "how do I fetch it" and "how do I set it" without consulting other code.
//!
//! All camera requests go through the JSON API endpoint: a poll is
//! `GET {API_BASE}?Command=<poll_command>` and yields the group's fields
//! under `Data`, a set is `GET {API_BASE}?Command=<filled template>`.
//! Set templates use `{value}` for absolute writes, `{kind}`/`{step}` for
//! paired step buttons and `{kind}`/`{speed}` for continuous motion.

use serde::Serialize;
use std::fmt;

/// Path of the camera's JSON command endpoint.
pub const API_BASE: &str = "/cgi-bin/api.cgi";

/// Opaque still-image fetch path; the engine never decodes the payload.
pub const PREVIEW_PATH: &str = "/cgi-bin/preview.cgi?Size=640x360";

/// Highest speed accepted by continuous motion commands (zoom/focus/MB).
pub const MOTION_MAX_SPEED: i32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ParamGroup {
    Camera,
    Exposure,
    Paint,
    Tally,
    Ntp,
    Battery,
    Lens,
}

impl ParamGroup {
    pub fn all() -> &'static [ParamGroup] {
        &[
            ParamGroup::Camera,
            ParamGroup::Exposure,
            ParamGroup::Paint,
            ParamGroup::Tally,
            ParamGroup::Ntp,
            ParamGroup::Battery,
            ParamGroup::Lens,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamGroup::Camera => "Camera",
            ParamGroup::Exposure => "Exposure",
            ParamGroup::Paint => "Paint",
            ParamGroup::Tally => "Tally",
            ParamGroup::Ntp => "NTP",
            ParamGroup::Battery => "Battery",
            ParamGroup::Lens => "Lens",
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value type and constraints of a parameter.
#[derive(Clone, Copy, Debug)]
pub enum ValueSpec {
    Bool,
    Int {
        min: i32,
        max: i32,
        step: Option<i32>,
    },
    Choice(&'static [&'static str]),
    /// Compound derived from several wire fields of the same group.
    /// Components are parsed by their raw JSON type.
    Multi(&'static [&'static str]),
}

/// Absolute set: `{value}` is replaced with the encoded new value.
#[derive(Clone, Copy, Debug)]
pub struct SetSpec {
    pub template: &'static str,
}

/// Relative set via paired step buttons: `{kind}` becomes `inc` or `dec`
/// depending on the sign of the requested delta, `{step}` its magnitude.
#[derive(Clone, Copy, Debug)]
pub struct StepSpec {
    pub inc: &'static str,
    pub dec: &'static str,
    pub template: &'static str,
}

/// Continuous motion: `template` is refreshed at the motion heartbeat with
/// `{kind}` (direction) and `{speed}` until release, then `stop` is sent.
#[derive(Clone, Copy, Debug)]
pub struct MotionSpec {
    pub pos: &'static str,
    pub neg: &'static str,
    pub template: &'static str,
    pub stop: &'static str,
}

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    /// Dotted name, unique across all groups, e.g. `iris.pos`.
    pub name: &'static str,
    /// Wire field in the group's poll response (empty for Multi).
    pub field: &'static str,
    pub value: ValueSpec,
    pub set: Option<SetSpec>,
    pub step: Option<StepSpec>,
    pub motion: Option<MotionSpec>,
    /// Name of a mode parameter; while it reads `Auto`, local sets of this
    /// parameter are rejected without any HTTP traffic.
    pub auto_guard: Option<&'static str>,
}

impl ParamSpec {
    pub const fn read_only(&self) -> bool {
        self.set.is_none() && self.step.is_none() && self.motion.is_none()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GroupSpec {
    pub group: ParamGroup,
    /// `Command` value of the batched poll GET for this group.
    pub poll_command: &'static str,
    pub params: &'static [ParamSpec],
}

const fn param(name: &'static str, field: &'static str, value: ValueSpec) -> ParamSpec {
    ParamSpec {
        name,
        field,
        value,
        set: None,
        step: None,
        motion: None,
        auto_guard: None,
    }
}

const fn with_set(mut p: ParamSpec, template: &'static str) -> ParamSpec {
    p.set = Some(SetSpec { template });
    p
}

const fn with_step(mut p: ParamSpec, inc: &'static str, dec: &'static str) -> ParamSpec {
    p.step = Some(StepSpec {
        inc,
        dec,
        template: "SetWebButtonEvent?Kind={kind}&StepValue={step}",
    });
    p
}

const fn with_motion(mut p: ParamSpec, pos: &'static str, neg: &'static str, stop: &'static str) -> ParamSpec {
    p.motion = Some(MotionSpec {
        pos,
        neg,
        template: "SetWebButtonEvent?Kind={kind}&Speed={speed}",
        stop,
    });
    p
}

const fn guarded(mut p: ParamSpec, mode_param: &'static str) -> ParamSpec {
    p.auto_guard = Some(mode_param);
    p
}

pub static REGISTRY: &[GroupSpec] = &[
    GroupSpec {
        group: ParamGroup::Camera,
        poll_command: "GetCamStatus",
        params: &[
            param(
                "camera.status",
                "Status",
                ValueSpec::Choice(&["NoCard", "Stop", "Rec", "StandBy"]),
            ),
            with_set(
                param("camera.rec", "Rec", ValueSpec::Bool),
                "SetCamCtrl?Kind=Rec&Value={value}",
            ),
        ],
    },
    GroupSpec {
        group: ParamGroup::Exposure,
        poll_command: "GetExposureStatus",
        params: &[
            with_set(
                param(
                    "exposure.mode",
                    "ShootingMode",
                    ValueSpec::Choice(&["Auto", "Manual", "IrisPriority", "ShutterPriority"]),
                ),
                "SetWebButtonEvent?Kind=ShootingMode&Value={value}",
            ),
            with_set(
                param("iris.mode", "IrisMode", ValueSpec::Choice(&["Auto", "Manual"])),
                "SetWebButtonEvent?Kind=IrisMode&Value={value}",
            ),
            // Relative-only control: the camera exposes open/close steps,
            // not an absolute position write.
            guarded(
                with_step(
                    param("iris.pos", "IrisPos", ValueSpec::Int { min: 0, max: 255, step: None }),
                    "IrisOpen",
                    "IrisClose",
                ),
                "iris.mode",
            ),
            param("iris", "", ValueSpec::Multi(&["IrisPos", "IrisFNumber", "IrisMode"])),
            with_set(
                param("gain.value", "Gain", ValueSpec::Int { min: -6, max: 24, step: Some(3) }),
                "SetWebSliderEvent?Kind=Gain&Position={value}",
            ),
            with_set(
                param(
                    "shutter.value",
                    "Shutter",
                    ValueSpec::Choice(&[
                        "Off", "1/25", "1/30", "1/50", "1/60", "1/100", "1/120", "1/250", "1/500",
                        "1/1000", "1/2000", "1/4000", "1/10000",
                    ]),
                ),
                "SetWebButtonEvent?Kind=Shutter&Value={value}",
            ),
            with_motion(
                with_step(
                    param(
                        "master_black.pos",
                        "MasterBlack",
                        ValueSpec::Int { min: -50, max: 50, step: None },
                    ),
                    "MasterBlackUp",
                    "MasterBlackDown",
                ),
                "MasterBlackUp",
                "MasterBlackDown",
                "SetWebButtonEvent?Kind=MasterBlackStop",
            ),
            with_set(
                param("ae.level", "AeLevel", ValueSpec::Int { min: -3, max: 3, step: None }),
                "SetWebSliderEvent?Kind=AeLevel&Position={value}",
            ),
        ],
    },
    GroupSpec {
        group: ParamGroup::Paint,
        poll_command: "GetPaintStatus",
        params: &[
            with_set(
                param(
                    "white_balance.mode",
                    "WhbMode",
                    ValueSpec::Choice(&["Preset", "MemoryA", "MemoryB", "Faw", "Adjust"]),
                ),
                "SetWebButtonEvent?Kind=Whb&Value={value}",
            ),
            with_set(
                param("paint.red", "WhPaintR", ValueSpec::Int { min: -32, max: 31, step: None }),
                "SetWebSliderEvent?Kind=WhPaintR&Position={value}",
            ),
            with_set(
                param("paint.blue", "WhPaintB", ValueSpec::Int { min: -32, max: 31, step: None }),
                "SetWebSliderEvent?Kind=WhPaintB&Position={value}",
            ),
            with_set(
                param("paint.detail", "Detail", ValueSpec::Int { min: -10, max: 10, step: None }),
                "SetWebSliderEvent?Kind=Detail&Position={value}",
            ),
            with_set(
                param(
                    "color_temp.value",
                    "ColorTemp",
                    ValueSpec::Choice(&["3200K", "4200K", "5600K"]),
                ),
                "SetWebButtonEvent?Kind=ColorTemp&Value={value}",
            ),
            param("white_balance", "", ValueSpec::Multi(&["WhbMode", "WhPaintR", "WhPaintB"])),
        ],
    },
    GroupSpec {
        group: ParamGroup::Tally,
        poll_command: "GetTallyStatus",
        params: &[
            with_set(
                param("tally.program", "Program", ValueSpec::Bool),
                "SetStudioTally?Kind=Program&State={value}",
            ),
            with_set(
                param("tally.preview", "Preview", ValueSpec::Bool),
                "SetStudioTally?Kind=Preview&State={value}",
            ),
            with_set(
                param("tally.priority", "Priority", ValueSpec::Choice(&["Camera", "Web"])),
                "SetStudioTally?Kind=Priority&Value={value}",
            ),
        ],
    },
    GroupSpec {
        group: ParamGroup::Ntp,
        poll_command: "GetNtpStatus",
        params: &[
            param("ntp.enabled", "Enable", ValueSpec::Bool),
            param("ntp.synchronized", "Sync", ValueSpec::Bool),
        ],
    },
    GroupSpec {
        group: ParamGroup::Battery,
        poll_command: "GetBatteryStatus",
        params: &[
            param("battery.level", "Level", ValueSpec::Int { min: 0, max: 100, step: None }),
            param("battery.charging", "Charging", ValueSpec::Bool),
        ],
    },
    GroupSpec {
        group: ParamGroup::Lens,
        poll_command: "GetLensStatus",
        params: &[
            with_motion(
                param("zoom.pos", "ZoomPos", ValueSpec::Int { min: 0, max: 499, step: None }),
                "ZoomTele",
                "ZoomWide",
                "SetWebButtonEvent?Kind=ZoomStop",
            ),
            with_set(
                param("focus.mode", "FocusMode", ValueSpec::Choice(&["Auto", "Manual"])),
                "SetWebButtonEvent?Kind=FocusMode&Value={value}",
            ),
            guarded(
                with_motion(
                    param("focus.pos", "FocusPos", ValueSpec::Int { min: 0, max: 499, step: None }),
                    "FocusFar",
                    "FocusNear",
                    "SetWebButtonEvent?Kind=FocusStop",
                ),
                "focus.mode",
            ),
        ],
    },
];

pub fn group_spec(group: ParamGroup) -> &'static GroupSpec {
    REGISTRY
        .iter()
        .find(|g| g.group == group)
        .expect("registry covers all groups")
}

/// Look up a parameter by its dotted name.
pub fn lookup(name: &str) -> Option<(&'static GroupSpec, &'static ParamSpec)> {
    for group in REGISTRY {
        for param in group.params {
            if param.name == name {
                return Some((group, param));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for group in REGISTRY {
            for param in group.params {
                assert!(seen.insert(param.name), "duplicate parameter {}", param.name);
            }
        }
    }

    #[test]
    fn every_group_is_registered_once() {
        for group in ParamGroup::all() {
            assert_eq!(
                REGISTRY.iter().filter(|g| g.group == *group).count(),
                1,
                "group {group}"
            );
        }
    }

    #[test]
    fn iris_pos_binding() {
        let (group, param) = lookup("iris.pos").unwrap();
        assert_eq!(group.group, ParamGroup::Exposure);
        assert_eq!(group.poll_command, "GetExposureStatus");
        assert_eq!(param.field, "IrisPos");
        assert!(matches!(param.value, ValueSpec::Int { min: 0, max: 255, .. }));
        let step = param.step.unwrap();
        assert_eq!(step.inc, "IrisOpen");
        assert_eq!(step.dec, "IrisClose");
        assert_eq!(param.auto_guard, Some("iris.mode"));
    }

    #[test]
    fn templates_carry_their_placeholders() {
        for group in REGISTRY {
            for param in group.params {
                if let Some(set) = &param.set {
                    assert!(set.template.contains("{value}"), "{}", param.name);
                }
                if let Some(step) = &param.step {
                    assert!(step.template.contains("{kind}"), "{}", param.name);
                    assert!(step.template.contains("{step}"), "{}", param.name);
                }
                if let Some(motion) = &param.motion {
                    assert!(motion.template.contains("{kind}"), "{}", param.name);
                    assert!(motion.template.contains("{speed}"), "{}", param.name);
                    assert!(!motion.stop.contains('{'), "{}", param.name);
                }
            }
        }
    }

    #[test]
    fn multi_components_resolve_to_wire_fields() {
        for group in REGISTRY {
            for param in group.params {
                if let ValueSpec::Multi(fields) = param.value {
                    for field in fields {
                        assert!(
                            group.params.iter().any(|p| p.field == *field),
                            "{}: component {} not polled in group {}",
                            param.name,
                            field,
                            group.group
                        );
                    }
                }
            }
        }
    }
}
