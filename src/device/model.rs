//! In-memory mirror of one camera's parameter groups.
//!
//! Per camera there is a single [`ParameterModel`] that is shared between
//! the device session (remote updates from polls and command responses) and
//! local writers (user surfaces, the tally router). If you hold a reference
//! to the model you can subscribe to every change made to it.
//!
//! Edit arbitration lives here: a remote update always lands in
//! `last_remote` but only writes through to `current` when no local edit is
//! pending, so a racing poll never clobbers the user's intent. A failed
//! write reverts `current` to `last_remote` and surfaces the error on the
//! parameter.
//!
//! The model is created alongside the session and retained across
//! reconnects; on disconnect parameters keep their last-seen value but are
//! marked stale.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;

use crate::spec::{self, ParamGroup, ParamSpec, ValueSpec};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("Parameter '{0}' is not known")]
    NotSupported(String),
    #[error("Parameter '{0}' is read-only")]
    ReadOnly(&'static str),
    #[error("Parameter {0} value {1} is lower than minimum value {2}")]
    TooLow(&'static str, i32, i32),
    #[error("Parameter {0} value {1} is higher than maximum value {2}")]
    TooHigh(&'static str, i32, i32),
    #[error("Parameter {0} value '{1}' is not a legal value")]
    Invalid(&'static str, String),
    #[error("Parameter {0} cannot be set while {1} is Auto")]
    AutoMode(&'static str, &'static str),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i32),
    Choice(String),
    /// Composite value of a multi-parameter, one entry per wire field.
    Composite(Vec<(&'static str, ParamValue)>),
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_choice(&self) -> Option<&str> {
        match self {
            ParamValue::Choice(s) => Some(s),
            _ => None,
        }
    }

    /// Wire encoding used when filling a set template.
    pub fn encode_wire(&self) -> String {
        match self {
            ParamValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Choice(s) => s.clone(),
            ParamValue::Composite(_) => String::new(),
        }
    }
}

/// Parse one wire field per its value spec. The camera is authoritative for
/// remote values, so integers are accepted without a range check here.
fn parse_wire(name: &'static str, value_spec: &ValueSpec, v: &serde_json::Value) -> Result<ParamValue, ParamError> {
    match value_spec {
        ValueSpec::Bool => match v {
            serde_json::Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            serde_json::Value::Number(n) => Ok(ParamValue::Bool(n.as_i64() == Some(1))),
            serde_json::Value::String(s) => match s.as_str() {
                "1" | "On" | "on" | "true" => Ok(ParamValue::Bool(true)),
                "0" | "Off" | "off" | "false" => Ok(ParamValue::Bool(false)),
                _ => Err(ParamError::Invalid(name, s.clone())),
            },
            _ => Err(ParamError::Invalid(name, v.to_string())),
        },
        ValueSpec::Int { .. } => v
            .as_i64()
            .map(|i| ParamValue::Int(i as i32))
            .or_else(|| v.as_str().and_then(|s| s.parse::<i32>().ok()).map(ParamValue::Int))
            .ok_or_else(|| ParamError::Invalid(name, v.to_string())),
        ValueSpec::Choice(choices) => {
            let s = v.as_str().ok_or_else(|| ParamError::Invalid(name, v.to_string()))?;
            if choices.contains(&s) {
                Ok(ParamValue::Choice(s.to_string()))
            } else {
                Err(ParamError::Invalid(name, s.to_string()))
            }
        }
        // Composite components are parsed by raw JSON type
        ValueSpec::Multi(_) => match v {
            serde_json::Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(|i| ParamValue::Int(i as i32))
                .ok_or_else(|| ParamError::Invalid(name, v.to_string())),
            serde_json::Value::String(s) => Ok(ParamValue::Choice(s.clone())),
            _ => Err(ParamError::Invalid(name, v.to_string())),
        },
    }
}

/// Validate a local write against the parameter's value spec.
fn validate_local(param: &ParamSpec, value: &ParamValue) -> Result<ParamValue, ParamError> {
    match (&param.value, value) {
        (ValueSpec::Bool, ParamValue::Bool(_)) => Ok(value.clone()),
        (ValueSpec::Int { min, max, step }, ParamValue::Int(i)) => {
            if i < min {
                return Err(ParamError::TooLow(param.name, *i, *min));
            }
            if i > max {
                return Err(ParamError::TooHigh(param.name, *i, *max));
            }
            // Snap onto the step grid the way the camera will report it back
            if let Some(step) = step {
                let snapped = min + ((i - min + step / 2) / step) * step;
                return Ok(ParamValue::Int(snapped.min(*max)));
            }
            Ok(value.clone())
        }
        (ValueSpec::Choice(choices), ParamValue::Choice(s)) => {
            if choices.contains(&s.as_str()) {
                Ok(value.clone())
            } else {
                Err(ParamError::Invalid(param.name, s.clone()))
            }
        }
        _ => Err(ParamError::Invalid(param.name, value.encode_wire())),
    }
}

#[derive(Clone, Debug)]
struct Parameter {
    spec: &'static ParamSpec,
    current: Option<ParamValue>,
    last_remote: Option<ParamValue>,
    pending: Option<ParamValue>,
    dirty: bool,
    stale: bool,
    error: Option<String>,
    last_update: Option<Instant>,
}

impl Parameter {
    fn new(spec: &'static ParamSpec) -> Self {
        Parameter {
            spec,
            current: None,
            last_remote: None,
            pending: None,
            dirty: false,
            stale: true,
            error: None,
            last_update: None,
        }
    }
}

/// Observable snapshot of one parameter.
#[derive(Clone, Debug)]
pub struct ParamState {
    pub name: &'static str,
    pub current: Option<ParamValue>,
    pub last_remote: Option<ParamValue>,
    pub dirty: bool,
    pub stale: bool,
    pub error: Option<String>,
}

/// Broadcast on every observable change of a parameter.
#[derive(Clone, Debug)]
pub struct ParamChange {
    pub device_id: String,
    pub name: &'static str,
    pub value: ParamValue,
    pub error: Option<String>,
}

struct ModelInner {
    device_id: String,
    params: HashMap<&'static str, Parameter>,
    change_tx: tokio::sync::broadcast::Sender<ParamChange>,
}

#[derive(Clone)]
pub struct ParameterModel {
    inner: Arc<RwLock<ModelInner>>,
}

impl ParameterModel {
    pub fn new(device_id: &str) -> Self {
        let mut params = HashMap::new();
        for group in spec::REGISTRY {
            for param in group.params {
                params.insert(param.name, Parameter::new(param));
            }
        }
        let (change_tx, _) = tokio::sync::broadcast::channel(64);
        ParameterModel {
            inner: Arc::new(RwLock::new(ModelInner {
                device_id: device_id.to_string(),
                params,
                change_tx,
            })),
        }
    }

    pub fn device_id(&self) -> String {
        self.inner.read().unwrap().device_id.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ParamChange> {
        self.inner.read().unwrap().change_tx.subscribe()
    }

    /// Route one group's poll (or command) response into the model.
    ///
    /// `data` is the `Data` object of the response. Unknown fields are
    /// ignored; fields that fail to parse are logged and dropped. Returns
    /// the number of fields that could not be parsed.
    pub fn apply_remote(&self, group: ParamGroup, data: &serde_json::Value) -> usize {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut bad_fields = 0;

        {
            let mut inner = self.inner.write().unwrap();
            let group_spec = spec::group_spec(group);

            // Scalars first so composites observe the same poll atomically
            for param_spec in group_spec.params {
                if matches!(param_spec.value, ValueSpec::Multi(_)) {
                    continue;
                }
                let Some(field_value) = data.get(param_spec.field) else {
                    continue;
                };
                let value = match parse_wire(param_spec.name, &param_spec.value, field_value) {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("{}: dropping {}: {}", inner.device_id, param_spec.name, e);
                        bad_fields += 1;
                        continue;
                    }
                };
                let device_id = inner.device_id.clone();
                let param = inner.params.get_mut(param_spec.name).unwrap();
                param.last_remote = Some(value.clone());
                param.last_update = Some(now);
                param.stale = false;
                if !param.dirty && param.current.as_ref() != Some(&value) {
                    param.current = Some(value.clone());
                    events.push(ParamChange {
                        device_id,
                        name: param_spec.name,
                        value,
                        error: None,
                    });
                }
            }

            // Composites: recompute from the fields of this response and
            // emit at most one change event per composite.
            for param_spec in group_spec.params {
                let ValueSpec::Multi(fields) = param_spec.value else {
                    continue;
                };
                let mut components = Vec::with_capacity(fields.len());
                for field in fields {
                    let Some(field_value) = data.get(*field) else {
                        continue;
                    };
                    match parse_wire(param_spec.name, &param_spec.value, field_value) {
                        Ok(v) => components.push((*field, v)),
                        Err(e) => {
                            log::warn!("{}: dropping {}.{}: {}", inner.device_id, param_spec.name, field, e);
                            bad_fields += 1;
                        }
                    }
                }
                if components.is_empty() {
                    continue;
                }
                let value = ParamValue::Composite(components);
                let device_id = inner.device_id.clone();
                let param = inner.params.get_mut(param_spec.name).unwrap();
                param.last_remote = Some(value.clone());
                param.last_update = Some(now);
                param.stale = false;
                if !param.dirty && param.current.as_ref() != Some(&value) {
                    param.current = Some(value.clone());
                    events.push(ParamChange {
                        device_id,
                        name: param_spec.name,
                        value,
                        error: None,
                    });
                }
            }
        }

        self.send_events(events);
        bad_fields
    }

    /// Start a local write: validate, stamp the user's intent on `current`
    /// and flag the parameter dirty. The caller is responsible for getting
    /// the value onto the wire (see the session's command queue) and for
    /// resolving the write with [`write_succeeded`](Self::write_succeeded)
    /// or [`write_failed`](Self::write_failed).
    pub fn begin_write(&self, name: &str, value: ParamValue) -> Result<(), ParamError> {
        let event = {
            let mut inner = self.inner.write().unwrap();
            let param = inner
                .params
                .get(name)
                .ok_or_else(|| ParamError::NotSupported(name.to_string()))?;
            let param_spec = param.spec;
            if param_spec.read_only() {
                return Err(ParamError::ReadOnly(param_spec.name));
            }
            if let Some(guard) = param_spec.auto_guard {
                let guard_is_auto = inner
                    .params
                    .get(guard)
                    .and_then(|p| p.current.as_ref())
                    .and_then(|v| v.as_choice())
                    .map(|mode| mode == "Auto")
                    .unwrap_or(false);
                if guard_is_auto {
                    return Err(ParamError::AutoMode(param_spec.name, guard));
                }
            }
            let value = validate_local(param_spec, &value)?;

            let device_id = inner.device_id.clone();
            let param = inner.params.get_mut(name).unwrap();
            param.pending = Some(value.clone());
            param.current = Some(value.clone());
            param.dirty = true;
            param.error = None;
            ParamChange {
                device_id,
                name: param.spec.name,
                value,
                error: None,
            }
        };
        self.send_events(vec![event]);
        Ok(())
    }

    /// The queued write reached the camera. The command response is routed
    /// through [`apply_remote`](Self::apply_remote) afterwards, which will
    /// reconcile `last_remote` without emitting a duplicate change.
    pub fn write_succeeded(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(param) = inner.params.get_mut(name) {
            param.dirty = false;
            param.pending = None;
            param.error = None;
        }
    }

    /// The write failed after its retries: revert `current` to the last
    /// value the camera reported and surface the error on the parameter.
    pub fn write_failed(&self, name: &str, reason: &str) {
        let event = {
            let mut inner = self.inner.write().unwrap();
            let device_id = inner.device_id.clone();
            let Some(param) = inner.params.get_mut(name) else {
                return;
            };
            param.dirty = false;
            param.pending = None;
            param.current = param.last_remote.clone();
            param.error = Some(reason.to_string());
            param.current.clone().map(|value| ParamChange {
                device_id,
                name: param.spec.name,
                value,
                error: Some(reason.to_string()),
            })
        };
        if let Some(event) = event {
            self.send_events(vec![event]);
        }
    }

    /// On disconnect parameters keep their last-seen value but are stale.
    pub fn mark_stale(&self) {
        let mut inner = self.inner.write().unwrap();
        for param in inner.params.values_mut() {
            param.stale = true;
        }
    }

    pub fn get(&self, name: &str) -> Option<ParamState> {
        let inner = self.inner.read().unwrap();
        inner.params.get(name).map(|p| ParamState {
            name: p.spec.name,
            current: p.current.clone(),
            last_remote: p.last_remote.clone(),
            dirty: p.dirty,
            stale: p.stale,
            error: p.error.clone(),
        })
    }

    pub fn current_value(&self, name: &str) -> Option<ParamValue> {
        self.inner
            .read()
            .unwrap()
            .params
            .get(name)
            .and_then(|p| p.current.clone())
    }

    pub fn pending_value(&self, name: &str) -> Option<ParamValue> {
        self.inner
            .read()
            .unwrap()
            .params
            .get(name)
            .and_then(|p| p.pending.clone())
    }

    pub fn last_remote_value(&self, name: &str) -> Option<ParamValue> {
        self.inner
            .read()
            .unwrap()
            .params
            .get(name)
            .and_then(|p| p.last_remote.clone())
    }

    fn send_events(&self, events: Vec<ParamChange>) {
        if events.is_empty() {
            return;
        }
        let tx = self.inner.read().unwrap().change_tx.clone();
        for event in events {
            match tx.send(event) {
                Err(_) => {} // no subscribers
                Ok(n) => log::trace!("change sent to {} subscribers", n),
            }
        }
    }
}
