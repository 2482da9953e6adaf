//! Entity states and the templates that give them a schema.
//!
//! A [`StateTemplate`] is an ordered list of named fields, each with a
//! [`ValueTemplate`] and per-field policies: `critical` (a change is sent
//! immediately), `spatial` (relative to the sender's origin) and an
//! extrapolation ceiling after which the field is frozen.

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::value::{Transform, Value, ValueTemplate};

/// Default extrapolation ceiling in seconds.
pub const DEFAULT_MAX_EXTRAPOLATION: f64 = 4.0;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Fixed-schema bag of values, ordered as its template declares them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    values: Vec<Value>,
}

impl State {
    /// Wrap values; validate against a template with [`StateTemplate::validate`].
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// All values in field order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of field `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A state and the network time it describes.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub state: &'a State,
    pub time: f64,
}

// ---------------------------------------------------------------------------
// Field phases
// ---------------------------------------------------------------------------

/// Extrapolation phase of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPhase {
    /// Nothing received yet.
    Unknown,
    /// Requested time equals the sample time; the sample is returned as-is.
    Fresh,
    /// Extrapolated from the sample.
    Aging,
    /// Past the ceiling; frozen at the value extrapolated to the ceiling.
    Stale,
}

impl FieldPhase {
    /// Phase after `elapsed` seconds since the sample, if there is one.
    pub fn classify(elapsed: Option<f64>, ceiling: f64) -> Self {
        match elapsed {
            None => FieldPhase::Unknown,
            Some(elapsed) if elapsed <= 0.0 => FieldPhase::Fresh,
            Some(elapsed) if elapsed <= ceiling => FieldPhase::Aging,
            Some(_) => FieldPhase::Stale,
        }
    }
}

// ---------------------------------------------------------------------------
// StateTemplate
// ---------------------------------------------------------------------------

/// One declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTemplate {
    pub name: String,
    pub template: ValueTemplate,
    /// A change is sent on the next update regardless of throttling.
    pub critical: bool,
    /// Value is expressed relative to the sender's origin.
    pub spatial: bool,
    /// Seconds past the last sample after which the field is frozen.
    pub max_extrapolation: f64,
}

/// Schema and policies for a replicated state.
///
/// ```
/// use nebula_replication::{StateTemplate, ValueTemplate};
///
/// let template = StateTemplate::new()
///     .declare("body", ValueTemplate::BodyState)
///     .spatial()
///     .declare("alive", ValueTemplate::Bool)
///     .critical();
/// assert_eq!(template.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StateTemplate {
    fields: Vec<FieldTemplate>,
    default_ceiling: f64,
}

impl Default for StateTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTemplate {
    /// Empty template with the default extrapolation ceiling.
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            default_ceiling: DEFAULT_MAX_EXTRAPOLATION,
        }
    }

    /// Set the ceiling used by fields declared after this call.
    pub fn with_default_ceiling(mut self, seconds: f64) -> Self {
        self.default_ceiling = seconds.max(0.0);
        self
    }

    /// Append a named field.
    pub fn declare(mut self, name: impl Into<String>, template: ValueTemplate) -> Self {
        self.fields.push(FieldTemplate {
            name: name.into(),
            template,
            critical: false,
            spatial: false,
            max_extrapolation: self.default_ceiling,
        });
        self
    }

    /// Mark the last declared field critical.
    pub fn critical(mut self) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.critical = true;
        }
        self
    }

    /// Mark the last declared field origin-relative.
    pub fn spatial(mut self) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.spatial = true;
        }
        self
    }

    /// Override the extrapolation ceiling of the last declared field.
    pub fn max_extrapolation(mut self, seconds: f64) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.max_extrapolation = seconds.max(0.0);
        }
        self
    }

    pub fn fields(&self) -> &[FieldTemplate] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Index of the field called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Value of the field called `name` in `state`.
    pub fn get<'a>(&self, state: &'a State, name: &str) -> Option<&'a Value> {
        self.index_of(name).and_then(|index| state.value(index))
    }

    /// Whether any field is critical.
    pub fn has_critical(&self) -> bool {
        self.fields.iter().any(|field| field.critical)
    }

    /// Check field count and kinds.
    pub fn validate(&self, state: &State) -> Result<(), StateError> {
        if state.len() != self.fields.len() {
            return Err(StateError::FieldCountMismatch {
                expected: self.fields.len(),
                actual: state.len(),
            });
        }
        for (field, value) in self.fields.iter().zip(state.values()) {
            if !field.template.accepts(value) {
                return Err(StateError::KindMismatch {
                    field: field.name.clone(),
                    expected: field.template,
                    actual: value.template(),
                });
            }
        }
        Ok(())
    }

    /// Encode a state for the wire.
    pub fn pack(&self, state: &State) -> Result<Vec<u8>, StateError> {
        self.validate(state)?;
        Ok(postcard::to_allocvec(state.values())?)
    }

    /// Decode and validate a packed state.
    pub fn unpack(&self, bytes: &[u8]) -> Result<State, StateError> {
        let values: Vec<Value> = postcard::from_bytes(bytes)?;
        let state = State::new(values);
        self.validate(&state)?;
        Ok(state)
    }

    /// True when every field of `a` and `b` is bit-identical.
    pub fn matches(&self, a: &State, b: &State) -> bool {
        a.len() == b.len()
            && self
                .fields
                .iter()
                .zip(a.values().iter().zip(b.values()))
                .all(|(field, (a, b))| field.template.matches(a, b))
    }

    /// True when a critical field of `next` differs from `last`. No baseline
    /// counts as no change.
    pub fn critical_changed(&self, last: Option<&State>, next: &State) -> bool {
        let Some(last) = last else {
            return false;
        };
        self.fields
            .iter()
            .zip(last.values().iter().zip(next.values()))
            .any(|(field, (a, b))| field.critical && !field.template.matches(a, b))
    }

    /// Synthesize the state at `time` from the newest sample `s0` and up to
    /// two older samples. Each field is extrapolated no further than its
    /// ceiling past `s0`.
    pub fn extrapolate(
        &self,
        n2: Option<Sample<'_>>,
        n1: Option<Sample<'_>>,
        s0: Sample<'_>,
        time: f64,
    ) -> State {
        let values = self
            .fields
            .iter()
            .enumerate()
            .filter_map(|(index, field)| {
                let v0 = s0.state.value(index)?;
                let time = time.min(s0.time + field.max_extrapolation);
                Some(field.template.extrapolate(
                    field_sample(n2, index),
                    field_sample(n1, index),
                    (v0, s0.time),
                    time,
                ))
            })
            .collect();
        State::new(values)
    }

    /// Field-wise blend from `a` towards `b`.
    pub fn lerp(&self, a: &State, b: &State, k: f32) -> State {
        let values = self
            .fields
            .iter()
            .zip(a.values().iter().zip(b.values()))
            .map(|(field, (a, b))| field.template.lerp(a, b, k))
            .collect();
        State::new(values)
    }

    /// Phase of every field at `time` given the newest sample time.
    pub fn phases(&self, sample_time: Option<f64>, time: f64) -> Vec<FieldPhase> {
        let elapsed = sample_time.map(|t0| time - t0);
        self.fields
            .iter()
            .map(|field| FieldPhase::classify(elapsed, field.max_extrapolation))
            .collect()
    }

    /// Express spatial fields relative to `origin`.
    pub fn to_relative(&self, state: &State, origin: &Transform) -> State {
        self.map_spatial(state, &origin.inverse())
    }

    /// Map origin-relative spatial fields back into the frame of `origin`.
    pub fn from_relative(&self, state: &State, origin: &Transform) -> State {
        self.map_spatial(state, origin)
    }

    fn map_spatial(&self, state: &State, by: &Transform) -> State {
        let values = state
            .values()
            .iter()
            .enumerate()
            .map(|(index, value)| match self.fields.get(index) {
                Some(field) if field.spatial => value.transformed(by),
                _ => *value,
            })
            .collect();
        State::new(values)
    }
}

fn field_sample(sample: Option<Sample<'_>>, index: usize) -> Option<(&Value, f64)> {
    sample.and_then(|s| s.state.value(index).map(|value| (value, s.time)))
}
