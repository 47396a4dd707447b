use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::error::{DecodeError, TweakError};
use crate::protocol::WireTweak;

/// The closed set of tweak value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TweakKind {
    Bool,
    Int,
    Float,
    Double,
    String,
}

impl TweakKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TweakKind::Bool => "bool",
            TweakKind::Int => "int",
            TweakKind::Float => "float",
            TweakKind::Double => "double",
            TweakKind::String => "string",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "bool" => Some(TweakKind::Bool),
            "int" => Some(TweakKind::Int),
            "float" => Some(TweakKind::Float),
            "double" => Some(TweakKind::Double),
            "string" => Some(TweakKind::String),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, TweakKind::Int | TweakKind::Float | TweakKind::Double)
    }
}

/// A tweak's current value, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TweakValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl TweakValue {
    pub fn kind(&self) -> TweakKind {
        match self {
            TweakValue::Bool(_) => TweakKind::Bool,
            TweakValue::Int(_) => TweakKind::Int,
            TweakValue::Float(_) => TweakKind::Float,
            TweakValue::Double(_) => TweakKind::Double,
            TweakValue::String(_) => TweakKind::String,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            TweakValue::Int(v) => Some(*v as f64),
            TweakValue::Float(v) => Some(f64::from(*v)),
            TweakValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

/// Default/min/max/step for numeric tweaks. Shared f64 record across the
/// three numeric kinds; int tweaks carry their bounds as whole numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Unique identity of a tweak within a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TweakKey {
    pub collection: String,
    pub group: String,
    pub name: String,
}

impl TweakKey {
    pub fn new(
        collection: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TweakKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.group, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TweakDescriptor {
    pub key: TweakKey,
    pub value: TweakValue,
    pub bounds: Option<Bounds>,
}

impl TweakDescriptor {
    pub fn new(key: TweakKey, value: TweakValue, bounds: Option<Bounds>) -> Self {
        Self { key, value, bounds }
    }

    pub fn kind(&self) -> TweakKind {
        self.value.kind()
    }

    fn to_wire(&self) -> WireTweak {
        let mut record = WireTweak {
            collection: self.key.collection.clone(),
            group: self.key.group.clone(),
            name: self.key.name.clone(),
            kind: self.kind().as_str().to_owned(),
            bool_value: None,
            int_value: None,
            float_value: None,
            double_value: None,
            string_value: None,
            default: None,
            min: None,
            max: None,
            step: None,
        };
        match &self.value {
            TweakValue::Bool(v) => record.bool_value = Some(*v),
            TweakValue::Int(v) => record.int_value = Some(*v),
            TweakValue::Float(v) => record.float_value = Some(*v),
            TweakValue::Double(v) => record.double_value = Some(*v),
            TweakValue::String(v) => record.string_value = Some(v.clone()),
        }
        if let Some(bounds) = &self.bounds {
            record.default = Some(bounds.default);
            record.min = Some(bounds.min);
            record.max = Some(bounds.max);
            record.step = Some(bounds.step);
        }
        record
    }

    /// Builds a descriptor from a wire record. Returns `None` (with a log
    /// line) for records we cannot represent: unknown kind tags from newer
    /// peers, a missing value field, or nonsense bounds. Out-of-range values
    /// are clamped, not rejected; the next full-state resync corrects them.
    fn from_wire(record: &WireTweak) -> Option<Self> {
        let key = TweakKey::new(&record.collection, &record.group, &record.name);
        let Some(kind) = TweakKind::from_tag(&record.kind) else {
            warn!(tweak = %key, kind = %record.kind, "skipping tweak with unsupported kind");
            return None;
        };

        let bounds = match (record.default, record.min, record.max, record.step) {
            (Some(default), Some(min), Some(max), Some(step)) if kind.is_numeric() => {
                if min > max || step <= 0.0 {
                    warn!(tweak = %key, min, max, step, "skipping tweak with invalid bounds");
                    return None;
                }
                Some(Bounds {
                    default,
                    min,
                    max,
                    step,
                })
            }
            _ => None,
        };

        let value = match kind {
            TweakKind::Bool => record.bool_value.map(TweakValue::Bool),
            TweakKind::Int => record.int_value.map(|v| {
                let clamped = bounds.map_or(v as f64, |b| b.clamp(v as f64));
                TweakValue::Int(clamped as i64)
            }),
            TweakKind::Float => record.float_value.map(|v| {
                let clamped = bounds.map_or(f64::from(v), |b| b.clamp(f64::from(v)));
                TweakValue::Float(clamped as f32)
            }),
            TweakKind::Double => record.double_value.map(|v| {
                let clamped = bounds.map_or(v, |b| b.clamp(v));
                TweakValue::Double(clamped)
            }),
            TweakKind::String => record.string_value.clone().map(TweakValue::String),
        };
        let Some(value) = value else {
            warn!(tweak = %key, kind = %record.kind, "skipping tweak with missing value field");
            return None;
        };

        Some(TweakDescriptor::new(key, value, bounds))
    }
}

/// The in-memory model of a parameter set: insertion-ordered descriptors
/// with unique keys. Order is preserved because the consuming UI displays
/// tweaks in the order the host declared them.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    entries: Vec<TweakDescriptor>,
    index: HashMap<TweakKey, usize>,
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = TweakDescriptor>,
    ) -> Result<Self, DecodeError> {
        let mut set = Self::new();
        for descriptor in descriptors {
            set.insert(descriptor)?;
        }
        Ok(set)
    }

    fn insert(&mut self, descriptor: TweakDescriptor) -> Result<(), DecodeError> {
        if self.index.contains_key(&descriptor.key) {
            return Err(DecodeError::DuplicateKey(descriptor.key));
        }
        self.index.insert(descriptor.key.clone(), self.entries.len());
        self.entries.push(descriptor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &TweakKey) -> Option<&TweakDescriptor> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TweakDescriptor> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TweakKey> {
        self.entries.iter().map(|d| &d.key)
    }

    /// Validates kind and bounds, then updates the stored value. A rejected
    /// edit leaves the stored value untouched.
    pub fn set_value(&mut self, key: &TweakKey, value: TweakValue) -> Result<(), TweakError> {
        let Some(&i) = self.index.get(key) else {
            return Err(TweakError::UnknownKey(key.clone()));
        };
        let entry = &mut self.entries[i];
        if entry.kind() != value.kind() {
            return Err(TweakError::TypeMismatch {
                key: key.clone(),
                expected: entry.kind(),
                got: value.kind(),
            });
        }
        if let (Some(bounds), Some(v)) = (entry.bounds, value.as_f64()) {
            if !bounds.contains(v) {
                return Err(TweakError::OutOfRange {
                    key: key.clone(),
                    value: v,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }
        entry.value = value;
        Ok(())
    }

    /// Adopts values from a remote set. For keys we already hold, only the
    /// value is overwritten; bounds and metadata stay authoritative on this
    /// side, so a peer can never redefine our declared ranges. Unknown keys
    /// are inserted whole, in arrival order; that is the first-seed path.
    ///
    /// Returns the keys whose values changed (insertions included).
    pub fn merge_from(&mut self, remote: ParameterSet) -> Vec<TweakKey> {
        let mut changed = Vec::new();
        for incoming in remote.entries {
            match self.index.get(&incoming.key) {
                Some(&i) => {
                    let local = &mut self.entries[i];
                    if local.kind() != incoming.kind() {
                        warn!(
                            tweak = %incoming.key,
                            local = local.kind().as_str(),
                            remote = incoming.kind().as_str(),
                            "ignoring merge value with mismatched kind"
                        );
                        continue;
                    }
                    let mut value = incoming.value;
                    if let (Some(bounds), Some(v)) = (local.bounds, value.as_f64()) {
                        if !bounds.contains(v) {
                            value = match value {
                                TweakValue::Int(_) => TweakValue::Int(bounds.clamp(v) as i64),
                                TweakValue::Float(_) => TweakValue::Float(bounds.clamp(v) as f32),
                                TweakValue::Double(_) => TweakValue::Double(bounds.clamp(v)),
                                other => other,
                            };
                        }
                    }
                    if local.value != value {
                        local.value = value;
                        changed.push(local.key.clone());
                    }
                }
                None => {
                    let key = incoming.key.clone();
                    self.index.insert(key.clone(), self.entries.len());
                    self.entries.push(incoming);
                    changed.push(key);
                }
            }
        }
        changed
    }

    /// Serializes the whole set. Deterministic given insertion order and
    /// values; `decode(encode(s)) == s` for any valid set.
    pub fn encode(&self) -> Vec<u8> {
        let records: Vec<WireTweak> = self.entries.iter().map(TweakDescriptor::to_wire).collect();
        serde_json::to_vec(&records).unwrap_or_default()
    }

    /// Parses a payload produced by `encode` (possibly by a newer peer).
    /// Records with unknown kinds or unusable fields are skipped with a
    /// warning so a forward-compatible host doesn't break an old controller.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let records: Vec<WireTweak> = serde_json::from_slice(bytes)?;
        Self::from_descriptors(records.iter().filter_map(TweakDescriptor::from_wire))
    }
}
