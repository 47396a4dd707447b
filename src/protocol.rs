use serde::{Deserialize, Serialize};

/// One tweak on the wire. The `kind` tag is an open string so that newer
/// peers can ship kinds we don't know about; decode skips those records
/// instead of failing the batch.
///
/// Value fields are one-per-kind, mirroring how the parameter payload has
/// always been serialized; exactly one of them is set for a known kind.
/// `default`/`min`/`max`/`step` travel only with numeric kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireTweak {
    pub collection: String,
    pub group: String,
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_value: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

/// Transport envelope for the LAN implementation. `Sync` carries an opaque
/// encoded parameter payload; the envelope itself is not part of the
/// round-trip property.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Frame {
    Invite {
        peer_id: String,
        display_name: String,
    },
    InviteAccepted {
        peer_id: String,
        display_name: String,
    },
    Sync {
        peer_id: String,
        payload: Vec<u8>,
    },
    Bye {
        peer_id: String,
    },
}
