//! Ring Builder HTTP Protocol
//!
//! Defines the endpoints, headers and Data Transfer Objects (DTOs) of the catalog API, plus
//! the typed [`Mutation`] request that every write body is parsed into before it reaches the
//! executor.
//!
//! Bodies are parsed leniently the way operators write them by hand: numeric fields may be
//! JSON numbers or numeric strings, and map keys are device ids in string form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::catalog::types::{Device, DeviceId, DeviceSpec};
use crate::error::{Error, Result};
use crate::store::version::VersionToken;

// --- API Endpoints ---

/// Prefix of catalog routes: `/ringbuilder/<category>.builder` and `/ringbuilder/<category>/<action>`.
pub const ENDPOINT_BUILDER: &str = "/ringbuilder";
/// Prefix of published ring routes: `/ring/<category>.ring.gz`.
pub const ENDPOINT_RING: &str = "/ring";

// --- Headers ---

/// Response header carrying the token of the file the response describes.
pub const HEADER_CURRENT_HASH: &str = "X-Current-Hash";
/// Request header carrying the token the caller last observed. Required on writes.
pub const HEADER_LAST_HASH: &str = "X-Ring-Builder-Last-Hash";
/// Request header carrying the shared key.
pub const HEADER_KEY: &str = "X-Ring-Builder-Key";

pub const MSG_MALFORMED_JSON: &str = "Malformed json.";
pub const MSG_MALFORMED_REQUEST: &str = "Malformed request.";
pub const MSG_INVALID_BUILDER_TYPE: &str = "Invalid builder type.";
pub const MSG_UNCHANGED: &str = "Ring remains unchanged.";
pub const MSG_MISSING_HASH: &str = "Missing X-Ring-Builder-Last-Hash header.";

/// The action segment of `POST /ringbuilder/<category>/<action>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Search,
    Add,
    Remove,
    Weight,
    Meta,
    Rebalance,
}

impl Action {
    /// Whether the action writes and therefore needs `X-Ring-Builder-Last-Hash`.
    pub fn is_write(&self) -> bool {
        !matches!(self, Action::Search)
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "search" => Ok(Action::Search),
            "add" => Ok(Action::Add),
            "remove" => Ok(Action::Remove),
            "weight" => Ok(Action::Weight),
            "meta" => Ok(Action::Meta),
            "rebalance" => Ok(Action::Rebalance),
            other => Err(Error::NotFound(format!("Unknown action: {}", other))),
        }
    }
}

/// A write request, shape-checked.
///
/// Parsing only checks that the body has the right form. Whether the ids exist and the
/// values are acceptable is decided by the executor against the loaded catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddDevices(Vec<DeviceSpec>),
    RemoveDevices(Vec<DeviceId>),
    SetWeight(BTreeMap<DeviceId, f64>),
    SetMeta(BTreeMap<DeviceId, String>),
    Rebalance,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::AddDevices(_) => "add",
            Mutation::RemoveDevices(_) => "remove",
            Mutation::SetWeight(_) => "weight",
            Mutation::SetMeta(_) => "meta",
            Mutation::Rebalance => "rebalance",
        }
    }

    /// Builds the mutation for a write `action` from its JSON body.
    ///
    /// `Action::Search` is not a mutation and is rejected here.
    pub fn parse(action: Action, body: &Value) -> Result<Self> {
        match action {
            Action::Add => parse_add(body),
            Action::Remove => parse_remove(body),
            Action::Weight => parse_weight(body),
            Action::Meta => parse_meta(body),
            Action::Rebalance => Ok(Mutation::Rebalance),
            Action::Search => Err(malformed()),
        }
    }
}

fn malformed() -> Error {
    Error::bad_request(MSG_MALFORMED_REQUEST)
}

fn devices_field(body: &Value) -> Result<&Value> {
    body.get("devices").ok_or_else(malformed)
}

fn parse_add(body: &Value) -> Result<Mutation> {
    let entries = devices_field(body)?.as_array().ok_or_else(malformed)?;
    if entries.is_empty() {
        return Err(malformed());
    }

    let specs = entries
        .iter()
        .map(|entry| -> Result<DeviceSpec> {
            let field = |name: &str| entry.get(name).ok_or_else(malformed);
            Ok(DeviceSpec {
                zone: integer(field("zone")?)?,
                ip: text(field("ip")?)?,
                port: integer(field("port")?)?,
                device: text(field("device")?)?,
                weight: real(field("weight")?)?,
                meta: match entry.get("meta") {
                    None | Some(Value::Null) => String::new(),
                    Some(value) => scalar(value)?,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if specs.iter().any(|s| s.ip.is_empty() || s.device.is_empty()) {
        return Err(malformed());
    }
    Ok(Mutation::AddDevices(specs))
}

fn parse_remove(body: &Value) -> Result<Mutation> {
    let ids = devices_field(body)?.as_array().ok_or_else(malformed)?;
    if ids.is_empty() {
        return Err(malformed());
    }
    let ids = ids
        .iter()
        .map(|v| integer(v).map(DeviceId))
        .collect::<Result<Vec<_>>>()?;
    Ok(Mutation::RemoveDevices(ids))
}

fn parse_weight(body: &Value) -> Result<Mutation> {
    parse_id_map(body, real).map(Mutation::SetWeight)
}

fn parse_meta(body: &Value) -> Result<Mutation> {
    parse_id_map(body, scalar).map(Mutation::SetMeta)
}

/// `{"devices": {"<id>": value, ...}}`. Two keys naming the same id (`"1"` and `"01"`) are
/// rejected rather than silently merged.
fn parse_id_map<T>(
    body: &Value,
    value_of: impl Fn(&Value) -> Result<T>,
) -> Result<BTreeMap<DeviceId, T>> {
    let entries = devices_field(body)?.as_object().ok_or_else(malformed)?;
    if entries.is_empty() {
        return Err(malformed());
    }

    let mut parsed = BTreeMap::new();
    for (key, value) in entries {
        let id = key
            .trim()
            .parse::<u32>()
            .map(DeviceId)
            .map_err(|_| Error::bad_request(format!("Invalid device id: {}", key)))?;
        let value = value_of(value)?;
        if parsed.insert(id, value).is_some() {
            return Err(Error::bad_request(format!("Device {} listed twice", id)));
        }
    }
    Ok(parsed)
}

fn integer<T: TryFrom<u64>>(value: &Value) -> Result<T> {
    let n = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    n.and_then(|n| T::try_from(n).ok()).ok_or_else(malformed)
}

fn real(value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::bad_request(format!("Invalid weight: {}", value)))
}

fn text(value: &Value) -> Result<String> {
    value.as_str().map(str::to_string).ok_or_else(malformed)
}

/// Strings, numbers and booleans, rendered as text.
fn scalar(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::bad_request(format!("Invalid meta value: {}", value))),
    }
}

// --- Data Transfer Objects ---

/// Body of `POST /ringbuilder/<category>/search`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hash: VersionToken,
    pub devices: Vec<Device>,
}

/// Every slot of the catalog, empty ones as `null`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub hash: VersionToken,
    pub devices: Vec<Option<Device>>,
}

/// Acknowledgment of an add/remove/weight/meta write.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub hash: VersionToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RebalanceResponse {
    pub hash: VersionToken,
    pub reassigned: usize,
    pub balance: f64,
    pub partitions: usize,
}
