use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a device inside one catalog.
///
/// The id doubles as the slot index in [`Catalog::devices`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of independently locked resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Account,
    Container,
    Object,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Account, Category::Container, Category::Object];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Account => "account",
            Category::Container => "container",
            Category::Object => "object",
        }
    }

    /// File name of the mutable catalog.
    pub fn builder_file(&self) -> String {
        format!("{}.builder", self.as_str())
    }

    /// File name of the published ring.
    pub fn ring_file(&self) -> String {
        format!("{}.ring.gz", self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Category::Account),
            "container" => Ok(Category::Container),
            "object" => Ok(Category::Object),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

/// One storage unit of the ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub device: String,
    pub weight: f64,
    pub meta: String,
    /// Set by a removal; the slot is emptied by the next accepted rebalance.
    #[serde(default)]
    pub removed: bool,
}

impl Device {
    /// Identity used for duplicate detection, independent of the numeric id.
    pub fn identity(&self) -> (&str, u16, &str) {
        (&self.ip, self.port, &self.device)
    }
}

/// A device as submitted by a client, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSpec {
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub device: String,
    pub weight: f64,
    pub meta: String,
}

impl DeviceSpec {
    pub fn identity(&self) -> (&str, u16, &str) {
        (&self.ip, self.port, &self.device)
    }

    pub fn into_device(self, id: DeviceId) -> Device {
        Device {
            id,
            zone: self.zone,
            ip: self.ip,
            port: self.port,
            device: self.device,
            weight: self.weight,
            meta: self.meta,
            removed: false,
        }
    }
}

/// Largest partition power a ring can use: partitions are addressed by the top bits of a
/// 32-bit hash.
pub const MAX_PART_POWER: u8 = 32;

/// The mutable resource: device slots plus the parameters and state of its ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    pub category: Category,
    pub part_power: u8,
    pub replicas: usize,
    pub min_part_hours: u32,
    /// Balance score recorded by the last accepted rebalance.
    pub balance: f64,
    pub devs_changed: bool,
    pub devices: Vec<Option<Device>>,
    /// `assignment[replica][partition]` is the device holding that replica.
    #[serde(default)]
    pub assignment: Vec<Vec<Option<DeviceId>>>,
    /// Seconds since epoch of the last move of each partition.
    #[serde(default)]
    pub last_moved: Vec<u64>,
}

impl Catalog {
    pub fn new(category: Category, part_power: u8, replicas: usize, min_part_hours: u32) -> Self {
        Self {
            category,
            part_power,
            replicas,
            min_part_hours,
            balance: 0.0,
            devs_changed: false,
            devices: Vec::new(),
            assignment: Vec::new(),
            last_moved: Vec::new(),
        }
    }

    pub fn partition_count(&self) -> usize {
        1usize << self.part_power
    }

    pub fn live_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.slot()).and_then(|slot| slot.as_ref())
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id.slot()).and_then(|slot| slot.as_mut())
    }

    pub fn contains_identity(&self, ip: &str, port: u16, device: &str) -> bool {
        self.live_devices().any(|d| d.identity() == (ip, port, device))
    }

    /// Next id to hand out: one past the highest id of a non-empty slot.
    pub fn next_device_id(&self) -> DeviceId {
        self.live_devices()
            .map(|d| d.id.0 + 1)
            .max()
            .map(DeviceId)
            .unwrap_or(DeviceId(0))
    }

    /// Places `device` in the slot matching its id, growing the slot table as needed.
    pub fn insert_device(&mut self, device: Device) {
        let slot = device.id.slot();
        if self.devices.len() <= slot {
            self.devices.resize(slot + 1, None);
        }
        self.devices[slot] = Some(device);
    }

    /// Deterministic on-disk encoding.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decodes a catalog file, rejecting a `part_power` outside `1..=MAX_PART_POWER`.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        let catalog: Self = serde_json::from_slice(bytes)?;
        if !(1..=MAX_PART_POWER).contains(&catalog.part_power) {
            return Err(serde::de::Error::custom(format!(
                "part_power {} is outside 1..={}",
                catalog.part_power, MAX_PART_POWER
            )));
        }
        Ok(catalog)
    }
}
