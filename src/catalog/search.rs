//! Device search values.
//!
//! Syntax: `[d<id>][z<zone>][-][<ip>|[<ipv6>]][:<port>][/<device>][_<meta>]`, for example
//! `z1-10.0.0.1:6000/sdb1_rack3`. Every component present must match; `meta` matches as a
//! substring, everything else exactly. An empty value matches every device.

use super::types::{Catalog, Device, DeviceId};
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

static SEARCH_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^(?:d(\d+))?(?:z(\d+))?-?(?:(\d[\d.]*)|\[([0-9A-Fa-f:.]+)\])?(?::(\d+))?(?:/([^_]*))?(?:_(.*))?$",
    )
    .expect("search value regex compiles")
});

#[derive(Debug, thiserror::Error)]
#[error("Invalid search term")]
pub struct InvalidSearchValue(pub String);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceQuery {
    pub id: Option<DeviceId>,
    pub zone: Option<u32>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub device: Option<String>,
    pub meta: Option<String>,
}

impl FromStr for DeviceQuery {
    type Err = InvalidSearchValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSearchValue(value.to_string());
        let caps = SEARCH_VALUE.captures(value).ok_or_else(invalid)?;

        let number = |idx: usize| -> Result<Option<u64>, InvalidSearchValue> {
            caps.get(idx)
                .map(|m| m.as_str().parse::<u64>().map_err(|_| invalid()))
                .transpose()
        };

        let id = number(1)?
            .map(|v| u32::try_from(v).map(DeviceId).map_err(|_| invalid()))
            .transpose()?;
        let zone = number(2)?
            .map(|v| u32::try_from(v).map_err(|_| invalid()))
            .transpose()?;
        let port = number(5)?
            .map(|v| u16::try_from(v).map_err(|_| invalid()))
            .transpose()?;
        let ip = caps
            .get(3)
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string());

        Ok(DeviceQuery {
            id,
            zone,
            ip,
            port,
            device: caps.get(6).map(|m| m.as_str().to_string()),
            meta: caps.get(7).map(|m| m.as_str().to_string()),
        })
    }
}

impl DeviceQuery {
    pub fn matches(&self, dev: &Device) -> bool {
        self.id.is_none_or(|id| dev.id == id)
            && self.zone.is_none_or(|zone| dev.zone == zone)
            && self.ip.as_deref().is_none_or(|ip| dev.ip == ip)
            && self.port.is_none_or(|port| dev.port == port)
            && self.device.as_deref().is_none_or(|name| dev.device == name)
            && self.meta.as_deref().is_none_or(|meta| dev.meta.contains(meta))
    }
}

/// Devices of `catalog` matching `query`, in id order.
pub fn search_devices(catalog: &Catalog, query: &DeviceQuery) -> Vec<Device> {
    catalog
        .live_devices()
        .filter(|dev| query.matches(dev))
        .cloned()
        .collect()
}
