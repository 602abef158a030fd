use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::fs;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The identity this gateway presents to the cloud.
///
/// Derived once per process and immutable afterwards. Sources, in order of
/// preference:
/// 1. the hardware address of the first physical network interface,
///    rendered as `0x`-prefixed hex;
/// 2. the systemd machine id, hashed into the same shape;
/// 3. a random v4 UUID, which means a fresh identity every run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn detect() -> Self {
        if let Some(mac) = first_hardware_address() {
            return Self(format!("{mac:#x}"));
        }

        if let Some(id) = machine_id() {
            let mut hasher = DefaultHasher::new();
            id.hash(&mut hasher);
            return Self(format!("{:#x}", hasher.finish()));
        }

        warn!("no stable hardware identifier found, generating a random identity");
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for DeviceId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// The hardware address of the first interface that is not a loopback,
/// read from sysfs. Interface names are sorted so the result is stable
/// across reboots.
fn first_hardware_address() -> Option<u64> {
    let mut interfaces: Vec<PathBuf> = fs::read_dir("/sys/class/net")
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();

    for path in interfaces {
        if path.file_name().is_some_and(|name| name == "lo") {
            continue;
        }

        let Ok(address) = fs::read_to_string(path.join("address")) else {
            continue;
        };

        match parse_hardware_address(address.trim()) {
            Some(0) | None => continue,
            Some(mac) => return Some(mac),
        }
    }

    None
}

fn parse_hardware_address(s: &str) -> Option<u64> {
    let mut value: u64 = 0;
    let mut octets = 0;

    for part in s.split(':') {
        value = (value << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
        octets += 1;
    }

    (octets == 6).then_some(value)
}

fn machine_id() -> Option<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = fs::read_to_string(path) {
            let trimmed = contents.trim();
            if trimmed.len() >= 16 {
                return Some(trimmed.to_owned());
            }
        }
    }

    None
}
