//! Identifier generation.
//!
//! Permanent ids are v4 UUIDs. Records created offline get a temporary id of
//! the form `{prefix}_{deviceId}_{millis}_{random}` which embeds the device
//! that created it; the remote store assigns the permanent id on first sync.

use std::fmt;
use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::now_millis;

/// Prefix used for temporary patient ids.
pub const PATIENT_PREFIX: &str = "patient_temp";
/// Prefix used for temporary form ids.
pub const FORM_PREFIX: &str = "form_temp";

fn temporary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<prefix>[A-Za-z][A-Za-z0-9]*(?:_[A-Za-z][A-Za-z0-9]*)*)_(?P<device>device_[0-9a-f]{12})_(?P<ts>\d{1,16})_(?P<rand>[0-9a-f]{8})$",
        )
        .expect("valid temporary id regex")
    })
}

fn device_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^device_[0-9a-f]{12}$").expect("valid device id regex"))
}

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buffer);
    hex::encode(buffer)
}

/// Generate a random v4 UUID string from the OS entropy source.
pub fn generate_secure_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Stable per-installation device identifier (`device_` + 12 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh random device id.
    pub fn generate() -> Self {
        Self(format!("device_{}", random_hex(6)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if device_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidInput(format!("invalid device id: {s}")))
        }
    }
}

/// Components of a temporary id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryId {
    pub prefix: String,
    pub device_id: DeviceId,
    /// Creation time (Unix ms)
    pub created_at: i64,
    pub random: String,
}

/// Issues temporary ids for one device.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    device_id: DeviceId,
}

impl IdGenerator {
    pub const fn new(device_id: DeviceId) -> Self {
        Self { device_id }
    }

    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// `{prefix}_{deviceId}_{millis}_{8 hex}`
    pub fn new_id(&self, prefix: &str) -> Result<String> {
        let valid_prefix = prefix.split('_').all(|part| {
            part.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && part.chars().all(|c| c.is_ascii_alphanumeric())
        });
        if !valid_prefix {
            return Err(Error::InvalidInput(format!("invalid id prefix: {prefix}")));
        }
        Ok(self.scoped(prefix))
    }

    pub fn temp_patient_id(&self) -> String {
        self.scoped(PATIENT_PREFIX)
    }

    pub fn temp_form_id(&self) -> String {
        self.scoped(FORM_PREFIX)
    }

    fn scoped(&self, prefix: &str) -> String {
        format!(
            "{prefix}_{}_{}_{}",
            self.device_id,
            now_millis(),
            random_hex(4)
        )
    }
}

/// Whether `id` has the temporary id shape.
pub fn is_temporary(id: &str) -> bool {
    temporary_pattern().is_match(id)
}

/// Split a temporary id into its components.
pub fn parse_temporary(id: &str) -> Option<TemporaryId> {
    let captures = temporary_pattern().captures(id)?;
    Some(TemporaryId {
        prefix: captures["prefix"].to_string(),
        device_id: DeviceId(captures["device"].to_string()),
        created_at: captures["ts"].parse().ok()?,
        random: captures["rand"].to_string(),
    })
}

/// Whether `id` is a usable entity id: a temporary id, a UUID, or a remote
/// document id (alphanumeric plus `-`/`_`, at most 128 chars).
pub fn is_valid_id(id: &str) -> bool {
    if is_temporary(id) || uuid::Uuid::parse_str(id).is_ok() {
        return true;
    }
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
