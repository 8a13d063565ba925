//! Typed entity records for the control core.
//!
//! Rather than an untyped attribute dictionary reflected into SQL at save
//! time, each entity here is a plain record with an explicit field list; the
//! `Store` (see `db.rs`) owns the record ⇄ row codec instead of the record
//! itself.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::GardenError;

/// A microcontroller board's firmware-reported identity, exactly as
/// `uuid_response` returns it. Spec §4.2's Establish step and the source
/// (`model.py`) validate only `len == 36`, not that the string parses as an
/// RFC-4122 UUID (the §3 "RFC-4122" note is aspirational; the protocol
/// itself never enforces it, and E2E scenario 1 reports the non-UUID value
/// `"a" * 36`), so this is a validated-length newtype rather than
/// `uuid::Uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlaveId(String);

impl SlaveId {
    pub fn new(raw: impl Into<String>) -> Result<Self, GardenError> {
        let raw = raw.into();
        if raw.len() != 36 {
            return Err(GardenError::ConfigurationFault(format!(
                "slave identity must be exactly 36 characters, got {} ({raw:?})",
                raw.len()
            )));
        }
        Ok(SlaveId(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client account that owns a fleet of slaves. Present only to satisfy the
/// foreign key named in the persistence schema; ownership/auth semantics
/// live entirely in the out-of-scope HTTP surface.
#[derive(Debug, Clone)]
pub struct Client {
    pub uuid: Uuid,
    pub name: String,
}

/// A microcontroller board identified by a firmware-reported UUID.
#[derive(Debug, Clone)]
pub struct Slave {
    pub uuid: SlaveId,
    pub nickname: String,
    pub connected: bool,
    pub last_seen: OffsetDateTime,
}

/// A logical probe addressable on a slave.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub uuid: Uuid,
    pub slave_uuid: SlaveId,
    pub active: bool,
    pub digital: bool,
    pub pin: i32,
    pub driver: String,
    pub measurement_type: String,
}

impl Sensor {
    pub fn pin_type(&self) -> &'static str {
        if self.digital {
            "digital"
        } else {
            "analog"
        }
    }
}

/// A relay output on a slave. `current_state`/`forced`/`last_toggle`/
/// `current_activation` are runtime-only fields never persisted directly;
/// they are reconstructed from `Activation` rows and board responses at
/// startup.
#[derive(Debug, Clone)]
pub struct Relay {
    pub uuid: Uuid,
    pub slave_uuid: SlaveId,
    pub active: bool,
    pub manual: bool,
    pub pin: i32,

    pub current_state: bool,
    pub forced: bool,
    pub last_toggle: Option<Instant>,
    pub current_activation: Option<Uuid>,
}

impl Relay {
    pub fn new(uuid: Uuid, slave_uuid: SlaveId, active: bool, manual: bool, pin: i32) -> Self {
        Self {
            uuid,
            slave_uuid,
            active,
            manual,
            pin,
            current_state: false,
            forced: false,
            last_toggle: None,
            current_activation: None,
        }
    }
}

/// A daily time-of-day window; wraps midnight when `schedule_end < schedule_start`.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub uuid: Uuid,
    pub active: bool,
    pub schedule_start: i32,
    pub schedule_end: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicType {
    And,
    Or,
}

impl LogicType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "and" => Some(LogicType::And),
            "or" => Some(LogicType::Or),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicType::And => "and",
            LogicType::Or => "or",
        }
    }
}

/// The three-valued hysteresis memory per `Element` that prevents chatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HysteresisTrack {
    #[default]
    Unknown,
    Below,
    Latched,
}

/// A rule: schedule-gated, AND/OR combination of per-element hysteresis,
/// limited by its `RuleLimit`s, driving `Consequence`s.
#[derive(Debug, Clone)]
pub struct Rule {
    pub uuid: Uuid,
    pub schedule_uuid: Uuid,
    /// Raw logic type string as stored; `None`/unrecognised values are a
    /// `ConfigurationFault` and make the rule evaluate to false.
    pub logic_type: String,

    pub element_tracks: HashMap<Uuid, HysteresisTrack>,
    pub current_activation: Option<Uuid>,
}

impl Rule {
    pub fn logic(&self) -> Option<LogicType> {
        LogicType::parse(&self.logic_type)
    }
}

/// A per-sensor threshold clause with hysteresis (trigger + target).
/// Exactly one of `min_value`/`max_value` is set.
#[derive(Debug, Clone)]
pub struct Element {
    pub uuid: Uuid,
    pub rule_uuid: Uuid,
    pub sensor_uuid: Uuid,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub target_value: f64,
}

/// When the parent rule is active, each referenced active relay is
/// requested on.
#[derive(Debug, Clone)]
pub struct Consequence {
    pub uuid: Uuid,
    pub rule_uuid: Uuid,
    pub relay_uuid: Uuid,
}

/// Forbids the rule from holding active for more than `period` seconds
/// within any trailing `every` seconds.
#[derive(Debug, Clone)]
pub struct RuleLimit {
    pub uuid: Uuid,
    pub rule_uuid: Uuid,
    pub every: i64,
    pub period: i64,
}

/// Exactly one of `Relay`/`Rule` owns a given activation. A tagged variant
/// replaces the source's two nullable columns (`relay_uuid`, `rule_uuid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOwner {
    Relay(Uuid),
    Rule(Uuid),
}

impl ActivationOwner {
    pub fn relay_uuid(&self) -> Option<Uuid> {
        match self {
            ActivationOwner::Relay(u) => Some(*u),
            ActivationOwner::Rule(_) => None,
        }
    }

    pub fn rule_uuid(&self) -> Option<Uuid> {
        match self {
            ActivationOwner::Rule(u) => Some(*u),
            ActivationOwner::Relay(_) => None,
        }
    }
}

/// A persisted interval of "this relay was driven" or "this rule was active".
#[derive(Debug, Clone)]
pub struct Activation {
    pub uuid: Uuid,
    pub owner: ActivationOwner,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub last_update: OffsetDateTime,
}

impl Activation {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Terminate this activation, defaulting the end time to the last
    /// recorded update as the source does for orphaned activations found
    /// at startup.
    pub fn terminate(&mut self, at: Option<OffsetDateTime>) {
        let end = at.unwrap_or(self.last_update);
        self.end_time = Some(end);
        self.last_update = end;
    }
}

/// A single sensor reading. Persisted by surrounding systems; the core's
/// own writes are optional.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub uuid: Uuid,
    pub sensor_uuid: Uuid,
    pub timestamp: OffsetDateTime,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_id_accepts_any_36_char_string_not_just_rfc_4122() {
        // E2E scenario 1 (spec.md §8): a board reports "a" * 36, which is
        // 36 characters but not a parseable RFC-4122 UUID.
        let id = SlaveId::new("a".repeat(36)).unwrap();
        assert_eq!(id.as_str(), "a".repeat(36));
    }

    #[test]
    fn slave_id_rejects_wrong_length() {
        assert!(SlaveId::new("too-short").is_err());
        assert!(SlaveId::new("a".repeat(37)).is_err());
    }

    #[test]
    fn slave_id_accepts_an_actual_uuid_too() {
        assert!(SlaveId::new(Uuid::new_v4().to_string()).is_ok());
    }
}
