use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Safety preconditions, listed in pre-run evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterlockType {
    EmergencyStop,
    DoorOpen,
    TankLevelLow,
    EcOutOfBounds,
    PhOutOfBounds,
    Co2Lockout,
    TelemetryStale,
    FlowAnomaly,
}

impl InterlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterlockType::EmergencyStop => "Emergency Stop",
            InterlockType::DoorOpen => "Door Open",
            InterlockType::TankLevelLow => "Tank Level Low",
            InterlockType::EcOutOfBounds => "EC Out of Bounds",
            InterlockType::PhOutOfBounds => "pH Out of Bounds",
            InterlockType::Co2Lockout => "CO2 Lockout",
            InterlockType::TelemetryStale => "Telemetry Stale",
            InterlockType::FlowAnomaly => "Flow Anomaly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' ', '_'], "").as_str() {
            "emergencystop" | "estop" => Some(InterlockType::EmergencyStop),
            "dooropen" | "door" => Some(InterlockType::DoorOpen),
            "tanklevellow" | "tanklevel" => Some(InterlockType::TankLevelLow),
            "ecoutofbounds" | "ec" => Some(InterlockType::EcOutOfBounds),
            "phoutofbounds" | "ph" => Some(InterlockType::PhOutOfBounds),
            "co2lockout" | "co2" => Some(InterlockType::Co2Lockout),
            "telemetrystale" | "telemetry" => Some(InterlockType::TelemetryStale),
            "flowanomaly" => Some(InterlockType::FlowAnomaly),
            _ => None,
        }
    }

    pub fn all() -> &'static [InterlockType] {
        &[
            InterlockType::EmergencyStop,
            InterlockType::DoorOpen,
            InterlockType::TankLevelLow,
            InterlockType::EcOutOfBounds,
            InterlockType::PhOutOfBounds,
            InterlockType::Co2Lockout,
            InterlockType::TelemetryStale,
            InterlockType::FlowAnomaly,
        ]
    }

    /// Tripped interlocks of these types stay active until an operator clears them.
    pub fn requires_acknowledgment(&self) -> bool {
        matches!(
            self,
            InterlockType::EmergencyStop
                | InterlockType::EcOutOfBounds
                | InterlockType::PhOutOfBounds
                | InterlockType::FlowAnomaly
        )
    }
}

impl std::fmt::Display for InterlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterlockVerdict {
    Allowed,
    AllowedWithWarnings(Vec<String>),
    Blocked {
        interlock_type: InterlockType,
        reason: String,
    },
}

impl InterlockVerdict {
    pub fn blocked(interlock_type: InterlockType, reason: impl Into<String>) -> Self {
        InterlockVerdict::Blocked {
            interlock_type,
            reason: reason.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        InterlockVerdict::AllowedWithWarnings(vec![message.into()])
    }

    pub fn is_allowed(&self) -> bool {
        !self.is_blocked()
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, InterlockVerdict::Blocked { .. })
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            InterlockVerdict::AllowedWithWarnings(w) => w,
            _ => &[],
        }
    }
}

/// Audit record of an interlock trip. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterlockEvent {
    pub event_id: Uuid,
    pub site_id: String,
    pub interlock_type: InterlockType,
    pub details: String,
    pub run_id: Option<String>,
    pub group_id: Option<String>,
    pub is_active: bool,
    pub requires_acknowledgment: bool,
    pub trip_timestamp: DateTime<Utc>,
    pub cleared_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub clear_notes: Option<String>,
}

impl InterlockEvent {
    pub fn trip(
        site_id: impl Into<String>,
        interlock_type: InterlockType,
        details: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            site_id: site_id.into(),
            interlock_type,
            details: details.into(),
            run_id: None,
            group_id: None,
            is_active: true,
            requires_acknowledgment: interlock_type.requires_acknowledgment(),
            trip_timestamp: at,
            cleared_by: None,
            cleared_at: None,
            clear_notes: None,
        }
    }

    pub fn with_run(mut self, run_id: Option<String>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_group(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    /// Tripped and waiting for an operator before the gate can open again.
    pub fn awaiting_acknowledgment(&self) -> bool {
        self.is_active && self.requires_acknowledgment
    }

    pub fn clear(mut self, cleared_by: &str, notes: Option<String>, at: DateTime<Utc>) -> Self {
        self.is_active = false;
        self.cleared_by = Some(cleared_by.to_string());
        self.cleared_at = Some(at);
        self.clear_notes = notes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledgment_types() {
        assert!(InterlockType::EmergencyStop.requires_acknowledgment());
        assert!(InterlockType::EcOutOfBounds.requires_acknowledgment());
        assert!(InterlockType::PhOutOfBounds.requires_acknowledgment());
        assert!(InterlockType::FlowAnomaly.requires_acknowledgment());
        assert!(!InterlockType::DoorOpen.requires_acknowledgment());
        assert!(!InterlockType::TankLevelLow.requires_acknowledgment());
        assert!(!InterlockType::Co2Lockout.requires_acknowledgment());
        assert!(!InterlockType::TelemetryStale.requires_acknowledgment());
    }

    #[test]
    fn interlock_type_round_trip() {
        for t in InterlockType::all() {
            let debug_str = format!("{:?}", t);
            assert_eq!(InterlockType::from_str(&debug_str), Some(*t));
        }
        assert_eq!(InterlockType::from_str("e-stop"), Some(InterlockType::EmergencyStop));
        assert_eq!(InterlockType::from_str("valve"), None);
    }

    #[test]
    fn trip_inherits_acknowledgment_requirement() {
        let now = Utc::now();
        let event = InterlockEvent::trip("s1", InterlockType::PhOutOfBounds, "pH 8.1", now);
        assert!(event.is_active);
        assert!(event.awaiting_acknowledgment());

        let cleared = event.clear("alice", Some("recalibrated sensor".into()), now);
        assert!(!cleared.is_active);
        assert_eq!(cleared.cleared_by.as_deref(), Some("alice"));
        assert!(!cleared.awaiting_acknowledgment());
    }

    #[test]
    fn verdict_helpers() {
        let v = InterlockVerdict::warning("Tank level low");
        assert!(v.is_allowed());
        assert_eq!(v.warnings().len(), 1);

        let v = InterlockVerdict::blocked(InterlockType::DoorOpen, "Door is open");
        assert!(v.is_blocked());
        assert!(v.warnings().is_empty());
    }
}
