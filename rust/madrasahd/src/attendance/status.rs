use super::error::{AttendanceError, AttendanceResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 4] = [
        AttendanceStatus::Present,
        AttendanceStatus::Absent,
        AttendanceStatus::Late,
        AttendanceStatus::Excused,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Late => "LATE",
            AttendanceStatus::Excused => "EXCUSED",
        }
    }

    /// Accepts the stored spelling and the lower-case form the dashboards send.
    /// `UNMARKED` is rejected: it is a view placeholder and is never written.
    pub fn parse(raw: &str) -> AttendanceResult<Self> {
        let t = raw.trim();
        match t.to_ascii_uppercase().as_str() {
            "PRESENT" => Ok(AttendanceStatus::Present),
            "ABSENT" => Ok(AttendanceStatus::Absent),
            "LATE" => Ok(AttendanceStatus::Late),
            "EXCUSED" => Ok(AttendanceStatus::Excused),
            "UNMARKED" => Err(AttendanceError::validation(
                "UNMARKED cannot be stored; omit the record instead",
            )),
            _ => Err(AttendanceError::validation_with(
                "status must be one of: PRESENT, ABSENT, LATE, EXCUSED",
                json!({ "status": t }),
            )),
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cell on a day sheet. `Unmarked` means no record exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterMark {
    Unmarked,
    Marked(AttendanceStatus),
}

impl RosterMark {
    pub fn as_str(self) -> &'static str {
        match self {
            RosterMark::Unmarked => "UNMARKED",
            RosterMark::Marked(s) => s.as_str(),
        }
    }
}

impl From<Option<AttendanceStatus>> for RosterMark {
    fn from(v: Option<AttendanceStatus>) -> Self {
        match v {
            Some(s) => RosterMark::Marked(s),
            None => RosterMark::Unmarked,
        }
    }
}

impl Serialize for RosterMark {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub const DEFAULT_EXCUSED_WEIGHT: f64 = 1.0;
pub const DEFAULT_STREAK_MAX_GAP_DAYS: i64 = 7;
pub const DEFAULT_LOW_RATE_THRESHOLD: u32 = 75;

/// How statuses feed the attendance rate and the streak.
///
/// PRESENT and LATE always carry full weight and ABSENT carries none.
/// EXCUSED carries `excused_weight`: the admin dashboard counted it as
/// present (1.0) while the parent dashboard ignored it (0.0), so the
/// weight is workspace configuration rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresencePolicy {
    pub excused_weight: f64,
    pub streak_max_gap_days: i64,
    pub low_rate_threshold: u32,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            excused_weight: DEFAULT_EXCUSED_WEIGHT,
            streak_max_gap_days: DEFAULT_STREAK_MAX_GAP_DAYS,
            low_rate_threshold: DEFAULT_LOW_RATE_THRESHOLD,
        }
    }
}

impl PresencePolicy {
    pub fn validate(&self) -> AttendanceResult<()> {
        if !self.excused_weight.is_finite() || !(0.0..=1.0).contains(&self.excused_weight) {
            return Err(AttendanceError::validation_with(
                "excusedWeight must be between 0 and 1",
                json!({ "excusedWeight": self.excused_weight }),
            ));
        }
        if self.streak_max_gap_days < 1 {
            return Err(AttendanceError::validation_with(
                "streakMaxGapDays must be >= 1",
                json!({ "streakMaxGapDays": self.streak_max_gap_days }),
            ));
        }
        if self.low_rate_threshold > 100 {
            return Err(AttendanceError::validation_with(
                "lowRateThreshold must be between 0 and 100",
                json!({ "lowRateThreshold": self.low_rate_threshold }),
            ));
        }
        Ok(())
    }

    pub fn presence_weight(&self, status: AttendanceStatus) -> f64 {
        match status {
            AttendanceStatus::Present | AttendanceStatus::Late => 1.0,
            AttendanceStatus::Absent => 0.0,
            AttendanceStatus::Excused => self.excused_weight,
        }
    }

    pub fn counts_toward_presence(&self, status: AttendanceStatus) -> bool {
        self.presence_weight(status) > 0.0
    }
}
