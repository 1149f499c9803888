use super::aggregate::AttendanceSummary;
use super::error::{AttendanceError, AttendanceResult};
use super::status::PresencePolicy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyReason {
    NewlyAbsent,
    LowAttendance,
    Absent,
}

impl NotifyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyReason::NewlyAbsent => "NEWLY_ABSENT",
            NotifyReason::LowAttendance => "LOW_ATTENDANCE",
            NotifyReason::Absent => "ABSENT",
        }
    }
}

/// `Transition` reports only changes between the two snapshots, so saving
/// the same sheet twice notifies once. `Snapshot` reports every entity that
/// currently has absences, matching the dashboard's "Notify Absent (N)".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    #[default]
    Transition,
    Snapshot,
}

impl NotifyMode {
    pub fn parse(raw: Option<&str>) -> AttendanceResult<Self> {
        match raw.map(str::trim) {
            None | Some("") | Some("transition") => Ok(NotifyMode::Transition),
            Some("snapshot") => Ok(NotifyMode::Snapshot),
            Some(other) => Err(AttendanceError::validation_with(
                "mode must be one of: transition, snapshot",
                json!({ "mode": other }),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyTarget {
    pub entity_id: String,
    pub reason: NotifyReason,
}

pub fn compute_notify_targets(
    before: &[AttendanceSummary],
    after: &[AttendanceSummary],
    policy: &PresencePolicy,
    mode: NotifyMode,
) -> Vec<NotifyTarget> {
    let mut targets = Vec::new();
    match mode {
        NotifyMode::Snapshot => {
            for s in after {
                if s.absent > 0 {
                    targets.push(NotifyTarget {
                        entity_id: s.entity_id.clone(),
                        reason: NotifyReason::Absent,
                    });
                }
            }
        }
        NotifyMode::Transition => {
            let prior: HashMap<&str, &AttendanceSummary> =
                before.iter().map(|s| (s.entity_id.as_str(), s)).collect();
            for s in after {
                let prev = prior.get(s.entity_id.as_str()).copied();
                let prev_absent = prev.map(|p| p.absent).unwrap_or(0);
                if s.absent > prev_absent {
                    targets.push(NotifyTarget {
                        entity_id: s.entity_id.clone(),
                        reason: NotifyReason::NewlyAbsent,
                    });
                }
                // Only a drop from a known rate counts; a first record is not a fall.
                if let Some(p) = prev {
                    let threshold = policy.low_rate_threshold;
                    if p.total_classes > 0
                        && p.attendance_rate >= threshold
                        && s.total_classes > 0
                        && s.attendance_rate < threshold
                    {
                        targets.push(NotifyTarget {
                            entity_id: s.entity_id.clone(),
                            reason: NotifyReason::LowAttendance,
                        });
                    }
                }
            }
        }
    }
    targets
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub notification_id: String,
}

/// Messaging collaborator.
pub trait Notifier {
    fn notify(&self, entity_id: &str, reason: NotifyReason) -> AttendanceResult<Ack>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    pub entity_id: String,
    pub reason: NotifyReason,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub sent: Vec<Ack>,
    pub failed: Vec<DispatchFailure>,
}

/// Sends each target independently; a failed send is recorded and skipped.
pub fn dispatch<N: Notifier + ?Sized>(notifier: &N, targets: &[NotifyTarget]) -> DispatchReport {
    let mut report = DispatchReport::default();
    for t in targets {
        match notifier.notify(&t.entity_id, t.reason) {
            Ok(ack) => report.sent.push(ack),
            Err(e) => {
                tracing::warn!(
                    entity_id = %t.entity_id,
                    reason = t.reason.as_str(),
                    error = %e,
                    "notification dispatch failed"
                );
                report.failed.push(DispatchFailure {
                    entity_id: t.entity_id.clone(),
                    reason: t.reason,
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    report
}
