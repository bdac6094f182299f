//! Status subresource types shared by the three CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single status condition. Status is `"True"`, `"False"` or `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: &str, reason: &str, message: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// True when type, status, reason and message all match; the transition
    /// timestamp is ignored so unchanged conditions produce no status write.
    pub fn same_as(&self, other: &Self) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Looks up a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Outcome of the most recent manual run, mirrored into status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualRunStatus {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<String>,
    /// `Started`, `Succeeded`, `Failed` or `Skipped`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_manual_run: Option<ManualRunStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// Concrete cron expression after macro expansion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_revision: Option<String>,
    /// Name of the most recently observed Job for this Schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_job_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_manual_run: Option<ManualRunStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_condition_matches_by_type() {
        let conditions = vec![
            Condition::new("Ready", "True", "Ready", "ok"),
            Condition::new("AuthValid", "False", "MissingSecret", "no secret"),
        ];
        let found = find_condition(&conditions, "AuthValid");
        assert_eq!(found.map(|c| c.reason.as_str()), Some("MissingSecret"));
        assert!(find_condition(&conditions, "CloneReady").is_none());
    }

    #[test]
    fn same_as_ignores_transition_time() {
        let mut a = Condition::new("Ready", "True", "Ready", "ok");
        let b = Condition::new("Ready", "True", "Ready", "ok");
        a.last_transition_time = Some("2020-01-01T00:00:00Z".to_string());
        assert!(a.same_as(&b));
    }
}
