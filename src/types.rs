use chrono::Utc;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use ulid::Ulid;

/// Version string stamped on every backup and export snapshot.
pub const SNAPSHOT_VERSION: &str = "1.0.0";

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Unknown {}: {s}", stringify!($name))),
                }
            }
        }
    };
}

string_enum!(
    /// The four collections held by the store.
    EntityKind {
        Plan => "plan",
        Project => "project",
        Task => "task",
        Record => "record",
    }
);

string_enum!(PlanCategory {
    Career => "career",
    Skill => "skill",
    Life => "life",
    Creative => "creative",
});

string_enum!(PlanStatus {
    Draft => "draft",
    Active => "active",
    Completed => "completed",
    Archived => "archived",
});

string_enum!(ProjectCategory {
    Work => "work",
    Personal => "personal",
    Study => "study",
    Creative => "creative",
});

string_enum!(ProjectStatus {
    Planning => "planning",
    Active => "active",
    Completed => "completed",
    Paused => "paused",
});

string_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
});

string_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in-progress",
    Completed => "completed",
    Blocked => "blocked",
});

impl TaskStatus {
    /// Next status in the pending → in-progress → completed → blocked cycle.
    pub fn next(self) -> Self {
        match self {
            TaskStatus::Pending => TaskStatus::InProgress,
            TaskStatus::InProgress => TaskStatus::Completed,
            TaskStatus::Completed => TaskStatus::Blocked,
            TaskStatus::Blocked => TaskStatus::Pending,
        }
    }
}

macro_rules! string_enum_default {
    ($($name:ident => $variant:ident),+ $(,)?) => {
        $(
            impl Default for $name {
                fn default() -> Self {
                    $name::$variant
                }
            }
        )+
    };
}

string_enum_default!(
    PlanCategory => Career,
    PlanStatus => Draft,
    ProjectCategory => Work,
    ProjectStatus => Planning,
    Priority => Medium,
    TaskStatus => Pending,
);

// Stored and imported entities are coerced field by field: a value of the
// wrong shape becomes the field's default instead of failing the collection.

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

fn lenient_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// A collection that is not an array reads as empty; members that are not
/// objects are skipped.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    let mut entities = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value(item) {
            Ok(entity) => entities.push(entity),
            Err(e) => warn!(error = %e, "skipping unreadable entity"),
        }
    }
    Ok(entities)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub category: PlanCategory,
    #[serde(default, deserialize_with = "lenient")]
    pub status: PlanStatus,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    /// Cover image as a data URI.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    /// Weak reference to `Plan::id`; empty when unassigned.
    #[serde(default, deserialize_with = "lenient_string")]
    pub plan_id: String,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub category: ProjectCategory,
    #[serde(default, deserialize_with = "lenient")]
    pub status: ProjectStatus,
    #[serde(default, deserialize_with = "lenient")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub project_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "lenient")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_size")]
    pub size: u64,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub mime_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub upload_date: String,
    /// URL or local object path. Not portable, so never exported.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub is_default: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// The portable subset `{id, name, size, type, uploadDate}`.
    pub fn to_exported(&self) -> Record {
        Record {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            upload_date: self.upload_date.clone(),
            path: None,
            is_default: false,
            extra: Map::new(),
        }
    }
}

/// The four collections, in insertion order. This is the shape kept in
/// local storage and sent to the remote save endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default, deserialize_with = "lenient_list")]
    pub plans: Vec<Plan>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub projects: Vec<Project>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub tasks: Vec<Task>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub records: Vec<Record>,
}

impl StoreData {
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
            && self.projects.is_empty()
            && self.tasks.is_empty()
            && self.records.is_empty()
    }
}

/// Full persisted state at one instant, as written to backup files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub data: StoreData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Snapshot {
    /// Wrap `data` with the current timestamp and the snapshot version.
    pub fn stamped(data: StoreData) -> Self {
        Self {
            data,
            timestamp: Some(now_rfc3339()),
            version: Some(SNAPSHOT_VERSION.to_string()),
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque id of the form `id_<unix-millis>_<9 base36 chars>`.
///
/// Unique enough for a single user; nothing checks for collisions.
pub fn generate_id() -> String {
    let mut entropy = Ulid::new().random();
    let mut suffix = String::with_capacity(9);
    for _ in 0..9 {
        suffix.push(BASE36[(entropy % 36) as usize] as char);
        entropy /= 36;
    }
    format!("id_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_status_wire_names() {
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            json!("in-progress")
        );
        assert_eq!("IN-PROGRESS".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_cycle_wraps() {
        let mut status = TaskStatus::Pending;
        for _ in 0..4 {
            status = status.next();
        }
        assert_eq!(status, TaskStatus::Pending);
        assert_eq!(TaskStatus::Completed.next(), TaskStatus::Blocked);
    }

    #[test]
    fn test_project_accepts_null_plan_id_and_keeps_unknown_fields() {
        let project: Project = serde_json::from_value(json!({
            "id": "p1",
            "name": "Site",
            "planId": null,
            "category": "personal",
            "status": "active",
            "priority": "high",
            "createdAt": "2025-10-05T00:00:00.000Z",
            "color": "#ff0000"
        }))
        .unwrap();
        assert_eq!(project.plan_id, "");
        assert_eq!(project.extra.get("color"), Some(&json!("#ff0000")));

        let back = serde_json::to_value(&project).unwrap();
        assert_eq!(back["color"], json!("#ff0000"));
        assert_eq!(back["planId"], json!(""));
    }

    #[test]
    fn test_partial_entities_are_coerced_not_rejected() {
        let data: StoreData = serde_json::from_value(json!({
            "plans": [{ "id": "a", "name": "x" }],
            "projects": [{ "id": 7, "name": "J", "status": "exploding", "priority": null }],
            "tasks": "not-a-list",
            "records": [
                { "id": "r1", "name": "scan.png", "size": "2048", "uploadDate": "2025-10-05" },
                { "id": "r2", "name": "no-size.pdf", "type": "application/pdf" },
                42,
                null
            ]
        }))
        .unwrap();

        assert_eq!(data.plans[0].id, "a");
        assert_eq!(data.plans[0].category, PlanCategory::Career);
        assert_eq!(data.plans[0].status, PlanStatus::Draft);
        assert_eq!(data.projects[0].id, "7");
        assert_eq!(data.projects[0].status, ProjectStatus::Planning);
        assert_eq!(data.projects[0].priority, Priority::Medium);
        assert!(data.tasks.is_empty());
        assert_eq!(data.records.len(), 2);
        assert_eq!(data.records[0].size, 2048);
        assert_eq!(data.records[1].size, 0);
        assert_eq!(data.records[1].upload_date, "");
    }

    #[test]
    fn test_record_type_field_and_export_subset() {
        let record: Record = serde_json::from_value(json!({
            "id": "r1",
            "name": "notes.pdf",
            "size": 42,
            "type": "application/pdf",
            "uploadDate": "2025-10-05T00:00:00.000Z",
            "path": "./store/notes.pdf",
            "isDefault": true
        }))
        .unwrap();
        assert_eq!(record.mime_type, "application/pdf");
        assert!(record.is_default);

        let exported = serde_json::to_value(record.to_exported()).unwrap();
        assert_eq!(
            exported,
            json!({
                "id": "r1",
                "name": "notes.pdf",
                "size": 42,
                "type": "application/pdf",
                "uploadDate": "2025-10-05T00:00:00.000Z"
            })
        );
    }

    #[test]
    fn test_generated_ids_have_expected_shape() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        let parts: Vec<&str> = a.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "id");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn test_snapshot_flattens_collections() {
        let snapshot = Snapshot::stamped(StoreData::default());
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["plans"], json!([]));
        assert_eq!(value["version"], json!("1.0.0"));
        assert!(value["timestamp"].is_string());
    }
}
