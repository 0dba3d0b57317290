//! Per-table replication configuration.
//!
//! Every replicated table is described by a [`TableConfig`]; the store's
//! generic CRUD surface and the sync adapter are parameterized by it, so a new
//! domain table joins the replication protocol by adding a config (and its
//! DDL), never a new code path.

use serde_json::Value;

/// A JSON object holding a row's column values, keyed by column name.
pub type FieldMap = serde_json::Map<String, Value>;

/// Shape transform applied to a row's field map when it crosses the
/// local/remote boundary.
pub type ShapeHook = fn(&mut FieldMap);

/// Configuration of one replicated table.
#[derive(Clone, Copy)]
pub struct TableConfig {
    /// Table name in the local database.
    pub local_name: &'static str,
    /// Table name on the remote side (usually identical).
    pub remote_name: &'static str,
    /// Column treated as the row id.
    pub primary_key: &'static str,
    /// Whether the remote table carries a `user_id` column and remote queries
    /// must filter by it. The local schema omits `user_id`; the adapter
    /// injects it on push and strips it on pull.
    pub user_scoped: bool,
    /// Whether the local table has a `deleted` tombstone column.
    pub soft_delete: bool,
    /// Append-only tables skip conflict checks, server-delete detection and
    /// deletes entirely.
    pub append_only: bool,
    /// Projection for upserts. `synced` and `deleted` are never sent remotely
    /// and are not listed here.
    pub columns: &'static [&'static str],
    /// Server-side uniqueness key for upserts, e.g. `user_id,summary_date`.
    pub on_conflict: Option<&'static str>,
    /// Purge the local row when the remote rejects its id as malformed
    /// (legacy pre-UUID rows on the health summary table).
    pub evict_on_malformed_id: bool,
    /// Optional shape transform applied to the payload before it is pushed.
    pub local_to_remote: Option<ShapeHook>,
    /// Optional shape transform applied to a remote row before it is stored.
    pub remote_to_local: Option<ShapeHook>,
}

impl TableConfig {
    /// Columns as stored locally: the replicated projection plus the
    /// `synced` flag and, on soft-delete tables, the `deleted` tombstone.
    pub fn local_columns(&self) -> Vec<&'static str> {
        let mut cols: Vec<&'static str> = self.columns.to_vec();
        cols.push("synced");
        if self.soft_delete {
            cols.push("deleted");
        }
        cols
    }
}

impl std::fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableConfig")
            .field("local_name", &self.local_name)
            .field("remote_name", &self.remote_name)
            .field("user_scoped", &self.user_scoped)
            .field("soft_delete", &self.soft_delete)
            .field("append_only", &self.append_only)
            .finish()
    }
}

/// Shared exercise catalogue. Globally readable, not user-scoped, carries a
/// pre-seeded system subset.
pub const EXERCISES: TableConfig = TableConfig {
    local_name: "exercises",
    remote_name: "exercises",
    primary_key: "id",
    user_scoped: false,
    soft_delete: false,
    append_only: false,
    columns: &[
        "id",
        "name",
        "category",
        "muscle_group",
        "equipment",
        "is_system",
        "created_at",
        "updated_at",
    ],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const MEAL_ENTRIES: TableConfig = TableConfig {
    local_name: "meal_entries",
    remote_name: "meal_entries",
    primary_key: "id",
    user_scoped: true,
    soft_delete: true,
    append_only: false,
    columns: &[
        "id",
        "name",
        "calories",
        "protein",
        "carbs",
        "fat",
        "date",
        "logged_at",
        "updated_at",
    ],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const EXERCISE_ENTRIES: TableConfig = TableConfig {
    local_name: "exercise_entries",
    remote_name: "exercise_entries",
    primary_key: "id",
    user_scoped: true,
    soft_delete: true,
    append_only: false,
    columns: &[
        "id",
        "name",
        "duration_minutes",
        "calories_burned",
        "date",
        "logged_at",
        "updated_at",
    ],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

/// One row per (user, day). The composite uniqueness lives on the server as
/// the `on_conflict` key; locally only the active user's rows exist, so the
/// day alone is unique. Legacy installs produced non-UUID ids for this table,
/// hence the malformed-id eviction.
pub const HEALTH_SUMMARIES: TableConfig = TableConfig {
    local_name: "health_summaries",
    remote_name: "health_summaries",
    primary_key: "id",
    user_scoped: true,
    soft_delete: true,
    append_only: false,
    columns: &[
        "id",
        "summary_date",
        "steps",
        "active_calories",
        "resting_heart_rate",
        "sleep_hours",
        "updated_at",
    ],
    on_conflict: Some("user_id,summary_date"),
    evict_on_malformed_id: true,
    local_to_remote: None,
    remote_to_local: None,
};

/// Exactly one row per user.
pub const NUTRITION_TARGETS: TableConfig = TableConfig {
    local_name: "nutrition_targets",
    remote_name: "nutrition_targets",
    primary_key: "id",
    user_scoped: true,
    soft_delete: true,
    append_only: false,
    columns: &["id", "calories", "protein", "carbs", "fat", "updated_at"],
    on_conflict: Some("user_id"),
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

/// Append-only workout event log. The event payload is stored locally as a
/// JSON string and travels as structured JSON remotely.
pub const WORKOUT_EVENTS: TableConfig = TableConfig {
    local_name: "workout_events",
    remote_name: "workout_events",
    primary_key: "id",
    user_scoped: true,
    soft_delete: false,
    append_only: true,
    columns: &["id", "event_type", "payload", "occurred_at", "updated_at"],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: Some(event_payload_to_remote),
    remote_to_local: Some(event_payload_to_local),
};

pub const WORKOUT_SESSIONS: TableConfig = TableConfig {
    local_name: "workout_sessions",
    remote_name: "workout_sessions",
    primary_key: "id",
    user_scoped: true,
    soft_delete: true,
    append_only: false,
    columns: &[
        "id",
        "name",
        "started_at",
        "completed_at",
        "notes",
        "updated_at",
    ],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const SESSION_EXERCISES: TableConfig = TableConfig {
    local_name: "session_exercises",
    remote_name: "session_exercises",
    primary_key: "id",
    user_scoped: false,
    soft_delete: true,
    append_only: false,
    columns: &["id", "session_id", "exercise_id", "sort_order", "updated_at"],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const SESSION_SETS: TableConfig = TableConfig {
    local_name: "session_sets",
    remote_name: "session_sets",
    primary_key: "id",
    user_scoped: false,
    soft_delete: true,
    append_only: false,
    columns: &[
        "id",
        "session_exercise_id",
        "set_number",
        "weight_kg",
        "reps",
        "completed",
        "updated_at",
    ],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const WORKOUT_TEMPLATES: TableConfig = TableConfig {
    local_name: "workout_templates",
    remote_name: "workout_templates",
    primary_key: "id",
    user_scoped: true,
    soft_delete: true,
    append_only: false,
    columns: &["id", "name", "description", "created_at", "updated_at"],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const TEMPLATE_EXERCISES: TableConfig = TableConfig {
    local_name: "template_exercises",
    remote_name: "template_exercises",
    primary_key: "id",
    user_scoped: false,
    soft_delete: true,
    append_only: false,
    columns: &["id", "template_id", "exercise_id", "sort_order", "updated_at"],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

pub const TEMPLATE_SETS: TableConfig = TableConfig {
    local_name: "template_sets",
    remote_name: "template_sets",
    primary_key: "id",
    user_scoped: false,
    soft_delete: true,
    append_only: false,
    columns: &[
        "id",
        "template_exercise_id",
        "set_number",
        "target_weight_kg",
        "target_reps",
        "updated_at",
    ],
    on_conflict: None,
    evict_on_malformed_id: false,
    local_to_remote: None,
    remote_to_local: None,
};

/// Every table that participates in replication, in sync order.
pub fn replicated_tables() -> &'static [TableConfig] {
    &[
        EXERCISES,
        MEAL_ENTRIES,
        EXERCISE_ENTRIES,
        HEALTH_SUMMARIES,
        NUTRITION_TARGETS,
        WORKOUT_EVENTS,
        WORKOUT_SESSIONS,
        SESSION_EXERCISES,
        SESSION_SETS,
        WORKOUT_TEMPLATES,
        TEMPLATE_EXERCISES,
        TEMPLATE_SETS,
    ]
}

/// Look up a replicated table config by its local name.
pub fn table_by_local_name(name: &str) -> Option<&'static TableConfig> {
    replicated_tables().iter().find(|t| t.local_name == name)
}

fn event_payload_to_remote(fields: &mut FieldMap) {
    if let Some(Value::String(raw)) = fields.get("payload") {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            fields.insert("payload".into(), parsed);
        }
    }
}

fn event_payload_to_local(fields: &mut FieldMap) {
    match fields.get("payload") {
        Some(Value::String(_)) | None => {}
        Some(other) => {
            let raw = other.to_string();
            fields.insert("payload".into(), Value::String(raw));
        }
    }
}
