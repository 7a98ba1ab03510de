use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrideError};

/// The three entity collections the engine mirrors between memory,
/// the durable cache, and the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tasks,
    Goals,
    Integrations,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Tasks, Self::Goals, Self::Integrations];

    #[must_use]
    pub fn partition(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Goals => "goals",
            Self::Integrations => "integrations",
        }
    }

    /// Fixed key of the quick-access snapshot blob for this collection.
    #[must_use]
    pub fn blob_key(self) -> &'static str {
        match self {
            Self::Tasks => "snapshot:tasks",
            Self::Goals => "snapshot:goals",
            Self::Integrations => "snapshot:integrations",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.partition())
    }
}

/// Shared shape of the cached entities. Collections key by `id`; the store
/// refreshes `updated_at` through `touch` on every partial update.
pub trait Entity:
    Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn touch(&mut self, now: DateTime<Utc>);
    fn validate(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            notes: None,
            done: false,
            due_date: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Tasks;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StrideError::Validation("task id must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(StrideError::Validation(format!(
                "task {} has an empty title",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskChanges {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub target_date: Option<DateTime<Utc>>,
    /// Completion percentage, 0 to 100.
    #[serde(default)]
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            notes: None,
            target_date: None,
            progress: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Goal {
    const KIND: EntityKind = EntityKind::Goals;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StrideError::Validation("goal id must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(StrideError::Validation(format!(
                "goal {} has an empty title",
                self.id
            )));
        }
        if self.progress > 100 {
            return Err(StrideError::Validation(format!(
                "goal {} progress {} exceeds 100",
                self.id, self.progress
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalChanges {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub target_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    #[serde(default)]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            provider: provider.into(),
            display_name: display_name.into(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Integration {
    const KIND: EntityKind = EntityKind::Integrations;

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StrideError::Validation(
                "integration id must not be empty".into(),
            ));
        }
        if self.provider.trim().is_empty() {
            return Err(StrideError::Validation(format!(
                "integration {} has an empty provider",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationChanges {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    CreateTask,
    UpdateTask,
    DeleteTask,
    CreateGoal,
    UpdateGoal,
    DeleteGoal,
    CreateIntegration,
    UpdateIntegration,
    DeleteIntegration,
}

impl MutationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateTask => "CREATE_TASK",
            Self::UpdateTask => "UPDATE_TASK",
            Self::DeleteTask => "DELETE_TASK",
            Self::CreateGoal => "CREATE_GOAL",
            Self::UpdateGoal => "UPDATE_GOAL",
            Self::DeleteGoal => "DELETE_GOAL",
            Self::CreateIntegration => "CREATE_INTEGRATION",
            Self::UpdateIntegration => "UPDATE_INTEGRATION",
            Self::DeleteIntegration => "DELETE_INTEGRATION",
        }
    }
}

/// A write intent awaiting remote confirmation. Entries are only ever
/// removed by an explicit `remove` or `clear`; retry scheduling belongs to
/// the external synchronizer (see `policy`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: String,
    pub kind: MutationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Outcome of the write-through persistence step of one mutation.
/// `MemoryOnly` marks the window where memory and durable storage disagree
/// (degraded cache); the in-memory update has still fully applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOutcome {
    Durable,
    MemoryOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineDiagnostics {
    pub hydrated: bool,
    pub generation: u64,
    pub sync_status: Option<SyncStatus>,
    pub pending_mutations: u64,
    pub cache_available: bool,
    /// Bounded sample of swallowed durable-cache failures.
    pub degraded_ops: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_validation_rejects_blank_title() {
        let mut task = Task::new("t1", "Write report");
        assert!(task.validate().is_ok());
        task.title = "   ".into();
        assert!(matches!(
            task.validate(),
            Err(StrideError::Validation(_))
        ));
    }

    #[test]
    fn goal_progress_is_bounded() {
        let mut goal = Goal::new("g1", "Run a marathon");
        goal.progress = 100;
        assert!(goal.validate().is_ok());
        goal.progress = 101;
        assert!(goal.validate().is_err());
    }

    #[test]
    fn mutation_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&MutationKind::CreateTask).expect("serialize");
        assert_eq!(json, "\"CREATE_TASK\"");
    }

    #[test]
    fn entity_kind_partitions_are_distinct() {
        let names: Vec<&str> = EntityKind::ALL.iter().map(|k| k.partition()).collect();
        assert_eq!(names, vec!["tasks", "goals", "integrations"]);
    }
}
