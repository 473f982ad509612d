use async_trait::async_trait;

use super::PostgresBackend;
use super::rows::{action_from_row, workflow_from_row};
use crate::backends::base::{
    ActionScope, LockMode, NewAction, NewWorkflow, QueueError, QueueResult, RegistryBackend,
};
use crate::model::{Action, Workflow, WorkflowId};
use crate::observability::obs;

const WORKFLOW_COLUMNS: &str = "id, name, workflow_type, track_history, created_at";

impl PostgresBackend {
    /// Optimistic callers insert blindly and let a unique violation surface as
    /// contention; callers holding the advisory lock insert-or-ignore and re-read.
    #[obs]
    async fn insert_workflow(
        &self,
        workflow: &NewWorkflow,
        mode: LockMode,
    ) -> QueueResult<Option<Workflow>> {
        let conflict = match mode {
            LockMode::Unlocked => "",
            LockMode::Locked => "ON CONFLICT ((lower(name))) DO NOTHING",
        };
        let sql = format!(
            "INSERT INTO workflows (name, workflow_type, track_history) VALUES ($1, $2, $3) \
             {conflict} RETURNING {WORKFLOW_COLUMNS}"
        );
        Self::count_query(&self.query_counts, "insert:workflows");
        let row = sqlx::query(&sql)
            .bind(&workflow.name)
            .bind(workflow.workflow_type.as_str())
            .bind(workflow.track_history)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    #[obs]
    async fn insert_action(&self, action: &NewAction, mode: LockMode) -> QueueResult<Option<Action>> {
        let conflict = match mode {
            LockMode::Unlocked => "",
            LockMode::Locked => "ON CONFLICT ((lower(name)), (COALESCE(workflow_id, 0))) DO NOTHING",
        };
        let sql = format!(
            "INSERT INTO actions (name, workflow_id) VALUES ($1, $2) \
             {conflict} RETURNING id, name, workflow_id"
        );
        Self::count_query(&self.query_counts, "insert:actions");
        let row = sqlx::query(&sql)
            .bind(&action.name)
            .bind(action.workflow_id.map(|id| id.0))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    async fn find_action(&self, name: &str, workflow_id: Option<WorkflowId>) -> QueueResult<Option<Action>> {
        let scope = match workflow_id {
            Some(id) => ActionScope::Workflow(id),
            None => ActionScope::Global,
        };
        Ok(self.find_actions(name, scope).await?.into_iter().next())
    }
}

#[async_trait]
impl RegistryBackend for PostgresBackend {
    async fn get_or_create_workflow(
        &self,
        workflow: &NewWorkflow,
        mode: LockMode,
    ) -> QueueResult<Workflow> {
        if let Some(existing) = self.find_workflow(&workflow.name).await? {
            return Ok(existing);
        }
        if let Some(created) = self.insert_workflow(workflow, mode).await? {
            return Ok(created);
        }
        self.find_workflow(&workflow.name).await?.ok_or_else(|| {
            QueueError::Contention(format!("workflow `{}` vanished after insert", workflow.name))
        })
    }

    async fn find_workflow(&self, name: &str) -> QueueResult<Option<Workflow>> {
        Self::count_query(&self.query_counts, "select:workflow_by_name");
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE lower(name) = lower($1)");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self) -> QueueResult<Vec<Workflow>> {
        Self::count_query(&self.query_counts, "select:workflows");
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY lower(name)");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn set_workflow_history(
        &self,
        workflow_id: WorkflowId,
        track_history: bool,
    ) -> QueueResult<()> {
        Self::count_query(&self.query_counts, "update:workflow_history");
        let result = sqlx::query("UPDATE workflows SET track_history = $2 WHERE id = $1")
            .bind(workflow_id.0)
            .bind(track_history)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(format!("workflow {workflow_id}")));
        }
        Ok(())
    }

    async fn get_or_create_action(
        &self,
        action: &NewAction,
        mode: LockMode,
    ) -> QueueResult<Action> {
        if let Some(existing) = self.find_action(&action.name, action.workflow_id).await? {
            return Ok(existing);
        }
        if let Some(created) = self.insert_action(action, mode).await? {
            return Ok(created);
        }
        self.find_action(&action.name, action.workflow_id)
            .await?
            .ok_or_else(|| {
                QueueError::Contention(format!("action `{}` vanished after insert", action.name))
            })
    }

    async fn find_actions(&self, name: &str, scope: ActionScope) -> QueueResult<Vec<Action>> {
        Self::count_query(&self.query_counts, "select:actions_by_name");
        let (filter, workflow_id) = match scope {
            ActionScope::Workflow(id) => ("AND workflow_id = $2", Some(id.0)),
            ActionScope::Global => ("AND workflow_id IS NULL AND $2::BIGINT IS NULL", None),
            ActionScope::Any => ("AND $2::BIGINT IS NULL", None),
        };
        let sql = format!(
            "SELECT id, name, workflow_id FROM actions WHERE lower(name) = lower($1) {filter} ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(name)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(action_from_row).collect()
    }

    async fn list_actions(&self, workflow_id: Option<WorkflowId>) -> QueueResult<Vec<Action>> {
        Self::count_query(&self.query_counts, "select:actions");
        let rows = sqlx::query(
            r#"
            SELECT id, name, workflow_id
            FROM actions
            WHERE $1::BIGINT IS NULL OR workflow_id = $1
            ORDER BY workflow_id NULLS FIRST, lower(name)
            "#,
        )
        .bind(workflow_id.map(|id| id.0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(action_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::super::test_helpers::setup_backend;
    use super::*;
    use crate::model::WorkflowType;

    #[serial(postgres)]
    #[tokio::test]
    async fn registry_get_or_create_is_case_insensitive() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let workflow = backend
            .get_or_create_workflow(
                &NewWorkflow {
                    name: "Intake".into(),
                    workflow_type: WorkflowType::Extraction,
                    track_history: true,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("create workflow");
        let again = backend
            .get_or_create_workflow(
                &NewWorkflow {
                    name: "INTAKE".into(),
                    workflow_type: WorkflowType::Redaction,
                    track_history: false,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("lookup workflow");
        assert_eq!(workflow.id, again.id);
        assert_eq!(again.workflow_type, WorkflowType::Extraction);

        let scoped = backend
            .get_or_create_action(
                &NewAction {
                    name: "Validate".into(),
                    workflow_id: Some(workflow.id),
                },
                LockMode::Unlocked,
            )
            .await
            .expect("scoped action");
        let global = backend
            .get_or_create_action(
                &NewAction {
                    name: "validate".into(),
                    workflow_id: None,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("global action");
        assert_ne!(scoped.id, global.id);

        let all = backend
            .find_actions("VALIDATE", ActionScope::Any)
            .await
            .expect("find any");
        assert_eq!(all.len(), 2);
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn registry_unlocked_duplicate_insert_is_contention() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let action = NewAction {
            name: "Validate".into(),
            workflow_id: None,
        };
        backend
            .insert_action(&action, LockMode::Unlocked)
            .await
            .expect("first insert");
        let err = backend
            .insert_action(&action, LockMode::Unlocked)
            .await
            .expect_err("duplicate insert");
        assert!(err.escalates(), "{err}");

        let locked = backend
            .insert_action(&action, LockMode::Locked)
            .await
            .expect("locked insert");
        assert!(locked.is_none());
    }
}
