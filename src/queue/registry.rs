//! Workflow and action lookups resolved through a session.

use super::retry::LockScope;
use super::session::QueueSession;
use crate::backends::{ActionScope, NewAction, NewWorkflow, QueueError, QueueResult};
use crate::model::{Action, ActionId, Workflow, WorkflowId, WorkflowType};
use crate::observability::obs;

/// Which workflow an action name is looked up in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WorkflowSelector {
    /// The workflow pinned with `set_active_workflow`.
    #[default]
    Active,
    Named(String),
    /// Every action with the name, in every workflow and the legacy scope.
    All,
    /// Legacy actions that belong to no workflow.
    Global,
}

impl WorkflowSelector {
    pub fn named(name: impl Into<String>) -> Self {
        WorkflowSelector::Named(name.into())
    }
}

impl QueueSession {
    pub fn active_workflow(&self) -> Option<&Workflow> {
        self.active_workflow.as_ref()
    }

    /// Pins a workflow for the `Active` selector. The workflow must exist.
    pub async fn set_active_workflow(&mut self, name: &str) -> QueueResult<Workflow> {
        let workflow = self.workflow(name).await?;
        self.active_workflow = Some(workflow.clone());
        Ok(workflow)
    }

    pub fn clear_active_workflow(&mut self) {
        self.active_workflow = None;
    }

    #[obs]
    pub async fn get_or_create_workflow(
        &self,
        name: &str,
        workflow_type: WorkflowType,
    ) -> QueueResult<Workflow> {
        let name = validate_name("workflow", name)?;
        let new = NewWorkflow {
            name: name.to_string(),
            workflow_type,
            track_history: self.ctx.config().track_history,
        };
        let new = &new;
        let backend = self.backend();
        self.run("get_or_create_workflow", LockScope::Main, move |mode| {
            backend.get_or_create_workflow(new, mode)
        })
        .await
    }

    /// Looks up a workflow by name; a missing workflow is a configuration error.
    pub async fn workflow(&self, name: &str) -> QueueResult<Workflow> {
        let backend = self.backend();
        self.run("find_workflow", LockScope::Main, move |_| {
            backend.find_workflow(name)
        })
        .await?
        .ok_or_else(|| QueueError::Configuration(format!("workflow `{name}` is not defined")))
    }

    pub async fn list_workflows(&self) -> QueueResult<Vec<Workflow>> {
        let backend = self.backend();
        self.run("list_workflows", LockScope::Main, move |_| backend.list_workflows())
            .await
    }

    pub async fn set_history_tracking(&self, workflow: &str, track_history: bool) -> QueueResult<()> {
        let workflow = self.workflow(workflow).await?;
        let backend = self.backend();
        self.run("set_workflow_history", LockScope::Main, move |_| {
            backend.set_workflow_history(workflow.id, track_history)
        })
        .await
    }

    /// Resolves the selector to the workflow new records belong to; `None` is the legacy scope.
    pub async fn workflow_id_for(
        &self,
        selector: &WorkflowSelector,
    ) -> QueueResult<Option<WorkflowId>> {
        match selector {
            WorkflowSelector::Active => self
                .active_workflow
                .as_ref()
                .map(|workflow| Some(workflow.id))
                .ok_or_else(|| {
                    QueueError::Configuration("no active workflow is set for this session".into())
                }),
            WorkflowSelector::Named(name) => Ok(Some(self.workflow(name).await?.id)),
            WorkflowSelector::Global => Ok(None),
            WorkflowSelector::All => Err(QueueError::InvalidRequest(
                "this operation needs a single workflow, not all workflows".into(),
            )),
        }
    }

    /// Creates the action in the selected workflow unless it already exists there.
    #[obs]
    pub async fn get_or_create_action(
        &self,
        name: &str,
        selector: &WorkflowSelector,
    ) -> QueueResult<Action> {
        let name = validate_name("action", name)?;
        let workflow_id = self.workflow_id_for(selector).await?;
        let new = NewAction {
            name: name.to_string(),
            workflow_id,
        };
        let new = &new;
        let backend = self.backend();
        self.run("get_or_create_action", LockScope::Main, move |mode| {
            backend.get_or_create_action(new, mode)
        })
        .await
    }

    /// Every action the name resolves to under the selector; none is a configuration error.
    pub async fn resolve_actions(
        &self,
        name: &str,
        selector: &WorkflowSelector,
    ) -> QueueResult<Vec<Action>> {
        let scope = match selector {
            WorkflowSelector::All => ActionScope::Any,
            other => match self.workflow_id_for(other).await? {
                Some(workflow_id) => ActionScope::Workflow(workflow_id),
                None => ActionScope::Global,
            },
        };
        let backend = self.backend();
        let actions = self
            .run("find_actions", LockScope::Main, move |_| {
                backend.find_actions(name, scope)
            })
            .await?;
        if actions.is_empty() {
            return Err(QueueError::Configuration(format!(
                "action `{name}` is not defined in {}",
                describe(selector)
            )));
        }
        Ok(actions)
    }

    pub async fn resolve_action_ids(
        &self,
        name: &str,
        selector: &WorkflowSelector,
    ) -> QueueResult<Vec<ActionId>> {
        Ok(self
            .resolve_actions(name, selector)
            .await?
            .into_iter()
            .map(|action| action.id)
            .collect())
    }

    /// Actions of one workflow, or of every workflow for `All`.
    pub async fn list_actions(&self, selector: &WorkflowSelector) -> QueueResult<Vec<Action>> {
        let backend = self.backend();
        match selector {
            WorkflowSelector::All => {
                self.run("list_actions", LockScope::Main, move |_| {
                    backend.list_actions(None)
                })
                .await
            }
            other => {
                let workflow_id = self.workflow_id_for(other).await?;
                let actions = self
                    .run("list_actions", LockScope::Main, move |_| {
                        backend.list_actions(workflow_id)
                    })
                    .await?;
                Ok(actions
                    .into_iter()
                    .filter(|action| action.workflow_id == workflow_id)
                    .collect())
            }
        }
    }
}

fn validate_name<'a>(kind: &str, name: &'a str) -> QueueResult<&'a str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(QueueError::InvalidRequest(format!("{kind} name must not be empty")));
    }
    Ok(trimmed)
}

fn describe(selector: &WorkflowSelector) -> String {
    match selector {
        WorkflowSelector::Active => "the active workflow".to_string(),
        WorkflowSelector::Named(name) => format!("workflow `{name}`"),
        WorkflowSelector::All => "any workflow".to_string(),
        WorkflowSelector::Global => "the global scope".to_string(),
    }
}
