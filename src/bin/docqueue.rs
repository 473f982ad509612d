//! docqueue - administer and exercise the file-processing queue.
//!
//! Configuration comes from `DOCQUEUE_*` environment variables (see `QueueConfig`);
//! `--database-url` overrides `DOCQUEUE_DATABASE_URL`.

use std::env;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use docqueue::{
    DequeueRequest, EnqueueRequest, Outcome, Priority, QueueConfig, QueueContext, QueueMode,
    QueueSession, QueueStatus, SetStatusRequest, WorkflowSelector, WorkflowType, observability,
};

#[derive(Debug, Parser)]
#[command(name = "docqueue")]
#[command(about = "Distributed file-processing queue on Postgres.")]
struct Cli {
    #[arg(long, env = "DOCQUEUE_DATABASE_URL", global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate,
    #[command(subcommand)]
    Workflow(WorkflowCommand),
    #[command(subcommand)]
    Action(ActionCommand),
    /// Queue files for an action.
    Enqueue {
        #[arg(long)]
        action: String,
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        size_bytes: Option<i64>,
        #[arg(long)]
        page_count: Option<i32>,
        /// Re-queue files that are currently being processed.
        #[arg(long)]
        force: bool,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Claim files as a short-lived worker and report an outcome for each.
    Dequeue {
        #[arg(long)]
        action: String,
        #[command(flatten)]
        scope: Scope,
        #[arg(long, default_value_t = 1)]
        max: usize,
        /// Claim skipped files instead of pending ones.
        #[arg(long)]
        skipped: bool,
        /// With --skipped, only files skipped by this user.
        #[arg(long, requires = "skipped")]
        skipped_by: Option<String>,
        #[arg(long, value_enum, default_value_t = Then::Requeue)]
        then: Then,
    },
    /// Change one file's status.
    SetStatus {
        #[arg(long)]
        path: String,
        #[arg(long)]
        action: String,
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        to: QueueStatus,
        /// Only change the record if it currently has this status.
        #[arg(long)]
        expect: Option<QueueStatus>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Change the status of every file of an action's workflow.
    SetStatusAll {
        #[arg(long)]
        action: String,
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        to: QueueStatus,
        #[arg(long)]
        priority: Option<Priority>,
    },
    /// Print per-status counters for an action as JSON.
    Stats {
        #[arg(long)]
        action: String,
        #[command(flatten)]
        scope: Scope,
    },
    /// Revert work held by workers whose heartbeat went stale.
    RevertStale,
    /// Rebuild statistics counters from the ledger.
    Recalc {
        /// Limit the rebuild to one action; all actions otherwise.
        #[arg(long)]
        action: Option<String>,
        #[command(flatten)]
        scope: Scope,
    },
    /// Delete a file and all of its queue records.
    Purge {
        #[arg(long)]
        path: String,
    },
}

#[derive(Debug, Subcommand)]
enum WorkflowCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "undefined")]
        workflow_type: WorkflowType,
        #[arg(long)]
        track_history: bool,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum ActionCommand {
    Create {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        scope: Scope,
    },
    List {
        #[command(flatten)]
        scope: Scope,
    },
}

#[derive(Debug, Args)]
struct Scope {
    /// Workflow to operate in; the legacy global scope when omitted.
    #[arg(long, conflicts_with = "all_workflows")]
    workflow: Option<String>,
    #[arg(long)]
    all_workflows: bool,
}

impl Scope {
    fn selector(&self) -> WorkflowSelector {
        match (&self.workflow, self.all_workflows) {
            (_, true) => WorkflowSelector::All,
            (Some(name), false) => WorkflowSelector::named(name),
            (None, false) => WorkflowSelector::Global,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Then {
    Completed,
    Failed,
    Skipped,
    Requeue,
}

impl Then {
    fn outcome(self) -> Outcome {
        match self {
            Then::Completed => Outcome::Completed,
            Then::Failed => Outcome::Failed {
                comment: Some("reported from the command line".to_string()),
            },
            Then::Skipped => Outcome::Skipped,
            Then::Requeue => Outcome::Requeue,
        }
    }
}

fn load_config(database_url: Option<String>) -> Result<QueueConfig> {
    dotenvy::dotenv().ok();
    QueueConfig::from_lookup(|key| match (key, &database_url) {
        ("DOCQUEUE_DATABASE_URL", Some(url)) => Some(url.clone()),
        _ => env::var(key).ok(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();
    let cli = Cli::parse();
    let config = load_config(cli.database_url.clone())?;

    let ctx = QueueContext::connect_and_migrate(config)
        .await
        .context("connect to queue database")?;
    let mut session = ctx.session();
    let result = run(&mut session, cli.command).await;
    // Leave nothing claimed behind if a command failed halfway.
    session.unregister_worker().await.ok();
    drop(session);
    ctx.shutdown().await;
    result
}

async fn run(session: &mut QueueSession, command: Command) -> Result<()> {
    match command {
        Command::Migrate => {
            info!("migrations applied");
        }
        Command::Workflow(WorkflowCommand::Create {
            name,
            workflow_type,
            track_history,
        }) => {
            let workflow = session
                .get_or_create_workflow(&name, workflow_type)
                .await
                .context("create workflow")?;
            if workflow.track_history != track_history {
                session
                    .set_history_tracking(&workflow.name, track_history)
                    .await
                    .context("set history tracking")?;
            }
            println!("{}\t{}", workflow.id, workflow.name);
        }
        Command::Workflow(WorkflowCommand::List) => {
            for workflow in session.list_workflows().await? {
                println!(
                    "{}\t{}\t{}\thistory={}",
                    workflow.id, workflow.name, workflow.workflow_type, workflow.track_history
                );
            }
        }
        Command::Action(ActionCommand::Create { name, scope }) => {
            if scope.all_workflows {
                bail!("an action is created in one workflow or globally");
            }
            let action = session
                .get_or_create_action(&name, &scope.selector())
                .await
                .context("create action")?;
            println!("{}\t{}", action.id, action.name);
        }
        Command::Action(ActionCommand::List { scope }) => {
            for action in session.list_actions(&scope.selector()).await? {
                let workflow = action
                    .workflow_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}", action.id, action.name, workflow);
            }
        }
        Command::Enqueue {
            action,
            scope,
            priority,
            size_bytes,
            page_count,
            force,
            paths,
        } => {
            for path in paths {
                let mut request = EnqueueRequest::new(&path, &action).in_workflow(scope.selector());
                request.priority = priority;
                request.size_bytes = size_bytes;
                request.page_count = page_count;
                request.force = force;
                let outcome = session
                    .enqueue(&request)
                    .await
                    .with_context(|| format!("enqueue {path}"))?;
                println!(
                    "{path}\t{} -> {}{}",
                    outcome.previous,
                    outcome.status,
                    if outcome.queued { "" } else { " (still processing)" }
                );
            }
        }
        Command::Dequeue {
            action,
            scope,
            max,
            skipped,
            skipped_by,
            then,
        } => {
            let mode = match (skipped, skipped_by) {
                (true, Some(user)) => QueueMode::SkippedForUser(user),
                (true, None) => QueueMode::SkippedAnyUser,
                (false, _) => QueueMode::PendingAnyUser,
            };
            session.register_worker().await?;
            let request = DequeueRequest::new(&action, max)
                .in_workflow(scope.selector())
                .with_mode(mode);
            let files = session.dequeue(&request).await.context("dequeue")?;
            let outcome = then.outcome();
            for file in &files {
                println!("{}", serde_json::to_string(file)?);
                session
                    .report_outcome(file, &outcome)
                    .await
                    .with_context(|| format!("report outcome for {}", file.path))?;
            }
            info!(claimed = files.len(), outcome = ?then, "dequeue finished");
        }
        Command::SetStatus {
            path,
            action,
            scope,
            to,
            expect,
            force,
            comment,
        } => {
            let mut request = SetStatusRequest::new(&path, &action, to).in_workflow(scope.selector());
            request.expected_from = expect;
            request.force = force;
            request.comment = comment;
            for (action_id, outcome) in session.set_status(&request).await? {
                println!(
                    "action {action_id}\t{} -> {}{}",
                    outcome.previous,
                    outcome.status,
                    if outcome.changed { "" } else { " (unchanged)" }
                );
            }
        }
        Command::SetStatusAll {
            action,
            scope,
            to,
            priority,
        } => {
            let changed = session
                .set_status_for_all_files(&action, &scope.selector(), to, priority)
                .await?;
            println!("{changed} records changed");
        }
        Command::Stats { action, scope } => {
            let stats = session
                .get_aggregate_stats(&action, &scope.selector())
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::RevertStale => {
            let report = session.context().revert_stale_leases().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Recalc { action, scope } => {
            let written = session
                .recalc_statistics(action.as_deref(), &scope.selector())
                .await?;
            println!("{written} counter rows rebuilt");
        }
        Command::Purge { path } => {
            if session.purge_file(&path).await? {
                println!("purged {path}");
            } else {
                println!("{path} is not in the queue");
            }
        }
    }
    Ok(())
}
