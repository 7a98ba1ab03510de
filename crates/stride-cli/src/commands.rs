use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use stride_core::{
    AuthCollaborator, Goal, GoalChanges, HttpRemote, Identity, MutationKind, RemoteConfig,
    RemoteDataSource, StrideError, SyncEngine, Task, TaskChanges,
};

use crate::cli::{Commands, GoalCommand, QueueCommand, TaskCommand};

/// Stand-in collaborators for running without a configured remote: the
/// cache-backed state keeps working, fetches fail as network errors.
struct Disconnected {
    user_id: String,
}

impl Disconnected {
    fn from_env() -> Self {
        Self {
            user_id: std::env::var("STRIDE_USER").unwrap_or_else(|_| "local".to_string()),
        }
    }
}

impl RemoteDataSource for Disconnected {
    fn fetch_tasks(&self) -> stride_core::Result<Vec<Task>> {
        Err(StrideError::Network(
            "remote not configured; set STRIDE_REMOTE_URL".to_string(),
        ))
    }

    fn fetch_goals(&self) -> stride_core::Result<Vec<Goal>> {
        Err(StrideError::Network(
            "remote not configured; set STRIDE_REMOTE_URL".to_string(),
        ))
    }

    fn fetch_integrations(&self) -> stride_core::Result<Vec<stride_core::Integration>> {
        Err(StrideError::Network(
            "remote not configured; set STRIDE_REMOTE_URL".to_string(),
        ))
    }
}

impl AuthCollaborator for Disconnected {
    fn current_user(&self) -> stride_core::Result<Option<Identity>> {
        Ok(Some(Identity {
            user_id: self.user_id.clone(),
            display_name: None,
        }))
    }
}

fn build_engine(root: &Path) -> Result<SyncEngine> {
    let engine = match RemoteConfig::from_env() {
        Some(config) => {
            let remote = Arc::new(HttpRemote::new(config)?);
            SyncEngine::new(
                root,
                Arc::clone(&remote) as Arc<dyn RemoteDataSource>,
                remote as Arc<dyn AuthCollaborator>,
            )
        }
        None => {
            let local = Arc::new(Disconnected::from_env());
            SyncEngine::new(
                root,
                Arc::clone(&local) as Arc<dyn RemoteDataSource>,
                local as Arc<dyn AuthCollaborator>,
            )
        }
    };
    engine.context("failed to create engine")
}

pub(crate) fn run_from_root(root: &Path, command: Commands) -> Result<()> {
    let engine = build_engine(root)?;
    let outcome = run(&engine, command);
    engine.teardown();
    outcome
}

fn run(engine: &SyncEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Refresh => {
            engine.init().context("hydration failed")?;
            print_json(&engine.diagnostics())?;
        }
        Commands::Status => {
            engine.hydrate_cached().context("hydration failed")?;
            print_json(&engine.diagnostics())?;
        }
        Commands::Task(args) => {
            engine.hydrate_cached().context("hydration failed")?;
            run_task(engine, args.command)?;
        }
        Commands::Goal(args) => {
            engine.hydrate_cached().context("hydration failed")?;
            run_goal(engine, args.command)?;
        }
        Commands::Queue(args) => match args.command {
            QueueCommand::List => print_json(&engine.queue().list()?)?,
            QueueCommand::Clear => {
                engine.queue().clear()?;
                println!("queue cleared");
            }
        },
        Commands::SignOut => {
            engine.hydrate_cached().context("hydration failed")?;
            engine.sign_out()?;
            println!("signed out; local state cleared");
        }
    }
    Ok(())
}

fn run_task(engine: &SyncEngine, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::List => print_json(&engine.store().tasks()),
        TaskCommand::Add {
            id,
            title,
            notes,
            queued,
        } => {
            let mut task = Task::new(id, title);
            task.notes = notes;
            if queued {
                engine
                    .queue()
                    .add(MutationKind::CreateTask, serde_json::to_value(&task)?)?;
            }
            engine.store().add_task(task.clone())?;
            print_json(&task)
        }
        TaskCommand::Done { id } => {
            engine.store().update_task(
                &id,
                TaskChanges {
                    done: Some(true),
                    ..TaskChanges::default()
                },
            )?;
            print_json(&engine.store().task(&id))
        }
        TaskCommand::Rm { id } => {
            engine.store().delete_task(&id)?;
            println!("deleted task {id}");
            Ok(())
        }
    }
}

fn run_goal(engine: &SyncEngine, command: GoalCommand) -> Result<()> {
    match command {
        GoalCommand::List => print_json(&engine.store().goals()),
        GoalCommand::Add { id, title, notes } => {
            let mut goal = Goal::new(id, title);
            goal.notes = notes;
            engine.store().add_goal(goal.clone())?;
            print_json(&goal)
        }
        GoalCommand::Progress { id, percent } => {
            engine.store().update_goal(
                &id,
                GoalChanges {
                    progress: Some(percent),
                    ..GoalChanges::default()
                },
            )?;
            print_json(&engine.store().goal(&id))
        }
        GoalCommand::Rm { id } => {
            engine.store().delete_goal(&id)?;
            println!("deleted goal {id}");
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
