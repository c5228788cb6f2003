//! CLI command handlers.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;

use crate::domain::models::{Priority, Project, Task, TaskStatus, Ticket, TransitionReason};
use crate::domain::ports::TaskFilter;
use crate::services::TransitionOutcome;

use super::app::App;
use super::display;
use super::{EventCommands, LockCommands, PhaseCommands, ProjectCommands, TaskCommands, TicketCommands};

const DEFAULT_CONFIG: &str = r#"# Foreman project configuration.
database:
  path: .foreman/foreman.db

orchestrator:
  workers: 4
  base_branch: main

sandbox:
  worktrees_root: .foreman/worktrees
  # runtime_command: ["agent-runtime", "--headless"]

log:
  level: info
  format: pretty
"#;

pub async fn handle_init(force: bool) -> Result<()> {
    let config_path = std::path::Path::new(".foreman/config.yaml");
    if config_path.exists() && !force {
        bail!(".foreman/config.yaml already exists (use --force to overwrite)");
    }
    tokio::fs::create_dir_all(".foreman/worktrees").await?;
    tokio::fs::write(config_path, DEFAULT_CONFIG).await?;
    crate::adapters::sqlite::initialize_database("sqlite:.foreman/foreman.db")
        .await
        .context("Failed to create database")?;
    println!("Initialized .foreman/");
    Ok(())
}

pub async fn handle_orchestrate(app: Arc<App>) -> Result<()> {
    let handle = app.orchestrator.start().await?;
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    app.orchestrator.shutdown(handle).await?;
    Ok(())
}

pub async fn handle_project(app: &App, command: ProjectCommands, json: bool) -> Result<()> {
    match command {
        ProjectCommands::Create { name, repo, autonomous, max_concurrent } => {
            let project = Project::new(name, repo, "phase-requirements")
                .with_autonomous_mode(autonomous)
                .with_max_concurrent(max_concurrent);
            app.projects.create(&project).await?;
            app.registry.install_defaults(project.id).await?;
            println!("Created project {}", project.id);
        }
        ProjectCommands::List => {
            let projects = app.projects.list(false).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else {
                println!("{}", display::project_table(&projects));
            }
        }
        ProjectCommands::Autonomous { id, on } => {
            app.projects.set_autonomous_mode(id, on).await?;
            println!("Project {id}: autonomous mode {}", if on { "on" } else { "off" });
        }
    }
    Ok(())
}

pub async fn handle_ticket(app: &App, command: TicketCommands, json: bool) -> Result<()> {
    match command {
        TicketCommands::Create { project, title, description, priority } => {
            let project = app
                .projects
                .get(project)
                .await?
                .context("Project not found")?;
            let priority = parse_priority(&priority)?;
            let ticket = Ticket::new(project.id, title, project.default_phase_id.clone())
                .with_description(description)
                .with_priority(priority);
            app.tickets.create(&ticket).await?;
            println!("Created ticket {}", ticket.id);
        }
        TicketCommands::List { project } => {
            let tickets = app.tickets.list_by_project(project).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tickets)?);
            } else {
                println!("{}", display::ticket_table(&tickets));
            }
        }
        TicketCommands::Show { id } => {
            let ticket = app.tickets.get(id).await?.context("Ticket not found")?;
            println!("{}", serde_json::to_string_pretty(&ticket)?);
            let history = app.tickets.list_history(id).await?;
            for entry in history {
                println!(
                    "  {} {} -> {} ({})",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.from_phase,
                    entry.to_phase,
                    entry.reason.as_str()
                );
            }
        }
        TicketCommands::Transition { id, to, reason } => {
            let reason = TransitionReason::from_str(&reason)
                .context("Invalid reason (normal|discovery|manual|rejection)")?;
            match app.engine.transition(id, &to, reason, "cli").await? {
                TransitionOutcome::Transitioned => println!("Ticket {id} -> {to}"),
                TransitionOutcome::NoOp => println!("Already in {to}"),
                TransitionOutcome::ApprovalPending => println!("Awaiting approval for {to}"),
                TransitionOutcome::GateRejected(report) => {
                    println!("Gate rejected:");
                    for criterion in report.failing() {
                        println!("  ✗ {criterion}");
                    }
                }
            }
        }
    }
    Ok(())
}

pub async fn handle_task(app: &App, command: TaskCommands, json: bool) -> Result<()> {
    match command {
        TaskCommands::Submit { ticket, description, priority, deps, files } => {
            let ticket = app.tickets.get(ticket).await?.context("Ticket not found")?;
            let priority = parse_priority(&priority)?;
            let mut task = Task::new(ticket.id, ticket.project_id, ticket.current_phase.clone(), description)
                .with_priority(priority)
                .with_estimated_files(files);
            for dep in deps {
                task = task.with_dependency(dep);
            }
            let task = app.queue.enqueue(task).await?;
            println!("Submitted task {}", task.id);
        }
        TaskCommands::List { status } => {
            let status = status
                .map(|s| TaskStatus::from_str(&s).context("Invalid status"))
                .transpose()?;
            let tasks = app.tasks.list(TaskFilter { status, ..Default::default() }).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                println!("{}", display::task_table(&tasks));
            }
        }
        TaskCommands::Show { id } => {
            let task = app.tasks.get(id).await?.context("Task not found")?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Cancel { id } => {
            if app.queue.cancel(id).await? {
                app.locks.release_by_task(id).await?;
                println!("Cancelled task {id}");
            } else {
                println!("Task {id} is already terminal");
            }
        }
        TaskCommands::Release { id } => {
            app.tasks.set_manual_release(id, true).await?;
            println!("Released task {id} for execution");
        }
    }
    Ok(())
}

pub async fn handle_phase(app: &App, command: PhaseCommands) -> Result<()> {
    match command {
        PhaseCommands::List { project } => {
            let phases = app.registry.list(project).await?;
            for phase in phases.iter() {
                let terminal = if phase.terminal { " (terminal)" } else { "" };
                println!(
                    "{:2}. {} [{}]{} -> {}",
                    phase.sequence,
                    phase.name,
                    phase.id,
                    terminal,
                    if phase.allowed_next.is_empty() { "-".to_string() } else { phase.allowed_next.join(", ") }
                );
            }
        }
    }
    Ok(())
}

pub async fn handle_lock(app: &App, command: LockCommands, json: bool) -> Result<()> {
    match command {
        LockCommands::List => {
            let locks = app.locks.list_active().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&locks)?);
            } else {
                println!("{}", display::lock_table(&locks));
            }
        }
        LockCommands::Sweep => {
            let swept = app.locks.sweep_expired(Utc::now()).await?;
            println!("Swept {swept} expired lock(s)");
        }
    }
    Ok(())
}

pub async fn handle_event(app: &App, command: EventCommands, json: bool) -> Result<()> {
    match command {
        EventCommands::Tail { channel, limit } => {
            let events = app.event_store.tail(channel.as_deref(), limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                println!("{}", display::event_table(&events));
            }
        }
    }
    Ok(())
}

fn parse_priority(s: &str) -> Result<Priority> {
    Priority::from_str(s).with_context(|| format!("Invalid priority: {s}"))
}
