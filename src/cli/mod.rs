//! Operator command-line interface.

pub mod app;
pub mod commands;
pub mod display;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Autonomous engineering execution core", long_about = None)]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold .foreman/ (config + database) in the current directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Run the orchestrator loop until interrupted
    Orchestrate {
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommands),

    /// Manage tickets
    #[command(subcommand)]
    Ticket(TicketCommands),

    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommands),

    /// Inspect phase definitions
    #[command(subcommand)]
    Phase(PhaseCommands),

    /// Inspect and sweep resource locks
    #[command(subcommand)]
    Lock(LockCommands),

    /// Inspect the event log
    #[command(subcommand)]
    Event(EventCommands),
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project (installs the default phase set)
    Create {
        #[arg(long)]
        name: String,
        /// Path to the git repository agents operate on
        #[arg(long)]
        repo: String,
        #[arg(long)]
        autonomous: bool,
        #[arg(long, default_value_t = 4)]
        max_concurrent: u32,
    },
    /// List projects
    List,
    /// Toggle autonomous mode
    Autonomous {
        id: Uuid,
        #[arg(value_parser = clap::builder::BoolishValueParser::new())]
        on: bool,
    },
}

#[derive(Subcommand)]
pub enum TicketCommands {
    Create {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    List {
        #[arg(long)]
        project: Uuid,
    },
    Show {
        id: Uuid,
    },
    /// Move a ticket to another phase (reason defaults to manual override)
    Transition {
        id: Uuid,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    Submit {
        #[arg(long)]
        ticket: Uuid,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Comma-separated dependency task ids
        #[arg(long, value_delimiter = ',')]
        deps: Vec<Uuid>,
        /// Comma-separated file paths the task expects to touch
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show {
        id: Uuid,
    },
    Cancel {
        id: Uuid,
    },
    /// Release a task for execution in a non-autonomous project
    Release {
        id: Uuid,
    },
}

#[derive(Subcommand)]
pub enum PhaseCommands {
    List {
        #[arg(long)]
        project: Uuid,
    },
}

#[derive(Subcommand)]
pub enum LockCommands {
    List,
    /// Release expired leases now
    Sweep,
}

#[derive(Subcommand)]
pub enum EventCommands {
    /// Show recent events, oldest first
    Tail {
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}
