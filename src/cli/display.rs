//! Table rendering for CLI output.

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use console::style;

use crate::domain::models::{Project, ResourceLock, Task, TaskStatus, Ticket};
use crate::services::Event;

fn short_id(id: impl ToString) -> String {
    let s = id.to_string();
    s.chars().take(8).collect()
}

fn status_cell(status: TaskStatus) -> Cell {
    let text = status.as_str();
    let styled = match status {
        TaskStatus::Completed => style(text).green(),
        TaskStatus::Failed => style(text).red(),
        TaskStatus::Running => style(text).cyan(),
        TaskStatus::Cancelled => style(text).dim(),
        _ => style(text),
    };
    Cell::new(styled.to_string())
}

pub fn task_table(tasks: &[Task]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Status", "Priority", "Phase", "Retries", "Description"]);
    for task in tasks {
        let description: String = task.description.chars().take(60).collect();
        table.add_row(vec![
            Cell::new(short_id(task.id)),
            status_cell(task.status),
            Cell::new(task.priority.as_str()),
            Cell::new(&task.phase_id),
            Cell::new(format!("{}/{}", task.retry_count, task.max_retries)),
            Cell::new(description),
        ]);
    }
    table
}

pub fn ticket_table(tickets: &[Ticket]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Status", "Priority", "Phase", "Title"]);
    for ticket in tickets {
        table.add_row(vec![
            Cell::new(short_id(ticket.id)),
            Cell::new(ticket.status.as_str()),
            Cell::new(ticket.priority.as_str()),
            Cell::new(&ticket.current_phase),
            Cell::new(&ticket.title),
        ]);
    }
    table
}

pub fn project_table(projects: &[Project]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Name", "Autonomous", "Ceiling", "Repo"]);
    for project in projects {
        table.add_row(vec![
            Cell::new(short_id(project.id)),
            Cell::new(&project.name),
            Cell::new(if project.autonomous_mode { "on" } else { "off" }),
            Cell::new(project.max_concurrent),
            Cell::new(&project.repo_path),
        ]);
    }
    table
}

pub fn lock_table(locks: &[ResourceLock]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Type", "Resource", "Mode", "Task", "Expires"]);
    for lock in locks {
        table.add_row(vec![
            Cell::new(short_id(lock.id)),
            Cell::new(lock.resource_type.as_str()),
            Cell::new(&lock.resource_id),
            Cell::new(lock.mode.as_str()),
            Cell::new(short_id(lock.task_id)),
            Cell::new(lock.expires_at.map_or("never".to_string(), |t| t.to_rfc3339())),
        ]);
    }
    table
}

pub fn event_table(events: &[Event]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Seq", "Channel", "At", "Payload"]);
    for event in events {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        let payload: String = payload.chars().take(80).collect();
        table.add_row(vec![
            Cell::new(event.sequence.0),
            Cell::new(event.channel()),
            Cell::new(event.published_at.format("%H:%M:%S").to_string()),
            Cell::new(payload),
        ]);
    }
    table
}
