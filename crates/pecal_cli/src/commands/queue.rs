//! Offline queue commands.

use super::{print_json, Context};
use pecal_sync::{FlushReport, QueueItem};
use serde::Serialize;

/// One queued write as listed by the CLI.
#[derive(Debug, Serialize)]
pub struct QueueEntry {
    /// Item id.
    pub id: String,
    /// Mutation kind.
    pub kind: String,
    /// Workspace id.
    pub workspace_id: i64,
    /// Enqueue time, milliseconds since the epoch.
    pub created_at: u64,
    /// Failed replay attempts.
    pub retry_count: u32,
    /// Whether the item sits on the dead-letter list.
    pub abandoned: bool,
}

impl QueueEntry {
    fn of(item: &QueueItem, abandoned: bool) -> Self {
        Self {
            id: item.id.to_string(),
            kind: item.kind.to_string(),
            workspace_id: item.workspace_id,
            created_at: item.created_at,
            retry_count: item.retry_count,
            abandoned,
        }
    }
}

/// Collects queued writes in replay order, followed by dead letters if
/// requested.
pub async fn entries(
    context: &Context,
    include_abandoned: bool,
) -> Result<Vec<QueueEntry>, Box<dyn std::error::Error>> {
    let queue = context.client.queue();
    let mut entries: Vec<QueueEntry> = queue
        .items()
        .await?
        .iter()
        .map(|item| QueueEntry::of(item, false))
        .collect();
    if include_abandoned {
        entries.extend(
            queue
                .abandoned()
                .await?
                .iter()
                .map(|item| QueueEntry::of(item, true)),
        );
    }
    Ok(entries)
}

/// Runs `queue count`.
pub async fn count(context: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let count = context.client.queue().count().await?;
    match format {
        "json" => print_json(&serde_json::json!({ "count": count })),
        _ => {
            println!("{} queued write(s)", count);
            Ok(())
        }
    }
}

/// Runs `queue list`.
pub async fn list(
    context: &Context,
    include_abandoned: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = entries(context, include_abandoned).await?;
    match format {
        "json" => print_json(&entries),
        _ => {
            if entries.is_empty() {
                println!("Queue is empty");
            }
            for entry in &entries {
                println!(
                    "{} {:<12} workspace={} retries={}{}",
                    entry.id,
                    entry.kind,
                    entry.workspace_id,
                    entry.retry_count,
                    if entry.abandoned { " (abandoned)" } else { "" }
                );
            }
            Ok(())
        }
    }
}

/// Runs `queue flush`: restores the session, then replays the queue.
pub async fn flush(context: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = &context.client;
    if client.sessions().restore().await.is_none() {
        return Err("Not signed in; queued writes were left untouched".into());
    }
    let report = client.flush_queue().await?;
    match format {
        "json" => print_json(&report),
        _ => {
            print_report(&report);
            Ok(())
        }
    }
}

fn print_report(report: &FlushReport) {
    println!("Replayed:  {}", report.processed);
    println!("Failed:    {}", report.failed);
    if report.abandoned > 0 {
        println!("Abandoned: {}", report.abandoned);
    }
    println!("Remaining: {}", report.remaining);
}
