//! Memo draft commands.

use super::{print_json, Context};

/// Runs `draft show`.
pub async fn show(
    context: &Context,
    workspace_id: i64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let draft = context.client.memo_drafts().load(workspace_id).await?;
    match (format, draft) {
        ("json", draft) => print_json(&draft),
        (_, None) => {
            println!("No draft for workspace {}", workspace_id);
            Ok(())
        }
        (_, Some(draft)) => {
            println!("Workspace {} draft", workspace_id);
            println!("Title:    {}", draft.title);
            if let (Some(id), Some(version)) = (&draft.record_id, &draft.base_version) {
                println!("Editing:  {} at {}", id, version);
            }
            println!("Saved at: {}", draft.saved_at);
            println!();
            println!("{}", draft.text);
            Ok(())
        }
    }
}

/// Runs `draft clear`.
pub async fn clear(context: &Context, workspace_id: i64) -> Result<(), Box<dyn std::error::Error>> {
    context.client.memo_drafts().clear(workspace_id).await?;
    println!("Cleared draft for workspace {}", workspace_id);
    Ok(())
}
