//! Session commands.

use super::{print_json, Context};
use pecal_storage::KeyValueStoreExt;
use pecal_sync::Session;
use serde::Serialize;

/// What the CLI reports about a session. Tokens are never printed.
#[derive(Debug, Serialize, PartialEq)]
pub struct SessionSummary {
    /// Whether a session is present.
    pub signed_in: bool,
    /// Account id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<u64>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Sign-in provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Account email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Why the last session ended, if it was forced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

impl SessionSummary {
    fn of(session: Option<&Session>) -> Self {
        Self {
            signed_in: session.is_some(),
            subject_id: session.map(|s| s.subject_id),
            display_name: session.map(|s| s.display_name.clone()),
            provider: session.map(|s| s.auth_provider.as_str().to_string()),
            email: session.and_then(|s| s.email.clone()),
            last_failure: None,
        }
    }
}

/// Reads the persisted session without validating it.
pub async fn load(context: &Context) -> Result<SessionSummary, Box<dyn std::error::Error>> {
    let client = &context.client;
    let stored: Option<Session> = client
        .store()
        .get_json(&client.config().storage_keys.session)
        .await?;
    Ok(SessionSummary::of(stored.as_ref()))
}

/// Runs `session show`.
pub async fn show(context: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let summary = load(context).await?;
    output(&summary, format)
}

/// Runs `session restore`.
pub async fn restore(context: &Context, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = context.client.sessions();
    let restored = sessions.restore().await;
    let mut summary = SessionSummary::of(restored.as_ref());
    summary.last_failure = sessions.last_failure().map(|r| r.to_string());
    output(&summary, format)
}

/// Runs `session logout`.
pub async fn logout(context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    context.client.sessions().logout().await?;
    println!("Signed out");
    Ok(())
}

fn output(summary: &SessionSummary, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => print_json(summary),
        _ => {
            print_text_output(summary);
            Ok(())
        }
    }
}

fn print_text_output(summary: &SessionSummary) {
    println!("Pecal Session");
    println!("=============");
    println!();
    if !summary.signed_in {
        println!("Not signed in");
    } else {
        println!(
            "Account:  {} ({})",
            summary.display_name.as_deref().unwrap_or_default(),
            summary.subject_id.unwrap_or_default()
        );
        println!(
            "Provider: {}",
            summary.provider.as_deref().unwrap_or_default()
        );
        if let Some(email) = &summary.email {
            println!("Email:    {}", email);
        }
    }
    if let Some(reason) = &summary.last_failure {
        println!();
        println!("Last forced sign-out: {}", reason);
    }
}
