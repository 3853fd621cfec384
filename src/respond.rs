//! One-shot response to an actionable notification.
//!
//! A notification starts unactioned and may transition to responded
//! exactly once. The transition only commits after every keystroke of
//! the chosen action reached the pane; a failed key-send leaves the
//! notification unactioned so the caller may retry.
//!
//! Key sequences:
//! - `approve` sends `y`
//! - `reject` sends `Escape`
//! - `text` sends the literal text, then `Enter`

use thiserror::Error;

use crate::store::{MarkOutcome, ResponseAction, Store};
use crate::tmux::{self, KeySink, TmuxError};

#[derive(Debug, Error)]
pub enum RespondError {
    #[error("action must be 'approve', 'reject', or 'text'")]
    InvalidAction,
    #[error("notification not found")]
    NotFound,
    #[error("no valid tmux pane for this notification")]
    NoTarget,
    #[error("already responded to this notification")]
    AlreadyResponded,
    #[error("text field required for text action")]
    MissingText,
    #[error(transparent)]
    Tool(#[from] TmuxError),
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
}

/// Successful response: what was sent, and where.
#[derive(Clone, Debug)]
pub struct Responded {
    pub action: ResponseAction,
    pub tmux_pane: String,
}

/// Validate and execute a one-time response against the notification's
/// pane.
///
/// All validation runs before any key is sent, so rejected requests
/// have no side effect. At-most-once is enforced twice: an early check
/// fails fast, and the final commit is the store's write-once
/// transition, so concurrent responders cannot both succeed.
pub async fn respond(
    store: &Store,
    keys: &dyn KeySink,
    notification_id: &str,
    action: &str,
    text: Option<&str>,
) -> Result<Responded, RespondError> {
    let action = ResponseAction::parse(action).ok_or(RespondError::InvalidAction)?;

    let notification = store
        .get_notification(notification_id)
        .map_err(RespondError::Storage)?
        .ok_or(RespondError::NotFound)?;

    let pane = notification
        .tmux_pane
        .filter(|p| tmux::is_valid_pane(p))
        .ok_or(RespondError::NoTarget)?;

    if notification.responded.is_some() {
        return Err(RespondError::AlreadyResponded);
    }

    let sequence: Vec<&str> = match action {
        ResponseAction::Approve => vec!["y"],
        ResponseAction::Reject => vec!["Escape"],
        ResponseAction::Text => {
            let text = text.filter(|t| !t.is_empty()).ok_or(RespondError::MissingText)?;
            vec![text, "Enter"]
        }
    };

    for key in &sequence {
        keys.send_keys(&pane, key).await?;
    }

    match store
        .mark_responded(notification_id, action)
        .map_err(RespondError::Storage)?
    {
        MarkOutcome::Applied => {
            log::info!(
                "[Respond] {} -> pane {} ({})",
                notification_id,
                pane,
                action.as_str()
            );
            Ok(Responded {
                action,
                tmux_pane: pane,
            })
        }
        MarkOutcome::AlreadyResponded(_) => Err(RespondError::AlreadyResponded),
        MarkOutcome::NotFound => Err(RespondError::NotFound),
    }
}
