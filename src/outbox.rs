use crate::db;
use crate::telegram::Messenger;
use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{error, info, instrument, warn};

/// Deliver the next due outbox row, if any. Returns whether a row was handled.
///
/// A failed delivery is retried with capped exponential backoff until it has
/// been attempted `max_attempts` times, then dropped.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    messenger: &dyn Messenger,
    max_backoff_secs: i64,
    max_attempts: i32,
) -> Result<bool> {
    let Some(task) = db::next_due_outbox(pool).await? else {
        return Ok(false);
    };

    match messenger.send_text(task.chat_id, &task.text).await {
        Ok(()) => {
            db::delete_outbox(pool, task.id).await?;
            info!(
                id = task.id,
                kind = %task.kind,
                recipient = %task.recipient,
                "delivery succeeded"
            );
        }
        Err(err) if task.attempt + 1 >= max_attempts => {
            error!(
                ?err,
                id = task.id,
                kind = %task.kind,
                recipient = %task.recipient,
                attempt = task.attempt,
                "delivery failed permanently; dropping"
            );
            db::delete_outbox(pool, task.id).await?;
        }
        Err(err) => {
            warn!(
                ?err,
                id = task.id,
                kind = %task.kind,
                recipient = %task.recipient,
                attempt = task.attempt,
                "delivery failed; backoff"
            );
            db::backoff_outbox_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}

/// Deliver every row that is due right now. Rows pushed into backoff are left
/// for later. Returns the number of rows handled.
pub async fn drain_due(
    pool: &SqlitePool,
    messenger: &dyn Messenger,
    max_backoff_secs: i64,
    max_attempts: i32,
) -> Result<usize> {
    let mut handled = 0;
    while process_next_task(pool, messenger, max_backoff_secs, max_attempts).await? {
        handled += 1;
    }
    Ok(handled)
}
