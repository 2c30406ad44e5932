use super::model::{ManagerCount, RelayStats, TokenUsage};
use crate::model::{OutboxTask, SeenPostCursor};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::collections::HashMap;
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'a> = Transaction<'a, Sqlite>;

const KEY_TOKEN_INDEX: &str = "current_token_index";
const KEY_INFLUENCER_OFFSET: &str = "influencer_offset";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// `YYYY-MM` bucket used for per-token call budgets.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

// ---- cursors ----

#[instrument(skip_all)]
pub async fn get_cursor(pool: &Pool, account_key: &str) -> Result<Option<SeenPostCursor>> {
    let row = sqlx::query("SELECT account_key, last_seen_id, updated_at FROM cursors WHERE account_key = ?")
        .bind(account_key)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let updated_at: String = row.get("updated_at");
    let updated_at = NaiveDateTime::parse_from_str(&updated_at, "%Y-%m-%d %H:%M:%S")
        .map(|n| n.and_utc())
        .unwrap_or_else(|_| Utc::now());
    Ok(Some(SeenPostCursor {
        account_key: row.get("account_key"),
        last_seen_id: row.get("last_seen_id"),
        updated_at,
    }))
}

pub async fn set_cursor(pool: &Pool, account_key: &str, last_seen_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    set_cursor_tx(&mut tx, account_key, last_seen_id).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn set_cursor_tx(tx: &mut Tx<'_>, account_key: &str, last_seen_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO cursors (account_key, last_seen_id, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(account_key) DO UPDATE SET last_seen_id = excluded.last_seen_id, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(account_key)
    .bind(last_seen_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---- twitter user id cache ----

pub async fn cached_user_id(pool: &Pool, username: &str) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>("SELECT user_id FROM twitter_user_ids WHERE username = ?")
        .bind(username.to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn cache_user_ids(pool: &Pool, entries: &[(String, String)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (username, user_id) in entries {
        sqlx::query(
            "INSERT INTO twitter_user_ids (username, user_id) VALUES (?, ?) \
             ON CONFLICT(username) DO UPDATE SET user_id = excluded.user_id, cached_at = CURRENT_TIMESTAMP",
        )
        .bind(username.to_lowercase())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Names from `usernames` without a cached id, in input order.
pub async fn uncached_usernames(pool: &Pool, usernames: &[String]) -> Result<Vec<String>> {
    let cached: Vec<String> = sqlx::query_scalar("SELECT username FROM twitter_user_ids")
        .fetch_all(pool)
        .await?;
    Ok(usernames
        .iter()
        .filter(|u| !cached.contains(&u.to_lowercase()))
        .cloned()
        .collect())
}

pub async fn count_cached_user_ids(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM twitter_user_ids")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Cached ids that belong to the current influencer list. The official
/// account's id shares the cache but is not counted here.
pub async fn count_cached_influencer_ids(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM twitter_user_ids u JOIN influencers i ON i.username = u.username",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// ---- influencer list ----

/// Replace the stored influencer list, keeping the given order.
#[instrument(skip_all)]
pub async fn replace_influencers(pool: &Pool, usernames: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM influencers").execute(&mut *tx).await?;
    for (position, username) in usernames.iter().enumerate() {
        sqlx::query("INSERT OR IGNORE INTO influencers (username, position) VALUES (?, ?)")
            .bind(username.to_lowercase())
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn list_influencers(pool: &Pool) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar("SELECT username FROM influencers ORDER BY position ASC")
        .fetch_all(pool)
        .await?;
    Ok(names)
}

pub async fn count_influencers(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM influencers")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---- scalar state ----

async fn get_kv_i64(pool: &Pool, key: &str) -> Result<Option<i64>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    match value {
        None => Ok(None),
        Some(v) => v
            .parse::<i64>()
            .map(Some)
            .map_err(|_| anyhow!("kv {} holds non-numeric value {:?}", key, v)),
    }
}

async fn set_kv_i64(pool: &Pool, key: &str, value: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn current_token_index(pool: &Pool) -> Result<usize> {
    Ok(get_kv_i64(pool, KEY_TOKEN_INDEX).await?.unwrap_or(0).max(0) as usize)
}

pub async fn set_current_token_index(pool: &Pool, index: usize) -> Result<()> {
    set_kv_i64(pool, KEY_TOKEN_INDEX, index as i64).await
}

pub async fn influencer_offset(pool: &Pool) -> Result<usize> {
    Ok(get_kv_i64(pool, KEY_INFLUENCER_OFFSET).await?.unwrap_or(0).max(0) as usize)
}

pub async fn set_influencer_offset(pool: &Pool, offset: usize) -> Result<()> {
    set_kv_i64(pool, KEY_INFLUENCER_OFFSET, offset as i64).await
}

// ---- token budget ----

pub async fn token_calls(pool: &Pool, token_index: usize, month: &str) -> Result<i64> {
    let calls: Option<i64> =
        sqlx::query_scalar("SELECT calls FROM token_usage WHERE token_index = ? AND month = ?")
            .bind(token_index as i64)
            .bind(month)
            .fetch_optional(pool)
            .await?;
    Ok(calls.unwrap_or(0))
}

#[instrument(skip_all)]
pub async fn record_token_call(pool: &Pool, token_index: usize, month: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO token_usage (token_index, month, calls) VALUES (?, ?, 1) \
         ON CONFLICT(token_index, month) DO UPDATE SET calls = calls + 1",
    )
    .bind(token_index as i64)
    .bind(month)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn token_usage_for_month(pool: &Pool, month: &str) -> Result<Vec<TokenUsage>> {
    let rows = sqlx::query("SELECT token_index, calls FROM token_usage WHERE month = ? ORDER BY token_index")
        .bind(month)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| TokenUsage {
            token_index: row.get::<i64, _>("token_index") as usize,
            calls: row.get("calls"),
        })
        .collect())
}

// ---- manager assignment ----

/// Pick the manager with the fewest assignments (first in `managers` on a tie)
/// and count the assignment.
///
/// Seeding rows first takes the write lock before the counts are read, so a
/// commit from another connection cannot invalidate the read snapshot.
#[instrument(skip_all)]
pub async fn assign_manager_tx(tx: &mut Tx<'_>, managers: &[String]) -> Result<String> {
    if managers.is_empty() {
        return Err(anyhow!("no influencer managers configured"));
    }
    for manager in managers {
        sqlx::query("INSERT OR IGNORE INTO manager_assignments (manager, count) VALUES (?, 0)")
            .bind(manager)
            .execute(&mut **tx)
            .await?;
    }

    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT manager, count FROM manager_assignments")
        .fetch_all(&mut **tx)
        .await?;
    let counts: HashMap<String, i64> = rows.into_iter().collect();

    let selected = managers
        .iter()
        .min_by_key(|m| counts.get(m.as_str()).copied().unwrap_or(0))
        .ok_or_else(|| anyhow!("no influencer managers configured"))?
        .clone();

    sqlx::query("UPDATE manager_assignments SET count = count + 1 WHERE manager = ?")
        .bind(&selected)
        .execute(&mut **tx)
        .await?;
    Ok(selected)
}

/// Assignment counts for `managers`, zero-filled, in the given order.
pub async fn manager_assignment_counts(pool: &Pool, managers: &[String]) -> Result<Vec<ManagerCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT manager, count FROM manager_assignments")
        .fetch_all(pool)
        .await?;
    let counts: HashMap<String, i64> = rows.into_iter().collect();
    Ok(managers
        .iter()
        .map(|m| ManagerCount {
            manager: m.clone(),
            count: counts.get(m).copied().unwrap_or(0),
        })
        .collect())
}

// ---- outbox ----

#[instrument(skip_all)]
pub async fn enqueue_outbox(
    pool: &Pool,
    chat_id: i64,
    recipient: &str,
    kind: &str,
    text: &str,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_outbox_tx(&mut tx, chat_id, recipient, kind, text).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn enqueue_outbox_tx(
    tx: &mut Tx<'_>,
    chat_id: i64,
    recipient: &str,
    kind: &str,
    text: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (chat_id, recipient, kind, text, attempt, due_at) VALUES (?, ?, ?, ?, 0, CURRENT_TIMESTAMP) RETURNING id",
    )
    .bind(chat_id)
    .bind(recipient)
    .bind(kind)
    .bind(text)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_outbox(pool: &Pool) -> Result<Option<OutboxTask>> {
    let row = sqlx::query(
        "SELECT id, chat_id, recipient, kind, text, attempt FROM outbox \
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| OutboxTask {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        recipient: row.get("recipient"),
        kind: row.get("kind"),
        text: row.get("text"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (uncapped when <= 0).
#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn count_remaining_outbox_tasks(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Everything `/stats` reports, read in one place.
pub async fn relay_stats(pool: &Pool, managers: &[String], month: &str) -> Result<RelayStats> {
    Ok(RelayStats {
        influencers: count_influencers(pool).await?,
        cached_user_ids: count_cached_influencer_ids(pool).await?,
        assignments: manager_assignment_counts(pool, managers).await?,
        token_usage: token_usage_for_month(pool, month).await?,
        pending_deliveries: count_remaining_outbox_tasks(pool).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("nested/relay.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", db.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(db.parent().unwrap().exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_secs(0, 60), 5);
        assert_eq!(backoff_secs(1, 60), 10);
        assert_eq!(backoff_secs(3, 60), 40);
        assert_eq!(backoff_secs(4, 60), 60);
        assert_eq!(backoff_secs(20, 0), 5 * 1024);
    }

    #[tokio::test]
    async fn cursor_roundtrip_and_overwrite() {
        let pool = setup_pool().await;
        assert!(get_cursor(&pool, "twitter:acct").await.unwrap().is_none());
        set_cursor(&pool, "twitter:acct", "100").await.unwrap();
        set_cursor(&pool, "twitter:acct", "200").await.unwrap();
        let cursor = get_cursor(&pool, "twitter:acct").await.unwrap().unwrap();
        assert_eq!(cursor.last_seen_id, "200");
        assert_eq!(cursor.account_key, "twitter:acct");
    }

    #[tokio::test]
    async fn user_id_cache_is_case_insensitive() {
        let pool = setup_pool().await;
        cache_user_ids(&pool, &[("Alice".into(), "1".into())]).await.unwrap();
        assert_eq!(cached_user_id(&pool, "ALICE").await.unwrap().as_deref(), Some("1"));
        let missing = uncached_usernames(&pool, &names(&["alice", "bob"])).await.unwrap();
        assert_eq!(missing, names(&["bob"]));
        assert_eq!(count_cached_user_ids(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_count_only_influencer_ids() {
        let pool = setup_pool().await;
        replace_influencers(&pool, &names(&["alice", "bob"])).await.unwrap();
        cache_user_ids(
            &pool,
            &[
                ("alice".into(), "1".into()),
                ("official".into(), "9".into()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(count_cached_user_ids(&pool).await.unwrap(), 2);
        assert_eq!(count_cached_influencer_ids(&pool).await.unwrap(), 1);

        let stats = relay_stats(&pool, &names(&["m"]), "2026-10").await.unwrap();
        assert_eq!(stats.influencers, 2);
        assert_eq!(stats.cached_user_ids, 1);
    }

    #[tokio::test]
    async fn influencer_list_is_replaced_in_order() {
        let pool = setup_pool().await;
        replace_influencers(&pool, &names(&["b", "a", "c"])).await.unwrap();
        replace_influencers(&pool, &names(&["z", "y"])).await.unwrap();
        assert_eq!(list_influencers(&pool).await.unwrap(), names(&["z", "y"]));
        assert_eq!(count_influencers(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn token_usage_accumulates_per_month() {
        let pool = setup_pool().await;
        record_token_call(&pool, 1, "2026-10").await.unwrap();
        record_token_call(&pool, 1, "2026-10").await.unwrap();
        record_token_call(&pool, 0, "2026-09").await.unwrap();
        assert_eq!(token_calls(&pool, 1, "2026-10").await.unwrap(), 2);
        assert_eq!(token_calls(&pool, 0, "2026-10").await.unwrap(), 0);
        let usage = token_usage_for_month(&pool, "2026-10").await.unwrap();
        assert_eq!(usage, vec![TokenUsage { token_index: 1, calls: 2 }]);
    }

    #[tokio::test]
    async fn manager_assignment_balances_with_tie_break() {
        let pool = setup_pool().await;
        let managers = names(&["igor", "roman", "dyma"]);
        let mut picked = Vec::new();
        for _ in 0..4 {
            let mut tx = pool.begin().await.unwrap();
            picked.push(assign_manager_tx(&mut tx, &managers).await.unwrap());
            tx.commit().await.unwrap();
        }
        assert_eq!(picked, names(&["igor", "roman", "dyma", "igor"]));
        let counts = manager_assignment_counts(&pool, &managers).await.unwrap();
        let counts: Vec<i64> = counts.into_iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![2, 1, 1]);
    }

    #[tokio::test]
    async fn manager_assignment_seeds_rows_before_counting() {
        let pool = setup_pool().await;
        let managers = names(&["igor", "roman"]);
        let mut tx = pool.begin().await.unwrap();
        assert_eq!(assign_manager_tx(&mut tx, &managers).await.unwrap(), "igor");
        tx.commit().await.unwrap();

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT manager, count FROM manager_assignments ORDER BY manager")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows, vec![("igor".to_string(), 1), ("roman".to_string(), 0)]);

        let mut tx = pool.begin().await.unwrap();
        assert!(assign_manager_tx(&mut tx, &[]).await.is_err());
    }

    #[tokio::test]
    async fn manager_assignment_under_concurrent_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("relay.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let managers = names(&["igor", "roman", "dyma"]);

        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = pool.clone();
            let managers = managers.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = pool.begin().await?;
                let picked = assign_manager_tx(&mut tx, &managers).await?;
                tx.commit().await?;
                enqueue_outbox(&pool, i, &picked, "influencer_post", "x").await?;
                let task = next_due_outbox(&pool).await?;
                if let Some(task) = task {
                    delete_outbox(&pool, task.id).await?;
                }
                anyhow::Ok(picked)
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let counts: Vec<i64> = manager_assignment_counts(&pool, &managers)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.count)
            .collect();
        assert_eq!(counts, vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn scalar_state_defaults_to_zero() {
        let pool = setup_pool().await;
        assert_eq!(current_token_index(&pool).await.unwrap(), 0);
        set_current_token_index(&pool, 3).await.unwrap();
        assert_eq!(current_token_index(&pool).await.unwrap(), 3);
        set_influencer_offset(&pool, 50).await.unwrap();
        assert_eq!(influencer_offset(&pool).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn outbox_due_order_and_backoff() {
        let pool = setup_pool().await;
        let first = enqueue_outbox(&pool, 1, "a", "official_post", "one").await.unwrap();
        let second = enqueue_outbox(&pool, 2, "b", "official_post", "two").await.unwrap();

        let task = next_due_outbox(&pool).await.unwrap().unwrap();
        assert_eq!(task.id, first);
        backoff_outbox_with_cap(&pool, task.id, task.attempt, 60).await.unwrap();

        let task = next_due_outbox(&pool).await.unwrap().unwrap();
        assert_eq!(task.id, second);
        delete_outbox(&pool, second).await.unwrap();

        assert!(next_due_outbox(&pool).await.unwrap().is_none());
        assert_eq!(count_remaining_outbox_tasks(&pool).await.unwrap(), 1);
    }
}
