use super::model::{AppleRegistration, DispatchRecord};
use crate::model::{Campaign, Client, PassState, PushRequest, PushStatus, RecipientPass, WalletPlatform};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// The one definition of an addressable pass. Every query that selects or
/// counts recipients embeds this fragment; `RecipientPass::is_eligible` mirrors it.
pub const ELIGIBLE_PASS_PREDICATE: &str =
    "deleted_at IS NULL AND (verified = 1 OR installed_on_ios = 1 OR installed_on_android = 1)";

const PUSH_REQUEST_COLUMNS: &str = "id, campaign_id, message, edited_message, edited_at, status, \
     created_at, scheduled_at, approved_at, claimed_at, sent_at, rejection_reason, \
     recipients_count, success_count, failure_count, last_error";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
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
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_campaign(pool: &Pool, campaign_id: i64) -> Result<Option<Campaign>> {
    let row = sqlx::query(
        "SELECT c.id, c.name, c.config, k.id AS client_id, k.business_name \
         FROM campaigns c JOIN clients k ON k.id = c.client_id WHERE c.id = ?",
    )
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let raw_config: String = row.get("config");
    let config = serde_json::from_str(&raw_config)
        .with_context(|| format!("campaign {campaign_id} has malformed config"))?;
    Ok(Some(Campaign {
        id: row.get("id"),
        name: row.get("name"),
        config,
        client: Client {
            id: row.get("client_id"),
            business_name: row.get("business_name"),
        },
    }))
}

#[instrument(skip_all)]
pub async fn list_eligible_passes(pool: &Pool, campaign_id: i64) -> Result<Vec<RecipientPass>> {
    let sql = format!(
        "SELECT id, campaign_id, platform, state, verified, installed_on_ios, installed_on_android, \
         deleted_at IS NOT NULL AS deleted \
         FROM passes WHERE campaign_id = ? AND {ELIGIBLE_PASS_PREDICATE} ORDER BY created_at, id"
    );
    let rows = sqlx::query(&sql).bind(campaign_id).fetch_all(pool).await?;
    rows.iter().map(recipient_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_eligible_passes(pool: &Pool, campaign_id: i64) -> Result<i64> {
    let sql =
        format!("SELECT COUNT(*) FROM passes WHERE campaign_id = ? AND {ELIGIBLE_PASS_PREDICATE}");
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(campaign_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn recipient_from_row(row: &SqliteRow) -> Result<RecipientPass> {
    let id: String = row.try_get("id")?;
    let platform: Option<String> = row.try_get("platform")?;
    let raw_state: String = row.try_get("state")?;
    let state = match serde_json::from_str::<PassState>(&raw_state) {
        Ok(state) => state,
        Err(err) => {
            warn!(pass_id = %id, ?err, "pass state is not valid JSON; using empty state");
            PassState::default()
        }
    };
    Ok(RecipientPass {
        platform: WalletPlatform::from_column(platform.as_deref()),
        campaign_id: row.try_get("campaign_id")?,
        state,
        verified: row.try_get("verified")?,
        installed_on_ios: row.try_get("installed_on_ios")?,
        installed_on_android: row.try_get("installed_on_android")?,
        deleted: row.try_get("deleted")?,
        id,
    })
}

const PASS_STATE_WRITE_ATTEMPTS: usize = 3;

/// Typed read-modify-write of one pass's state. The write is conditional on the
/// state read, so a concurrent writer forces a re-read instead of being
/// overwritten. Fails when the pass is missing, soft-deleted, or its stored
/// state cannot be parsed; the stored state is left untouched in those cases.
#[instrument(skip_all, fields(pass_id = %pass_id))]
pub async fn update_pass_state<F>(pool: &Pool, pass_id: &str, patch: F) -> Result<PassState>
where
    F: Fn(&mut PassState),
{
    for _ in 0..PASS_STATE_WRITE_ATTEMPTS {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT state FROM passes WHERE id = ? AND deleted_at IS NULL")
                .bind(pass_id)
                .fetch_optional(pool)
                .await?;
        let Some(raw) = raw else {
            return Err(anyhow!("pass {} not found", pass_id));
        };
        let mut state: PassState = serde_json::from_str(&raw)
            .with_context(|| format!("pass {pass_id} has malformed state"))?;
        patch(&mut state);

        let res = sqlx::query(
            "UPDATE passes SET state = ?, updated_at = ? WHERE id = ? AND state = ? AND deleted_at IS NULL",
        )
        .bind(serde_json::to_string(&state)?)
        .bind(Utc::now())
        .bind(pass_id)
        .bind(&raw)
        .execute(pool)
        .await?;
        if res.rows_affected() == 1 {
            return Ok(state);
        }
    }
    Err(anyhow!(
        "pass {} state changed concurrently {} times; giving up",
        pass_id,
        PASS_STATE_WRITE_ATTEMPTS
    ))
}

#[instrument(skip_all)]
pub async fn list_apple_registrations(pool: &Pool, pass_id: &str) -> Result<Vec<AppleRegistration>> {
    let rows = sqlx::query(
        "SELECT id, pass_id, device_library_id, push_token FROM apple_registrations WHERE pass_id = ? ORDER BY id",
    )
    .bind(pass_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| AppleRegistration {
            id: row.get("id"),
            pass_id: row.get("pass_id"),
            device_library_id: row.get("device_library_id"),
            push_token: row.get("push_token"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn delete_apple_registration(pool: &Pool, registration_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM apple_registrations WHERE id = ?")
        .bind(registration_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_push_request(
    pool: &Pool,
    campaign_id: i64,
    message: &str,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO push_requests (campaign_id, message, status, created_at, scheduled_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(campaign_id)
    .bind(message)
    .bind(PushStatus::Pending.as_str())
    .bind(created_at)
    .bind(scheduled_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_push_request(pool: &Pool, id: i64) -> Result<Option<PushRequest>> {
    let sql = format!("SELECT {PUSH_REQUEST_COLUMNS} FROM push_requests WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(push_request_from_row).transpose()
}

fn push_request_from_row(row: &SqliteRow) -> Result<PushRequest> {
    let id: i64 = row.try_get("id")?;
    let status_str: String = row.try_get("status")?;
    let status = PushStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("push request {} has unknown status {}", id, status_str))?;
    Ok(PushRequest {
        id,
        campaign_id: row.try_get("campaign_id")?,
        message: row.try_get("message")?,
        edited_message: row.try_get("edited_message")?,
        edited_at: row.try_get("edited_at")?,
        status,
        created_at: row.try_get("created_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        approved_at: row.try_get("approved_at")?,
        claimed_at: row.try_get("claimed_at")?,
        sent_at: row.try_get("sent_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
        recipients_count: row.try_get("recipients_count")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        last_error: row.try_get("last_error")?,
    })
}

/// Store an operator edit. Only lands while the request is still `pending`.
#[instrument(skip_all)]
pub async fn update_pending_message(
    pool: &Pool,
    id: i64,
    edited_message: &str,
    edited_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE push_requests SET edited_message = ?, edited_at = ? WHERE id = ? AND status = ?",
    )
    .bind(edited_message)
    .bind(edited_at)
    .bind(id)
    .bind(PushStatus::Pending.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Compare-and-set on `status`. Returns `false` when the row was no longer in
/// `from`, which means another caller won the transition.
///
/// Moving out of `pending` stamps `approved_at`; claiming for dispatch stamps
/// `claimed_at`.
#[instrument(skip_all, fields(request_id = id, from = %from, to = %to))]
pub async fn transition_status(
    pool: &Pool,
    id: i64,
    from: PushStatus,
    to: PushStatus,
    at: DateTime<Utc>,
) -> Result<bool> {
    let approved_at = (from == PushStatus::Pending && to != PushStatus::Rejected).then_some(at);
    let claimed_at = (to == PushStatus::Processing).then_some(at);
    let res = sqlx::query(
        "UPDATE push_requests SET status = ?, approved_at = COALESCE(?, approved_at), claimed_at = COALESCE(?, claimed_at) \
         WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(approved_at)
    .bind(claimed_at)
    .bind(id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn reject_pending(pool: &Pool, id: i64, reason: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE push_requests SET status = ?, rejection_reason = ? WHERE id = ? AND status = ?",
    )
    .bind(PushStatus::Rejected.as_str())
    .bind(reason)
    .bind(id)
    .bind(PushStatus::Pending.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Whole-row terminal write for a request this caller claimed.
#[instrument(skip_all)]
pub async fn complete_push_request(pool: &Pool, id: i64, record: &DispatchRecord) -> Result<bool> {
    if !record.status.is_terminal() {
        return Err(anyhow!(
            "refusing to complete push request {} with non-terminal status {}",
            id,
            record.status
        ));
    }
    let res = sqlx::query(
        "UPDATE push_requests SET status = ?, sent_at = ?, recipients_count = ?, success_count = ?, \
         failure_count = ?, last_error = ? WHERE id = ? AND status = ?",
    )
    .bind(record.status.as_str())
    .bind(record.sent_at)
    .bind(record.recipients_count)
    .bind(record.success_count)
    .bind(record.failure_count)
    .bind(record.last_error.as_deref())
    .bind(id)
    .bind(PushStatus::Processing.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn list_due_scheduled(
    pool: &Pool,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<PushRequest>> {
    let sql = format!(
        "SELECT {PUSH_REQUEST_COLUMNS} FROM push_requests \
         WHERE status = ? AND scheduled_at IS NOT NULL AND julianday(scheduled_at) <= julianday(?) \
         ORDER BY julianday(scheduled_at) ASC, id ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(PushStatus::Scheduled.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(push_request_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_queued(pool: &Pool, limit: u32) -> Result<Vec<PushRequest>> {
    let sql = format!(
        "SELECT {PUSH_REQUEST_COLUMNS} FROM push_requests WHERE status = ? \
         ORDER BY julianday(approved_at) ASC, id ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(PushStatus::Queued.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(push_request_from_row).collect()
}

/// Fail requests whose dispatcher claimed them at or before `cutoff` and never
/// wrote an outcome. Returns how many rows were failed.
#[instrument(skip_all)]
pub async fn fail_stale_processing(
    pool: &Pool,
    cutoff: DateTime<Utc>,
    last_error: &str,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE push_requests SET status = ?, last_error = ?, recipients_count = 0, success_count = 0, failure_count = 0 \
         WHERE status = ? AND claimed_at IS NOT NULL AND julianday(claimed_at) <= julianday(?)",
    )
    .bind(PushStatus::Failed.as_str())
    .bind(last_error)
    .bind(PushStatus::Processing.as_str())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
