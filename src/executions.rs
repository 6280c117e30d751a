#![cfg(not(tarpaulin_include))]

use crate::error::{AppError, Result};
use crate::models::{
    Execution, ExecutionDetail, ExecutionStatus, ProductChecklist, SessionUser, format_timestamp,
};
use crate::outlets;
use crate::query::{self, Page, Pagination};
use chrono::{Duration, NaiveDateTime};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::info;

const EXECUTION_COLUMNS: &str = "id, outlet_id, agent_id, execution_date, before_image, after_image, before_image_thumbnail, after_image_thumbnail, latitude, longitude, notes, products_available, execution_score, status, upload_method";

/// Execution joined with outlet and agent; callers append `WHERE ...`.
pub(crate) const DETAIL_SELECT: &str = "SELECT e.id, e.outlet_id, e.agent_id, e.execution_date, e.status, e.before_image, e.after_image,
        e.latitude, e.longitude, e.notes, e.products_available, e.upload_method,
        o.urn, o.outlet_name, o.customer_name, o.address, o.phone, o.outlet_type, o.local_govt, o.state, o.region,
        u.full_name AS agent_name
 FROM executions e
 JOIN outlets o ON o.id = e.outlet_id
 JOIN users u ON u.id = e.agent_id";

/// Query-string filters of the execution listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub agent_id: Option<i64>,
    pub region: Option<String>,
    /// One status or a comma separated list.
    pub status: Option<String>,
    pub search: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// What an agent submits when finishing a visit.
#[derive(Debug, Clone, Default)]
pub struct CompletionInput {
    pub before_image: Option<String>,
    pub after_image: Option<String>,
    pub before_image_thumbnail: Option<String>,
    pub after_image_thumbnail: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    pub products: ProductChecklist,
}

impl CompletionInput {
    fn validate(&self) -> Result<()> {
        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(AppError::validation("Latitude must be between -90 and 90"));
            }
        }
        if let Some(lng) = self.longitude {
            if !(-180.0..=180.0).contains(&lng) {
                return Err(AppError::validation(
                    "Longitude must be between -180 and 180",
                ));
            }
        }
        Ok(())
    }
}

/// An execution created by one of the importers.
#[derive(Debug, Clone)]
pub struct ImportedExecution {
    pub outlet_id: i64,
    pub agent_id: i64,
    pub execution_date: NaiveDateTime,
    pub status: ExecutionStatus,
    pub before_image: Option<String>,
    pub after_image: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    pub products: ProductChecklist,
    pub upload_method: &'static str,
}

impl ImportedExecution {
    pub fn new(outlet_id: i64, agent_id: i64, execution_date: NaiveDateTime, upload_method: &'static str) -> Self {
        ImportedExecution {
            outlet_id,
            agent_id,
            execution_date,
            status: ExecutionStatus::Completed,
            before_image: None,
            after_image: None,
            latitude: None,
            longitude: None,
            notes: None,
            products: ProductChecklist::default(),
            upload_method,
        }
    }
}

async fn pending_for(
    conn: &mut SqliteConnection,
    outlet_id: i64,
    agent_id: i64,
) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(&format!(
        "SELECT {} FROM executions WHERE outlet_id = ? AND agent_id = ? AND status = 'Pending'",
        EXECUTION_COLUMNS
    ))
    .bind(outlet_id)
    .bind(agent_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(execution)
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Execution> {
    sqlx::query_as::<_, Execution>(&format!(
        "SELECT {} FROM executions WHERE id = ?",
        EXECUTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Execution not found"))
}

/// Get or create the pending execution of `agent_id` at `outlet_id`.
///
/// Repeated calls return the same row; a pair never has two pending visits.
///
/// # Errors
/// * `NotFound` when the outlet does not exist
pub async fn start(
    conn: &mut SqliteConnection,
    outlet_id: i64,
    agent_id: i64,
    now: NaiveDateTime,
) -> Result<Execution> {
    outlets::get(conn, outlet_id).await?;
    if let Some(existing) = pending_for(conn, outlet_id, agent_id).await? {
        return Ok(existing);
    }

    sqlx::query(
        "INSERT OR IGNORE INTO executions (outlet_id, agent_id, execution_date, status, created_at, updated_at)
         VALUES (?, ?, ?, 'Pending', ?, ?)",
    )
    .bind(outlet_id)
    .bind(agent_id)
    .bind(format_timestamp(now))
    .bind(format_timestamp(now))
    .bind(format_timestamp(now))
    .execute(&mut *conn)
    .await?;

    let execution = pending_for(conn, outlet_id, agent_id)
        .await?
        .ok_or_else(|| AppError::not_found("Execution not found"))?;
    info!(execution_id = execution.id, outlet_id, agent_id, "visit started");
    Ok(execution)
}

/// Record a finished visit and return the execution id.
///
/// The agent's pending execution becomes `Completed` (one is inserted when
/// none exists), and pending executions of other agents at the same outlet
/// are dropped. Run inside a transaction.
///
/// # Errors
/// * `NotFound` when the outlet does not exist
/// * `Validation` for coordinates out of range
pub async fn complete(
    conn: &mut SqliteConnection,
    outlet_id: i64,
    agent_id: i64,
    input: CompletionInput,
    now: NaiveDateTime,
) -> Result<i64> {
    input.validate()?;
    outlets::get(conn, outlet_id).await?;
    let timestamp = format_timestamp(now);
    let products = input.products.to_json();

    let id = match pending_for(conn, outlet_id, agent_id).await? {
        Some(pending) => {
            sqlx::query(
                "UPDATE executions SET execution_date = ?, before_image = ?, after_image = ?,
                 before_image_thumbnail = ?, after_image_thumbnail = ?, latitude = ?, longitude = ?,
                 notes = ?, products_available = ?, status = 'Completed', updated_at = ? WHERE id = ?",
            )
            .bind(&timestamp)
            .bind(&input.before_image)
            .bind(&input.after_image)
            .bind(&input.before_image_thumbnail)
            .bind(&input.after_image_thumbnail)
            .bind(input.latitude)
            .bind(input.longitude)
            .bind(&input.notes)
            .bind(&products)
            .bind(&timestamp)
            .bind(pending.id)
            .execute(&mut *conn)
            .await?;
            pending.id
        }
        None => sqlx::query(
            "INSERT INTO executions (outlet_id, agent_id, execution_date, before_image, after_image,
             before_image_thumbnail, after_image_thumbnail, latitude, longitude, notes, products_available,
             status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'Completed', ?, ?)",
        )
        .bind(outlet_id)
        .bind(agent_id)
        .bind(&timestamp)
        .bind(&input.before_image)
        .bind(&input.after_image)
        .bind(&input.before_image_thumbnail)
        .bind(&input.after_image_thumbnail)
        .bind(input.latitude)
        .bind(input.longitude)
        .bind(&input.notes)
        .bind(&products)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid(),
    };

    let dropped = sqlx::query(
        "DELETE FROM executions WHERE outlet_id = ? AND status = 'Pending' AND agent_id != ?",
    )
    .bind(outlet_id)
    .bind(agent_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    info!(execution_id = id, outlet_id, agent_id, dropped_pending = dropped, "visit completed");
    Ok(id)
}

pub async fn get_detail(conn: &mut SqliteConnection, id: i64) -> Result<ExecutionDetail> {
    let detail = sqlx::query_as::<_, ExecutionDetail>(&format!("{} WHERE e.id = ?", DETAIL_SELECT))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("Execution not found"))?;
    Ok(detail.with_products())
}

fn push_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    user: &SessionUser,
    filter: &ExecutionFilter,
) -> Result<()> {
    match filter.agent_id {
        Some(agent_id) => {
            qb.push(" AND e.agent_id = ");
            qb.push_bind(agent_id);
        }
        None if user.is_field_agent() => {
            qb.push(" AND e.agent_id = ");
            qb.push_bind(user.user_id);
        }
        None => {}
    }
    query::push_eq(qb, "o.region", filter.region.as_deref());
    query::push_status(qb, "e.status", filter.status.as_deref())?;
    query::push_search(
        qb,
        &["o.outlet_name", "o.urn", "o.address", "u.full_name"],
        filter.search.as_deref(),
    );
    if let Some(start) = filter.start_date.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND date(e.execution_date) >= ");
        qb.push_bind(query::parse_date(start)?.to_string());
    }
    if let Some(end) = filter.end_date.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND date(e.execution_date) <= ");
        qb.push_bind(query::parse_date(end)?.to_string());
    }
    Ok(())
}

/// Filtered, paginated execution listing, newest first.
///
/// Without an explicit `agent_id` filter, field agents only see their own
/// executions.
pub async fn list(
    conn: &mut SqliteConnection,
    user: &SessionUser,
    filter: &ExecutionFilter,
    pagination: Pagination,
) -> Result<Page<ExecutionDetail>> {
    let mut count = QueryBuilder::<Sqlite>::new(
        "SELECT COUNT(*) FROM executions e JOIN outlets o ON o.id = e.outlet_id JOIN users u ON u.id = e.agent_id WHERE 1=1",
    );
    push_filters(&mut count, user, filter)?;
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(DETAIL_SELECT);
    qb.push(" WHERE 1=1");
    push_filters(&mut qb, user, filter)?;
    qb.push(" ORDER BY e.execution_date DESC, e.id DESC");
    pagination.push_limit(&mut qb);
    let items = qb
        .build_query_as::<ExecutionDetail>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(ExecutionDetail::with_products)
        .collect();

    Ok(Page {
        items,
        pagination: pagination.info(total),
    })
}

/// Up to five executions from the last two days. Only admins see everyone's.
pub async fn recent(
    conn: &mut SqliteConnection,
    user: &SessionUser,
    now: NaiveDateTime,
) -> Result<Vec<ExecutionDetail>> {
    let mut qb = QueryBuilder::<Sqlite>::new(DETAIL_SELECT);
    qb.push(" WHERE e.execution_date >= ");
    qb.push_bind(format_timestamp(now - Duration::days(2)));
    if !user.is_admin() {
        qb.push(" AND e.agent_id = ");
        qb.push_bind(user.user_id);
    }
    qb.push(" ORDER BY e.execution_date DESC LIMIT 5");
    let items = qb
        .build_query_as::<ExecutionDetail>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(ExecutionDetail::with_products)
        .collect();
    Ok(items)
}

/// Every execution, newest first, for the admin listing.
pub async fn list_admin(conn: &mut SqliteConnection) -> Result<Vec<ExecutionDetail>> {
    let items = sqlx::query_as::<_, ExecutionDetail>(&format!(
        "{} ORDER BY e.execution_date DESC, e.id DESC",
        DETAIL_SELECT
    ))
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(ExecutionDetail::with_products)
    .collect();
    Ok(items)
}

/// Delete an execution and return the names of the image files it referenced.
pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<Vec<String>> {
    let execution = get(conn, id).await?;
    sqlx::query("DELETE FROM executions WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    info!(execution_id = id, "execution deleted");

    Ok([
        execution.before_image,
        execution.after_image,
        execution.before_image_thumbnail,
        execution.after_image_thumbnail,
    ]
    .into_iter()
    .flatten()
    .filter(|name| !name.is_empty())
    .collect())
}

/// Insert an execution coming from a bulk upload and return its id.
pub async fn insert_imported(conn: &mut SqliteConnection, execution: &ImportedExecution) -> Result<i64> {
    let timestamp = format_timestamp(execution.execution_date);
    let id = sqlx::query(
        "INSERT INTO executions (outlet_id, agent_id, execution_date, before_image, after_image, latitude, longitude,
         notes, products_available, status, upload_method, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(execution.outlet_id)
    .bind(execution.agent_id)
    .bind(&timestamp)
    .bind(&execution.before_image)
    .bind(&execution.after_image)
    .bind(execution.latitude)
    .bind(execution.longitude)
    .bind(&execution.notes)
    .bind(execution.products.to_json())
    .bind(execution.status)
    .bind(execution.upload_method)
    .bind(&timestamp)
    .bind(&timestamp)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Whether an outlet with this URN or name has an execution since `since`.
pub async fn has_recent_for(
    conn: &mut SqliteConnection,
    urn: &str,
    outlet_name: &str,
    since: NaiveDateTime,
) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM executions e JOIN outlets o ON o.id = e.outlet_id
         WHERE (o.urn = ? OR o.outlet_name = ?) AND e.execution_date >= ?",
    )
    .bind(urn)
    .bind(outlet_name)
    .bind(format_timestamp(since))
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}
