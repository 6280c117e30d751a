#![cfg(not(tarpaulin_include))]

use crate::error::{AppError, Result};
use crate::models::{Outlet, OutletInput, SessionUser, format_timestamp, non_empty, now};
use crate::query::{self, Page, Pagination};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::info;

const OUTLET_COLUMNS: &str = "o.id, o.urn, o.outlet_name, o.customer_name, o.address, o.phone, o.outlet_type, o.local_govt, o.state, o.region, o.created_at, o.updated_at, o.is_active";

/// Columns searched by the free-text `search` filter.
const SEARCH_COLUMNS: [&str; 5] = [
    "o.outlet_name",
    "o.customer_name",
    "o.address",
    "o.phone",
    "o.urn",
];

/// Query-string filters accepted by the outlet listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutletFilter {
    pub region: Option<String>,
    pub state: Option<String>,
    pub local_govt: Option<String>,
    pub outlet_type: Option<String>,
    pub search: Option<String>,
}

impl OutletFilter {
    fn push(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        query::push_eq(qb, "o.region", self.region.as_deref());
        query::push_eq(qb, "o.state", self.state.as_deref());
        query::push_eq(qb, "o.local_govt", self.local_govt.as_deref());
        query::push_eq(qb, "o.outlet_type", self.outlet_type.as_deref());
        query::push_search(qb, &SEARCH_COLUMNS, self.search.as_deref());
    }
}

/// Column a bulk outlet operation groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutletGroup {
    Region,
    State,
    LocalGovt,
}

impl OutletGroup {
    pub fn parse(value: &str) -> Option<OutletGroup> {
        match value.trim() {
            "region" => Some(OutletGroup::Region),
            "state" => Some(OutletGroup::State),
            "local_govt" => Some(OutletGroup::LocalGovt),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            OutletGroup::Region => "region",
            OutletGroup::State => "state",
            OutletGroup::LocalGovt => "local_govt",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OutletPreview {
    pub id: i64,
    pub urn: String,
    pub outlet_name: String,
    pub region: String,
    pub state: Option<String>,
    pub local_govt: Option<String>,
    pub execution_count: i64,
}

/// Outcome of [`upsert_by_urn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted(i64),
    Updated(i64),
}

impl Upserted {
    pub fn id(&self) -> i64 {
        match self {
            Upserted::Inserted(id) | Upserted::Updated(id) => *id,
        }
    }
}

async fn id_for_urn(conn: &mut SqliteConnection, urn: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar("SELECT id FROM outlets WHERE urn = ?")
        .bind(urn)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

async fn insert(conn: &mut SqliteConnection, input: &OutletInput) -> Result<i64> {
    let timestamp = format_timestamp(now());
    let id = sqlx::query(
        "INSERT INTO outlets (urn, outlet_name, customer_name, address, phone, outlet_type, local_govt, state, region, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&input.urn)
    .bind(&input.outlet_name)
    .bind(non_empty(&input.customer_name))
    .bind(non_empty(&input.address))
    .bind(non_empty(&input.phone))
    .bind(non_empty(&input.outlet_type))
    .bind(non_empty(&input.local_govt))
    .bind(non_empty(&input.state))
    .bind(&input.region)
    .bind(&timestamp)
    .bind(&timestamp)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

async fn overwrite(conn: &mut SqliteConnection, id: i64, input: &OutletInput) -> Result<()> {
    sqlx::query(
        "UPDATE outlets SET urn = ?, outlet_name = ?, customer_name = ?, address = ?, phone = ?, outlet_type = ?,
         local_govt = ?, state = ?, region = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&input.urn)
    .bind(&input.outlet_name)
    .bind(non_empty(&input.customer_name))
    .bind(non_empty(&input.address))
    .bind(non_empty(&input.phone))
    .bind(non_empty(&input.outlet_type))
    .bind(non_empty(&input.local_govt))
    .bind(non_empty(&input.state))
    .bind(&input.region)
    .bind(format_timestamp(now()))
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Create an outlet and return its id.
///
/// # Errors
/// * `Validation` when URN, name or region is blank
/// * `Conflict` when the URN already exists
pub async fn create(conn: &mut SqliteConnection, input: OutletInput) -> Result<i64> {
    let input = input.normalized();
    input.validate()?;
    if id_for_urn(conn, &input.urn).await?.is_some() {
        return Err(AppError::conflict("An outlet with this URN already exists"));
    }
    let id = insert(conn, &input).await?;
    info!(outlet_id = id, urn = %input.urn, "outlet created");
    Ok(id)
}

/// Replace an outlet's fields.
///
/// # Errors
/// * `NotFound` when the outlet does not exist
/// * `Conflict` when the URN belongs to another outlet
pub async fn update(conn: &mut SqliteConnection, id: i64, input: OutletInput) -> Result<()> {
    let input = input.normalized();
    input.validate()?;
    get(conn, id).await?;
    if let Some(owner) = id_for_urn(conn, &input.urn).await? {
        if owner != id {
            return Err(AppError::conflict(
                "Another outlet with this URN already exists",
            ));
        }
    }
    overwrite(conn, id, &input).await?;
    info!(outlet_id = id, "outlet updated");
    Ok(())
}

/// Insert the outlet, or overwrite the one that already carries its URN.
pub async fn upsert_by_urn(conn: &mut SqliteConnection, input: OutletInput) -> Result<Upserted> {
    let input = input.normalized();
    input.validate()?;
    match id_for_urn(conn, &input.urn).await? {
        Some(id) => {
            overwrite(conn, id, &input).await?;
            Ok(Upserted::Updated(id))
        }
        None => Ok(Upserted::Inserted(insert(conn, &input).await?)),
    }
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Outlet> {
    sqlx::query_as::<_, Outlet>(&format!(
        "SELECT {} FROM outlets o WHERE o.id = ?",
        OUTLET_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Outlet not found"))
}

pub async fn find_by_urn(conn: &mut SqliteConnection, urn: &str) -> Result<Option<Outlet>> {
    let outlet = sqlx::query_as::<_, Outlet>(&format!(
        "SELECT {} FROM outlets o WHERE o.urn = ?",
        OUTLET_COLUMNS
    ))
    .bind(urn.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(outlet)
}

/// Every outlet, ordered for the admin listing.
pub async fn list_all(conn: &mut SqliteConnection) -> Result<Vec<Outlet>> {
    let outlets = sqlx::query_as::<_, Outlet>(&format!(
        "SELECT {} FROM outlets o ORDER BY o.region, o.state, o.local_govt, o.outlet_name",
        OUTLET_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(outlets)
}

/// Delete an outlet that has never been visited.
///
/// # Errors
/// * `Conflict` when executions reference the outlet
/// * `NotFound` when it does not exist
pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    let outlet = get(conn, id).await?;
    let (executions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM executions WHERE outlet_id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    if executions > 0 {
        return Err(AppError::conflict(format!(
            "Cannot delete outlet with {} executions",
            executions
        )));
    }
    sqlx::query("DELETE FROM outlets WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    info!(outlet_id = id, urn = %outlet.urn, "outlet deleted");
    Ok(())
}

/// Run a filtered, paginated outlet listing.
///
/// `base` must select from `outlets o` and end in a WHERE clause.
async fn paged(
    conn: &mut SqliteConnection,
    base: &str,
    since: Option<NaiveDateTime>,
    user: &SessionUser,
    filter: &OutletFilter,
    pagination: Pagination,
) -> Result<Page<Outlet>> {
    let build = |select: &str| {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM outlets o WHERE ", select));
        qb.push(base);
        if let Some(since) = since {
            qb.push_bind(format_timestamp(since));
            qb.push(")");
        }
        query::push_agent_scope(&mut qb, user, "o.region", "o.state");
        filter.push(&mut qb);
        qb
    };

    let total: i64 = build("COUNT(*)")
        .build_query_scalar()
        .fetch_one(&mut *conn)
        .await?;

    let mut qb = build(OUTLET_COLUMNS);
    qb.push(" ORDER BY o.outlet_name");
    pagination.push_limit(&mut qb);
    let items = qb.build_query_as::<Outlet>().fetch_all(&mut *conn).await?;

    Ok(Page {
        items,
        pagination: pagination.info(total),
    })
}

/// Outlets that still have no completed execution.
///
/// Field agents only see outlets in their own region (and state, if set).
pub async fn list_pending(
    conn: &mut SqliteConnection,
    user: &SessionUser,
    filter: &OutletFilter,
    pagination: Pagination,
) -> Result<Page<Outlet>> {
    paged(
        conn,
        "NOT EXISTS (SELECT 1 FROM executions e WHERE e.outlet_id = o.id AND e.status = 'Completed')",
        None,
        user,
        filter,
        pagination,
    )
    .await
}

/// Outlets with no completed execution during the seven days before `now`.
pub async fn list_unvisited(
    conn: &mut SqliteConnection,
    user: &SessionUser,
    filter: &OutletFilter,
    pagination: Pagination,
    now: NaiveDateTime,
) -> Result<Page<Outlet>> {
    paged(
        conn,
        "NOT EXISTS (SELECT 1 FROM executions e WHERE e.outlet_id = o.id AND e.status = 'Completed' AND e.execution_date >= ",
        Some(now - Duration::days(7)),
        user,
        filter,
        pagination,
    )
    .await
}

/// Plain outlet lookup by location for the map and pickers.
pub async fn search(
    conn: &mut SqliteConnection,
    user: &SessionUser,
    filter: &OutletFilter,
) -> Result<Vec<Outlet>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM outlets o WHERE 1=1",
        OUTLET_COLUMNS
    ));
    filter.push(&mut qb);
    if user.is_field_agent() {
        query::push_eq(&mut qb, "o.region", user.region.as_deref());
    }
    qb.push(" ORDER BY o.outlet_name");
    let outlets = qb.build_query_as::<Outlet>().fetch_all(&mut *conn).await?;
    Ok(outlets)
}

/// Outlets a bulk delete on `group = value` would consider.
pub async fn bulk_preview(
    conn: &mut SqliteConnection,
    group: OutletGroup,
    value: &str,
) -> Result<Vec<OutletPreview>> {
    let outlets = sqlx::query_as::<_, OutletPreview>(&format!(
        "SELECT o.id, o.urn, o.outlet_name, o.region, o.state, o.local_govt,
                (SELECT COUNT(*) FROM executions e WHERE e.outlet_id = o.id) AS execution_count
         FROM outlets o WHERE o.{} = ? ORDER BY o.outlet_name",
        group.column()
    ))
    .bind(value.trim())
    .fetch_all(&mut *conn)
    .await?;
    Ok(outlets)
}

/// Delete every outlet whose `group` column equals `value`.
///
/// Executions of deleted outlets cascade unless `skip_with_executions` keeps
/// visited outlets out of the delete.
///
/// # Errors
/// * `Validation` when nothing matches
pub async fn bulk_delete(
    conn: &mut SqliteConnection,
    group: OutletGroup,
    value: &str,
    skip_with_executions: bool,
) -> Result<u64> {
    let mut sql = format!("DELETE FROM outlets WHERE {} = ?", group.column());
    if skip_with_executions {
        sql.push_str(" AND id NOT IN (SELECT DISTINCT outlet_id FROM executions)");
    }
    let deleted = sqlx::query(&sql)
        .bind(value.trim())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(AppError::validation("No records found matching the criteria"));
    }
    info!(group = group.column(), %value, deleted, "bulk outlet delete");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use sqlx::SqlitePool;

    pub(crate) fn outlet(urn: &str, name: &str, region: &str, state: &str) -> OutletInput {
        OutletInput {
            urn: urn.into(),
            outlet_name: name.into(),
            region: region.into(),
            state: state.into(),
            outlet_type: "Shop".into(),
            ..Default::default()
        }
    }

    fn viewer(role: Role, region: Option<&str>, state: Option<&str>) -> SessionUser {
        SessionUser {
            user_id: 1,
            username: "viewer".into(),
            full_name: "Viewer".into(),
            role,
            region: region.map(Into::into),
            state: state.map(Into::into),
            lga: None,
        }
    }

    async fn seeded() -> SqlitePool {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        create(&mut conn, outlet("SW-001", "Alaba Stores", "SW", "LAGOS")).await.unwrap();
        create(&mut conn, outlet("SW-002", "Bode Kiosk", "SW", "OYO")).await.unwrap();
        create(&mut conn, outlet("NW-001", "Kano Corner", "NW", "KANO")).await.unwrap();
        drop(conn);
        pool
    }

    #[tokio::test]
    async fn duplicate_urn_rejected_on_create_and_update() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.unwrap();

        let err = create(&mut conn, outlet(" SW-001 ", "Other", "SW", "")).await.unwrap_err();
        assert_eq!(err.to_string(), "An outlet with this URN already exists");

        let kano = find_by_urn(&mut conn, "NW-001").await.unwrap().unwrap();
        let err = update(&mut conn, kano.id, outlet("SW-002", "Kano Corner", "NW", "KANO"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        update(&mut conn, kano.id, outlet("NW-001", "Kano Corner 2", "NW", "KANO"))
            .await
            .unwrap();
        assert_eq!(get(&mut conn, kano.id).await.unwrap().outlet_name, "Kano Corner 2");
    }

    #[tokio::test]
    async fn upsert_by_urn_updates_existing() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.unwrap();
        let result = upsert_by_urn(&mut conn, outlet("SW-001", "Alaba Mega", "SW", "LAGOS"))
            .await
            .unwrap();
        assert!(matches!(result, Upserted::Updated(_)));
        let result = upsert_by_urn(&mut conn, outlet("SE-001", "Onitsha Hub", "SE", "ANAMBRA"))
            .await
            .unwrap();
        assert!(matches!(result, Upserted::Inserted(_)));
        assert_eq!(list_all(&mut conn).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn field_agents_are_scoped_to_region_and_state() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.unwrap();
        let pagination = Pagination::new(None, 20);
        let filter = OutletFilter::default();

        let admin = viewer(Role::Admin, Some("ALL"), None);
        let page = list_pending(&mut conn, &admin, &filter, pagination).await.unwrap();
        assert_eq!(page.pagination.total_count, 3);

        let regional = viewer(Role::FieldAgent, Some("SW"), None);
        let page = list_pending(&mut conn, &regional, &filter, pagination).await.unwrap();
        assert_eq!(page.pagination.total_count, 2);

        let lagos = viewer(Role::FieldAgent, Some("SW"), Some("LAGOS"));
        let page = list_pending(&mut conn, &lagos, &filter, pagination).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].urn, "SW-001");
    }

    #[tokio::test]
    async fn completed_and_recent_visits_are_excluded() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.unwrap();
        let agent_id = crate::users::create(
            &mut conn,
            crate::models::UserInput {
                username: "agent1".into(),
                password: "pw1234".into(),
                full_name: "Agent One".into(),
                role: "field_agent".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let alaba = find_by_urn(&mut conn, "SW-001").await.unwrap().unwrap();
        let bode = find_by_urn(&mut conn, "SW-002").await.unwrap().unwrap();
        for (outlet_id, date) in [(alaba.id, "2025-05-30 09:00:00"), (bode.id, "2025-05-01 09:00:00")] {
            sqlx::query("INSERT INTO executions (outlet_id, agent_id, execution_date, status) VALUES (?, ?, ?, 'Completed')")
                .bind(outlet_id)
                .bind(agent_id)
                .bind(date)
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        let admin = viewer(Role::Admin, None, None);
        let filter = OutletFilter::default();
        let pagination = Pagination::new(None, 20);
        let pending = list_pending(&mut conn, &admin, &filter, pagination).await.unwrap();
        assert_eq!(pending.pagination.total_count, 1);

        let now = NaiveDateTime::parse_from_str("2025-06-01 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let unvisited = list_unvisited(&mut conn, &admin, &filter, pagination, now).await.unwrap();
        let urns: Vec<&str> = unvisited.items.iter().map(|o| o.urn.as_str()).collect();
        assert_eq!(urns, vec!["SW-002", "NW-001"]);

        let err = delete(&mut conn, alaba.id).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete outlet with 1 executions");
    }

    #[tokio::test]
    async fn search_filter_matches_any_text_column() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.unwrap();
        let filter = OutletFilter {
            search: Some("kiosk".into()),
            ..Default::default()
        };
        let admin = viewer(Role::Admin, None, None);
        let found = search(&mut conn, &admin, &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].urn, "SW-002");
    }

    #[tokio::test]
    async fn bulk_delete_by_state() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.unwrap();
        let preview = bulk_preview(&mut conn, OutletGroup::State, "OYO").await.unwrap();
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].execution_count, 0);
        assert_eq!(bulk_delete(&mut conn, OutletGroup::State, "OYO", true).await.unwrap(), 1);
        assert!(bulk_delete(&mut conn, OutletGroup::State, "OYO", true).await.is_err());
    }
}
