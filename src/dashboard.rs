#![cfg(not(tarpaulin_include))]

//! Aggregation queries behind the dashboard, the admin landing page and the
//! deployment and agent-performance tables.

use crate::error::Result;
use crate::executions::DETAIL_SELECT;
use crate::models::{ExecutionDetail, SessionUser, format_timestamp};
use crate::query::{self, DateRange, Page, Pagination};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::BTreeMap;

/// Percentage rounded to two decimals; zero when there is nothing to divide by.
pub fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10000.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub total_outlets: i64,
    pub total_executions: i64,
    pub coverage_percentage: f64,
    pub active_agents: i64,
    /// Outlets per region for admins, per LGA for everyone else.
    pub regions: BTreeMap<String, i64>,
    pub states: BTreeMap<String, i64>,
    pub executions_by_date: BTreeMap<String, i64>,
    pub executions_by_agent: BTreeMap<String, i64>,
    pub outlet_types: BTreeMap<String, i64>,
}

async fn scalar(qb: &mut QueryBuilder<'_, Sqlite>, conn: &mut SqliteConnection) -> Result<i64> {
    let value: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
    Ok(value)
}

async fn grouped(
    qb: &mut QueryBuilder<'_, Sqlite>,
    conn: &mut SqliteConnection,
) -> Result<BTreeMap<String, i64>> {
    let rows: Vec<(Option<String>, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
    let mut map = BTreeMap::new();
    for (key, count) in rows {
        let key = key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        *map.entry(key).or_insert(0) += count;
    }
    Ok(map)
}

/// Where-clause restricting outlets to what a non-admin is responsible for:
/// their state when set, otherwise their region.
fn push_outlet_area(qb: &mut QueryBuilder<'_, Sqlite>, user: &SessionUser) {
    if user.is_admin() {
        return;
    }
    match query::filter_value(user.state.as_deref()) {
        Some(state) => {
            qb.push(" AND state = ");
            qb.push_bind(state);
        }
        None => {
            qb.push(" AND region = ");
            qb.push_bind(user.region.clone().unwrap_or_default());
        }
    }
}

fn push_own_executions(qb: &mut QueryBuilder<'_, Sqlite>, user: &SessionUser, column: &str) {
    if !user.is_admin() {
        qb.push(format!(" AND {} = ", column));
        qb.push_bind(user.user_id);
    }
}

/// Headline numbers and breakdowns for the dashboard.
///
/// Admins see everything. Other users see outlets in their state (or region)
/// and only their own completed executions.
pub async fn dashboard_data(conn: &mut SqliteConnection, user: &SessionUser) -> Result<DashboardData> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM outlets WHERE 1=1");
    push_outlet_area(&mut qb, user);
    let total_outlets = scalar(&mut qb, conn).await?;

    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM executions WHERE status = 'Completed'");
    push_own_executions(&mut qb, user, "agent_id");
    let total_executions = scalar(&mut qb, conn).await?;

    let active_agents = if user.is_admin() {
        let mut qb = QueryBuilder::new(
            "SELECT COUNT(DISTINCT agent_id) FROM executions WHERE status = 'Completed'",
        );
        scalar(&mut qb, conn).await?
    } else {
        1
    };

    let mut qb = if user.is_admin() {
        QueryBuilder::new("SELECT region, COUNT(*) FROM outlets WHERE 1=1")
    } else {
        QueryBuilder::new("SELECT local_govt, COUNT(*) FROM outlets WHERE 1=1")
    };
    push_outlet_area(&mut qb, user);
    qb.push(" GROUP BY 1");
    let regions = grouped(&mut qb, conn).await?;

    let mut qb = QueryBuilder::new("SELECT state, COUNT(*) FROM outlets WHERE 1=1");
    if !user.is_admin() {
        query::push_eq(&mut qb, "region", user.region.as_deref());
    }
    qb.push(" GROUP BY state");
    let states = grouped(&mut qb, conn).await?;

    let mut qb = QueryBuilder::new(
        "SELECT date(execution_date), COUNT(*) FROM executions WHERE status = 'Completed'",
    );
    push_own_executions(&mut qb, user, "agent_id");
    qb.push(" GROUP BY date(execution_date)");
    let executions_by_date = grouped(&mut qb, conn).await?;

    let mut qb = QueryBuilder::new(
        "SELECT u.full_name, COUNT(e.id) FROM executions e JOIN users u ON u.id = e.agent_id
         WHERE e.status = 'Completed'",
    );
    push_own_executions(&mut qb, user, "e.agent_id");
    qb.push(" GROUP BY e.agent_id");
    let executions_by_agent = grouped(&mut qb, conn).await?;

    let mut qb = QueryBuilder::new("SELECT outlet_type, COUNT(*) FROM outlets WHERE 1=1");
    push_outlet_area(&mut qb, user);
    qb.push(" GROUP BY outlet_type");
    let outlet_types = grouped(&mut qb, conn).await?;

    Ok(DashboardData {
        total_outlets,
        total_executions,
        coverage_percentage: percentage(total_executions, total_outlets),
        active_agents,
        regions,
        states,
        executions_by_date,
        executions_by_agent,
        outlet_types,
    })
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RecentActivity {
    pub id: i64,
    pub execution_date: String,
    pub agent: String,
    pub outlet_name: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub user_count: i64,
    pub outlet_count: i64,
    pub execution_count: i64,
    pub recent_activity: Vec<RecentActivity>,
}

/// Record counts and the five latest executions for the admin landing page.
pub async fn admin_stats(conn: &mut SqliteConnection) -> Result<AdminStats> {
    let (user_count, outlet_count, execution_count): (i64, i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM users), (SELECT COUNT(*) FROM outlets), (SELECT COUNT(*) FROM executions)",
    )
    .fetch_one(&mut *conn)
    .await?;

    let recent_activity = sqlx::query_as::<_, RecentActivity>(
        "SELECT e.id, e.execution_date, u.full_name AS agent, o.outlet_name, o.region
         FROM executions e
         JOIN users u ON e.agent_id = u.id
         JOIN outlets o ON e.outlet_id = o.id
         ORDER BY e.execution_date DESC
         LIMIT 5",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(AdminStats {
        user_count,
        outlet_count,
        execution_count,
        recent_activity,
    })
}

/// Filters of the deployment table and its exports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentFilter {
    pub region: Option<String>,
    pub state: Option<String>,
    pub date_range: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl DeploymentFilter {
    pub(crate) fn push(&self, qb: &mut QueryBuilder<'_, Sqlite>, now: NaiveDateTime) -> Result<()> {
        query::push_eq_upper(qb, "o.region", self.region.as_deref());
        query::push_eq_upper(qb, "o.state", self.state.as_deref());
        let range = DateRange::parse(
            self.date_range.as_deref(),
            self.start_date.as_deref(),
            self.end_date.as_deref(),
        )?;
        query::push_date_range(qb, "e.execution_date", range, now);
        Ok(())
    }
}

/// Completed executions with agent and outlet details, newest first.
pub async fn posm_deployments(
    conn: &mut SqliteConnection,
    filter: &DeploymentFilter,
    pagination: Pagination,
    now: NaiveDateTime,
) -> Result<Page<ExecutionDetail>> {
    let mut count = QueryBuilder::<Sqlite>::new(
        "SELECT COUNT(*) FROM executions e JOIN outlets o ON o.id = e.outlet_id JOIN users u ON u.id = e.agent_id
         WHERE e.status = 'Completed'",
    );
    filter.push(&mut count, now)?;
    let total = scalar(&mut count, conn).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(DETAIL_SELECT);
    qb.push(" WHERE e.status = 'Completed'");
    filter.push(&mut qb, now)?;
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

/// Filters of the agent performance table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentFilter {
    pub search: Option<String>,
    pub region: Option<String>,
    pub state: Option<String>,
    pub date_range: Option<String>,
    pub agent_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentPerformance {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub region: Option<String>,
    pub state: Option<String>,
    pub lga: Option<String>,
    pub executions_performed: i64,
    pub outlets_visited: i64,
    pub outlets_assigned: i64,
    #[sqlx(skip)]
    pub coverage_percentage: f64,
}

fn push_agent_filters(qb: &mut QueryBuilder<'_, Sqlite>, user: &SessionUser, filter: &AgentFilter) {
    qb.push(" WHERE u.role = 'field_agent' AND u.id != ");
    qb.push_bind(user.user_id);
    query::push_search(
        qb,
        &["u.username", "u.full_name", "u.region", "u.state", "u.lga"],
        filter.search.as_deref(),
    );
    query::push_eq(qb, "u.region", filter.region.as_deref());
    query::push_eq(qb, "u.state", filter.state.as_deref());
    if let Some(agent_id) = filter.agent_id.filter(|id| *id != user.user_id) {
        qb.push(" AND u.id = ");
        qb.push_bind(agent_id);
    }
}

/// Per-agent visit counts for every field agent except the caller.
///
/// A date range limits which executions are counted, not which agents are
/// listed.
pub async fn agent_performance(
    conn: &mut SqliteConnection,
    user: &SessionUser,
    filter: &AgentFilter,
    pagination: Pagination,
    now: NaiveDateTime,
) -> Result<Page<AgentPerformance>> {
    let range = DateRange::parse(filter.date_range.as_deref(), None, None)?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users u");
    push_agent_filters(&mut count, user, filter);
    let total = scalar(&mut count, conn).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT u.id, u.username, u.full_name, u.region, u.state, u.lga,
                COUNT(DISTINCT CASE WHEN e.status = 'Completed' THEN e.id END) AS executions_performed,
                COUNT(DISTINCT CASE WHEN e.status = 'Completed' THEN e.outlet_id END) AS outlets_visited,
                COUNT(DISTINCT e.outlet_id) AS outlets_assigned
         FROM users u LEFT JOIN executions e ON e.agent_id = u.id",
    );
    if let Some(range) = range {
        let (since, until) = range.bounds(now);
        qb.push(" AND e.execution_date >= ");
        qb.push_bind(format_timestamp(since));
        if let Some(until) = until {
            qb.push(" AND e.execution_date < ");
            qb.push_bind(format_timestamp(until));
        }
    }
    push_agent_filters(&mut qb, user, filter);
    qb.push(" GROUP BY u.id ORDER BY u.full_name");
    pagination.push_limit(&mut qb);

    let mut items: Vec<AgentPerformance> = qb.build_query_as().fetch_all(&mut *conn).await?;
    for agent in &mut items {
        agent.coverage_percentage = percentage(agent.outlets_visited, agent.outlets_assigned);
    }

    Ok(Page {
        items,
        pagination: pagination.info(total),
    })
}
