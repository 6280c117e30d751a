#![cfg(not(tarpaulin_include))]

use crate::dashboard::percentage;
use crate::error::{AppError, Result};
use crate::executions::{self, ImportedExecution};
use crate::loader::parse_date_cell;
use crate::models::{ExecutionStatus, OutletInput, POSM_PRODUCTS, ProductChecklist, non_empty};
use crate::outlets::{self, Upserted};
use crate::query;
use crate::users;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: i64,
    pub not_available: i64,
}

impl Availability {
    fn record(&mut self, available: bool) {
        if available {
            self.available += 1;
        } else {
            self.not_available += 1;
        }
    }
}

fn empty_stats() -> BTreeMap<String, Availability> {
    POSM_PRODUCTS
        .iter()
        .map(|product| (product.to_string(), Availability::default()))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductAvailability {
    pub product_stats: BTreeMap<String, Availability>,
    pub product_by_region: BTreeMap<String, BTreeMap<String, Availability>>,
}

/// Count, per product, the executions that found it available.
///
/// `region` of `None` or `all` covers every region.
pub async fn product_availability(
    conn: &mut SqliteConnection,
    region: Option<&str>,
) -> Result<ProductAvailability> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT o.region, e.products_available FROM executions e JOIN outlets o ON e.outlet_id = o.id
         WHERE e.products_available IS NOT NULL",
    );
    query::push_eq(&mut qb, "o.region", region);
    let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;

    let mut product_stats = empty_stats();
    let mut product_by_region: BTreeMap<String, BTreeMap<String, Availability>> = BTreeMap::new();
    for (region, raw) in rows {
        let checklist = ProductChecklist::from_json(&raw);
        let by_region = product_by_region.entry(region).or_insert_with(empty_stats);
        for product in POSM_PRODUCTS {
            let available = checklist.is_available(product);
            if let Some(stats) = product_stats.get_mut(product) {
                stats.record(available);
            }
            if let Some(stats) = by_region.get_mut(product) {
                stats.record(available);
            }
        }
    }

    Ok(ProductAvailability {
        product_stats,
        product_by_region,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionCoverage {
    pub executed: i64,
    pub total: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub total_outlets: i64,
    pub executed_outlets: i64,
    pub total_executions: i64,
    pub coverage_percentage: f64,
    pub execution_by_region: BTreeMap<String, RegionCoverage>,
}

/// Outlet coverage overall and per region.
pub async fn execution_summary(
    conn: &mut SqliteConnection,
    region: Option<&str>,
) -> Result<ExecutionSummary> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM outlets o WHERE 1=1");
    query::push_eq(&mut qb, "o.region", region);
    let total_outlets: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT COUNT(DISTINCT e.outlet_id), COUNT(*) FROM executions e JOIN outlets o ON e.outlet_id = o.id
         WHERE 1=1",
    );
    query::push_eq(&mut qb, "o.region", region);
    let (executed_outlets, total_executions): (i64, i64) =
        qb.build_query_as().fetch_one(&mut *conn).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT o.region, COUNT(DISTINCT e.outlet_id), COUNT(DISTINCT o.id)
         FROM outlets o LEFT JOIN executions e ON o.id = e.outlet_id WHERE 1=1",
    );
    query::push_eq(&mut qb, "o.region", region);
    qb.push(" GROUP BY o.region");
    let rows: Vec<(String, i64, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
    let execution_by_region = rows
        .into_iter()
        .map(|(region, executed, total)| {
            let coverage = RegionCoverage {
                executed,
                total,
                percentage: percentage(executed, total),
            };
            (region, coverage)
        })
        .collect();

    Ok(ExecutionSummary {
        total_outlets,
        executed_outlets,
        total_executions,
        coverage_percentage: percentage(executed_outlets, total_outlets),
        execution_by_region,
    })
}

/// What an uploaded report sheet contains, judged from its first row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Outlet,
    Agent,
    Execution,
    Unknown,
}

impl ReportType {
    pub fn detect(first_row: &Map<String, Value>) -> ReportType {
        let has = |keys: &[&str]| keys.iter().all(|key| first_row.contains_key(*key));
        if has(&["URN", "Outlet Name", "Address"]) {
            ReportType::Outlet
        } else if has(&["Name", "Username", "Role"]) {
            ReportType::Agent
        } else if has(&["Agent", "Outlet", "Date"]) {
            ReportType::Execution
        } else {
            ReportType::Unknown
        }
    }
}

/// A sheet converted to JSON objects by the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportUpload {
    #[serde(default = "unknown_sheet")]
    pub sheet_name: String,
    #[serde(default)]
    pub data: Vec<Map<String, Value>>,
}

fn unknown_sheet() -> String {
    "Unknown Sheet".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportUploadResult {
    pub message: String,
    pub report_type: ReportType,
    pub total: usize,
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub details: Vec<String>,
}

impl ReportUploadResult {
    fn new(sheet_name: &str, report_type: ReportType, total: usize) -> Self {
        ReportUploadResult {
            message: format!("Successfully processed {}", sheet_name),
            report_type,
            total,
            imported: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            details: Vec::new(),
        }
    }
}

/// Text of a JSON cell; numbers are printed without quotes, integral floats
/// without a fraction.
fn text(row: &Map<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && n.is_f64() => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Import a report sheet.
///
/// Outlet sheets are upserted by URN. Execution sheets are attached to the
/// outlet named by `Outlet URN` and the user named by `Agent Username`.
/// Agent sheets carry no passwords and are skipped.
///
/// # Errors
/// * `Validation` when the upload has no rows
pub async fn upload_report(
    conn: &mut SqliteConnection,
    upload: &ReportUpload,
    now: NaiveDateTime,
) -> Result<ReportUploadResult> {
    let Some(first) = upload.data.first() else {
        return Err(AppError::validation("No data to process"));
    };
    let report_type = ReportType::detect(first);
    let mut result = ReportUploadResult::new(&upload.sheet_name, report_type, upload.data.len());

    let mut tx = conn.begin().await?;
    match report_type {
        ReportType::Outlet => {
            for row in &upload.data {
                import_outlet_row(&mut tx, row, &mut result).await;
            }
        }
        ReportType::Execution => {
            for row in &upload.data {
                import_execution_row(&mut tx, row, now, &mut result).await?;
            }
        }
        ReportType::Agent => {
            result.skipped = result.total;
            result
                .details
                .push("Agent sheets cannot be imported here; use the user import".to_string());
        }
        ReportType::Unknown => {
            result.skipped = result.total;
            result
                .details
                .push("Unknown report type. No data imported.".to_string());
        }
    }
    tx.commit().await?;

    info!(
        sheet = %upload.sheet_name,
        report_type = ?report_type,
        imported = result.imported,
        updated = result.updated,
        skipped = result.skipped,
        "report uploaded"
    );
    Ok(result)
}

async fn import_outlet_row(conn: &mut SqliteConnection, row: &Map<String, Value>, result: &mut ReportUploadResult) {
    let input = OutletInput {
        urn: text(row, "URN"),
        outlet_name: text(row, "Outlet Name"),
        address: text(row, "Address"),
        phone: text(row, "Phone"),
        outlet_type: text(row, "Outlet Type"),
        region: text(row, "Region"),
        state: text(row, "State"),
        local_govt: text(row, "LGA"),
        ..Default::default()
    };
    if input.urn.is_empty() || input.outlet_name.is_empty() {
        result.skipped += 1;
        return;
    }
    let (urn, name) = (input.urn.clone(), input.outlet_name.clone());
    match outlets::upsert_by_urn(conn, input).await {
        Ok(Upserted::Inserted(_)) => {
            result.imported += 1;
            result.details.push(format!("Imported new outlet: {} ({})", name, urn));
        }
        Ok(Upserted::Updated(_)) => {
            result.updated += 1;
            result.details.push(format!("Updated outlet: {} ({})", name, urn));
        }
        Err(e) => {
            result.errors += 1;
            result.details.push(format!("Error processing row {}: {}", urn, e));
        }
    }
}

async fn import_execution_row(
    conn: &mut SqliteConnection,
    row: &Map<String, Value>,
    now: NaiveDateTime,
    result: &mut ReportUploadResult,
) -> Result<()> {
    let urn = text(row, "Outlet URN");
    let Some(outlet) = outlets::find_by_urn(conn, &urn).await? else {
        result.skipped += 1;
        result.details.push(format!("Outlet not found: {}", urn));
        return Ok(());
    };
    let username = text(row, "Agent Username");
    let Some(agent) = users::find_by_username(conn, &username).await? else {
        result.skipped += 1;
        result.details.push(format!("Agent not found: {}", username));
        return Ok(());
    };

    let status = match text(row, "Status").as_str() {
        "" => Some(ExecutionStatus::Completed),
        raw => ExecutionStatus::parse(raw),
    };
    let Some(status) = status else {
        result.errors += 1;
        result.details.push(format!("Unknown status for outlet {}", urn));
        return Ok(());
    };

    let mut execution = ImportedExecution::new(
        outlet.id,
        agent.id,
        parse_date_cell(&text(row, "Date")).unwrap_or(now),
        "report_upload",
    );
    execution.status = status;
    execution.notes = non_empty(&text(row, "Notes"));
    match executions::insert_imported(conn, &execution).await {
        Ok(_) => result.imported += 1,
        Err(e) => {
            result.errors += 1;
            result.details.push(format!("Error processing execution: {}", e));
        }
    }
    Ok(())
}

/// One record of a bulk execution upload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkExecution {
    #[serde(default)]
    pub outlet_urn: String,
    #[serde(default)]
    pub agent_username: String,
    pub execution_date: Option<String>,
    pub before_image: Option<String>,
    pub after_image: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    /// Either an object or its JSON text.
    pub products_available: Option<Value>,
    pub status: Option<String>,
}

impl BulkExecution {
    fn products(&self) -> ProductChecklist {
        match &self.products_available {
            Some(Value::String(raw)) => ProductChecklist::from_json(raw),
            Some(value @ Value::Object(_)) => ProductChecklist::from_json(&value.to_string()),
            _ => ProductChecklist::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkUploadResult {
    pub imported: usize,
    pub errors: usize,
    pub details: Vec<String>,
}

/// Insert executions whose outlet and agent are named by URN and username.
///
/// # Errors
/// * `Validation` when `items` is empty
pub async fn bulk_execution_upload(
    conn: &mut SqliteConnection,
    items: &[BulkExecution],
    now: NaiveDateTime,
) -> Result<BulkUploadResult> {
    if items.is_empty() {
        return Err(AppError::validation("No execution data provided"));
    }

    let mut result = BulkUploadResult::default();
    let mut tx = conn.begin().await?;
    for item in items {
        let outlet = outlets::find_by_urn(&mut tx, item.outlet_urn.trim()).await?;
        let agent = users::find_by_username(&mut tx, item.agent_username.trim()).await?;
        let (Some(outlet), Some(agent)) = (outlet, agent) else {
            result.errors += 1;
            result.details.push(format!(
                "Outlet {} or Agent {} not found",
                item.outlet_urn, item.agent_username
            ));
            continue;
        };

        let status = match item.status.as_deref().map(str::trim) {
            None | Some("") => Some(ExecutionStatus::Completed),
            Some(raw) => ExecutionStatus::parse(raw),
        };
        let Some(status) = status else {
            result.errors += 1;
            result
                .details
                .push(format!("Unknown status for outlet {}", item.outlet_urn));
            continue;
        };

        let mut execution = ImportedExecution::new(
            outlet.id,
            agent.id,
            item.execution_date
                .as_deref()
                .and_then(parse_date_cell)
                .unwrap_or(now),
            "bulk_upload",
        );
        execution.status = status;
        execution.before_image = item.before_image.as_deref().and_then(non_empty);
        execution.after_image = item.after_image.as_deref().and_then(non_empty);
        execution.latitude = item.latitude;
        execution.longitude = item.longitude;
        execution.notes = item.notes.as_deref().and_then(non_empty);
        execution.products = item.products();

        match executions::insert_imported(&mut tx, &execution).await {
            Ok(_) => result.imported += 1,
            Err(e) => {
                result.errors += 1;
                result.details.push(format!("Error processing execution: {}", e));
            }
        }
    }
    tx.commit().await?;

    info!(imported = result.imported, errors = result.errors, "bulk executions uploaded");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executions::CompletionInput;
    use serde_json::json;

    fn at(value: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn outlet(conn: &mut SqliteConnection, urn: &str, region: &str) -> i64 {
        outlets::create(
            conn,
            OutletInput {
                urn: urn.into(),
                outlet_name: format!("Outlet {}", urn),
                region: region.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn report_types_are_detected() {
        let outlet = row(json!({"URN": "", "Outlet Name": "", "Address": ""}));
        let agent = row(json!({"Name": "", "Username": "", "Role": ""}));
        let execution = row(json!({"Agent": "", "Outlet": "", "Date": ""}));
        assert_eq!(ReportType::detect(&outlet), ReportType::Outlet);
        assert_eq!(ReportType::detect(&agent), ReportType::Agent);
        assert_eq!(ReportType::detect(&execution), ReportType::Execution);
        assert_eq!(ReportType::detect(&row(json!({"x": 1}))), ReportType::Unknown);
    }

    #[test]
    fn json_cells_become_text() {
        let r = row(json!({"Phone": 8012345678.0, "Count": 3, "Name": " Ade "}));
        assert_eq!(text(&r, "Phone"), "8012345678");
        assert_eq!(text(&r, "Count"), "3");
        assert_eq!(text(&r, "Name"), "Ade");
        assert_eq!(text(&r, "Missing"), "");
    }

    #[tokio::test]
    async fn availability_counts_every_product() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        crate::db::seed_demo_users(&pool).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let agent = users::find_by_username(&mut conn, "field_agent_demo").await.unwrap().unwrap();
        let sw = outlet(&mut conn, "S1", "SW").await;
        let nw = outlet(&mut conn, "N1", "NW").await;

        let mut products = ProductChecklist::new();
        products.set("Table", true);
        let input = CompletionInput {
            products,
            ..Default::default()
        };
        executions::complete(&mut conn, sw, agent.id, input, at("2025-06-01 09:00:00"))
            .await
            .unwrap();
        executions::complete(&mut conn, nw, agent.id, CompletionInput::default(), at("2025-06-01 10:00:00"))
            .await
            .unwrap();

        let report = product_availability(&mut conn, None).await.unwrap();
        assert_eq!(report.product_stats["Table"], Availability { available: 1, not_available: 1 });
        assert_eq!(report.product_stats["Cups"].not_available, 2);
        assert_eq!(report.product_by_region["SW"]["Table"].available, 1);

        let sw_only = product_availability(&mut conn, Some("SW")).await.unwrap();
        assert_eq!(sw_only.product_stats["Chair"].not_available, 1);
        assert!(!sw_only.product_by_region.contains_key("NW"));

        let summary = execution_summary(&mut conn, Some("all")).await.unwrap();
        assert_eq!(summary.total_outlets, 2);
        assert_eq!(summary.executed_outlets, 2);
        assert_eq!(summary.coverage_percentage, 100.0);
    }

    #[tokio::test]
    async fn empty_database_gives_zero_summary() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let summary = execution_summary(&mut conn, None).await.unwrap();
        assert_eq!(summary.total_outlets, 0);
        assert_eq!(summary.coverage_percentage, 0.0);
        assert!(summary.execution_by_region.is_empty());
    }

    #[tokio::test]
    async fn outlet_report_upserts_by_urn() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        outlet(&mut conn, "U1", "SW").await;

        let upload = ReportUpload {
            sheet_name: "Outlets".into(),
            data: vec![
                row(json!({"URN": "U1", "Outlet Name": "Renamed", "Address": "1 Road", "Region": "SW"})),
                row(json!({"URN": "U2", "Outlet Name": "Fresh", "Address": "2 Road", "Region": "SE"})),
                row(json!({"URN": "", "Outlet Name": "", "Address": ""})),
            ],
        };
        let result = upload_report(&mut conn, &upload, at("2025-06-01 00:00:00")).await.unwrap();
        assert_eq!(result.report_type, ReportType::Outlet);
        assert_eq!((result.imported, result.updated, result.skipped), (1, 1, 1));
        assert_eq!(result.message, "Successfully processed Outlets");

        let renamed = outlets::find_by_urn(&mut conn, "U1").await.unwrap().unwrap();
        assert_eq!(renamed.outlet_name, "Renamed");
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let upload = ReportUpload {
            sheet_name: "Empty".into(),
            data: Vec::new(),
        };
        let err = upload_report(&mut conn, &upload, at("2025-06-01 00:00:00")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(bulk_execution_upload(&mut conn, &[], at("2025-06-01 00:00:00")).await.is_err());
    }

    #[tokio::test]
    async fn bulk_upload_resolves_outlets_and_agents() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        crate::db::seed_demo_users(&pool).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let id = outlet(&mut conn, "U1", "SW").await;

        let items: Vec<BulkExecution> = serde_json::from_value(json!([
            {
                "outlet_urn": "U1",
                "agent_username": "field_agent_demo",
                "execution_date": "2025-05-30 08:15:00",
                "latitude": 6.6,
                "longitude": 3.3,
                "products_available": "{\"Table\": \"Yes\"}"
            },
            {"outlet_urn": "MISSING", "agent_username": "field_agent_demo"}
        ]))
        .unwrap();
        let result = bulk_execution_upload(&mut conn, &items, at("2025-06-01 00:00:00")).await.unwrap();
        assert_eq!(result.imported, 1);
        assert_eq!(result.errors, 1);
        assert_eq!(result.details, vec!["Outlet MISSING or Agent field_agent_demo not found"]);

        let (date, method, products): (String, String, String) = sqlx::query_as(
            "SELECT execution_date, upload_method, products_available FROM executions WHERE outlet_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(date, "2025-05-30 08:15:00");
        assert_eq!(method, "bulk_upload");
        assert!(ProductChecklist::from_json(&products).is_available("Table"));
    }
}
