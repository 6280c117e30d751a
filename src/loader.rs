#![cfg(not(tarpaulin_include))]

//! Reading uploaded CSV and Excel files and importing their rows.

use crate::error::{AppError, Result};
use crate::executions::{self, ImportedExecution};
use crate::models::{
    ExecutionStatus, OutletInput, ProductChecklist, UserInput, is_truthy,
};
use crate::outlets::{self, Upserted};
use crate::users;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info, warn};

/// A sheet of text cells with its header row split off.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read an uploaded file into a [`Table`].
///
/// The format is chosen from the file extension: `.csv` through the `csv`
/// crate, `.xlsx` and `.xls` through `calamine` (first worksheet only).
/// Header names are trimmed and rows with no content are dropped.
///
/// # Arguments
/// * `file_name` - Name of the uploaded file, used for its extension
/// * `bytes` - File contents
///
/// # Errors
/// * `Validation` for an unsupported extension
/// * `Import` if the file cannot be parsed or has no header row
pub fn read_table(file_name: &str, bytes: &[u8]) -> Result<Table> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();

    let table = match ext.as_str() {
        "csv" => from_csv(bytes)?,
        "xlsx" | "xls" => from_excel(bytes)?,
        _ => {
            return Err(AppError::validation(
                "Invalid file type. Allowed: .csv, .xlsx, .xls",
            ));
        }
    };
    debug!(%file_name, columns = table.headers.len(), rows = table.rows.len(), "table read");
    Ok(table)
}

fn keep_row(row: &[String]) -> bool {
    row.iter().any(|cell| !cell.is_empty())
}

fn from_csv(bytes: &[u8]) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(AppError::Import("CSV file is empty".to_string()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let row: Vec<String> = record?.iter().map(str::to_string).collect();
        if keep_row(&row) {
            rows.push(row);
        }
    }
    Ok(Table { headers, rows })
}

fn from_excel(bytes: &[u8]) -> Result<Table> {
    use calamine::{Reader, open_workbook_auto_from_rs};

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::Import("No sheets found in Excel file".to_string()))??;

    let mut rows = range.rows().map(|row| row.iter().map(cell_text).collect::<Vec<_>>());
    let headers = rows
        .next()
        .ok_or_else(|| AppError::Import("Excel sheet is empty".to_string()))?;
    let rows = rows.filter(|row| keep_row(row)).collect();
    Ok(Table { headers, rows })
}

fn cell_text(cell: &calamine::Data) -> String {
    use calamine::Data;

    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        // Phone numbers and URN parts come back as floats
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string().trim().to_string(),
    }
}

/// Parse a date cell in any of the layouts found in field spreadsheets.
///
/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY`, `MM/DD/YYYY`, `YYYY-MM-DD HH:MM:SS`
/// and Excel serial day numbers. Day-first wins when both slash layouts fit.
pub fn parse_date_cell(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(at);
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    let serial: f64 = value.parse().ok()?;
    if !(1.0..100_000.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    Some(epoch + Duration::seconds((serial * 86_400.0).round() as i64))
}

/// Canonical column name and the header spellings accepted for it.
pub type ColumnAliases = &'static [(&'static str, &'static [&'static str])];

/// Canonical columns resolved against the headers of one file.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    indexes: HashMap<&'static str, usize>,
    available: Vec<String>,
}

impl ColumnMap {
    /// For each canonical column, the first alias that matches a header
    /// (trimmed, case-insensitive) wins.
    pub fn resolve(headers: &[String], aliases: ColumnAliases) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let mut indexes = HashMap::new();
        for (column, names) in aliases {
            let found = names.iter().find_map(|name| {
                let name = name.to_lowercase();
                normalized.iter().position(|h| *h == name)
            });
            if let Some(index) = found {
                indexes.insert(*column, index);
            }
        }
        ColumnMap {
            indexes,
            available: headers.to_vec(),
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.indexes.contains_key(column)
    }

    /// # Errors
    /// * `Validation` naming every missing column and the headers that were found
    pub fn require(&self, columns: &[&str]) -> Result<()> {
        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|column| !self.contains(column))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(AppError::validation(format!(
            "Missing required columns: {}. Available columns: {}",
            missing.join(", "),
            self.available.join(", ")
        )))
    }

    /// Trimmed cell of `column` in `row`, or `""` when the column is absent.
    pub fn get<'a>(&self, row: &'a [String], column: &str) -> &'a str {
        self.indexes
            .get(column)
            .and_then(|&index| row.get(index))
            .map(|cell| cell.trim())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub error: String,
}

/// Result of an outlet or user import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<RowError>,
}

impl ImportSummary {
    fn fail(&mut self, row: usize, error: impl ToString) {
        self.errors.push(RowError {
            row,
            error: error.to_string(),
        });
    }
}

const OUTLET_COLUMNS: ColumnAliases = &[
    ("urn", &["urn"]),
    ("outlet_name", &["outlet_name", "Outlet Name"]),
    ("customer_name", &["customer_name", "Customer Name"]),
    ("address", &["address"]),
    ("phone", &["phone"]),
    ("outlet_type", &["outlet_type", "Outlet Type"]),
    ("local_govt", &["local_govt", "LGA"]),
    ("state", &["state"]),
    ("region", &["region"]),
];

const USER_COLUMNS: ColumnAliases = &[
    ("username", &["username"]),
    ("password", &["password"]),
    ("full_name", &["full_name", "Full Name"]),
    ("role", &["role"]),
    ("region", &["region"]),
    ("state", &["state"]),
    ("lga", &["lga"]),
    ("email", &["email"]),
    ("phone", &["phone"]),
];

/// Insert new outlets and update existing ones, matched by URN.
///
/// Runs in one transaction; a bad row is recorded and the rest continue.
///
/// # Errors
/// * `Validation` if `urn`, `outlet_name` or `region` columns are missing
pub async fn import_outlets(conn: &mut SqliteConnection, table: &Table) -> Result<ImportSummary> {
    let columns = ColumnMap::resolve(&table.headers, OUTLET_COLUMNS);
    columns.require(&["urn", "outlet_name", "region"])?;

    let mut summary = ImportSummary::default();
    let mut tx = conn.begin().await?;
    for (i, row) in table.rows.iter().enumerate() {
        let input = OutletInput {
            urn: columns.get(row, "urn").to_string(),
            outlet_name: columns.get(row, "outlet_name").to_string(),
            customer_name: columns.get(row, "customer_name").to_string(),
            address: columns.get(row, "address").to_string(),
            phone: columns.get(row, "phone").to_string(),
            outlet_type: columns.get(row, "outlet_type").to_string(),
            local_govt: columns.get(row, "local_govt").to_string(),
            state: columns.get(row, "state").to_string(),
            region: columns.get(row, "region").to_string(),
        };
        if input.urn.is_empty() && input.outlet_name.is_empty() {
            summary.skipped += 1;
            continue;
        }
        match outlets::upsert_by_urn(&mut tx, input).await {
            Ok(Upserted::Inserted(_)) => summary.inserted += 1,
            Ok(Upserted::Updated(_)) => summary.updated += 1,
            Err(e) => summary.fail(i + 1, e),
        }
    }
    tx.commit().await?;

    info!(
        inserted = summary.inserted,
        updated = summary.updated,
        errors = summary.errors.len(),
        "outlet import finished"
    );
    Ok(summary)
}

/// Create users from a file. Existing usernames and unknown roles are row
/// errors; nothing is overwritten.
///
/// # Errors
/// * `Validation` if any required column is missing
pub async fn import_users(conn: &mut SqliteConnection, table: &Table) -> Result<ImportSummary> {
    let columns = ColumnMap::resolve(&table.headers, USER_COLUMNS);
    columns.require(&["username", "password", "full_name", "role", "region"])?;

    let mut summary = ImportSummary::default();
    let mut tx = conn.begin().await?;
    for (i, row) in table.rows.iter().enumerate() {
        let input = UserInput {
            username: columns.get(row, "username").to_string(),
            password: columns.get(row, "password").to_string(),
            full_name: columns.get(row, "full_name").to_string(),
            role: columns.get(row, "role").to_string(),
            region: columns.get(row, "region").to_string(),
            state: columns.get(row, "state").to_string(),
            lga: columns.get(row, "lga").to_string(),
            email: columns.get(row, "email").to_string(),
            phone: columns.get(row, "phone").to_string(),
        };
        match users::create(&mut tx, input).await {
            Ok(_) => summary.inserted += 1,
            Err(e) => summary.fail(i + 1, e),
        }
    }
    tx.commit().await?;

    info!(inserted = summary.inserted, errors = summary.errors.len(), "user import finished");
    Ok(summary)
}

const EXECUTION_COLUMNS: ColumnAliases = &[
    ("URN", &["URN", "URN Code", "Outlet URN"]),
    (
        "Retail Point Name",
        &["Retail Point Name", "Outlet Name", "Shop Name", "Point Name", "Name"],
    ),
    ("Customer Name", &["Customer Name", "Customer", "Owner Name", "Owner"]),
    ("Address", &["Address", "Location", "Full Address"]),
    ("Phone", &["Phone", "Phone Number", "Contact", "Mobile"]),
    ("Region", &["Region", "Zone"]),
    ("State", &["State"]),
    (
        "LGA",
        &["LGA", "Local Govt", "Local Government", "Local Government Area"],
    ),
    ("Outlet Type", &["Outlet Type", "Type", "Shop Type"]),
    ("Date", &["Date", "Execution Date", "Visit Date"]),
    ("Status", &["Status", "Execution Status"]),
    ("Notes", &["Notes", "Comments", "Remarks"]),
    ("Table", &["Table"]),
    ("Chair", &["Chair"]),
    ("Parasol", &["Parasol"]),
    ("Tarpaulin", &["Tarpaulin"]),
    ("Hawker Jacket", &["Hawker Jacket"]),
];

/// Products read from execution spreadsheets.
const IMPORTED_PRODUCTS: [&str; 5] = ["Table", "Chair", "Parasol", "Tarpaulin", "Hawker Jacket"];

/// Window in which a second execution for the same outlet is a duplicate.
const DUPLICATE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowMessage {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewOutlet {
    pub row: usize,
    pub urn: String,
    pub name: String,
    pub region: String,
}

/// Result of an execution upload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionImportSummary {
    pub imported: usize,
    pub outlets_created: usize,
    pub duplicates: Vec<RowMessage>,
    pub new_outlets: Vec<NewOutlet>,
    pub errors: Vec<RowError>,
}

impl ExecutionImportSummary {
    /// One line for the upload response, e.g.
    /// `Upload complete: 3 executions imported, 1 duplicates skipped`.
    pub fn message(&self) -> String {
        let mut parts = Vec::new();
        if self.imported > 0 {
            parts.push(format!("{} executions imported", self.imported));
        }
        if self.outlets_created > 0 {
            parts.push(format!("{} outlets created", self.outlets_created));
        }
        if !self.duplicates.is_empty() {
            parts.push(format!("{} duplicates skipped", self.duplicates.len()));
        }
        if !self.errors.is_empty() {
            parts.push(format!("{} errors", self.errors.len()));
        }
        if parts.is_empty() {
            "No data processed".to_string()
        } else {
            format!("Upload complete: {}", parts.join(", "))
        }
    }
}

/// Import visit records from a field spreadsheet.
///
/// Rows are matched to outlets by URN and unknown outlets are created
/// (type `Shop` and region `SW` when the sheet leaves them blank). Unless the
/// URN contains "new", a row is skipped when its URN or outlet name already
/// has an execution in the last seven days. Every row is attributed to the
/// first active admin, or the first active user when there is no admin.
///
/// # Arguments
/// * `conn` - Connection the import transaction is opened on
/// * `table` - Parsed upload
/// * `now` - Reference time for the duplicate window and undated rows
///
/// # Errors
/// * `Validation` if the URN or outlet name column is missing, or there is
///   no active user to attribute the executions to
pub async fn import_executions(
    conn: &mut SqliteConnection,
    table: &Table,
    now: NaiveDateTime,
) -> Result<ExecutionImportSummary> {
    let columns = ColumnMap::resolve(&table.headers, EXECUTION_COLUMNS);
    columns.require(&["URN", "Retail Point Name"])?;

    let mut tx = conn.begin().await?;
    let agent_id = users::first_active_admin_or_user(&mut tx)
        .await?
        .ok_or_else(|| AppError::validation("No active user found to assign as agent"))?;
    let since = now - Duration::days(DUPLICATE_WINDOW_DAYS);

    let mut summary = ExecutionImportSummary::default();
    for (i, row) in table.rows.iter().enumerate() {
        let row_number = i + 1;
        let urn = columns.get(row, "URN");
        let outlet_name = columns.get(row, "Retail Point Name");
        if urn.is_empty() || outlet_name.is_empty() {
            summary.errors.push(RowError {
                row: row_number,
                error: format!(
                    "Missing required data - URN: '{}', Outlet Name: '{}'",
                    urn, outlet_name
                ),
            });
            continue;
        }

        let is_new = urn.to_lowercase().contains("new");
        if !is_new && executions::has_recent_for(&mut tx, urn, outlet_name, since).await? {
            summary.duplicates.push(RowMessage {
                row: row_number,
                message: format!(
                    "Duplicate entry - URN '{}' or outlet name '{}' has an execution in the last 7 days",
                    urn, outlet_name
                ),
            });
            continue;
        }

        match import_execution_row(&mut tx, &columns, row, agent_id, now).await {
            Ok(created) => {
                summary.imported += 1;
                if let Some(region) = created {
                    summary.outlets_created += 1;
                    summary.new_outlets.push(NewOutlet {
                        row: row_number,
                        urn: urn.to_string(),
                        name: outlet_name.to_string(),
                        region,
                    });
                }
            }
            Err(e) => {
                warn!(row = row_number, %urn, error = %e, "execution row rejected");
                summary.errors.push(RowError {
                    row: row_number,
                    error: e.to_string(),
                });
            }
        }
    }
    tx.commit().await?;

    info!(
        imported = summary.imported,
        outlets_created = summary.outlets_created,
        duplicates = summary.duplicates.len(),
        errors = summary.errors.len(),
        "execution import finished"
    );
    Ok(summary)
}

/// Insert one execution row. Returns the region of the outlet when the row
/// had to create it.
async fn import_execution_row(
    conn: &mut SqliteConnection,
    columns: &ColumnMap,
    row: &[String],
    agent_id: i64,
    now: NaiveDateTime,
) -> Result<Option<String>> {
    let urn = columns.get(row, "URN");
    let status = match columns.get(row, "Status") {
        "" => ExecutionStatus::Completed,
        raw => ExecutionStatus::parse(raw)
            .ok_or_else(|| AppError::validation(format!("Unknown status '{}'", raw)))?,
    };

    let (outlet_id, created) = match outlets::find_by_urn(conn, urn).await? {
        Some(outlet) => (outlet.id, None),
        None => {
            let region = match columns.get(row, "Region") {
                "" => "SW",
                region => region,
            };
            let outlet_type = match columns.get(row, "Outlet Type") {
                "" => "Shop",
                kind => kind,
            };
            let input = OutletInput {
                urn: urn.to_string(),
                outlet_name: columns.get(row, "Retail Point Name").to_string(),
                customer_name: columns.get(row, "Customer Name").to_string(),
                address: columns.get(row, "Address").to_string(),
                phone: columns.get(row, "Phone").to_string(),
                outlet_type: outlet_type.to_string(),
                local_govt: columns.get(row, "LGA").to_string(),
                state: columns.get(row, "State").to_string(),
                region: region.to_string(),
            };
            let id = outlets::create(conn, input)
                .await
                .map_err(|e| AppError::validation(format!("Failed to create outlet for URN '{}': {}", urn, e)))?;
            (id, Some(region.to_string()))
        }
    };

    let mut products = ProductChecklist::new();
    for product in IMPORTED_PRODUCTS {
        products.set(product, is_truthy(columns.get(row, product)));
    }

    let mut execution = ImportedExecution::new(
        outlet_id,
        agent_id,
        parse_date_cell(columns.get(row, "Date")).unwrap_or(now),
        "bulk_upload",
    );
    execution.status = status;
    execution.notes = crate::models::non_empty(columns.get(row, "Notes"));
    execution.products = products;
    executions::insert_imported(conn, &execution).await?;
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use rstest::rstest;

    fn at(value: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn table(csv: &str) -> Table {
        read_table("upload.csv", csv.as_bytes()).unwrap()
    }

    #[test]
    fn csv_headers_are_trimmed_and_blank_rows_dropped() {
        let t = table(" urn , outlet_name ,region\nU1,Mama Put,SW\n,,\nU2,Iya Basira,NW\n");
        assert_eq!(t.headers, vec!["urn", "outlet_name", "region"]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.rows[1], vec!["U2", "Iya Basira", "NW"]);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = read_table("outlets.pdf", b"%PDF").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn xlsx_cells_are_rendered_as_text() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, " URN ").unwrap();
        sheet.write_string(0, 1, "Phone").unwrap();
        sheet.write_string(1, 0, "DCP/22/SW/1").unwrap();
        sheet.write_number(1, 1, 8012345678.0).unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let t = read_table("Outlets.XLSX", &bytes).unwrap();
        assert_eq!(t.headers, vec!["URN", "Phone"]);
        assert_eq!(t.rows, vec![vec!["DCP/22/SW/1".to_string(), "8012345678".to_string()]]);
    }

    #[rstest]
    #[case("2025-03-04", Some("2025-03-04 00:00:00"))]
    #[case("04/03/2025", Some("2025-03-04 00:00:00"))]
    #[case("12/31/2025", Some("2025-12-31 00:00:00"))]
    #[case("2025-03-04 10:30:00", Some("2025-03-04 10:30:00"))]
    #[case("45720", Some("2025-03-04 00:00:00"))]
    #[case("yesterday", None)]
    #[case("", None)]
    fn date_cells(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_date_cell(input), expected.map(at));
    }

    #[test]
    fn aliases_resolve_case_insensitively() {
        let headers: Vec<String> = ["Outlet URN", "shop name", "Zone"].iter().map(|s| s.to_string()).collect();
        let columns = ColumnMap::resolve(&headers, EXECUTION_COLUMNS);
        let row: Vec<String> = ["U1", "Mama Put", "NC"].iter().map(|s| s.to_string()).collect();
        assert_eq!(columns.get(&row, "URN"), "U1");
        assert_eq!(columns.get(&row, "Retail Point Name"), "Mama Put");
        assert_eq!(columns.get(&row, "Region"), "NC");
        assert_eq!(columns.get(&row, "Notes"), "");
        assert!(columns.require(&["URN", "Retail Point Name"]).is_ok());
    }

    #[test]
    fn missing_columns_are_reported_with_available_ones() {
        let headers = vec!["Name".to_string(), "Phone".to_string()];
        let err = ColumnMap::resolve(&headers, EXECUTION_COLUMNS)
            .require(&["URN", "Retail Point Name"])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required columns: URN. Available columns: Name, Phone"
        );
    }

    #[test]
    fn summary_message_lists_what_happened() {
        let mut summary = ExecutionImportSummary::default();
        assert_eq!(summary.message(), "No data processed");
        summary.imported = 3;
        summary.duplicates.push(RowMessage {
            row: 2,
            message: String::new(),
        });
        assert_eq!(
            summary.message(),
            "Upload complete: 3 executions imported, 1 duplicates skipped"
        );
    }

    #[tokio::test]
    async fn outlet_import_inserts_and_updates() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        outlets::create(
            &mut conn,
            OutletInput {
                urn: "U1".into(),
                outlet_name: "Old Name".into(),
                region: "SW".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let t = table("urn,outlet_name,region,state\nU1,New Name,SW,LAGOS\nU2,Second,NW,KANO\nU3,No Region,,\n");
        let summary = import_outlets(&mut conn, &t).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].row, 3);

        let updated = outlets::find_by_urn(&mut conn, "U1").await.unwrap().unwrap();
        assert_eq!(updated.outlet_name, "New Name");
        assert_eq!(updated.state.as_deref(), Some("LAGOS"));
    }

    #[tokio::test]
    async fn user_import_reports_bad_rows() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let missing = table("username,password\nbola,secret\n");
        assert!(import_users(&mut conn, &missing).await.is_err());

        let t = table(
            "username,password,full_name,role,region\n\
             bola,secret,Bola Ade,field_agent,SW\n\
             bola,secret,Bola Again,field_agent,SW\n\
             chidi,secret,Chidi Obi,manager,SE\n",
        );
        let summary = import_users(&mut conn, &t).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors[0].error, "Username already exists");

        let bola = users::find_by_username(&mut conn, "bola").await.unwrap().unwrap();
        assert_eq!(bola.role, Role::FieldAgent);
        assert_ne!(bola.password, "secret");
    }

    #[tokio::test]
    async fn execution_import_skips_recent_duplicates() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        crate::db::seed_demo_users(&pool).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = at("2025-06-10 12:00:00");

        let t = table(
            "URN,Outlet Name,Zone,Date,Table,Chair\n\
             U1,Mama Put,,2025-06-09,yes,no\n\
             U1,Mama Put,,2025-06-09,yes,no\n\
             NEW-7,Fresh Kiosk,NC,,1,\n\
             NEW-7,Fresh Kiosk,NC,,1,\n\
             ,Nameless,,,,\n",
        );
        let summary = import_executions(&mut conn, &t, now).await.unwrap();
        assert_eq!(summary.imported, 3);
        assert_eq!(summary.outlets_created, 2);
        assert_eq!(summary.duplicates.len(), 1);
        assert_eq!(summary.duplicates[0].row, 2);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.new_outlets[0].region, "SW");
        assert_eq!(summary.new_outlets[1].region, "NC");

        let outlet = outlets::find_by_urn(&mut conn, "U1").await.unwrap().unwrap();
        assert_eq!(outlet.outlet_type.as_deref(), Some("Shop"));

        let admin = users::find_by_username(&mut conn, "admin").await.unwrap().unwrap();
        let (agent_id, date, products): (i64, String, String) = sqlx::query_as(
            "SELECT agent_id, execution_date, products_available FROM executions WHERE outlet_id = ?",
        )
        .bind(outlet.id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(agent_id, admin.id);
        assert_eq!(date, "2025-06-09 00:00:00");
        let products = ProductChecklist::from_json(&products);
        assert!(products.is_available("Table"));
        assert!(!products.is_available("Chair"));
    }

    #[tokio::test]
    async fn execution_import_needs_an_active_user() {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let t = table("URN,Outlet Name\nU1,Mama Put\n");
        let err = import_executions(&mut conn, &t, at("2025-06-10 12:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
