#![cfg(not(tarpaulin_include))]

use crate::error::{AppError, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Format used for every timestamp column (`execution_date`, `created_at`, ...).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Point-of-sale materials checked on every visit.
pub const POSM_PRODUCTS: [&str; 7] = [
    "Table",
    "Chair",
    "Parasol",
    "Parasol Stand",
    "Tarpaulin",
    "Hawker Jacket",
    "Cups",
];

/// Current local time, truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Render a timestamp the way it is stored in SQLite.
pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Trimmed value, or `None` when nothing is left.
pub fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Role {
    Admin,
    FieldAgent,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::FieldAgent => "field_agent",
            Role::Supervisor => "supervisor",
        }
    }

    /// Parse a role name as typed in forms and spreadsheets.
    ///
    /// Case and the separator between "field" and "agent" are ignored.
    pub fn parse(value: &str) -> Option<Role> {
        let normalized = value.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "admin" => Some(Role::Admin),
            "field_agent" | "agent" => Some(Role::FieldAgent),
            "supervisor" => Some(Role::Supervisor),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ExecutionStatus {
    Pending,
    #[serde(rename = "In_Progress")]
    #[sqlx(rename = "In_Progress")]
    InProgress,
    Completed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::InProgress => "In_Progress",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<ExecutionStatus> {
        let normalized = value.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "pending" => Some(ExecutionStatus::Pending),
            "in_progress" => Some(ExecutionStatus::InProgress),
            "completed" | "complete" | "done" => Some(ExecutionStatus::Completed),
            "cancelled" | "canceled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product name to availability, stored as a JSON object on each execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductChecklist(BTreeMap<String, bool>);

impl ProductChecklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the stored JSON.
    ///
    /// Besides booleans, legacy rows hold strings such as `"Yes"`; those are
    /// read with [`is_truthy`]. Anything unreadable yields an empty checklist.
    pub fn from_json(raw: &str) -> Self {
        let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) else {
            return Self::default();
        };
        let products = map
            .into_iter()
            .map(|(name, value)| {
                let available = match value {
                    serde_json::Value::Bool(b) => b,
                    serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
                    serde_json::Value::String(s) => is_truthy(&s),
                    _ => false,
                };
                (name, available)
            })
            .collect();
        ProductChecklist(products)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn set(&mut self, name: &str, available: bool) {
        self.0.insert(name.to_string(), available);
    }

    /// Availability of a product; unknown products count as unavailable.
    pub fn is_available(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(name, available)| (name.as_str(), *available))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Spreadsheet and form cell values that mean "yes".
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "available" | "present"
    )
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Outlet {
    pub id: i64,
    pub urn: String,
    pub outlet_name: String,
    pub customer_name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub outlet_type: Option<String>,
    pub local_govt: Option<String>,
    pub state: Option<String>,
    pub region: String,
    pub created_at: String,
    pub updated_at: String,
    pub is_active: bool,
}

/// Outlet fields as submitted by forms and importers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutletInput {
    #[serde(default)]
    pub urn: String,
    #[serde(default)]
    pub outlet_name: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub outlet_type: String,
    #[serde(default)]
    pub local_govt: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub region: String,
}

impl OutletInput {
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.urn,
            &mut self.outlet_name,
            &mut self.customer_name,
            &mut self.address,
            &mut self.phone,
            &mut self.outlet_type,
            &mut self.local_govt,
            &mut self.state,
            &mut self.region,
        ] {
            *field = field.trim().to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.urn.trim().is_empty() {
            missing.push("URN");
        }
        if self.outlet_name.trim().is_empty() {
            missing.push("Outlet Name");
        }
        if self.region.trim().is_empty() {
            missing.push("Region");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(format!(
                "{} required",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub full_name: String,
    pub role: Role,
    pub region: Option<String>,
    pub state: Option<String>,
    pub lga: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub last_login: Option<String>,
}

/// User fields as submitted by forms and importers.
///
/// An empty password on update keeps the stored hash.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub lga: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

/// The identity attached to an authenticated session.
///
/// Queries use it to scope what a field agent may see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub region: Option<String>,
    pub state: Option<String>,
    pub lga: Option<String>,
}

impl SessionUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_field_agent(&self) -> bool {
        self.role == Role::FieldAgent
    }

    /// Admins and supervisors may upload reports.
    pub fn can_upload_reports(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Supervisor)
    }
}

impl From<&User> for SessionUser {
    fn from(user: &User) -> Self {
        SessionUser {
            user_id: user.id,
            username: user.username.clone(),
            full_name: user.full_name.clone(),
            role: user.role,
            region: user.region.clone(),
            state: user.state.clone(),
            lga: user.lga.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Execution {
    pub id: i64,
    pub outlet_id: i64,
    pub agent_id: i64,
    pub execution_date: String,
    pub before_image: Option<String>,
    pub after_image: Option<String>,
    pub before_image_thumbnail: Option<String>,
    pub after_image_thumbnail: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    pub products_available: String,
    pub execution_score: Option<f64>,
    pub status: ExecutionStatus,
    pub upload_method: String,
}

impl Execution {
    pub fn products(&self) -> ProductChecklist {
        ProductChecklist::from_json(&self.products_available)
    }
}

/// An execution joined with its outlet and agent.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExecutionDetail {
    pub id: i64,
    pub outlet_id: i64,
    pub agent_id: i64,
    pub execution_date: String,
    pub status: ExecutionStatus,
    pub before_image: Option<String>,
    pub after_image: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
    #[serde(skip_serializing)]
    pub products_available: String,
    pub upload_method: String,
    pub urn: String,
    pub outlet_name: String,
    pub customer_name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub outlet_type: Option<String>,
    pub local_govt: Option<String>,
    pub state: Option<String>,
    pub region: String,
    pub agent_name: String,
    #[sqlx(skip)]
    pub products: ProductChecklist,
}

impl ExecutionDetail {
    pub(crate) fn with_products(mut self) -> Self {
        self.products = ProductChecklist::from_json(&self.products_available);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub company_name: String,
    pub app_title: String,
    pub primary_color: String,
    pub secondary_color: String,
    pub accent_color: String,
    pub logo_path: Option<String>,
    pub favicon_path: Option<String>,
    pub company_address: Option<String>,
    pub company_phone: Option<String>,
    pub company_email: Option<String>,
    pub company_website: Option<String>,
    pub footer_text: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            company_name: "DANGOTE".to_string(),
            app_title: "POSM Retail Activation 2025".to_string(),
            primary_color: "#fdcc03".to_string(),
            secondary_color: "#f8f9fa".to_string(),
            accent_color: "#343a40".to_string(),
            logo_path: Some("img/dangote-logo.png".to_string()),
            favicon_path: Some("img/favicon.png".to_string()),
            company_address: None,
            company_phone: None,
            company_email: None,
            company_website: None,
            footer_text: None,
        }
    }
}
