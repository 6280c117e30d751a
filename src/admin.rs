#![cfg(not(tarpaulin_include))]

//! Handlers under `/admin`, all layered behind [`crate::login::require_admin`].

use axum::{
    Extension, Form, Json,
    extract::{Multipart, Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::api::FormParts;
use crate::app::{AppState, StatusResponse};
use crate::error::{AppError, Result};
use crate::loader::{self, Table};
use crate::models::{self, OutletInput, SessionUser, UserInput};
use crate::outlets::{self, OutletGroup};
use crate::profile::{self, ProfileInput};
use crate::users::{self, BulkDeleteOptions, UserGroup};
use crate::{dashboard, executions, saving};

/// Field names an import form may use for its file.
const UPLOAD_FIELDS: [&str; 2] = ["file", "csv_file"];

async fn uploaded_table(multipart: Multipart) -> Result<Table> {
    let parts = FormParts::read(multipart).await?;
    let Some((file_name, bytes)) = parts.file(&UPLOAD_FIELDS) else {
        return Err(AppError::validation("No file uploaded"));
    };
    let table = loader::read_table(file_name, bytes)?;
    if table.is_empty() {
        return Err(AppError::validation("The uploaded file contains no rows"));
    }
    Ok(table)
}

/// `delete_by` / `value` pair of the bulk preview and delete endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct BulkQuery {
    pub delete_by: Option<String>,
    pub value: Option<String>,
}

impl BulkQuery {
    fn criteria<G>(&self, parse: fn(&str) -> Option<G>) -> Option<(G, &str)> {
        let group = parse(self.delete_by.as_deref()?)?;
        let value = self.value.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
        Some((group, value))
    }
}

/// Bulk delete form; the skip options are checkboxes.
#[derive(Debug, Default, Deserialize)]
pub struct BulkDeleteForm {
    #[serde(flatten)]
    pub query: BulkQuery,
    pub skip_with_executions: Option<String>,
    pub skip_admins: Option<String>,
}

fn invalid_criteria() -> AppError {
    AppError::validation("Invalid criteria or no value specified")
}

/// `GET /admin` - record counts and the latest activity.
pub async fn dashboard(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let stats = dashboard::admin_stats(&mut conn).await?;
    Ok(Json(stats))
}

// Users

pub async fn user_list(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let users = users::list_all(&mut conn).await?;
    Ok(Json(users))
}

pub async fn user_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let user = users::get(&mut conn, id).await?;
    Ok(Json(user))
}

pub async fn user_new(
    State(state): State<AppState>,
    Form(input): Form<UserInput>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    let username = input.username.trim().to_string();
    let id = users::create(&mut conn, input).await?;
    Ok(StatusResponse::with_id(format!("User {} created successfully", username), id))
}

/// `POST /admin/users/edit/:id` - an empty password keeps the current one.
pub async fn user_edit(
    State(state): State<AppState>,
    Extension(acting): Extension<SessionUser>,
    Path(id): Path<i64>,
    Form(input): Form<UserInput>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    let password_changed = !input.password.trim().is_empty();
    users::update(&mut conn, id, input, &acting).await?;
    if password_changed && id != acting.user_id {
        state.sessions.remove_user(id);
    }
    Ok(StatusResponse::with_id("User updated successfully", id))
}

pub async fn user_delete(
    State(state): State<AppState>,
    Extension(acting): Extension<SessionUser>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    users::delete(&mut conn, id, &acting).await?;
    state.sessions.remove_user(id);
    Ok(StatusResponse::with_id("User deleted successfully", id))
}

/// `POST /admin/users/import` - CSV or Excel file in the `file` field.
pub async fn user_import(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let table = uploaded_table(multipart).await?;
    let mut conn = state.pool.acquire().await?;
    let summary = loader::import_users(&mut conn, &table).await?;
    Ok(Json(json!({
        "status": "ok",
        "message": format!(
            "Imported {} users, skipped {}, {} errors",
            summary.inserted,
            summary.skipped,
            summary.errors.len()
        ),
        "summary": summary,
    })))
}

pub async fn user_preview(
    State(state): State<AppState>,
    Query(query): Query<BulkQuery>,
) -> Result<Json<Value>> {
    let Some((group, value)) = query.criteria(UserGroup::parse) else {
        return Ok(Json(json!({ "users": [] })));
    };
    let mut conn = state.pool.acquire().await?;
    let users = users::bulk_preview(&mut conn, group, value).await?;
    Ok(Json(json!({ "users": users })))
}

pub async fn user_bulk_delete(
    State(state): State<AppState>,
    Extension(acting): Extension<SessionUser>,
    Form(form): Form<BulkDeleteForm>,
) -> Result<Json<StatusResponse>> {
    let (group, value) = form.query.criteria(UserGroup::parse).ok_or_else(invalid_criteria)?;
    let options = BulkDeleteOptions {
        skip_with_executions: form.skip_with_executions.is_some(),
        skip_admins: form.skip_admins.is_some(),
    };
    let mut conn = state.pool.acquire().await?;
    let deleted = users::bulk_delete(&mut conn, group, value, options, &acting).await?;
    Ok(StatusResponse::with_count(
        format!("Successfully deleted {} users", deleted),
        deleted,
    ))
}

// Outlets

pub async fn outlet_list(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let outlets = outlets::list_all(&mut conn).await?;
    Ok(Json(outlets))
}

pub async fn outlet_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let outlet = outlets::get(&mut conn, id).await?;
    Ok(Json(outlet))
}

pub async fn outlet_new(
    State(state): State<AppState>,
    Form(input): Form<OutletInput>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    let id = outlets::create(&mut conn, input).await?;
    Ok(StatusResponse::with_id("Outlet created successfully", id))
}

pub async fn outlet_edit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Form(input): Form<OutletInput>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    outlets::update(&mut conn, id, input).await?;
    Ok(StatusResponse::with_id("Outlet updated successfully", id))
}

pub async fn outlet_delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    outlets::delete(&mut conn, id).await?;
    Ok(StatusResponse::with_id("Outlet deleted successfully", id))
}

/// `POST /admin/outlets/import` - insert or update outlets by URN.
pub async fn outlet_import(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let table = uploaded_table(multipart).await?;
    let mut conn = state.pool.acquire().await?;
    let summary = loader::import_outlets(&mut conn, &table).await?;
    Ok(Json(json!({
        "status": "ok",
        "message": format!(
            "Imported {} new outlets, updated {}, {} errors",
            summary.inserted,
            summary.updated,
            summary.errors.len()
        ),
        "summary": summary,
    })))
}

pub async fn outlet_preview(
    State(state): State<AppState>,
    Query(query): Query<BulkQuery>,
) -> Result<Json<Value>> {
    let Some((group, value)) = query.criteria(OutletGroup::parse) else {
        return Ok(Json(json!({ "outlets": [] })));
    };
    let mut conn = state.pool.acquire().await?;
    let outlets = outlets::bulk_preview(&mut conn, group, value).await?;
    Ok(Json(json!({ "outlets": outlets })))
}

pub async fn outlet_bulk_delete(
    State(state): State<AppState>,
    Form(form): Form<BulkDeleteForm>,
) -> Result<Json<StatusResponse>> {
    let (group, value) = form.query.criteria(OutletGroup::parse).ok_or_else(invalid_criteria)?;
    let mut conn = state.pool.acquire().await?;
    let deleted =
        outlets::bulk_delete(&mut conn, group, value, form.skip_with_executions.is_some()).await?;
    Ok(StatusResponse::with_count(
        format!("Successfully deleted {} outlets", deleted),
        deleted,
    ))
}

// Branding

pub async fn profile_get(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let profile = profile::get(&mut conn).await?;
    Ok(Json(profile))
}

pub async fn profile_update(
    State(state): State<AppState>,
    Form(input): Form<ProfileInput>,
) -> Result<Json<Value>> {
    let mut conn = state.pool.acquire().await?;
    let profile = profile::update(&mut conn, input).await?;
    Ok(Json(json!({
        "status": "ok",
        "message": "Profile settings updated successfully",
        "profile": profile,
    })))
}

// Executions

pub async fn execution_list(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let executions = executions::list_admin(&mut conn).await?;
    Ok(Json(executions))
}

/// `POST /admin/executions/delete/:id` - also removes the visit's images.
pub async fn execution_delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>> {
    let mut conn = state.pool.acquire().await?;
    let images = executions::delete(&mut conn, id).await?;
    drop(conn);

    let dir = state.upload_dir().to_path_buf();
    let removed = images.len();
    tokio::task::spawn_blocking(move || saving::remove_files(&dir, &images))
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
    info!(execution_id = id, images = removed, "execution deleted");
    Ok(StatusResponse::with_id("Execution deleted successfully", id))
}

/// `POST /admin/executions/upload` - spreadsheet of completed visits.
pub async fn execution_upload(
    State(state): State<AppState>,
    Extension(acting): Extension<SessionUser>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let table = uploaded_table(multipart).await?;
    let mut conn = state.pool.acquire().await?;
    let summary = loader::import_executions(&mut conn, &table, models::now()).await?;
    info!(
        user = %acting.username,
        rows = table.len(),
        imported = summary.imported,
        outlets_created = summary.outlets_created,
        "executions imported"
    );
    Ok(Json(json!({
        "status": "ok",
        "message": summary.message(),
        "summary": summary,
    })))
}
