#![cfg(not(tarpaulin_include))]

//! Handlers for everything a signed-in user can reach outside `/admin`.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::app::{AppState, PageQuery, StatusResponse};
use crate::dashboard::{self, AgentFilter, DeploymentFilter};
use crate::downloader::{self, ExportFormat};
use crate::error::{AppError, Result};
use crate::executions::{self, CompletionInput, ExecutionFilter};
use crate::models::{self, POSM_PRODUCTS, ProductChecklist, SessionUser};
use crate::outlets::{self, OutletFilter};
use crate::reports::{self, BulkExecution, ReportUpload};
use crate::{profile, saving};

pub(crate) fn multipart_error(err: MultipartError) -> AppError {
    AppError::validation(err.body_text())
}

/// A multipart body split into uploaded files and plain text fields.
#[derive(Debug, Default)]
pub(crate) struct FormParts {
    /// Field name to `(original file name, content)`; empty files are dropped.
    pub files: HashMap<String, (String, Bytes)>,
    pub fields: HashMap<String, String>,
}

impl FormParts {
    pub async fn read(mut multipart: Multipart) -> Result<FormParts> {
        let mut parts = FormParts::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) if !file_name.is_empty() => {
                    let bytes = field.bytes().await.map_err(multipart_error)?;
                    if !bytes.is_empty() {
                        parts.files.insert(name, (file_name, bytes));
                    }
                }
                _ => {
                    let value = field.text().await.map_err(multipart_error)?;
                    parts.fields.insert(name, value);
                }
            }
        }
        Ok(parts)
    }

    /// The first uploaded file among `names`.
    pub fn file(&self, names: &[&str]) -> Option<&(String, Bytes)> {
        names.iter().find_map(|name| self.files.get(*name))
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn flag(&self, name: &str) -> bool {
        self.text(name)
            .is_some_and(|value| models::is_truthy(value) || value.eq_ignore_ascii_case("on"))
    }

    fn coordinate(&self, name: &str) -> Result<Option<f64>> {
        self.text(name)
            .map(|value| {
                value
                    .parse::<f64>()
                    .map_err(|_| AppError::validation(format!("Invalid {}: {}", name, value)))
            })
            .transpose()
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

/// `GET /` - the session user, branding and their dashboard numbers.
pub async fn home(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
) -> Result<Json<Value>> {
    let mut conn = state.pool.acquire().await?;
    let profile = profile::get(&mut conn).await?;
    let dashboard = dashboard::dashboard_data(&mut conn, &user).await?;
    Ok(Json(json!({
        "user": user,
        "profile": profile,
        "dashboard": dashboard,
    })))
}

pub async fn pending_outlets(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Query(filter): Query<OutletFilter>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let outlets = outlets::list_pending(&mut conn, &user, &filter, state.pagination(&page)).await?;
    Ok(Json(outlets))
}

/// `GET /all_visitation` - outlets without a completed visit this week.
pub async fn unvisited_outlets(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Query(filter): Query<OutletFilter>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let outlets = outlets::list_unvisited(
        &mut conn,
        &user,
        &filter,
        state.pagination(&page),
        models::now(),
    )
    .await?;
    Ok(Json(outlets))
}

pub async fn outlet_search(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Query(filter): Query<OutletFilter>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let outlets = outlets::search(&mut conn, &user, &filter).await?;
    Ok(Json(outlets))
}

/// `GET /assign_execution/:outlet_id` - claim the outlet, then open the form.
pub async fn assign_execution(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Path(outlet_id): Path<i64>,
) -> Result<Redirect> {
    let mut conn = state.pool.acquire().await?;
    executions::start(&mut conn, outlet_id, user.user_id, models::now()).await?;
    Ok(Redirect::to(&format!("/execution/new/{}", outlet_id)))
}

/// `GET /execution/new/:outlet_id` - the pending visit and what to record.
pub async fn new_execution(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Path(outlet_id): Path<i64>,
) -> Result<Json<Value>> {
    let mut conn = state.pool.acquire().await?;
    let execution = executions::start(&mut conn, outlet_id, user.user_id, models::now()).await?;
    let outlet = outlets::get(&mut conn, outlet_id).await?;
    Ok(Json(json!({
        "execution": execution,
        "outlet": outlet,
        "products": POSM_PRODUCTS,
    })))
}

/// Before/after images of a visit, as stored file names.
#[derive(Debug, Default)]
struct VisitImages {
    before: Option<String>,
    after: Option<String>,
    before_thumbnail: Option<String>,
    after_thumbnail: Option<String>,
}

impl VisitImages {
    fn names(&self) -> Vec<String> {
        [&self.before, &self.after, &self.before_thumbnail, &self.after_thumbnail]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Store one side of the visit: an uploaded file wins over a camera capture.
fn store_side(
    dir: &std::path::Path,
    side: &str,
    file: Option<(String, Bytes)>,
    captured: Option<String>,
) -> Result<(Option<String>, Option<String>)> {
    let stored = match (file, captured) {
        (Some((file_name, bytes)), _) => Some(saving::store_upload(dir, &file_name, &bytes)?),
        (None, Some(data_url)) => saving::store_data_url(dir, &data_url, side)?,
        (None, None) => None,
    };
    let thumbnail = stored
        .as_deref()
        .and_then(|name| saving::make_thumbnail(dir, name, saving::THUMBNAIL_SIZE));
    Ok((stored, thumbnail))
}

/// Image fields of the completion form, detached from the request.
#[derive(Debug, Default)]
struct VisitUploads {
    before_file: Option<(String, Bytes)>,
    after_file: Option<(String, Bytes)>,
    before_capture: Option<String>,
    after_capture: Option<String>,
}

impl VisitUploads {
    fn from_parts(parts: &FormParts) -> Self {
        VisitUploads {
            before_file: parts.file(&["before_image"]).cloned(),
            after_file: parts.file(&["after_image"]).cloned(),
            before_capture: parts.text("before_captured_image").map(str::to_string),
            after_capture: parts.text("after_captured_image").map(str::to_string),
        }
    }

    /// Write both sides to `dir`; nothing is left behind when either fails.
    fn store(self, dir: &std::path::Path) -> Result<VisitImages> {
        let (before, before_thumbnail) = store_side(dir, "before", self.before_file, self.before_capture)?;
        let (after, after_thumbnail) = match store_side(dir, "after", self.after_file, self.after_capture) {
            Ok(stored) => stored,
            Err(e) => {
                let orphans: Vec<String> = [before, before_thumbnail].into_iter().flatten().collect();
                saving::remove_files(dir, &orphans);
                return Err(e);
            }
        };
        Ok(VisitImages {
            before,
            after,
            before_thumbnail,
            after_thumbnail,
        })
    }
}

/// `POST /execution/new/:outlet_id` - finish a visit from the multipart form.
///
/// Images arrive either as `before_image`/`after_image` files or as
/// `before_captured_image`/`after_captured_image` data URLs. Products are
/// `product_<name>` fields with spaces in the name replaced by `_`.
pub async fn submit_execution(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Path(outlet_id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<StatusResponse>> {
    let parts = FormParts::read(multipart).await?;

    let mut products = ProductChecklist::new();
    for product in POSM_PRODUCTS {
        let field = format!("product_{}", product.replace(' ', "_"));
        products.set(product, parts.flag(&field));
    }
    let latitude = parts.coordinate("latitude")?;
    let longitude = parts.coordinate("longitude")?;
    let notes = parts.text("notes").map(str::to_string);

    let dir = state.upload_dir().to_path_buf();
    let uploads = VisitUploads::from_parts(&parts);
    let images = {
        let dir = dir.clone();
        blocking(move || uploads.store(&dir)).await?
    };

    let input = CompletionInput {
        before_image: images.before.clone(),
        after_image: images.after.clone(),
        before_image_thumbnail: images.before_thumbnail.clone(),
        after_image_thumbnail: images.after_thumbnail.clone(),
        latitude,
        longitude,
        notes,
        products,
    };

    let completed = async {
        let mut tx = state.pool.begin().await?;
        let id = executions::complete(&mut tx, outlet_id, user.user_id, input, models::now()).await?;
        tx.commit().await?;
        Ok::<i64, AppError>(id)
    }
    .await;

    match completed {
        Ok(id) => Ok(StatusResponse::with_id("Execution completed successfully", id)),
        Err(e) => {
            warn!(outlet_id, user = %user.username, error = %e, "visit not recorded");
            saving::remove_files(&dir, &images.names());
            Err(e)
        }
    }
}

pub async fn execution_list(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Query(filter): Query<ExecutionFilter>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let executions = executions::list(&mut conn, &user, &filter, state.pagination(&page)).await?;
    Ok(Json(executions))
}

/// `GET /execution/:id` - field agents may only open their own visits.
pub async fn execution_detail(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let execution = executions::get_detail(&mut conn, id).await?;
    if user.is_field_agent() && execution.agent_id != user.user_id {
        return Err(AppError::Forbidden(
            "You can only view your own executions".into(),
        ));
    }
    Ok(Json(execution))
}

pub async fn dashboard_data(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let data = dashboard::dashboard_data(&mut conn, &user).await?;
    Ok(Json(data))
}

pub async fn recent_executions(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let executions = executions::recent(&mut conn, &user, models::now()).await?;
    Ok(Json(executions))
}

pub async fn posm_deployments(
    State(state): State<AppState>,
    Query(filter): Query<DeploymentFilter>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let deployments =
        dashboard::posm_deployments(&mut conn, &filter, state.pagination(&page), models::now()).await?;
    Ok(Json(deployments))
}

pub async fn agent_performance(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Query(filter): Query<AgentFilter>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let agents = dashboard::agent_performance(
        &mut conn,
        &user,
        &filter,
        state.pagination(&page),
        models::now(),
    )
    .await?;
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(rename = "type", default = "default_export_type")]
    pub export_type: String,
}

fn default_export_type() -> String {
    "csv".to_string()
}

/// `GET /api/posm_deployments/export?type=csv|xlsx|pdf`
///
/// # Errors
/// * `Validation` (400) for an unknown `type`
/// * `NotFound` (404) when the filters match nothing
pub async fn export_deployments(
    State(state): State<AppState>,
    Query(export): Query<ExportQuery>,
    Query(filter): Query<DeploymentFilter>,
) -> Result<Response> {
    let format = ExportFormat::parse(&export.export_type)?;

    let mut conn = state.pool.acquire().await?;
    let rows =
        downloader::deployment_rows(&mut conn, &filter, state.config.export_limit, models::now()).await?;
    let title = profile::get(&mut conn).await?.app_title;
    drop(conn);

    let count = rows.len();
    let image_base = state.config.public_image_base.clone();
    let bytes = blocking(move || downloader::render(format, &rows, &title, &image_base)).await?;
    info!(format = format.extension(), rows = count, bytes = bytes.len(), "deployments exported");

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", format.file_name()),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct RegionQuery {
    pub region: Option<String>,
}

pub async fn product_availability(
    State(state): State<AppState>,
    Query(query): Query<RegionQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let availability = reports::product_availability(&mut conn, query.region.as_deref()).await?;
    Ok(Json(availability))
}

pub async fn execution_summary(
    State(state): State<AppState>,
    Query(query): Query<RegionQuery>,
) -> Result<impl IntoResponse> {
    let mut conn = state.pool.acquire().await?;
    let summary = reports::execution_summary(&mut conn, query.region.as_deref()).await?;
    Ok(Json(summary))
}

fn require_report_uploader(user: &SessionUser) -> Result<()> {
    if user.can_upload_reports() {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Only admins and supervisors can upload reports".into(),
        ))
    }
}

/// `POST /reports/upload` - one sheet converted to JSON rows.
pub async fn upload_report(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Json(upload): Json<ReportUpload>,
) -> Result<impl IntoResponse> {
    require_report_uploader(&user)?;
    let mut conn = state.pool.acquire().await?;
    let result = reports::upload_report(&mut conn, &upload, models::now()).await?;
    info!(
        user = %user.username,
        sheet = %upload.sheet_name,
        imported = result.imported,
        updated = result.updated,
        errors = result.errors,
        "report uploaded"
    );
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct BulkUploadRequest {
    #[serde(default)]
    pub executions: Vec<BulkExecution>,
}

pub async fn bulk_execution_upload(
    State(state): State<AppState>,
    Extension(user): Extension<SessionUser>,
    Json(request): Json<BulkUploadRequest>,
) -> Result<impl IntoResponse> {
    require_report_uploader(&user)?;
    let mut conn = state.pool.acquire().await?;
    let result = reports::bulk_execution_upload(&mut conn, &request.executions, models::now()).await?;
    info!(user = %user.username, imported = result.imported, errors = result.errors, "bulk executions uploaded");
    Ok(Json(result))
}
