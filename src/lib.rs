/*!
# SurveyTray

Field-execution tracking for retail outlet visits (POSM activation), built in Rust.

## Overview

Field agents visit retail outlets, take before/after photos, record GPS
coordinates and tick off which point-of-sale materials are present.
Supervisors and admins manage outlets and users, bulk import them from CSV or
Excel, watch coverage on a dashboard and export deployment reports.

## Architecture

### HTTP Layer (`web` feature)
- **Technologies**: axum, tower-http, tokio
- **Key Components**:
  - Router - public, authenticated and admin-only route groups
  - Session middleware - cookie sessions resolved to a `SessionUser`
  - Upload handling - multipart forms, camera captures as data URLs
  - Static files - uploaded images served from the upload directory

### Domain Layer
- **Technologies**: sqlx on SQLite
- **Core Components**:
  - Outlet, user and execution repositories
  - Filter / pagination query builder with bound parameters
  - Dashboard and report aggregation
  - CSV / Excel importers with column alias resolution
  - CSV / XLSX / PDF exporters

### Data Persistence Layer
- One SQLite file in WAL mode, schema managed by embedded migrations
- Uploaded images and thumbnails in a flat upload directory

## Modules

- **config**: Command line / environment configuration
- **logging**: tracing subscriber setup
- **error**: Application error type and its HTTP mapping
- **models**: Records, roles, statuses and the product checklist
- **query**: Pagination and filter helpers
- **db**: Pool creation, migrations and demo users
- **login**: Password hashing, authentication and sessions
- **outlets**, **users**, **executions**, **profile**: Repositories
- **dashboard**: Coverage numbers, deployments and agent performance
- **reports**: Product availability, execution summary and report uploads
- **loader**: CSV / Excel import
- **downloader**: Deployment export (CSV, XLSX, PDF)
- **saving**: Image uploads and thumbnails
- **app**, **api**, **admin**: Router and request handlers

## REST API Endpoints

- `/login`, `/logout` - Session management
- `/outlets`, `/all_visitation`, `/api/outlets` - Outlet listings
- `/execution/new/{outlet_id}` - Start and complete a visit
- `/executions`, `/execution/{id}` - Visit history
- `/api/posm_deployments/export?type=csv|xlsx|pdf` - Report export
- `/admin/...` - User, outlet, branding and execution administration
*/

pub mod config;
pub mod dashboard;
pub mod db;
pub mod downloader;
pub mod error;
pub mod executions;
pub mod loader;
pub mod logging;
pub mod login;
pub mod models;
pub mod outlets;
pub mod profile;
pub mod query;
pub mod reports;
pub mod saving;
pub mod users;

#[cfg(feature = "web")]
pub mod admin;
#[cfg(feature = "web")]
pub mod api;
#[cfg(feature = "web")]
pub mod app;

pub use config::Config;
pub use error::{AppError, Result};
