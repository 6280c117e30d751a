#![cfg(not(tarpaulin_include))]

use crate::error::{AppError, Result};
use crate::models::{Profile, format_timestamp, non_empty, now};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use sqlx::SqliteConnection;
use tracing::info;

lazy_static! {
    static ref HEX_COLOR: Regex = Regex::new(r"^#[0-9A-Fa-f]{6}$").unwrap();
}

/// Branding form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileInput {
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub app_title: String,
    #[serde(default)]
    pub primary_color: String,
    #[serde(default)]
    pub secondary_color: String,
    #[serde(default)]
    pub accent_color: String,
    #[serde(default)]
    pub logo_path: String,
    #[serde(default)]
    pub favicon_path: String,
    #[serde(default)]
    pub company_address: String,
    #[serde(default)]
    pub company_phone: String,
    #[serde(default)]
    pub company_email: String,
    #[serde(default)]
    pub company_website: String,
    #[serde(default)]
    pub footer_text: String,
}

fn color(value: &str, field: &str, fallback: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(fallback.to_string());
    }
    if HEX_COLOR.is_match(value) {
        Ok(value.to_lowercase())
    } else {
        Err(AppError::validation(format!(
            "{} must be a hex color like #fdcc03",
            field
        )))
    }
}

/// The branding row, or the built-in defaults when it is missing.
pub async fn get(conn: &mut SqliteConnection) -> Result<Profile> {
    let profile = sqlx::query_as::<_, Profile>(
        "SELECT company_name, app_title, primary_color, secondary_color, accent_color, logo_path, favicon_path,
                company_address, company_phone, company_email, company_website, footer_text
         FROM profile WHERE id = 1",
    )
    .fetch_optional(&mut *conn)
    .await?;
    Ok(profile.unwrap_or_default())
}

/// Save the branding row.
///
/// Blank colors keep the current value; blank logo and favicon paths keep the
/// current files.
///
/// # Errors
/// * `Validation` when company name or app title is blank, or a color is not
///   `#RRGGBB`
pub async fn update(conn: &mut SqliteConnection, input: ProfileInput) -> Result<Profile> {
    let company_name = non_empty(&input.company_name);
    let app_title = non_empty(&input.app_title);
    let (Some(company_name), Some(app_title)) = (company_name, app_title) else {
        return Err(AppError::validation(
            "Company name and app title are required",
        ));
    };

    let current = get(conn).await?;
    let profile = Profile {
        company_name,
        app_title,
        primary_color: color(&input.primary_color, "Primary color", &current.primary_color)?,
        secondary_color: color(&input.secondary_color, "Secondary color", &current.secondary_color)?,
        accent_color: color(&input.accent_color, "Accent color", &current.accent_color)?,
        logo_path: non_empty(&input.logo_path).or(current.logo_path),
        favicon_path: non_empty(&input.favicon_path).or(current.favicon_path),
        company_address: non_empty(&input.company_address),
        company_phone: non_empty(&input.company_phone),
        company_email: non_empty(&input.company_email),
        company_website: non_empty(&input.company_website),
        footer_text: non_empty(&input.footer_text),
    };

    sqlx::query(
        "INSERT INTO profile (id, company_name, app_title, primary_color, secondary_color, accent_color, logo_path,
                              favicon_path, company_address, company_phone, company_email, company_website,
                              footer_text, updated_at)
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
            company_name = excluded.company_name, app_title = excluded.app_title,
            primary_color = excluded.primary_color, secondary_color = excluded.secondary_color,
            accent_color = excluded.accent_color, logo_path = excluded.logo_path,
            favicon_path = excluded.favicon_path, company_address = excluded.company_address,
            company_phone = excluded.company_phone, company_email = excluded.company_email,
            company_website = excluded.company_website, footer_text = excluded.footer_text,
            updated_at = excluded.updated_at",
    )
    .bind(&profile.company_name)
    .bind(&profile.app_title)
    .bind(&profile.primary_color)
    .bind(&profile.secondary_color)
    .bind(&profile.accent_color)
    .bind(&profile.logo_path)
    .bind(&profile.favicon_path)
    .bind(&profile.company_address)
    .bind(&profile.company_phone)
    .bind(&profile.company_email)
    .bind(&profile.company_website)
    .bind(&profile.footer_text)
    .bind(format_timestamp(now()))
    .execute(&mut *conn)
    .await?;

    info!(company = %profile.company_name, "profile updated");
    Ok(profile)
}
