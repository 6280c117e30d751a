#![cfg(not(tarpaulin_include))]

use clap::Parser;
use std::path::PathBuf;

/// Runtime configuration for the SurveyTray server.
///
/// Values come from command line flags first, then `SURVEYTRAY_*` environment
/// variables (a `.env` file is loaded by the binary before parsing), then the
/// defaults below.
#[derive(Parser, Debug, Clone)]
#[command(name = "surveytray", version, about = "Retail outlet field-execution tracker")]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(long, env = "SURVEYTRAY_BIND", default_value = "0.0.0.0:5000")]
    pub bind: String,

    /// SQLite database file
    #[arg(long, env = "SURVEYTRAY_DB_PATH", default_value = "maindatabase.db")]
    pub db_path: PathBuf,

    /// Directory where uploaded images are stored and served from
    #[arg(long, env = "SURVEYTRAY_UPLOAD_DIR", default_value = "static/uploads")]
    pub upload_dir: PathBuf,

    /// Prefix used when image file names are turned into links in exports
    #[arg(long, env = "SURVEYTRAY_PUBLIC_IMAGE_BASE", default_value = "/static/uploads/")]
    pub public_image_base: String,

    /// Session lifetime in hours
    #[arg(long, env = "SURVEYTRAY_SESSION_HOURS", default_value_t = 8)]
    pub session_hours: u64,

    /// Default page size for paginated listings
    #[arg(long, env = "SURVEYTRAY_PER_PAGE", default_value_t = 20)]
    pub per_page: u32,

    /// Upper bound for a requested page size
    #[arg(long, env = "SURVEYTRAY_MAX_PER_PAGE", default_value_t = 1000)]
    pub max_per_page: u32,

    /// Maximum number of rows written into one export file
    #[arg(long, env = "SURVEYTRAY_EXPORT_LIMIT", default_value_t = 1000)]
    pub export_limit: u32,

    /// Maximum request body size in bytes (uploads included)
    #[arg(long, env = "SURVEYTRAY_MAX_UPLOAD_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "SURVEYTRAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SURVEYTRAY_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,

    /// Create the demo admin and field agent accounts when no users exist
    #[arg(long, env = "SURVEYTRAY_SEED_DEMO_USERS", default_value_t = false)]
    pub seed_demo_users: bool,
}

impl Config {
    /// Resolve the page size a client asked for.
    ///
    /// A missing or zero value falls back to `per_page`; anything larger than
    /// `max_per_page` is capped.
    pub fn clamp_per_page(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.per_page.min(self.max_per_page).max(1),
            Some(n) => n.min(self.max_per_page),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["surveytray"])
    }
}
