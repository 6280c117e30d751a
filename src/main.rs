use clap::Parser;
use surveytray::{Config, app, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    let config = Config::parse();
    logging::init(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path.display(),
        uploads = %config.upload_dir.display(),
        "starting surveytray"
    );

    // Start the web application
    app::run(config)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

    Ok(())
}
