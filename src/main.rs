use anyhow::Context;

use ledgerline::{commands, AppState, Config, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerline=info".into()),
        )
        .init();

    tracing::info!(
        environment = %config.environment,
        database = %config.database_path.display(),
        cron_secret = %config.cron_secret_fingerprint(),
        "starting ledgerline"
    );

    let db = Database::new(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let bind_addr = config.bind_addr;
    let app = commands::router(AppState::new(db, config));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!("listening on {bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
