use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tutor_matcher::{
    auth::bootstrap_admin,
    config::{LoggingSettings, Settings},
    db::Database,
    web::{router, AppState},
};

fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if settings.format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    init_logging(&settings.logging);

    let db = Database::open(&settings.database.path)?;
    bootstrap_admin(&db, &settings.auth)?;

    let address = format!("{}:{}", settings.server.host, settings.server.port);
    let app = router(AppState::new(db, settings)?);

    let listener = TcpListener::bind(&address).await?;
    info!(%address, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
