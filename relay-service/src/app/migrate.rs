use tracing::info;

use super::require_database_url;

pub async fn main(database_url: &str) -> anyhow::Result<()> {
    let applied = relay_core::run_migrations(require_database_url(database_url)?).await?;
    info!(applied, "migrations applied");
    Ok(())
}
