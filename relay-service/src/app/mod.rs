pub mod consumer;
pub mod migrate;
pub mod relay;

use anyhow::bail;

/// Splits a comma separated broker list.
pub fn kafka_hosts(urls: &str) -> Vec<String> {
    urls.split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn require_database_url(database_url: &str) -> anyhow::Result<&str> {
    if database_url.is_empty() {
        bail!("DATABASE_URL must be set");
    }
    Ok(database_url)
}
