use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TrailError};

/// Open a connection pool on the store file.
///
/// WAL journaling lets readers proceed while a build transaction is open;
/// they keep seeing the last committed state until the build commits.
pub async fn connect(db_path: &Path, create: bool) -> Result<SqlitePool> {
    if create {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(TrailError::store)?;
            }
        }
    } else if !db_path.exists() {
        return Err(TrailError::StoreUnavailable(format!(
            "store not found at {} (run `trail init` first)",
            db_path.display()
        )));
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(TrailError::store)?
        .create_if_missing(create)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(TrailError::store)?;

    Ok(pool)
}
