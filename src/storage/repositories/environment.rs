use crate::domain::Environment;
use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use sqlx::{FromRow, Sqlite};

#[derive(Debug, FromRow)]
struct EnvironmentRow {
    name: String,
    region: String,
    datacenter: String,
    secret_store_addr: String,
    cluster_addr: String,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Environment {
            name: row.name,
            region: row.region,
            datacenter: row.datacenter,
            secret_store_addr: row.secret_store_addr,
            cluster_addr: row.cluster_addr,
        }
    }
}

/// Environment definitions recorded at first bootstrap
#[derive(Debug, Clone)]
pub struct EnvironmentRepository {
    pool: DbPool,
}

impl EnvironmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Environment>> {
        let row: Option<EnvironmentRow> = sqlx::query_as(
            "SELECT name, region, datacenter, secret_store_addr, cluster_addr \
             FROM environments WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to load environment '{name}'")))?;

        Ok(row.map(Environment::from))
    }

    pub async fn upsert(&self, environment: &Environment) -> Result<()> {
        upsert_definition(&self.pool, environment).await
    }
}

/// Insert or update a definition on any executor, so a restore can fold it
/// into its own transaction.
pub(crate) async fn upsert_definition<'e, E>(executor: E, environment: &Environment) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now();
    sqlx::query(
        "INSERT INTO environments (name, region, datacenter, secret_store_addr, cluster_addr, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET \
            region = excluded.region, \
            datacenter = excluded.datacenter, \
            secret_store_addr = excluded.secret_store_addr, \
            cluster_addr = excluded.cluster_addr, \
            updated_at = excluded.updated_at",
    )
    .bind(&environment.name)
    .bind(&environment.region)
    .bind(&environment.datacenter)
    .bind(&environment.secret_store_addr)
    .bind(&environment.cluster_addr)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| CutoverError::database(e, format!("Failed to record environment '{}'", environment.name)))?;
    Ok(())
}
