//! Test database utilities for in-library tests.
//!
//! Each `TestDatabase` is a fresh SQLite file in its own temporary directory
//! with all migrations applied. Keep the struct alive for the duration of the
//! test; the directory is removed on drop.

use crate::config::DatabaseConfig;
use crate::storage::{create_pool, DbPool};
use tempfile::TempDir;

pub struct TestDatabase {
    pub pool: DbPool,
    pub dir: TempDir,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir for test database");
        let url = format!("sqlite://{}", dir.path().join("cutover.db").display());

        let config = DatabaseConfig {
            url,
            auto_migrate: true,
            max_connections: 5,
            ..Default::default()
        };

        let pool = create_pool(&config).await.expect("create test pool");
        Self { pool, dir }
    }
}
