use diesel::sql_query;
use diesel::sql_types::{Binary, Text};
use diesel::QueryableByName;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;

use super::{MarkerError, MarkerStore};

#[derive(Debug, QueryableByName)]
struct MarkerRow {
    #[diesel(sql_type = Binary)]
    value: Vec<u8>,
}

/// Postgres-backed marker store (table `markers`, see `migrations/`).
pub struct PgMarkerStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgMarkerStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

impl MarkerStore for PgMarkerStore {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, MarkerError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let mut rows = sql_query("SELECT value FROM markers WHERE namespace = $1 AND key = $2")
                .bind::<Text, _>(namespace)
                .bind::<Text, _>(key)
                .load::<MarkerRow>(&mut conn)
                .await?;
            Ok(rows.pop().map(|row| row.value))
        })
    }

    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), MarkerError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            sql_query(
                "INSERT INTO markers (namespace, key, value, updated_at) \
                 VALUES ($1, $2, $3, NOW()) \
                 ON CONFLICT (namespace, key) DO UPDATE \
                 SET value = EXCLUDED.value, updated_at = NOW()",
            )
            .bind::<Text, _>(namespace)
            .bind::<Text, _>(key)
            .bind::<Binary, _>(value)
            .execute(&mut conn)
            .await?;
            Ok(())
        })
    }
}
