//! Row access for field re-encryption.
//!
//! [`KeyLifecycleManager::re_encrypt_table`](crate::dek::KeyLifecycleManager::re_encrypt_table)
//! walks an application table one page at a time through this trait, so it
//! never holds the whole table or one long transaction. Pages are ordered by
//! row id and resumed with a cursor.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DekError;

/// One encrypted column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRow {
    pub id: Uuid,
    /// Stored value; `None` for SQL `NULL`.
    pub value: Option<String>,
}

/// Source of rows whose columns hold encrypted field envelopes.
#[async_trait::async_trait]
pub trait EncryptedTableSource: Send + Sync {
    /// Up to `limit` rows of `table.field` with id greater than `after`,
    /// ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::RowSource`] if the read fails.
    async fn read_page(
        &self,
        table: &str,
        field: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<FieldRow>, DekError>;

    /// Overwrite one row's column value.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::RowSource`] if the write fails.
    async fn update_field(&self, table: &str, field: &str, id: Uuid, value: &str) -> Result<(), DekError>;
}

type Column = BTreeMap<Uuid, Option<String>>;

/// In-memory tables, keyed by `(table, field)`.
#[derive(Debug, Default)]
pub struct MemoryTableSource {
    columns: RwLock<BTreeMap<(String, String), Column>>,
}

impl MemoryTableSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row value.
    pub async fn insert(&self, table: &str, field: &str, id: Uuid, value: Option<String>) {
        self.columns
            .write()
            .await
            .entry((table.to_owned(), field.to_owned()))
            .or_default()
            .insert(id, value);
    }

    /// Current value of a row.
    pub async fn value(&self, table: &str, field: &str, id: Uuid) -> Option<String> {
        self.columns
            .read()
            .await
            .get(&(table.to_owned(), field.to_owned()))
            .and_then(|c| c.get(&id).cloned().flatten())
    }
}

#[async_trait::async_trait]
impl EncryptedTableSource for MemoryTableSource {
    async fn read_page(
        &self,
        table: &str,
        field: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<FieldRow>, DekError> {
        let columns = self.columns.read().await;
        let Some(column) = columns.get(&(table.to_owned(), field.to_owned())) else {
            return Ok(Vec::new());
        };
        Ok(column
            .iter()
            .filter(|(id, _)| after.is_none_or(|a| **id > a))
            .take(limit)
            .map(|(id, value)| FieldRow {
                id: *id,
                value: value.clone(),
            })
            .collect())
    }

    async fn update_field(&self, table: &str, field: &str, id: Uuid, value: &str) -> Result<(), DekError> {
        let mut columns = self.columns.write().await;
        let row = columns
            .get_mut(&(table.to_owned(), field.to_owned()))
            .and_then(|c| c.get_mut(&id))
            .ok_or_else(|| DekError::RowSource {
                table: table.to_owned(),
                reason: format!("row {id} not found"),
            })?;
        *row = Some(value.to_owned());
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgTableSource;

#[cfg(feature = "postgres")]
mod pg {
    use sqlx::PgPool;
    use uuid::Uuid;

    use super::{EncryptedTableSource, FieldRow};
    use crate::dynamic::sanitize_identifier;
    use crate::error::DekError;

    /// Application tables in PostgreSQL. Rows need a `uuid` primary key
    /// named `id`.
    #[derive(Clone)]
    pub struct PgTableSource {
        pool: PgPool,
    }

    impl PgTableSource {
        #[must_use]
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    impl std::fmt::Debug for PgTableSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PgTableSource").finish_non_exhaustive()
        }
    }

    fn row_error(table: &str, e: &sqlx::Error) -> DekError {
        DekError::RowSource {
            table: table.to_owned(),
            reason: e.to_string(),
        }
    }

    #[async_trait::async_trait]
    impl EncryptedTableSource for PgTableSource {
        async fn read_page(
            &self,
            table: &str,
            field: &str,
            after: Option<Uuid>,
            limit: usize,
        ) -> Result<Vec<FieldRow>, DekError> {
            let sql = format!(
                "SELECT id, \"{f}\"::text FROM \"{t}\" WHERE ($1::uuid IS NULL OR id > $1) ORDER BY id LIMIT $2",
                f = sanitize_identifier(field),
                t = sanitize_identifier(table),
            );
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(&sql)
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| row_error(table, &e))?;
            Ok(rows.into_iter().map(|(id, value)| FieldRow { id, value }).collect())
        }

        async fn update_field(&self, table: &str, field: &str, id: Uuid, value: &str) -> Result<(), DekError> {
            let sql = format!(
                "UPDATE \"{t}\" SET \"{f}\" = $1 WHERE id = $2",
                f = sanitize_identifier(field),
                t = sanitize_identifier(table),
            );
            sqlx::query(&sql)
                .bind(value)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| row_error(table, &e))?;
            Ok(())
        }
    }
}
