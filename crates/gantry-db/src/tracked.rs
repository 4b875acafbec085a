//! Partial updates driven by entity change tracking.

use gantry_core::{ColumnValue, Tracked};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{DbError, DbResult};

/// Write the columns mutated since `entity` was loaded or last saved.
///
/// No statement is issued when nothing changed. Zero matched rows is
/// `DbError::NotFound`. On success the entity is re-marked.
pub async fn update_tracked<T: Tracked>(pool: &PgPool, entity: &mut T) -> DbResult<()> {
    let changes = entity.changes();
    if changes.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", T::TABLE));
    {
        let mut set = qb.separated(", ");
        for change in changes {
            set.push(change.column);
            set.push_unseparated(" = ");
            match change.value {
                ColumnValue::Bool(v) => set.push_bind_unseparated(v),
                ColumnValue::Int(v) => set.push_bind_unseparated(v),
                ColumnValue::BigInt(v) => set.push_bind_unseparated(v),
                ColumnValue::Text(v) => set.push_bind_unseparated(v),
                ColumnValue::OptionalText(v) => set.push_bind_unseparated(v),
                ColumnValue::Timestamp(v) => set.push_bind_unseparated(v),
            };
        }
        if T::HAS_UPDATED_AT {
            set.push("updated_at = NOW()");
        }
    }
    qb.push(" WHERE id = ");
    qb.push_bind(entity.id());

    let result = qb.build().execute(pool).await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("{} {}", T::TABLE, entity.id())));
    }

    entity.reset_mark();
    Ok(())
}
