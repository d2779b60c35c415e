//! Row-level access to a migrated table, written against [`ConnPool`] so the same
//! helpers serve a single store, the double write pool and the validator's scans.

use anyhow::{anyhow, Context, Result};
use migrator_core::Entity;
use rusqlite::types::Value;

use crate::{ConnPool, SqlRow};

/// Largest `IN (...)` list sent in one statement, well under `SQLite`'s bound-variable limit.
pub const MAX_IDS_PER_QUERY: usize = 500;

/// An [`Entity`] stored in a table with an integer `id` primary key.
pub trait TableEntity: Entity + Sized + Send + Sync + 'static {
    const TABLE: &'static str;

    /// Every persisted column; the first one must be `id`.
    const COLUMNS: &'static [&'static str];

    /// Column holding the last-update timestamp in unix milliseconds.
    const UPDATE_TIME_COLUMN: &'static str = "utime";

    /// Decode a row selected with [`Self::COLUMNS`] in order.
    ///
    /// # Errors
    /// Returns an error when a column is missing or has the wrong type.
    fn from_row(row: &SqlRow) -> Result<Self>;

    /// Values for [`Self::COLUMNS`], in the same order.
    fn to_values(&self) -> Vec<Value>;
}

#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list<T: TableEntity>() -> String {
    T::COLUMNS.iter().map(|column| quote_ident(column)).collect::<Vec<_>>().join(", ")
}

fn select_sql<T: TableEntity>(tail: &str) -> String {
    format!("SELECT {} FROM {} {tail}", column_list::<T>(), quote_ident(T::TABLE))
}

fn to_i64(value: usize, what: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{what} {value} does not fit in i64"))
}

fn decode_all<T: TableEntity>(rows: &[SqlRow]) -> Result<Vec<T>> {
    rows.iter()
        .map(|row| T::from_row(row).with_context(|| format!("failed to decode {} row", T::TABLE)))
        .collect()
}

fn placeholders(count: usize) -> String {
    (1..=count).map(|idx| format!("?{idx}")).collect::<Vec<_>>().join(", ")
}

/// One page of rows ordered by primary key.
///
/// # Errors
/// Returns an error when the query fails or a row cannot be decoded.
pub fn page_by_id<T, C>(pool: &C, offset: usize, limit: usize) -> Result<Vec<T>>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let sql = select_sql::<T>("ORDER BY \"id\" LIMIT ?1 OFFSET ?2");
    let rows = pool.query(
        &sql,
        &[Value::Integer(to_i64(limit, "limit")?), Value::Integer(to_i64(offset, "offset")?)],
    )?;
    decode_all(&rows)
}

/// One page of rows updated strictly after `update_time`, ordered by update time then id.
///
/// # Errors
/// Returns an error when the query fails or a row cannot be decoded.
pub fn page_updated_after<T, C>(
    pool: &C,
    update_time: i64,
    offset: usize,
    limit: usize,
) -> Result<Vec<T>>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let column = quote_ident(T::UPDATE_TIME_COLUMN);
    let sql = select_sql::<T>(&format!(
        "WHERE {column} > ?1 ORDER BY {column}, \"id\" LIMIT ?2 OFFSET ?3"
    ));
    let rows = pool.query(
        &sql,
        &[
            Value::Integer(update_time),
            Value::Integer(to_i64(limit, "limit")?),
            Value::Integer(to_i64(offset, "offset")?),
        ],
    )?;
    decode_all(&rows)
}

/// Rows whose id is in `ids`. Missing ids are simply absent from the result.
///
/// # Errors
/// Returns an error when the query fails or a row cannot be decoded.
pub fn find_by_ids<T, C>(pool: &C, ids: &[i64]) -> Result<Vec<T>>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let mut found = Vec::new();
    for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
        let sql = select_sql::<T>(&format!("WHERE \"id\" IN ({})", placeholders(chunk.len())));
        let params: Vec<Value> = chunk.iter().copied().map(Value::Integer).collect();
        found.extend(decode_all::<T>(&pool.query(&sql, &params)?)?);
    }
    Ok(found)
}

/// # Errors
/// Returns an error when the query fails or the row cannot be decoded.
pub fn find_by_id<T, C>(pool: &C, id: i64) -> Result<Option<T>>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let sql = select_sql::<T>("WHERE \"id\" = ?1");
    pool.query_row(&sql, &[Value::Integer(id)])?
        .map(|row| {
            T::from_row(&row)
                .with_context(|| format!("failed to decode {} row {id}", T::TABLE))
        })
        .transpose()
}

/// One page of primary keys in ascending order.
///
/// # Errors
/// Returns an error when the query fails.
pub fn ids_page<T, C>(pool: &C, offset: usize, limit: usize) -> Result<Vec<i64>>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let sql = format!(
        "SELECT \"id\" FROM {} ORDER BY \"id\" LIMIT ?1 OFFSET ?2",
        quote_ident(T::TABLE)
    );
    pool.query(
        &sql,
        &[Value::Integer(to_i64(limit, "limit")?), Value::Integer(to_i64(offset, "offset")?)],
    )?
    .iter()
    .map(|row| row.get::<i64>(0))
    .collect()
}

/// The subset of `ids` present in the table, in ascending order.
///
/// # Errors
/// Returns an error when the query fails.
pub fn existing_ids<T, C>(pool: &C, ids: &[i64]) -> Result<Vec<i64>>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let mut found = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
        let sql = format!(
            "SELECT \"id\" FROM {} WHERE \"id\" IN ({})",
            quote_ident(T::TABLE),
            placeholders(chunk.len())
        );
        let params: Vec<Value> = chunk.iter().copied().map(Value::Integer).collect();
        for row in pool.query(&sql, &params)? {
            found.push(row.get::<i64>(0)?);
        }
    }
    found.sort_unstable();
    found.dedup();
    Ok(found)
}

/// Insert `entity`, or overwrite `update_columns` when its id already exists.
///
/// With no update columns an existing row is left untouched.
///
/// # Errors
/// Returns an error when the entity does not produce one value per column or the write fails.
pub fn upsert<T, C>(pool: &C, entity: &T, update_columns: &[String]) -> Result<usize>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let values = entity.to_values();
    if values.len() != T::COLUMNS.len() {
        return Err(anyhow!(
            "{} produced {} values for {} columns",
            T::TABLE,
            values.len(),
            T::COLUMNS.len()
        ));
    }

    let conflict = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments = update_columns
            .iter()
            .map(|column| {
                let column = quote_ident(column);
                format!("{column} = excluded.{column}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("DO UPDATE SET {assignments}")
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(\"id\") {conflict}",
        quote_ident(T::TABLE),
        column_list::<T>(),
        placeholders(values.len())
    );
    pool.exec(&sql, &values)
        .with_context(|| format!("failed to upsert {} row {}", T::TABLE, entity.id()))
}

/// # Errors
/// Returns an error when the delete fails.
pub fn delete_by_id<T, C>(pool: &C, id: i64) -> Result<usize>
where
    T: TableEntity,
    C: ConnPool + ?Sized,
{
    let sql = format!("DELETE FROM {} WHERE \"id\" = ?1", quote_ident(T::TABLE));
    pool.exec(&sql, &[Value::Integer(id)])
        .with_context(|| format!("failed to delete {} row {id}", T::TABLE))
}

/// Column names of `table` as reported by the store's schema.
///
/// # Errors
/// Returns an error when the schema cannot be read.
pub fn table_columns<C>(pool: &C, table: &str) -> Result<Vec<String>>
where
    C: ConnPool + ?Sized,
{
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    pool.query(&sql, &[])?
        .iter()
        .map(|row| row.get::<String>(1))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("failed to read columns of {table}"))
}
