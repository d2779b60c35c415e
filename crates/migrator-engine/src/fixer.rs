use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use migrator_core::{InconsistencyType, InconsistentEvent, MigratorError};
use migrator_store_sqlite::{table, ConnPool, TableEntity};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    /// The base row was written to the target.
    Upserted,
    /// The row is gone from the base, so it was removed from the target.
    Deleted,
}

impl FixOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upserted => "upserted",
            Self::Deleted => "deleted",
        }
    }
}

/// Repairs the target by overwriting it with whatever the base holds right now.
///
/// Event content is never trusted; every fix re-reads the base row, so repeated
/// or stale events converge to the same result.
pub struct OverrideFixer<T, P> {
    base: Arc<P>,
    target: Arc<P>,
    columns: Vec<String>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, P> Clone for OverrideFixer<T, P> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            target: Arc::clone(&self.target),
            columns: self.columns.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T, P> std::fmt::Debug for OverrideFixer<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideFixer").field("columns", &self.columns).finish_non_exhaustive()
    }
}

impl<T: TableEntity, P: ConnPool> OverrideFixer<T, P> {
    /// Build a fixer that overwrites every mapped column the base table actually has.
    ///
    /// # Errors
    /// Returns an error when the base schema cannot be read, or [`MigratorError::Config`]
    /// when no column besides `id` is left to overwrite.
    pub fn new(base: Arc<P>, target: Arc<P>) -> Result<Self> {
        let existing = table::table_columns(&*base, T::TABLE)?;
        let columns: Vec<String> = T::COLUMNS
            .iter()
            .filter(|column| **column != "id" && existing.iter().any(|name| name == *column))
            .map(|column| (*column).to_string())
            .collect();

        if columns.is_empty() {
            return Err(MigratorError::Config(format!(
                "table {} has no columns to override",
                T::TABLE
            ))
            .into());
        }

        Ok(Self::with_columns(base, target, columns))
    }

    /// Build a fixer that only overwrites `columns` on conflict.
    #[must_use]
    pub fn with_columns(base: Arc<P>, target: Arc<P>, columns: Vec<String>) -> Self {
        Self { base, target, columns, _entity: PhantomData }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Make the target row `id` match the base.
    ///
    /// # Errors
    /// Returns an error when either store fails; nothing is changed in that case.
    pub fn fix(&self, id: i64) -> Result<FixOutcome> {
        match table::find_by_id::<T, P>(&self.base, id)? {
            Some(row) => {
                table::upsert(&*self.target, &row, &self.columns)?;
                tracing::debug!(table = T::TABLE, id, "target row overwritten from base");
                Ok(FixOutcome::Upserted)
            }
            None => self.delete(id),
        }
    }

    /// Repair the row an event points at.
    ///
    /// # Errors
    /// Returns an error when either store fails.
    pub fn fix_event(&self, event: &InconsistentEvent) -> Result<FixOutcome> {
        match event.kind {
            InconsistencyType::BaseMissing => self.delete(event.id),
            InconsistencyType::TargetMissing | InconsistencyType::Neq => self.fix(event.id),
        }
    }

    fn delete(&self, id: i64) -> Result<FixOutcome> {
        let removed = table::delete_by_id::<T, P>(&self.target, id)?;
        tracing::debug!(table = T::TABLE, id, removed, "target row deleted");
        Ok(FixOutcome::Deleted)
    }
}
