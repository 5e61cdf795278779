use std::{fmt, str::FromStr};

use async_trait::async_trait;

use crate::{types::Record, write_result::FailedRowReport};

pub mod clickhouse;
pub mod retry;

/// `database.table` in the analytical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocator {
    pub database: String,
    pub table: String,
}

#[derive(Debug, thiserror::Error)]
#[error("expected database.table, got {0:?}")]
pub struct InvalidTableLocator(String);

impl FromStr for TableLocator {
    type Err = InvalidTableLocator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTableLocator(s.to_string());
        let (database, table) = s.trim().split_once('.').ok_or_else(invalid)?;
        if database.is_empty() || table.is_empty() || table.contains('.') {
            return Err(invalid());
        }
        // Both names are quoted with backticks in every statement
        if database.contains('`') || table.contains('`') {
            return Err(invalid());
        }
        Ok(Self {
            database: database.to_string(),
            table: table.to_string(),
        })
    }
}

impl fmt::Display for TableLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.database, self.table)
    }
}

/// Append-only row writer with its own retry policy. Returns only the rows
/// it gave up on; an empty result means every row was acknowledged.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn write(&self, rows: Vec<Record>) -> Vec<FailedRowReport>;
}
