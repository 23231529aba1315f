//! Error types for wintrack.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::WindowId;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed scan input. Fatal to the call; the caller must fix it.
    #[error("invalid scan: {0}")]
    Validation(String),

    /// The target workstation is genuinely occupied by a different window.
    /// Not transient; resolved only by an external decision such as a
    /// manual close.
    #[error(
        "workstation {workstation_id} is occupied by window {occupant} \
         since {since} (interval {interval_id})"
    )]
    Conflict {
        workstation_id: i32,
        occupant: WindowId,
        interval_id: i64,
        since: DateTime<Utc>,
    },

    /// A concurrent writer won the race between the engine's reads and its
    /// insert. Safe to retry the whole scan immediately.
    #[error("concurrent scan won the race for workstation {workstation_id}; retry")]
    ConcurrencyConflict { workstation_id: i32 },

    #[error("tracking interval not found: {0}")]
    NotFound(i64),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A constraint violation that reached the engine outside the
    /// anticipated race window. Always an engine bug, never swallowed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
