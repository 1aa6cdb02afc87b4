//! Port allocation for browser stream and CDP endpoints.
//!
//! The allocator hands out ports from a bounded range with at most one live
//! holder per `(port, kind)`. The in-memory table is authoritative for a
//! running process; `port_reservations` rows mirror it so a restart can
//! rehydrate via [`PortAllocator::reserve`].

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{LabError, LabResult};
use crate::settings::PortRange;

/// What a reservation backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Screencast stream server.
    Stream,
    /// Chrome DevTools protocol endpoint.
    Cdp,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Stream => write!(f, "stream"),
            PortKind::Cdp => write!(f, "cdp"),
        }
    }
}

impl FromStr for PortKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(PortKind::Stream),
            "cdp" => Ok(PortKind::Cdp),
            other => Err(format!("unknown port kind: {other}")),
        }
    }
}

/// Serialized allocator over a configured range.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    taken: Mutex<HashSet<(u16, PortKind)>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            taken: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the lowest free port of the given kind.
    pub fn allocate(&self, kind: PortKind) -> LabResult<u16> {
        let mut taken = self.taken.lock().expect("allocator mutex poisoned");
        for port in self.range.lo..=self.range.hi {
            if taken.insert((port, kind)) {
                return Ok(port);
            }
        }
        Err(LabError::NoPortsAvailable { kind })
    }

    /// Release a port. Idempotent; unknown ports are ignored.
    pub fn release(&self, port: u16, kind: PortKind) {
        let mut taken = self.taken.lock().expect("allocator mutex poisoned");
        taken.remove(&(port, kind));
    }

    /// Mark an externally known port busy (boot rehydration).
    pub fn reserve(&self, port: u16, kind: PortKind) {
        let mut taken = self.taken.lock().expect("allocator mutex poisoned");
        taken.insert((port, kind));
    }

    pub fn is_allocated(&self, port: u16, kind: PortKind) -> bool {
        let taken = self.taken.lock().expect("allocator mutex poisoned");
        taken.contains(&(port, kind))
    }

    pub fn range(&self) -> PortRange {
        self.range
    }
}

/// A persisted reservation row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PortReservation {
    pub id: String,
    pub session_id: String,
    pub port: i64,
    pub kind: String,
}

/// Repository for the persistent reservation mirror.
#[derive(Debug, Clone)]
pub struct PortReservationRepository {
    pool: SqlitePool,
}

impl PortReservationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a reservation. The unique `(port, kind)` index rejects
    /// double-grants that would indicate allocator drift.
    pub async fn insert(&self, session_id: &str, port: u16, kind: PortKind) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO port_reservations (id, session_id, port, kind, reserved_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(port as i64)
        .bind(kind.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("inserting port reservation")?;

        Ok(())
    }

    /// Delete a reservation. Idempotent.
    pub async fn delete(&self, port: u16, kind: PortKind) -> Result<()> {
        sqlx::query("DELETE FROM port_reservations WHERE port = ? AND kind = ?")
            .bind(port as i64)
            .bind(kind.to_string())
            .execute(&self.pool)
            .await
            .context("deleting port reservation")?;

        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<PortReservation>> {
        let rows = sqlx::query_as::<_, PortReservation>(
            "SELECT id, session_id, port, kind FROM port_reservations",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing port reservations")?;

        Ok(rows)
    }

    /// Pre-mark every persisted reservation busy in the allocator.
    pub async fn rehydrate(&self, allocator: &PortAllocator) -> Result<usize> {
        let rows = self.list().await?;
        let mut count = 0;
        for row in &rows {
            let Ok(kind) = row.kind.parse::<PortKind>() else {
                continue;
            };
            let Ok(port) = u16::try_from(row.port) else {
                continue;
            };
            allocator.reserve(port, kind);
            count += 1;
        }
        Ok(count)
    }
}
