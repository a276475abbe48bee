//! SQLite persistence for trade cycle records.
//!
//! The coordinator never waits on storage: records are handed to a bounded
//! channel and written by a dedicated thread. Records are only read back by
//! the CLI `status` command.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What a trade cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Establish,
    Entry,
    Exit,
    Rebalance,
    Flatten,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Establish => "establish",
            CycleKind::Entry => "entry",
            CycleKind::Exit => "exit",
            CycleKind::Rebalance => "rebalance",
            CycleKind::Flatten => "flatten",
        }
    }
}

impl FromStr for CycleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "establish" => CycleKind::Establish,
            "entry" => CycleKind::Entry,
            "exit" => CycleKind::Exit,
            "rebalance" => CycleKind::Rebalance,
            "flatten" => CycleKind::Flatten,
            other => anyhow::bail!("unknown cycle kind: {other}"),
        })
    }
}

/// Immutable record of one execution cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub strategy: String,
    pub cycle_id: u64,
    pub kind: CycleKind,
    pub direction: Option<String>,
    pub spread_pct: Option<Decimal>,
    /// Leg outcomes as JSON
    pub orders: serde_json::Value,
    /// Compensation orders as JSON
    pub compensations: serde_json::Value,
    pub hedged_qty: Decimal,
    /// Cumulative PnL after the cycle, net of fees
    pub pnl: Decimal,
    pub outcome: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Destination for cycle records.
#[cfg_attr(test, mockall::automock)]
pub trait TradeSink: Send {
    fn record(&mut self, record: &CycleRecord) -> Result<()>;
}

/// SQLite-backed sink.
pub struct SqliteTradeSink {
    conn: Connection,
}

impl SqliteTradeSink {
    /// Open the database, creating the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let sink = Self { conn };
        sink.init_schema()?;

        info!("Trade sink initialized at {:?}", db_path.as_ref());
        Ok(sink)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let sink = Self { conn };
        sink.init_schema()?;
        Ok(sink)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                cycle_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                direction TEXT,
                spread_pct TEXT,
                orders TEXT NOT NULL,
                compensations TEXT NOT NULL,
                hedged_qty TEXT NOT NULL,
                pnl TEXT NOT NULL,
                outcome TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_finished ON cycles(finished_at);
            CREATE INDEX IF NOT EXISTS idx_cycles_strategy ON cycles(strategy);
            "#,
            )
            .context("Failed to initialize schema")
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT strategy, cycle_id, kind, direction, spread_pct, orders, compensations,
                    hedged_qty, pnl, outcome, started_at, finished_at
             FROM cycles ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                strategy,
                cycle_id,
                kind,
                direction,
                spread_pct,
                orders,
                compensations,
                hedged_qty,
                pnl,
                outcome,
                started_at,
                finished_at,
            ) = row?;

            records.push(CycleRecord {
                strategy,
                cycle_id: cycle_id as u64,
                kind: kind.parse()?,
                direction,
                spread_pct: spread_pct.map(|s| Decimal::from_str(&s)).transpose()?,
                orders: serde_json::from_str(&orders)?,
                compensations: serde_json::from_str(&compensations)?,
                hedged_qty: Decimal::from_str(&hedged_qty)?,
                pnl: Decimal::from_str(&pnl)?,
                outcome,
                started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
                finished_at: DateTime::parse_from_rfc3339(&finished_at)?.with_timezone(&Utc),
            });
        }
        Ok(records)
    }
}

impl TradeSink for SqliteTradeSink {
    fn record(&mut self, record: &CycleRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
            INSERT INTO cycles (strategy, cycle_id, kind, direction, spread_pct, orders,
                                compensations, hedged_qty, pnl, outcome, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
                params![
                    record.strategy,
                    record.cycle_id as i64,
                    record.kind.as_str(),
                    record.direction,
                    record.spread_pct.map(|d| d.to_string()),
                    record.orders.to_string(),
                    record.compensations.to_string(),
                    record.hedged_qty.to_string(),
                    record.pnl.to_string(),
                    record.outcome,
                    record.started_at.to_rfc3339(),
                    record.finished_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert cycle record")?;

        debug!(cycle_id = record.cycle_id, kind = record.kind.as_str(), "Cycle record saved");
        Ok(())
    }
}

/// Non-blocking handle that forwards records to a writer thread.
#[derive(Debug, Clone)]
pub struct RecordEmitter {
    tx: Option<mpsc::Sender<CycleRecord>>,
}

impl RecordEmitter {
    /// Emitter that discards every record.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start a writer thread draining into `sink`. The thread exits once
    /// every emitter clone is dropped.
    pub fn spawn(mut sink: Box<dyn TradeSink>, capacity: usize) -> Result<(Self, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::channel::<CycleRecord>(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("cycle-writer".to_string())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    if let Err(e) = sink.record(&record) {
                        error!(cycle_id = record.cycle_id, error = %e, "Failed to persist cycle record");
                    }
                }
                debug!("Cycle writer stopped");
            })
            .context("Failed to spawn cycle writer thread")?;

        Ok((Self { tx: Some(tx) }, handle))
    }

    /// Hand off a record without waiting. Dropped with a warning if the queue is full.
    pub fn emit(&self, record: CycleRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(cycle_id = record.cycle_id, "Cycle record queue full, record dropped");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!(cycle_id = record.cycle_id, "Cycle writer gone, record dropped");
            }
        }
    }
}
