//! SQLite persistence: append-only event stream, position snapshots, and the
//! externally maintained signal-weight table.
//!
//! Events are insert-only and never rewritten; the position table is a
//! snapshot replaced wholesale inside a transaction each cycle so a restart
//! resumes from the last committed book.

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::aggregate::Side;
use crate::config::SignalWeights;
use crate::displace::DisplacementEvaluation;
use crate::positions::Position;
use crate::shadow::ShadowScoreboard;
use crate::trace::DecisionTrace;

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS events (
                ts INTEGER NOT NULL,
                cycle_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                symbol TEXT,
                intent_id TEXT,
                details TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                entry_score REAL NOT NULL,
                entry_ts INTEGER NOT NULL,
                thesis_tags TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signal_weights (
                layer TEXT PRIMARY KEY,
                weight REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn append_traces(&mut self, traces: &[DecisionTrace]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for trace in traces {
            tx.execute(
                "INSERT INTO events (ts, cycle_id, event_type, symbol, intent_id, details)
                 VALUES (?1, ?2, 'trade_intent', ?3, ?4, ?5)",
                params![
                    trace.ts as i64,
                    trace.cycle_id as i64,
                    trace.symbol,
                    trace.intent_id,
                    serde_json::to_string(trace)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_displacements(
        &mut self,
        ts: u64,
        cycle_id: u64,
        evals: &[DisplacementEvaluation],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for eval in evals {
            tx.execute(
                "INSERT INTO events (ts, cycle_id, event_type, symbol, intent_id, details)
                 VALUES (?1, ?2, 'displacement_evaluated', ?3, NULL, ?4)",
                params![
                    ts as i64,
                    cycle_id as i64,
                    eval.challenger_symbol,
                    serde_json::to_string(eval)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_scoreboards(&mut self, ts: u64, boards: &[ShadowScoreboard]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for board in boards {
            tx.execute(
                "INSERT INTO events (ts, cycle_id, event_type, symbol, intent_id, details)
                 VALUES (?1, ?2, 'shadow_scoreboard', NULL, NULL, ?3)",
                params![
                    ts as i64,
                    board.window_start_cycle as i64,
                    serde_json::to_string(board)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the open-position snapshot with the current book.
    pub fn persist_positions(&mut self, positions: &[Position]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM positions", [])?;
        for p in positions {
            tx.execute(
                "INSERT INTO positions (symbol, side, entry_score, entry_ts, thesis_tags)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    p.symbol,
                    p.side.as_str(),
                    p.entry_score,
                    p.entry_ts as i64,
                    serde_json::to_string(&p.thesis_tags)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self
            .conn
            .prepare("SELECT symbol, side, entry_score, entry_ts, thesis_tags FROM positions")?;
        let rows = stmt.query_map([], |row| {
            let symbol: String = row.get(0)?;
            let side: String = row.get(1)?;
            let entry_score: f64 = row.get(2)?;
            let entry_ts: i64 = row.get(3)?;
            let tags_json: String = row.get(4)?;
            Ok((symbol, side, entry_score, entry_ts, tags_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol, side, entry_score, entry_ts, tags_json) = row?;
            out.push(Position {
                symbol,
                side: if side == "short" { Side::Short } else { Side::Long },
                entry_score,
                entry_ts: entry_ts as u64,
                thesis_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Load the externally maintained weight table; missing layers keep their
    /// defaults, an empty table yields None.
    pub fn load_weights(&self) -> Result<Option<SignalWeights>> {
        let mut stmt = self.conn.prepare("SELECT layer, weight FROM signal_weights")?;
        let rows = stmt.query_map([], |row| {
            let layer: String = row.get(0)?;
            let weight: f64 = row.get(1)?;
            Ok((layer, weight))
        })?;

        let mut weights = SignalWeights::default();
        let mut any = false;
        for row in rows {
            let (layer, weight) = row?;
            any = true;
            match layer.as_str() {
                "alpha" => weights.alpha = weight,
                "flow" => weights.flow = weight,
                "regime" => weights.regime = weight,
                "volatility" => weights.volatility = weight,
                "dark_pool" => weights.dark_pool = weight,
                _ => {}
            }
        }
        Ok(if any { Some(weights) } else { None })
    }

    pub fn save_weights(&mut self, weights: &SignalWeights) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (layer, weight) in [
            ("alpha", weights.alpha),
            ("flow", weights.flow),
            ("regime", weights.regime),
            ("volatility", weights.volatility),
            ("dark_pool", weights.dark_pool),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO signal_weights (layer, weight) VALUES (?1, ?2)",
                params![layer, weight],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn event_count(&self, event_type: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
