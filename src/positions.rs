//! Capacity / position manager.
//!
//! `PositionBook` owns the authoritative open-position set: at most one
//! position per symbol, at most `capacity` total. Entries happen only through
//! the gate pipeline; closes happen on exit or displacement and are
//! idempotent. Displacement is serialized per incumbent per cycle through a
//! slot-level claim so two challengers cannot both evict the same incumbent.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_score: f64,
    pub entry_ts: u64,
    /// Layers dominant in the entry thesis, e.g. ["alpha", "regime"].
    pub thesis_tags: Vec<String>,
}

impl Position {
    pub fn age_secs(&self, now_ts: u64) -> u64 {
        now_ts.saturating_sub(self.entry_ts)
    }
}

/// A close that actually happened (the first close of a held symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub reason: String,
    pub closed_ts: u64,
}

pub struct PositionBook {
    capacity: usize,
    slots: BTreeMap<String, Position>,
    /// Incumbents claimed for displacement this cycle.
    claimed: HashSet<String>,
    cycle_id: u64,
}

impl PositionBook {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, slots: BTreeMap::new(), claimed: HashSet::new(), cycle_id: 0 }
    }

    /// Rebuild from a persisted snapshot.
    pub fn restore(capacity: usize, positions: Vec<Position>) -> Result<Self> {
        if positions.len() > capacity {
            bail!("snapshot holds {} positions, capacity is {}", positions.len(), capacity);
        }
        let mut book = Self::new(capacity);
        for p in positions {
            if book.slots.contains_key(&p.symbol) {
                bail!("snapshot holds {} twice", p.symbol);
            }
            book.slots.insert(p.symbol.clone(), p);
        }
        Ok(book)
    }

    pub fn begin_cycle(&mut self, cycle_id: u64) {
        self.cycle_id = cycle_id;
        self.claimed.clear();
    }

    pub fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn at_capacity(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn holds(&self, symbol: &str) -> bool {
        self.slots.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.slots.get(symbol)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.slots.values().cloned().collect()
    }

    /// Weakest incumbent ranked by this cycle's fresh composite where one is
    /// available, entry score otherwise. Returns the ranking score alongside.
    pub fn weakest(&self, fresh_scores: &HashMap<String, f64>) -> Option<(&Position, f64)> {
        self.slots
            .values()
            .map(|p| {
                let score = fresh_scores.get(&p.symbol).copied().unwrap_or(p.entry_score);
                (p, score)
            })
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Claim an incumbent's slot for displacement this cycle. The first
    /// challenger wins the claim; later challengers fall through to an
    /// ordinary capacity block.
    pub fn claim(&mut self, symbol: &str) -> bool {
        if !self.slots.contains_key(symbol) {
            return false;
        }
        self.claimed.insert(symbol.to_string())
    }

    pub fn open(&mut self, position: Position) -> Result<()> {
        if self.slots.contains_key(&position.symbol) {
            bail!("{} already held", position.symbol);
        }
        if self.at_capacity() {
            bail!("at capacity ({}/{})", self.slots.len(), self.capacity);
        }
        self.slots.insert(position.symbol.clone(), position);
        Ok(())
    }

    /// Idempotent close: the first call removes the position and reports it,
    /// any later call for the same symbol is a no-op.
    pub fn close(&mut self, symbol: &str, reason: &str, now_ts: u64) -> Option<ClosedPosition> {
        self.slots.remove(symbol).map(|position| ClosedPosition {
            position,
            reason: reason.to_string(),
            closed_ts: now_ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(symbol: &str, score: f64, entry_ts: u64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_score: score,
            entry_ts,
            thesis_tags: vec!["alpha".to_string()],
        }
    }

    #[test]
    fn test_open_until_capacity() {
        let mut book = PositionBook::new(2);
        book.open(pos("BTCUSDT", 2.5, 100)).unwrap();
        book.open(pos("ETHUSDT", 2.1, 100)).unwrap();
        assert!(book.at_capacity());
        assert!(book.open(pos("SOLUSDT", 3.0, 100)).is_err());
    }

    #[test]
    fn test_open_rejects_duplicate_symbol() {
        let mut book = PositionBook::new(2);
        book.open(pos("BTCUSDT", 2.5, 100)).unwrap();
        assert!(book.open(pos("BTCUSDT", 2.6, 100)).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut book = PositionBook::new(2);
        book.open(pos("BTCUSDT", 2.5, 100)).unwrap();

        let first = book.close("BTCUSDT", "exit_signal", 200);
        assert!(first.is_some());
        assert_eq!(first.unwrap().reason, "exit_signal");

        // Re-closing is a no-op, not an error.
        assert!(book.close("BTCUSDT", "exit_signal", 201).is_none());
        assert_eq!(book.len(), 0);
    }

    #[test]
    fn test_weakest_by_entry_score() {
        let mut book = PositionBook::new(3);
        book.open(pos("BTCUSDT", 2.5, 100)).unwrap();
        book.open(pos("ETHUSDT", 1.8, 100)).unwrap();
        book.open(pos("SOLUSDT", 3.0, 100)).unwrap();

        let (weakest, score) = book.weakest(&HashMap::new()).unwrap();
        assert_eq!(weakest.symbol, "ETHUSDT");
        assert_eq!(score, 1.8);
    }

    #[test]
    fn test_weakest_prefers_fresh_scores() {
        let mut book = PositionBook::new(2);
        book.open(pos("BTCUSDT", 2.5, 100)).unwrap();
        book.open(pos("ETHUSDT", 1.8, 100)).unwrap();

        // BTC decayed hard this cycle; fresh score outranks entry score.
        let fresh: HashMap<String, f64> = [("BTCUSDT".to_string(), 0.4)].into();
        let (weakest, score) = book.weakest(&fresh).unwrap();
        assert_eq!(weakest.symbol, "BTCUSDT");
        assert_eq!(score, 0.4);
    }

    #[test]
    fn test_claim_is_single_use_per_cycle() {
        let mut book = PositionBook::new(1);
        book.open(pos("BTCUSDT", 1.0, 100)).unwrap();
        book.begin_cycle(7);

        assert!(book.claim("BTCUSDT"));
        assert!(!book.claim("BTCUSDT"));

        // New cycle releases claims.
        book.begin_cycle(8);
        assert!(book.claim("BTCUSDT"));
    }

    #[test]
    fn test_claim_unknown_symbol_fails() {
        let mut book = PositionBook::new(1);
        book.begin_cycle(1);
        assert!(!book.claim("BTCUSDT"));
    }

    #[test]
    fn test_restore_rejects_overfull_snapshot() {
        let snapshot = vec![pos("BTCUSDT", 2.5, 100), pos("ETHUSDT", 2.0, 100)];
        assert!(PositionBook::restore(1, snapshot).is_err());
    }

    #[test]
    fn test_restore_roundtrip() {
        let snapshot = vec![pos("BTCUSDT", 2.5, 100), pos("ETHUSDT", 2.0, 100)];
        let book = PositionBook::restore(3, snapshot).unwrap();
        assert_eq!(book.len(), 2);
        assert!(book.holds("ETHUSDT"));
    }

    #[test]
    fn test_age_secs() {
        let p = pos("BTCUSDT", 2.5, 1000);
        assert_eq!(p.age_secs(2200), 1200);
        assert_eq!(p.age_secs(900), 0);
    }
}
