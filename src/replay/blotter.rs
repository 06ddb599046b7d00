//! Backtest Blotter
//!
//! Per-context record of a run: trades, realized round trips, end-of-session positions
//! and funds, plus CTA chart marks and index values. Written as CSV files when a dump
//! is requested and reduced to a SHA-256 fingerprint for determinism checks.
//!
//! # Canonicalization
//!
//! - Floats are converted to fixed-point integers (value * 1e8, rounded)
//! - Contexts appear in creation order, records in the order they were produced
//! - One `|`-separated line per record, prefixed with a record-type tag

use crate::market::{Direction, Price, Qty};
use crate::replay::clock::Nanos;
use crate::strategy::chart::ChartMark;
use crate::strategy::ledger::{CloseRecord, TradeAction, TradeRecord};
use crate::strategy::registry::ContextCell;
use crate::strategy::ContextKind;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;

/// Fingerprint format version; part of the hashed text.
pub const BLOTTER_VERSION: &str = "BLOTTER_V1";

const FIXED_SCALE: f64 = 1e8;

fn fixed(v: f64) -> i64 {
    (v * FIXED_SCALE).round() as i64
}

fn dir_str(d: Direction) -> &'static str {
    match d {
        Direction::Long => "long",
        Direction::Short => "short",
    }
}

/// Funds at the end of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundRow {
    pub date: u32,
    pub closed_profit: f64,
    pub dynamic_profit: f64,
    pub fees: f64,
}

/// One instrument's position at the end of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRow {
    pub date: u32,
    pub code: String,
    pub net: Qty,
    pub avg_price: Price,
    pub profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexValueRow {
    pub index: String,
    pub line: String,
    pub time: Nanos,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlotter {
    pub name: String,
    pub kind: ContextKind,
    pub trades: Vec<TradeRecord>,
    pub closes: Vec<CloseRecord>,
    pub positions: Vec<PositionRow>,
    pub funds: Vec<FundRow>,
    pub marks: Vec<ChartMark>,
    pub indice: Vec<IndexValueRow>,
}

impl ContextBlotter {
    pub fn capture(cell: &ContextCell) -> Self {
        let core = cell.core();
        let (marks, indice) = match cell {
            ContextCell::Cta(r) => {
                let chart = r.context().chart();
                let mut rows = Vec::new();
                for (index, ci) in chart.indices() {
                    for (line, il) in &ci.lines {
                        rows.extend(il.values.iter().map(|&(time, value)| IndexValueRow {
                            index: index.clone(),
                            line: line.clone(),
                            time,
                            value,
                        }));
                    }
                }
                (chart.marks().to_vec(), rows)
            }
            _ => (Vec::new(), Vec::new()),
        };
        Self {
            name: core.name().to_string(),
            kind: core.kind(),
            trades: core.ledger().trades().to_vec(),
            closes: core.ledger().closes().to_vec(),
            positions: core.position_rows.clone(),
            funds: core.funds.clone(),
            marks,
            indice,
        }
    }

    fn canonical(&self, out: &mut String) {
        let _ = writeln!(out, "CTX|{}|{}", self.name, self.kind);
        for t in &self.trades {
            let action = match t.action {
                TradeAction::Open => "open",
                TradeAction::Close => "close",
            };
            let _ = writeln!(
                out,
                "T|{}|{}|{}|{}|{}|{}|{}|{}",
                t.time,
                t.code,
                dir_str(t.direction),
                action,
                fixed(t.price),
                fixed(t.qty),
                t.tag,
                fixed(t.fee)
            );
        }
        for c in &self.closes {
            let _ = writeln!(
                out,
                "C|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
                c.code,
                dir_str(c.direction),
                c.open_time,
                fixed(c.open_price),
                c.close_time,
                fixed(c.close_price),
                fixed(c.qty),
                fixed(c.profit),
                c.open_tag,
                c.close_tag
            );
        }
        for p in &self.positions {
            let _ = writeln!(
                out,
                "P|{}|{}|{}|{}|{}",
                p.date,
                p.code,
                fixed(p.net),
                fixed(p.avg_price),
                fixed(p.profit)
            );
        }
        for f in &self.funds {
            let _ = writeln!(
                out,
                "F|{}|{}|{}|{}",
                f.date,
                fixed(f.closed_profit),
                fixed(f.dynamic_profit),
                fixed(f.fees)
            );
        }
        for m in &self.marks {
            let _ = writeln!(out, "M|{}|{}|{}|{}", m.time, fixed(m.price), m.icon, m.tag);
        }
        for i in &self.indice {
            let _ = writeln!(out, "I|{}|{}|{}|{}", i.index, i.line, i.time, fixed(i.value));
        }
    }

    fn write_to(&self, dir: &Path) -> anyhow::Result<()> {
        let dir = dir.join(&self.name);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let mut trades = String::from("time,code,direction,action,price,qty,tag,fee\n");
        for t in &self.trades {
            let action = match t.action {
                TradeAction::Open => "open",
                TradeAction::Close => "close",
            };
            let _ = writeln!(
                trades,
                "{},{},{},{},{},{},{},{}",
                t.time, t.code, dir_str(t.direction), action, t.price, t.qty, t.tag, t.fee
            );
        }

        let mut closes = String::from(
            "code,direction,open_time,open_price,close_time,close_price,qty,profit,open_tag,close_tag\n",
        );
        for c in &self.closes {
            let _ = writeln!(
                closes,
                "{},{},{},{},{},{},{},{},{},{}",
                c.code,
                dir_str(c.direction),
                c.open_time,
                c.open_price,
                c.close_time,
                c.close_price,
                c.qty,
                c.profit,
                c.open_tag,
                c.close_tag
            );
        }

        let mut positions = String::from("date,code,net,avg_price,profit\n");
        for p in &self.positions {
            let _ = writeln!(
                positions,
                "{},{},{},{},{}",
                p.date, p.code, p.net, p.avg_price, p.profit
            );
        }

        let mut funds = String::from("date,closed_profit,dynamic_profit,fees,total\n");
        for f in &self.funds {
            let _ = writeln!(
                funds,
                "{},{},{},{},{}",
                f.date,
                f.closed_profit,
                f.dynamic_profit,
                f.fees,
                f.closed_profit + f.dynamic_profit - f.fees
            );
        }

        let mut marks = String::from("time,price,icon,tag\n");
        for m in &self.marks {
            let _ = writeln!(marks, "{},{},{},{}", m.time, m.price, m.icon, m.tag);
        }

        let mut indice = String::from("index,line,time,value\n");
        for i in &self.indice {
            let _ = writeln!(indice, "{},{},{},{}", i.index, i.line, i.time, i.value);
        }

        for (file, text) in [
            ("trades.csv", trades),
            ("closes.csv", closes),
            ("positions.csv", positions),
            ("funds.csv", funds),
            ("marks.csv", marks),
            ("indice.csv", indice),
        ] {
            let path = dir.join(file);
            std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }
}

/// Blotter of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blotter {
    pub contexts: Vec<ContextBlotter>,
}

impl Blotter {
    pub fn context(&self, name: &str) -> Option<&ContextBlotter> {
        self.contexts.iter().find(|c| c.name == name)
    }

    /// Canonical text the fingerprint is computed over.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", BLOTTER_VERSION);
        for ctx in &self.contexts {
            ctx.canonical(&mut out);
        }
        out
    }

    /// Hex SHA-256 of the canonical text.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Write `<dir>/<context>/*.csv` for every context.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<()> {
        for ctx in &self.contexts {
            ctx.write_to(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(profit: f64) -> Blotter {
        Blotter {
            contexts: vec![ContextBlotter {
                name: "c1".into(),
                kind: ContextKind::Cta,
                trades: vec![TradeRecord {
                    time: 1,
                    code: "A.1".into(),
                    direction: Direction::Long,
                    action: TradeAction::Open,
                    price: 10.0,
                    qty: 1.0,
                    tag: "e".into(),
                    fee: 0.0,
                }],
                closes: Vec::new(),
                positions: Vec::new(),
                funds: vec![FundRow {
                    date: 20240102,
                    closed_profit: profit,
                    dynamic_profit: 0.0,
                    fees: 0.0,
                }],
                marks: Vec::new(),
                indice: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        assert_eq!(sample(1.0).fingerprint(), sample(1.0).fingerprint());
        assert_ne!(sample(1.0).fingerprint(), sample(1.000001).fingerprint());
        // below fixed-point resolution
        assert_eq!(sample(1.0).fingerprint(), sample(1.0 + 1e-12).fingerprint());
        assert_eq!(sample(1.0).fingerprint().len(), 64);
    }

    #[test]
    fn test_write_to_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        sample(2.5).write_to(dir.path()).unwrap();
        let funds = std::fs::read_to_string(dir.path().join("c1").join("funds.csv")).unwrap();
        assert!(funds.lines().nth(1).unwrap().starts_with("20240102,2.5,0,0,2.5"));
        assert!(dir.path().join("c1").join("indice.csv").exists());
    }
}
