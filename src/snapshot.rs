use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Default cap on returned job entries.
pub const DEFAULT_JLIM: usize = 100;

/// Properties a filter predicate may name.
const PROP_NAMES: [&str; 13] = [
    "category", "rcode", "duration", "memkind", "memsize", "name", "numadded", "numdone",
    "numterm", "pid", "task", "tstart", "tstop",
];

/// Read-only view published by the supervisor after every tick.
pub type SnapshotHandle = Arc<RwLock<PoolSnapshot>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSnapshot {
    /// Finished jobs with non-zero exit code, and tasks with at least one
    /// failed job.
    pub failures: Vec<SnapshotEntry>,
    /// Non-finished jobs: waiting and active.
    pub jobs: Vec<SnapshotEntry>,
    /// Tasks whose first descendant job has started.
    pub tasks: Vec<SnapshotEntry>,
}

/// One observable item, a job or a task. Fields that do not apply to the
/// item kind stay `None` and count as absent for filtering.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub category: Option<String>,
    pub rcode: Option<i32>,
    /// Seconds from the first start to the final exit, or to now while live.
    pub duration: Option<f64>,
    /// 0 = memory accounting unavailable, 1 = smoothed tree resident+shared.
    pub memkind: Option<u8>,
    pub memsize: Option<u64>,
    pub name: String,
    pub numadded: Option<u32>,
    pub numdone: Option<u32>,
    pub numterm: Option<u32>,
    pub pid: Option<u32>,
    pub task: Option<String>,
    pub tstart: Option<DateTime<Utc>>,
    pub tstop: Option<DateTime<Utc>>,
}

/// Property value as seen by filter predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Num(f64),
    Text(String),
}

impl SnapshotEntry {
    /// Property lookup by name; `None` means the property is absent.
    pub fn prop(&self, name: &str) -> Option<PropValue> {
        match name {
            "category" => self.category.clone().map(PropValue::Text),
            "rcode" => self.rcode.map(|v| PropValue::Num(v as f64)),
            "duration" => self.duration.map(PropValue::Num),
            "memkind" => self.memkind.map(|v| PropValue::Num(v as f64)),
            "memsize" => self.memsize.map(|v| PropValue::Num(v as f64)),
            "name" => Some(PropValue::Text(self.name.clone())),
            "numadded" => self.numadded.map(|v| PropValue::Num(v as f64)),
            "numdone" => self.numdone.map(|v| PropValue::Num(v as f64)),
            "numterm" => self.numterm.map(|v| PropValue::Num(v as f64)),
            "pid" => self.pid.map(|v| PropValue::Num(v as f64)),
            "task" => self.task.clone().map(PropValue::Text),
            "tstart" => self.tstart.map(|t| PropValue::Num(epoch_secs(t))),
            "tstop" => self.tstop.map(|t| PropValue::Num(epoch_secs(t))),
            _ => None,
        }
    }
}

fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Conjunction of `pname[*][:beg[..end]]` predicates.
///
/// The `*` marker passes items lacking the property. A lone `beg` means
/// exact match, `beg..end` means `beg <= value < end`, and a fully omitted
/// range means any non-null value.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    preds: Vec<Pred>,
}

#[derive(Debug, Clone)]
struct Pred {
    name: String,
    pass_absent: bool,
    cond: Cond,
}

#[derive(Debug, Clone)]
enum Cond {
    Any,
    Exact(String),
    Range(f64, f64),
}

impl Filter {
    /// Parse a `|`-separated predicate list, e.g.
    /// `rcode*:-15|duration:1.5..3600|category*`.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let mut preds = Vec::new();
        for part in expr.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let (head, range) = match part.split_once(':') {
                Some((head, range)) => (head, Some(range)),
                None => (part, None),
            };
            let (name, pass_absent) = match head.strip_suffix('*') {
                Some(name) => (name, true),
                None => (head, false),
            };
            if !PROP_NAMES.contains(&name) {
                return Err(format!("unknown property {name:?}"));
            }
            let cond = match range {
                None => Cond::Any,
                Some(range) => match range.split_once("..") {
                    Some((beg, end)) => {
                        let beg: f64 = beg
                            .parse()
                            .map_err(|_| format!("bad range start {beg:?}"))?;
                        let end: f64 =
                            end.parse().map_err(|_| format!("bad range end {end:?}"))?;
                        Cond::Range(beg, end)
                    }
                    None => Cond::Exact(range.to_string()),
                },
            };
            preds.push(Pred {
                name: name.to_string(),
                pass_absent,
                cond,
            });
        }
        Ok(Self { preds })
    }

    pub fn matches(&self, entry: &SnapshotEntry) -> bool {
        self.preds.iter().all(|p| p.matches(entry))
    }

    /// Apply to a collection, newest-first order preserved, capped at `limit`.
    pub fn apply<'a>(
        &self,
        entries: &'a [SnapshotEntry],
        limit: usize,
    ) -> Vec<&'a SnapshotEntry> {
        entries
            .iter()
            .filter(|e| self.matches(e))
            .take(limit)
            .collect()
    }
}

impl Pred {
    fn matches(&self, entry: &SnapshotEntry) -> bool {
        match entry.prop(&self.name) {
            None => self.pass_absent,
            Some(value) => self.cond.matches(&value),
        }
    }
}

impl Cond {
    fn matches(&self, value: &PropValue) -> bool {
        match self {
            Cond::Any => true,
            Cond::Exact(raw) => match value {
                PropValue::Num(v) => raw.parse::<f64>().map(|n| n == *v).unwrap_or(false),
                PropValue::Text(t) => t == raw,
            },
            Cond::Range(beg, end) => match value {
                PropValue::Num(v) => *beg <= *v && *v < *end,
                PropValue::Text(_) => false,
            },
        }
    }
}
