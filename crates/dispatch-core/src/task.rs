//! Task generation: single-pass and target-volume cycling over a
//! deduplicated input set.

use crate::error::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One unit of submitted work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task<P> {
    /// 1-based position in the produced sequence, unique per run
    pub id: u64,
    /// Which pass over the inputs produced this task, starting at 1
    pub cycle: u64,
    pub payload: P,
}

/// Lazy, finite sequence of tasks over a fixed input set.
#[derive(Debug, Clone)]
pub struct TaskSource<P> {
    inputs: Vec<P>,
    total: u64,
    next: u64,
}

impl<P: Clone> TaskSource<P> {
    /// One task per input, all in cycle 1.
    pub fn single_pass(inputs: Vec<P>) -> Self {
        let total = inputs.len() as u64;
        Self {
            inputs,
            total,
            next: 0,
        }
    }

    /// Exactly `total` tasks, restarting the inputs as often as needed and
    /// truncating the last pass.
    pub fn cycling(inputs: Vec<P>, total: u64) -> Self {
        let total = if inputs.is_empty() { 0 } else { total };
        Self {
            inputs,
            total,
            next: 0,
        }
    }

    /// The same payload `total` times.
    pub fn repeated(payload: P, total: u64) -> Self {
        Self::cycling(vec![payload], total)
    }

    /// Number of tasks the source produces in total.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Tasks not yet pulled.
    pub fn remaining(&self) -> u64 {
        self.total - self.next
    }

    /// Number of distinct inputs.
    pub fn distinct_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Passes over the inputs needed to reach the total.
    pub fn cycles(&self) -> u64 {
        if self.inputs.is_empty() {
            0
        } else {
            self.total.div_ceil(self.inputs.len() as u64)
        }
    }
}

impl<P: Clone> Iterator for TaskSource<P> {
    type Item = Task<P>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let k = self.inputs.len() as u64;
        let idx = self.next;
        self.next += 1;
        Some(Task {
            id: idx + 1,
            cycle: idx / k + 1,
            payload: self.inputs[(idx % k) as usize].clone(),
        })
    }

    fn nth(&mut self, n: usize) -> Option<Self::Item> {
        self.next = self.next.saturating_add(n as u64).min(self.total);
        self.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining() as usize;
        (remaining, Some(remaining))
    }
}

/// What [`dedup_lines`] dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub total_lines: usize,
    pub blank_lines: usize,
    pub unique: usize,
    /// Lines dropped because an identical line came earlier
    pub duplicates: usize,
    /// Values seen more than once, in first-seen order
    pub repeated: Vec<String>,
}

/// Trim, drop blank lines and collapse duplicates, keeping first-seen order.
pub fn dedup_lines<I, S>(lines: I) -> (Vec<String>, DedupReport)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut unique = Vec::new();
    let mut seen = HashSet::new();
    let mut repeat_counts: HashMap<String, usize> = HashMap::new();
    let mut report = DedupReport::default();

    for line in lines {
        report.total_lines += 1;
        let line = line.as_ref().trim();
        if line.is_empty() {
            report.blank_lines += 1;
            continue;
        }
        if seen.insert(line.to_string()) {
            unique.push(line.to_string());
            continue;
        }
        report.duplicates += 1;
        let count = repeat_counts.entry(line.to_string()).or_insert(0);
        if *count == 0 {
            report.repeated.push(line.to_string());
        }
        *count += 1;
    }

    report.unique = unique.len();
    (unique, report)
}

/// Read a line-oriented input file and deduplicate it.
pub fn read_lines(path: impl AsRef<Path>) -> DispatchResult<(Vec<String>, DedupReport)> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| DispatchError::InputIo {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(dedup_lines(contents.lines()))
}
