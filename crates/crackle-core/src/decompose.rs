use crate::ExecError;
use std::fmt;

/// Half-open interval `[start, end)` of the flat task space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TaskRange {
    pub start: u64,
    pub end: u64,
}

impl TaskRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, task: u64) -> bool {
        task >= self.start && task < self.end
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&self.start.to_le_bytes());
        b[8..].copy_from_slice(&self.end.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != 16 {
            return None;
        }
        let mut s = [0u8; 8];
        let mut e = [0u8; 8];
        s.copy_from_slice(&b[..8]);
        e.copy_from_slice(&b[8..]);
        Some(Self::new(u64::from_le_bytes(s), u64::from_le_bytes(e)))
    }
}

impl fmt::Display for TaskRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decomposition {
    pub num_rounds: u64,
    /// One range per participant, in rank order.
    pub ranges: Vec<TaskRange>,
}

/// Splits `[0, num_tasks)` into contiguous per-participant ranges sized by
/// `capacity * multiplier * num_rounds`, where `num_rounds` is the smallest
/// round count that lets the group cover the space. The range that reaches
/// `num_tasks` is clamped there; later participants get `[num_tasks, num_tasks)`.
pub fn decompose(
    num_tasks: u64,
    capacities: &[u64],
    multiplier: u32,
) -> Result<Decomposition, ExecError> {
    if num_tasks == 0 {
        return Err(ExecError::InvalidValue("number of tasks is zero".into()));
    }
    let multiplier = u128::from(multiplier.max(1));
    let sum: u128 = capacities.iter().map(|&c| u128::from(c) * multiplier).sum();
    if sum == 0 {
        return Err(ExecError::BadState("no participant has device capacity".into()));
    }
    let n = u128::from(num_tasks);
    let num_rounds = if sum >= n { 1 } else { n.div_ceil(sum) };

    let mut ranges = Vec::with_capacity(capacities.len());
    let mut cursor: u128 = 0;
    for &cap in capacities {
        if cursor >= n {
            ranges.push(TaskRange::new(num_tasks, num_tasks));
            continue;
        }
        let quota = u128::from(cap) * multiplier * num_rounds;
        let end = (cursor + quota).min(n);
        ranges.push(TaskRange::new(cursor as u64, end as u64));
        cursor = end;
    }
    Ok(Decomposition { num_rounds: num_rounds as u64, ranges })
}
