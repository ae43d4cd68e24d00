//! Text records, element order and recoverable record warnings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Mutex;

/// Sorting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Non-decreasing output.
    Asc,
    /// Non-increasing output.
    Desc,
}

impl Order {
    /// Compares two elements according to the order.
    pub fn compare<T: Ord>(&self, a: &T, b: &T) -> Ordering {
        match self {
            Order::Asc => a.cmp(b),
            Order::Desc => b.cmp(a),
        }
    }

    /// Returns `true` if `next` may follow `prev` inside one run.
    pub fn continues<T: Ord>(&self, prev: &T, next: &T) -> bool {
        self.compare(prev, next) != Ordering::Greater
    }
}

impl Default for Order {
    fn default() -> Self {
        Order::Asc
    }
}

/// Where a skipped record was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    /// Input stream, 1-based line number.
    Input(u64),
    /// Auxiliary channel with the given id.
    Channel(u64),
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::Input(line) => write!(f, "input line {}", line),
            RecordSource::Channel(id) => write!(f, "channel {}", id),
        }
    }
}

/// A record that could not be parsed as an element and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWarning {
    pub source: RecordSource,
    pub record: String,
    pub reason: String,
}

impl fmt::Display for RecordWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipping record {:?} at {}: {}", self.record, self.source, self.reason)
    }
}

/// Parses a single text record.
///
/// Surrounding whitespace is ignored. Blank records are rejected like any other unparsable record.
pub fn parse_record<T>(record: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let trimmed = record.trim();
    if trimmed.is_empty() {
        return Err("blank record".to_string());
    }

    trimmed.parse::<T>().map_err(|err| err.to_string())
}

/// Number of warnings kept in memory by default.
pub const DEFAULT_WARNING_LIMIT: usize = 1000;

/// Warning log shared by all components of one sort session.
///
/// Every warning is logged and counted, only the first `limit` ones are kept.
#[derive(Debug)]
pub struct Warnings {
    limit: usize,
    total: AtomicU64,
    kept: Mutex<Vec<RecordWarning>>,
}

impl Warnings {
    pub fn new() -> Self {
        Warnings::with_limit(DEFAULT_WARNING_LIMIT)
    }

    /// Creates a log keeping at most `limit` warnings.
    pub fn with_limit(limit: usize) -> Self {
        Warnings {
            limit,
            total: AtomicU64::new(0),
            kept: Mutex::new(Vec::new()),
        }
    }

    /// Logs and counts a warning. The warning is stored while the limit isn't reached.
    pub fn record(&self, warning: RecordWarning) {
        log::warn!("{}", warning);
        self.total.fetch_add(1, atomic::Ordering::SeqCst);

        let mut kept = self.kept.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if kept.len() < self.limit {
            kept.push(warning);
        }
    }

    /// Number of warnings recorded, stored or not.
    pub fn count(&self) -> u64 {
        self.total.load(atomic::Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Takes the stored warnings.
    pub fn take(&self) -> Vec<RecordWarning> {
        std::mem::take(&mut *self.kept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl Default for Warnings {
    fn default() -> Self {
        Warnings::new()
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rstest::*;

    use super::{parse_record, Order, RecordSource, RecordWarning, Warnings};

    #[rstest]
    #[case("5", Ok(5))]
    #[case("  -12\n", Ok(-12))]
    #[case("", Err(()))]
    #[case("   ", Err(()))]
    #[case("x", Err(()))]
    #[case("1.5", Err(()))]
    fn test_parse_record(#[case] record: &str, #[case] expected: Result<i64, ()>) {
        let actual = parse_record::<i64>(record).map_err(|_| ());
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case(Order::Asc, 1, 2, Ordering::Less)]
    #[case(Order::Desc, 1, 2, Ordering::Greater)]
    #[case(Order::Desc, 3, 3, Ordering::Equal)]
    fn test_order_compare(#[case] order: Order, #[case] a: i32, #[case] b: i32, #[case] expected: Ordering) {
        assert_eq!(order.compare(&a, &b), expected);
    }

    #[test]
    fn test_order_continues() {
        assert!(Order::Asc.continues(&1, &1));
        assert!(!Order::Asc.continues(&2, &1));
        assert!(Order::Desc.continues(&2, &1));
        assert!(!Order::Desc.continues(&1, &2));
    }

    #[test]
    fn test_warnings_take() {
        let warnings = Warnings::new();
        warnings.record(RecordWarning {
            source: RecordSource::Input(2),
            record: "x".to_string(),
            reason: "invalid digit found in string".to_string(),
        });

        assert_eq!(warnings.count(), 1);
        let taken = warnings.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].source, RecordSource::Input(2));
    }

    #[test]
    fn test_warnings_limit() {
        let warnings = Warnings::with_limit(3);
        for line in 1..=10 {
            warnings.record(RecordWarning {
                source: RecordSource::Input(line),
                record: format!("bad-{}", line),
                reason: "invalid digit found in string".to_string(),
            });
        }

        assert_eq!(warnings.count(), 10);
        let taken = warnings.take();
        assert_eq!(taken.len(), 3);
        assert_eq!(taken[2].source, RecordSource::Input(3));
    }
}
