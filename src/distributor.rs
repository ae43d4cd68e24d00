//! Run distributor.
//!
//! Tapes are channels holding several runs back to back. Run boundaries are either recorded as run lengths
//! next to the channel handle, or found again while reading where the order breaks (see [`RunMarking`]).

use std::collections::VecDeque;

use crate::channel::{Channel, ChannelCodec, ChannelReader, ChannelWriter, RunCursor, RunSink};
use crate::record::{Order, Warnings};
use crate::session::SortSession;
use crate::sort::SortError;
use crate::storage::StorageManager;

/// Tape selection policy. Both policies are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionPolicy {
    /// Run *i* goes to tape *i* mod *tape count*.
    RoundRobin,
    /// Run goes to the tape holding the fewest elements, lowest index on ties.
    LeastLoaded,
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        DistributionPolicy::RoundRobin
    }
}

/// Run boundary used to split a channel into runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Every `n` elements.
    Width(u64),
    /// Wherever the next element breaks the order.
    Natural(Order),
}

/// How run boundaries are kept on a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMarking {
    /// Run lengths are recorded while writing.
    Recorded,
    /// Boundaries are found while reading, wherever the next element breaks the order.
    /// Adjacent runs that happen to be in order are read back as a single run.
    Detected(Order),
}

/// Run lengths in tape order, run-length encoded: consecutive runs of equal length share one span.
///
/// Runs cut at a fixed width, or merged from such runs, have at most a couple of distinct lengths per tape,
/// so the bookkeeping stays constant whatever the number of runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLengths {
    spans: VecDeque<(u64, u64)>,
    count: usize,
}

impl RunLengths {
    pub fn new() -> Self {
        RunLengths::default()
    }

    /// Appends the length of the next run.
    pub fn push(&mut self, len: u64) {
        match self.spans.back_mut() {
            Some((span_len, repeat)) if *span_len == len => *repeat += 1,
            _ => self.spans.push_back((len, 1)),
        }
        self.count += 1;
    }

    /// Removes the length of the first run.
    pub fn pop_front(&mut self) -> Option<u64> {
        let (len, repeat) = self.spans.front_mut()?;
        let len = *len;
        *repeat -= 1;
        if *repeat == 0 {
            self.spans.pop_front();
        }
        self.count -= 1;

        return Some(len);
    }

    /// Number of runs.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of stored spans.
    pub fn spans(&self) -> usize {
        self.spans.len()
    }
}

/// Run boundaries of a sealed tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeRuns {
    Recorded(RunLengths),
    /// `written` counts the runs written. Fewer may be read back when runs coalesce.
    Detected { order: Order, written: usize },
}

impl TapeRuns {
    fn new(marking: RunMarking) -> Self {
        match marking {
            RunMarking::Recorded => TapeRuns::Recorded(RunLengths::new()),
            RunMarking::Detected(order) => TapeRuns::Detected { order, written: 0 },
        }
    }

    fn record(&mut self, len: u64) {
        match self {
            TapeRuns::Recorded(lengths) => lengths.push(len),
            TapeRuns::Detected { written, .. } => *written += 1,
        }
    }

    /// Number of runs written to the tape.
    pub fn count(&self) -> usize {
        match self {
            TapeRuns::Recorded(lengths) => lengths.len(),
            TapeRuns::Detected { written, .. } => *written,
        }
    }
}

/// Sealed tape.
#[derive(Debug)]
pub struct Tape {
    channel: Channel,
    runs: TapeRuns,
}

impl Tape {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn runs(&self) -> &TapeRuns {
        &self.runs
    }

    /// Number of runs written to the tape.
    pub fn run_count(&self) -> usize {
        self.runs.count()
    }

    pub fn elements(&self) -> u64 {
        self.channel.items()
    }

    /// A tape is active while it holds at least one run.
    pub fn is_active(&self) -> bool {
        self.run_count() > 0
    }

    pub fn into_channel(self) -> Channel {
        self.channel
    }
}

/// Tape reader yielding one run at a time.
pub struct TapeReader<T, C> {
    reader: ChannelReader<T, C>,
    runs: TapeRuns,
    pending: Option<T>,
}

impl<T, C> TapeReader<T, C>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    pub fn open(storage: &StorageManager, tape: &Tape) -> Result<Self, SortError> {
        Ok(TapeReader {
            reader: storage.open(&tape.channel)?,
            runs: tape.runs.clone(),
            pending: None,
        })
    }

    /// Iterator over the next run, or [`None`] if every run was read.
    pub fn next_run<'r, 'w>(&'r mut self, warnings: &'w Warnings) -> Result<Option<TapeRun<'r, 'w, T, C>>, SortError> {
        match self.runs {
            TapeRuns::Recorded(ref mut lengths) => match lengths.pop_front() {
                Some(len) => Ok(Some(TapeRun::Recorded(self.reader.run(len, warnings)))),
                None => Ok(None),
            },
            TapeRuns::Detected { order, .. } => {
                if self.pending.is_none() {
                    self.pending = match self.reader.next_valid(warnings) {
                        Some(item) => Some(item?),
                        None => return Ok(None),
                    };
                }

                Ok(Some(TapeRun::Detected(DetectedRun {
                    reader: &mut self.reader,
                    pending: &mut self.pending,
                    warnings,
                    order,
                    ended: false,
                })))
            }
        }
    }
}

/// One run of a tape.
pub enum TapeRun<'r, 'w, T, C> {
    Recorded(RunCursor<'r, 'w, T, C>),
    Detected(DetectedRun<'r, 'w, T, C>),
}

impl<'r, 'w, T, C> Iterator for TapeRun<'r, 'w, T, C>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            TapeRun::Recorded(cursor) => cursor.next(),
            TapeRun::Detected(run) => run.next(),
        }
    }
}

/// Run ending where the next element breaks the order. Reads one element ahead,
/// the element opening the following run is left in the tape reader.
pub struct DetectedRun<'r, 'w, T, C> {
    reader: &'r mut ChannelReader<T, C>,
    pending: &'r mut Option<T>,
    warnings: &'w Warnings,
    order: Order,
    ended: bool,
}

impl<'r, 'w, T, C> Iterator for DetectedRun<'r, 'w, T, C>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ended {
            return None;
        }
        let current = match self.pending.take() {
            Some(item) => item,
            None => {
                self.ended = true;
                return None;
            }
        };

        match self.reader.next_valid(self.warnings) {
            Some(Ok(next)) => {
                if !self.order.continues(&current, &next) {
                    self.ended = true;
                }
                *self.pending = Some(next);
            }
            Some(Err(err)) => {
                self.ended = true;
                return Some(Err(err));
            }
            None => self.ended = true,
        }

        return Some(Ok(current));
    }
}

struct TapeSlot<T, C> {
    writer: ChannelWriter<T, C>,
    runs: TapeRuns,
}

/// Writer of a set of tapes. Every run is appended to the tape chosen by the distribution policy.
/// Tapes are allocated when they receive their first run.
pub struct TapeSetWriter<'s, T, C> {
    storage: &'s StorageManager,
    policy: DistributionPolicy,
    marking: RunMarking,
    slots: Vec<Option<TapeSlot<T, C>>>,
    loads: Vec<u64>,
    started: usize,
    current: Option<(usize, u64)>,
}

impl<'s, T, C> TapeSetWriter<'s, T, C>
where
    C: ChannelCodec<T>,
{
    pub fn new(storage: &'s StorageManager, tape_count: usize, policy: DistributionPolicy, marking: RunMarking) -> Self {
        TapeSetWriter {
            storage,
            policy,
            marking,
            slots: (0..tape_count).map(|_| None).collect(),
            loads: vec![0; tape_count],
            started: 0,
            current: None,
        }
    }

    fn select(&self) -> usize {
        match self.policy {
            DistributionPolicy::RoundRobin => self.started % self.slots.len(),
            DistributionPolicy::LeastLoaded => self
                .loads
                .iter()
                .enumerate()
                .min_by_key(|(idx, load)| (**load, *idx))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        }
    }

    /// Seals every tape that received a run, in tape index order.
    pub fn finish(mut self) -> Result<Vec<Tape>, SortError> {
        self.end_run();

        let mut tapes = Vec::new();
        for slot in self.slots.into_iter().flatten() {
            tapes.push(Tape {
                channel: slot.writer.finish()?,
                runs: slot.runs,
            });
        }

        return Ok(tapes);
    }
}

impl<'s, T, C> RunSink<T> for TapeSetWriter<'s, T, C>
where
    C: ChannelCodec<T>,
{
    fn start_run(&mut self) -> Result<(), SortError> {
        self.end_run();

        let idx = self.select();
        if self.slots[idx].is_none() {
            self.slots[idx] = Some(TapeSlot {
                writer: self.storage.allocate()?,
                runs: TapeRuns::new(self.marking),
            });
        }
        self.started += 1;
        self.current = Some((idx, 0));

        return Ok(());
    }

    fn push(&mut self, item: &T) -> Result<(), SortError> {
        if self.current.is_none() {
            self.start_run()?;
        }
        if let Some((idx, len)) = self.current.as_mut() {
            if let Some(slot) = self.slots[*idx].as_mut() {
                slot.writer.write(item)?;
                *len += 1;
                self.loads[*idx] += 1;
            }
        }

        return Ok(());
    }

    fn end_run(&mut self) {
        if let Some((idx, len)) = self.current.take() {
            if len > 0 {
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.runs.record(len);
                }
            }
        }
    }
}

/// Distributes `runs` onto `tape_count` tapes. Each run channel is released once copied.
pub fn distribute<T, C, I>(
    session: &SortSession,
    runs: I,
    tape_count: usize,
    policy: DistributionPolicy,
    marking: RunMarking,
) -> Result<Vec<Tape>, SortError>
where
    C: ChannelCodec<T>,
    I: IntoIterator<Item = Result<Channel, SortError>>,
{
    let mut tapes: TapeSetWriter<T, C> = TapeSetWriter::new(&session.storage, tape_count, policy, marking);
    let mut distributed = 0;

    for run in runs {
        let run = run?;
        {
            let mut reader: ChannelReader<T, C> = session.storage.open(&run)?;
            tapes.start_run()?;
            for item in reader.run(run.items(), &session.warnings) {
                let item = item?;
                session.abort.check()?;
                tapes.push(&item)?;
            }
            tapes.end_run();
        }
        session.storage.release(run);
        distributed += 1;
    }

    let tapes = tapes.finish()?;
    log::debug!("{} runs distributed on {} tapes", distributed, tapes.len());

    return Ok(tapes);
}

/// Splits the runs of `source`, delimited by `boundary`, onto `tape_count` tapes.
/// Fixed width runs are recorded, natural runs are detected again when the tapes are read.
pub fn split<T, C>(
    session: &SortSession,
    source: &Channel,
    boundary: Boundary,
    tape_count: usize,
    policy: DistributionPolicy,
) -> Result<Vec<Tape>, SortError>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    let marking = match boundary {
        Boundary::Width(_) => RunMarking::Recorded,
        Boundary::Natural(order) => RunMarking::Detected(order),
    };
    let mut tapes: TapeSetWriter<T, C> = TapeSetWriter::new(&session.storage, tape_count, policy, marking);
    let mut reader: ChannelReader<T, C> = session.storage.open(source)?;
    let mut last: Option<T> = None;
    let mut run_len = 0;

    for item in reader.run(source.items(), &session.warnings) {
        let item = item?;
        let new_run = match (&boundary, &last) {
            (_, None) => true,
            (Boundary::Width(width), Some(_)) => run_len >= *width,
            (Boundary::Natural(order), Some(last)) => !order.continues(last, &item),
        };
        if new_run {
            tapes.start_run()?;
            run_len = 0;
        }

        session.abort.check()?;
        tapes.push(&item)?;
        run_len += 1;
        last = Some(item);
    }

    return tapes.finish();
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use super::{distribute, split, Boundary, DistributionPolicy, RunLengths, RunMarking, Tape, TapeReader, TapeRuns};
    use crate::channel::{Channel, ChannelWriter, RmpCodec};
    use crate::record::Order;
    use crate::session::{AbortSignal, SortSession};
    use crate::storage::{ChannelTracker, StorageManager};

    struct Fixture {
        tmp_dir: tempfile::TempDir,
        tracker: Arc<ChannelTracker>,
        abort: AbortSignal,
    }

    impl Fixture {
        fn session(&self) -> SortSession {
            let storage = StorageManager::new(Some(self.tmp_dir.path()), None, None, self.tracker.clone()).unwrap();
            SortSession::new(storage, &self.abort)
        }
    }

    #[fixture]
    fn fixture() -> Fixture {
        Fixture {
            tmp_dir: tempfile::tempdir_in("./").unwrap(),
            tracker: Arc::new(ChannelTracker::new()),
            abort: AbortSignal::new(),
        }
    }

    fn channel(session: &SortSession, items: &[i32]) -> Channel {
        let mut writer: ChannelWriter<i32, RmpCodec> = session.storage().allocate().unwrap();
        for item in items {
            writer.write(item).unwrap();
        }
        writer.finish().unwrap()
    }

    fn tape_runs(session: &SortSession, tape: &Tape) -> Vec<Vec<i32>> {
        let mut reader: TapeReader<i32, RmpCodec> = TapeReader::open(session.storage(), tape).unwrap();
        let mut runs = Vec::new();
        while let Some(run) = reader.next_run(session.warnings()).unwrap() {
            runs.push(run.map(Result::unwrap).collect());
        }
        runs
    }

    #[rstest]
    fn test_distribute_round_robin(fixture: Fixture) {
        let session = fixture.session();
        let runs = vec![
            channel(&session, &[1, 5]),
            channel(&session, &[2]),
            channel(&session, &[0, 3, 4]),
            channel(&session, &[7, 8]),
        ];

        let tapes = distribute::<i32, RmpCodec, _>(
            &session,
            runs.into_iter().map(Ok),
            3,
            DistributionPolicy::RoundRobin,
            RunMarking::Recorded,
        )
        .unwrap();

        assert_eq!(tapes.len(), 3);
        assert_eq!(tape_runs(&session, &tapes[0]), vec![vec![1, 5], vec![7, 8]]);
        assert_eq!(tape_runs(&session, &tapes[1]), vec![vec![2]]);
        assert_eq!(tape_runs(&session, &tapes[2]), vec![vec![0, 3, 4]]);
        // per-run channels are released once copied
        assert_eq!(session.storage().live_channels(), 3);
    }

    #[rstest]
    fn test_distribute_least_loaded(fixture: Fixture) {
        let session = fixture.session();
        let runs = vec![
            channel(&session, &[1, 2, 3, 4]),
            channel(&session, &[5]),
            channel(&session, &[6]),
            channel(&session, &[7, 8]),
        ];

        let tapes = distribute::<i32, RmpCodec, _>(
            &session,
            runs.into_iter().map(Ok),
            2,
            DistributionPolicy::LeastLoaded,
            RunMarking::Recorded,
        )
        .unwrap();

        assert_eq!(tape_runs(&session, &tapes[0]), vec![vec![1, 2, 3, 4]]);
        assert_eq!(tape_runs(&session, &tapes[1]), vec![vec![5], vec![6], vec![7, 8]]);
    }

    #[rstest]
    fn test_distribute_fewer_runs_than_tapes(fixture: Fixture) {
        let session = fixture.session();
        let runs = vec![channel(&session, &[3])];

        let tapes = distribute::<i32, RmpCodec, _>(
            &session,
            runs.into_iter().map(Ok),
            4,
            DistributionPolicy::RoundRobin,
            RunMarking::Recorded,
        )
        .unwrap();

        assert_eq!(tapes.len(), 1);
        assert_eq!(tapes[0].run_count(), 1);
        assert_eq!(session.storage().live_channels(), 1);
    }

    #[rstest]
    #[case(Boundary::Width(2), vec![vec![vec![4, 1], vec![6, 0]], vec![vec![3, 2], vec![9]]])]
    #[case(Boundary::Natural(Order::Asc), vec![vec![vec![4], vec![2, 6]], vec![vec![1, 3], vec![0, 9]]])]
    #[case(Boundary::Natural(Order::Desc), vec![vec![vec![4, 1], vec![6, 0]], vec![vec![3, 2], vec![9]]])]
    fn test_split(fixture: Fixture, #[case] boundary: Boundary, #[case] expected: Vec<Vec<Vec<i32>>>) {
        let session = fixture.session();
        let source = channel(&session, &[4, 1, 3, 2, 6, 0, 9]);

        let tapes = split::<i32, RmpCodec>(&session, &source, boundary, 2, DistributionPolicy::RoundRobin).unwrap();

        let actual: Vec<Vec<Vec<i32>>> = tapes.iter().map(|tape| tape_runs(&session, tape)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_run_lengths() {
        let mut lengths = RunLengths::new();
        for len in [4, 4, 4, 1] {
            lengths.push(len);
        }

        assert_eq!(lengths.len(), 4);
        assert_eq!(lengths.spans(), 2);
        assert_eq!(Vec::from_iter(std::iter::from_fn(|| lengths.pop_front())), vec![4, 4, 4, 1]);
        assert!(lengths.is_empty());
        assert_eq!(lengths.spans(), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(64)]
    fn test_width_split_bookkeeping_is_constant(fixture: Fixture, #[case] width: u64) {
        let session = fixture.session();
        let items: Vec<i32> = (0..10_000).rev().collect();
        let source = channel(&session, &items);

        let tapes = split::<i32, RmpCodec>(&session, &source, Boundary::Width(width), 2, DistributionPolicy::RoundRobin)
            .unwrap();

        let runs: usize = tapes.iter().map(Tape::run_count).sum();
        assert_eq!(runs as u64, (10_000 + width - 1) / width);
        for tape in &tapes {
            match tape.runs() {
                TapeRuns::Recorded(lengths) => assert!(lengths.spans() <= 2),
                TapeRuns::Detected { .. } => panic!("width runs must be recorded"),
            }
        }

        let restored: usize = tapes.iter().map(|tape| tape_runs(&session, tape).len()).sum();
        assert_eq!(restored, runs);
    }

    #[rstest]
    fn test_natural_split_keeps_no_lengths(fixture: Fixture) {
        let session = fixture.session();
        let items: Vec<i32> = (0..1_000).rev().collect();
        let source = channel(&session, &items);

        let tapes = split::<i32, RmpCodec>(
            &session,
            &source,
            Boundary::Natural(Order::Asc),
            2,
            DistributionPolicy::RoundRobin,
        )
        .unwrap();

        assert_eq!(tapes[0].runs(), &TapeRuns::Detected { order: Order::Asc, written: 500 });
        assert_eq!(tape_runs(&session, &tapes[0]).len(), 500);
    }

    #[rstest]
    fn test_detected_runs_coalesce(fixture: Fixture) {
        let session = fixture.session();
        let source = channel(&session, &[1, 0, 5, 3]);

        let tapes = split::<i32, RmpCodec>(
            &session,
            &source,
            Boundary::Natural(Order::Asc),
            2,
            DistributionPolicy::RoundRobin,
        )
        .unwrap();

        assert_eq!(tapes[0].run_count(), 2);
        assert_eq!(tape_runs(&session, &tapes[0]), vec![vec![1, 3]]);
        assert_eq!(tape_runs(&session, &tapes[1]), vec![vec![0, 5]]);
    }
}
