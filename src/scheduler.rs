//! Pass scheduler.
//!
//! Drives run production, distribution and merge passes until a single sorted channel remains.

use std::fmt;
use std::io;
use std::str::FromStr;

use rayon::prelude::*;

use crate::channel::{Channel, ChannelCodec, ChannelReader, ChannelWriter, RunSink};
use crate::distributor::{distribute, split, Boundary, DistributionPolicy, RunMarking, Tape, TapeReader, TapeSetWriter};
use crate::merger::merge_into;
use crate::record::Order;
use crate::run::{RunPolicy, RunProducer};
use crate::session::SortSession;
use crate::sort::{SortConfig, SortError};

/// Merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Straight merge: runs of width 1 merged pairwise through two tapes, width doubles every pass.
    FixedDoubling,
    /// Natural merge: runs detected by order breaks, merged pairwise until the output is one run.
    Natural,
    /// Balanced multiway merge of fixed-size runs, see [`MultiwayMode`].
    BalancedMultiway,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::BalancedMultiway
    }
}

/// Layout of the balanced multiway merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiwayMode {
    /// Every run in its own channel, merged `num_ways` at a time.
    Chunked,
    /// Runs distributed on `tape_count` tapes, merged `tape_count - 1` tapes at a time.
    Tapes,
}

impl Default for MultiwayMode {
    fn default() -> Self {
        MultiwayMode::Chunked
    }
}

/// Result of a scheduled sort.
pub struct Outcome {
    /// Fully sorted channel, [`None`] if the input held no element.
    pub sorted: Option<Channel>,
    /// Number of valid input elements.
    pub elements: u64,
    /// Number of runs produced from the input.
    pub initial_runs: usize,
}

impl Outcome {
    fn empty(elements: u64) -> Self {
        Outcome {
            sorted: None,
            elements,
            initial_runs: 0,
        }
    }
}

/// Sorts `input` according to `config.strategy`.
pub fn schedule<T, C, I>(
    session: &mut SortSession,
    config: &SortConfig,
    thread_pool: &rayon::ThreadPool,
    input: I,
) -> Result<Outcome, SortError>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    match config.strategy {
        Strategy::FixedDoubling => fixed_doubling::<T, C, I>(session, config, thread_pool, input),
        Strategy::Natural => natural::<T, C, I>(session, config, thread_pool, input),
        Strategy::BalancedMultiway => match config.multiway_mode {
            MultiwayMode::Chunked => chunked_multiway::<T, C, I>(session, config, thread_pool, input),
            MultiwayMode::Tapes => tape_multiway::<T, C, I>(session, config, thread_pool, input),
        },
    }
}

fn fixed_doubling<T, C, I>(
    session: &mut SortSession,
    config: &SortConfig,
    thread_pool: &rayon::ThreadPool,
    input: I,
) -> Result<Outcome, SortError>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    let (source, elements) = {
        let mut producer: RunProducer<T, C, I> = RunProducer::new(
            session,
            thread_pool,
            input,
            RunPolicy::Fixed { block_capacity: 1 },
            config.order,
        );
        (producer.spool()?, producer.elements())
    };

    let source = match source {
        Some(source) => source,
        None => return Ok(Outcome::empty(elements)),
    };

    let total = source.items();
    session.set_source(source);

    let mut width: u64 = 1;
    while width < total {
        let destination = match session.source() {
            Some(source) => {
                let tapes = split::<T, C>(session, source, Boundary::Width(width), 2, DistributionPolicy::RoundRobin)?;
                merge_tapes::<T, C>(session, tapes, config.order)?
            }
            None => break,
        };
        session.complete_pass(destination);
        log::info!("straight merge pass {} done (run width: {})", session.passes(), width * 2);
        width *= 2;
    }

    return Ok(Outcome {
        sorted: session.take_source(),
        elements,
        initial_runs: total as usize,
    });
}

fn natural<T, C, I>(
    session: &mut SortSession,
    config: &SortConfig,
    thread_pool: &rayon::ThreadPool,
    input: I,
) -> Result<Outcome, SortError>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    let order = config.order;
    let (mut tapes, elements, initial_runs) = {
        let mut producer: RunProducer<T, C, I> =
            RunProducer::new(session, thread_pool, input, RunPolicy::Natural, order);
        let tapes = distribute::<T, C, _>(
            session,
            &mut producer,
            2,
            DistributionPolicy::RoundRobin,
            RunMarking::Detected(order),
        )?;
        (tapes, producer.elements(), producer.runs())
    };

    if tapes.is_empty() {
        return Ok(Outcome::empty(elements));
    }
    log::info!("{} natural runs found", initial_runs);

    loop {
        let destination = merge_tapes::<T, C>(session, tapes, order)?;
        session.complete_pass(destination);

        let source = match session.source() {
            Some(source) => source,
            None => break,
        };
        if is_sorted::<T, C>(session, source, order)? {
            log::info!("natural merge pass {} done, output sorted", session.passes());
            break;
        }
        log::info!("natural merge pass {} done", session.passes());

        tapes = split::<T, C>(session, source, Boundary::Natural(order), 2, DistributionPolicy::RoundRobin)?;
    }

    return Ok(Outcome {
        sorted: session.take_source(),
        elements,
        initial_runs,
    });
}

fn chunked_multiway<T, C, I>(
    session: &mut SortSession,
    config: &SortConfig,
    thread_pool: &rayon::ThreadPool,
    input: I,
) -> Result<Outcome, SortError>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    let order = config.order;
    let (mut runs, elements) = {
        let mut producer: RunProducer<T, C, I> = RunProducer::new(
            session,
            thread_pool,
            input,
            RunPolicy::Fixed {
                block_capacity: config.block_capacity,
            },
            order,
        );
        let runs = (&mut producer).collect::<Result<Vec<Channel>, SortError>>()?;
        (runs, producer.elements())
    };

    let initial_runs = runs.len();
    log::info!("{} initial runs created", initial_runs);

    while runs.len() > 1 {
        session.count_pass();
        log::info!("merge pass {} over {} channels", session.passes(), runs.len());

        let mut groups: Vec<Vec<Channel>> = Vec::new();
        let mut remaining = runs.into_iter().peekable();
        while remaining.peek().is_some() {
            groups.push(remaining.by_ref().take(config.num_ways).collect());
        }

        let shared: &SortSession = session;
        runs = thread_pool.install(|| {
            groups
                .into_par_iter()
                .map(|group| merge_channels::<T, C>(shared, group, order))
                .collect::<Result<Vec<Channel>, SortError>>()
        })?;
    }

    return Ok(Outcome {
        sorted: runs.pop(),
        elements,
        initial_runs,
    });
}

fn tape_multiway<T, C, I>(
    session: &mut SortSession,
    config: &SortConfig,
    thread_pool: &rayon::ThreadPool,
    input: I,
) -> Result<Outcome, SortError>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    let order = config.order;
    let (mut tapes, elements, initial_runs) = {
        let mut producer: RunProducer<T, C, I> = RunProducer::new(
            session,
            thread_pool,
            input,
            RunPolicy::Fixed {
                block_capacity: config.block_capacity,
            },
            order,
        );
        let tapes = distribute::<T, C, _>(
            session,
            &mut producer,
            config.tape_count,
            config.distribution,
            RunMarking::Recorded,
        )?;
        (tapes, producer.elements(), producer.runs())
    };
    log::info!("{} initial runs distributed on {} tapes", initial_runs, tapes.len());

    loop {
        // the active set shrinks irregularly, so it is recomputed on every pass
        let (active, idle): (Vec<Tape>, Vec<Tape>) = tapes.into_iter().partition(Tape::is_active);
        for tape in idle {
            session.storage.release(tape.into_channel());
        }

        let total_runs: usize = active.iter().map(Tape::run_count).sum();
        if total_runs <= 1 {
            return Ok(Outcome {
                sorted: active.into_iter().next().map(Tape::into_channel),
                elements,
                initial_runs,
            });
        }

        session.count_pass();
        log::info!(
            "tape merge pass {} ({} active tapes, {} runs)",
            session.passes(),
            active.len(),
            total_runs
        );

        let mut output: TapeSetWriter<T, C> =
            TapeSetWriter::new(&session.storage, config.tape_count, config.distribution, RunMarking::Recorded);
        for group in active.chunks(config.tape_count - 1) {
            merge_tape_group::<T, C, _>(session, group, order, &mut output)?;
        }
        tapes = output.finish()?;

        for tape in active {
            session.storage.release(tape.into_channel());
        }
    }
}

/// Merges whole channels into a new one and releases them.
/// A single channel is passed through untouched.
fn merge_channels<T, C>(session: &SortSession, mut group: Vec<Channel>, order: Order) -> Result<Channel, SortError>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    if group.len() == 1 {
        if let Some(channel) = group.pop() {
            return Ok(channel);
        }
    }

    let mut readers = group
        .iter()
        .map(|channel| session.storage.open::<T, C>(channel))
        .collect::<Result<Vec<ChannelReader<T, C>>, SortError>>()?;
    let mut destination: ChannelWriter<T, C> = session.storage.allocate()?;

    let cursors = readers
        .iter_mut()
        .zip(&group)
        .map(|(reader, channel)| reader.run(channel.items(), &session.warnings))
        .collect();
    let written = merge_into(cursors, order, &mut destination, session.abort)?;
    drop(readers);

    let destination = destination.finish()?;
    log::debug!(
        "merged {} channels into channel {} ({} elements)",
        group.len(),
        destination.id(),
        written
    );
    for channel in group {
        session.storage.release(channel);
    }

    return Ok(destination);
}

/// Merges two-tape output back into a single channel and releases the tapes.
fn merge_tapes<T, C>(session: &SortSession, tapes: Vec<Tape>, order: Order) -> Result<Channel, SortError>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    let mut destination: ChannelWriter<T, C> = session.storage.allocate()?;
    merge_tape_group::<T, C, _>(session, &tapes, order, &mut destination)?;
    let destination = destination.finish()?;

    for tape in tapes {
        session.storage.release(tape.into_channel());
    }

    return Ok(destination);
}

/// Merges the next run of every tape of `group` into one output run of `sink`, until the tapes are exhausted.
/// Returns the number of runs written.
fn merge_tape_group<T, C, K>(session: &SortSession, group: &[Tape], order: Order, sink: &mut K) -> Result<usize, SortError>
where
    T: Ord,
    C: ChannelCodec<T>,
    K: RunSink<T>,
{
    let mut readers = group
        .iter()
        .map(|tape| TapeReader::<T, C>::open(&session.storage, tape))
        .collect::<Result<Vec<_>, SortError>>()?;

    let mut rounds = 0;
    loop {
        let mut cursors = Vec::with_capacity(readers.len());
        for reader in readers.iter_mut() {
            if let Some(run) = reader.next_run(&session.warnings)? {
                cursors.push(run);
            }
        }
        if cursors.is_empty() {
            break;
        }

        merge_into(cursors, order, sink, session.abort)?;
        rounds += 1;
    }

    return Ok(rounds);
}

/// Checks that the whole channel is a single run in `order`.
fn is_sorted<T, C>(session: &SortSession, channel: &Channel, order: Order) -> Result<bool, SortError>
where
    T: Ord,
    C: ChannelCodec<T>,
{
    let mut reader: ChannelReader<T, C> = session.storage.open(channel)?;
    let mut last: Option<T> = None;

    for item in reader.run(channel.items(), &session.warnings) {
        let item = item?;
        if let Some(last) = &last {
            if !order.continues(last, &item) {
                return Ok(false);
            }
        }
        last = Some(item);
    }

    return Ok(true);
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::Arc;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{schedule, MultiwayMode, Strategy};
    use crate::channel::RmpCodec;
    use crate::record::Order;
    use crate::session::{AbortSignal, SortSession};
    use crate::sort::SortConfig;
    use crate::storage::{ChannelTracker, StorageManager};

    struct Fixture {
        tmp_dir: tempfile::TempDir,
        tracker: Arc<ChannelTracker>,
        abort: AbortSignal,
        thread_pool: rayon::ThreadPool,
    }

    #[fixture]
    fn fixture() -> Fixture {
        Fixture {
            tmp_dir: tempfile::tempdir_in("./").unwrap(),
            tracker: Arc::new(ChannelTracker::new()),
            abort: AbortSignal::new(),
            thread_pool: rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap(),
        }
    }

    fn run(fixture: &Fixture, config: &SortConfig, items: &[i64]) -> (Vec<i64>, usize) {
        let storage = StorageManager::new(Some(fixture.tmp_dir.path()), None, None, fixture.tracker.clone()).unwrap();
        let mut session = SortSession::new(storage, &fixture.abort);
        let input = items.iter().map(|item| Ok::<_, io::Error>(item.to_string()));

        let outcome = schedule::<i64, RmpCodec, _>(&mut session, config, &fixture.thread_pool, input).unwrap();
        let sorted = match outcome.sorted {
            Some(channel) => {
                let reader = session.storage().open::<i64, RmpCodec>(&channel).unwrap();
                let sorted = reader.map(Result::unwrap).collect();
                session.storage().release(channel);
                sorted
            }
            None => Vec::new(),
        };
        assert_eq!(session.storage().live_channels(), 0);

        (sorted, session.passes())
    }

    fn config(strategy: Strategy, mode: MultiwayMode) -> SortConfig {
        SortConfig {
            strategy,
            multiway_mode: mode,
            block_capacity: 3,
            tape_count: 3,
            num_ways: 2,
            ..SortConfig::default()
        }
    }

    #[rstest]
    #[case(Strategy::FixedDoubling, MultiwayMode::Chunked)]
    #[case(Strategy::Natural, MultiwayMode::Chunked)]
    #[case(Strategy::BalancedMultiway, MultiwayMode::Chunked)]
    #[case(Strategy::BalancedMultiway, MultiwayMode::Tapes)]
    fn test_schedule_sorts(fixture: Fixture, #[case] strategy: Strategy, #[case] mode: MultiwayMode) {
        let mut items = Vec::from_iter((0..50).chain(10..30));
        items.shuffle(&mut rand::thread_rng());

        let (sorted, _) = run(&fixture, &config(strategy, mode), &items);

        let mut expected = items.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(5, 3)]
    #[case(8, 3)]
    #[case(9, 4)]
    fn test_fixed_doubling_pass_count(fixture: Fixture, #[case] len: i64, #[case] passes: usize) {
        let items = Vec::from_iter((0..len).rev());

        let (sorted, actual_passes) = run(&fixture, &config(Strategy::FixedDoubling, MultiwayMode::Chunked), &items);

        assert_eq!(sorted, Vec::from_iter(0..len));
        assert_eq!(actual_passes, passes);
    }

    #[rstest]
    fn test_natural_sorted_input_single_pass(fixture: Fixture) {
        let items = Vec::from_iter(0..40);

        let (sorted, passes) = run(&fixture, &config(Strategy::Natural, MultiwayMode::Chunked), &items);

        assert_eq!(sorted, items);
        assert_eq!(passes, 1);
    }

    #[rstest]
    fn test_tapes_descending(fixture: Fixture) {
        let mut config = config(Strategy::BalancedMultiway, MultiwayMode::Tapes);
        config.order = Order::Desc;
        config.tape_count = 4;

        let (sorted, _) = run(&fixture, &config, &[3, 9, 1, 4, 4, 0, 7, 2, 8, 6, 5]);

        assert_eq!(sorted, vec![9, 8, 7, 6, 5, 4, 4, 3, 2, 1, 0]);
    }
}
