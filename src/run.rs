//! Run producer.
//!
//! Reads text records from the input stream and spills ordered runs to auxiliary channels. Records that
//! don't parse as an element are skipped with a warning. Channels are allocated lazily, so an empty input
//! allocates nothing.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::str::FromStr;

use crate::buffer::RunBuffer;
use crate::channel::{Channel, ChannelCodec, ChannelWriter};
use crate::record::{parse_record, Order, RecordSource, RecordWarning};
use crate::session::SortSession;
use crate::sort::SortError;

/// Run boundary policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// Runs of `block_capacity` elements sorted in memory. The last run may be shorter.
    Fixed { block_capacity: usize },
    /// Runs end where the next element breaks the order. No in-memory sorting.
    Natural,
}

/// Run producer. Yields one sealed channel per run.
pub struct RunProducer<'s, 'a, T, C, I> {
    session: &'s SortSession<'a>,
    thread_pool: &'s rayon::ThreadPool,
    input: I,
    policy: RunPolicy,
    order: Order,
    line: u64,
    pending: Option<T>,
    elements: u64,
    runs: usize,
    exhausted: bool,

    codec_type: PhantomData<C>,
}

impl<'s, 'a, T, C, I> RunProducer<'s, 'a, T, C, I>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    /// Creates a run producer.
    ///
    /// # Arguments
    /// * `session` - Session the run channels are allocated in
    /// * `thread_pool` - Pool used to sort fixed-size runs
    /// * `input` - Text records, one element per record
    /// * `policy` - Run boundary policy
    /// * `order` - Order of the produced runs
    pub fn new(
        session: &'s SortSession<'a>,
        thread_pool: &'s rayon::ThreadPool,
        input: I,
        policy: RunPolicy,
        order: Order,
    ) -> Self {
        RunProducer {
            session,
            thread_pool,
            input,
            policy,
            order,
            line: 0,
            pending: None,
            elements: 0,
            runs: 0,
            exhausted: false,
            codec_type: PhantomData,
        }
    }

    /// Number of valid elements read so far.
    pub fn elements(&self) -> u64 {
        self.elements
    }

    /// Number of runs produced so far.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Produces the next run. Returns [`None`] when the input is exhausted.
    pub fn next_run(&mut self) -> Result<Option<Channel>, SortError> {
        let run = match self.policy {
            RunPolicy::Fixed { block_capacity } => self.fixed_run(block_capacity)?,
            RunPolicy::Natural => self.natural_run()?,
        };

        if let Some(run) = &run {
            self.runs += 1;
            log::debug!("run {} produced (channel: {}, elements: {})", self.runs, run.id(), run.items());
        }

        return Ok(run);
    }

    /// Writes every input element, unsorted, to a single channel.
    /// Each element is a run of length 1 for the fixed doubling strategy.
    pub fn spool(&mut self) -> Result<Option<Channel>, SortError> {
        let mut writer: Option<ChannelWriter<T, C>> = None;

        while let Some(item) = self.next_element()? {
            if writer.is_none() {
                writer = Some(self.session.storage.allocate()?);
            }
            if let Some(channel) = writer.as_mut() {
                self.session.abort.check()?;
                channel.write(&item)?;
            }
        }

        match writer {
            Some(writer) => Ok(Some(writer.finish()?)),
            None => Ok(None),
        }
    }

    fn fixed_run(&mut self, block_capacity: usize) -> Result<Option<Channel>, SortError> {
        let mut buffer = RunBuffer::with_capacity(block_capacity);
        while !buffer.is_full() {
            match self.next_element()? {
                Some(item) => buffer.push(item),
                None => break,
            }
        }

        if buffer.is_empty() {
            return Ok(None);
        }

        let order = self.order;
        self.thread_pool.install(|| buffer.par_sort(order));

        let mut writer: ChannelWriter<T, C> = self.session.storage.allocate()?;
        for item in buffer {
            self.session.abort.check()?;
            writer.write(&item)?;
        }

        return Ok(Some(writer.finish()?));
    }

    fn natural_run(&mut self) -> Result<Option<Channel>, SortError> {
        let mut last = match self.next_element()? {
            Some(item) => item,
            None => return Ok(None),
        };

        let mut writer: ChannelWriter<T, C> = self.session.storage.allocate()?;
        writer.write(&last)?;

        while let Some(item) = self.next_element()? {
            if !self.order.continues(&last, &item) {
                self.pending = Some(item);
                break;
            }
            self.session.abort.check()?;
            writer.write(&item)?;
            last = item;
        }

        return Ok(Some(writer.finish()?));
    }

    fn next_element(&mut self) -> Result<Option<T>, SortError> {
        if let Some(item) = self.pending.take() {
            return Ok(Some(item));
        }
        if self.exhausted {
            return Ok(None);
        }

        loop {
            self.session.abort.check()?;

            let record = match self.input.next() {
                Some(record) => record.map_err(SortError::InputError)?,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            };
            self.line += 1;

            match parse_record::<T>(&record) {
                Ok(item) => {
                    self.elements += 1;
                    return Ok(Some(item));
                }
                Err(reason) => self.session.warnings.record(RecordWarning {
                    source: RecordSource::Input(self.line),
                    record,
                    reason,
                }),
            }
        }
    }
}

impl<'s, 'a, T, C, I> Iterator for RunProducer<'s, 'a, T, C, I>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: Iterator<Item = io::Result<String>>,
{
    type Item = Result<Channel, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_run() {
            Ok(run) => run.map(Ok),
            Err(err) => {
                self.exhausted = true;
                self.pending = None;
                Some(Err(err))
            }
        }
    }
}

/// Reads the whole input and returns its runs.
pub fn produce_runs<T, C, I>(
    session: &SortSession,
    thread_pool: &rayon::ThreadPool,
    input: I,
    policy: RunPolicy,
    order: Order,
) -> Result<Vec<Channel>, SortError>
where
    T: Ord + Send + FromStr,
    T::Err: fmt::Display,
    C: ChannelCodec<T>,
    I: IntoIterator<Item = io::Result<String>>,
{
    RunProducer::<T, C, _>::new(session, thread_pool, input.into_iter(), policy, order).collect()
}
