//! External sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::channel::{Channel, ChannelCodec, ChannelError, ChannelReader, RmpCodec};
use crate::distributor::DistributionPolicy;
use crate::record::{Order, RecordWarning, DEFAULT_WARNING_LIMIT};
use crate::scheduler::{schedule, MultiwayMode, Strategy};
use crate::session::{AbortSignal, SortSession};
use crate::storage::{ChannelTracker, StorageManager};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid sorter configuration.
    Configuration(String),
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Auxiliary channel could not be allocated.
    StorageAllocation(io::Error),
    /// Read or write on an auxiliary channel failed.
    StorageIO(io::Error),
    /// Data serialization error.
    SerializationError(String),
    /// Data deserialization error.
    DeserializationError(String),
    /// Input data stream error.
    InputError(io::Error),
    /// Output data stream error.
    OutputError(io::Error),
    /// Sort aborted on request.
    Aborted,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::StorageAllocation(err) => Some(err),
            SortError::StorageIO(err) => Some(err),
            SortError::InputError(err) => Some(err),
            SortError::OutputError(err) => Some(err),
            SortError::Configuration(_)
            | SortError::SerializationError(_)
            | SortError::DeserializationError(_)
            | SortError::Aborted => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Configuration(err) => write!(f, "invalid configuration: {}", err),
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::StorageAllocation(err) => write!(f, "auxiliary channel not allocated: {}", err),
            SortError::StorageIO(err) => write!(f, "auxiliary channel I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
            SortError::OutputError(err) => write!(f, "output data stream error: {}", err),
            SortError::Aborted => write!(f, "sort aborted"),
        }
    }
}

impl From<ChannelError> for SortError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(err) => SortError::StorageIO(err),
            ChannelError::Serialization(err) => SortError::SerializationError(err),
            ChannelError::Deserialization(err) => SortError::DeserializationError(err),
            err @ ChannelError::Malformed { .. } => SortError::DeserializationError(err.to_string()),
        }
    }
}

/// Sort parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortConfig {
    /// Merge strategy.
    pub strategy: Strategy,
    /// Balanced multiway layout.
    pub multiway_mode: MultiwayMode,
    /// Maximum number of elements sorted in memory at once.
    pub block_capacity: usize,
    /// Number of tapes of the tape layout.
    pub tape_count: usize,
    /// Merge fan-in of the chunked layout.
    pub num_ways: usize,
    /// Output order.
    pub order: Order,
    /// Tape selection policy of the tape layout.
    pub distribution: DistributionPolicy,
}

impl SortConfig {
    /// Checks the parameters. Called before any I/O takes place.
    pub fn validate(&self) -> Result<(), SortError> {
        if self.block_capacity == 0 {
            return Err(SortError::Configuration("block capacity must be positive".to_string()));
        }
        if self.num_ways < 2 {
            return Err(SortError::Configuration(format!(
                "number of merge ways must be at least 2 (got {})",
                self.num_ways
            )));
        }
        if self.strategy == Strategy::BalancedMultiway && self.tape_count < 3 {
            return Err(SortError::Configuration(format!(
                "balanced multiway merge requires at least 3 tapes (got {})",
                self.tape_count
            )));
        }

        return Ok(());
    }
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            strategy: Strategy::default(),
            multiway_mode: MultiwayMode::default(),
            block_capacity: 10_000,
            tape_count: 3,
            num_ways: 4,
            order: Order::default(),
            distribution: DistributionPolicy::default(),
        }
    }
}

/// Statistics of a completed sort.
#[derive(Debug, Clone, Default)]
pub struct SortStats {
    /// Number of valid elements sorted.
    pub elements: u64,
    /// Number of runs produced from the input.
    pub initial_runs: usize,
    /// Number of merge passes.
    pub passes: usize,
    /// Number of auxiliary channels allocated during the sort.
    pub channels_allocated: u64,
    /// Number of skipped records.
    pub skipped: u64,
    /// First skipped records, at most the configured warning limit.
    pub warnings: Vec<RecordWarning>,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<T, C = RmpCodec>
where
    C: ChannelCodec<T>,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Channel file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Maximum number of simultaneously live channels.
    channel_limit: Option<usize>,
    /// Maximum number of warnings kept in memory.
    warning_limit: Option<usize>,
    /// Sort parameters.
    config: SortConfig,

    /// Channel codec type.
    codec_type: PhantomData<C>,
    /// Element type.
    item_type: PhantomData<fn() -> T>,
}

impl<T, C> ExternalSorterBuilder<T, C>
where
    C: ChannelCodec<T>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T, C>, SortError> {
        ExternalSorter::new(
            self.config,
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.rw_buf_size,
            self.channel_limit,
            self.warning_limit,
        )
    }

    /// Sets the merge strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> ExternalSorterBuilder<T, C> {
        self.config.strategy = strategy;
        return self;
    }

    /// Sets the balanced multiway layout.
    pub fn with_multiway_mode(mut self, mode: MultiwayMode) -> ExternalSorterBuilder<T, C> {
        self.config.multiway_mode = mode;
        return self;
    }

    /// Sets the maximum number of elements sorted in memory at once.
    pub fn with_block_capacity(mut self, block_capacity: usize) -> ExternalSorterBuilder<T, C> {
        self.config.block_capacity = block_capacity;
        return self;
    }

    /// Sets the number of tapes used by the tape layout.
    pub fn with_tape_count(mut self, tape_count: usize) -> ExternalSorterBuilder<T, C> {
        self.config.tape_count = tape_count;
        return self;
    }

    /// Sets the merge fan-in of the chunked layout.
    pub fn with_num_ways(mut self, num_ways: usize) -> ExternalSorterBuilder<T, C> {
        self.config.num_ways = num_ways;
        return self;
    }

    /// Sets the output order.
    pub fn with_order(mut self, order: Order) -> ExternalSorterBuilder<T, C> {
        self.config.order = order;
        return self;
    }

    /// Sets the tape selection policy.
    pub fn with_distribution(mut self, distribution: DistributionPolicy) -> ExternalSorterBuilder<T, C> {
        self.config.distribution = distribution;
        return self;
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T, C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets channel read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<T, C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Limits the number of simultaneously live channels. Allocations over the limit fail.
    pub fn with_channel_limit(mut self, limit: usize) -> ExternalSorterBuilder<T, C> {
        self.channel_limit = Some(limit);
        return self;
    }

    /// Sets the number of skipped record warnings kept for [`SortStats::warnings`].
    /// Warnings over the limit are logged and counted only.
    pub fn with_warning_limit(mut self, limit: usize) -> ExternalSorterBuilder<T, C> {
        self.warning_limit = Some(limit);
        return self;
    }
}

impl<T, C> Default for ExternalSorterBuilder<T, C>
where
    C: ChannelCodec<T>,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            channel_limit: None,
            warning_limit: None,
            config: SortConfig::default(),
            codec_type: PhantomData,
            item_type: PhantomData,
        }
    }
}

/// External sorter.
pub struct ExternalSorter<T, C = RmpCodec>
where
    C: ChannelCodec<T>,
{
    /// Sort parameters.
    config: SortConfig,
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory session namespaces are created in.
    tmp_dir: Option<Box<Path>>,
    /// Channel file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Maximum number of simultaneously live channels.
    channel_limit: Option<usize>,
    /// Maximum number of warnings kept in memory.
    warning_limit: usize,
    /// Channels of all sessions.
    tracker: Arc<ChannelTracker>,

    /// Channel codec type.
    codec_type: PhantomData<C>,
    /// Element type.
    item_type: PhantomData<fn() -> T>,
}

impl<T, C> ExternalSorter<T, C>
where
    C: ChannelCodec<T>,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `config` - Sort parameters, validated before anything else
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `rw_buf_size` - Channel file read/write buffer size.
    /// * `channel_limit` - Maximum number of simultaneously live channels per sort.
    /// * `warning_limit` - Maximum number of skipped record warnings kept per sort. If the parameter is [`None`]
    ///   [`DEFAULT_WARNING_LIMIT`] is used.
    pub fn new(
        config: SortConfig,
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        rw_buf_size: Option<usize>,
        channel_limit: Option<usize>,
        warning_limit: Option<usize>,
    ) -> Result<Self, SortError> {
        config.validate()?;

        return Ok(ExternalSorter {
            config,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Into::into),
            rw_buf_size,
            channel_limit,
            warning_limit: warning_limit.unwrap_or(DEFAULT_WARNING_LIMIT),
            tracker: Arc::new(ChannelTracker::new()),
            codec_type: PhantomData,
            item_type: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Sort parameters the sorter was built with.
    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Number of auxiliary channels currently allocated by running sorts of this sorter.
    pub fn live_channels(&self) -> usize {
        self.tracker.live()
    }
}

impl<T, C> ExternalSorter<T, C>
where
    T: Ord + Send + FromStr + Display,
    T::Err: Display,
    C: ChannelCodec<T>,
{
    /// Sorts text records from the input and writes them, one per line, to the output.
    ///
    /// Records that don't parse as an element are skipped, counted in [`SortStats::skipped`] and reported in
    /// [`SortStats::warnings`].
    /// Nothing is written to the output unless the sort succeeds up to the final merge.
    ///
    /// # Arguments
    /// * `input` - Input records, usually [`BufRead::lines`]
    /// * `output` - Sorted data destination
    pub fn sort<I, W>(&self, input: I, output: W) -> Result<SortStats, SortError>
    where
        I: IntoIterator<Item = io::Result<String>>,
        W: Write,
    {
        self.sort_cancellable(input, output, &AbortSignal::new())
    }

    /// Same as [`ExternalSorter::sort`], stopping with [`SortError::Aborted`] once `abort` is raised.
    pub fn sort_cancellable<I, W>(&self, input: I, mut output: W, abort: &AbortSignal) -> Result<SortStats, SortError>
    where
        I: IntoIterator<Item = io::Result<String>>,
        W: Write,
    {
        let storage = StorageManager::new(
            self.tmp_dir.as_deref(),
            self.rw_buf_size,
            self.channel_limit,
            self.tracker.clone(),
        )?;
        log::info!(
            "sorting (strategy: {:?}, block capacity: {}, namespace: {})",
            self.config.strategy,
            self.config.block_capacity,
            storage.path().display()
        );

        let mut session = SortSession::new(storage, abort).with_warning_limit(self.warning_limit);
        let result = self.run_session(&mut session, input.into_iter(), &mut output);
        session.storage.release_all();

        match &result {
            Ok(stats) => log::info!(
                "sort done (elements: {}, runs: {}, passes: {}, skipped: {})",
                stats.elements,
                stats.initial_runs,
                stats.passes,
                stats.skipped
            ),
            Err(err) => log::error!("sort failed: {}", err),
        }

        return result;
    }

    fn run_session<I, W>(&self, session: &mut SortSession, input: I, output: &mut W) -> Result<SortStats, SortError>
    where
        I: Iterator<Item = io::Result<String>>,
        W: Write,
    {
        let outcome = schedule::<T, C, I>(session, &self.config, &self.thread_pool, input)?;

        if let Some(sorted) = outcome.sorted {
            let written = write_output::<T, C, W>(session, &sorted, output)?;
            log::debug!("{} elements written to the output", written);
            session.storage.release(sorted);
        } else {
            log::info!("nothing to sort");
        }
        output.flush().map_err(SortError::OutputError)?;

        return Ok(SortStats {
            elements: outcome.elements,
            initial_runs: outcome.initial_runs,
            passes: session.passes(),
            channels_allocated: session.storage.allocated_channels(),
            skipped: session.warnings.count(),
            warnings: session.warnings.take(),
        });
    }

    /// Sorts the file at `input_path` into `output_path`.
    ///
    /// The result is written to a temporary file next to `output_path` and moved in place only when the sort
    /// succeeds, so a failed sort never leaves a partial file at `output_path`.
    pub fn sort_file(&self, input_path: &Path, output_path: &Path) -> Result<SortStats, SortError> {
        let input = io::BufReader::new(fs::File::open(input_path).map_err(SortError::InputError)?);

        let output_dir = match output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let output_file = tempfile::NamedTempFile::new_in(output_dir).map_err(SortError::OutputError)?;

        let stats = {
            let mut writer = io::BufWriter::new(output_file.as_file());
            let stats = self.sort(input.lines(), &mut writer)?;
            writer.flush().map_err(SortError::OutputError)?;
            stats
        };

        output_file
            .persist(output_path)
            .map_err(|err| SortError::OutputError(err.error))?;

        return Ok(stats);
    }
}

fn write_output<T, C, W>(session: &SortSession, sorted: &Channel, output: &mut W) -> Result<u64, SortError>
where
    T: Display,
    C: ChannelCodec<T>,
    W: Write,
{
    let mut reader: ChannelReader<T, C> = session.storage.open(sorted)?;
    let mut written = 0;

    for item in reader.run(sorted.items(), &session.warnings) {
        let item = item?;
        session.abort.check()?;
        writeln!(output, "{}", item).map_err(SortError::OutputError)?;
        written += 1;
    }

    return Ok(written);
}
