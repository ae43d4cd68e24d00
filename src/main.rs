use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_merge_sort::{ExternalSorter, ExternalSorterBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let strategy: Strategy = arg_parser.value_of_t_or_exit("strategy");
    let mode: Mode = arg_parser.value_of_t_or_exit("mode");
    let block_capacity: usize = arg_parser.value_of_t_or_exit("block_capacity");
    let tapes: usize = arg_parser.value_of_t_or_exit("tapes");
    let ways: usize = arg_parser.value_of_t_or_exit("ways");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let io_buffer: Option<&str> = arg_parser.value_of("io_buffer");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_strategy(strategy.into())
        .with_multiway_mode(mode.into())
        .with_order(order.into())
        .with_block_capacity(block_capacity)
        .with_tape_count(tapes)
        .with_num_ways(ways);

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(io_buffer) = io_buffer {
        sorter_builder =
            sorter_builder.with_rw_buf_size(io_buffer.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize);
    }

    let sorter: ExternalSorter<i64> = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.sort_file(path::Path::new(input), path::Path::new(output)) {
        Ok(stats) => {
            if stats.skipped > 0 {
                log::warn!("{} records skipped", stats.skipped);
            }
        }
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Order> for ext_merge_sort::Order {
    fn from(order: Order) -> Self {
        match order {
            Order::Asc => ext_merge_sort::Order::Asc,
            Order::Desc => ext_merge_sort::Order::Desc,
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Strategy {
    FixedDoubling,
    Natural,
    BalancedMultiway,
}

impl Strategy {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Strategy::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Strategy as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Strategy> for ext_merge_sort::Strategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::FixedDoubling => ext_merge_sort::Strategy::FixedDoubling,
            Strategy::Natural => ext_merge_sort::Strategy::Natural,
            Strategy::BalancedMultiway => ext_merge_sort::Strategy::BalancedMultiway,
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Mode {
    Chunked,
    Tapes,
}

impl Mode {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Mode::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Mode as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Mode> for ext_merge_sort::MultiwayMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Chunked => ext_merge_sort::MultiwayMode::Chunked,
            Mode::Tapes => ext_merge_sort::MultiwayMode::Tapes,
        }
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-merge-sort")
        .about("external merge sorter of integer files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted, one integer per line")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("strategy")
                .short('m')
                .long("strategy")
                .help("merge strategy")
                .takes_value(true)
                .default_value("balanced-multiway")
                .possible_values(Strategy::possible_values()),
        )
        .arg(
            clap::Arg::new("mode")
                .long("mode")
                .help("balanced multiway merge layout")
                .takes_value(true)
                .default_value("chunked")
                .possible_values(Mode::possible_values()),
        )
        .arg(
            clap::Arg::new("block_capacity")
                .short('b')
                .long("block-capacity")
                .help("maximum number of elements sorted in memory at once")
                .takes_value(true)
                .default_value("100000")
                .validator(|v| v.parse::<usize>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("tapes")
                .long("tapes")
                .help("number of tapes of the tape layout")
                .takes_value(true)
                .default_value("3")
                .validator(|v| v.parse::<usize>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("ways")
                .short('w')
                .long("ways")
                .help("number of runs merged at once by the chunked layout")
                .takes_value(true)
                .default_value("4")
                .validator(|v| v.parse::<usize>().map(|_| ()).map_err(|err| err.to_string())),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("io_buffer")
                .long("io-buffer")
                .help("auxiliary channel read/write buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("I/O buffer size format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
