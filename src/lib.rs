//! `ext-merge-sort` is a rust external merge sort engine.
//!
//! External sorting is required when the data being sorted do not fit into the main memory of a computer and
//! instead must reside in slower external memory, usually a hard disk drive. The input is cut into ordered runs
//! that are spilled to auxiliary files (channels), then the runs are merged pass after pass until a single sorted
//! run remains. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `ext-merge-sort` supports the following merge strategies:
//!
//! * **Fixed doubling (straight merge):**
//!   every element is a run of width 1. Runs are split over two tapes and merged pairwise,
//!   the run width doubles every pass.
//! * **Natural merge:**
//!   runs are the maximal ordered stretches of the input. They are merged pairwise until the output
//!   is a single run, so already sorted input takes one pass.
//! * **Balanced multiway merge:**
//!   runs of `block_capacity` elements are sorted in memory in parallel, then merged `num_ways` runs at
//!   a time (chunked layout) or over `tape_count` tapes (tape layout).
//!
//! Records that don't parse as an element are skipped and reported as warnings. Auxiliary channels live in
//! a per-sort temporary directory and are removed whether the sort succeeds or fails.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io::{self, prelude::*};
//! use std::path;
//!
//! use ext_merge_sort::{ExternalSorter, ExternalSorterBuilder, Order, Strategy};
//!
//! fn main() {
//!     let input_reader = io::BufReader::new(fs::File::open("input.txt").unwrap());
//!     let output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());
//!
//!     let sorter: ExternalSorter<i64> = ExternalSorterBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_strategy(Strategy::BalancedMultiway)
//!         .with_block_capacity(100_000)
//!         .with_order(Order::Desc)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort(input_reader.lines(), output_writer).unwrap();
//!     for warning in &stats.warnings {
//!         println!("skipped: {}", warning);
//!     }
//! }
//! ```

pub mod buffer;
pub mod channel;
pub mod distributor;
pub mod merger;
pub mod record;
pub mod run;
pub mod scheduler;
pub mod session;
pub mod sort;
pub mod storage;

pub use channel::{Channel, ChannelCodec, ChannelError, RmpCodec, TextCodec};
pub use distributor::DistributionPolicy;
pub use merger::KWayMerger;
pub use record::{Order, RecordWarning};
pub use scheduler::{MultiwayMode, Strategy};
pub use session::AbortSignal;
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortConfig, SortError, SortStats};
