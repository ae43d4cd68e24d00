//! Binary heap k-way merger.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::channel::RunSink;
use crate::record::Order;
use crate::session::AbortSignal;
use crate::sort::SortError;

/// Element tagged with the index of the source it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged<T> {
    pub value: T,
    pub source: usize,
}

/// Merge comparator: orders tagged heads by value in the configured order,
/// equal values by ascending source index.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadComparator {
    order: Order,
}

impl HeadComparator {
    pub fn new(order: Order) -> Self {
        HeadComparator { order }
    }

    /// Returns [`Ordering::Less`] if `a` must be emitted before `b`.
    pub fn compare<T: Ord>(&self, a: &Tagged<T>, b: &Tagged<T>) -> Ordering {
        self.order
            .compare(&a.value, &b.value)
            .then_with(|| a.source.cmp(&b.source))
    }
}

struct HeapEntry<T> {
    head: Tagged<T>,
    comparator: HeadComparator,
}

impl<T: Ord> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapEntry<T> {}

impl<T: Ord> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // binary heap is max-heap so the comparison is reversed to pop the first head to emit
        self.comparator.compare(&other.head, &self.head)
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of inputs. The heap never holds more than one item per input.
pub struct KWayMerger<T, E, S>
where
    T: Ord,
    S: Iterator<Item = Result<T, E>>,
{
    heads: BinaryHeap<HeapEntry<T>>,
    sources: Vec<S>,
    comparator: HeadComparator,
    initiated: bool,
}

impl<T, E, S> KWayMerger<T, E, S>
where
    T: Ord,
    S: Iterator<Item = Result<T, E>>,
{
    /// Creates an instance of a merger using `sources` as inputs.
    /// Source items should be sorted in `order` otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `sources` - Sorted inputs, their position is used to break ties
    /// * `order` - Order of the inputs and of the output
    pub fn new<I>(sources: I, order: Order) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        let sources = Vec::from_iter(sources);
        let heads = BinaryHeap::with_capacity(sources.len());

        return KWayMerger {
            heads,
            sources,
            comparator: HeadComparator::new(order),
            initiated: false,
        };
    }

    /// Returns the next item together with the index of its source.
    pub fn next_tagged(&mut self) -> Option<Result<Tagged<T>, E>> {
        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.sources.len() {
                if let Err(err) = self.pull(idx) {
                    return Some(Err(err));
                }
            }
        }

        let entry = self.heads.pop()?;
        if let Err(err) = self.pull(entry.head.source) {
            return Some(Err(err));
        }

        return Some(Ok(entry.head));
    }

    fn pull(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.sources[idx].next() {
            self.heads.push(HeapEntry {
                head: Tagged { value: item?, source: idx },
                comparator: self.comparator,
            });
        }

        return Ok(());
    }
}

impl<T, E, S> Iterator for KWayMerger<T, E, S>
where
    T: Ord,
    S: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in the merge order.
    fn next(&mut self) -> Option<Self::Item> {
        self.next_tagged().map(|head| head.map(|head| head.value))
    }
}

/// Merges `sources` into one run of `sink`.
/// The abort signal is checked before every element write. Returns the number of elements written.
pub fn merge_into<T, S, K>(sources: Vec<S>, order: Order, sink: &mut K, abort: &AbortSignal) -> Result<u64, SortError>
where
    T: Ord,
    S: Iterator<Item = Result<T, SortError>>,
    K: RunSink<T>,
{
    let merger = KWayMerger::new(sources, order);
    let mut written = 0;

    sink.start_run()?;
    for item in merger {
        let item = item?;
        abort.check()?;
        sink.push(&item)?;
        written += 1;
    }
    sink.end_run();

    return Ok(written);
}
