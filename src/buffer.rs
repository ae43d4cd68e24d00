//! Bounded in-memory run buffer.

use rayon;
use rayon::slice::ParallelSliceMut;

use crate::record::Order;

/// Buffer holding at most `capacity` elements of a run being formed.
pub struct RunBuffer<T> {
    capacity: usize,
    inner: Vec<T>,
}

impl<T> RunBuffer<T> {
    /// Creates a buffer with preallocated memory for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        RunBuffer {
            capacity,
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Adds a new element to the buffer.
    pub fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }
}

impl<T: Ord + Send> RunBuffer<T> {
    /// Sorts buffered elements in parallel. The sort is stable.
    /// Runs on the current rayon thread pool.
    pub fn par_sort(&mut self, order: Order) {
        self.inner.par_sort_by(|a, b| order.compare(a, b));
    }
}

impl<T> IntoIterator for RunBuffer<T> {
    type Item = T;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::RunBuffer;
    use crate::record::Order;

    #[test]
    fn test_run_buffer() {
        let mut buffer = RunBuffer::with_capacity(2);

        buffer.push(1);
        assert_eq!(buffer.is_full(), false);
        buffer.push(0);
        assert_eq!(buffer.is_full(), true);

        buffer.par_sort(Order::Asc);
        let data = Vec::from_iter(buffer);
        assert_eq!(data, vec![0, 1]);
    }

    #[test]
    fn test_run_buffer_desc() {
        let mut buffer = RunBuffer::with_capacity(3);
        assert!(buffer.is_empty());
        buffer.push((4, 'a'));
        buffer.push((9, 'b'));
        assert_eq!(buffer.is_full(), false);

        buffer.par_sort(Order::Desc);
        let data = Vec::from_iter(buffer);
        assert_eq!(data, vec![(9, 'b'), (4, 'a')]);
    }
}
