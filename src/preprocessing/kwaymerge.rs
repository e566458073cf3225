//! K-way merge of sorted sources via a binary min-heap.

use crate::error::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub trait MergeSource<T> {
    fn has_more(&self) -> bool;
    fn next(&mut self) -> Result<T>;
}

pub trait MergeSink<T> {
    fn add(&mut self, value: T) -> Result<()>;
    fn done(&mut self) -> Result<()>;
}

struct HeapItem<T, K: Ord> {
    key: K,
    source: usize,
    value: T,
}

impl<T, K: Ord> PartialEq for HeapItem<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl<T, K: Ord> Eq for HeapItem<T, K> {}

impl<T, K: Ord> PartialOrd for HeapItem<T, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, K: Ord> Ord for HeapItem<T, K> {
    // Reversed: BinaryHeap is a max-heap, we need the minimum key first.
    // Ties break on source index so merges are deterministic.
    fn cmp(&self, other: &Self) -> Ordering {
        (&other.key, other.source).cmp(&(&self.key, self.source))
    }
}

/// Merges `sources` (each sorted by `key`) into `sink`, which receives a
/// non-decreasing key stream. Calls `sink.done()` at exhaustion.
pub fn merge<T, K, S, Snk, F>(mut sources: Vec<S>, sink: &mut Snk, key: F) -> Result<()>
where
    K: Ord,
    S: MergeSource<T>,
    Snk: MergeSink<T>,
    F: Fn(&T) -> K,
{
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (i, source) in sources.iter_mut().enumerate() {
        if source.has_more() {
            let value = source.next()?;
            heap.push(HeapItem {
                key: key(&value),
                source: i,
                value,
            });
        }
    }
    while let Some(item) = heap.pop() {
        sink.add(item.value)?;
        let source = &mut sources[item.source];
        if source.has_more() {
            let value = source.next()?;
            heap.push(HeapItem {
                key: key(&value),
                source: item.source,
                value,
            });
        }
    }
    sink.done()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSource(std::vec::IntoIter<u32>, Option<u32>);

    impl VecSource {
        fn new(values: Vec<u32>) -> Self {
            let mut iter = values.into_iter();
            let head = iter.next();
            VecSource(iter, head)
        }
    }

    impl MergeSource<u32> for VecSource {
        fn has_more(&self) -> bool {
            self.1.is_some()
        }

        fn next(&mut self) -> Result<u32> {
            let head = self.1.take().unwrap();
            self.1 = self.0.next();
            Ok(head)
        }
    }

    struct VecSink(Vec<u32>, bool);

    impl MergeSink<u32> for VecSink {
        fn add(&mut self, value: u32) -> Result<()> {
            self.0.push(value);
            Ok(())
        }

        fn done(&mut self) -> Result<()> {
            self.1 = true;
            Ok(())
        }
    }

    #[test]
    fn test_merge_three_ways() {
        let sources = vec![
            VecSource::new(vec![1, 4, 7]),
            VecSource::new(vec![2, 2, 8]),
            VecSource::new(vec![0, 9]),
        ];
        let mut sink = VecSink(Vec::new(), false);
        merge(sources, &mut sink, |&v| v).unwrap();
        assert_eq!(sink.0, vec![0, 1, 2, 2, 4, 7, 8, 9]);
        assert!(sink.1);
    }

    #[test]
    fn test_merge_empty_sources() {
        let sources: Vec<VecSource> = vec![VecSource::new(vec![]), VecSource::new(vec![3])];
        let mut sink = VecSink(Vec::new(), false);
        merge(sources, &mut sink, |&v| v).unwrap();
        assert_eq!(sink.0, vec![3]);
    }
}
