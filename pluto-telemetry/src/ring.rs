//! Fixed-capacity rolling buffers feeding sparklines and gauges.
//!
//! A [`RingBuffer`] keeps the most recent `capacity` values in push order. It is
//! shared between the aggregator (the only writer) and the view projection, so
//! both `push` and `snapshot` take `&self` and never expose a half-written state.

use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::{collections::VecDeque, sync::Arc};

/// Default number of points retained per sparkline series.
pub const DEFAULT_HISTORY_CAPACITY: usize = 30;

/// Ring buffer storing the N most recent values.
#[derive(Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: RwLock<VecDeque<T>>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a value, discarding the oldest once capacity is reached.
    pub fn push(&self, value: T) {
        if self.capacity == 0 {
            return;
        }

        let mut items = self.items.write();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(value);
    }

    /// Consistent copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().iter().cloned().collect()
    }

    /// Most recently pushed value.
    pub fn latest(&self) -> Option<T> {
        self.items.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Name of a price series kept in [`PriceHistory`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum Series {
    #[display("btc")]
    Btc,
    /// Account equity, sampled on every successful account poll.
    #[display("equity")]
    Equity,
    #[display("quote:{_0}")]
    Quote(SmolStr),
}

/// Series-keyed collection of `f64` ring buffers sharing one capacity.
#[derive(Debug)]
pub struct PriceHistory {
    capacity: usize,
    series: RwLock<FnvHashMap<Series, Arc<RingBuffer<f64>>>>,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            series: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn push(&self, series: Series, value: f64) {
        self.buffer_or_insert(series).push(value);
    }

    /// Oldest-first copy of a series, empty if it has never been pushed to.
    pub fn snapshot(&self, series: &Series) -> Vec<f64> {
        self.buffer(series)
            .map(|buffer| buffer.snapshot())
            .unwrap_or_default()
    }

    pub fn buffer(&self, series: &Series) -> Option<Arc<RingBuffer<f64>>> {
        self.series.read().get(series).cloned()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffer_or_insert(&self, series: Series) -> Arc<RingBuffer<f64>> {
        if let Some(buffer) = self.buffer(&series) {
            return buffer;
        }

        self.series
            .write()
            .entry(series)
            .or_insert_with(|| Arc::new(RingBuffer::new(self.capacity)))
            .clone()
    }
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let buffer = RingBuffer::new(3);

        for value in [10, 20, 30, 40] {
            buffer.push(value);
        }

        assert_eq!(buffer.snapshot(), vec![20, 30, 40]);
        assert_eq!(buffer.latest(), Some(40));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_ring_buffer_keeps_most_recent_pushes_in_order() {
        for capacity in 1..8 {
            for pushes in 0..20usize {
                let buffer = RingBuffer::new(capacity);
                (0..pushes).for_each(|value| buffer.push(value));

                let expected: Vec<_> = (pushes.saturating_sub(capacity)..pushes).collect();
                let actual = buffer.snapshot();

                assert!(actual.len() <= capacity);
                assert_eq!(actual, expected, "capacity {capacity}, pushes {pushes}");
            }
        }
    }

    #[test]
    fn test_ring_buffer_zero_capacity_discards() {
        let buffer = RingBuffer::new(0);
        buffer.push(1.0);

        assert!(buffer.is_empty());
        assert_eq!(buffer.latest(), None);
    }

    #[test]
    fn test_ring_buffer_concurrent_push_and_snapshot() {
        let buffer = Arc::new(RingBuffer::new(16));

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for value in 0..1_000 {
                        buffer.push(writer * 10_000 + value);
                    }
                })
            })
            .collect();

        for _ in 0..1_000 {
            assert!(buffer.snapshot().len() <= 16);
        }

        writers.into_iter().for_each(|writer| writer.join().unwrap());
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn test_price_history_series_are_independent() {
        let history = PriceHistory::new(2);

        history.push(Series::Btc, 97_000.0);
        history.push(Series::Btc, 97_100.5);
        history.push(Series::Btc, 97_050.25);
        history.push(Series::Quote("AAPL".into()), 178.5);

        assert_eq!(history.snapshot(&Series::Btc), vec![97_100.5, 97_050.25]);
        assert_eq!(history.snapshot(&Series::Quote("AAPL".into())), vec![178.5]);
        assert!(history.snapshot(&Series::Equity).is_empty());
        assert_eq!(Series::Quote("SPY".into()).to_string(), "quote:SPY");
    }
}
