//! Time-ordered merge of measurements from asynchronous producers.
//!
//! Transport threads push under a mutex and return immediately; the
//! orchestrator drains in non-decreasing timestamp order. Equal timestamps
//! order by kind rank then sensor id; a monotone sequence number keeps the
//! merge stable for full ties.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::msg::Message;

struct Entry {
    message: Message,
    seq: u64,
}

impl Entry {
    fn key(&self) -> (f64, u8, u32, u64) {
        (
            self.message.time(),
            self.message.kind_rank(),
            self.message.sensor_id(),
            self.seq,
        )
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest first.
        let (t_a, k_a, s_a, q_a) = self.key();
        let (t_b, k_b, s_b, q_b) = other.key();
        t_b.total_cmp(&t_a)
            .then(k_b.cmp(&k_a))
            .then(s_b.cmp(&s_a))
            .then(q_b.cmp(&q_a))
    }
}

/// Mutex-guarded priority queue over [`Message`]s.
#[derive(Default)]
pub struct TimeOrderedQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimeOrderedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { message, seq });
    }

    /// Removes and returns the earliest message, or `None` when empty.
    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().heap.pop().map(|entry| entry.message)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{FrameSample, ImuSample};
    use nalgebra::{Matrix3, Vector3};

    fn imu(sensor_id: u32, time: f64, driver: bool) -> Message {
        Message::Imu(ImuSample {
            sensor_id,
            time,
            acceleration: Vector3::zeros(),
            acceleration_cov: Matrix3::identity(),
            angular_rate: Vector3::zeros(),
            angular_rate_cov: Matrix3::identity(),
            is_prediction_driver: driver,
        })
    }

    fn frame(sensor_id: u32, time: f64) -> Message {
        Message::Frame(FrameSample {
            sensor_id,
            time,
            features: Vec::new(),
        })
    }

    #[test]
    fn test_pop_is_time_ordered() {
        let queue = TimeOrderedQueue::new();
        queue.push(imu(0, 0.3, false));
        queue.push(imu(0, 0.1, false));
        queue.push(imu(0, 0.2, false));

        let times: Vec<f64> = std::iter::from_fn(|| queue.pop()).map(|m| m.time()).collect();
        assert_eq!(times, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_ties_break_by_kind_then_sensor() {
        let queue = TimeOrderedQueue::new();
        queue.push(frame(1, 1.0));
        queue.push(imu(2, 1.0, false));
        queue.push(imu(0, 1.0, true));
        queue.push(imu(1, 1.0, false));

        let order: Vec<(u8, u32)> = std::iter::from_fn(|| queue.pop())
            .map(|m| (m.kind_rank(), m.sensor_id()))
            .collect();
        assert_eq!(order, vec![(0, 0), (1, 1), (1, 2), (2, 1)]);
    }

    #[test]
    fn test_merge_from_two_producers_is_stable() {
        let queue = TimeOrderedQueue::new();
        for i in 0..5 {
            queue.push(imu(0, i as f64 * 0.01, false));
        }
        for i in 0..5 {
            queue.push(frame(1, i as f64 * 0.025));
        }

        let mut last = f64::NEG_INFINITY;
        while let Some(message) = queue.pop() {
            assert!(message.time() >= last);
            last = message.time();
        }
    }
}
