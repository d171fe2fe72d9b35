//! Bounded output history.
//!
//! Every output frame a session produces is retained here so a connection that
//! attaches late can be brought up to date before it sees live output.

use std::collections::VecDeque;

use protocol::Frame;

/// Default number of frames retained per session.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// FIFO buffer of output frames with a fixed capacity.
///
/// Once full, each append evicts the oldest frame.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
    evicted: u64,
}

impl HistoryBuffer {
    /// Creates an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Appends a frame, evicting the oldest one if the buffer is full.
    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.evicted += 1;
        }
        self.frames.push_back(frame);
    }

    /// Iterates retained frames from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of frames dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_of(frame: &Frame) -> &str {
        match frame {
            Frame::Output(output) => &output.data,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_push_within_capacity_keeps_order() {
        let mut history = HistoryBuffer::new(4);
        for i in 0..3 {
            history.push(Frame::output("s", format!("chunk-{}", i)));
        }
        let data: Vec<_> = history.iter().map(data_of).collect();
        assert_eq!(data, vec!["chunk-0", "chunk-1", "chunk-2"]);
        assert_eq!(history.evicted(), 0);
    }

    #[test]
    fn test_fifo_eviction_when_full() {
        let mut history = HistoryBuffer::new(3);
        for i in 0..5 {
            history.push(Frame::output("s", format!("chunk-{}", i)));
            assert!(history.len() <= history.capacity());
        }
        let data: Vec<_> = history.iter().map(data_of).collect();
        assert_eq!(data, vec!["chunk-2", "chunk-3", "chunk-4"]);
        assert_eq!(history.evicted(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut history = HistoryBuffer::new(0);
        assert_eq!(history.capacity(), 1);
        history.push(Frame::output("s", "a"));
        history.push(Frame::output("s", "b"));
        assert_eq!(history.len(), 1);
        assert_eq!(data_of(history.iter().next().unwrap()), "b");
    }

    #[test]
    fn test_default_capacity() {
        let history = HistoryBuffer::default();
        assert!(history.is_empty());
        assert_eq!(history.capacity(), DEFAULT_HISTORY_CAPACITY);
    }
}
