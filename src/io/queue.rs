//! Synchronized FIFO queue feeding the stripe worker threads.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct TaskQueue<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
    }

    pub fn safepop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo() {
        let q = TaskQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.safepop(), Some(1));
        assert_eq!(q.safepop(), Some(2));
        assert_eq!(q.safepop(), None);
    }
}
