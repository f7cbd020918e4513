//! Fixed-size FIFO window used to assemble bounded result sets
//! ("the last 20 messages before t").

use std::collections::VecDeque;

/// Upper bound on the up-front allocation; larger windows grow on demand
const MAX_PREALLOCATED: usize = 64;

/// Holds at most `capacity` of the most recently pushed items
#[derive(Debug, Clone)]
pub struct FixedWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FixedWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(MAX_PREALLOCATED)),
            capacity,
        }
    }

    /// Push an item, returning whatever fell out of the window
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Push every item of a newer window, evicting the oldest as needed
    pub fn merge(&mut self, newer: FixedWindow<T>) {
        for item in newer.items {
            self.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Items, oldest first
    pub fn into_vec(self) -> Vec<T> {
        self.items.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut window = FixedWindow::new(3);
        assert_eq!(window.push(1), None);
        assert_eq!(window.push(2), None);
        assert_eq!(window.push(3), None);
        assert!(window.is_full());
        assert_eq!(window.push(4), Some(1));
        assert_eq!(window.into_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_merge_keeps_newest() {
        let mut older = FixedWindow::new(4);
        for i in 0..3 {
            older.push(i);
        }
        let mut newer = FixedWindow::new(4);
        for i in 10..13 {
            newer.push(i);
        }

        older.merge(newer);
        assert_eq!(older.len(), 4);
        assert_eq!(older.into_vec(), vec![2, 10, 11, 12]);
    }

    #[test]
    fn test_unbounded_capacity() {
        let mut window = FixedWindow::new(usize::MAX);
        for i in 0..100 {
            assert_eq!(window.push(i), None);
        }
        assert!(!window.is_full());
        assert_eq!(window.len(), 100);
    }

    #[test]
    fn test_zero_capacity() {
        let mut window = FixedWindow::new(0);
        assert_eq!(window.push("a"), Some("a"));
        assert!(window.is_empty());
        assert!(window.is_full());
    }
}
