//! Response barrier
//!
//! Counts replies from a known set of devices and opens exactly once, on the
//! reply that completes the set. Replies are keyed by address, so the order
//! they arrive in does not matter and a device answering twice is counted
//! once. After opening the barrier resets and can be reused.

use std::collections::HashSet;

/// What an arrival did to the barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Still waiting for other devices
    Pending,
    /// This arrival completed the set
    Opened,
    /// Address was already counted or is not expected
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ResponseBarrier {
    expected: HashSet<String>,
    arrived: HashSet<String>,
    openings: usize,
}

impl ResponseBarrier {
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: expected.into_iter().map(Into::into).collect(),
            arrived: HashSet::new(),
            openings: 0,
        }
    }

    pub fn arrived_count(&self) -> usize {
        self.arrived.len()
    }

    /// How many times the barrier has opened since creation
    pub fn openings(&self) -> usize {
        self.openings
    }

    pub fn arrive(&mut self, address: &str) -> Arrival {
        if !self.expected.contains(address) || self.arrived.contains(address) {
            return Arrival::Ignored;
        }
        self.arrived.insert(address.to_string());
        if self.arrived.len() == self.expected.len() {
            self.openings += 1;
            self.arrived.clear();
            Arrival::Opened
        } else {
            Arrival::Pending
        }
    }

    /// Expected addresses that have not replied yet
    pub fn missing(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .expected
            .difference(&self.arrived)
            .cloned()
            .collect();
        missing.sort();
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_on_nth_arrival_in_any_order() {
        let orders = [["A", "B", "C"], ["C", "A", "B"], ["B", "C", "A"]];
        for order in orders {
            let mut barrier = ResponseBarrier::new(["A", "B", "C"]);
            assert_eq!(barrier.arrive(order[0]), Arrival::Pending);
            assert_eq!(barrier.arrive(order[1]), Arrival::Pending);
            assert_eq!(barrier.arrive(order[2]), Arrival::Opened);
            assert_eq!(barrier.openings(), 1);
        }
    }

    #[test]
    fn test_duplicate_and_unknown_arrivals_ignored() {
        let mut barrier = ResponseBarrier::new(["A", "B"]);
        assert_eq!(barrier.arrive("A"), Arrival::Pending);
        assert_eq!(barrier.arrive("A"), Arrival::Ignored);
        assert_eq!(barrier.arrive("Z"), Arrival::Ignored);
        assert_eq!(barrier.missing(), vec!["B".to_string()]);
        assert_eq!(barrier.arrive("B"), Arrival::Opened);
    }

    #[test]
    fn test_reusable_after_opening() {
        let mut barrier = ResponseBarrier::new(["A"]);
        assert_eq!(barrier.arrive("A"), Arrival::Opened);
        assert_eq!(barrier.arrived_count(), 0);
        assert_eq!(barrier.arrive("A"), Arrival::Opened);
        assert_eq!(barrier.openings(), 2);
    }
}
