use std::collections::{HashMap, VecDeque};

/// In-memory bounded FIFO queues keyed by name (instrument or
/// "transactions"). When a queue reaches its cap the oldest entry is
/// evicted before the new one is pushed.
#[derive(Debug)]
pub struct StreamQueue {
    queues: HashMap<String, VecDeque<String>>,
    max_length: usize,
}

impl StreamQueue {
    pub fn new(max_length: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_length,
        }
    }

    pub fn push(&mut self, key: &str, value: String) {
        // A zero cap admits nothing; without this guard the eviction loop
        // below would never terminate.
        if self.max_length == 0 {
            return;
        }
        let queue = self.queues.entry(key.to_string()).or_default();
        while queue.len() >= self.max_length {
            queue.pop_front();
        }
        queue.push_back(value);
    }

    pub fn len(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    pub fn items(&self, key: &str) -> Vec<&str> {
        self.queues
            .get(key)
            .map(|q| q.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest_past_cap() {
        let mut queue = StreamQueue::new(3);
        for i in 0..4 {
            queue.push("EUR_USD", format!("tick-{i}"));
        }
        assert_eq!(queue.len("EUR_USD"), 3);
        assert_eq!(queue.items("EUR_USD"), vec!["tick-1", "tick-2", "tick-3"]);
    }

    #[test]
    fn test_zero_cap_drops_everything() {
        let mut queue = StreamQueue::new(0);
        queue.push("EUR_USD", "tick".to_string());
        assert!(queue.is_empty("EUR_USD"));
        assert_eq!(queue.items("EUR_USD"), Vec::<&str>::new());
    }

    #[test]
    fn test_keys_are_independent() {
        let mut queue = StreamQueue::new(2);
        queue.push("EUR_USD", "a".to_string());
        queue.push("transactions", "b".to_string());
        assert_eq!(queue.len("EUR_USD"), 1);
        assert_eq!(queue.len("transactions"), 1);
        assert!(queue.is_empty("USD_JPY"));
        queue.clear();
        assert!(queue.is_empty("EUR_USD"));
    }
}
