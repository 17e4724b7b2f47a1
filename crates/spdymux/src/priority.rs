use std::collections::VecDeque;

/// Priority of a stream or stream request. Higher variants are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestPriority {
    Throttled,
    Idle,
    #[default]
    Lowest,
    Low,
    Medium,
    Highest,
}

impl RequestPriority {
    pub const COUNT: usize = 6;

    /// All priorities, most urgent first
    pub const HIGHEST_FIRST: [Self; Self::COUNT] = [
        Self::Highest,
        Self::Medium,
        Self::Low,
        Self::Lowest,
        Self::Idle,
        Self::Throttled,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Wire weight octet for a HEADERS priority block (weight - 1).
    ///
    /// Spreads the priorities over 1..=256 the same way SPDY/3 priorities
    /// 0..=7 map onto HTTP/2 weights.
    pub fn wire_weight(self) -> u8 {
        let spdy3 = (Self::COUNT - 1 - self.index()) as u32;
        // 255.9 / 7 steps per SPDY/3 priority level
        let weight = (7 - spdy3) * 2559 / 70 + 1;
        (weight - 1) as u8
    }
}

/// FIFO queues, one per priority level, drained highest priority first.
pub(crate) struct PriorityQueue<T> {
    queues: [VecDeque<T>; RequestPriority::COUNT],
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            queues: Default::default(),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub(crate) fn push_back(&mut self, priority: RequestPriority, item: T) {
        self.queues[priority.index()].push_back(item);
    }

    pub(crate) fn push_front(&mut self, priority: RequestPriority, item: T) {
        self.queues[priority.index()].push_front(item);
    }

    /// Removes the oldest item of the most urgent non-empty level
    pub(crate) fn pop(&mut self) -> Option<(RequestPriority, T)> {
        for priority in RequestPriority::HIGHEST_FIRST {
            if let Some(item) = self.queues[priority.index()].pop_front() {
                return Some((priority, item));
            }
        }
        None
    }

    pub(crate) fn retain(&mut self, mut f: impl FnMut(&T) -> bool) {
        for q in self.queues.iter_mut() {
            q.retain(&mut f);
        }
    }

    pub(crate) fn contains(&self, mut f: impl FnMut(&T) -> bool) -> bool {
        self.queues.iter().any(|q| q.iter().any(&mut f))
    }

    /// Empties every level, most urgent first
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        while let Some((_, item)) = self.pop() {
            out.push(item);
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pops_highest_first_fifo_within_level() {
        let mut q = PriorityQueue::default();
        q.push_back(RequestPriority::Lowest, "l1");
        q.push_back(RequestPriority::Highest, "h1");
        q.push_back(RequestPriority::Lowest, "l2");
        q.push_back(RequestPriority::Medium, "m1");
        q.push_back(RequestPriority::Highest, "h2");

        let order: Vec<_> = q.drain();
        assert_eq!(order, vec!["h1", "h2", "m1", "l1", "l2"]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn retain_keeps_order() {
        let mut q = PriorityQueue::default();
        q.push_back(RequestPriority::Low, 1);
        q.push_back(RequestPriority::Idle, 2);
        q.push_back(RequestPriority::Low, 3);
        q.retain(|&x| x != 1);

        assert_eq!(q.len(), 2);
        assert!(q.contains(|&x| x == 2));
        assert!(!q.contains(|&x| x == 1));
        assert_eq!(q.pop(), Some((RequestPriority::Low, 3)));
        assert_eq!(q.pop(), Some((RequestPriority::Idle, 2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_front_jumps_the_level() {
        let mut q = PriorityQueue::default();
        q.push_back(RequestPriority::Low, 1);
        q.push_front(RequestPriority::Low, 0);
        assert_eq!(q.pop(), Some((RequestPriority::Low, 0)));
    }

    #[test]
    fn weights_are_ordered() {
        assert_eq!(RequestPriority::Highest.wire_weight(), 255);
        let weights: Vec<_> = RequestPriority::HIGHEST_FIRST
            .iter()
            .map(|p| p.wire_weight())
            .collect();
        assert!(weights.windows(2).all(|w| w[0] > w[1]), "{weights:?}");
    }
}
