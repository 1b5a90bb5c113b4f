use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier assigned by the native layer when a client is created.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ClientId(pub i32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Identifier correlating a request with its response.
///
/// `QueryId(0)` is reserved for unsolicited updates and is never issued by
/// [`QueryIdAllocator`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct QueryId(pub u64);

impl QueryId {
    /// Event id carried by push updates.
    pub const UNSOLICITED: QueryId = QueryId(0);

    pub fn is_unsolicited(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock-free source of query ids shared by every client of a manager.
///
/// Counts up from 1 and wraps from `u64::MAX` back to 1, skipping 0.
#[derive(Debug, Default)]
pub struct QueryIdAllocator {
    current: AtomicU64,
}

impl QueryIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `current`; the next issued id is `current + 1`
    /// (or 1 when `current` is `u64::MAX`).
    pub fn starting_after(current: u64) -> Self {
        Self {
            current: AtomicU64::new(current),
        }
    }

    pub fn next(&self) -> QueryId {
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(Self::successor(value))
            })
            // the closure never returns None
            .unwrap_or_else(|value| value);
        QueryId(Self::successor(previous))
    }

    fn successor(value: u64) -> u64 {
        if value == u64::MAX { 1 } else { value + 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn first_id_is_one() {
        let allocator = QueryIdAllocator::new();
        assert_eq!(allocator.next(), QueryId(1));
        assert_eq!(allocator.next(), QueryId(2));
    }

    #[test]
    fn wraps_from_max_to_one() {
        let allocator = QueryIdAllocator::starting_after(u64::MAX - 1);
        assert_eq!(allocator.next(), QueryId(u64::MAX));
        assert_eq!(allocator.next(), QueryId(1));
        assert_eq!(allocator.next(), QueryId(2));
    }

    #[test]
    fn at_max_next_is_one() {
        let allocator = QueryIdAllocator::starting_after(u64::MAX);
        assert_eq!(allocator.next(), QueryId(1));
    }

    #[test]
    fn concurrent_ids_are_distinct_and_nonzero() {
        let allocator = Arc::new(QueryIdAllocator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || (0..1000).map(|_| allocator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for id in thread.join().unwrap() {
                assert!(!id.is_unsolicited());
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn display_formats() {
        assert_eq!(ClientId(7).to_string(), "client-7");
        assert_eq!(QueryId(42).to_string(), "42");
        assert!(QueryId::UNSOLICITED.is_unsolicited());
    }
}
