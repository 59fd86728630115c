//! Cyclic 8-bit identifier allocation for request and stream IDs.

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Round-robin issuer of `u8` identifiers.
///
/// [`IdAllocator::next`] hands out the current counter and advances it
/// modulo 256. The allocator itself has no notion of which IDs are live;
/// [`IdAllocator::next_free`] takes an occupancy probe from the owning table
/// and skips IDs still held by a previous occupant.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    // ---
    next: u8,
}

// ---

impl IdAllocator {
    // ---
    /// Request IDs start at 0.
    pub const REQUEST_START: u8 = 0;

    /// Stream IDs start at 1; 0 is the "no stream" sentinel.
    pub const STREAM_START: u8 = 1;

    // ---

    pub fn new(start: u8) -> Self {
        Self { next: start }
    }

    // ---

    /// Return the current value and advance, wrapping 255 → 0.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u8 {
        // ---
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    // ---

    /// Issue the next ID for which `occupied` is false.
    ///
    /// Probes at most 256 values; `None` means every ID is taken.
    pub fn next_free(&mut self, occupied: impl Fn(u8) -> bool) -> Option<u8> {
        // ---
        for _ in 0..=u8::MAX as usize {
            let id = self.next();
            if !occupied(id) {
                return Some(id);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn wraps_at_256() {
        // ---
        let mut ids = IdAllocator::new(254);
        assert_eq!(ids.next(), 254);
        assert_eq!(ids.next(), 255);
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
    }

    // ---

    #[test]
    fn next_free_skips_occupied() {
        // ---
        let mut ids = IdAllocator::new(IdAllocator::STREAM_START);
        let got = ids.next_free(|id| id == 1 || id == 2);
        assert_eq!(got, Some(3));
        assert_eq!(ids.next(), 4);
    }

    // ---

    #[test]
    fn next_free_reports_exhaustion() {
        // ---
        let mut ids = IdAllocator::new(IdAllocator::REQUEST_START);
        assert_eq!(ids.next_free(|_| true), None);
    }
}
