//! Frame-in-flight slot ring.

/// Cycles slot indices as `(prev + 1) mod len`.
///
/// The ring starts on the last slot so the first [`FrameRing::advance`]
/// yields slot 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRing {
    current: usize,
    len: usize,
    frame: u64,
}

impl FrameRing {
    pub fn new(len: usize) -> Self {
        let len = len.max(1);
        Self {
            current: len - 1,
            len,
            frame: 0,
        }
    }

    /// Move to the next slot and return it.
    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.len;
        self.frame += 1;
        self.current
    }

    pub const fn current(&self) -> usize {
        self.current
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Number of advances so far.
    pub const fn frame(&self) -> u64 {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::constants::FRAMES_IN_FLIGHT;

    #[test]
    fn first_advance_is_slot_zero() {
        let mut ring = FrameRing::new(FRAMES_IN_FLIGHT);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.frame(), 1);
    }

    #[test]
    fn slots_wrap_modulo_len() {
        let mut ring = FrameRing::new(3);
        let sequence: Vec<usize> = (0..7).map(|_| ring.advance()).collect();
        assert_eq!(sequence, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn every_step_is_prev_plus_one() {
        let mut ring = FrameRing::new(FRAMES_IN_FLIGHT);
        let mut prev = ring.current();
        for _ in 0..20 {
            let next = ring.advance();
            assert_eq!(next, (prev + 1) % FRAMES_IN_FLIGHT);
            prev = next;
        }
    }

    #[test]
    fn empty_ring_degrades_to_one_slot() {
        let mut ring = FrameRing::new(0);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.advance(), 0);
    }
}
