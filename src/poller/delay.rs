/// Idle backoff for the poll loop, counted in poll units.
///
/// Any processed message resets it to zero; every idle cycle adds one unit
/// up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveDelay {
    current: u32,
    max: u32,
}

impl AdaptiveDelay {
    pub fn new(max: u32) -> Self {
        Self { current: 0, max }
    }
    pub fn next(&mut self, processed: usize) -> u32 {
        self.current = if processed > 0 {
            0
        } else {
            self.current.saturating_add(1).min(self.max)
        };
        self.current
    }
    pub fn current(&self) -> u32 {
        self.current
    }
}
