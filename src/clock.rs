use std::time::Instant;

/// Shared monotonic clock. All protocol timing is expressed as milliseconds since the
///  owning host was created, so timestamps fit in a u64 and can be stored in atomics.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock { epoch: Instant::now() }
    }

    pub fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}
