use crossbeam::utils::Backoff;

/// Bounds how long a helper keeps polling for work that has not shown up yet.
///
/// Every unproductive call to [`SpinLimiter::spin`] backs off a little longer. Once the limit
/// is reached `spin` returns false and the caller should park instead. Progress resets it.
pub struct SpinLimiter {
    limit: usize,
    spins: usize,
    backoff: Backoff,
}

impl SpinLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            spins: 0,
            backoff: Backoff::new(),
        }
    }

    /// Returns true if the caller may try again. The first call never waits.
    pub fn spin(&mut self) -> bool {
        if self.spins >= self.limit {
            return false;
        }
        if self.spins > 0 {
            self.backoff.snooze();
        }
        self.spins += 1;
        true
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.backoff.reset();
    }
}
