/// Guard that runs a closure when dropped, unless it was disarmed.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> DeferGuard<F> {
    /// Drops the closure without running it.
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers `f` until the returned guard goes out of scope.
///
/// This also covers unwinding and futures that are dropped before completion.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_disarm() {
        let ran = Cell::new(false);
        defer(|| ran.set(true)).disarm();
        assert!(!ran.get());
    }
}
