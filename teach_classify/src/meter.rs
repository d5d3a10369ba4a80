use std::sync::atomic::{AtomicU64, Ordering};

/// Accounting for every live tensor buffer of the process.
pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    live_buffers: AtomicU64,
    peak_buffers: AtomicU64,
    allocations: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            live_buffers: AtomicU64::new(0),
            peak_buffers: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    pub fn tick_alloc(&self) {
        let live = self.live_buffers.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_buffers.fetch_max(live, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_release(&self) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Buffers allocated and not yet released.
    pub fn live(&self) -> u64 {
        self.live_buffers.load(Ordering::Relaxed)
    }

    /// Highest live count since the last [`Meter::reset_peak`].
    pub fn peak(&self) -> u64 {
        self.peak_buffers.load(Ordering::Relaxed)
    }

    /// Buffers allocated since process start.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reset_peak(&self) {
        self.peak_buffers.store(self.live(), Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        log::debug!(
            "Tensor buffers: {} live, {} peak, {} allocated",
            self.live(),
            self.peak(),
            self.allocations()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peak_follows_live_count() {
        let meter = Meter::new();
        meter.tick_alloc();
        meter.tick_alloc();
        meter.tick_release();

        assert_eq!(meter.live(), 1);
        assert_eq!(meter.peak(), 2);
        assert_eq!(meter.allocations(), 2);

        meter.reset_peak();
        assert_eq!(meter.peak(), 1);
    }
}
