use std::cell::Cell;

/// Process-wide counters, reported on shutdown and by `apphost` diagnostics.
#[derive(Debug, Default)]
pub struct Stats {
    fork: Cell<u64>,
    event: Cell<u64>,
    req: Cell<u64>,
    res: Cell<u64>,
}

impl Stats {
    pub fn forked(&self) {
        self.fork.set(self.fork.get() + 1);
    }

    pub fn event(&self) {
        self.event.set(self.event.get() + 1);
    }

    pub fn request(&self) {
        self.req.set(self.req.get() + 1);
    }

    pub fn response(&self) {
        self.res.set(self.res.get() + 1);
    }

    /// `(fork, event, req, res)`
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (self.fork.get(), self.event.get(), self.req.get(), self.res.get())
    }
}
