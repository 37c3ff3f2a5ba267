use std::time::Duration;

/// Settle-delay provider for the training loops
pub trait Delay: Send + Sync {
    fn wait(&self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn wait(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Returns immediately; used against simulated links
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn wait(&self, _duration: Duration) {}
}
