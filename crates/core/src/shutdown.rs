use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cloneable stop flag shared between a long-running loop and its owner.
///
/// Loops poll [`Shutdown::is_triggered`] at least once per poll interval.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
