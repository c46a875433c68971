use std::sync::Mutex;
use std::time::Instant;

/// The machine's periodic timer. The kernel's alarm facility consumes the
/// tick counter and the interrupt hook; the tick source itself is host time.
pub struct Timer {
    start: Instant,
    handler: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            handler: Mutex::new(None),
        }
    }

    /// Microseconds since the machine booted.
    pub fn time(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn set_interrupt_handler(&self, handler: Box<dyn FnMut() + Send>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Delivers one tick to the installed handler, if any.
    pub fn tick(&self) {
        if let Some(handler) = self.handler.lock().unwrap().as_mut() {
            handler();
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("time", &self.time()).finish()
    }
}
