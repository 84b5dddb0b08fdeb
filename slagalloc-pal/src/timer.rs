//! Background timer thread used to drive `SystemPal::register_timer`.
//!
//! Userspace has no equivalent of the interrupt-driven tick the original
//! allocator's PAL layer can rely on in some embedded/kernel targets, so
//! `SystemPal` spawns a single lazily-started daemon thread that sleeps for
//! the registered period and then invokes the callback. Only one callback
//! is supported at a time, which is all the core allocator's decay logic
//! needs (it reschedules its own epoch advance from inside the callback).

use spin::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

static SLOT: Mutex<Option<fn()>> = Mutex::new(None);
static PERIOD_NANOS: AtomicUsize = AtomicUsize::new(0);
static THREAD: Once<()> = Once::new();

pub fn register(period: Duration, callback: fn()) {
    *SLOT.lock().unwrap() = Some(callback);
    PERIOD_NANOS.store(period.as_nanos() as usize, Ordering::Release);

    THREAD.call_once(|| {
        thread::Builder::new()
            .name("slagalloc-decay-timer".into())
            .spawn(run)
            .expect("failed to spawn decay timer thread");
    });
}

fn run() {
    loop {
        let nanos = PERIOD_NANOS.load(Ordering::Acquire);
        let sleep_for = if nanos == 0 {
            Duration::from_millis(500)
        } else {
            Duration::from_nanos(nanos as u64)
        };
        thread::sleep(sleep_for);
        if let Some(cb) = *SLOT.lock().unwrap() {
            cb();
        }
    }
}
