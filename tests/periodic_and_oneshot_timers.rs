//! End-to-end coverage for SPEC_FULL.md §8 scenario 6: a periodic timer
//! fires a bounded number of times, then a one-shot timer cancels it and
//! fires itself exactly once, after which the loop goes idle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netreactor::event_loop::EventLoop;
use netreactor::timer::TimerId;

#[test]
fn periodic_timer_fires_bounded_times_then_one_shot_cancels_it() {
    let mut ev = EventLoop::new("timer-scenario").unwrap();
    let handle = ev.handle();

    let periodic_fires = Arc::new(AtomicUsize::new(0));
    let one_shot_fires = Arc::new(AtomicUsize::new(0));
    let periodic_id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let periodic_fires_cb = periodic_fires.clone();
    let id = handle.run_every_timer(Duration::from_millis(15), move || {
        periodic_fires_cb.fetch_add(1, Ordering::SeqCst);
    });
    *periodic_id_slot.lock().unwrap() = Some(id);

    let periodic_id_for_cancel = periodic_id_slot.clone();
    let one_shot_fires_cb = one_shot_fires.clone();
    let stop_handle = handle.clone();
    handle.run_after_timer(Duration::from_millis(80), move || {
        one_shot_fires_cb.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = *periodic_id_for_cancel.lock().unwrap() {
            stop_handle.cancel_timer(id);
        }
    });

    let stop_handle2 = handle.clone();
    handle.run_after_timer(Duration::from_millis(200), move || {
        EventLoop::stop(&stop_handle2);
    });

    ev.run();

    let fires = periodic_fires.load(Ordering::SeqCst);
    assert!(fires >= 4 && fires <= 6, "expected roughly 5 periodic fires before cancellation, got {fires}");
    assert_eq!(one_shot_fires.load(Ordering::SeqCst), 1, "the one-shot timer must fire exactly once");

    // Cancelling an id that has already fired and been removed is a no-op.
    let stale_id = periodic_id_slot.lock().unwrap().unwrap();
    handle.cancel_timer(stale_id);
}
