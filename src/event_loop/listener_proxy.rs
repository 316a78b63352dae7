//! Inverse of [`super::sink_proxy`]: lets a loop-bound listener receive
//! `on_can_put` callbacks triggered from another thread (spec §4.D:
//! "posts a message to the loop so a loop-bound listener receives
//! `on_can_put` in the correct thread").

use std::sync::Arc;

use super::{EventLoopHandle, Message};
use crate::port::SinkListener;
use crate::time::Duration;

/// `Send`-safe handle a foreign thread calls into; internally posts a
/// message so the real, loop-bound listener's `on_can_put` always runs
/// on the loop thread (spec §7's loop-affinity invariant).
#[derive(Clone)]
pub struct ListenerProxy {
    loop_handle: EventLoopHandle,
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl ListenerProxy {
    /// `notify` is invoked on the loop thread; it should call
    /// `on_can_put` on the real, loop-bound listener it closes over.
    pub fn new(loop_handle: EventLoopHandle, notify: Arc<dyn Fn() + Send + Sync>) -> ListenerProxy {
        ListenerProxy { loop_handle, notify }
    }
}

impl SinkListener for ListenerProxy {
    fn on_can_put(&mut self) {
        let notify = self.notify.clone();
        let _ = self
            .loop_handle
            .post_message(Message::Call(Box::new(move || notify())), Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[test]
    fn on_can_put_is_delivered_on_the_loop_thread() {
        let mut event_loop = EventLoop::new(4).unwrap();
        let handle = event_loop.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let mut proxy = ListenerProxy::new(
            handle.clone(),
            Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let terminate = handle.clone();
        let worker = std::thread::spawn(move || {
            proxy.on_can_put();
            std::thread::sleep(StdDuration::from_millis(20));
            terminate
                .post_message(terminate.termination_message(), Duration::from_secs(1))
                .unwrap();
        });

        event_loop.run().unwrap();
        worker.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
