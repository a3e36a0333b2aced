use std::cell::Cell;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use timer::{Guard, Timer};

/// An event raised by the background timer thread, destined for the
/// connection's own thread.
///
/// The teacher's blocking client lets its keep-alive timer call straight
/// into the stream (`mqtt-sync-client/src/keepalive.rs`), which is fine
/// there because that stream is `Send` and happy to be touched from another
/// thread. This engine's state lives behind `Rc<RefCell<_>>` and is not
/// `Send` at all, so the timer thread is only ever allowed to hand a plain
/// event across an `mpsc` channel -- it never reaches into `Inner` itself.
/// `ConnectionCore::poll_heartbeat` drains these on the connection's own
/// thread and is the only thing that acts on them.
pub enum HeartbeatEvent {
    WriteIntervalElapsed,
    TimeoutCheck(Instant),
}

/// Schedules PINGREQ writes and the timeout check that follows each one.
pub struct HeartbeatController {
    keep_alive: Duration,
    pinged_at: Cell<Option<Instant>>,
    suspended: Cell<bool>,
    timer: Timer,
    tx: Sender<HeartbeatEvent>,
    rx: Receiver<HeartbeatEvent>,
    write_guard: Option<Guard>,
    timeout_guard: Option<Guard>,
}

impl HeartbeatController {
    pub fn new(keep_alive: Duration) -> Self {
        let (tx, rx) = mpsc::channel();

        HeartbeatController {
            keep_alive,
            pinged_at: Cell::new(None),
            suspended: Cell::new(false),
            timer: Timer::new(),
            tx,
            rx,
            write_guard: None,
            timeout_guard: None,
        }
    }

    fn write_interval(&self) -> Duration {
        self.keep_alive / 2
    }

    /// Re-arms the write-interval timer. Called after anything is written
    /// to the transport, per §4.5 ("a PINGREQ is only ever sent once the
    /// write interval elapses with nothing else having reset it"). A no-op
    /// while suspended -- `resume()` is what restarts the cycle.
    pub fn note_write(&mut self) {
        if self.suspended.get() {
            return;
        }

        let tx = self.tx.clone();
        self.write_guard = Some(self.timer.schedule_with_delay(
            time_delay(self.write_interval()),
            move || {
                // the receiving end may already be gone if the connection
                // was torn down; nothing to do about it from here.
                let _ = tx.send(HeartbeatEvent::WriteIntervalElapsed);
            },
        ));
    }

    /// Whether a PINGREQ is currently awaiting its PINGRESP.
    pub fn is_idle(&self) -> bool {
        self.pinged_at.get().is_none()
    }

    /// Whether the heartbeat is currently paused (§4.5: the heartbeat's
    /// read side tracks the transport's read side).
    pub fn is_suspended(&self) -> bool {
        self.suspended.get()
    }

    /// Marks a PINGREQ as sent at `now` and arms the keep-alive timeout.
    /// A no-op while suspended -- nothing should be waiting on a PINGRESP
    /// that can't be delivered.
    pub fn arm_timeout(&mut self, now: Instant) {
        if self.suspended.get() {
            return;
        }

        self.pinged_at.set(Some(now));

        let tx = self.tx.clone();
        self.timeout_guard = Some(self.timer.schedule_with_delay(time_delay(self.keep_alive), move || {
            let _ = tx.send(HeartbeatEvent::TimeoutCheck(now));
        }));
    }

    /// Pauses the heartbeat in lockstep with the transport's read side.
    /// With reads paused, no PINGRESP can ever arrive, so a PINGREQ sent (or
    /// already awaiting a reply) while suspended could only time out
    /// spuriously: cancels the write-interval and timeout guards and clears
    /// any ping currently awaiting a reply rather than let it do that.
    pub fn suspend(&mut self) {
        self.suspended.set(true);
        self.write_guard = None;
        self.timeout_guard = None;
        self.pinged_at.set(None);
    }

    /// Resumes the heartbeat, restarting the write-interval cycle as though
    /// traffic had just occurred.
    pub fn resume(&mut self) {
        self.suspended.set(false);
        self.note_write();
    }

    /// Whether the PINGREQ sent at `at` is still the one we're waiting on
    /// (a later PONG, or a later PING, may have superseded it).
    pub fn is_still_pending(&self, at: Instant) -> bool {
        self.pinged_at.get() == Some(at)
    }

    pub fn on_pong(&mut self) {
        self.pinged_at.set(None);
        self.timeout_guard = None;
    }

    /// Drains every event raised since the last poll. Non-blocking: meant
    /// to be called whenever the embedder's reactor wakes the connection up
    /// for any reason, not just a timer one.
    pub fn poll_events(&self) -> Vec<HeartbeatEvent> {
        self.rx.try_iter().collect()
    }
}

fn time_delay(d: Duration) -> time::Duration {
    time::Duration::from_std(d).unwrap_or_else(|_| time::Duration::milliseconds(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let hb = HeartbeatController::new(Duration::from_secs(30));
        assert!(hb.is_idle());
    }

    #[test]
    fn arm_timeout_marks_busy_until_pong() {
        let mut hb = HeartbeatController::new(Duration::from_secs(30));
        let now = Instant::now();
        hb.arm_timeout(now);
        assert!(!hb.is_idle());
        assert!(hb.is_still_pending(now));

        hb.on_pong();
        assert!(hb.is_idle());
        assert!(!hb.is_still_pending(now));
    }

    #[test]
    fn a_later_ping_supersedes_an_earlier_timeout_check() {
        let mut hb = HeartbeatController::new(Duration::from_secs(30));
        let first = Instant::now();
        hb.arm_timeout(first);

        let second = first + Duration::from_millis(1);
        hb.arm_timeout(second);

        assert!(!hb.is_still_pending(first));
        assert!(hb.is_still_pending(second));
    }

    #[test]
    fn suspend_clears_a_pending_ping_so_it_cannot_time_out() {
        let mut hb = HeartbeatController::new(Duration::from_secs(30));
        let pinged_at = Instant::now();
        hb.arm_timeout(pinged_at);
        assert!(!hb.is_idle());

        hb.suspend();

        assert!(hb.is_idle());
        assert!(!hb.is_still_pending(pinged_at));
    }

    #[test]
    fn arm_timeout_and_note_write_are_no_ops_while_suspended() {
        let mut hb = HeartbeatController::new(Duration::from_secs(30));
        hb.suspend();

        hb.note_write();
        hb.arm_timeout(Instant::now());

        assert!(hb.is_idle(), "arm_timeout must not take effect while suspended");
    }

    #[test]
    fn resume_restarts_the_write_interval_cycle() {
        let mut hb = HeartbeatController::new(Duration::from_secs(30));
        hb.suspend();
        assert!(hb.is_suspended());

        hb.resume();
        assert!(!hb.is_suspended());

        hb.arm_timeout(Instant::now());
        assert!(!hb.is_idle(), "arming after resume should work normally again");
    }
}
