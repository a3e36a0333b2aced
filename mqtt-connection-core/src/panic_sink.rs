use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Where a panic raised inside an embedder-supplied `Listener` or refiller
/// callback ends up.
///
/// The engine cannot let such a panic unwind through its own borrow-tracking
/// (`Inner` may be mid-mutation when the callback runs), so every call into
/// embedder code goes through `guard`, which catches the unwind and reports
/// it here instead of propagating it.
pub type FaultSink = Box<dyn Fn(Box<dyn Any + Send>)>;

pub fn default_fault_sink() -> FaultSink {
    Box::new(|payload| {
        log::error!("uncaught panic from listener/refiller: {}", describe_panic(&*payload));
    })
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f`, routing any panic it raises to `sink` instead of letting it
/// unwind into the engine.
pub fn guard<F: FnOnce()>(sink: &FaultSink, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        sink(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn guard_catches_panics_and_reports_them() {
        let caught = Rc::new(RefCell::new(None));
        let caught2 = Rc::clone(&caught);
        let sink: FaultSink = Box::new(move |payload| {
            *caught2.borrow_mut() = Some(describe_panic(&*payload));
        });

        guard(&sink, || panic!("listener blew up"));

        assert_eq!(caught.borrow().as_deref(), Some("listener blew up"));
    }

    #[test]
    fn guard_does_not_invoke_sink_on_success() {
        let invoked = Rc::new(RefCell::new(false));
        let invoked2 = Rc::clone(&invoked);
        let sink: FaultSink = Box::new(move |_| *invoked2.borrow_mut() = true);

        guard(&sink, || {});

        assert!(!*invoked.borrow());
    }
}
