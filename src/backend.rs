use crate::types::DeviceId;
use parking_lot::{Condvar, Mutex};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Opaque completion handle returned for every dispatched unit of work.
pub trait CompletionEvent: Send + 'static {
    /// Non-blocking completion query.
    fn is_complete(&self) -> bool;
    /// Block the calling thread until the work has completed.
    fn wait(&self);
}

/// A kernel closure as handed to [`Backend::submit`].
pub type Kernel<B> = Box<dyn FnOnce(&mut <B as Backend>::Handler) + Send>;

/// Accelerator layer the runtime dispatches kernels to.
///
/// `submit` is expected to return promptly: asynchronous backends enqueue the
/// kernel and hand back an event that completes later.
pub trait Backend: Send + Sync + 'static {
    /// Completion handle for submitted kernels and host calls.
    type Event: CompletionEvent;
    /// Device-submission context handed to kernel closures.
    type Handler;

    /// Enqueue `kernel` on the device.
    fn submit(&self, kernel: Kernel<Self>) -> Self::Event;

    /// Device the kernels run on.
    fn device(&self) -> DeviceId;
}

#[derive(Debug, Default)]
struct SignalState {
    done: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Manually triggered completion event.
///
/// Cheap to clone; all clones observe the same completion.
#[derive(Debug, Clone, Default)]
pub struct Signal(Arc<SignalState>);

/// Completes the [`Signal`] it was created with.
#[derive(Debug)]
pub struct Trigger(Arc<SignalState>);

impl Signal {
    /// A signal that has already completed.
    pub fn ready() -> Self {
        let signal = Self::default();
        signal.0.done.store(true, Ordering::Release);
        signal
    }

    /// An incomplete signal plus the trigger that completes it.
    pub fn pending() -> (Self, Trigger) {
        let state = Arc::new(SignalState::default());
        (Self(state.clone()), Trigger(state))
    }
}

impl Trigger {
    pub fn fire(self) {
        let state = &self.0;
        let _guard = state.lock.lock();
        state.done.store(true, Ordering::Release);
        state.cond.notify_all();
    }
}

impl CompletionEvent for Signal {
    fn is_complete(&self) -> bool {
        self.0.done.load(Ordering::Acquire)
    }

    fn wait(&self) {
        let state = &self.0;
        if state.done.load(Ordering::Acquire) {
            return;
        }
        let mut guard = state.lock.lock();
        while !state.done.load(Ordering::Acquire) {
            state.cond.wait(&mut guard);
        }
    }
}

/// Submission context of [`InlineBackend`].
#[derive(Debug)]
pub struct HostHandler {
    device: DeviceId,
}

impl HostHandler {
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// Backend that runs kernels synchronously on the submitting worker.
///
/// Every event it returns is already complete, so a graph on this backend
/// behaves like a plain CPU task pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineBackend;

impl Backend for InlineBackend {
    type Event = Signal;
    type Handler = HostHandler;

    fn submit(&self, kernel: Kernel<Self>) -> Signal {
        let mut handler = HostHandler {
            device: DeviceId::Host,
        };
        kernel(&mut handler);
        Signal::ready()
    }

    fn device(&self) -> DeviceId {
        DeviceId::Host
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn pending_signal_completes_on_fire() {
        let (signal, trigger) = Signal::pending();
        assert!(!signal.is_complete());
        let clone = signal.clone();
        trigger.fire();
        assert!(signal.is_complete());
        assert!(clone.is_complete());
    }

    #[test]
    fn wait_blocks_until_fired_from_another_thread() {
        let (signal, trigger) = Signal::pending();
        let firing = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.fire();
        });
        signal.wait();
        assert!(signal.is_complete());
        firing.join().unwrap();
    }

    #[test]
    fn inline_backend_runs_kernel_before_returning() {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let event = InlineBackend.submit(Box::new(move |handler: &mut HostHandler| {
            *sink.lock() = Some(handler.device());
        }));
        assert!(event.is_complete());
        assert_eq!(*slot.lock(), Some(DeviceId::Host));
    }
}
