//! The RTOS boundary.
//!
//! The stack never creates concurrency primitives directly; it asks an
//! injected [`UsbKernel`] for them. This keeps the core independent of any
//! particular RTOS and lets the test suite run it under a simulated,
//! single-threaded scheduler.

use crate::class::ClassInstanceId;
use crate::Result;

/// Event flag word used for thread wake-ups.
pub type EventFlags = u32;

/// Flag signalled to a device core thread when a device-level event is
/// pending.
pub const FLAG_DEVICE_EVENT: EventFlags = 0x0001;

/// Flag signalled to a device core thread when an endpoint event is pending.
pub const FLAG_ENDPOINT_EVENT: EventFlags = 0x0002;

/// Work items the stack (or a class handler) asks the kernel to run.
///
/// The kernel implementation owns the mapping from a task to executable
/// code: on an RTOS target the spawned thread typically reaches the stack
/// through a static cell and loops over
/// [`UsbStack::device_task`](crate::UsbStack::device_task); the simulated
/// test kernel simply records the spawn and lets the test pump events
/// directly.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadTask {
    /// The event pump for one device port.
    DeviceCore(u8),
    /// A worker owned by one class instance (bulk pump, notification pump,
    /// idle-rate reload and similar).
    ClassWorker(ClassInstanceId),
}

/// RTOS primitives consumed by the stack and by class handlers.
///
/// Methods take `&self`: RTOS objects are externally synchronized and the
/// signalling paths run in interrupt context.
pub trait UsbKernel {
    /// Identifies a running thread for signalling.
    type ThreadId: Copy + PartialEq;
    /// Identifies a created semaphore.
    type SemaphoreId: Copy;
    /// Identifies a running periodic timer.
    type TimerId: Copy;

    /// Creates a thread executing `task` and returns its id.
    fn spawn(&self, task: ThreadTask) -> Result<Self::ThreadId>;

    /// Terminates a previously spawned thread.
    fn terminate(&self, thread: Self::ThreadId) -> Result<()>;

    /// Sets event flags on a thread, waking it if it is waiting for any of
    /// them. Callable from interrupt context.
    fn signal(&self, thread: Self::ThreadId, flags: EventFlags);

    /// Blocks the calling thread until any of `flags` is set, then clears
    /// and returns the set flags. `timeout_ms` of `None` waits forever; a
    /// timeout returns 0.
    fn wait_flags(&self, flags: EventFlags, timeout_ms: Option<u32>) -> EventFlags;

    /// Creates a semaphore with the given initial token count.
    fn semaphore_create(&self, initial: u32) -> Result<Self::SemaphoreId>;

    /// Acquires a token, blocking up to `timeout_ms` (`None` waits forever).
    fn semaphore_acquire(&self, sem: Self::SemaphoreId, timeout_ms: Option<u32>) -> Result<()>;

    /// Releases a token. Callable from interrupt context.
    fn semaphore_release(&self, sem: Self::SemaphoreId);

    /// Starts a periodic timer that runs `task` every `period_ms`.
    fn timer_start(&self, task: ThreadTask, period_ms: u32) -> Result<Self::TimerId>;

    /// Stops a periodic timer.
    fn timer_stop(&self, timer: Self::TimerId) -> Result<()>;
}
