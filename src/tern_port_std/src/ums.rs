//! Cooperative user-mode scheduling on std threads
//!
//! Every worker thread of a [`ThreadGroup`] runs only while the group's
//! [`Scheduler`] has chosen it, so at most one worker thread is running at
//! any instant. A worker thread hands the processor over by calling
//! [`ThreadGroup::yield_now`] after changing the scheduler's decision.
use slab::Slab;
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};
use std::{
    cell::Cell,
    fmt,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc},
    thread,
};


/// Represents a dynamic set of threads that can be scheduled for execution by
/// `Sched: `[`Scheduler`].
pub struct ThreadGroup<Sched> {
    state: Arc<SpinMutex<State<Sched>>>,
}

impl<Sched> Clone for ThreadGroup<Sched> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<Sched> fmt::Debug for ThreadGroup<Sched> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ThreadGroup")
    }
}

/// Object that can be used to join on a [`ThreadGroup`].
#[derive(Debug)]
pub struct ThreadGroupJoinHandle {
    result_recv: mpsc::Receiver<thread::Result<()>>,
}

/// RAII guard returned by [`ThreadGroup::lock`].
pub struct ThreadGroupLockGuard<'a, Sched> {
    state_ref: &'a Arc<SpinMutex<State<Sched>>>,
    guard: SpinMutexGuard<'a, State<Sched>>,
}

/// Identifies a thread in [`ThreadGroup`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ThreadId(usize);

/// Encapsulates the state of a client-supplied user-mode scheduler.
pub trait Scheduler: Send + 'static {
    /// Choose the next thread to run.
    ///
    /// It's an error to return an already-exited thread. The client is
    /// responsible for tracking the lifetime of spawned threads.
    fn choose_next_thread(&mut self) -> Option<ThreadId>;

    /// Called when a thread exits.
    fn thread_exited(&mut self, thread_id: ThreadId) {
        let _ = thread_id;
    }
}

struct State<Sched> {
    threads: Slab<WorkerThread>,
    cur_thread_id: Option<ThreadId>,
    shutting_down: bool,
    result_send: mpsc::Sender<thread::Result<()>>,
    sched: Sched,
}

struct WorkerThread {
    thread: Option<thread::Thread>,
}

/// The panic payload used by [`exit_thread`].
struct ExitThread;

thread_local! {
    /// The worker thread running on the current OS thread.
    static CURRENT_THREAD_ID: Cell<Option<ThreadId>> = Cell::new(None);
}

/// Get the current worker thread.
pub fn current_thread() -> Option<ThreadId> {
    CURRENT_THREAD_ID.with(|x| x.get())
}

/// Terminate the current worker thread by unwinding its stack.
///
/// Panics if the current thread is not a worker thread.
pub fn exit_thread() -> ! {
    assert!(
        current_thread().is_some(),
        "`exit_thread` called from a non-worker thread"
    );
    resume_unwind(Box::new(ExitThread))
}

impl<Sched: Scheduler> ThreadGroup<Sched> {
    /// Construct a new `ThreadGroup` and the corresponding
    /// [`ThreadGroupJoinHandle`].
    pub fn new(sched: Sched) -> (Self, ThreadGroupJoinHandle) {
        let (send, recv) = mpsc::channel();

        let state = Arc::new(SpinMutex::new(State {
            threads: Slab::new(),
            cur_thread_id: None,
            shutting_down: false,
            result_send: send,
            sched,
        }));

        (Self { state }, ThreadGroupJoinHandle { result_recv: recv })
    }

    /// Acquire a lock on the thread group's state.
    pub fn lock(&self) -> ThreadGroupLockGuard<'_, Sched> {
        ThreadGroupLockGuard {
            state_ref: &self.state,
            guard: self.state.lock(),
        }
    }

    /// Let the scheduler decide the next thread to run, and block the
    /// current worker thread until it's chosen again. Returns immediately if
    /// the current thread is chosen.
    ///
    /// If the thread group is shutting down, this terminates the current
    /// thread.
    pub fn yield_now(&self) {
        let thread_id = current_thread()
            .unwrap_or_else(|| panic!("`yield_now` called from a non-worker thread"));

        {
            let mut guard = self.state.lock();
            log::trace!("{thread_id:?} yielded the processor");
            guard.unpark_next_thread();
        }

        self.wait_until_scheduled(thread_id);
    }

    fn wait_until_scheduled(&self, thread_id: ThreadId) {
        loop {
            {
                let guard = self.state.lock();
                if guard.shutting_down {
                    drop(guard);
                    exit_thread();
                }
                if guard.cur_thread_id == Some(thread_id) {
                    return;
                }
            }

            // `park` may return spuriously, hence the loop
            thread::park();
        }
    }

    fn thread_exited(&self, thread_id: ThreadId, result: thread::Result<()>) {
        let mut guard = self.state.lock();
        guard.sched.thread_exited(thread_id);
        guard.threads.remove(thread_id.0);

        match result {
            Ok(()) => log::trace!("{thread_id:?} exited"),
            Err(e) if e.is::<ExitThread>() => log::trace!("{thread_id:?} exited"),
            Err(e) => {
                log::trace!("{thread_id:?} panicked");

                // Send the panic payload to the thread group's owner and
                // tear down the rest
                let _ = guard.result_send.send(Err(e));
                guard.shutdown();
            }
        }

        if guard.shutting_down {
            if guard.threads.is_empty() {
                guard.complete_shutdown();
            }
            return;
        }

        // Invoke the scheduler
        guard.unpark_next_thread();
    }
}

impl ThreadGroupJoinHandle {
    /// Wait for the thread group to shut down. Returns the panic payload of
    /// the first worker thread that panicked, if any.
    pub fn join(self) -> thread::Result<()> {
        // The sender lives as long as the thread group, which outlives
        // every worker thread
        self.result_recv.recv().unwrap_or(Ok(()))
    }
}

impl<'a, Sched: Scheduler> ThreadGroupLockGuard<'a, Sched> {
    /// Start a worker thread.
    ///
    /// This does not automatically schedule the spawned thread. You should
    /// store the obtained `ThreadId` in the contained `Sched: `[`Scheduler`]
    /// and have it chosen by [`Scheduler::choose_next_thread`] for the thread
    /// to actually run.
    pub fn spawn(&mut self, f: impl FnOnce(ThreadId) + Send + 'static) -> ThreadId {
        let group = ThreadGroup {
            state: Arc::clone(self.state_ref),
        };

        let thread_id = ThreadId(self.guard.threads.insert(WorkerThread { thread: None }));

        let join_handle = thread::Builder::new()
            .name(format!("worker {}", thread_id.0))
            .spawn(move || {
                CURRENT_THREAD_ID.with(|x| x.set(Some(thread_id)));

                let result = catch_unwind(AssertUnwindSafe(|| {
                    // Block the spawned thread until scheduled to run
                    group.wait_until_scheduled(thread_id);

                    f(thread_id);
                }));

                group.thread_exited(thread_id, result);
            })
            .unwrap_or_else(|e| panic!("failed to spawn a worker thread: {e}"));

        // The new thread can't observe the slot before we release the lock
        self.guard.threads[thread_id.0].thread = Some(join_handle.thread().clone());

        log::trace!("created {thread_id:?}");

        thread_id
    }

    /// Let the scheduler decide the next thread to run and wake it up.
    ///
    /// This doesn't suspend a running worker thread. It's meant for starting
    /// the thread group from outside.
    pub fn preempt(&mut self) {
        assert!(
            current_thread().is_none(),
            "this method cannot be called from a worker thread"
        );
        self.guard.unpark_next_thread();
    }

    /// Terminate the thread group. Every worker thread exits the next time
    /// it waits to be scheduled, and [`ThreadGroupJoinHandle::join`] returns
    /// once all of them have. A worker thread calling this should call
    /// [`exit_thread`] afterwards.
    pub fn shutdown(&mut self) {
        self.guard.shutdown();
        if self.guard.threads.is_empty() {
            self.guard.complete_shutdown();
        }
    }

    /// Get a flag indicating whether [`Self::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.guard.shutting_down
    }

    /// Get a mutable reference to the contained `Sched: `[`Scheduler`].
    pub fn scheduler(&mut self) -> &mut Sched {
        &mut self.guard.sched
    }
}

impl<Sched: Scheduler> State<Sched> {
    /// Find the next thread to run and unpark that thread.
    fn unpark_next_thread(&mut self) {
        self.cur_thread_id = self.sched.choose_next_thread();
        log::trace!("scheduling {:?}", self.cur_thread_id);
        if let Some(thread_id) = self.cur_thread_id {
            let worker = self
                .threads
                .get(thread_id.0)
                .unwrap_or_else(|| panic!("the scheduler chose an exited thread {thread_id:?}"));
            if let Some(thread) = &worker.thread {
                thread.unpark();
            }
        }
    }

    fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        log::trace!(
            "shutdown requested, {} thread(s) remaining",
            self.threads.len()
        );
        self.shutting_down = true;
        self.cur_thread_id = None;
        for (_, worker) in self.threads.iter() {
            if let Some(thread) = &worker.thread {
                thread.unpark();
            }
        }
    }

    fn complete_shutdown(&mut self) {
        assert!(self.threads.is_empty());
        log::trace!("shutdown is complete");

        // Ignore if the receiver has already hung up
        let _ = self.result_send.send(Ok(()));
    }
}
