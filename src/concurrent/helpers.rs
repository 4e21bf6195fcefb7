//! Background helper threads that trace while mutators are not paying enough tax.
//!
//! Helpers park on a monitor while the request is `Wait`. A mutator that leaves work on the
//! shared stack switches the request to `Mark` and wakes them. A helper that runs out of work
//! switches the request back to `Wait` and parks again.

use super::ConcurrentGC;
use crate::util::spin_limiter::SpinLimiter;
use crate::vm::{Collection, EventHooks, VMBinding};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

/// What the helper threads are asked to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum HelperRequest {
    Wait,
    Mark,
    Shutdown,
}

/// Bytes of cards a helper cleans per call.
const HELPER_CARD_CLEAN_SIZE: usize = 0x10000;

/// The synchronized part of `HelperPool`.
struct HelperSync {
    request: HelperRequest,
    /// Helpers successfully started.
    started: usize,
    /// Helpers that woke up for `Mark` and have not parked again.
    active: usize,
    /// Helpers that have seen `Shutdown` and left their loop.
    exited: usize,
}

pub(crate) struct HelperPool {
    sync: Mutex<HelperSync>,
    /// Helpers wait on this while the request is `Wait`.
    request_changed: Condvar,
    /// Notified when a helper parks or exits.
    helper_parked: Condvar,
}

impl HelperPool {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(HelperSync {
                request: HelperRequest::Wait,
                started: 0,
                active: 0,
                exited: 0,
            }),
            request_changed: Condvar::new(),
            helper_parked: Condvar::new(),
        }
    }

    pub fn started(&self) -> usize {
        self.sync.lock().unwrap().started
    }

    pub fn request(&self) -> HelperRequest {
        self.sync.lock().unwrap().request
    }

    fn register_started(&self) {
        self.sync.lock().unwrap().started += 1;
    }

    /// Switch the request from `from` to `to`. Returns false if the request was not `from`.
    pub fn switch_request(&self, from: HelperRequest, to: HelperRequest) -> bool {
        let mut sync = self.sync.lock().unwrap();
        if sync.request != from {
            return false;
        }
        sync.request = to;
        trace!("Helper request {} -> {}", from, to);
        if to != HelperRequest::Wait {
            self.request_changed.notify_all();
        }
        true
    }

    /// Wake the helpers if there are any and they are waiting.
    pub fn resume(&self) {
        let mut sync = self.sync.lock().unwrap();
        if sync.started > 0 && sync.request == HelperRequest::Wait {
            sync.request = HelperRequest::Mark;
            trace!("Resuming {} helpers", sync.started);
            self.request_changed.notify_all();
        }
    }

    /// Block while the request is `Wait`. A helper that returns `Mark` counts as active until
    /// it calls `park`.
    fn wait_for_work(&self) -> HelperRequest {
        let mut sync = self.sync.lock().unwrap();
        while sync.request == HelperRequest::Wait {
            sync = self.request_changed.wait(sync).unwrap();
        }
        if sync.request == HelperRequest::Mark {
            sync.active += 1;
        }
        sync.request
    }

    fn park(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.active > 0);
        sync.active -= 1;
        self.helper_parked.notify_all();
    }

    fn exit(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.exited += 1;
        self.helper_parked.notify_all();
    }

    /// Switch the request to `Wait` and block until no helper is tracing. After this returns,
    /// helpers hold no references outside the shared stack.
    pub fn quiesce(&self) {
        let mut sync = self.sync.lock().unwrap();
        if sync.request == HelperRequest::Mark {
            sync.request = HelperRequest::Wait;
        }
        while sync.active > 0 {
            sync = self.helper_parked.wait(sync).unwrap();
        }
    }

    /// Ask every helper to exit and wait for them.
    pub fn shutdown(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.request = HelperRequest::Shutdown;
        self.request_changed.notify_all();
        while sync.exited < sync.started {
            sync = self.helper_parked.wait(sync).unwrap();
        }
        debug!("{} helpers shut down", sync.exited);
    }
}

/// No helper thread could be started. The collector keeps working with mutator tracing only.
#[derive(Debug)]
pub struct HelperStartError {
    pub requested: usize,
    pub source: std::io::Error,
}

impl fmt::Display for HelperStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "failed to start any of {} concurrent helper threads: {}",
            self.requested, self.source
        )
    }
}

impl std::error::Error for HelperStartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Everything a new helper thread needs. The binding passes it to the thread it spawns,
/// which calls [`HelperThreadContext::run`].
pub struct HelperThreadContext<VM: VMBinding> {
    gc: Arc<ConcurrentGC<VM>>,
    ordinal: usize,
}

impl<VM: VMBinding> HelperThreadContext<VM> {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Run the helper loop until the collector shuts the helpers down.
    pub fn run(self) {
        self.gc.helper_loop(self.ordinal);
    }
}

impl<VM: VMBinding> ConcurrentGC<VM> {
    /// Start the configured number of helper threads. Returns how many were started. Fails
    /// only if none could be started, in which case mutators do all the tracing.
    pub fn start_helpers(self: &Arc<Self>) -> Result<usize, HelperStartError> {
        let requested = self.options.concurrent_helper_threads;
        let mut started = 0;
        let mut last_error = None;
        for ordinal in 0..requested {
            let ctx = HelperThreadContext {
                gc: self.clone(),
                ordinal,
            };
            match self.vm.collection().spawn_helper_thread(ctx) {
                Ok(()) => {
                    self.helpers.register_started();
                    started += 1;
                }
                Err(e) => {
                    warn!("Failed to start concurrent helper {}: {}", ordinal, e);
                    last_error = Some(e);
                    break;
                }
            }
        }
        match last_error {
            Some(source) if started == 0 => {
                warn!("No concurrent helpers started. Mutators will do all the tracing.");
                Err(HelperStartError { requested, source })
            }
            _ => {
                info!("Started {} of {} concurrent helpers", started, requested);
                Ok(started)
            }
        }
    }

    pub fn shutdown_helpers(&self) {
        self.helpers.shutdown();
    }

    /// The request as seen by a tracing helper: `Mark` is withdrawn as soon as some thread
    /// wants exclusive access.
    fn helper_request(&self) -> HelperRequest {
        let request = self.helpers.request();
        if request == HelperRequest::Mark && self.vm.collection().is_exclusive_access_requested() {
            self.helpers
                .switch_request(HelperRequest::Mark, HelperRequest::Wait);
            return HelperRequest::Wait;
        }
        request
    }

    pub(crate) fn helper_loop(&self, ordinal: usize) {
        debug!("Concurrent helper {} started", ordinal);
        loop {
            if self.helpers.wait_for_work() == HelperRequest::Shutdown {
                break;
            }
            let mut request = self.helper_request();
            if request == HelperRequest::Mark {
                self.vm.hooks().on_helper_activated(ordinal);
                let traced = self.help_trace(&mut request);
                if request == HelperRequest::Mark {
                    // Out of work. Park until a mutator finds more.
                    self.helpers
                        .switch_request(HelperRequest::Mark, HelperRequest::Wait);
                }
                self.vm.hooks().on_helper_deactivated(ordinal, traced);
                trace!("Concurrent helper {} traced {} bytes", ordinal, traced);
            }
            self.helpers.park();
        }
        self.helpers.exit();
        debug!("Concurrent helper {} exited", ordinal);
    }

    /// Trace, then clean cards, while the request stays `Mark` and progress is being made.
    fn help_trace(&self, request: &mut HelperRequest) -> usize {
        let budget = self.tax.tuning_update_interval();
        let mut limiter = SpinLimiter::new(self.options.helper_spin_limit);
        let mut tracer = self.tracer();
        let mut total = 0;

        while *request == HelperRequest::Mark && tracer.has_work() && limiter.spin() {
            let traced = self.local_mark(&mut tracer, budget, true);
            if traced > 0 {
                self.state
                    .helper_trace_size_count
                    .fetch_add(traced, Ordering::SeqCst);
                total += traced;
                limiter.reset();
            }
            *request = self.helper_request();
        }

        limiter.reset();
        while *request == HelperRequest::Mark
            && self.state.mode() == super::ExecutionMode::CleanTrace
            && !self.state.is_card_cleaning_complete()
            && limiter.spin()
        {
            let cleaned = self.clean_cards(&mut tracer, HELPER_CARD_CLEAN_SIZE);
            if cleaned > 0 {
                self.state
                    .helper_card_clean_count
                    .fetch_add(cleaned, Ordering::SeqCst);
                total += cleaned;
                limiter.reset();
                // Trace what the cleaning found.
                let traced = self.local_mark(&mut tracer, budget, true);
                self.state
                    .helper_trace_size_count
                    .fetch_add(traced, Ordering::SeqCst);
                total += traced;
            }
            *request = self.helper_request();
        }

        tracer.flush();
        total
    }
}
