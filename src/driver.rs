//! The dispatch driver: the transactional execution loop of one flowlet instance.
//!
//! Every cycle first runs the tick methods that are due, then gives every event method one
//! chance to dequeue and process a batch. Each invocation runs in its own transaction over the
//! datasets, consumers and producers of the instance, so a commit acknowledges the dequeued
//! entries and publishes the emitted ones while an abort leaves the queues untouched.
//!
//! A failed input stays pending on its method and is redelivered on the next cycle until the
//! retry budget runs out. The failure policy then decides between retrying with a fresh budget
//! and acknowledging the input without processing it.
//!
//! Cancellation is only observed between cycles: the invocation in flight always completes.
//! A stopped driver cannot be started again, use [`FlowletProcessDriver::fresh`] instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::metrics::{names, MetricsContext, RecorderMetrics};
use crate::process::{
    FailurePolicy, FailureReason, Flowlet, InputContext, ProcessKind, ProcessSpecification,
};
use crate::reader::InputDatum;
use crate::shared::{ComponentError, Driver, FlowletId, RuntimeConfig};
use crate::transaction::{DataFabricFacade, TransactionAware, TransactionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            DriverState::Stopped => "STOPPED",
            DriverState::Starting => "STARTING",
            DriverState::Running => "RUNNING",
            DriverState::Stopping => "STOPPING",
        };
        f.write_str(state)
    }
}

/// Invocation counters of an instance. They survive driver replacement on suspend/resume.
#[derive(Debug, Default)]
pub struct DriverStats {
    processed: AtomicU64,
    failed: AtomicU64,
    last_processed: Mutex<Option<DateTime<Utc>>>,
}

impl DriverStats {
    /// Events (or ticks) handled by committed invocations.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Failed invocations, retries included.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        *self
            .last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_success(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
        *self
            .last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a driver needs, shared by the successive drivers of one instance.
pub struct DriverContext {
    flowlet: Arc<dyn Flowlet>,
    flowlet_id: FlowletId,
    specs: Vec<Arc<ProcessSpecification>>,
    data_fabric: DataFabricFacade,
    participants: Vec<Arc<dyn TransactionAware>>,
    failure_policy: FailurePolicy,
    config: RuntimeConfig,
    metrics: Arc<dyn MetricsContext>,
    stats: DriverStats,
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("flowlet_id", &self.flowlet_id)
            .field("specs", &self.specs)
            .field("data_fabric", &self.data_fabric)
            .field("failure_policy", &self.failure_policy)
            .field("config", &self.config)
            .finish()
    }
}

impl DriverContext {
    pub fn new(
        flowlet: Arc<dyn Flowlet>,
        flowlet_id: FlowletId,
        data_fabric: DataFabricFacade,
    ) -> Self {
        Self {
            flowlet,
            flowlet_id,
            specs: Vec::new(),
            data_fabric,
            participants: Vec::new(),
            failure_policy: FailurePolicy::default(),
            config: RuntimeConfig::default(),
            metrics: Arc::new(RecorderMetrics::new()),
            stats: DriverStats::default(),
        }
    }

    pub fn with_spec(mut self, spec: ProcessSpecification) -> Self {
        self.specs.push(Arc::new(spec));
        self
    }

    /// Adds a consumer or producer to the transactions of every invocation. Datasets come from
    /// the data fabric.
    pub fn with_participant(mut self, participant: Arc<dyn TransactionAware>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Policy applied when the flowlet's failure callback has no opinion.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsContext>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn flowlet_id(&self) -> &FlowletId {
        &self.flowlet_id
    }

    pub(crate) fn flowlet(&self) -> &Arc<dyn Flowlet> {
        &self.flowlet
    }

    pub(crate) fn data_fabric(&self) -> &DataFabricFacade {
        &self.data_fabric
    }

    pub fn specs(&self) -> &[Arc<ProcessSpecification>] {
        &self.specs
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }
}

/// Runs the dispatch loop of one instance on a dedicated task.
pub struct FlowletProcessDriver {
    context: Arc<DriverContext>,
    state: Arc<RwLock<DriverState>>,
    started: AtomicBool,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for FlowletProcessDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowletProcessDriver")
            .field("flowlet_id", &self.context.flowlet_id)
            .field("state", &self.state())
            .finish()
    }
}

impl FlowletProcessDriver {
    pub fn new(context: Arc<DriverContext>) -> Self {
        Self {
            context,
            state: Arc::new(RwLock::new(DriverState::Stopped)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// A new driver over the same context, ready to be started.
    pub fn fresh(&self) -> Self {
        Self::new(Arc::clone(&self.context))
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.context
    }

    pub fn state(&self) -> DriverState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the dispatch loop. Must be called within a tokio runtime, at most once.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Driver::internal_error(format!(
                "driver of flowlet {} was already started",
                self.context.flowlet_id
            )));
        }
        set_state(&self.state, DriverState::Starting);

        let dispatcher = Dispatcher::new(Arc::clone(&self.context));
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            set_state(&state, DriverState::Running);
            dispatcher.run(cancel).await;
            set_state(&state, DriverState::Stopped);
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(flowlet = %self.context.flowlet_id, "Driver started");
        Ok(())
    }

    /// Stops the loop after the invocation in flight and waits for it to exit.
    pub async fn stop(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        set_state(&self.state, DriverState::Stopping);
        self.cancel.cancel();
        let result = handle.await;
        set_state(&self.state, DriverState::Stopped);
        result.map_err(|e| {
            Driver::internal_error(format!(
                "dispatch loop of flowlet {} failed: {e}",
                self.context.flowlet_id
            ))
        })?;
        debug!(flowlet = %self.context.flowlet_id, "Driver stopped");
        Ok(())
    }
}

fn set_state(state: &RwLock<DriverState>, value: DriverState) {
    *state.write().unwrap_or_else(PoisonError::into_inner) = value;
}

/// What to do with a pending input on its next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redelivery {
    /// Invoke the method again.
    Retry,
    /// Only acknowledge it; the failure policy gave up on it.
    Skip,
}

/// Dispatch state of one method.
struct Method {
    spec: Arc<ProcessSpecification>,
    retries_left: u32,
    pending: Option<(InputDatum, Redelivery)>,
    tick_retry: u32,
    next_tick: Instant,
}

impl Method {
    fn new(spec: Arc<ProcessSpecification>) -> Self {
        let initial_delay = match spec.kind() {
            ProcessKind::Tick { initial_delay, .. } => *initial_delay,
            ProcessKind::Event { .. } => Duration::ZERO,
        };
        Self {
            retries_left: spec.max_retries(),
            spec,
            pending: None,
            tick_retry: 0,
            next_tick: Instant::now() + initial_delay,
        }
    }
}

/// Outcome of one invocation attempt.
enum Attempt {
    Committed(usize),
    Failed(Error),
}

struct Dispatcher {
    context: Arc<DriverContext>,
    tx: TransactionContext,
    methods: Vec<Method>,
}

impl Dispatcher {
    fn new(context: Arc<DriverContext>) -> Self {
        let tx = context
            .data_fabric
            .create_transaction_context(context.participants.iter().cloned());
        let methods = context.specs.iter().cloned().map(Method::new).collect();
        Self {
            context,
            tx,
            methods,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!(flowlet = %self.context.flowlet_id, methods = self.methods.len(), "Dispatch loop started");
        let idle_backoff = self.context.config.idle_backoff();
        while !cancel.is_cancelled() {
            if self.cycle().await {
                // let other tasks on the runtime make progress between busy cycles
                tokio::task::yield_now().await;
                continue;
            }
            let wait = self
                .next_tick()
                .map(|at| at.saturating_duration_since(Instant::now()).min(idle_backoff))
                .unwrap_or(idle_backoff);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancellation token is cancelled, shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(flowlet = %self.context.flowlet_id, "Dispatch loop stopped");
    }

    /// Runs due ticks, then every event method once. Returns whether any work was done.
    async fn cycle(&mut self) -> bool {
        let mut worked = false;
        for idx in 0..self.methods.len() {
            if self.methods[idx].spec.is_tick() {
                worked |= self.tick(idx).await;
            }
        }
        for idx in 0..self.methods.len() {
            if !self.methods[idx].spec.is_tick() {
                worked |= self.process(idx).await;
            }
        }
        trace!(worked, "Cycle done");
        worked
    }

    fn next_tick(&self) -> Option<Instant> {
        self.methods
            .iter()
            .filter(|m| m.spec.is_tick())
            .map(|m| m.next_tick)
            .min()
    }

    async fn tick(&mut self, idx: usize) -> bool {
        let method = &self.methods[idx];
        let ProcessKind::Tick { handler, delay, .. } = method.spec.kind() else {
            return false;
        };
        if Instant::now() < method.next_tick {
            return false;
        }
        let (handler, delay) = (Arc::clone(handler), *delay);
        let name = method.spec.name().to_string();
        let mut input = InputContext::new("");
        input.retry_count = method.tick_retry;

        let attempt = match self.tx.start().await {
            Ok(()) => match handler.tick().await {
                Ok(()) => self.tx.finish().await.map(|_| Attempt::Committed(1)),
                Err(e) => {
                    self.abort().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
        .unwrap_or_else(Attempt::Failed);

        match attempt {
            Attempt::Committed(count) => {
                self.succeeded(&name, &input, count);
                let method = &mut self.methods[idx];
                method.retries_left = method.spec.max_retries();
                method.tick_retry = 0;
                method.next_tick = Instant::now() + delay;
            }
            Attempt::Failed(err) => {
                self.failed(&name, &input, &err);
                let policy = {
                    let method = &mut self.methods[idx];
                    if method.retries_left > 0 {
                        method.retries_left -= 1;
                        method.tick_retry += 1;
                        return true;
                    }
                    method.tick_retry += 1;
                    method.retries_left = method.spec.max_retries();
                    self.policy(&input, &err)
                };
                let method = &mut self.methods[idx];
                match policy {
                    FailurePolicy::Retry => {
                        error!(method = %name, error = %err, "Tick retries exhausted, retrying");
                    }
                    FailurePolicy::Ignore => {
                        error!(method = %name, error = %err, "Tick retries exhausted, skipping");
                        method.tick_retry = 0;
                        method.next_tick = Instant::now() + delay;
                    }
                }
            }
        }
        true
    }

    async fn process(&mut self, idx: usize) -> bool {
        let method = &mut self.methods[idx];
        let spec = Arc::clone(&method.spec);
        let ProcessKind::Event {
            handler,
            reader,
            batch_size,
            cache,
        } = spec.kind()
        else {
            return false;
        };
        let pending = method.pending.take();

        if let Err(e) = self.tx.start().await {
            warn!(method = %spec.name(), error = %e, "Failed to start transaction");
            self.methods[idx].pending = pending;
            return false;
        }

        let datum = match pending {
            Some((datum, redelivery)) => {
                if let Err(e) = datum.reclaim().await {
                    warn!(method = %spec.name(), error = %e, "Failed to reclaim pending input");
                    self.abort().await;
                    self.methods[idx].pending = Some((datum, redelivery));
                    return false;
                }
                if redelivery == Redelivery::Skip {
                    return self.skip(idx, datum).await;
                }
                datum
            }
            None => {
                match reader
                    .dequeue(*batch_size, self.context.config.dequeue_timeout())
                    .await
                {
                    Ok(Some(datum)) => datum,
                    Ok(None) => {
                        self.abort().await;
                        return false;
                    }
                    Err(e) => {
                        warn!(method = %spec.name(), error = %e, "Dequeue failed");
                        self.abort().await;
                        return false;
                    }
                }
            }
        };

        debug!(
            method = %spec.name(),
            origin = %datum.context().origin,
            size = datum.size(),
            retry = datum.context().retry_count,
            "Invoking process method"
        );
        let attempt = match handler.handle(datum.events(), cache, datum.context()).await {
            Ok(()) => match self.tx.finish().await {
                Ok(()) => Attempt::Committed(datum.size()),
                Err(e) => Attempt::Failed(e),
            },
            Err(e) => {
                self.abort().await;
                Attempt::Failed(e)
            }
        };

        match attempt {
            Attempt::Committed(count) => {
                self.succeeded(spec.name(), datum.context(), count);
                self.methods[idx].retries_left = spec.max_retries();
            }
            Attempt::Failed(err) => self.retry_or_escalate(idx, datum, err),
        }
        true
    }

    fn retry_or_escalate(&mut self, idx: usize, mut datum: InputDatum, err: Error) {
        let name = self.methods[idx].spec.name().to_string();
        self.failed(&name, datum.context(), &err);

        let method = &mut self.methods[idx];
        if method.retries_left > 0 {
            method.retries_left -= 1;
            datum.increment_retry();
            method.pending = Some((datum, Redelivery::Retry));
            return;
        }

        let policy = self.policy(datum.context(), &err);
        let method = &mut self.methods[idx];
        method.retries_left = method.spec.max_retries();
        match policy {
            FailurePolicy::Retry => {
                error!(method = %name, origin = %datum.context().origin, error = %err, "Retries exhausted, retrying input");
                datum.increment_retry();
                method.pending = Some((datum, Redelivery::Retry));
            }
            FailurePolicy::Ignore => {
                error!(method = %name, origin = %datum.context().origin, size = datum.size(), error = %err, "Retries exhausted, ignoring input");
                method.pending = Some((datum, Redelivery::Skip));
            }
        }
    }

    /// Acknowledges a given-up input within the transaction already started.
    async fn skip(&mut self, idx: usize, datum: InputDatum) -> bool {
        match self.tx.finish().await {
            Ok(()) => {
                debug!(method = %self.methods[idx].spec.name(), size = datum.size(), "Ignored input acknowledged");
            }
            Err(e) => {
                warn!(method = %self.methods[idx].spec.name(), error = %e, "Failed to acknowledge ignored input");
                self.methods[idx].pending = Some((datum, Redelivery::Skip));
            }
        }
        true
    }

    fn policy(&self, input: &InputContext, err: &Error) -> FailurePolicy {
        self.context
            .flowlet
            .on_failure(input, &FailureReason::from(err))
            .unwrap_or(self.context.failure_policy)
    }

    fn succeeded(&self, method: &str, input: &InputContext, count: usize) {
        trace!(method, count, "Invocation committed");
        self.context
            .metrics
            .increment(names::PROCESS_EVENTS_PROCESSED, count as i64);
        self.context.stats.record_success(count as u64);
        self.context.flowlet.on_success(input);
    }

    fn failed(&self, method: &str, input: &InputContext, err: &Error) {
        warn!(method, origin = %input.origin, retry = input.retry_count, error = %err, "Invocation failed");
        self.context.metrics.increment(names::PROCESS_ERRORS, 1);
        self.context.stats.record_failure();
    }

    async fn abort(&mut self) {
        if let Err(e) = self.tx.abort().await {
            warn!(error = %e, "Failed to abort transaction");
        }
    }
}
