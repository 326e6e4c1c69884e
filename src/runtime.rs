//! Lifecycle of a running flowlet instance.
//!
//! [`FlowletRuntimeService`] owns the lifecycle hooks, the consumer and producer suppliers and
//! the current [`FlowletProcessDriver`]. [`FlowletProgramController`] is the handle given back to
//! whoever launched the instance: it serializes stop, suspend, resume and commands, and reacts
//! to property changes of the streams the instance reads by suspending and resuming it, so the
//! consumers are recreated against the new stream layout.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{DriverContext, DriverState, FlowletProcessDriver};
use crate::error::Result;
use crate::metrics::names;
use crate::process::{FlowletContext, TransactionControl};
use crate::queue::{
    ConsumerSupplier, ProducerSupplier, StreamCoordinatorClient, StreamPropertyListener,
};
use crate::shared::{shutdown_signal, ComponentError, FlowletId, Runtime, StreamId};

/// Capacity of the property change channel. A full channel already holds a pending
/// reconfiguration, so further notifications are dropped.
const CHANNEL_SIZE: usize = 16;

/// Name of the command changing the instance count.
pub const INSTANCES_COMMAND: &str = "instances";

/// A stream property change relevant to the consumers of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyChange {
    Ttl { stream: StreamId, ttl: Duration },
    Generation { stream: StreamId, generation: u64 },
    Deleted { stream: StreamId },
}

impl PropertyChange {
    pub fn stream(&self) -> &StreamId {
        match self {
            PropertyChange::Ttl { stream, .. }
            | PropertyChange::Generation { stream, .. }
            | PropertyChange::Deleted { stream } => stream,
        }
    }
}

/// Forwards stream property notifications to the controller of the instance.
#[derive(Debug)]
pub struct FlowletServiceHook {
    tx: mpsc::Sender<PropertyChange>,
}

impl FlowletServiceHook {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PropertyChange>) {
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, change: PropertyChange) {
        if let Err(e) = self.tx.try_send(change) {
            debug!(error = %e, "Property change not forwarded");
        }
    }
}

impl StreamPropertyListener for FlowletServiceHook {
    fn ttl_changed(&self, stream: &StreamId, ttl: Duration) {
        self.forward(PropertyChange::Ttl {
            stream: stream.clone(),
            ttl,
        });
    }

    fn generation_changed(&self, stream: &StreamId, generation: u64) {
        self.forward(PropertyChange::Generation {
            stream: stream.clone(),
            generation,
        });
    }

    fn threshold_changed(&self, stream: &StreamId, threshold_mb: u64) {
        // consumers do not depend on the notification threshold
        debug!(%stream, threshold_mb, "Stream threshold changed");
    }

    fn deleted(&self, stream: &StreamId) {
        self.forward(PropertyChange::Deleted {
            stream: stream.clone(),
        });
    }
}

/// Start, stop, suspend and resume of one flowlet instance.
pub struct FlowletRuntimeService {
    context: FlowletContext,
    driver_context: Arc<DriverContext>,
    driver: tokio::sync::Mutex<FlowletProcessDriver>,
    consumers: Vec<Arc<ConsumerSupplier>>,
    producers: Vec<Arc<ProducerSupplier>>,
    watcher: Option<(Arc<dyn StreamCoordinatorClient>, Arc<FlowletServiceHook>)>,
    subscriptions: Mutex<Vec<CancellationToken>>,
    generation: AtomicU64,
}

impl fmt::Debug for FlowletRuntimeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowletRuntimeService")
            .field("context", &self.context)
            .field("consumers", &self.consumers)
            .field("producers", &self.producers)
            .finish()
    }
}

impl FlowletRuntimeService {
    pub fn new(context: FlowletContext, driver_context: Arc<DriverContext>) -> Self {
        let driver = FlowletProcessDriver::new(Arc::clone(&driver_context));
        Self {
            context,
            driver_context,
            driver: tokio::sync::Mutex::new(driver),
            consumers: Vec::new(),
            producers: Vec::new(),
            watcher: None,
            subscriptions: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_consumers(mut self, consumers: Vec<Arc<ConsumerSupplier>>) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn with_producers(mut self, producers: Vec<Arc<ProducerSupplier>>) -> Self {
        self.producers = producers;
        self
    }

    /// Subscribes `hook` to every stream read by the instance while it runs.
    pub fn with_watcher(
        mut self,
        coordinator: Arc<dyn StreamCoordinatorClient>,
        hook: Arc<FlowletServiceHook>,
    ) -> Self {
        self.watcher = Some((coordinator, hook));
        self
    }

    pub fn context(&self) -> &FlowletContext {
        &self.context
    }

    /// Streams read by the instance.
    pub fn streams(&self) -> Vec<StreamId> {
        self.consumers
            .iter()
            .filter(|c| c.is_stream())
            .filter_map(|c| c.queue_name().to_stream_id())
            .collect()
    }

    /// Number of drivers started so far; grows by one on every resume.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn driver_state(&self) -> DriverState {
        self.driver.lock().await.state()
    }

    #[tracing::instrument(skip(self), fields(flowlet = %self.context.id(), instance = self.context.instance_id()))]
    pub async fn start(&self) -> Result<()> {
        debug!("Initializing flowlet");
        let flowlet = self.driver_context.flowlet();
        if let Err(e) = self.in_transaction(flowlet.initialize(&self.context)).await {
            error!(error = %e, "Flowlet initialization failed");
            return Err(e);
        }

        if let Some((coordinator, hook)) = &self.watcher {
            for stream in self.streams() {
                let token = coordinator
                    .subscribe(&stream, Arc::clone(hook) as Arc<dyn StreamPropertyListener>)
                    .await?;
                debug!(%stream, "Watching stream properties");
                self.lock_subscriptions().push(token);
            }
        }

        self.driver.lock().await.start()?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.context
            .metrics()
            .increment(names::PROCESS_INSTANCE, 1);
        info!(
            instance_count = self.context.instance_count(),
            run_id = self.context.run_id(),
            "Started flowlet"
        );
        Ok(())
    }

    /// Stops the driver, runs the destroy hook and releases every resource. Cleanup continues
    /// past failures; the first one is returned.
    #[tracing::instrument(skip(self), fields(flowlet = %self.context.id(), instance = self.context.instance_id()))]
    pub async fn stop(&self) -> Result<()> {
        let mut first_err = None;
        if let Err(e) = self.driver.lock().await.stop().await {
            warn!(error = %e, "Failed to stop driver");
            first_err.get_or_insert(e);
        }

        debug!("Destroying flowlet");
        let flowlet = self.driver_context.flowlet();
        if let Err(e) = self.in_transaction(flowlet.destroy()).await {
            error!(error = %e, "Flowlet destruction failed");
            first_err.get_or_insert(e);
        }

        if let Err(e) = self.release().await {
            first_err.get_or_insert(e);
        }
        self.context
            .metrics()
            .increment(names::PROCESS_INSTANCE, -1);
        info!("Stopped flowlet");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops the driver and closes the consumers. A fresh driver over the same process
    /// specifications is prepared for [`resume`](Self::resume), even when a step fails.
    pub async fn suspend(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        let mut first_err = driver.stop().await.err();
        for consumer in &self.consumers {
            if let Err(e) = consumer.close().await {
                warn!(queue = %consumer.queue_name(), error = %e, "Failed to close consumer");
                first_err.get_or_insert(e);
            }
        }
        *driver = driver.fresh();
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(flowlet = %self.context.id(), instance = self.context.instance_id(), "Suspended flowlet");
                Ok(())
            }
        }
    }

    /// Reopens the consumers and starts the prepared driver.
    pub async fn resume(&self) -> Result<()> {
        let driver = self.driver.lock().await;
        for consumer in &self.consumers {
            consumer.open().await?;
        }
        driver.start()?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(flowlet = %self.context.id(), instance = self.context.instance_id(), "Resumed flowlet");
        Ok(())
    }

    /// Switches every consumer to a group of `instances` members.
    pub async fn change_instances(&self, instances: u32) -> Result<()> {
        let instance_id = self.context.instance_id();
        if instances == 0 || instance_id >= instances {
            return Err(Runtime::config_error(format!(
                "instance {instance_id} cannot run with {instances} instances"
            )));
        }
        for consumer in &self.consumers {
            consumer.change_instances(instances).await?;
        }
        self.context.set_instance_count(instances);
        info!(flowlet = %self.context.id(), instance_id, instances, "Instance count changed");
        Ok(())
    }

    /// Ends the stream subscriptions and closes consumers and producers.
    pub(crate) async fn release(&self) -> Result<()> {
        for token in self.lock_subscriptions().drain(..) {
            token.cancel();
        }
        let mut first_err = None;
        for consumer in &self.consumers {
            if let Err(e) = consumer.close().await {
                warn!(queue = %consumer.queue_name(), error = %e, "Failed to close consumer");
                first_err.get_or_insert(e);
            }
        }
        for producer in &self.producers {
            producer.close();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs a lifecycle hook, inside a transaction over the datasets unless the flowlet controls
    /// transactions itself.
    async fn in_transaction(&self, hook: impl Future<Output = Result<()>>) -> Result<()> {
        let flowlet = self.driver_context.flowlet();
        if flowlet.transaction_control() == TransactionControl::Explicit {
            return hook.await;
        }
        let mut tx = self
            .driver_context
            .data_fabric()
            .create_transaction_context([]);
        tx.start().await?;
        match hook.await {
            Ok(()) => tx.finish().await,
            Err(e) => {
                if let Err(abort_err) = tx.abort().await {
                    warn!(error = %abort_err, "Failed to abort hook transaction");
                }
                Err(e)
            }
        }
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<CancellationToken>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Externally visible state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramState {
    Alive,
    Suspended,
    Stopped,
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ProgramState::Alive => "ALIVE",
            ProgramState::Suspended => "SUSPENDED",
            ProgramState::Stopped => "STOPPED",
        };
        f.write_str(state)
    }
}

/// Monitoring snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramStatus {
    pub flowlet: FlowletId,
    pub state: ProgramState,
    pub instance_id: u32,
    pub instance_count: u32,
    pub run_id: String,
    pub processed: u64,
    pub failed: u64,
    pub last_processed: Option<DateTime<Utc>>,
    /// Drivers started so far, one more after every resume.
    pub generation: u64,
}

struct ControllerInner {
    service: FlowletRuntimeService,
    state: tokio::sync::Mutex<ProgramState>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Handle on a running flowlet instance. Cheap to clone.
#[derive(Clone)]
pub struct FlowletProgramController {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for FlowletProgramController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowletProgramController")
            .field("flowlet", self.inner.service.context().id())
            .field("instance", &self.inner.service.context().instance_id())
            .finish()
    }
}

impl FlowletProgramController {
    /// Takes over a started service. Property changes received on `changes` suspend and resume
    /// the instance, one at a time.
    pub fn new(service: FlowletRuntimeService, changes: mpsc::Receiver<PropertyChange>) -> Self {
        let inner = Arc::new(ControllerInner {
            service,
            state: tokio::sync::Mutex::new(ProgramState::Alive),
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        });
        let controller = Self { inner };
        let handle = tokio::spawn(controller.clone().watch(ReceiverStream::new(changes)));
        *controller
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        controller
    }

    async fn watch(self, mut changes: ReceiverStream<PropertyChange>) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cancellation token is cancelled, property watcher shutting down");
                    break;
                }
                change = changes.next() => {
                    let Some(change) = change else {
                        break;
                    };
                    info!(stream = %change.stream(), change = ?change, "Stream property changed, reconfiguring");
                    if let Err(e) = self.suspend_and_resume().await {
                        error!(error = %e, "Reconfiguration after property change failed");
                    }
                }
            }
        }
    }

    pub async fn state(&self) -> ProgramState {
        *self.inner.state.lock().await
    }

    pub async fn status(&self) -> ProgramStatus {
        let state = self.state().await;
        let service = &self.inner.service;
        let context = service.context();
        let stats = service.driver_context.stats();
        ProgramStatus {
            flowlet: context.id().clone(),
            state,
            instance_id: context.instance_id(),
            instance_count: context.instance_count(),
            run_id: context.run_id().to_string(),
            processed: stats.processed(),
            failed: stats.failed(),
            last_processed: stats.last_processed(),
            generation: service.generation(),
        }
    }

    pub async fn suspend(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match *state {
            ProgramState::Alive => {
                // the driver is down even when suspending fails
                *state = ProgramState::Suspended;
                self.inner.service.suspend().await
            }
            ProgramState::Suspended => Ok(()),
            ProgramState::Stopped => Err(Runtime::internal_error("cannot suspend a stopped flowlet")),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match *state {
            ProgramState::Suspended => {
                self.inner.service.resume().await?;
                *state = ProgramState::Alive;
                Ok(())
            }
            ProgramState::Alive => Ok(()),
            ProgramState::Stopped => Err(Runtime::internal_error("cannot resume a stopped flowlet")),
        }
    }

    /// One suspend and resume cycle, under the same lock as the other transitions. Only an
    /// alive instance is cycled. When the cycle fails half way the instance is left suspended,
    /// so [`resume`](Self::resume) can retry.
    async fn suspend_and_resume(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if *state != ProgramState::Alive {
            debug!(state = %*state, "Not alive, skipping reconfiguration");
            return Ok(());
        }
        *state = ProgramState::Suspended;
        self.inner.service.suspend().await?;
        self.inner.service.resume().await?;
        *state = ProgramState::Alive;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let result = {
            let mut state = self.inner.state.lock().await;
            if *state == ProgramState::Stopped {
                return Ok(());
            }
            self.inner.cancel.cancel();
            *state = ProgramState::Stopped;
            self.inner.service.stop().await
        };
        let watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Property watcher ended abnormally");
            }
        }
        result
    }

    /// Runs a named command. `instances` takes the new instance count as a JSON number or
    /// numeric string and is only accepted while the instance is suspended.
    pub fn command(&self, name: &str, args: serde_json::Value) -> BoxFuture<'static, Result<()>> {
        let controller = self.clone();
        let name = name.to_string();
        Box::pin(async move {
            match name.as_str() {
                INSTANCES_COMMAND => {
                    let instances = args
                        .as_u64()
                        .or_else(|| args.as_str().and_then(|s| s.trim().parse().ok()))
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| {
                            Runtime::config_error(format!("invalid instance count {args}"))
                        })?;
                    let state = controller.inner.state.lock().await;
                    if *state != ProgramState::Suspended {
                        return Err(Runtime::internal_error(format!(
                            "instance count can only change while suspended, flowlet is {}",
                            *state
                        )));
                    }
                    controller.inner.service.change_instances(instances).await
                }
                other => Err(Runtime::config_error(format!("unknown command '{other}'"))),
            }
        })
    }

    /// Runs until SIGINT, SIGTERM, a message on `shutdown_rx` or [`stop`](Self::stop), then
    /// stops the instance.
    pub async fn run_until_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        shutdown_signal(shutdown_rx, self.inner.cancel.clone()).await;
        info!("Shutting down flowlet");
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use async_trait::async_trait;

    use super::*;
    use crate::emitter::OutputEmitterFactory;
    use crate::error::Error;
    use crate::flow::{FlowSpecification, FlowletConnection, FlowletDefinition};
    use crate::inmemory::{
        InMemoryMetrics, InMemoryQueueService, InMemoryStreamCoordinator, InMemoryTable,
        InMemoryTransactionSystem,
    };
    use crate::process::{BindingLevel, BindingTable, InputContext, ProcessBinding};
    use crate::queue::{
        ConsumerConfig, QueueClientFactory, QueueConsumer, QueueProducer, StreamConsumer,
        StreamEvent,
    };
    use crate::runner::{FlowletProgramRunner, ProgramOptions};
    use crate::shared::QueueName;
    use crate::schema::Typed;
    use crate::shared::RuntimeConfig;
    use crate::transaction::TransactionAware;

    /// Records the body of every stream event and counts them in a dataset.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        table: Arc<InMemoryTable>,
        inits: AtomicU32,
        destroys: AtomicU32,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Arc::new(Mutex::new(Vec::new())),
                table: Arc::new(InMemoryTable::new("events")),
                inits: AtomicU32::new(0),
                destroys: AtomicU32::new(0),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl crate::process::Flowlet for Recorder {
        fn bindings(self: Arc<Self>, _outputs: &OutputEmitterFactory) -> Result<BindingTable> {
            let this = Arc::clone(&self);
            Ok(BindingTable::new().with_level(BindingLevel::new("Recorder").with_process(
                ProcessBinding::single("record", move |event: StreamEvent, _: InputContext| {
                    let this = Arc::clone(&this);
                    async move {
                        this.table.increment("total", 1)?;
                        let body = String::from_utf8(event.body)
                            .map_err(|e| Error::user(e.to_string()))?;
                        this.seen.lock().unwrap().push(body);
                        Ok::<(), Error>(())
                    }
                }),
            )))
        }

        async fn initialize(&self, _context: &FlowletContext) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            self.table.increment("inits", 1)
        }

        async fn destroy(&self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// In-memory queues whose next stream consumer fails to open once armed.
    struct FlakyQueues {
        inner: InMemoryQueueService,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl QueueClientFactory for FlakyQueues {
        async fn create_consumer(
            &self,
            queue: &QueueName,
            config: &ConsumerConfig,
            num_groups: usize,
        ) -> Result<Arc<dyn QueueConsumer>> {
            self.inner.create_consumer(queue, config, num_groups).await
        }

        async fn create_stream_consumer(
            &self,
            stream: &StreamId,
            config: &ConsumerConfig,
        ) -> Result<Arc<dyn StreamConsumer>> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Runtime::internal_error("stream storage unavailable"));
            }
            self.inner.create_stream_consumer(stream, config).await
        }

        async fn create_producer(&self, queue: &QueueName) -> Result<Arc<dyn QueueProducer>> {
            self.inner.create_producer(queue).await
        }
    }

    struct Harness {
        service: InMemoryQueueService,
        coordinator: Arc<InMemoryStreamCoordinator>,
        stream: StreamId,
        recorder: Arc<Recorder>,
        controller: FlowletProgramController,
    }

    impl Harness {
        async fn start() -> Self {
            let service = InMemoryQueueService::new();
            Self::start_with(service.clone(), Arc::new(service)).await
        }

        /// `queues` serves the instance, `service` is the storage behind it.
        async fn start_with(service: InMemoryQueueService, queues: Arc<dyn QueueClientFactory>) -> Self {
            let flow = FlowSpecification::new("app", "ingest")
                .with_flowlet(
                    FlowletDefinition::new("recorder")
                        .with_input("", StreamEvent::schema())
                        .with_dataset("events"),
                )
                .with_connection(FlowletConnection::from_stream("text", "recorder"));
            let coordinator = Arc::new(InMemoryStreamCoordinator::new());
            let recorder = Recorder::new();

            let runner = FlowletProgramRunner::new(
                queues,
                Arc::new(InMemoryTransactionSystem::new()),
                coordinator.clone(),
            )
            .with_config(RuntimeConfig::new().with_idle_backoff(Duration::from_millis(5)))
            .with_metrics(Arc::new(InMemoryMetrics::new()));
            let controller = runner
                .run(
                    &flow,
                    "recorder",
                    recorder.clone(),
                    vec![recorder.table.clone() as Arc<dyn TransactionAware>],
                    ProgramOptions::new(0, 1).unwrap(),
                )
                .await
                .unwrap();

            Self {
                stream: flow.stream_id("text"),
                service,
                coordinator,
                recorder,
                controller,
            }
        }

        fn append(&self, body: &str) {
            self.service
                .append_stream(&self.stream, StreamEvent::new(body.to_string()));
        }

        async fn wait_for(&self, count: usize) {
            for _ in 0..400 {
                if self.recorder.seen().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("timed out waiting for {count} events");
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_run_hooks() {
        let harness = Harness::start().await;
        assert_eq!(harness.recorder.inits.load(Ordering::SeqCst), 1);
        // the init hook ran in a committed transaction
        assert_eq!(harness.recorder.table.snapshot().get("inits"), Some(&1));
        assert_eq!(harness.coordinator.subscribers(&harness.stream), 1);

        harness.append("hello");
        harness.wait_for(1).await;

        harness.controller.stop().await.unwrap();
        assert_eq!(harness.controller.state().await, ProgramState::Stopped);
        assert_eq!(harness.recorder.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(harness.coordinator.subscribers(&harness.stream), 0);
        // stopping again is a no-op, suspending is not allowed anymore
        harness.controller.stop().await.unwrap();
        assert!(harness.controller.suspend().await.is_err());
    }

    #[tokio::test]
    async fn test_suspend_resume_preserves_identity_without_redelivery() {
        let harness = Harness::start().await;
        harness.append("one");
        harness.append("two");
        harness.wait_for(2).await;

        let before = harness.controller.status().await;
        harness.controller.suspend().await.unwrap();
        assert_eq!(harness.controller.state().await, ProgramState::Suspended);
        harness.append("three");
        // nothing is consumed while suspended
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.recorder.seen().len(), 2);

        harness.controller.resume().await.unwrap();
        harness.wait_for(3).await;

        let after = harness.controller.status().await;
        assert_eq!(after.instance_id, before.instance_id);
        assert_eq!(after.instance_count, before.instance_count);
        assert_eq!(after.run_id, before.run_id);
        assert_eq!(after.generation, before.generation + 1);
        assert_eq!(harness.recorder.seen(), vec!["one", "two", "three"]);
        assert_eq!(harness.recorder.table.snapshot().get("total"), Some(&3));

        harness.controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_generation_change_cycles_once() {
        let harness = Harness::start().await;
        assert_eq!(harness.controller.status().await.generation, 1);

        harness.coordinator.change_generation(&harness.stream, 2);
        // thresholds do not affect consumers
        harness.coordinator.change_threshold(&harness.stream, 64);

        for _ in 0..400 {
            if harness.controller.status().await.generation == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = harness.controller.status().await;
        assert_eq!(status.generation, 2);
        assert_eq!(status.state, ProgramState::Alive);

        harness.append("after");
        harness.wait_for(1).await;
        harness.controller.stop().await.unwrap();
    }

    async fn wait_for_generation(controller: &FlowletProgramController, generation: u64) {
        for _ in 0..400 {
            if controller.status().await.generation == generation {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for generation {generation}");
    }

    #[tokio::test]
    async fn test_ttl_change_and_deletion_cycle_once_each() {
        let harness = Harness::start().await;
        harness.append("before");
        harness.wait_for(1).await;

        harness
            .coordinator
            .change_ttl(&harness.stream, Duration::from_secs(60));
        wait_for_generation(&harness.controller, 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.controller.status().await.generation, 2);

        harness.coordinator.delete(&harness.stream);
        wait_for_generation(&harness.controller, 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = harness.controller.status().await;
        assert_eq!(status.generation, 3);
        assert_eq!(status.state, ProgramState::Alive);

        harness.append("after");
        harness.wait_for(2).await;
        assert_eq!(harness.recorder.seen(), vec!["before", "after"]);
        harness.controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reconfiguration_leaves_instance_suspended() {
        let service = InMemoryQueueService::new();
        let queues = Arc::new(FlakyQueues {
            inner: service.clone(),
            fail_next: AtomicBool::new(false),
        });
        let harness = Harness::start_with(service, queues.clone()).await;
        harness.append("one");
        harness.wait_for(1).await;

        queues.fail_next.store(true, Ordering::SeqCst);
        harness.coordinator.change_generation(&harness.stream, 2);
        for _ in 0..400 {
            if harness.controller.state().await == ProgramState::Suspended {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(harness.controller.state().await, ProgramState::Suspended);
        assert!(!queues.fail_next.load(Ordering::SeqCst));

        harness.append("two");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.recorder.seen().len(), 1);
        // the instance count can be changed, as for any suspended instance
        harness
            .controller
            .command(INSTANCES_COMMAND, serde_json::json!(1))
            .await
            .unwrap();

        harness.controller.resume().await.unwrap();
        assert_eq!(harness.controller.state().await, ProgramState::Alive);
        harness.wait_for(2).await;
        assert_eq!(harness.recorder.seen(), vec!["one", "two"]);
        assert_eq!(harness.controller.status().await.generation, 2);
        harness.controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_command_requires_suspension() {
        let harness = Harness::start().await;
        let controller = &harness.controller;

        assert!(controller
            .command(INSTANCES_COMMAND, serde_json::json!(3))
            .await
            .is_err());

        controller.suspend().await.unwrap();
        controller
            .command(INSTANCES_COMMAND, serde_json::json!(2))
            .await
            .unwrap();
        controller
            .command(INSTANCES_COMMAND, serde_json::json!("3"))
            .await
            .unwrap();
        assert!(controller
            .command(INSTANCES_COMMAND, serde_json::json!("three"))
            .await
            .unwrap_err()
            .is_fatal());
        assert!(controller
            .command("restart", serde_json::Value::Null)
            .await
            .is_err());
        controller.resume().await.unwrap();

        let status = controller.status().await;
        assert_eq!(status.instance_count, 3);
        assert_eq!(status.instance_id, 0);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let harness = Harness::start().await;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let controller = harness.controller.clone();
        let task = tokio::spawn(async move { controller.run_until_shutdown(Some(shutdown_rx)).await });

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(harness.controller.state().await, ProgramState::Stopped);
    }

    #[test]
    fn test_hook_forwards_relevant_changes() {
        let (hook, mut rx) = FlowletServiceHook::new();
        let stream = StreamId::new("ns", "text");
        hook.ttl_changed(&stream, Duration::from_secs(60));
        hook.threshold_changed(&stream, 10);
        hook.deleted(&stream);

        assert_eq!(
            rx.try_recv().unwrap(),
            PropertyChange::Ttl {
                stream: stream.clone(),
                ttl: Duration::from_secs(60)
            }
        );
        assert_eq!(rx.try_recv().unwrap(), PropertyChange::Deleted { stream });
        assert!(rx.try_recv().is_err());
    }
}
