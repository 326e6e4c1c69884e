//! Flowlets, their process and tick methods, and the resolved process specifications.
//!
//! A flowlet declares its methods in a [`BindingTable`] built once when the instance starts. The
//! table is organised in levels, most specific first, mirroring a type and the types it extends:
//! a method name already bound at a more specific level shadows the same name further down.
//!
//! ```ignore
//! fn bindings(self: Arc<Self>, outputs: &OutputEmitterFactory) -> Result<BindingTable> {
//!     let counts = outputs.create::<i64>("counts")?;
//!     Ok(BindingTable::new().with_level(
//!         BindingLevel::new("WordCounter").with_process(
//!             ProcessBinding::single("count", move |word: String, _ctx| {
//!                 let counts = counts.clone();
//!                 async move { counts.emit(word.len() as i64).await }
//!             })
//!             .with_input("words"),
//!         ),
//!     ))
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::emitter::OutputEmitterFactory;
use crate::error::{Error, Result};
use crate::metrics::MetricsContext;
use crate::queue::DequeueStrategy;
use crate::reader::QueueReader;
use crate::schema::{DatumDecoder, Schema, SchemaCache, Typed};
use crate::shared::{ComponentError, FlowletId, Topology, ANY_INPUT};

/// Classification of a failed invocation, handed to failure callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    UserException,
    TransactionConflict,
    Serialization,
    Infrastructure,
}

/// What to do once the retry budget of an input is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// Reset the retry budget and keep retrying the same input.
    #[default]
    Retry,
    /// Acknowledge the input without processing it.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub failure_type: FailureType,
    pub message: String,
}

impl From<&Error> for FailureReason {
    fn from(err: &Error) -> Self {
        Self {
            failure_type: err.failure_type(),
            message: err.to_string(),
        }
    }
}

/// Where an input came from and how many times it was delivered before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputContext {
    /// Simple name of the queue or stream, empty for ticks.
    pub origin: String,
    pub retry_count: u32,
}

impl InputContext {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            retry_count: 0,
        }
    }
}

/// Whether a lifecycle hook runs inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionControl {
    #[default]
    Implicit,
    Explicit,
}

/// Runtime information handed to the lifecycle hooks of a flowlet.
#[derive(Debug, Clone)]
pub struct FlowletContext {
    id: FlowletId,
    instance_id: u32,
    instance_count: Arc<AtomicU32>,
    run_id: String,
    runtime_args: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
    metrics: Arc<dyn MetricsContext>,
}

impl FlowletContext {
    pub fn new(
        id: FlowletId,
        instance_id: u32,
        instance_count: u32,
        run_id: impl Into<String>,
        runtime_args: BTreeMap<String, String>,
        properties: BTreeMap<String, String>,
        metrics: Arc<dyn MetricsContext>,
    ) -> Self {
        Self {
            id,
            instance_id,
            instance_count: Arc::new(AtomicU32::new(instance_count)),
            run_id: run_id.into(),
            runtime_args,
            properties,
            metrics,
        }
    }

    pub fn id(&self) -> &FlowletId {
        &self.id
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_instance_count(&self, count: u32) {
        self.instance_count.store(count, Ordering::SeqCst);
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn runtime_args(&self) -> &BTreeMap<String, String> {
        &self.runtime_args
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsContext> {
        &self.metrics
    }
}

/// A user-defined processing unit.
#[async_trait]
pub trait Flowlet: Send + Sync + 'static {
    /// Declares the process and tick methods. Output emitters are created through `outputs`.
    fn bindings(self: Arc<Self>, outputs: &OutputEmitterFactory) -> Result<BindingTable>;

    async fn initialize(&self, _context: &FlowletContext) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn transaction_control(&self) -> TransactionControl {
        TransactionControl::Implicit
    }

    /// Called after an invocation committed.
    fn on_success(&self, _input: &InputContext) {}

    /// Called once the retry budget of an input is exhausted. `None` defers to the failure
    /// policy declared on the flowlet definition.
    fn on_failure(&self, _input: &InputContext, _reason: &FailureReason) -> Option<FailurePolicy> {
        None
    }
}

/// Type-erased process method body.
#[async_trait]
pub trait ProcessHandler: Send + Sync {
    async fn handle(
        &self,
        events: &[Vec<u8>],
        cache: &Arc<SchemaCache>,
        input: &InputContext,
    ) -> Result<()>;
}

/// Type-erased tick method body.
#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn tick(&self) -> Result<()>;
}

struct SingleHandler<T, F> {
    schema: Schema,
    f: F,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> ProcessHandler for SingleHandler<T, F>
where
    T: Typed,
    F: Fn(T, InputContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        events: &[Vec<u8>],
        cache: &Arc<SchemaCache>,
        input: &InputContext,
    ) -> Result<()> {
        let decoder = DatumDecoder::<T>::new(self.schema.clone(), Arc::clone(cache));
        for payload in events {
            (self.f)(decoder.decode(payload)?, input.clone()).await?;
        }
        Ok(())
    }
}

struct BatchHandler<T, F> {
    schema: Schema,
    f: F,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> ProcessHandler for BatchHandler<T, F>
where
    T: Typed,
    F: Fn(Vec<T>, InputContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        events: &[Vec<u8>],
        cache: &Arc<SchemaCache>,
        input: &InputContext,
    ) -> Result<()> {
        let decoder = DatumDecoder::<T>::new(self.schema.clone(), Arc::clone(cache));
        let batch = events
            .iter()
            .map(|payload| decoder.decode(payload))
            .collect::<Result<Vec<_>>>()?;
        (self.f)(batch, input.clone()).await
    }
}

struct FnTickHandler<F>(F);

#[async_trait]
impl<F, Fut> TickHandler for FnTickHandler<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn tick(&self) -> Result<()> {
        (self.0)().await
    }
}

/// How a process method's inputs are split among the instances of the flowlet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Partitioning {
    #[default]
    Fifo,
    RoundRobin,
    /// HASH partitioning on the named partition key.
    Hash(String),
}

impl Partitioning {
    pub fn dequeue_strategy(&self) -> DequeueStrategy {
        match self {
            Partitioning::Fifo => DequeueStrategy::Fifo,
            Partitioning::RoundRobin => DequeueStrategy::RoundRobin,
            Partitioning::Hash(_) => DequeueStrategy::Hash,
        }
    }

    pub fn hash_key(&self) -> Option<String> {
        match self {
            Partitioning::Hash(key) => Some(key.clone()),
            _ => None,
        }
    }
}

/// Batch declaration of a process method taking a sequence of events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    pub size: i64,
    /// Runtime argument or flowlet property overriding `size`.
    pub key: Option<String>,
}

/// An event handler declaration.
#[derive(Clone)]
pub struct ProcessBinding {
    name: String,
    inputs: Vec<String>,
    schema: Schema,
    batch: Option<BatchSpec>,
    partitioning: Partitioning,
    max_retries: Option<u32>,
    handler: Arc<dyn ProcessHandler>,
}

impl fmt::Debug for ProcessBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBinding")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("schema", &self.schema)
            .field("batch", &self.batch)
            .field("partitioning", &self.partitioning)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ProcessBinding {
    /// A method invoked with one event at a time.
    pub fn single<T, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        T: Typed,
        F: Fn(T, InputContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::with_handler(
            name,
            T::schema(),
            None,
            Arc::new(SingleHandler {
                schema: T::schema(),
                f,
                _marker: PhantomData,
            }),
        )
    }

    /// A method invoked with up to `size` events at a time.
    pub fn batch<T, F, Fut>(name: impl Into<String>, size: i64, f: F) -> Self
    where
        T: Typed,
        F: Fn(Vec<T>, InputContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::with_handler(
            name,
            T::schema(),
            Some(BatchSpec { size, key: None }),
            Arc::new(BatchHandler {
                schema: T::schema(),
                f,
                _marker: PhantomData,
            }),
        )
    }

    fn with_handler(
        name: impl Into<String>,
        schema: Schema,
        batch: Option<BatchSpec>,
        handler: Arc<dyn ProcessHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            schema,
            batch,
            partitioning: Partitioning::default(),
            max_retries: None,
            handler,
        }
    }

    /// Adds a declared input name. Without any, the method reads every compatible edge.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Lets a runtime argument or flowlet property named `key` override the batch size.
    /// No effect on single-event methods.
    pub fn with_batch_key(mut self, key: impl Into<String>) -> Self {
        if let Some(batch) = &mut self.batch {
            batch.key = Some(key.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared input names; the wildcard when none was declared.
    pub fn inputs(&self) -> Vec<String> {
        if self.inputs.is_empty() {
            vec![ANY_INPUT.to_string()]
        } else {
            self.inputs.clone()
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn batch_spec(&self) -> Option<&BatchSpec> {
        self.batch.as_ref()
    }

    pub fn partitioning(&self) -> &Partitioning {
        &self.partitioning
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn handler(&self) -> Arc<dyn ProcessHandler> {
        Arc::clone(&self.handler)
    }

    /// Resolves the batch size. The override key is looked up in the runtime arguments first,
    /// then in the flowlet properties. Single-event methods always take one event.
    pub fn batch_size(
        &self,
        runtime_args: &BTreeMap<String, String>,
        properties: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let Some(batch) = &self.batch else {
            return Ok(1);
        };
        let size = match &batch.key {
            Some(key) => match runtime_args.get(key).or_else(|| properties.get(key)) {
                Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                    Topology::config_error(format!(
                        "batch size '{raw}' under key '{key}' of method '{}' is not a number",
                        self.name
                    ))
                })?,
                None => batch.size,
            },
            None => batch.size,
        };
        if size <= 0 {
            return Err(Topology::config_error(format!(
                "batch size of method '{}' must be positive, got {size}",
                self.name
            )));
        }
        Ok(size as usize)
    }
}

/// A periodic method taking no input.
#[derive(Clone)]
pub struct TickBinding {
    name: String,
    delay: Duration,
    initial_delay: Duration,
    max_retries: Option<u32>,
    handler: Arc<dyn TickHandler>,
}

impl fmt::Debug for TickBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickBinding")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("initial_delay", &self.initial_delay)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl TickBinding {
    pub fn new<F, Fut>(name: impl Into<String>, delay: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            delay,
            initial_delay: Duration::ZERO,
            max_retries: None,
            handler: Arc::new(FnTickHandler(f)),
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn handler(&self) -> Arc<dyn TickHandler> {
        Arc::clone(&self.handler)
    }
}

#[derive(Debug, Clone)]
pub enum MethodBinding {
    Process(ProcessBinding),
    Tick(TickBinding),
}

impl MethodBinding {
    pub fn name(&self) -> &str {
        match self {
            MethodBinding::Process(p) => p.name(),
            MethodBinding::Tick(t) => t.name(),
        }
    }
}

/// Methods declared by one type of the flowlet's hierarchy.
#[derive(Debug, Clone)]
pub struct BindingLevel {
    type_name: String,
    methods: Vec<MethodBinding>,
}

impl BindingLevel {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            methods: Vec::new(),
        }
    }

    pub fn with_process(mut self, binding: ProcessBinding) -> Self {
        self.methods.push(MethodBinding::Process(binding));
        self
    }

    pub fn with_tick(mut self, binding: TickBinding) -> Self {
        self.methods.push(MethodBinding::Tick(binding));
        self
    }
}

/// Every method of a flowlet, levels ordered from the most specific type to the most general.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    levels: Vec<BindingLevel>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a level, less specific than the ones added before.
    pub fn with_level(mut self, level: BindingLevel) -> Self {
        self.levels.push(level);
        self
    }

    /// The effective methods: for every name only the most specific binding survives.
    pub fn resolve(&self) -> Vec<MethodBinding> {
        let mut seen = HashSet::new();
        let mut methods = Vec::new();
        for level in &self.levels {
            for method in &level.methods {
                if seen.insert(method.name().to_string()) {
                    methods.push(method.clone());
                } else {
                    debug!(
                        method = method.name(),
                        level = %level.type_name,
                        "Skipping overridden method"
                    );
                }
            }
        }
        methods
    }
}

/// What a resolved method runs on.
pub enum ProcessKind {
    Event {
        handler: Arc<dyn ProcessHandler>,
        reader: Box<dyn QueueReader>,
        batch_size: usize,
        cache: Arc<SchemaCache>,
    },
    Tick {
        handler: Arc<dyn TickHandler>,
        delay: Duration,
        initial_delay: Duration,
    },
}

/// A method bound to its input sources, batch size and retry budget.
pub struct ProcessSpecification {
    name: String,
    max_retries: u32,
    kind: ProcessKind,
}

impl fmt::Debug for ProcessSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ProcessKind::Event { batch_size, .. } => format!("event(batch={batch_size})"),
            ProcessKind::Tick { delay, .. } => format!("tick({delay:?})"),
        };
        f.debug_struct("ProcessSpecification")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("kind", &kind)
            .finish()
    }
}

impl ProcessSpecification {
    pub fn event(
        name: impl Into<String>,
        handler: Arc<dyn ProcessHandler>,
        reader: Box<dyn QueueReader>,
        batch_size: usize,
        cache: Arc<SchemaCache>,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            max_retries,
            kind: ProcessKind::Event {
                handler,
                reader,
                batch_size,
                cache,
            },
        }
    }

    pub fn tick(binding: &TickBinding, max_retries: u32) -> Self {
        Self {
            name: binding.name().to_string(),
            max_retries,
            kind: ProcessKind::Tick {
                handler: binding.handler(),
                delay: binding.delay(),
                initial_delay: binding.initial_delay(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn kind(&self) -> &ProcessKind {
        &self.kind
    }

    pub fn is_tick(&self) -> bool {
        matches!(self.kind, ProcessKind::Tick { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::ErrorKind;
    use crate::schema;

    fn noop_single(name: &str) -> ProcessBinding {
        ProcessBinding::single(name, |_: String, _| async { Ok(()) })
    }

    #[test]
    fn test_resolve_skips_overridden_methods() {
        let table = BindingTable::new()
            .with_level(
                BindingLevel::new("Leaf")
                    .with_process(noop_single("process").with_input("leaf"))
                    .with_tick(TickBinding::new("tick", Duration::from_secs(1), || async {
                        Ok(())
                    })),
            )
            .with_level(
                BindingLevel::new("Base")
                    .with_process(noop_single("process").with_input("base"))
                    .with_process(noop_single("other")),
            );

        let methods = table.resolve();
        let names: Vec<_> = methods.iter().map(MethodBinding::name).collect();
        assert_eq!(names, vec!["process", "tick", "other"]);

        let MethodBinding::Process(process) = &methods[0] else {
            panic!("expected a process method");
        };
        assert_eq!(process.inputs(), vec!["leaf".to_string()]);
        let MethodBinding::Process(other) = &methods[2] else {
            panic!("expected a process method");
        };
        assert_eq!(other.inputs(), vec![ANY_INPUT.to_string()]);
    }

    #[test]
    fn test_batch_size_lookup() {
        let binding = ProcessBinding::batch("process", 10, |_: Vec<String>, _| async { Ok(()) })
            .with_batch_key("batch.size");
        let none = BTreeMap::new();
        let args = BTreeMap::from([("batch.size".to_string(), "25".to_string())]);
        let props = BTreeMap::from([("batch.size".to_string(), "5".to_string())]);

        assert_eq!(binding.batch_spec().map(|b| b.size), Some(10));
        assert_eq!(binding.batch_size(&none, &none).unwrap(), 10);
        assert_eq!(binding.batch_size(&none, &props).unwrap(), 5);
        assert_eq!(binding.batch_size(&args, &props).unwrap(), 25);

        let bad = BTreeMap::from([("batch.size".to_string(), "many".to_string())]);
        assert!(binding.batch_size(&bad, &none).unwrap_err().is_fatal());

        let zero = ProcessBinding::batch("process", 0, |_: Vec<String>, _| async { Ok(()) });
        assert!(zero.batch_size(&none, &none).unwrap_err().is_fatal());

        assert!(noop_single("p").batch_spec().is_none());
        assert_eq!(noop_single("p").batch_size(&args, &props).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handlers_decode_per_invocation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let binding = ProcessBinding::batch("process", 10, {
            let seen = seen.clone();
            move |words: Vec<String>, input: InputContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((words, input.retry_count));
                    Ok(())
                }
            }
        });

        let cache = Arc::new(SchemaCache::new([Schema::String]));
        let events: Vec<_> = ["a", "b"]
            .iter()
            .map(|w| schema::encode(&Schema::String, &w.to_string()).unwrap())
            .collect();
        let mut input = InputContext::new("words");
        binding.handler().handle(&events, &cache, &input).await.unwrap();
        input.retry_count = 1;
        binding.handler().handle(&events, &cache, &input).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (vec!["a".to_string(), "b".to_string()], 1));
    }

    #[tokio::test]
    async fn test_single_handler_propagates_errors() {
        let binding = ProcessBinding::single("process", |n: i64, _| async move {
            if n < 0 {
                return Err(Error::user("negative"));
            }
            Ok(())
        });
        let cache = Arc::new(SchemaCache::new([Schema::Long]));
        let payload = schema::encode(&Schema::Long, &-1i64).unwrap();
        let err = binding
            .handler()
            .handle(&[payload], &cache, &InputContext::new("numbers"))
            .await
            .unwrap_err();
        assert_eq!(err.failure_type(), FailureType::UserException);

        // undecodable payload
        let err = binding
            .handler()
            .handle(&[vec![0u8; 4]], &cache, &InputContext::new("numbers"))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SerializationError(_)));
    }

    #[test]
    fn test_failure_policy_serde() {
        assert_eq!(
            serde_json::to_string(&FailurePolicy::Ignore).unwrap(),
            "\"IGNORE\""
        );
        let reason = FailureReason::from(&Topology::config_error("x"));
        assert_eq!(reason.failure_type, FailureType::Infrastructure);
    }
}
