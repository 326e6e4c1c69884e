//! Assembly of a flowlet instance.
//!
//! [`FlowletProgramRunner::run`] turns a flow, a flowlet implementation and the instance options
//! into a running instance:
//!
//! 1. the flowlet declares its methods, creating its output emitters on the way,
//! 2. every process method is bound to the edges feeding the flowlet with its schema and one of
//!    its declared input names, through one consumer supplier per edge,
//! 3. the suppliers are opened, the lifecycle service starts and a controller is returned.
//!
//! Anything acquired is released again when a later step fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::DriverContext;
use crate::emitter::OutputEmitterFactory;
use crate::error::Result;
use crate::flow::{FlowSpecification, QueueSpecificationTable};
use crate::metrics::{flowlet_context, pending_context, tags, MetricsContext, RecorderMetrics};
use crate::process::{Flowlet, FlowletContext, MethodBinding, ProcessBinding, ProcessSpecification};
use crate::queue::{
    ConsumerConfig, ConsumerSupplier, ProducerSupplier, QueueClientFactory,
    StreamCoordinatorClient,
};
use crate::reader::{QueueReader, RoundRobinQueueReader, SupplierReader};
use crate::runtime::{FlowletProgramController, FlowletRuntimeService, FlowletServiceHook};
use crate::schema::SchemaCache;
use crate::shared::{
    ComponentError, FlowletId, NodeType, QueueName, RuntimeConfig, Topology, ANY_INPUT,
};
use crate::transaction::{DataFabricFacade, TransactionAware, TransactionSystemClient};

pub const INSTANCE_ID_ARG: &str = "instanceId";
pub const INSTANCES_ARG: &str = "instances";
pub const RUN_ID_ARG: &str = "runId";

/// Identity of the instance to run and the runtime arguments of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramOptions {
    instance_id: u32,
    instances: u32,
    run_id: String,
    runtime_args: BTreeMap<String, String>,
}

impl ProgramOptions {
    /// Options for instance `instance_id` out of `instances`, under a random run id.
    pub fn new(instance_id: u32, instances: u32) -> Result<Self> {
        if instances == 0 {
            return Err(Topology::config_error("instance count must be positive"));
        }
        if instance_id >= instances {
            return Err(Topology::config_error(format!(
                "instance id {instance_id} must be less than the instance count {instances}"
            )));
        }
        Ok(Self {
            instance_id,
            instances,
            run_id: Uuid::new_v4().to_string(),
            runtime_args: BTreeMap::new(),
        })
    }

    /// Parses `instanceId`, `instances` and the optional `runId`. Every other entry is kept as a
    /// runtime argument.
    pub fn from_arguments(args: &BTreeMap<String, String>) -> Result<Self> {
        let instance_id = parse_arg(args, INSTANCE_ID_ARG)?;
        let instances = parse_arg(args, INSTANCES_ARG)?;
        let mut options = Self::new(instance_id, instances)?;
        if let Some(run_id) = args.get(RUN_ID_ARG) {
            options.run_id = run_id.clone();
        }
        options.runtime_args = args
            .iter()
            .filter(|(k, _)| ![INSTANCE_ID_ARG, INSTANCES_ARG, RUN_ID_ARG].contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(options)
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_runtime_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_args.insert(key.into(), value.into());
        self
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn instances(&self) -> u32 {
        self.instances
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn runtime_args(&self) -> &BTreeMap<String, String> {
        &self.runtime_args
    }
}

fn parse_arg(args: &BTreeMap<String, String>, key: &str) -> Result<u32> {
    let raw = args
        .get(key)
        .ok_or_else(|| Topology::config_error(format!("missing argument '{key}'")))?;
    raw.trim()
        .parse()
        .map_err(|_| Topology::config_error(format!("argument '{key}' is not a valid count: '{raw}'")))
}

/// Launches flowlet instances against the given storage, transaction and coordination services.
pub struct FlowletProgramRunner {
    queue_factory: Arc<dyn QueueClientFactory>,
    tx_client: Arc<dyn TransactionSystemClient>,
    coordinator: Arc<dyn StreamCoordinatorClient>,
    config: RuntimeConfig,
    metrics: Option<Arc<dyn MetricsContext>>,
}

impl FlowletProgramRunner {
    pub fn new(
        queue_factory: Arc<dyn QueueClientFactory>,
        tx_client: Arc<dyn TransactionSystemClient>,
        coordinator: Arc<dyn StreamCoordinatorClient>,
    ) -> Self {
        Self {
            queue_factory,
            tx_client,
            coordinator,
            config: RuntimeConfig::default(),
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Root metrics context. Instances tag it with their identity. Defaults to the global
    /// `metrics` recorder.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsContext>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Context of flowlet `id` as a whole, without any instance tag.
    fn flowlet_metrics(&self, id: &FlowletId) -> Arc<dyn MetricsContext> {
        match &self.metrics {
            Some(root) => flowlet_context(&**root, id),
            None => Arc::new(RecorderMetrics::for_flowlet(id)),
        }
    }

    /// Starts instance `options.instance_id()` of `flowlet_name`. `datasets` must cover every
    /// dataset declared by the flowlet.
    #[tracing::instrument(skip_all, fields(flowlet = %flowlet_name, instance = options.instance_id()))]
    pub async fn run(
        &self,
        flow: &FlowSpecification,
        flowlet_name: &str,
        flowlet: Arc<dyn Flowlet>,
        datasets: Vec<Arc<dyn TransactionAware>>,
        options: ProgramOptions,
    ) -> Result<FlowletProgramController> {
        flow.validate()?;
        let definition = flow.flowlet(flowlet_name).ok_or_else(|| {
            Topology::config_error(format!("flowlet '{flowlet_name}' is not part of flow '{}'", flow.name))
        })?;
        for name in &definition.datasets {
            if !datasets.iter().any(|d| &d.name() == name) {
                return Err(Topology::config_error(format!(
                    "dataset '{name}' of flowlet '{flowlet_name}' was not provided"
                )));
            }
        }

        let id = flow.flowlet_id(flowlet_name);
        let flowlet_metrics = self.flowlet_metrics(&id);
        let metrics = flowlet_metrics.child(tags::INSTANCE, &options.instance_id().to_string());
        let queue_specs = Arc::new(QueueSpecificationTable::generate(flow)?);
        let cache = Arc::new(SchemaCache::new(flow.schemas()));

        let emitters = OutputEmitterFactory::new(
            id.clone(),
            Arc::clone(&queue_specs),
            Arc::clone(&self.queue_factory),
            Arc::clone(&metrics),
            flowlet_metrics,
        );
        let methods = Arc::clone(&flowlet).bindings(&emitters)?.resolve();

        let mut consumers: BTreeMap<QueueName, Arc<ConsumerSupplier>> = BTreeMap::new();
        let mut specs = Vec::new();
        for method in methods {
            match method {
                MethodBinding::Process(binding) => {
                    let readers = self.bind_inputs(
                        &binding,
                        &id,
                        &queue_specs,
                        &options,
                        &metrics,
                        &mut consumers,
                    )?;
                    if readers.is_empty() {
                        warn!(method = binding.name(), "No input edge for process method");
                        continue;
                    }
                    let batch_size =
                        binding.batch_size(options.runtime_args(), &definition.properties)?;
                    let max_retries = binding
                        .max_retries()
                        .unwrap_or_else(|| self.config.default_max_retries());
                    debug!(method = binding.name(), inputs = readers.len(), batch_size, max_retries, "Bound process method");
                    specs.push(ProcessSpecification::event(
                        binding.name(),
                        binding.handler(),
                        Box::new(RoundRobinQueueReader::new(readers)),
                        batch_size,
                        Arc::clone(&cache),
                        max_retries,
                    ));
                }
                MethodBinding::Tick(binding) => {
                    let max_retries = binding
                        .max_retries()
                        .unwrap_or_else(|| self.config.default_max_retries());
                    debug!(method = binding.name(), delay = ?binding.delay(), "Bound tick method");
                    specs.push(ProcessSpecification::tick(&binding, max_retries));
                }
            }
        }
        if specs.is_empty() {
            return Err(Topology::config_error(format!(
                "no process method of flowlet '{flowlet_name}' has an input"
            )));
        }

        let consumers: Vec<_> = consumers.into_values().collect();
        let producers = emitters.producers();

        let context = FlowletContext::new(
            id.clone(),
            options.instance_id(),
            options.instances(),
            options.run_id(),
            options.runtime_args().clone(),
            definition.properties.clone(),
            Arc::clone(&metrics),
        );
        let data_fabric = datasets.into_iter().fold(
            DataFabricFacade::new(Arc::clone(&self.tx_client), self.config.tx_timeout()),
            DataFabricFacade::with_dataset,
        );
        let mut driver_context = DriverContext::new(Arc::clone(&flowlet), id, data_fabric)
            .with_failure_policy(definition.failure_policy)
            .with_config(self.config.clone())
            .with_metrics(Arc::clone(&metrics));
        for spec in specs {
            driver_context = driver_context.with_spec(spec);
        }
        for consumer in &consumers {
            driver_context = driver_context.with_participant(consumer.clone());
        }
        for producer in &producers {
            driver_context = driver_context.with_participant(producer.clone());
        }

        let (hook, changes) = FlowletServiceHook::new();
        let service = FlowletRuntimeService::new(context, Arc::new(driver_context))
            .with_consumers(consumers.clone())
            .with_producers(producers.clone())
            .with_watcher(Arc::clone(&self.coordinator), hook);

        if let Err(e) = open_all(&consumers, &producers).await {
            warn!(error = %e, "Failed to open queues, releasing resources");
            release(&service).await;
            return Err(e);
        }
        if let Err(e) = service.start().await {
            warn!(error = %e, "Failed to start flowlet, releasing resources");
            release(&service).await;
            return Err(e);
        }

        info!(
            consumers = consumers.len(),
            producers = producers.len(),
            "Flowlet instance running"
        );
        Ok(FlowletProgramController::new(service, changes))
    }

    /// One reader per edge feeding `binding`, creating the consumer supplier of the edge when no
    /// other method did.
    fn bind_inputs(
        &self,
        binding: &ProcessBinding,
        id: &FlowletId,
        queue_specs: &QueueSpecificationTable,
        options: &ProgramOptions,
        metrics: &Arc<dyn MetricsContext>,
        consumers: &mut BTreeMap<QueueName, Arc<ConsumerSupplier>>,
    ) -> Result<Vec<Box<dyn QueueReader>>> {
        let inputs = binding.inputs();
        let mut readers: Vec<Box<dyn QueueReader>> = Vec::new();

        for (source, specs) in queue_specs.column(&id.flowlet) {
            for spec in specs {
                let name = spec.queue_name.simple_name();
                if &spec.input_schema != binding.schema()
                    || !inputs.iter().any(|input| input == ANY_INPUT || input == name)
                {
                    continue;
                }

                let supplier = match consumers.get(&spec.queue_name) {
                    Some(supplier) => Arc::clone(supplier),
                    None => {
                        let config = ConsumerConfig::new(
                            id.group_id(),
                            options.instance_id(),
                            options.instances(),
                            binding.partitioning().dequeue_strategy(),
                            binding.partitioning().hash_key(),
                        )?;
                        let supplier = match source.node_type {
                            NodeType::Stream => {
                                let stream = spec.queue_name.to_stream_id().ok_or_else(|| {
                                    Topology::config_error(format!(
                                        "'{}' is not a stream",
                                        spec.queue_name
                                    ))
                                })?;
                                ConsumerSupplier::stream(
                                    Arc::clone(&self.queue_factory),
                                    stream,
                                    config,
                                )
                            }
                            NodeType::Flowlet => ConsumerSupplier::queue(
                                Arc::clone(&self.queue_factory),
                                spec.queue_name.clone(),
                                config,
                                queue_specs.consumer_groups(source, &spec.queue_name),
                            ),
                        };
                        let supplier = Arc::new(supplier);
                        consumers.insert(spec.queue_name.clone(), Arc::clone(&supplier));
                        supplier
                    }
                };

                let producer_metrics = match source.node_type {
                    NodeType::Flowlet => {
                        let producer = FlowletId::new(
                            &id.namespace,
                            &id.application,
                            &id.flow,
                            &source.name,
                        );
                        Some(pending_context(
                            &*self.flowlet_metrics(&producer),
                            name,
                            &id.flowlet,
                        ))
                    }
                    NodeType::Stream => None,
                };
                debug!(method = binding.name(), queue = %spec.queue_name, "Bound input");
                readers.push(Box::new(SupplierReader::new(
                    supplier,
                    Arc::clone(metrics),
                    producer_metrics,
                )));
            }
        }
        Ok(readers)
    }
}

async fn open_all(
    consumers: &[Arc<ConsumerSupplier>],
    producers: &[Arc<ProducerSupplier>],
) -> Result<()> {
    for consumer in consumers {
        consumer.open().await?;
    }
    for producer in producers {
        producer.open().await?;
    }
    Ok(())
}

async fn release(service: &FlowletRuntimeService) {
    if let Err(e) = service.release().await {
        warn!(error = %e, "Failed to release resources");
    }
}
