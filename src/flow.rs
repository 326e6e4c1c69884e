//! Flow topology: flowlet definitions, connections and the queue specifications derived from them.
//!
//! A [`FlowSpecification`] is immutable for the lifetime of a deployed application version. The
//! [`QueueSpecificationTable`] generated from it answers the two questions the runtime asks:
//! which edges feed a flowlet (a column of the table) and which edges leave it (a row).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::process::FailurePolicy;
use crate::queue::StreamEvent;
use crate::schema::{Schema, Typed};
use crate::shared::{
    ComponentError, FlowletId, Node, NodeType, QueueName, StreamId, Topology, ANY_INPUT,
    DEFAULT_NAMESPACE,
};

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_instances() -> u32 {
    1
}

/// The declared graph of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpecification {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub application: String,
    pub name: String,
    pub flowlets: BTreeMap<String, FlowletDefinition>,
    #[serde(default)]
    pub connections: Vec<FlowletConnection>,
}

/// Static definition of one flowlet of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowletDefinition {
    pub name: String,
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Input name to accepted schemas. The empty name accepts any edge.
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<Schema>>,
    /// Output name to emitted schemas.
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<Schema>>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub datasets: BTreeSet<String>,
}

impl FlowletDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: default_instances(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            properties: BTreeMap::new(),
            failure_policy: FailurePolicy::default(),
            datasets: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.inputs.entry(name.into()).or_default().push(schema);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.outputs.entry(name.into()).or_default().push(schema);
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.datasets.insert(dataset.into());
        self
    }

    /// Schemas accepted under `name`, falling back to the wildcard input.
    fn input_schemas(&self, name: &str) -> Option<&Vec<Schema>> {
        self.inputs.get(name).or_else(|| self.inputs.get(ANY_INPUT))
    }
}

/// A directed edge from a flowlet or stream to a flowlet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowletConnection {
    pub source_type: NodeType,
    pub source_name: String,
    pub target_name: String,
}

impl FlowletConnection {
    pub fn from_flowlet(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_type: NodeType::Flowlet,
            source_name: source.into(),
            target_name: target.into(),
        }
    }

    pub fn from_stream(stream: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_type: NodeType::Stream,
            source_name: stream.into(),
            target_name: target.into(),
        }
    }

    pub fn source(&self) -> Node {
        Node {
            node_type: self.source_type,
            name: self.source_name.clone(),
        }
    }
}

impl FlowSpecification {
    pub fn new(application: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: default_namespace(),
            application: application.into(),
            name: name.into(),
            flowlets: BTreeMap::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_flowlet(mut self, flowlet: FlowletDefinition) -> Self {
        self.flowlets.insert(flowlet.name.clone(), flowlet);
        self
    }

    pub fn with_connection(mut self, connection: FlowletConnection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Parses and validates a flow from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: FlowSpecification = serde_json::from_str(json)
            .map_err(|e| Topology::config_error(format!("invalid flow specification: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Topology::config_error(format!("reading flow specification {path:?}: {e}"))
        })?;
        Self::from_json(&json)
    }

    /// Every connection must join declared nodes and every flowlet needs an instance.
    pub fn validate(&self) -> Result<()> {
        for (name, flowlet) in &self.flowlets {
            if name != &flowlet.name {
                return Err(Topology::config_error(format!(
                    "flowlet registered as '{name}' is named '{}'",
                    flowlet.name
                )));
            }
            if flowlet.instances == 0 {
                return Err(Topology::config_error(format!(
                    "flowlet '{name}' must have at least one instance"
                )));
            }
        }
        for conn in &self.connections {
            if !self.flowlets.contains_key(&conn.target_name) {
                return Err(Topology::config_error(format!(
                    "connection targets unknown flowlet '{}'",
                    conn.target_name
                )));
            }
            if conn.source_type == NodeType::Flowlet
                && !self.flowlets.contains_key(&conn.source_name)
            {
                return Err(Topology::config_error(format!(
                    "connection starts at unknown flowlet '{}'",
                    conn.source_name
                )));
            }
        }
        Ok(())
    }

    pub fn flowlet(&self, name: &str) -> Option<&FlowletDefinition> {
        self.flowlets.get(name)
    }

    pub fn flowlet_id(&self, flowlet: &str) -> FlowletId {
        FlowletId::new(&self.namespace, &self.application, &self.name, flowlet)
    }

    pub fn stream_id(&self, stream: &str) -> StreamId {
        StreamId::new(&self.namespace, stream)
    }

    /// Every schema that may appear on an edge of this flow, stream events included.
    pub fn schemas(&self) -> Vec<Schema> {
        let mut schemas = vec![StreamEvent::schema()];
        for flowlet in self.flowlets.values() {
            for schema in flowlet.inputs.values().chain(flowlet.outputs.values()).flatten() {
                if !schemas.contains(schema) {
                    schemas.push(schema.clone());
                }
            }
        }
        schemas
    }
}

/// One edge as seen by the queue layer: the queue it runs over, the schema the producer writes
/// and the schema the consumer reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpecification {
    pub queue_name: QueueName,
    pub input_schema: Schema,
    pub output_schema: Schema,
}

/// Queue specifications keyed by source node then target flowlet.
#[derive(Debug, Default, Clone)]
pub struct QueueSpecificationTable {
    table: BTreeMap<Node, BTreeMap<String, Vec<QueueSpecification>>>,
}

impl QueueSpecificationTable {
    /// Derives the queue specification of every connection of the flow.
    ///
    /// Each output schema of the source is matched against the target's inputs of the same name
    /// (or the wildcard input), picking the first compatible input schema. A connection without
    /// any match is a configuration error.
    pub fn generate(flow: &FlowSpecification) -> Result<Self> {
        let mut table = Self::default();

        for conn in &flow.connections {
            let target = flow.flowlet(&conn.target_name).ok_or_else(|| {
                Topology::config_error(format!("unknown flowlet '{}'", conn.target_name))
            })?;
            let source = conn.source();

            let specs = match conn.source_type {
                NodeType::Stream => {
                    let queue_name = QueueName::from_stream(&flow.stream_id(&conn.source_name));
                    Self::matching(target, &conn.source_name, queue_name, &StreamEvent::schema())
                        .into_iter()
                        .collect::<Vec<_>>()
                }
                NodeType::Flowlet => {
                    let producer = flow.flowlet(&conn.source_name).ok_or_else(|| {
                        Topology::config_error(format!("unknown flowlet '{}'", conn.source_name))
                    })?;
                    let id = flow.flowlet_id(&producer.name);
                    producer
                        .outputs
                        .iter()
                        .flat_map(|(output, schemas)| {
                            schemas.iter().filter_map(|schema| {
                                Self::matching(target, output, id.queue(output), schema)
                            })
                        })
                        .collect()
                }
            };

            if specs.is_empty() {
                return Err(Topology::config_error(format!(
                    "no compatible input on '{}' for connection from {:?} '{}'",
                    conn.target_name, conn.source_type, conn.source_name
                )));
            }

            debug!(
                source = %conn.source_name,
                target = %conn.target_name,
                queues = specs.len(),
                "Generated queue specifications"
            );
            let cell = table
                .table
                .entry(source)
                .or_default()
                .entry(conn.target_name.clone())
                .or_default();
            for spec in specs {
                if !cell.contains(&spec) {
                    cell.push(spec);
                }
            }
        }
        Ok(table)
    }

    fn matching(
        target: &FlowletDefinition,
        input: &str,
        queue_name: QueueName,
        output_schema: &Schema,
    ) -> Option<QueueSpecification> {
        let input_schema = target
            .input_schemas(input)?
            .iter()
            .find(|schema| output_schema.is_compatible_with(schema))?;
        Some(QueueSpecification {
            queue_name,
            input_schema: input_schema.clone(),
            output_schema: output_schema.clone(),
        })
    }

    /// Edges leaving `source`, grouped by target flowlet.
    pub fn row<'a>(
        &'a self,
        source: &Node,
    ) -> impl Iterator<Item = (&'a str, &'a [QueueSpecification])> + 'a {
        self.table
            .get(source)
            .into_iter()
            .flat_map(|targets| targets.iter().map(|(t, specs)| (t.as_str(), specs.as_slice())))
    }

    /// Edges entering the `target` flowlet, grouped by source node.
    pub fn column<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = (&'a Node, &'a [QueueSpecification])> + 'a {
        self.table.iter().filter_map(move |(source, targets)| {
            targets
                .get(target)
                .map(|specs| (source, specs.as_slice()))
        })
    }

    pub fn get(&self, source: &Node, target: &str) -> &[QueueSpecification] {
        self.table
            .get(source)
            .and_then(|targets| targets.get(target))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of consumer groups (distinct target flowlets) reading `queue` from `source`.
    pub fn consumer_groups(&self, source: &Node, queue: &QueueName) -> usize {
        self.row(source)
            .filter(|(_, specs)| specs.iter().any(|spec| &spec.queue_name == queue))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn word_count_flow() -> FlowSpecification {
        FlowSpecification::new("app", "wordcount")
            .with_flowlet(
                FlowletDefinition::new("splitter")
                    .with_input("", StreamEvent::schema())
                    .with_output("words", Schema::String),
            )
            .with_flowlet(
                FlowletDefinition::new("counter")
                    .with_instances(3)
                    .with_input("words", Schema::String),
            )
            .with_flowlet(FlowletDefinition::new("auditor").with_input("", Schema::String))
            .with_connection(FlowletConnection::from_stream("text", "splitter"))
            .with_connection(FlowletConnection::from_flowlet("splitter", "counter"))
            .with_connection(FlowletConnection::from_flowlet("splitter", "auditor"))
    }

    #[test]
    fn test_generate_queue_specifications() {
        let flow = word_count_flow();
        let table = QueueSpecificationTable::generate(&flow).unwrap();

        let stream_specs = table.get(&Node::stream("text"), "splitter");
        assert_eq!(stream_specs.len(), 1);
        assert_eq!(stream_specs[0].queue_name.as_str(), "stream:///default/text");
        assert_eq!(stream_specs[0].output_schema, StreamEvent::schema());

        let words = flow.flowlet_id("splitter").queue("words");
        let counter_specs = table.get(&Node::flowlet("splitter"), "counter");
        assert_eq!(counter_specs[0].queue_name, words);
        assert_eq!(counter_specs[0].input_schema, Schema::String);

        assert_eq!(table.consumer_groups(&Node::flowlet("splitter"), &words), 2);
        assert_eq!(table.column("counter").count(), 1);
        assert_eq!(table.row(&Node::flowlet("splitter")).count(), 2);
    }

    #[test]
    fn test_generate_rejects_incompatible_connection() {
        let flow = word_count_flow().with_flowlet(
            FlowletDefinition::new("counter").with_input("words", Schema::Long),
        );
        let err = QueueSpecificationTable::generate(&flow).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validate_unknown_flowlet() {
        let flow = word_count_flow().with_connection(FlowletConnection::from_flowlet("ghost", "counter"));
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let json = serde_json::to_string(&word_count_flow()).unwrap();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let flow = FlowSpecification::from_json_file(file.path()).unwrap();
        assert_eq!(flow, word_count_flow());
        assert_eq!(flow.flowlet("counter").unwrap().instances, 3);
        assert!(flow.schemas().contains(&Schema::String));
    }

    #[test]
    fn test_from_json_defaults() {
        let flow = FlowSpecification::from_json(
            r#"{
                "application": "app",
                "name": "f",
                "flowlets": {"a": {"name": "a"}}
            }"#,
        )
        .unwrap();
        assert_eq!(flow.namespace, DEFAULT_NAMESPACE);
        let a = flow.flowlet("a").unwrap();
        assert_eq!(a.instances, 1);
        assert_eq!(a.failure_policy, FailurePolicy::Retry);

        assert!(FlowSpecification::from_json("{").unwrap_err().is_fatal());
    }
}
