//! Identifiers and constants used across the flowlet runtime
//!
//! Queue names follow the `queue:///<namespace>/<app>/<flow>/<flowlet>/<output>` and
//! `stream:///<namespace>/<stream>` layouts, the simple name being the last path segment.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Input name that matches every queue or stream connected to a flowlet.
pub const ANY_INPUT: &str = "";

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

const QUEUE_SCHEME: &str = "queue:///";
const STREAM_SCHEME: &str = "stream:///";

/// Fully qualified identity of a flowlet inside a deployed application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowletId {
    pub namespace: String,
    pub application: String,
    pub flow: String,
    pub flowlet: String,
}

impl FlowletId {
    pub fn new(
        namespace: impl Into<String>,
        application: impl Into<String>,
        flow: impl Into<String>,
        flowlet: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            application: application.into(),
            flow: flow.into(),
            flowlet: flowlet.into(),
        }
    }

    /// Consumer group id shared by every instance of this flowlet. It is stable across
    /// processes so that all instances land in the same group.
    pub fn group_id(&self) -> u64 {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Name of the queue written by `output` of this flowlet.
    pub fn queue(&self, output: &str) -> QueueName {
        QueueName::from_flowlet(
            &self.namespace,
            &self.application,
            &self.flow,
            &self.flowlet,
            output,
        )
    }
}

impl fmt::Display for FlowletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.namespace, self.application, self.flow, self.flowlet
        )
    }
}

/// Identity of an external ingestion stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub namespace: String,
    pub stream: String,
}

impl StreamId {
    pub fn new(namespace: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.stream)
    }
}

/// URI style name of a queue or stream edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn from_flowlet(
        namespace: &str,
        application: &str,
        flow: &str,
        flowlet: &str,
        output: &str,
    ) -> Self {
        Self(format!(
            "{QUEUE_SCHEME}{namespace}/{application}/{flow}/{flowlet}/{output}"
        ))
    }

    pub fn from_stream(stream: &StreamId) -> Self {
        Self(format!("{STREAM_SCHEME}{}/{}", stream.namespace, stream.stream))
    }

    pub fn is_stream(&self) -> bool {
        self.0.starts_with(STREAM_SCHEME)
    }

    pub fn is_queue(&self) -> bool {
        self.0.starts_with(QUEUE_SCHEME)
    }

    /// The last path segment: the output name for queues, the stream name for streams.
    pub fn simple_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Stream identity, `None` for flowlet queues.
    pub fn to_stream_id(&self) -> Option<StreamId> {
        let rest = self.0.strip_prefix(STREAM_SCHEME)?;
        let (namespace, stream) = rest.split_once('/')?;
        Some(StreamId::new(namespace, stream))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of node at the source end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Flowlet,
    Stream,
}

/// A node of the flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub node_type: NodeType,
    pub name: String,
}

impl Node {
    pub fn flowlet(name: impl Into<String>) -> Self {
        Self {
            node_type: NodeType::Flowlet,
            name: name.into(),
        }
    }

    pub fn stream(name: impl Into<String>) -> Self {
        Self {
            node_type: NodeType::Stream,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_layout() {
        let id = FlowletId::new("ns", "app", "wordcount", "splitter");
        let queue = id.queue("words");
        assert_eq!(queue.as_str(), "queue:///ns/app/wordcount/splitter/words");
        assert!(queue.is_queue());
        assert!(!queue.is_stream());
        assert_eq!(queue.simple_name(), "words");
        assert_eq!(queue.to_stream_id(), None);
    }

    #[test]
    fn test_stream_name_layout() {
        let stream = StreamId::new("ns", "text");
        let queue = QueueName::from_stream(&stream);
        assert_eq!(queue.as_str(), "stream:///ns/text");
        assert!(queue.is_stream());
        assert_eq!(queue.simple_name(), "text");
        assert_eq!(queue.to_stream_id(), Some(stream));
    }

    #[test]
    fn test_group_id_is_stable_per_flowlet() {
        let a = FlowletId::new("ns", "app", "flow", "counter");
        let b = FlowletId::new("ns", "app", "flow", "counter");
        let c = FlowletId::new("ns", "app", "flow", "splitter");
        assert_eq!(a.group_id(), b.group_id());
        assert_ne!(a.group_id(), c.group_id());
    }

    #[test]
    fn test_node_type_serde() {
        let node: Node = serde_json::from_str(r#"{"node_type":"STREAM","name":"text"}"#).unwrap();
        assert_eq!(node, Node::stream("text"));
    }
}
