//! Task descriptors received by a worker and child-task requests it sends.

use std::collections::BTreeMap;

use bytes::Bytes;
use tasklink_values::{CodecError, Schema, Value};

use crate::bridge::frame::TaskOptions;

/// Everything a worker host needs to run one task.
///
/// Built once per task stream from the inbound frames and immutable after.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub session_id: String,
    pub task_id: String,
    pub options: TaskOptions,
    pub payload: Bytes,
    pub dependencies: BTreeMap<String, Bytes>,
    pub expected_output_keys: Vec<String>,
}

impl TaskDescriptor {
    /// Decode the payload as a packed argument list.
    pub fn arguments(&self, schema: &Schema) -> Result<Vec<Value>, CodecError> {
        tasklink_values::decode(schema, &self.payload)
    }

    pub fn dependency(&self, key: &str) -> Option<&Bytes> {
        self.dependencies.get(key)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }
}

/// A child task to create.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// Generated when absent.
    pub task_id: Option<String>,
    pub payload: Bytes,
    pub dependencies: Vec<String>,
    pub expected_output_keys: Vec<String>,
}

impl TaskRequest {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            task_id: None,
            payload: payload.into(),
            dependencies: Vec::new(),
            expected_output_keys: Vec::new(),
        }
    }

    /// A request whose payload is `values` packed with `schema`.
    pub fn with_arguments(schema: &Schema, values: &[Value]) -> Result<Self, CodecError> {
        let payload = tasklink_values::encode(schema, values)?;
        Ok(Self::new(payload))
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn expect_output(mut self, key: impl Into<String>) -> Self {
        self.expected_output_keys.push(key.into());
        self
    }
}

/// Failure reported by the worker host's own code.
///
/// Carried to the agent as `TaskOutput::Error`, never raised as a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<CodecError> for TaskError {
    fn from(e: CodecError) -> Self {
        Self::new(format!("argument decoding failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_collects_fields() {
        let req = TaskRequest::new("payload")
            .task_id("child-1")
            .depends_on("dep-a")
            .expect_output("out-a");
        assert_eq!(req.task_id.as_deref(), Some("child-1"));
        assert_eq!(req.dependencies, vec!["dep-a"]);
        assert_eq!(req.expected_output_keys, vec!["out-a"]);
        assert_eq!(req.payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn arguments_roundtrip_through_payload() {
        let schema = Schema::standard();
        let args = vec![Value::from(3), Value::from("x")];
        let req = TaskRequest::with_arguments(&schema, &args).unwrap();

        let task = TaskDescriptor {
            session_id: "s".to_string(),
            task_id: "t".to_string(),
            options: TaskOptions::new(),
            payload: req.payload,
            dependencies: BTreeMap::new(),
            expected_output_keys: vec![],
        };
        assert_eq!(task.arguments(&schema).unwrap(), args);
    }

    #[test]
    fn task_error_from_codec_error_keeps_cause() {
        let err = TaskError::from(CodecError::UnknownTag(42));
        assert_eq!(err.to_string(), "argument decoding failed: unknown tag 42");
    }
}
