//! Job message parsing.
//!
//! The host queue stores jobs as JSON hashes:
//!
//! ```text
//! {"class": "ReportJob", "jid": "6f2c...", "queue": "default", "args": [42, "acme"]}
//! ```
//!
//! Jobs enqueued through an adapter layer are wrapped one level deeper; the
//! effective type lives in `wrapped` and the effective arguments in
//! `args[0].arguments`:
//!
//! ```text
//! {"class": "JobWrapper", "wrapped": "ReportJob", "jid": "...",
//!  "args": [{"job_class": "ReportJob", "arguments": [42, "acme"]}]}
//! ```

use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::id::{JobId, QueueName};

/// The fields of a job payload the throttling layer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    job_class: String,
    job_id: JobId,
    args: Vec<Value>,
    queue: Option<QueueName>,
}

impl Message {
    pub fn new(job_class: impl Into<String>, job_id: impl Into<JobId>, args: Vec<Value>) -> Self {
        Self {
            job_class: job_class.into(),
            job_id: job_id.into(),
            args,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Parse a raw payload, unwrapping adapter-wrapped jobs.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let item = value
            .as_object()
            .ok_or(ParseError::Malformed("payload is not a JSON object".to_string()))?;

        let job_id = string_field(item, "jid")?;
        let queue = match item.get("queue") {
            Some(Value::String(q)) => Some(QueueName::new(q.as_str())),
            _ => None,
        };

        let (job_class, args) = match item.get("wrapped") {
            Some(wrapped) => {
                let class = wrapped.as_str().ok_or(ParseError::WrongType {
                    field: "wrapped",
                    expected: "string",
                })?;
                (class.to_string(), wrapped_arguments(item)?)
            }
            None => (string_field(item, "class")?, plain_arguments(item)?),
        };

        Ok(Self {
            job_class,
            job_id: JobId::new(job_id),
            args,
            queue,
        })
    }

    /// Effective job type name (the wrapped class for adapter jobs).
    pub fn job_class(&self) -> &str {
        &self.job_class
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn queue(&self) -> Option<&QueueName> {
        self.queue.as_ref()
    }
}

/// Rewrite the `queue` field of a raw payload, keeping every other field.
pub fn retarget(raw: &str, queue: &QueueName) -> Result<String, ParseError> {
    let mut value: Value =
        serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let item = value
        .as_object_mut()
        .ok_or(ParseError::Malformed("payload is not a JSON object".to_string()))?;
    item.insert("queue".to_string(), Value::String(queue.to_string()));
    serde_json::to_string(&value).map_err(|e| ParseError::Malformed(e.to_string()))
}

fn string_field(item: &Map<String, Value>, field: &'static str) -> Result<String, ParseError> {
    match item.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ParseError::WrongType {
            field,
            expected: "string",
        }),
        None => Err(ParseError::MissingField(field)),
    }
}

fn plain_arguments(item: &Map<String, Value>) -> Result<Vec<Value>, ParseError> {
    match item.get("args") {
        Some(Value::Array(args)) => Ok(args.clone()),
        Some(_) => Err(ParseError::WrongType {
            field: "args",
            expected: "array",
        }),
        None => Err(ParseError::MissingField("args")),
    }
}

fn wrapped_arguments(item: &Map<String, Value>) -> Result<Vec<Value>, ParseError> {
    let arguments = item
        .get("args")
        .and_then(|args| args.get(0))
        .and_then(|inner| inner.get("arguments"))
        .ok_or(ParseError::MissingField("arguments"))?;

    match arguments {
        Value::Array(args) => Ok(args.clone()),
        _ => Err(ParseError::WrongType {
            field: "arguments",
            expected: "array",
        }),
    }
}
