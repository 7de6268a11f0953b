/// Low-level template errors (Redis, serialization).
/// This is the error type for the `MessageTemplate` trait — template
/// operations can only fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),
}

impl From<serde_json::Error> for TemplateError {
    fn from(err: serde_json::Error) -> Self {
        TemplateError::Serialization(err.to_string())
    }
}

/// Payload conversion errors raised by a `MessageConverter`.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("no converter handled the payload")]
    Unhandled,
}

/// A handler-side failure. The message string feeds the retry/DLQ decision
/// logs; the broker never inspects its contents.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError(msg.to_string())
    }
}

/// Configuration errors. These are fatal: a container refuses to start with
/// an invalid registration or an empty converter chain.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid queue descriptor for '{0}': {1}")]
    InvalidDescriptor(String, String),

    #[error("queue already registered: {0}")]
    DuplicateQueue(String),

    #[error("message converter chain must not be empty")]
    EmptyConverterChain,

    #[error("no queues registered")]
    NoQueues,

    #[error("no message template or redis url configured")]
    NoTemplate,
}

/// Producer-side enqueue errors.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue not registered: {0}")]
    UnknownQueue(String),

    #[error("queue '{0}' is not registered as delayed")]
    NotDelayed(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Container lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("invalid lifecycle transition: container is {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

pub type TemplateResult<T> = std::result::Result<T, TemplateError>;
