pub mod codec;
pub mod container;
pub mod error;
pub mod message;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod telemetry;
pub mod template;

pub use codec::{ConverterChain, JsonMessageConverter, MessageConverter};
pub use container::{ContainerBuilder, ContainerConfig, ListenerContainer};
pub use error::{
    CodecError, ConfigError, ContainerError, EnqueueError, HandlerError, TemplateError,
    TemplateResult,
};
pub use message::Message;
pub use processor::{MessageProcessor, NoOpMessageProcessor};
pub use queue::QueueDescriptor;
pub use registry::{handler_fn, HandlerRegistry, MessageHandler, QueueRegistration};
pub use sender::MessageSender;
pub use template::{
    Delivery, KeyType, MemoryTemplate, MessageTemplate, RedisMessageTemplate, ScoreMode,
    TickOutcome,
};
