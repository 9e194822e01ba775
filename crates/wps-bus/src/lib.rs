pub mod amqp;
pub mod audit;
pub mod error;
pub mod event;
pub mod publisher;

pub use amqp::{AmqpConsumer, AmqpPublisher};
pub use audit::{AuditOutcome, AuditPublisher, FailurePublisher, FailureReport};
pub use error::{BusError, DecodeError};
pub use event::decode_event;
pub use publisher::{routing, EventHandler, EventPublisher, MemoryPublisher};
