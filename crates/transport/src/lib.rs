//! Message transport for pipeline stages.
//!
//! A single task owns the broker connection ([`Transport`]); the [`Runner`]
//! pulls messages through it, hands them to a stage and publishes what the
//! stage emits. [`AmqpBroker`] talks to a real broker and [`MemoryBroker`]
//! keeps everything in process.

mod actor;
pub mod amqp;
pub mod broker;
pub mod error;
pub mod memory;
pub mod runner;

pub use actor::Transport;
pub use amqp::{AmqpBroker, AmqpSettings};
pub use broker::{Broker, ContentEncoding, Delivery};
pub use memory::MemoryBroker;
pub use runner::{LogLevelHook, Runner, RunnerSettings};
