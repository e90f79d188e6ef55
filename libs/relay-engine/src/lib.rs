pub mod app;
pub mod config;
pub mod consumer;
pub mod error;
pub mod manager;
mod sync;
pub mod topic;

pub use app::{handler, App, AppBuilder, StreamHandle, StreamHandler, StreamOptions};
pub use config::RelayConfig;
pub use consumer::{DecodeErrorHook, PullSource, TopicConsumer};
pub use error::EngineError;
pub use manager::{ManagerConfig, ManagerState, PartitionListener, TopicManager};
pub use topic::{DeriveOptions, Subscribable, Topic, TopicOptions};
