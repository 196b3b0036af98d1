//! Domain types shared by the orchestrator and its collaborators.

pub mod command;
pub mod stream;
pub mod value_objects;

pub use command::{CommandReply, CommandVerb, MqttCommand};
pub use stream::{BoundingBox, Detection, StreamConfig, StreamState, StreamStatus};
pub use value_objects::ReconnectPolicy;
