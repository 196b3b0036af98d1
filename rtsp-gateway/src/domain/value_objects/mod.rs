//! Domain value objects.

mod reconnect_policy;

pub use reconnect_policy::ReconnectPolicy;
