// Adapters that translate protocol front-end calls into kernel calls.
pub mod mqtt;

pub use mqtt::{MqttChannel, MqttError};
