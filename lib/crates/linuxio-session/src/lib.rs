pub mod client;
pub mod registry;
pub mod secret;

pub use client::BridgeClient;
pub use registry::{Binding, SessionRegistry};
pub use secret::generate_secret;
