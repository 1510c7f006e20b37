pub mod config;
pub mod descriptor;

pub use config::{StoreConfig, WriteConcern};
pub use descriptor::ConnectionDescriptor;
