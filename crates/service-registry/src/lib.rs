#![doc = include_str!("../readme.md")]

pub mod core;
pub mod dispatch;
pub mod registry;

pub use crate::core::config::RegistryConfig;
pub use crate::core::error::{RegistryError, Result};
pub use crate::registry::{RegistryHandle, ServiceRegistry};
