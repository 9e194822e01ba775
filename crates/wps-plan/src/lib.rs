pub mod builder;
pub mod error;
pub mod stages;

pub use builder::{build_plan, stack_name};
pub use error::PlanError;
pub use stages::{descriptor, StageDescriptor, DEFAULT_STORAGE_CLASS};
