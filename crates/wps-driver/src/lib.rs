pub mod driver;
pub mod error;
pub mod kubectl;
pub mod noop;
pub mod render;

pub use driver::{ApplyOutputs, DestroyOutcome, StackDriver};
pub use error::DriverError;
pub use kubectl::KubectlDriver;
pub use noop::NoopDriver;
pub use render::{render_list, render_stack, stack_label, STACK_LABEL};
