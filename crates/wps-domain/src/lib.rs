pub mod error;
pub mod event;
pub mod types;

pub use error::DomainError;
pub use event::{EventType, PermitEvent};
pub use types::{
    status, CidrRule, NetworkConfig, NetworkProfile, PermitStatus, Stage, VolumeSpec,
    WorkspaceContainer, WorkspacePlan, WorkspaceSpec, WorkspaceUser, PLAN_SCHEMA_VERSION,
};
