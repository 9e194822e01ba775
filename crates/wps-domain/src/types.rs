use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-format version stamped into every persisted [`WorkspacePlan`].
/// Scaling replays stored plans, so the on-disk shape is a wire format;
/// bump this when the shape changes incompatibly.
pub const PLAN_SCHEMA_VERSION: u32 = 1;

// ── Stages ────────────────────────────────────────────────────────────────────

/// Logical workspace stages managed by the orchestrator, in pipeline order.
///
/// Each stage materialises as one stack named `{prefix}-{permit_id}-{stage}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Ingress,
    Preprocess,
    Review,
    Setup,
    SetupReview,
    Analysis,
}

impl Stage {
    /// All stages in enumeration (pipeline) order.
    pub const ALL: [Stage; 6] = [
        Stage::Ingress,
        Stage::Preprocess,
        Stage::Review,
        Stage::Setup,
        Stage::SetupReview,
        Stage::Analysis,
    ];

    /// Kebab-case wire form, used in stack names and plan keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingress => "ingress",
            Stage::Preprocess => "preprocess",
            Stage::Review => "review",
            Stage::Setup => "setup",
            Stage::SetupReview => "setup-review",
            Stage::Analysis => "analysis",
        }
    }

    /// Upper-case form written to the state store as the permit status
    /// after a successful provision.
    pub fn status_label(&self) -> &'static str {
        match self {
            Stage::Ingress => "INGRESS",
            Stage::Preprocess => "PREPROCESS",
            Stage::Review => "REVIEW",
            Stage::Setup => "SETUP",
            Stage::SetupReview => "SETUP-REVIEW",
            Stage::Analysis => "ANALYSIS",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Permit statuses ───────────────────────────────────────────────────────────

/// Permit lifecycle statuses as advertised on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermitStatus {
    AwaitingIngress,
    DataPreparationPending,
    DataPreparationReviewPending,
    DataPreparationRework,
    WorkspaceSetupPending,
    WorkspaceSetupReviewPending,
    WorkspaceSetupRework,
    AnalysisActive,
    Archived,
}

impl PermitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermitStatus::AwaitingIngress => "AWAITING_INGRESS",
            PermitStatus::DataPreparationPending => "DATA_PREPARATION_PENDING",
            PermitStatus::DataPreparationReviewPending => "DATA_PREPARATION_REVIEW_PENDING",
            PermitStatus::DataPreparationRework => "DATA_PREPARATION_REWORK",
            PermitStatus::WorkspaceSetupPending => "WORKSPACE_SETUP_PENDING",
            PermitStatus::WorkspaceSetupReviewPending => "WORKSPACE_SETUP_REVIEW_PENDING",
            PermitStatus::WorkspaceSetupRework => "WORKSPACE_SETUP_REWORK",
            PermitStatus::AnalysisActive => "ANALYSIS_ACTIVE",
            PermitStatus::Archived => "ARCHIVED",
        }
    }

    /// Parse the bus wire form. Returns `None` for unknown statuses; the
    /// caller decides whether that is a warning or an error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AWAITING_INGRESS" => Some(PermitStatus::AwaitingIngress),
            "DATA_PREPARATION_PENDING" => Some(PermitStatus::DataPreparationPending),
            "DATA_PREPARATION_REVIEW_PENDING" => Some(PermitStatus::DataPreparationReviewPending),
            "DATA_PREPARATION_REWORK" => Some(PermitStatus::DataPreparationRework),
            "WORKSPACE_SETUP_PENDING" => Some(PermitStatus::WorkspaceSetupPending),
            "WORKSPACE_SETUP_REVIEW_PENDING" => Some(PermitStatus::WorkspaceSetupReviewPending),
            "WORKSPACE_SETUP_REWORK" => Some(PermitStatus::WorkspaceSetupRework),
            "ANALYSIS_ACTIVE" => Some(PermitStatus::AnalysisActive),
            "ARCHIVED" => Some(PermitStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for PermitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal statuses written to the state store in addition to the
/// upper-cased stage labels.
pub mod status {
    pub const STOPPED: &str = "STOPPED";
    pub const RUNNING: &str = "RUNNING";
    pub const ARCHIVED: &str = "ARCHIVED";
    pub const PROVISIONING_FAILED: &str = "PROVISIONING_FAILED";
    pub const DESTROY_FAILED: &str = "DESTROY_FAILED";
}

// ── Network model ─────────────────────────────────────────────────────────────

/// Network-policy shape applied to a stage's stack. `Stopped` is used
/// transiently while a stack is scaled to zero replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkProfile {
    Ingress,
    Preprocess,
    Review,
    Setup,
    SetupReview,
    Analysis,
    Stopped,
}

impl From<Stage> for NetworkProfile {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Ingress => NetworkProfile::Ingress,
            Stage::Preprocess => NetworkProfile::Preprocess,
            Stage::Review => NetworkProfile::Review,
            Stage::Setup => NetworkProfile::Setup,
            Stage::SetupReview => NetworkProfile::SetupReview,
            Stage::Analysis => NetworkProfile::Analysis,
        }
    }
}

impl std::fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkProfile::Ingress => "ingress",
            NetworkProfile::Preprocess => "preprocess",
            NetworkProfile::Review => "review",
            NetworkProfile::Setup => "setup",
            NetworkProfile::SetupReview => "setup-review",
            NetworkProfile::Analysis => "analysis",
            NetworkProfile::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// CIDR rule for ingress or egress; ports are TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrRule {
    pub cidr: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub profile: NetworkProfile,
    #[serde(default)]
    pub ingress: Vec<CidrRule>,
    #[serde(default)]
    pub egress: Vec<CidrRule>,
    /// Pod/namespace selector the SETUP profile routes egress through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_selector: Option<Value>,
}

impl NetworkConfig {
    pub fn for_profile(profile: NetworkProfile) -> Self {
        NetworkConfig {
            profile,
            ingress: Vec::new(),
            egress: Vec::new(),
            proxy_selector: None,
        }
    }
}

// ── Workspace model ───────────────────────────────────────────────────────────

/// Specification for a persistent volume claim mounted into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub storage_class: String,
    pub size: String,
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

impl VolumeSpec {
    /// Mount path, falling back to `/mnt/{name}` when unset.
    pub fn effective_mount_path(&self) -> String {
        self.mount_path
            .clone()
            .unwrap_or_else(|| format!("/mnt/{}", self.name))
    }
}

/// Unix identity the workspace runs as. All fields are strings because the
/// platform wires them through environment variables verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceUser {
    pub username: String,
    pub uid: String,
    pub gid: String,
}

fn default_ports() -> Vec<u16> {
    vec![3389]
}

fn default_replicas() -> u32 {
    1
}

/// Runtime configuration for the workspace container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceContainer {
    pub image: String,
    #[serde(default)]
    pub resources: serde_json::Map<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
}

/// Complete workload description for one stage's stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub name: String,
    pub namespace: String,
    pub container: WorkspaceContainer,
    pub user: WorkspaceUser,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

// ── Workspace plan ────────────────────────────────────────────────────────────

fn default_schema_version() -> u32 {
    PLAN_SCHEMA_VERSION
}

/// Declarative description of a stage's stack, persisted per
/// `(permit, stage)` so that scaling can replay it.
///
/// The JSON form is the store's wire format: a plan must survive
/// serialize → deserialize bit-for-bit (volumes ordered, maps equal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspacePlan {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub stack_name: String,
    pub workspace: WorkspaceSpec,
    pub network: NetworkConfig,
    /// Key/value mapping stored as a platform secret next to the workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_secret: Option<BTreeMap<String, String>>,
    /// User-facing access descriptor, exported under the `connection` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<Value>,
    /// Outputs captured from the last apply.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub exports: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> WorkspacePlan {
        WorkspacePlan {
            schema_version: PLAN_SCHEMA_VERSION,
            stack_name: "permit-p1-analysis".into(),
            workspace: WorkspaceSpec {
                name: "p1-analysis".into(),
                namespace: "permit-p1".into(),
                container: WorkspaceContainer {
                    image: "ghcr.io/spe/workspace-analysis:stable".into(),
                    resources: serde_json::Map::new(),
                    env: BTreeMap::from([("INTERNET_ACCESS".into(), "disabled".into())]),
                    command: None,
                    args: None,
                    ports: vec![3389],
                },
                user: WorkspaceUser {
                    username: "alice".into(),
                    uid: "1000".into(),
                    gid: "1000".into(),
                },
                volumes: vec![VolumeSpec {
                    name: "outputs".into(),
                    storage_class: "spe-ceph-rbd".into(),
                    size: "200Gi".into(),
                    access_modes: vec!["ReadWriteOnce".into()],
                    read_only: false,
                    mount_path: Some("/outputs".into()),
                }],
                service_account: None,
                replicas: 1,
                annotations: BTreeMap::new(),
            },
            network: NetworkConfig::for_profile(NetworkProfile::Analysis),
            connection_secret: None,
            connection_info: Some(json!({"protocol": "rdp", "port": 3389})),
            exports: serde_json::Map::new(),
        }
    }

    #[test]
    fn stage_wire_forms() {
        assert_eq!(Stage::SetupReview.as_str(), "setup-review");
        assert_eq!(Stage::SetupReview.status_label(), "SETUP-REVIEW");
        assert_eq!(
            serde_json::to_value(Stage::SetupReview).unwrap(),
            json!("setup-review")
        );
    }

    #[test]
    fn permit_status_parses_wire_form() {
        assert_eq!(
            PermitStatus::parse("WORKSPACE_SETUP_REVIEW_PENDING"),
            Some(PermitStatus::WorkspaceSetupReviewPending)
        );
        assert_eq!(PermitStatus::parse("NOT_A_STATUS"), None);
    }

    #[test]
    fn plan_round_trips_through_json() {
        let plan = sample_plan();
        let raw = serde_json::to_string(&plan).unwrap();
        let back: WorkspacePlan = serde_json::from_str(&raw).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn plan_without_schema_version_defaults_to_current() {
        // Plans stored before the version field existed must stay readable.
        let mut value = serde_json::to_value(sample_plan()).unwrap();
        value.as_object_mut().unwrap().remove("schema_version");
        let back: WorkspacePlan = serde_json::from_value(value).unwrap();
        assert_eq!(back.schema_version, PLAN_SCHEMA_VERSION);
    }

    #[test]
    fn volume_mount_path_falls_back_to_name() {
        let vol = VolumeSpec {
            name: "scratch".into(),
            storage_class: "spe-ceph-rbd".into(),
            size: "10Gi".into(),
            access_modes: vec!["ReadWriteOnce".into()],
            read_only: false,
            mount_path: None,
        };
        assert_eq!(vol.effective_mount_path(), "/mnt/scratch");
    }
}
