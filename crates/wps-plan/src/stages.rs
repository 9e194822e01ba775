use serde_json::{Map, Value};
use wps_domain::{NetworkProfile, Stage, VolumeSpec};

pub const DEFAULT_STORAGE_CLASS: &str = "spe-ceph-rbd";

/// Static description of one stage's provisioning defaults.
///
/// Open polymorphism over stages is a table, not a class hierarchy: the
/// volume factory is a plain function pointer the builder calls with the
/// event payload.
pub struct StageDescriptor {
    pub image: &'static str,
    pub profile: NetworkProfile,
    pub env: &'static [(&'static str, &'static str)],
    /// Whether the payload must carry a resolvable user for this stage.
    pub requires_user: bool,
    /// Default volume set, derived from the event payload.
    pub volumes: fn(&Map<String, Value>) -> Vec<VolumeSpec>,
}

pub fn descriptor(stage: Stage) -> &'static StageDescriptor {
    match stage {
        Stage::Ingress => &INGRESS,
        Stage::Preprocess => &PREPROCESS,
        Stage::Review => &REVIEW,
        Stage::Setup => &SETUP,
        Stage::SetupReview => &SETUP_REVIEW,
        Stage::Analysis => &ANALYSIS,
    }
}

static INGRESS: StageDescriptor = StageDescriptor {
    image: "ghcr.io/spe/workspace-ingress:stable",
    profile: NetworkProfile::Ingress,
    env: &[("SERVICE_MODE", "sftp")],
    requires_user: false,
    volumes: ingress_volumes,
};

static PREPROCESS: StageDescriptor = StageDescriptor {
    image: "ghcr.io/spe/workspace-hdab-preprocess:stable",
    profile: NetworkProfile::Preprocess,
    env: &[],
    requires_user: true,
    volumes: preprocess_volumes,
};

static REVIEW: StageDescriptor = StageDescriptor {
    image: "ghcr.io/spe/workspace-hdab-review:stable",
    profile: NetworkProfile::Review,
    env: &[],
    requires_user: true,
    volumes: review_volumes,
};

static SETUP: StageDescriptor = StageDescriptor {
    image: "ghcr.io/spe/workspace-researcher-setup:stable",
    profile: NetworkProfile::Setup,
    env: &[("PROXY_ENABLED", "true")],
    requires_user: true,
    volumes: setup_volumes,
};

static SETUP_REVIEW: StageDescriptor = StageDescriptor {
    image: "ghcr.io/spe/workspace-setup-review:stable",
    profile: NetworkProfile::SetupReview,
    env: &[],
    requires_user: true,
    volumes: setup_review_volumes,
};

static ANALYSIS: StageDescriptor = StageDescriptor {
    image: "ghcr.io/spe/workspace-analysis:stable",
    profile: NetworkProfile::Analysis,
    env: &[("INTERNET_ACCESS", "disabled")],
    requires_user: true,
    volumes: analysis_volumes,
};

// ── Volume factories ──────────────────────────────────────────────────────────

fn size_override(payload: &Map<String, Value>, key: &str, default: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn volume(
    name: &str,
    storage_class: &str,
    size: String,
    access_mode: &str,
    read_only: bool,
    mount_path: &str,
) -> VolumeSpec {
    VolumeSpec {
        name: name.to_string(),
        storage_class: storage_class.to_string(),
        size,
        access_modes: vec![access_mode.to_string()],
        read_only,
        mount_path: Some(mount_path.to_string()),
    }
}

/// One `uploads-{id}` volume per data holder, or a single `uploads` volume
/// when the payload names none.
fn ingress_volumes(payload: &Map<String, Value>) -> Vec<VolumeSpec> {
    let holders: Vec<&Map<String, Value>> = payload
        .get("data_holders")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();

    if holders.is_empty() {
        return vec![volume(
            "uploads",
            DEFAULT_STORAGE_CLASS,
            size_override(payload, "uploads_volume_size", "20Gi"),
            "ReadWriteOnce",
            false,
            "/uploads",
        )];
    }

    holders
        .iter()
        .map(|holder| {
            let id = holder.get("id").and_then(Value::as_str).unwrap_or("dh");
            VolumeSpec {
                name: format!("uploads-{}", id),
                storage_class: holder
                    .get("storage_class")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_STORAGE_CLASS)
                    .to_string(),
                size: holder
                    .get("size")
                    .and_then(Value::as_str)
                    .unwrap_or("20Gi")
                    .to_string(),
                access_modes: vec!["ReadWriteOnce".to_string()],
                read_only: false,
                mount_path: Some(format!("/uploads/{}", id)),
            }
        })
        .collect()
}

fn preprocess_volumes(payload: &Map<String, Value>) -> Vec<VolumeSpec> {
    vec![
        volume(
            "raw",
            DEFAULT_STORAGE_CLASS,
            size_override(payload, "raw_volume_size", "200Gi"),
            "ReadOnlyMany",
            true,
            "/raw",
        ),
        volume(
            "prepared",
            DEFAULT_STORAGE_CLASS,
            size_override(payload, "prepared_volume_size", "200Gi"),
            "ReadWriteOnce",
            false,
            "/prepared",
        ),
    ]
}

fn review_volumes(payload: &Map<String, Value>) -> Vec<VolumeSpec> {
    vec![volume(
        "prepared",
        DEFAULT_STORAGE_CLASS,
        size_override(payload, "prepared_volume_size", "200Gi"),
        "ReadOnlyMany",
        true,
        "/prepared",
    )]
}

fn setup_volumes(payload: &Map<String, Value>) -> Vec<VolumeSpec> {
    vec![volume(
        "project",
        DEFAULT_STORAGE_CLASS,
        size_override(payload, "project_volume_size", "100Gi"),
        "ReadWriteMany",
        false,
        "/project",
    )]
}

fn setup_review_volumes(payload: &Map<String, Value>) -> Vec<VolumeSpec> {
    vec![volume(
        "project",
        DEFAULT_STORAGE_CLASS,
        size_override(payload, "project_volume_size", "100Gi"),
        "ReadOnlyMany",
        true,
        "/project",
    )]
}

fn analysis_volumes(payload: &Map<String, Value>) -> Vec<VolumeSpec> {
    vec![
        volume(
            "prepared",
            DEFAULT_STORAGE_CLASS,
            size_override(payload, "prepared_volume_size", "200Gi"),
            "ReadOnlyMany",
            true,
            "/prepared_data",
        ),
        volume(
            "outputs",
            DEFAULT_STORAGE_CLASS,
            size_override(payload, "outputs_volume_size", "200Gi"),
            "ReadWriteOnce",
            false,
            "/outputs",
        ),
        volume(
            "project",
            DEFAULT_STORAGE_CLASS,
            size_override(payload, "project_volume_size", "100Gi"),
            "ReadWriteMany",
            false,
            "/project",
        ),
    ]
}
