use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use wps_config::StackConfig;
use wps_domain::{
    CidrRule, NetworkConfig, NetworkProfile, PermitEvent, Stage, VolumeSpec, WorkspaceContainer,
    WorkspacePlan, WorkspaceSpec, WorkspaceUser, PLAN_SCHEMA_VERSION,
};

use crate::error::PlanError;
use crate::stages::{descriptor, DEFAULT_STORAGE_CLASS};

/// Stack name for `(permit, stage)` under the current configuration.
///
/// Replay depends on this being deterministic: the same inputs must always
/// reproduce the same name.
pub fn stack_name(cfg: &StackConfig, permit_id: &str, stage: Stage) -> String {
    let base = format!("{}-{}-{}", cfg.stack_prefix, permit_id, stage.as_str());
    match &cfg.organization {
        Some(org) => format!("{}/{}/{}", org, cfg.project_name, base),
        None => base,
    }
}

/// Build the complete [`WorkspacePlan`] for one stage from an event payload
/// and the stage's defaults. Pure: no I/O, no clock.
pub fn build_plan(
    cfg: &StackConfig,
    event: &PermitEvent,
    stage: Stage,
) -> Result<WorkspacePlan, PlanError> {
    let desc = descriptor(stage);
    let payload = event.payload_object();
    let workspace_payload = object_field(&payload, "workspace");

    let name = string_field(&workspace_payload, "name")
        .unwrap_or_else(|| format!("{}-{}", event.permit_id, stage.as_str()));
    let namespace = string_field(&workspace_payload, "namespace")
        .unwrap_or_else(|| format!("permit-{}", event.permit_id));

    let user = resolve_user(&payload, &workspace_payload, &event.permit_id, stage)?;

    // Stage defaults first, payload second, so the payload wins per key.
    let mut env: BTreeMap<String, String> = desc
        .env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.extend(string_map(&workspace_payload, "env"));

    let container = WorkspaceContainer {
        image: string_field(&workspace_payload, "image").unwrap_or_else(|| desc.image.to_string()),
        resources: object_field(&workspace_payload, "resources"),
        env,
        command: string_list(&workspace_payload, "command"),
        args: string_list(&workspace_payload, "args"),
        ports: port_list(&workspace_payload, "ports").unwrap_or_else(|| vec![3389]),
    };

    let volumes = match workspace_payload.get("volumes").and_then(Value::as_array) {
        Some(raw) if !raw.is_empty() => parse_volumes(raw)?,
        _ => (desc.volumes)(&payload),
    };

    let workspace = WorkspaceSpec {
        name,
        namespace,
        container,
        user,
        volumes,
        service_account: string_field(&workspace_payload, "service_account"),
        replicas: workspace_payload
            .get("replicas")
            .and_then(Value::as_u64)
            .map(|r| r as u32)
            .unwrap_or(1),
        annotations: string_map(&workspace_payload, "annotations"),
    };

    let network = build_network(desc.profile, &payload);

    let connection_secret = match stage {
        Stage::Ingress => Some(connection_secret(&payload, &event.permit_id)),
        _ => None,
    };

    let connection_info = payload
        .get("connection")
        .cloned()
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| default_connection(stage, &workspace, connection_secret.as_ref()));

    Ok(WorkspacePlan {
        schema_version: PLAN_SCHEMA_VERSION,
        stack_name: stack_name(cfg, &event.permit_id, stage),
        workspace,
        network,
        connection_secret,
        connection_info: Some(connection_info),
        exports: Map::new(),
    })
}

// ── User resolution ───────────────────────────────────────────────────────────

/// Draw the user from `workspace.user`, then `assignedUser`, then `user`.
/// Required for every stage except INGRESS; UID defaults to 2000 and GID to
/// the UID. All values are carried as strings.
fn resolve_user(
    payload: &Map<String, Value>,
    workspace_payload: &Map<String, Value>,
    permit_id: &str,
    stage: Stage,
) -> Result<WorkspaceUser, PlanError> {
    let candidate = workspace_payload
        .get("user")
        .and_then(Value::as_object)
        .or_else(|| payload.get("assignedUser").and_then(Value::as_object))
        .or_else(|| payload.get("user").and_then(Value::as_object));

    let username = candidate
        .and_then(|u| u.get("username"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let uid = candidate.and_then(|u| u.get("uid")).and_then(string_or_number);
    let gid = candidate.and_then(|u| u.get("gid")).and_then(string_or_number);

    if descriptor(stage).requires_user {
        let username = username.ok_or(PlanError::MissingUser { stage, field: "username" })?;
        let uid = uid.ok_or(PlanError::MissingUser { stage, field: "uid" })?;
        let gid = gid.unwrap_or_else(|| uid.clone());
        return Ok(WorkspaceUser { username, uid, gid });
    }

    let uid = uid.unwrap_or_else(|| "2000".to_string());
    Ok(WorkspaceUser {
        username: username.unwrap_or_else(|| format!("user-{}", permit_id)),
        gid: gid.unwrap_or_else(|| uid.clone()),
        uid,
    })
}

// ── Network ───────────────────────────────────────────────────────────────────

fn build_network(profile: NetworkProfile, payload: &Map<String, Value>) -> NetworkConfig {
    let mut network = NetworkConfig::for_profile(profile);
    match profile {
        NetworkProfile::Ingress => {
            network.ingress = cidr_rules(payload, "allowed_ingress");
            network.egress = cidr_rules(payload, "allowed_egress");
        }
        NetworkProfile::Setup => {
            network.proxy_selector = Some(
                payload
                    .get("proxy_selector")
                    .cloned()
                    .filter(|v| !v.is_null())
                    .unwrap_or_else(default_proxy_selector),
            );
        }
        _ => {}
    }
    network
}

fn cidr_rules(payload: &Map<String, Value>, key: &str) -> Vec<CidrRule> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(Value::as_object)
                .map(|rule| CidrRule {
                    cidr: rule
                        .get("cidr")
                        .and_then(Value::as_str)
                        .unwrap_or("0.0.0.0/0")
                        .to_string(),
                    ports: rule
                        .get("ports")
                        .and_then(Value::as_array)
                        .map(|ports| {
                            ports
                                .iter()
                                .filter_map(Value::as_u64)
                                .map(|p| p as u16)
                                .collect()
                        })
                        .unwrap_or_else(|| vec![22]),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn default_proxy_selector() -> Value {
    json!({
        "namespaceSelector": {"matchLabels": {"kubernetes.io/metadata.name": "infra"}},
        "podSelector": {"matchLabels": {"app": "spe-proxy"}}
    })
}

// ── Connection details ────────────────────────────────────────────────────────

fn connection_secret(payload: &Map<String, Value>, permit_id: &str) -> BTreeMap<String, String> {
    if let Some(secret) = payload.get("connection_secret").and_then(Value::as_object) {
        let parsed: BTreeMap<String, String> = secret
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    BTreeMap::from([
        (
            "username".to_string(),
            string_field(payload, "service_user").unwrap_or_else(|| format!("permit-{}", permit_id)),
        ),
        (
            "password".to_string(),
            string_field(payload, "service_password")
                .unwrap_or_else(|| "generated-secret".to_string()),
        ),
    ])
}

fn default_connection(
    stage: Stage,
    workspace: &WorkspaceSpec,
    secret: Option<&BTreeMap<String, String>>,
) -> Value {
    let host = format!(
        "{}.{}.svc.cluster.local",
        workspace.name, workspace.namespace
    );
    match stage {
        Stage::Ingress => json!({
            "protocol": "sftp",
            "host": host,
            "port": 22,
            "username": secret.and_then(|s| s.get("username")),
            "password": secret.and_then(|s| s.get("password")),
        }),
        _ => json!({
            "protocol": "rdp",
            "host": host,
            "port": workspace.container.ports.first().copied().unwrap_or(3389),
            "username": workspace.user.username,
            "password": "managed-in-secret",
        }),
    }
}

// ── Payload field helpers ─────────────────────────────────────────────────────

fn object_field(map: &Map<String, Value>, key: &str) -> Map<String, Value> {
    map.get(key).and_then(Value::as_object).cloned().unwrap_or_default()
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Payloads carry uids/gids as either strings or numbers.
fn string_or_number(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(map: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    map.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

fn string_map(map: &Map<String, Value>, key: &str) -> BTreeMap<String, String> {
    map.get(key)
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| string_or_number(v).map(|s| (k.clone(), s)))
                .collect()
        })
        .unwrap_or_default()
}

fn port_list(map: &Map<String, Value>, key: &str) -> Option<Vec<u16>> {
    let ports: Vec<u16> = map
        .get(key)
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_u64)
        .map(|p| p as u16)
        .collect();
    if ports.is_empty() {
        None
    } else {
        Some(ports)
    }
}

fn parse_volumes(raw: &[Value]) -> Result<Vec<VolumeSpec>, PlanError> {
    raw.iter()
        .map(|entry| {
            let obj = entry.as_object().ok_or_else(|| {
                PlanError::InvalidPayload("workspace.volumes entries must be objects".into())
            })?;
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| PlanError::InvalidPayload("volume entry missing 'name'".into()))?;
            Ok(VolumeSpec {
                name: name.to_string(),
                storage_class: obj
                    .get("storage_class")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_STORAGE_CLASS)
                    .to_string(),
                size: obj
                    .get("size")
                    .and_then(Value::as_str)
                    .unwrap_or("10Gi")
                    .to_string(),
                access_modes: string_list(obj, "access_modes")
                    .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]),
                read_only: obj.get("read_only").and_then(Value::as_bool).unwrap_or(false),
                mount_path: string_field(obj, "mount_path"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wps_domain::EventType;

    fn test_cfg() -> StackConfig {
        StackConfig {
            project_name: "spe-workspaces".into(),
            stack_prefix: "permit".into(),
            organization: None,
            work_dir: None,
            refresh_before_update: true,
        }
    }

    fn event(permit_id: &str, payload: Value) -> PermitEvent {
        PermitEvent::new(EventType::StatusUpdated, permit_id).with_payload(payload)
    }

    #[test]
    fn stack_name_is_deterministic() {
        let cfg = test_cfg();
        assert_eq!(stack_name(&cfg, "p1", Stage::Ingress), "permit-p1-ingress");
        assert_eq!(
            stack_name(&cfg, "p1", Stage::SetupReview),
            "permit-p1-setup-review"
        );
    }

    #[test]
    fn organization_scopes_the_stack_name() {
        let mut cfg = test_cfg();
        cfg.organization = Some("spe".into());
        assert_eq!(
            stack_name(&cfg, "p1", Stage::Analysis),
            "spe/spe-workspaces/permit-p1-analysis"
        );
    }

    #[test]
    fn ingress_plan_defaults() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event("p1", json!({"data_holders": [{"id": "dh1"}]})),
            Stage::Ingress,
        )
        .unwrap();

        assert_eq!(plan.stack_name, "permit-p1-ingress");
        assert_eq!(plan.workspace.name, "p1-ingress");
        assert_eq!(plan.workspace.namespace, "permit-p1");
        assert_eq!(plan.workspace.user.username, "user-p1");
        assert_eq!(plan.workspace.user.uid, "2000");
        assert_eq!(plan.workspace.container.env.get("SERVICE_MODE").unwrap(), "sftp");
        assert_eq!(plan.workspace.volumes.len(), 1);
        assert_eq!(plan.workspace.volumes[0].name, "uploads-dh1");
        assert_eq!(plan.network.profile, NetworkProfile::Ingress);
        assert!(plan.network.ingress.is_empty());

        let secret = plan.connection_secret.as_ref().unwrap();
        assert_eq!(secret.get("username").unwrap(), "permit-p1");
        assert_eq!(secret.get("password").unwrap(), "generated-secret");

        let connection = plan.connection_info.as_ref().unwrap();
        assert_eq!(connection["protocol"], "sftp");
        assert_eq!(connection["username"], "permit-p1");
    }

    #[test]
    fn ingress_allowed_rules_are_parsed() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event(
                "p1",
                json!({"allowed_ingress": [{"cidr": "10.0.0.0/8", "ports": [2222]}, {}]}),
            ),
            Stage::Ingress,
        )
        .unwrap();
        assert_eq!(plan.network.ingress.len(), 2);
        assert_eq!(plan.network.ingress[0].cidr, "10.0.0.0/8");
        assert_eq!(plan.network.ingress[0].ports, vec![2222]);
        assert_eq!(plan.network.ingress[1].cidr, "0.0.0.0/0");
        assert_eq!(plan.network.ingress[1].ports, vec![22]);
    }

    #[test]
    fn missing_user_fails_for_required_stage() {
        let cfg = test_cfg();
        let err = build_plan(&cfg, &event("p1", json!({})), Stage::Setup).unwrap_err();
        assert!(matches!(err, PlanError::MissingUser { stage: Stage::Setup, .. }));
    }

    #[test]
    fn uid_without_username_is_still_missing() {
        let cfg = test_cfg();
        let err = build_plan(
            &cfg,
            &event("p1", json!({"user": {"uid": 1000}})),
            Stage::Preprocess,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::MissingUser { field: "username", .. }));
    }

    #[test]
    fn user_resolution_prefers_workspace_then_assigned() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event(
                "p1",
                json!({
                    "assignedUser": {"username": "bob", "uid": 1001},
                    "workspace": {"user": {"username": "alice", "uid": 1000}},
                }),
            ),
            Stage::Preprocess,
        )
        .unwrap();
        assert_eq!(plan.workspace.user.username, "alice");
        assert_eq!(plan.workspace.user.uid, "1000");
        // GID defaults to the UID.
        assert_eq!(plan.workspace.user.gid, "1000");

        let plan = build_plan(
            &cfg,
            &event("p1", json!({"assignedUser": {"username": "bob", "uid": "1001"}})),
            Stage::Preprocess,
        )
        .unwrap();
        assert_eq!(plan.workspace.user.username, "bob");
        assert_eq!(plan.workspace.user.uid, "1001");
    }

    #[test]
    fn payload_overlay_merges_env_and_overrides_image() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event(
                "p1",
                json!({
                    "user": {"username": "alice", "uid": 1000},
                    "workspace": {
                        "image": "ghcr.io/spe/custom:latest",
                        "env": {"PROXY_ENABLED": "false", "EXTRA": "1"},
                        "replicas": 2,
                        "ports": [5900],
                    },
                }),
            ),
            Stage::Setup,
        )
        .unwrap();
        assert_eq!(plan.workspace.container.image, "ghcr.io/spe/custom:latest");
        // Payload wins over the stage default.
        assert_eq!(plan.workspace.container.env.get("PROXY_ENABLED").unwrap(), "false");
        assert_eq!(plan.workspace.container.env.get("EXTRA").unwrap(), "1");
        assert_eq!(plan.workspace.replicas, 2);
        assert_eq!(plan.workspace.container.ports, vec![5900]);
        // RDP descriptor picks up the first container port.
        assert_eq!(plan.connection_info.as_ref().unwrap()["port"], 5900);
    }

    #[test]
    fn payload_volumes_replace_stage_defaults() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event(
                "p1",
                json!({
                    "user": {"username": "alice", "uid": 1000},
                    "workspace": {"volumes": [{"name": "scratch", "size": "5Gi"}]},
                }),
            ),
            Stage::Analysis,
        )
        .unwrap();
        assert_eq!(plan.workspace.volumes.len(), 1);
        assert_eq!(plan.workspace.volumes[0].name, "scratch");
        assert_eq!(plan.workspace.volumes[0].storage_class, DEFAULT_STORAGE_CLASS);

        // Empty list means "no override": stage defaults apply verbatim.
        let plan = build_plan(
            &cfg,
            &event(
                "p1",
                json!({
                    "user": {"username": "alice", "uid": 1000},
                    "workspace": {"volumes": []},
                }),
            ),
            Stage::Analysis,
        )
        .unwrap();
        assert_eq!(plan.workspace.volumes.len(), 3);
    }

    #[test]
    fn setup_gets_the_default_proxy_selector() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event("p1", json!({"user": {"username": "alice", "uid": 1000}})),
            Stage::Setup,
        )
        .unwrap();
        let selector = plan.network.proxy_selector.as_ref().unwrap();
        assert_eq!(
            selector["namespaceSelector"]["matchLabels"]["kubernetes.io/metadata.name"],
            "infra"
        );
        assert_eq!(selector["podSelector"]["matchLabels"]["app"], "spe-proxy");
    }

    #[test]
    fn payload_connection_wins_over_defaults() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event(
                "p1",
                json!({
                    "user": {"username": "alice", "uid": 1000},
                    "connection": {"protocol": "vnc", "port": 5901},
                }),
            ),
            Stage::Review,
        )
        .unwrap();
        assert_eq!(plan.connection_info.as_ref().unwrap()["protocol"], "vnc");
    }

    #[test]
    fn rdp_descriptor_for_non_ingress_stages() {
        let cfg = test_cfg();
        let plan = build_plan(
            &cfg,
            &event("p1", json!({"user": {"username": "alice", "uid": 1000}})),
            Stage::Preprocess,
        )
        .unwrap();
        let connection = plan.connection_info.as_ref().unwrap();
        assert_eq!(connection["protocol"], "rdp");
        assert_eq!(connection["host"], "p1-preprocess.permit-p1.svc.cluster.local");
        assert_eq!(connection["port"], 3389);
        assert_eq!(connection["password"], "managed-in-secret");
    }
}
