use serde_json::{json, Map, Value};
use wps_domain::{NetworkProfile, WorkspacePlan};

/// Label key stamped on every rendered resource so a stack can be located
/// and torn down as a unit.
pub const STACK_LABEL: &str = "spe.io/stack";

/// Label value for a stack. Organization-scoped names carry slashes
/// (`org/project/stack`), which are not label-safe; only the final segment
/// identifies the stack on the platform.
pub fn stack_label(stack_name: &str) -> &str {
    stack_name.rsplit('/').next().unwrap_or(stack_name)
}

fn labels(plan: &WorkspacePlan) -> Value {
    json!({
        "app": plan.workspace.name,
        STACK_LABEL: stack_label(&plan.stack_name),
    })
}

/// Render every resource the plan implies, in apply order: PVCs, the
/// optional connection secret, the deployment, the network policy.
pub fn render_stack(plan: &WorkspacePlan) -> Vec<Value> {
    let mut resources: Vec<Value> = plan
        .workspace
        .volumes
        .iter()
        .map(|vol| render_pvc(plan, vol))
        .collect();
    if plan.connection_secret.is_some() {
        resources.push(render_secret(plan));
    }
    resources.push(render_deployment(plan));
    resources.push(render_network_policy(plan));
    resources
}

/// The rendered stack as a single `v1/List`, ready for `kubectl apply -f`.
pub fn render_list(plan: &WorkspacePlan) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": render_stack(plan),
    })
}

fn render_pvc(plan: &WorkspacePlan, vol: &wps_domain::VolumeSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": format!("{}-{}", plan.workspace.name, vol.name),
            "namespace": plan.workspace.namespace,
            "labels": labels(plan),
        },
        "spec": {
            "accessModes": vol.access_modes,
            "resources": {"requests": {"storage": vol.size}},
            "storageClassName": vol.storage_class,
        },
    })
}

pub fn secret_name(plan: &WorkspacePlan) -> String {
    format!("{}-connection", plan.workspace.name)
}

fn render_secret(plan: &WorkspacePlan) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": secret_name(plan),
            "namespace": plan.workspace.namespace,
            "labels": labels(plan),
        },
        "type": "Opaque",
        "stringData": plan.connection_secret,
    })
}

fn render_deployment(plan: &WorkspacePlan) -> Value {
    let spec = &plan.workspace;

    // User identity rides in on env vars; entries here win over any
    // payload-supplied keys of the same name.
    let mut env = spec.container.env.clone();
    env.insert("WORKSPACE_USER".into(), spec.user.username.clone());
    env.insert("WORKSPACE_UID".into(), spec.user.uid.clone());
    env.insert("WORKSPACE_GID".into(), spec.user.gid.clone());
    if plan.connection_secret.is_some() {
        env.insert("WORKSPACE_SECRET_NAME".into(), secret_name(plan));
    }
    let env: Vec<Value> = env
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();

    let ports: Vec<Value> = spec
        .container
        .ports
        .iter()
        .map(|port| json!({"containerPort": port, "name": format!("port-{}", port)}))
        .collect();

    let volume_mounts: Vec<Value> = spec
        .volumes
        .iter()
        .map(|vol| {
            json!({
                "name": format!("{}-volume", vol.name),
                "mountPath": vol.effective_mount_path(),
                "readOnly": vol.read_only,
            })
        })
        .collect();

    let volumes: Vec<Value> = spec
        .volumes
        .iter()
        .map(|vol| {
            json!({
                "name": format!("{}-volume", vol.name),
                "persistentVolumeClaim": {"claimName": format!("{}-{}", spec.name, vol.name)},
            })
        })
        .collect();

    let mut container = Map::new();
    container.insert("name".into(), json!(spec.name));
    container.insert("image".into(), json!(spec.container.image));
    container.insert("env".into(), json!(env));
    container.insert("resources".into(), json!(spec.container.resources));
    container.insert("ports".into(), json!(ports));
    container.insert("volumeMounts".into(), json!(volume_mounts));
    if let Some(command) = &spec.container.command {
        container.insert("command".into(), json!(command));
    }
    if let Some(args) = &spec.container.args {
        container.insert("args".into(), json!(args));
    }

    let mut pod_spec = Map::new();
    if let Some(sa) = &spec.service_account {
        pod_spec.insert("serviceAccountName".into(), json!(sa));
    }
    pod_spec.insert("containers".into(), json!([Value::Object(container)]));
    pod_spec.insert("volumes".into(), json!(volumes));

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": labels(plan),
            "annotations": spec.annotations,
        },
        "spec": {
            "replicas": spec.replicas,
            "selector": {"matchLabels": {"app": spec.name}},
            "template": {
                "metadata": {
                    "labels": {"app": spec.name, STACK_LABEL: stack_label(&plan.stack_name)},
                    "annotations": spec.annotations,
                },
                "spec": Value::Object(pod_spec),
            },
        },
    })
}

fn tcp_ports(ports: &[u16]) -> Vec<Value> {
    ports
        .iter()
        .map(|port| json!({"port": port, "protocol": "TCP"}))
        .collect()
}

fn render_network_policy(plan: &WorkspacePlan) -> Value {
    let network = &plan.network;
    let mut ingress: Vec<Value> = Vec::new();
    let mut egress: Vec<Value> = Vec::new();

    match network.profile {
        NetworkProfile::Ingress => {
            ingress = network
                .ingress
                .iter()
                .map(|rule| {
                    json!({
                        "from": [{"ipBlock": {"cidr": rule.cidr}}],
                        "ports": tcp_ports(&rule.ports),
                    })
                })
                .collect();
            egress = network
                .egress
                .iter()
                .map(|rule| {
                    json!({
                        "to": [{"ipBlock": {"cidr": rule.cidr}}],
                        "ports": tcp_ports(&rule.ports),
                    })
                })
                .collect();
        }
        NetworkProfile::Setup => {
            if let Some(selector) = &network.proxy_selector {
                egress = vec![json!({
                    "to": [{
                        "namespaceSelector": selector.get("namespaceSelector"),
                        "podSelector": selector.get("podSelector"),
                    }],
                })];
            }
        }
        // Fully isolated: no traffic in either direction.
        NetworkProfile::Analysis | NetworkProfile::Stopped => {}
        NetworkProfile::Preprocess | NetworkProfile::Review | NetworkProfile::SetupReview => {
            ingress = vec![json!({
                "from": [{"podSelector": {"matchLabels": {"role": "hdab"}}}],
            })];
        }
    }

    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": format!("{}-np", plan.workspace.name),
            "namespace": plan.workspace.namespace,
            "labels": labels(plan),
        },
        "spec": {
            "podSelector": {"matchLabels": {"app": plan.workspace.name}},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": ingress,
            "egress": egress,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wps_domain::{
        CidrRule, NetworkConfig, VolumeSpec, WorkspaceContainer, WorkspaceSpec, WorkspaceUser,
        PLAN_SCHEMA_VERSION,
    };

    fn plan_with(profile: NetworkProfile) -> WorkspacePlan {
        WorkspacePlan {
            schema_version: PLAN_SCHEMA_VERSION,
            stack_name: "permit-p1-ingress".into(),
            workspace: WorkspaceSpec {
                name: "p1-ingress".into(),
                namespace: "permit-p1".into(),
                container: WorkspaceContainer {
                    image: "ghcr.io/spe/workspace-ingress:stable".into(),
                    resources: Map::new(),
                    env: BTreeMap::from([("SERVICE_MODE".into(), "sftp".into())]),
                    command: None,
                    args: None,
                    ports: vec![3389],
                },
                user: WorkspaceUser {
                    username: "user-p1".into(),
                    uid: "2000".into(),
                    gid: "2000".into(),
                },
                volumes: vec![VolumeSpec {
                    name: "uploads-dh1".into(),
                    storage_class: "spe-ceph-rbd".into(),
                    size: "20Gi".into(),
                    access_modes: vec!["ReadWriteOnce".into()],
                    read_only: false,
                    mount_path: Some("/uploads/dh1".into()),
                }],
                service_account: None,
                replicas: 1,
                annotations: BTreeMap::new(),
            },
            network: NetworkConfig::for_profile(profile),
            connection_secret: Some(BTreeMap::from([
                ("username".into(), "permit-p1".into()),
                ("password".into(), "generated-secret".into()),
            ])),
            connection_info: None,
            exports: Map::new(),
        }
    }

    fn find_kind<'a>(items: &'a [Value], kind: &str) -> &'a Value {
        items.iter().find(|i| i["kind"] == kind).unwrap()
    }

    #[test]
    fn stack_label_strips_organization_scope() {
        assert_eq!(stack_label("permit-p1-ingress"), "permit-p1-ingress");
        assert_eq!(stack_label("org/proj/permit-p1-ingress"), "permit-p1-ingress");
    }

    #[test]
    fn renders_pvc_secret_deployment_and_policy() {
        let items = render_stack(&plan_with(NetworkProfile::Ingress));
        assert_eq!(items.len(), 4);

        let pvc = find_kind(&items, "PersistentVolumeClaim");
        assert_eq!(pvc["metadata"]["name"], "p1-ingress-uploads-dh1");
        assert_eq!(pvc["spec"]["resources"]["requests"]["storage"], "20Gi");
        assert_eq!(pvc["metadata"]["labels"][STACK_LABEL], "permit-p1-ingress");

        let secret = find_kind(&items, "Secret");
        assert_eq!(secret["metadata"]["name"], "p1-ingress-connection");
        assert_eq!(secret["stringData"]["username"], "permit-p1");
    }

    #[test]
    fn deployment_wires_user_and_secret_env() {
        let items = render_stack(&plan_with(NetworkProfile::Ingress));
        let deployment = find_kind(&items, "Deployment");
        let env = deployment["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap();
        let get = |name: &str| {
            env.iter()
                .find(|e| e["name"] == name)
                .map(|e| e["value"].as_str().unwrap().to_string())
        };
        assert_eq!(get("WORKSPACE_USER").as_deref(), Some("user-p1"));
        assert_eq!(get("WORKSPACE_UID").as_deref(), Some("2000"));
        assert_eq!(get("WORKSPACE_GID").as_deref(), Some("2000"));
        assert_eq!(get("WORKSPACE_SECRET_NAME").as_deref(), Some("p1-ingress-connection"));
        assert_eq!(get("SERVICE_MODE").as_deref(), Some("sftp"));

        let mounts = deployment["spec"]["template"]["spec"]["containers"][0]["volumeMounts"]
            .as_array()
            .unwrap();
        assert_eq!(mounts[0]["mountPath"], "/uploads/dh1");
    }

    #[test]
    fn no_secret_no_secret_env() {
        let mut plan = plan_with(NetworkProfile::Ingress);
        plan.connection_secret = None;
        let items = render_stack(&plan);
        assert_eq!(items.len(), 3);
        let deployment = find_kind(&items, "Deployment");
        let env = deployment["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap();
        assert!(env.iter().all(|e| e["name"] != "WORKSPACE_SECRET_NAME"));
    }

    #[test]
    fn ingress_policy_allows_cidr_rules() {
        let mut plan = plan_with(NetworkProfile::Ingress);
        plan.network.ingress = vec![CidrRule {
            cidr: "10.0.0.0/8".into(),
            ports: vec![22],
        }];
        let items = render_stack(&plan);
        let policy = find_kind(&items, "NetworkPolicy");
        assert_eq!(policy["spec"]["ingress"][0]["from"][0]["ipBlock"]["cidr"], "10.0.0.0/8");
        assert_eq!(policy["spec"]["ingress"][0]["ports"][0]["port"], 22);
        assert_eq!(policy["spec"]["egress"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn setup_policy_routes_egress_to_proxy() {
        let mut plan = plan_with(NetworkProfile::Setup);
        plan.network.proxy_selector = Some(json!({
            "namespaceSelector": {"matchLabels": {"kubernetes.io/metadata.name": "infra"}},
            "podSelector": {"matchLabels": {"app": "spe-proxy"}},
        }));
        let items = render_stack(&plan);
        let policy = find_kind(&items, "NetworkPolicy");
        assert!(policy["spec"]["ingress"].as_array().unwrap().is_empty());
        assert_eq!(
            policy["spec"]["egress"][0]["to"][0]["podSelector"]["matchLabels"]["app"],
            "spe-proxy"
        );
    }

    #[test]
    fn analysis_and_stopped_deny_all() {
        for profile in [NetworkProfile::Analysis, NetworkProfile::Stopped] {
            let items = render_stack(&plan_with(profile));
            let policy = find_kind(&items, "NetworkPolicy");
            assert!(policy["spec"]["ingress"].as_array().unwrap().is_empty());
            assert!(policy["spec"]["egress"].as_array().unwrap().is_empty());
        }
    }

    #[test]
    fn review_profiles_allow_hdab_pods() {
        for profile in [
            NetworkProfile::Preprocess,
            NetworkProfile::Review,
            NetworkProfile::SetupReview,
        ] {
            let items = render_stack(&plan_with(profile));
            let policy = find_kind(&items, "NetworkPolicy");
            assert_eq!(
                policy["spec"]["ingress"][0]["from"][0]["podSelector"]["matchLabels"]["role"],
                "hdab"
            );
        }
    }
}
