//! Deployments and Services

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use cellmesh_common::crd::ComponentSpec;
use cellmesh_common::kube_utils::{component_deployment_name, component_service_name};
use cellmesh_common::{LABEL_APP, LABEL_COMPONENT};

use super::child_meta;
use crate::apply::ChildResource;

/// Pod template inputs of a generated Deployment
#[derive(Clone, Debug, Default)]
pub struct PodTemplate {
    /// `app` label value selecting the pods
    pub app: String,
    /// Replica count; `None` leaves scaling to an autoscaler
    pub replicas: Option<i32>,
    /// The single workload container
    pub container: Container,
    /// Pod volumes
    pub volumes: Vec<Volume>,
    /// Pod template annotations
    pub annotations: BTreeMap<String, String>,
}

/// A Deployment running `template`
pub fn deployment(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    template: PodTemplate,
) -> Deployment {
    let selector = BTreeMap::from([(LABEL_APP.to_string(), template.app.clone())]);
    let mut pod_labels = labels.clone();
    pod_labels.extend(selector.clone());

    Deployment {
        metadata: child_meta(name, namespace, labels),
        spec: Some(DeploymentSpec {
            replicas: template.replicas,
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!template.annotations.is_empty())
                        .then_some(template.annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![template.container],
                    volumes: (!template.volumes.is_empty()).then_some(template.volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A ClusterIP Service selecting pods with `app`
pub fn service(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    app: &str,
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: child_meta(name, namespace, labels),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([(LABEL_APP.to_string(), app.to_string())])),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A TCP service port forwarding to `target`
pub fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// A TCP container port
pub fn container_port(port: i32) -> ContainerPort {
    ContainerPort {
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// `app` label of a component's pods
pub fn component_app(parent: &str, component: &str) -> String {
    format!("{parent}--{component}")
}

fn component_labels(mut labels: BTreeMap<String, String>, component: &str) -> BTreeMap<String, String> {
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
    labels
}

/// Deployment of a Cell or Composite component
///
/// Replicas are left unset when the component is autoscaled.
pub fn component_deployment(
    parent: &str,
    namespace: &str,
    component: &ComponentSpec,
    labels: BTreeMap<String, String>,
) -> Deployment {
    let spec = &component.container;
    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    let ports: Vec<ContainerPort> = component
        .ports
        .iter()
        .map(|p| container_port(p.container_port()))
        .collect();

    let container = Container {
        name: component.name.clone(),
        image: Some(spec.image.clone()),
        command: non_empty(&spec.command),
        args: non_empty(&spec.args),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        ..Default::default()
    };

    deployment(
        &component_deployment_name(parent, &component.name),
        namespace,
        component_labels(labels, &component.name),
        PodTemplate {
            app: component_app(parent, &component.name),
            replicas: component.scaling.is_none().then_some(component.replicas),
            container,
            ..Default::default()
        },
    )
}

/// Service of a component; `None` when it exposes no ports
pub fn component_service(
    parent: &str,
    namespace: &str,
    component: &ComponentSpec,
    labels: BTreeMap<String, String>,
) -> Option<Service> {
    if component.ports.is_empty() {
        return None;
    }
    let ports = component
        .ports
        .iter()
        .map(|p| {
            service_port(
                &format!("{}-{}", p.protocol.port_prefix(), p.name),
                p.port,
                p.container_port(),
            )
        })
        .collect();
    Some(service(
        &component_service_name(parent, &component.name),
        namespace,
        component_labels(labels, &component.name),
        &component_app(parent, &component.name),
        ports,
    ))
}

/// Available replicas reported by a Deployment
pub fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

fn container_matches(observed: &Container, desired: &Container) -> bool {
    observed.name == desired.name
        && observed.image == desired.image
        && observed.command == desired.command
        && observed.args == desired.args
        && observed.env == desired.env
        && observed.ports == desired.ports
        && observed.volume_mounts == desired.volume_mounts
}

fn merge_container(observed: &mut Container, desired: &Container) {
    observed.image = desired.image.clone();
    observed.command = desired.command.clone();
    observed.args = desired.args.clone();
    observed.env = desired.env.clone();
    observed.ports = desired.ports.clone();
    observed.volume_mounts = desired.volume_mounts.clone();
}

fn subset(desired: Option<&BTreeMap<String, String>>, observed: Option<&BTreeMap<String, String>>) -> bool {
    desired.map_or(true, |d| {
        observed.is_some_and(|o| d.iter().all(|(k, v)| o.get(k) == Some(v)))
    })
}

impl ChildResource for Deployment {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        let (Some(observed), Some(desired)) = (self.spec.as_ref(), desired.spec.as_ref()) else {
            return self.spec.is_none() && desired.spec.is_none();
        };
        if desired.replicas.is_some() && observed.replicas != desired.replicas {
            return false;
        }
        if observed.selector != desired.selector {
            return false;
        }
        let observed_meta = observed.template.metadata.as_ref();
        let desired_meta = desired.template.metadata.as_ref();
        if !subset(
            desired_meta.and_then(|m| m.labels.as_ref()),
            observed_meta.and_then(|m| m.labels.as_ref()),
        ) || !subset(
            desired_meta.and_then(|m| m.annotations.as_ref()),
            observed_meta.and_then(|m| m.annotations.as_ref()),
        ) {
            return false;
        }
        match (observed.template.spec.as_ref(), desired.template.spec.as_ref()) {
            (Some(o), Some(d)) => {
                o.containers.len() == d.containers.len()
                    && o.containers
                        .iter()
                        .zip(&d.containers)
                        .all(|(o, d)| container_matches(o, d))
                    && o.volumes == d.volumes
            }
            (o, d) => o.is_none() && d.is_none(),
        }
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        let Some(desired) = desired.spec.as_ref() else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        if desired.replicas.is_some() {
            spec.replicas = desired.replicas;
        }
        spec.selector = desired.selector.clone();

        if let Some(desired_meta) = desired.template.metadata.as_ref() {
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            if let Some(labels) = &desired_meta.labels {
                meta.labels.get_or_insert_with(Default::default).extend(labels.clone());
            }
            if let Some(annotations) = &desired_meta.annotations {
                meta.annotations
                    .get_or_insert_with(Default::default)
                    .extend(annotations.clone());
            }
        }

        if let Some(desired_pod) = desired.template.spec.as_ref() {
            let pod = spec.template.spec.get_or_insert_with(Default::default);
            let mut containers = Vec::with_capacity(desired_pod.containers.len());
            for wanted in &desired_pod.containers {
                match pod.containers.iter().find(|c| c.name == wanted.name) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        merge_container(&mut merged, wanted);
                        containers.push(merged);
                    }
                    None => containers.push(wanted.clone()),
                }
            }
            pod.containers = containers;
            pod.volumes = desired_pod.volumes.clone();
        }
    }
}

fn port_key(p: &ServicePort) -> (&Option<String>, i32, &Option<IntOrString>, &Option<String>) {
    (&p.name, p.port, &p.target_port, &p.protocol)
}

impl ChildResource for Service {
    fn owned_fields_match(&self, desired: &Self) -> bool {
        let (Some(observed), Some(desired)) = (self.spec.as_ref(), desired.spec.as_ref()) else {
            return self.spec.is_none() && desired.spec.is_none();
        };
        let observed_ports = observed.ports.as_deref().unwrap_or_default();
        let desired_ports = desired.ports.as_deref().unwrap_or_default();
        observed.type_ == desired.type_
            && observed.selector == desired.selector
            && observed_ports.len() == desired_ports.len()
            && observed_ports
                .iter()
                .zip(desired_ports)
                .all(|(o, d)| port_key(o) == port_key(d))
    }

    fn merge_owned_fields(&mut self, desired: &Self) {
        let Some(desired) = desired.spec.as_ref() else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.type_ = desired.type_.clone();
        spec.selector = desired.selector.clone();
        spec.ports = desired.ports.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellmesh_common::crd::{ContainerSpec, PortSpec, Protocol, ScalingPolicySpec};
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn component() -> ComponentSpec {
        ComponentSpec {
            name: "employee".to_string(),
            replicas: 2,
            container: ContainerSpec {
                image: "hr/employee:1".to_string(),
                env: BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
                ..Default::default()
            },
            ports: vec![PortSpec {
                name: "api".to_string(),
                protocol: Protocol::Http,
                port: 80,
                target_port: Some(8080),
            }],
            scaling: None,
        }
    }

    #[test]
    fn component_deployment_shape() {
        let d = component_deployment("hr", "default", &component(), BTreeMap::new());
        assert_eq!(d.metadata.name.as_deref(), Some("hr--employee-deployment"));
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.unwrap()[LABEL_APP],
            "hr--employee"
        );
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("hr/employee:1"));
        assert_eq!(pod.containers[0].ports.as_ref().unwrap()[0].container_port, 8080);
        assert!(pod.containers[0].command.is_none());
    }

    #[test]
    fn autoscaled_component_leaves_replicas_unset() {
        let mut c = component();
        c.scaling = Some(ScalingPolicySpec {
            min_replicas: 1,
            max_replicas: 3,
            ..Default::default()
        });
        let d = component_deployment("hr", "default", &c, BTreeMap::new());
        assert_eq!(d.spec.unwrap().replicas, None);
    }

    #[test]
    fn component_service_names_ports_by_protocol() {
        let svc = component_service("hr", "default", &component(), BTreeMap::new()).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("hr--employee-service"));
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("http-api"));
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));

        let mut no_ports = component();
        no_ports.ports.clear();
        assert!(component_service("hr", "default", &no_ports, BTreeMap::new()).is_none());
    }

    /// Story: fields defaulted by the API server are not drift, a changed
    /// image is
    #[test]
    fn story_deployment_comparison_is_field_scoped() {
        let desired = component_deployment("hr", "default", &component(), BTreeMap::new());

        let mut observed = desired.clone();
        {
            let spec = observed.spec.as_mut().unwrap();
            spec.revision_history_limit = Some(10);
            let pod = spec.template.spec.as_mut().unwrap();
            pod.restart_policy = Some("Always".to_string());
            pod.containers[0].image_pull_policy = Some("IfNotPresent".to_string());
            pod.containers[0].termination_message_path = Some("/dev/termination-log".to_string());
        }
        observed.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ..Default::default()
        });
        assert!(observed.owned_fields_match(&desired));
        assert_eq!(available_replicas(&observed), 2);

        let mut changed = component();
        changed.container.image = "hr/employee:2".to_string();
        let desired_v2 = component_deployment("hr", "default", &changed, BTreeMap::new());
        assert!(!observed.owned_fields_match(&desired_v2));

        observed.merge_owned_fields(&desired_v2);
        assert!(observed.owned_fields_match(&desired_v2));
        let pod = observed.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Always"));
    }

    #[test]
    fn autoscaler_owned_replicas_are_not_drift() {
        let mut c = component();
        c.scaling = Some(ScalingPolicySpec::default());
        let desired = component_deployment("hr", "default", &c, BTreeMap::new());
        let mut observed = desired.clone();
        observed.spec.as_mut().unwrap().replicas = Some(5);
        assert!(observed.owned_fields_match(&desired));
    }

    #[test]
    fn service_ignores_cluster_ip() {
        let desired = component_service("hr", "default", &component(), BTreeMap::new()).unwrap();
        let mut observed = desired.clone();
        observed.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.12".to_string());
        assert!(observed.owned_fields_match(&desired));

        observed.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 81;
        assert!(!observed.owned_fields_match(&desired));
        observed.merge_owned_fields(&desired);
        assert!(observed.owned_fields_match(&desired));
        assert_eq!(observed.spec.unwrap().cluster_ip.as_deref(), Some("10.0.0.12"));
    }
}
