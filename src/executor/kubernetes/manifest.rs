use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job as KubeJob, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, PodSecurityContext,
    PodSpec, PodTemplateSpec, ResourceRequirements as KubeResources, SecretEnvSource,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use uuid::Uuid;

use crate::config::{KubernetesConfig, S3Config};
use crate::executor::docker::{job_environment, JOB_ID_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::executor::policy::ResourcePolicy;
use crate::storage::bucket_environment;

pub const CONTAINER_NAME: &str = "job";
pub const FETCH_CONTAINER: &str = "fetch-inputs";
pub const UPLOAD_CONTAINER: &str = "upload-outputs";
const NOBODY: i64 = 65534;

const INPUT_VOLUME: &str = "input";
const OUTPUT_VOLUME: &str = "output";
const IO_HOME_VOLUME: &str = "io-home";
const IO_HOME: &str = "/home/io";

const FETCH_SCRIPT: &str = r#"set -eu
aws s3 cp ${STORAGE_ENDPOINT:+--endpoint-url "$STORAGE_ENDPOINT"} --recursive --only-show-errors \
    "s3://$STORAGE_BUCKET/$JOB_INPUT_PREFIX" /input"#;

// Native sidecar: idles until the kubelet stops it after the job container
// exited, then uploads whatever the job wrote.
const UPLOAD_SCRIPT: &str = r#"upload() {
    aws s3 cp ${STORAGE_ENDPOINT:+--endpoint-url "$STORAGE_ENDPOINT"} --recursive --only-show-errors \
        /output "s3://$STORAGE_BUCKET/$JOB_OUTPUT_PREFIX"
    exit $?
}
trap upload TERM
while true; do sleep 1; done"#;

/// Kubernetes object name for a job.
pub fn job_name(job_id: Uuid) -> String {
    format!("job-runner-{job_id}")
}

pub fn labels(job_id: Uuid) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (JOB_ID_LABEL.to_string(), job_id.to_string()),
    ])
}

fn env_vars(pairs: Vec<(String, String)>) -> Vec<EnvVar> {
    pairs
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

fn restricted() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn scratch(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// A container running the `aws` CLI against the job's bucket prefixes.
fn io_container(
    name: &str,
    script: &str,
    mounts: Vec<VolumeMount>,
    env: &[(String, String)],
    config: &KubernetesConfig,
) -> Container {
    let mut env = env.to_vec();
    env.push(("HOME".to_string(), IO_HOME.to_string()));
    let mut volume_mounts = mounts;
    volume_mounts.push(mount(IO_HOME_VOLUME, IO_HOME, false));
    Container {
        name: name.to_string(),
        image: Some(config.io_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![script.to_string()]),
        env: Some(env_vars(env)),
        env_from: config.storage_secret.as_ref().map(|secret| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(secret.clone()),
                    optional: Some(false),
                }),
                ..Default::default()
            }]
        }),
        volume_mounts: Some(volume_mounts),
        security_context: Some(restricted()),
        ..Default::default()
    }
}

/// Build the batch Job running `image` under `policy`.
///
/// The Job never retries on its own (`backoffLimit: 0`); retries belong to
/// the task queue. `activeDeadlineSeconds` backs up the runner's own timer.
///
/// `/input` and `/output` are `emptyDir` volumes. With a `bucket`, an init
/// container fills `/input` from the job's input prefix and a sidecar
/// uploads `/output` to its output prefix once the job container exited.
pub fn build_job(
    job_id: Uuid,
    image: &str,
    policy: &ResourcePolicy,
    config: &KubernetesConfig,
    bucket: Option<&S3Config>,
) -> KubeJob {
    let mut limits = BTreeMap::from([
        ("memory".to_string(), Quantity(policy.kube_memory())),
        ("cpu".to_string(), Quantity(policy.kube_cpu())),
    ]);
    let requests = limits.clone();

    let mut node_selector = None;
    let mut tolerations = None;
    if let Some(gpu) = policy.gpu {
        limits.insert(config.gpu_resource.clone(), Quantity("1".to_string()));
        if let Some(product) = gpu.product_label() {
            node_selector = Some(BTreeMap::from([(
                config.gpu_node_label.clone(),
                product.to_string(),
            )]));
        }
        tolerations = Some(vec![Toleration {
            key: Some(config.gpu_resource.clone()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]);
    }

    let mut env = job_environment(job_id);
    if let Some(bucket) = bucket {
        env.extend(bucket_environment(bucket));
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        env: Some(env_vars(env.clone())),
        volume_mounts: Some(vec![
            mount(INPUT_VOLUME, "/input", true),
            mount(OUTPUT_VOLUME, "/output", false),
        ]),
        resources: Some(KubeResources {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        }),
        security_context: Some(restricted()),
        ..Default::default()
    };

    let mut volumes = vec![scratch(INPUT_VOLUME), scratch(OUTPUT_VOLUME)];
    let mut init_containers = None;
    let mut termination_grace_period_seconds = None;
    if bucket.is_some() {
        volumes.push(scratch(IO_HOME_VOLUME));
        let fetch = io_container(
            FETCH_CONTAINER,
            FETCH_SCRIPT,
            vec![mount(INPUT_VOLUME, "/input", false)],
            &env,
            config,
        );
        let upload = Container {
            restart_policy: Some("Always".to_string()),
            ..io_container(
                UPLOAD_CONTAINER,
                UPLOAD_SCRIPT,
                vec![mount(OUTPUT_VOLUME, "/output", true)],
                &env,
                config,
            )
        };
        init_containers = Some(vec![fetch, upload]);
        termination_grace_period_seconds = Some(config.upload_grace_seconds);
    }

    let labels = labels(job_id);
    KubeJob {
        metadata: ObjectMeta {
            name: Some(job_name(job_id)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(policy.time_limit_seconds() as i64),
            ttl_seconds_after_finished: config.ttl_seconds_after_finished,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    automount_service_account_token: Some(false),
                    enable_service_links: Some(false),
                    service_account_name: config.service_account.clone(),
                    node_selector,
                    tolerations,
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        run_as_user: Some(NOBODY),
                        run_as_group: Some(NOBODY),
                        ..Default::default()
                    }),
                    init_containers,
                    containers: vec![container],
                    volumes: Some(volumes),
                    termination_grace_period_seconds,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
