//! Kubernetes adapter
//!
//! [`KubeRuntime`] implements [`ClusterRuntime`] (node taints, pods, storage
//! classes); [`KubeWorkloads`] implements [`WorkloadApi`] (namespaces,
//! secrets, scaling, persistent volumes, CRD manifests). OpenEBS objects have
//! no typed bindings and go through [`DynamicObject`].

use crate::domain::ports::{
    ClusterRuntime, Manifest, NodeConfig, PersistentVolumeRecord, ReplicaCounts,
    ScalableWorkload, Taint, WorkloadApi, WorkloadKind,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Namespace, Node, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeSpec, Pod, Secret, Taint as NodeTaint,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "apps-orchestrator";

/// OpenEBS ZFS CSI driver
pub const ZFS_CSI_DRIVER: &str = "zfs.csi.openebs.io";

/// Namespace of the OpenEBS ZFS driver and its volume objects
pub const OPENEBS_NAMESPACE: &str = "openebs";

pub const DEFAULT_STORAGE_CLASS: &str = "openebs-zfspv-default";
pub const DEFAULT_SNAPSHOT_CLASS: &str = "zfspv-default-snapshot-class";

const POOL_NAME_ATTRIBUTE: &str = "openebs.io/poolname";

fn zfs_volume_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("zfs.openebs.io", "v1", "ZFSVolume"),
        "zfsvolumes",
    )
}

fn snapshot_class_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotClass"),
        "volumesnapshotclasses",
    )
}

// =============================================================================
// Quantities
// =============================================================================

/// Bytes in a Kubernetes quantity (`10Gi`, `500M`, `1073741824`)
pub fn quantity_bytes(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let (num, unit) = quantity.split_at(split);

    let num: f64 = num
        .parse()
        .map_err(|_| Error::Validation(format!("invalid quantity {quantity:?}")))?;
    let multiplier: u64 = match unit {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        other => {
            return Err(Error::Validation(format!(
                "unknown unit {other:?} in quantity {quantity:?}"
            )))
        }
    };
    Ok((num * multiplier as f64) as u64)
}

// =============================================================================
// Cluster Runtime
// =============================================================================

/// Node-level operations on the single-node cluster
#[derive(Clone)]
pub struct KubeRuntime {
    client: Client,
    node_name: String,
}

impl KubeRuntime {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

fn from_node_taint(taint: NodeTaint) -> Taint {
    Taint {
        key: taint.key,
        effect: taint.effect,
        value: taint.value,
    }
}

fn to_node_taint(taint: &Taint) -> serde_json::Value {
    match &taint.value {
        Some(value) => json!({"key": taint.key, "effect": taint.effect, "value": value}),
        None => json!({"key": taint.key, "effect": taint.effect}),
    }
}

/// Ready condition of a node, or why it is not ready
fn node_readiness(node: &Node) -> (bool, Option<String>) {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));
    match ready {
        Some(c) if c.status == "True" => (true, None),
        Some(c) => (
            false,
            Some(c.message.clone().unwrap_or_else(|| "node is not ready".into())),
        ),
        None => (false, Some("node has not reported readiness".into())),
    }
}

#[async_trait]
impl ClusterRuntime for KubeRuntime {
    async fn node_config(&self) -> Result<NodeConfig> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = match nodes.get_opt(&self.node_name).await.map_err(Error::from) {
            Ok(Some(node)) => node,
            Ok(None) => {
                return Ok(NodeConfig {
                    configured: false,
                    taints: Vec::new(),
                    error: Some(format!("node {} not registered", self.node_name)),
                })
            }
            // API server not up yet
            Err(e) if e.is_transient() => {
                return Ok(NodeConfig {
                    configured: false,
                    taints: Vec::new(),
                    error: Some(e.to_string()),
                })
            }
            Err(e) => return Err(e),
        };

        let (configured, error) = node_readiness(&node);
        let taints = node
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default()
            .into_iter()
            .map(from_node_taint)
            .collect();
        Ok(NodeConfig {
            configured,
            taints,
            error,
        })
    }

    async fn set_taints(&self, taints: Vec<Taint>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let taints: Vec<_> = taints.iter().map(to_node_taint).collect();
        let patch = json!({"spec": {"taints": taints}});
        nodes
            .patch(&self.node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn running_pods(&self) -> Result<usize> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let running = pods
            .list(&ListParams::default().fields("status.phase=Running"))
            .await?;
        Ok(running.items.len())
    }

    async fn setup_storage_classes(&self, pool_dataset: &str) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let storage_class = StorageClass {
            metadata: ObjectMeta {
                name: Some(DEFAULT_STORAGE_CLASS.into()),
                annotations: Some(BTreeMap::from([(
                    "storageclass.kubernetes.io/is-default-class".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            provisioner: ZFS_CSI_DRIVER.into(),
            parameters: Some(BTreeMap::from([
                ("fstype".to_string(), "zfs".to_string()),
                ("poolname".to_string(), format!("{pool_dataset}/default_volumes")),
                ("shared".to_string(), "yes".to_string()),
            ])),
            allow_volume_expansion: Some(true),
            reclaim_policy: Some("Retain".into()),
            ..Default::default()
        };
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        classes
            .patch(DEFAULT_STORAGE_CLASS, &params, &Patch::Apply(&storage_class))
            .await?;

        let resource = snapshot_class_resource();
        let mut snapshot_class = DynamicObject::new(DEFAULT_SNAPSHOT_CLASS, &resource).data(json!({
            "driver": ZFS_CSI_DRIVER,
            "deletionPolicy": "Delete",
        }));
        snapshot_class.metadata.annotations = Some(BTreeMap::from([(
            "snapshot.storage.kubernetes.io/is-default-class".to_string(),
            "true".to_string(),
        )]));
        let snapshot_classes: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        snapshot_classes
            .patch(DEFAULT_SNAPSHOT_CLASS, &params, &Patch::Apply(&snapshot_class))
            .await?;

        info!("Default storage and snapshot classes configured for {}", pool_dataset);
        Ok(())
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// Namespaced objects of application releases
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    node_name: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    async fn volume_record(&self, claim: &PersistentVolumeClaim) -> Result<Option<PersistentVolumeRecord>> {
        let Some(pv_name) = claim.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
            return Ok(None);
        };
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let Some(pv) = volumes.get_opt(&pv_name).await? else {
            return Ok(None);
        };
        Ok(pv_record(claim, &pv))
    }
}

/// Record of a ZFS CSI volume bound to `claim`; `None` for other drivers
fn pv_record(claim: &PersistentVolumeClaim, pv: &PersistentVolume) -> Option<PersistentVolumeRecord> {
    let spec = pv.spec.as_ref()?;
    let csi = spec.csi.as_ref().filter(|csi| csi.driver == ZFS_CSI_DRIVER)?;
    let pool_name = csi.volume_attributes.as_ref()?.get(POOL_NAME_ATTRIBUTE)?.clone();
    let capacity = spec.capacity.as_ref()?.get("storage")?.0.clone();

    Some(PersistentVolumeRecord {
        pvc_name: claim.metadata.name.clone()?,
        pv_name: pv.metadata.name.clone()?,
        dataset: format!("{}/{}", pool_name, csi.volume_handle),
        capacity,
        pool_name,
        volume_handle: csi.volume_handle.clone(),
        storage_class: spec.storage_class_name.clone().unwrap_or_default(),
        claim_namespace: claim.metadata.namespace.clone()?,
    })
}

fn persistent_volume(record: &PersistentVolumeRecord) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(record.pv_name.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(record.capacity.clone()),
            )])),
            claim_ref: Some(ObjectReference {
                name: Some(record.pvc_name.clone()),
                namespace: Some(record.claim_namespace.clone()),
                ..Default::default()
            }),
            csi: Some(CSIPersistentVolumeSource {
                driver: ZFS_CSI_DRIVER.into(),
                volume_handle: record.volume_handle.clone(),
                fs_type: Some("zfs".into()),
                volume_attributes: Some(BTreeMap::from([(
                    POOL_NAME_ATTRIBUTE.to_string(),
                    record.pool_name.clone(),
                )])),
                ..Default::default()
            }),
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            persistent_volume_reclaim_policy: Some("Retain".into()),
            storage_class_name: Some(record.storage_class.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ignore_conflict(result: std::result::Result<(), kube::Error>, what: &str) -> Result<()> {
    match result.map_err(Error::from) {
        Err(e) if e.is_conflict() => {
            debug!("{} already exists", what);
            Ok(())
        }
        other => other,
    }
}

/// CRD documents of a multi-document manifest; other kinds are skipped.
///
/// Parsed up front since the YAML deserializer is not `Send`.
fn crd_documents(raw: &str, path: &Path) -> Result<Vec<CustomResourceDefinition>> {
    let mut crds = Vec::new();
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(|k| k.as_str()) != Some("CustomResourceDefinition") {
            warn!("Skipping non-CRD document in {}", path.display());
            continue;
        }
        crds.push(serde_yaml::from_value(value)?);
    }
    Ok(crds)
}

#[async_trait]
impl WorkloadApi for KubeWorkloads {
    async fn export_namespace(&self, namespace: &str) -> Result<Manifest> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = namespaces.get(namespace).await?;
        Ok(serde_yaml::to_value(ns)?)
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Manifest>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = secrets.list(&ListParams::default()).await?;
        list.items
            .into_iter()
            .map(|secret| serde_yaml::to_value(secret).map_err(Error::from))
            .collect()
    }

    async fn create_namespace(&self, manifest: Manifest) -> Result<()> {
        let ns: Namespace = serde_yaml::from_value(manifest)?;
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces.create(&PostParams::default(), &ns).await?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, manifest: Manifest) -> Result<()> {
        let secret: Secret = serde_yaml::from_value(manifest)?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn list_scalable(&self, namespace: &str) -> Result<Vec<ScalableWorkload>> {
        let mut workloads = Vec::new();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for d in deployments.list(&ListParams::default()).await?.items {
            if let Some(name) = d.metadata.name {
                workloads.push(ScalableWorkload {
                    kind: WorkloadKind::Deployment,
                    name,
                    replicas: d.spec.and_then(|s| s.replicas).unwrap_or(0),
                });
            }
        }

        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        for s in statefulsets.list(&ListParams::default()).await?.items {
            if let Some(name) = s.metadata.name {
                workloads.push(ScalableWorkload {
                    kind: WorkloadKind::StatefulSet,
                    name,
                    replicas: s.spec.and_then(|s| s.replicas).unwrap_or(0),
                });
            }
        }
        Ok(workloads)
    }

    async fn scale_release(&self, namespace: &str, replica_counts: &ReplicaCounts) -> Result<()> {
        let params = PatchParams::default();
        for (workload, replicas) in replica_counts {
            let patch = json!({"spec": {"replicas": replicas}});
            debug!(namespace = %namespace, workload = %workload, replicas, "Scaling");
            match workload.kind {
                WorkloadKind::Deployment => {
                    let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                    api.patch(&workload.name, &params, &Patch::Merge(&patch)).await?;
                }
                WorkloadKind::StatefulSet => {
                    let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                    api.patch(&workload.name, &params, &Patch::Merge(&patch)).await?;
                }
            }
        }
        Ok(())
    }

    async fn list_volumes(&self, namespace: &str) -> Result<Vec<PersistentVolumeRecord>> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let mut records = Vec::new();
        for claim in claims.list(&ListParams::default()).await?.items {
            if let Some(record) = self.volume_record(&claim).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn create_volume(&self, record: &PersistentVolumeRecord) -> Result<()> {
        let resource = zfs_volume_resource();
        let zfs_volume = DynamicObject::new(&record.volume_handle, &resource)
            .within(OPENEBS_NAMESPACE)
            .data(json!({
                "spec": {
                    "capacity": quantity_bytes(&record.capacity)?.to_string(),
                    "poolName": record.pool_name,
                    "ownerNodeID": self.node_name,
                    "fsType": "zfs",
                    "shared": "yes",
                    "volumeType": "DATASET",
                }
            }));
        let zfs_volumes: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), OPENEBS_NAMESPACE, &resource);
        ignore_conflict(
            zfs_volumes
                .create(&PostParams::default(), &zfs_volume)
                .await
                .map(|_| ()),
            &format!("ZFS volume {}", record.volume_handle),
        )?;

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        volumes
            .create(&PostParams::default(), &persistent_volume(record))
            .await?;
        Ok(())
    }

    async fn apply_file(&self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path).await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        for crd in crd_documents(&raw, path)? {
            let name = crd
                .metadata
                .name
                .clone()
                .ok_or_else(|| Error::Validation(format!("unnamed CRD in {}", path.display())))?;
            crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
            debug!("Applied CRD {}", name);
        }
        Ok(())
    }
}
