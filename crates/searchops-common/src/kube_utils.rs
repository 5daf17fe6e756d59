//! Shared Kubernetes utilities using kube-rs

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::Error;

/// Patch the status subresource of a namespaced resource.
///
/// Uses a merge patch under the given field manager, matching how every
/// controller in this workspace persists status. The resource type only
/// needs to be a namespaced kube resource; the status payload is any
/// serializable value.
pub async fn patch_resource_status<K, S>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &S,
    field_manager: &str,
) -> Result<(), Error>
where
    K: kube::Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
    S: Serialize,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });

    api.patch_status(
        name,
        &PatchParams::apply(field_manager),
        &Patch::Merge(&patch),
    )
    .await?;

    debug!(name = %name, namespace = %namespace, "status patched");
    Ok(())
}
