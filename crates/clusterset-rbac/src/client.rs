//! RoleBinding access used by the reconciler

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use clusterset_common::{Error, FIELD_MANAGER};

/// Trait abstracting the RoleBinding operations of a sync pass
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoleBindingClient: Send + Sync {
    /// Fetch a binding; `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>, Error>;

    /// Create a binding in the namespace named by its metadata
    async fn create(&self, binding: &RoleBinding) -> Result<RoleBinding, Error>;

    /// Replace a binding; the object must carry the current resourceVersion
    async fn update(&self, binding: &RoleBinding) -> Result<RoleBinding, Error>;

    /// Delete a binding; deleting a missing binding succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List bindings in every namespace matching a label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<RoleBinding>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeRoleBindingClient {
    client: Client,
}

impl KubeRoleBindingClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<RoleBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn write_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn missing(field: &str) -> Error {
    Error::validation_for_field(
        format!("metadata.{field}"),
        format!("RoleBinding has no {field}"),
    )
}

fn target(binding: &RoleBinding) -> Result<(&str, &str), Error> {
    let Some(namespace) = binding.metadata.namespace.as_deref() else {
        return Err(missing("namespace"));
    };
    let Some(name) = binding.metadata.name.as_deref() else {
        return Err(missing("name"));
    };
    Ok((namespace, name))
}

#[async_trait]
impl RoleBindingClient for KubeRoleBindingClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>, Error> {
        match self.api(namespace).get(name).await {
            Ok(binding) => Ok(Some(binding)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let (namespace, _) = target(binding)?;
        let created = self.api(namespace).create(&write_params(), binding).await?;
        Ok(created)
    }

    async fn update(&self, binding: &RoleBinding) -> Result<RoleBinding, Error> {
        let (namespace, name) = target(binding)?;
        let replaced = self
            .api(namespace)
            .replace(name, &write_params(), binding)
            .await?;
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, name, "RoleBinding already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }
}
