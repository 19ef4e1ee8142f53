use crate::errors::ApiError;
use async_trait::async_trait;
use either::Either;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::error::ErrorResponse;
use kube::Api;
use log::debug;
use result::Result;
use term_colors::*;

/// The slice of pod CRUD the controller core consumes. Tests supply an
/// in-memory implementation; production wires in [KubeFleet](KubeFleet).
#[async_trait]
pub trait PodFleet: Send + Sync {
    /// Submits the desired pod. Idempotent: racing a pod that already
    /// exists adopts the live object instead of failing.
    async fn create(&self, pod: Pod) -> Result<Pod>;

    /// Deletes the named pod. A pod that is already gone is a success.
    async fn delete(&self, name: &str) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<Pod>>;

    /// Lists pods matching a label selector such as `app=gasboat-agent`.
    async fn list(&self, selector: &str) -> Result<Vec<Pod>>;
}

/// The production [PodFleet](PodFleet), scoped to one namespace.
pub struct KubeFleet {
    api: Api<Pod>,
}

impl KubeFleet {
    pub async fn new<N: AsRef<str>>(namespace: N) -> KubeFleet {
        KubeFleet {
            api: crate::client::new(namespace).await,
        }
    }
}

#[async_trait]
impl PodFleet for KubeFleet {
    async fn create(&self, pod: Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        match self.api.create(&PostParams::default(), &pod).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
                debug!("pod {} already exists; adopting the live object", cyan(&name));
                Ok(self.api.get(&name).await.map_err(ApiError::from)?)
            }
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(Either::Left(_)) => {
                debug!("deletion of pod {} has begun", cyan(name));
                Ok(())
            }
            Ok(Either::Right(_)) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                debug!("pod {} was already gone", cyan(name));
                Ok(())
            }
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Pod>> {
        match self.api.get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn list(&self, selector: &str) -> Result<Vec<Pod>> {
        let listing = self
            .api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(ApiError::from)?;
        Ok(listing.items)
    }
}
