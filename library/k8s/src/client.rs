use kube::api::ObjectMeta;
use kube::core::Resource;
use kube::Api;

/// Returns a new Kubernetes client scoped to the given namespace.
///
/// This function panics if there is any error encountered while constructing
/// the required configuration from the environment. A missing Kubernetes
/// environment is terminal for a controller; there is no alternative besides
/// crashing before the leader election ever starts.
pub async fn new<K, N>(namespace: N) -> Api<K>
where
    <K as Resource>::DynamicType: Default,
    K: k8s_openapi::Metadata<Ty = ObjectMeta>,
    N: AsRef<str>,
{
    Api::namespaced(
        kube::Client::try_default()
            .await
            .expect("could not construct a Kubernetes client from the environment"),
        namespace.as_ref(),
    )
}
