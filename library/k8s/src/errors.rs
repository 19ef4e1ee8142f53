use error::*;

/// The project-wide wrapping of [kube::Error](kube::Error). The split
/// matters operationally: `Connection` failures are the transient class the
/// reconciler must never act destructively on, while `Api` rejections are
/// answers from a healthy API server.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("the Kubernetes API server rejected our request")]
    Api(#[source] kube::Error),
    #[error("failed to connect to the Kubernetes API server")]
    Connection(#[source] kube::Error),
    #[error("the request to the Kubernetes API server failed")]
    Rest(#[source] kube::Error),
}

impl FleetError for ApiError {}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(_) => ApiError::Api(err),
            kube::Error::Connection(_) => ApiError::Connection(err),
            _ => ApiError::Rest(err),
        }
    }
}
