use crate::reference::Reference;
use async_trait::async_trait;
use error::*;
use log::debug;
use result::Result;
use serde::Deserialize;
use std::time::Duration;
use term_colors::*;

/// The manifest media types we are willing to accept. The list form matters:
/// for a multi-platform tag the registry answers with the manifest LIST
/// digest, which is also what the drift tracker compares against, so the
/// list types must be present or single-platform registries would answer
/// with a per-platform digest instead.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

/// The per-request deadline for registry traffic.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A `DigestOracle` answers exactly one question: which manifest digest does
/// this image reference currently resolve to?
#[async_trait]
pub trait DigestOracle: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<String>;
}

/// An `HttpRegistry` is a [DigestOracle](DigestOracle) backed by the OCI
/// distribution HTTP API (`HEAD /v2/<repository>/manifests/<tag>` and the
/// `Docker-Content-Digest` response header).
///
/// Registries that demand authentication for pulls are handled through the
/// standard anonymous bearer-token flow: a 401 carrying a
/// `Www-Authenticate: Bearer` challenge is answered by fetching a pull
/// token from the advertised realm and retrying once.
pub struct HttpRegistry {
    http: reqwest::Client,
}

impl HttpRegistry {
    pub fn new() -> Result<HttpRegistry> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| RegistryError::Client { source })?;
        Ok(HttpRegistry { http })
    }

    async fn lookup(
        &self,
        scheme: &str,
        reference: &Reference,
    ) -> std::result::Result<String, RegistryError> {
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, reference.registry, reference.repository, reference.tag
        );
        let unreachable = |source| RegistryError::Unreachable {
            registry: reference.registry.clone(),
            source,
        };
        let response = self
            .http
            .head(&url)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(unreachable)?;
        let response = match response.status().as_u16() {
            401 => self.retry_with_token(&url, reference, &response).await?,
            _ => response,
        };
        match response.status().as_u16() {
            200 => (),
            404 => {
                return Err(RegistryError::TagNotFound {
                    registry: reference.registry.clone(),
                    reference: format!("{}", reference),
                })
            }
            status => {
                return Err(RegistryError::Rejected {
                    registry: reference.registry.clone(),
                    reference: format!("{}", reference),
                    status,
                })
            }
        };
        response
            .headers()
            .get("docker-content-digest")
            .and_then(|digest| digest.to_str().ok())
            .map(|digest| digest.to_string())
            .ok_or_else(|| RegistryError::DigestHeaderMissing {
                registry: reference.registry.clone(),
                reference: format!("{}", reference),
            })
    }

    /// Answers a 401 by walking the bearer challenge: fetch an anonymous
    /// pull token from the advertised realm, then repeat the manifest
    /// request with it.
    async fn retry_with_token(
        &self,
        url: &str,
        reference: &Reference,
        denied: &reqwest::Response,
    ) -> std::result::Result<reqwest::Response, RegistryError> {
        let unreachable = |source| RegistryError::Unreachable {
            registry: reference.registry.clone(),
            source,
        };
        let challenge = denied
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let (realm, service) =
            parse_bearer_challenge(&challenge).ok_or_else(|| RegistryError::BadChallenge {
                registry: reference.registry.clone(),
                challenge: challenge.clone(),
            })?;
        let scope = format!("repository:{}:pull", reference.repository);
        let token: TokenResponse = self
            .http
            .get(&realm)
            .query(&[("service", service.as_str()), ("scope", scope.as_str())])
            .send()
            .await
            .map_err(unreachable)?
            .json()
            .await
            .map_err(unreachable)?;
        let token = token
            .into_token()
            .ok_or_else(|| RegistryError::BadChallenge {
                registry: reference.registry.clone(),
                challenge,
            })?;
        self.http
            .head(url)
            .header("Accept", MANIFEST_ACCEPT)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(unreachable)
    }
}

#[async_trait]
impl DigestOracle for HttpRegistry {
    async fn resolve(&self, reference: &str) -> Result<String> {
        let parsed = Reference::parse(reference);
        // A digest-pinned reference can never drift; it resolves to itself.
        if let Some(digest) = parsed.digest.as_ref() {
            return Ok(digest.clone());
        }
        match self.lookup("https", &parsed).await {
            Ok(digest) => {
                debug!("{} resolves to {}", cyan(reference), orange(&digest));
                Ok(digest)
            }
            // In-cluster registries are commonly plain HTTP. Only a
            // transport-level failure warrants the downgrade; an HTTP-level
            // rejection means we DID reach a TLS registry.
            Err(RegistryError::Unreachable { .. }) => {
                debug!("falling back to plain http for {}", cyan(&parsed.registry));
                Ok(self.lookup("http", &parsed).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// The body returned by a token realm. Which of the two keys is populated
/// varies by registry vendor.
#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

/// Extracts `(realm, service)` out of a `Www-Authenticate: Bearer` header
/// value such as:
///
/// ```text
/// Bearer realm="https://auth.docker.io/token",service="registry.docker.io"
/// ```
fn parse_bearer_challenge(challenge: &str) -> Option<(String, String)> {
    let parameters = challenge.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for parameter in parameters.split(',') {
        let (key, value) = parameter.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => (),
        }
    }
    Some((realm?, service.unwrap_or_default()))
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to construct the registry HTTP client")]
    Client {
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to reach the registry {registry}")]
    Unreachable {
        registry: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("the registry {registry} does not know {reference}")]
    TagNotFound { registry: String, reference: String },
    #[error("the registry {registry} rejected the manifest request for {reference} with HTTP {status}")]
    Rejected {
        registry: String,
        reference: String,
        status: u16,
    },
    #[error("the registry {registry} answered for {reference} without a Docker-Content-Digest header")]
    DigestHeaderMissing { registry: String, reference: String },
    #[error("the registry {registry} issued an unusable auth challenge: '{challenge}'")]
    BadChallenge { registry: String, challenge: String },
}

impl FleetError for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_docker_hub_challenge() {
        let got = parse_bearer_challenge(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
        );
        let want = Some((
            "https://auth.docker.io/token".to_string(),
            "registry.docker.io".to_string(),
        ));
        assert_eq!(want, got);
    }

    #[test]
    fn parse_challenge_without_service() {
        let got = parse_bearer_challenge("Bearer realm=\"https://ghcr.io/token\"");
        assert_eq!(
            Some(("https://ghcr.io/token".to_string(), String::new())),
            got
        );
    }

    #[test]
    fn parse_basic_challenge_is_rejected() {
        assert_eq!(None, parse_bearer_challenge("Basic realm=\"registry\""));
    }

    #[test]
    fn pinned_reference_resolves_to_itself() {
        let oracle = HttpRegistry::new().unwrap();
        let digest = tokio_test::block_on(oracle.resolve(
            "reg.example.com/agent:latest@sha256:4a1c6567c38904384ebc64e35b7eeddd8451110c299e3368d2210066487d97e5",
        ))
        .unwrap();
        assert_eq!(
            "sha256:4a1c6567c38904384ebc64e35b7eeddd8451110c299e3368d2210066487d97e5",
            digest
        );
    }
}
