use crate::types::{AgentBead, Bead};
use async_trait::async_trait;
use error::*;
use log::debug;
use result::Result;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use term_colors::*;

/// The per-request deadline for bead store traffic. The store lives in the
/// same cluster; anything slower than this is treated as an outage.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The slice of the bead store API that the controller core consumes. The
/// reconciler, reactor, and reporter all take this trait so that tests can
/// hand them an in-memory double.
#[async_trait]
pub trait BeadStore: Send + Sync {
    /// All open agent beads. Records that fail validation (wrong type,
    /// incomplete coordinates) are dropped, not errored.
    async fn list_agents(&self) -> Result<Vec<AgentBead>>;

    /// Merge the given keys into the bead's typed field map.
    async fn set_fields(&self, bead_id: &str, fields: HashMap<String, String>) -> Result<()>;

    /// Replace the bead's free-form notes field.
    async fn set_notes(&self, bead_id: &str, notes: &str) -> Result<()>;
}

/// A `BeadClient` talks to the bead store's HTTP API.
pub struct BeadClient {
    base: String,
    http: reqwest::Client,
    projects: RwLock<Vec<String>>,
}

impl BeadClient {
    /// `addr` is a bare `host:port` (the `BEADS_HTTP_ADDR` convention); the
    /// store speaks plain HTTP inside the cluster.
    pub fn new<T: AsRef<str>>(addr: T) -> Result<BeadClient> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| StoreError::Client { source })?;
        Ok(BeadClient {
            base: format!("http://{}", addr.as_ref()),
            http,
            projects: RwLock::new(Vec::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn get(&self, bead_id: &str) -> Result<Bead> {
        let url = format!("{}/v1/beads/{}", self.base, bead_id);
        Ok(self.fetch_json::<Bead>(&url).await?)
    }

    pub async fn close(&self, bead_id: &str) -> Result<()> {
        let url = format!("{}/v1/beads/{}/close", self.base, bead_id);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|source| StoreError::Unreachable { source })?;
        ok_or_rejected(&url, response.status().as_u16())
    }

    /// Re-fetches the set of known project names. The cached copy is what
    /// [projects](BeadClient::projects) serves between refreshes.
    pub async fn refresh_projects(&self) -> Result<usize> {
        let url = format!("{}/v1/projects", self.base);
        let listing = self.fetch_json::<ProjectListing>(&url).await?;
        let count = listing.projects.len();
        let mut cache = self.projects.write().expect("project cache poisoned");
        *cache = listing.projects;
        Ok(count)
    }

    pub fn projects(&self) -> Vec<String> {
        self.projects.read().expect("project cache poisoned").clone()
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| StoreError::Unreachable { source })?;
        ok_or_rejected(url, response.status().as_u16())?;
        Ok(response
            .json::<T>()
            .await
            .map_err(|source| StoreError::Decode { source })?)
    }
}

#[async_trait]
impl BeadStore for BeadClient {
    async fn list_agents(&self) -> Result<Vec<AgentBead>> {
        let url = format!("{}/v1/beads?type={}&status=open", self.base, crate::AGENT_BEAD_TYPE);
        let listing = self.fetch_json::<BeadListing>(&url).await?;
        let total = listing.beads.len();
        let agents: Vec<AgentBead> = listing
            .beads
            .into_iter()
            .filter_map(AgentBead::validate)
            .collect();
        if agents.len() < total {
            debug!(
                "bead store listed {} agent beads, {} survived validation",
                total,
                agents.len()
            );
        }
        Ok(agents)
    }

    async fn set_fields(&self, bead_id: &str, fields: HashMap<String, String>) -> Result<()> {
        let url = format!("{}/v1/beads/{}/fields", self.base, bead_id);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "fields": fields }))
            .send()
            .await
            .map_err(|source| StoreError::Unreachable { source })?;
        debug!("updated fields on bead {}", cyan(bead_id));
        ok_or_rejected(&url, response.status().as_u16())
    }

    async fn set_notes(&self, bead_id: &str, notes: &str) -> Result<()> {
        let url = format!("{}/v1/beads/{}/notes", self.base, bead_id);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "notes": notes }))
            .send()
            .await
            .map_err(|source| StoreError::Unreachable { source })?;
        ok_or_rejected(&url, response.status().as_u16())
    }
}

fn ok_or_rejected(url: &str, status: u16) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StoreError::Rejected {
            url: url.to_string(),
            status,
        }
        .into())
    }
}

#[derive(Deserialize)]
struct BeadListing {
    #[serde(default)]
    beads: Vec<Bead>,
}

#[derive(Deserialize)]
struct ProjectListing {
    #[serde(default)]
    projects: Vec<String>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to construct the bead store HTTP client")]
    Client {
        #[source]
        source: reqwest::Error,
    },
    #[error("the bead store could not be reached")]
    Unreachable {
        #[source]
        source: reqwest::Error,
    },
    #[error("the bead store rejected {url} with HTTP {status}")]
    Rejected { url: String, status: u16 },
    #[error("the bead store answered with a body this controller cannot decode")]
    Decode {
        #[source]
        source: reqwest::Error,
    },
}

impl FleetError for StoreError {}
