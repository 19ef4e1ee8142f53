use crate::errors::ApiError;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::error::ErrorResponse;
use kube::Api;
use log::debug;
use result::Result;
use std::time::Duration;
use term_colors::*;

/// Everything needed to contend for one coordination/v1 Lease.
#[derive(Clone, Debug)]
pub struct LeaseLockParams {
    pub lease_name: String,
    pub holder_id: String,
    pub lease_ttl: Duration,
}

/// The answer to one acquire/renew attempt.
#[derive(Clone, Debug)]
pub struct LeaderState {
    pub acquired: bool,
    pub holder: Option<String>,
}

/// A `LeaseLock` contends for a named Lease object through plain CRUD with
/// optimistic concurrency: every write goes through `replace` carrying the
/// `resourceVersion` read moments before, so two contenders cannot both
/// win: the loser gets a 409 and reports `acquired: false`.
pub struct LeaseLock {
    api: Api<Lease>,
    params: LeaseLockParams,
}

impl LeaseLock {
    pub async fn new<N: AsRef<str>>(namespace: N, params: LeaseLockParams) -> LeaseLock {
        LeaseLock {
            api: crate::client::new(namespace).await,
            params,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.params.holder_id
    }

    /// One step of the election: create the lease if it does not exist,
    /// renew it if we hold it, take it over if its holder let it expire,
    /// and otherwise concede.
    pub async fn try_acquire_or_renew(&self) -> Result<LeaderState> {
        let lease = match self.api.get(&self.params.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                return self.create().await;
            }
            Err(err) => return Err(ApiError::from(err).into()),
        };
        let holder = holder(&lease).map(str::to_string);
        if holder.as_deref() == Some(self.params.holder_id.as_str()) {
            return self.renew(lease).await;
        }
        if expired(&lease, Utc::now(), self.params.lease_ttl) {
            debug!(
                "lease {} held by expired holder {:?}, taking over",
                cyan(&self.params.lease_name),
                holder
            );
            return self.take_over(lease).await;
        }
        Ok(LeaderState {
            acquired: false,
            holder,
        })
    }

    /// Walks away from a held lease so the next contender does not have to
    /// wait out the TTL. Losing a race here is fine; so is the lease being
    /// gone already.
    pub async fn step_down(&self) -> Result<()> {
        let mut lease = match self.api.get(&self.params.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => return Ok(()),
            Err(err) => return Err(ApiError::from(err).into()),
        };
        if holder(&lease) != Some(self.params.holder_id.as_str()) {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        match self.replace(&lease).await {
            Ok(_) | Err(Conflict) => Ok(()),
            Err(Failed(err)) => Err(err),
        }
    }

    async fn create(&self) -> Result<LeaderState> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.params.lease_name.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(self.desired_spec(0)),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(self.held()),
            // Someone else created it between our get and our create.
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => Ok(LeaderState {
                acquired: false,
                holder: None,
            }),
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn renew(&self, mut lease: Lease) -> Result<LeaderState> {
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(self.params.lease_ttl.as_secs() as i32);
        match self.replace(&lease).await {
            Ok(_) => Ok(self.held()),
            // A conflict on our own lease means a concurrent writer; look
            // again rather than falsely declaring the lease lost.
            Err(Conflict) => {
                let current = self.api.get(&self.params.lease_name).await.map_err(ApiError::from)?;
                let holder = holder(&current).map(str::to_string);
                Ok(LeaderState {
                    acquired: holder.as_deref() == Some(self.params.holder_id.as_str()),
                    holder,
                })
            }
            Err(Failed(err)) => Err(err),
        }
    }

    async fn take_over(&self, mut lease: Lease) -> Result<LeaderState> {
        let transitions = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0);
        lease.spec = Some(self.desired_spec(transitions + 1));
        match self.replace(&lease).await {
            Ok(_) => Ok(self.held()),
            Err(Conflict) => Ok(LeaderState {
                acquired: false,
                holder: None,
            }),
            Err(Failed(err)) => Err(err),
        }
    }

    async fn replace(&self, lease: &Lease) -> std::result::Result<Lease, ReplaceFailure> {
        match self
            .api
            .replace(&self.params.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(lease) => Ok(lease),
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => Err(Conflict),
            Err(err) => Err(Failed(ApiError::from(err).into())),
        }
    }

    fn desired_spec(&self, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.params.holder_id.clone()),
            lease_duration_seconds: Some(self.params.lease_ttl.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
        }
    }

    fn held(&self) -> LeaderState {
        LeaderState {
            acquired: true,
            holder: Some(self.params.holder_id.clone()),
        }
    }
}

enum ReplaceFailure {
    Conflict,
    Failed(Box<dyn error::FleetError>),
}

use ReplaceFailure::{Conflict, Failed};

fn holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref())
        .filter(|holder| !holder.is_empty())
}

/// A lease is expired once its last heartbeat (renew time, falling back to
/// acquire time) is older than its advertised duration. A lease with no
/// timestamps at all is fair game.
fn expired(lease: &Lease, now: DateTime<Utc>, default_ttl: Duration) -> bool {
    let spec = match lease.spec.as_ref() {
        Some(spec) => spec,
        None => return true,
    };
    let ttl = spec
        .lease_duration_seconds
        .map(i64::from)
        .unwrap_or(default_ttl.as_secs() as i64);
    let last_beat = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match last_beat {
        None => true,
        Some(beat) => beat + chrono::Duration::seconds(ttl) < now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder_id: Option<&str>, beat_age_secs: i64, ttl: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder_id.map(str::to_string),
                lease_duration_seconds: Some(ttl),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(beat_age_secs))),
                acquire_time: None,
                lease_transitions: Some(0),
            }),
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        let l = lease(Some("peer"), 5, 15);
        assert!(!expired(&l, Utc::now(), Duration::from_secs(15)));
    }

    #[test]
    fn stale_lease_is_expired() {
        let l = lease(Some("peer"), 60, 15);
        assert!(expired(&l, Utc::now(), Duration::from_secs(15)));
    }

    #[test]
    fn released_lease_has_no_holder() {
        let l = lease(Some(""), 5, 15);
        assert_eq!(None, holder(&l));
    }

    #[test]
    fn specless_lease_is_expired() {
        let l = Lease {
            metadata: ObjectMeta::default(),
            spec: None,
        };
        assert!(expired(&l, Utc::now(), Duration::from_secs(15)));
        assert_eq!(None, holder(&l));
    }
}
