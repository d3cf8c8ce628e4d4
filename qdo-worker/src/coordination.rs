//! Dynamic partition assignment on top of etcd.
//!
//! Every worker registers a member key bound to its lease and watches the
//! member prefix. Once membership has been quiet for `party_wait`, each worker
//! takes every n-th partition of the sorted candidate set, n being the number
//! of members, and claims each of them with a lock key bound to its lease. A
//! membership change moves an acquired worker to `Releasing`; losing the lease
//! moves it to `Failed`.
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse, TxnResponse,
    WatchOptions, WatchStream,
};
use qdo_common::partition::PartitionName;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::assignor::{Assignor, OwnershipState};
use crate::error::AssignorError;

/// How long to wait before trying again to lock partitions another worker still holds.
const CLAIM_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CoordinationSettings {
    pub endpoints: Vec<String>,
    /// Key prefix for every key this worker writes, e.g. "/qdo/worker/".
    pub prefix: String,
    pub lease_ttl: i64,
    pub party_wait: Duration,
}

impl CoordinationSettings {
    fn members_prefix(&self) -> String {
        format!("{}members/", self.prefix)
    }

    fn member_key(&self, identifier: &str) -> String {
        format!("{}{}", self.members_prefix(), identifier)
    }

    fn lock_key(&self, partition: &PartitionName) -> String {
        format!("{}locks/{}", self.prefix, partition)
    }

    fn keepalive_interval(&self) -> Duration {
        Duration::from_secs((self.lease_ttl / 3).max(1) as u64)
    }
}

/// Written to the member key on registration.
#[derive(Debug, Serialize)]
struct MemberRecord<'a> {
    identifier: &'a str,
    registered_at: i64,
}

struct Membership {
    state: OwnershipState,
    members: Vec<String>,
    changed_at: Instant,
    owned: Vec<PartitionName>,
}

impl Membership {
    /// Move to `state`, telling subscribers when it actually changed.
    fn transition(&mut self, state: OwnershipState, states: &watch::Sender<OwnershipState>) {
        if self.state == state {
            return;
        }
        self.state = state;
        states.send_replace(state);
    }
}

/// Membership as seen by the background tasks and the consumption loop.
struct Shared {
    membership: RwLock<Membership>,
    states: watch::Sender<OwnershipState>,
}

type SharedMembership = Arc<Shared>;

impl Shared {
    fn new(members: Vec<String>) -> Self {
        Self {
            membership: RwLock::new(Membership {
                state: OwnershipState::Acquiring,
                members,
                changed_at: Instant::now(),
                owned: Vec::new(),
            }),
            states: watch::Sender::new(OwnershipState::Acquiring),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Membership> {
        self.membership.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Membership> {
        self.membership.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_failed(&self) {
        let mut membership = self.write();
        membership.transition(OwnershipState::Failed, &self.states);
        membership.owned.clear();
    }
}

/// The share of `set` owned by `identifier` among `members`.
///
/// Both lists are sorted first so that every member computes the same split.
pub fn partition_share(
    set: &[PartitionName],
    members: &[String],
    identifier: &str,
) -> Vec<PartitionName> {
    let mut members = members.to_vec();
    members.sort();
    members.dedup();
    let Some(position) = members.iter().position(|m| m == identifier) else {
        return Vec::new();
    };

    let mut set = set.to_vec();
    set.sort();
    set.into_iter()
        .enumerate()
        .filter(|(i, _)| i % members.len() == position)
        .map(|(_, partition)| partition)
        .collect()
}

pub struct EtcdPartitioner {
    client: Client,
    settings: CoordinationSettings,
    identifier: String,
    set: Vec<PartitionName>,
    lease_id: i64,
    membership: SharedMembership,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl EtcdPartitioner {
    /// Register with etcd and start following membership. Starts out `Acquiring`.
    pub async fn start(
        settings: CoordinationSettings,
        identifier: &str,
        set: Vec<PartitionName>,
    ) -> Result<Self, AssignorError> {
        let client = Client::connect(&settings.endpoints, None).await?;
        let lease_id = client
            .clone()
            .lease_grant(settings.lease_ttl, None)
            .await?
            .id();

        let record = MemberRecord {
            identifier,
            registered_at: now_seconds(),
        };
        client
            .clone()
            .put(
                settings.member_key(identifier),
                serde_json::to_vec(&record)?,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await?;

        // watch before listing, so a change in between is not missed
        let members_prefix = settings.members_prefix();
        let stream = client
            .clone()
            .watch(
                members_prefix.as_str(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await?;
        let members = list_members(&client, &members_prefix).await?;

        info!(
            identifier,
            members = members.len(),
            partitions = set.len(),
            "registered with etcd"
        );

        let membership = Arc::new(Shared::new(members));
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(run_lease_keepalive(
            client.clone(),
            lease_id,
            settings.keepalive_interval(),
            membership.clone(),
            cancel.clone(),
        ));
        tasks.spawn(watch_members(
            client.clone(),
            stream,
            members_prefix,
            membership.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            client,
            settings,
            identifier: identifier.to_owned(),
            set,
            lease_id,
            membership,
            cancel,
            tasks,
        })
    }

    /// Lock every partition of `share`, or none of them.
    async fn claim(&self, share: &[PartitionName]) -> Result<bool, AssignorError> {
        let mut claimed = Vec::with_capacity(share.len());

        for partition in share {
            let key = self.settings.lock_key(partition);
            let txn = Txn::new()
                .when(vec![Compare::version(key.as_str(), CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(
                    key.as_str(),
                    self.identifier.as_str(),
                    Some(PutOptions::new().with_lease(self.lease_id)),
                )])
                .or_else(vec![TxnOp::get(key.as_str(), None)]);

            let response = self.client.clone().txn(txn).await?;
            if response.succeeded() || held_by(response, &self.identifier) {
                claimed.push(partition.clone());
                continue;
            }

            debug!(partition = %partition, "partition is still locked by another worker");
            self.unlock(&claimed).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Delete the lock keys we hold for `partitions`.
    async fn unlock(&self, partitions: &[PartitionName]) -> Result<(), AssignorError> {
        for partition in partitions {
            let key = self.settings.lock_key(partition);
            let txn = Txn::new()
                .when(vec![Compare::value(
                    key.as_str(),
                    CompareOp::Equal,
                    self.identifier.as_str(),
                )])
                .and_then(vec![TxnOp::delete(key.as_str(), None)]);
            self.client.clone().txn(txn).await?;
        }
        Ok(())
    }
}

fn held_by(response: TxnResponse, identifier: &str) -> bool {
    response.op_responses().into_iter().any(|op| match op {
        TxnOpResponse::Get(get) => get
            .kvs()
            .first()
            .is_some_and(|kv| kv.value() == identifier.as_bytes()),
        _ => false,
    })
}

#[async_trait]
impl Assignor for EtcdPartitioner {
    fn state(&self) -> OwnershipState {
        self.membership.read().state
    }

    fn subscribe(&self) -> watch::Receiver<OwnershipState> {
        self.membership.states.subscribe()
    }

    fn partitions(&self) -> Vec<PartitionName> {
        let membership = self.membership.read();
        match membership.state {
            OwnershipState::Acquired => membership.owned.clone(),
            _ => Vec::new(),
        }
    }

    async fn wait_for_acquire(&self, timeout: Duration) -> Result<(), AssignorError> {
        let deadline = Instant::now() + timeout;

        loop {
            let (state, members, changed_at) = {
                let membership = self.membership.read();
                (
                    membership.state,
                    membership.members.clone(),
                    membership.changed_at,
                )
            };
            if state != OwnershipState::Acquiring {
                return Ok(());
            }

            let now = Instant::now();
            let settled_at = changed_at + self.settings.party_wait;
            if now >= settled_at {
                let share = partition_share(&self.set, &members, &self.identifier);
                if self.claim(&share).await? {
                    let acquired = {
                        let mut membership = self.membership.write();
                        let unchanged = membership.state == OwnershipState::Acquiring
                            && membership.changed_at == changed_at;
                        if unchanged {
                            membership.owned = share.clone();
                            membership
                                .transition(OwnershipState::Acquired, &self.membership.states);
                        }
                        unchanged
                    };
                    if acquired {
                        info!(
                            identifier = %self.identifier,
                            partitions = share.len(),
                            members = members.len(),
                            "acquired partitions"
                        );
                        return Ok(());
                    }
                    // membership moved while we were claiming
                    self.unlock(&share).await?;
                    continue;
                }
            }

            if now >= deadline {
                debug!(identifier = %self.identifier, "no partitions acquired before timeout");
                return Ok(());
            }

            let wake_at = if now >= settled_at {
                now + CLAIM_RETRY_INTERVAL
            } else {
                settled_at
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(wake_at.min(deadline)) => {}
            }
        }
    }

    async fn release_set(&self) -> Result<(), AssignorError> {
        let owned = {
            let mut membership = self.membership.write();
            if membership.state != OwnershipState::Failed {
                membership.transition(OwnershipState::Acquiring, &self.membership.states);
            }
            std::mem::take(&mut membership.owned)
        };

        self.unlock(&owned).await?;
        info!(
            identifier = %self.identifier,
            partitions = owned.len(),
            "released partitions"
        );
        Ok(())
    }

    async fn finish(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        // revoking the lease drops our member key and every lock we hold
        if let Err(e) = self.client.clone().lease_revoke(self.lease_id).await {
            warn!(identifier = %self.identifier, error = %e, "failed to revoke lease");
        }
        self.membership.mark_failed();
        info!(identifier = %self.identifier, "left the worker group");
    }
}

async fn list_members(client: &Client, members_prefix: &str) -> Result<Vec<String>, AssignorError> {
    let options = GetOptions::new().with_prefix().with_keys_only();
    let response = client.clone().get(members_prefix, Some(options)).await?;

    let mut members: Vec<String> = response
        .kvs()
        .iter()
        .filter_map(|kv| kv.key_str().ok())
        .filter_map(|key| key.strip_prefix(members_prefix))
        .map(str::to_owned)
        .collect();
    members.sort();
    Ok(members)
}

async fn watch_members(
    client: Client,
    mut stream: WatchStream,
    members_prefix: String,
    membership: SharedMembership,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.message() => {
                let result = match message {
                    Ok(Some(response)) if response.events().is_empty() => continue,
                    Ok(Some(_)) => list_members(&client, &members_prefix).await,
                    Ok(None) => Err(AssignorError::SessionLost),
                    Err(e) => Err(e.into()),
                };

                match result {
                    Ok(members) => update_members(&membership, members),
                    Err(e) => {
                        error!(error = %e, "membership watch failed");
                        membership.mark_failed();
                        return;
                    }
                }
            }
        }
    }
}

fn update_members(shared: &Shared, members: Vec<String>) {
    let mut membership = shared.write();
    if membership.members == members {
        return;
    }

    info!(
        before = membership.members.len(),
        after = members.len(),
        "worker group membership changed"
    );
    membership.members = members;
    membership.changed_at = Instant::now();
    if membership.state == OwnershipState::Acquired {
        membership.transition(OwnershipState::Releasing, &shared.states);
    }
}

async fn run_lease_keepalive(
    client: Client,
    lease_id: i64,
    interval: Duration,
    membership: SharedMembership,
    cancel: CancellationToken,
) {
    if let Err(e) = keep_lease_alive(client, lease_id, interval, cancel).await {
        error!(error = %e, "lease keepalive failed, giving up partitions");
        membership.mark_failed();
    }
}

async fn keep_lease_alive(
    mut client: Client,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), AssignorError> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                match stream.message().await? {
                    Some(response) if response.ttl() > 0 => {}
                    _ => return Err(AssignorError::SessionLost),
                }
            }
        }
    }
}

fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
