//! etcd-backed [`StoreClient`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lease::{LeaseId, NO_LEASE_ID};

use super::{PrefixView, StoreClient, WatchEvent, WatchKind};

const WATCH_CHAN_CAPACITY: usize = 64;

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to etcd with exponential backoff.
    pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!("connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StoreClient for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixView> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    String::from_utf8_lossy(kv.value()).into_owned(),
                )
            })
            .collect();
        Ok(PrefixView { kvs, revision })
    }

    async fn compare_and_swap(&self, key: &str, expect: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::value(key, CompareOp::Equal, expect)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(Error::ValueMismatch {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let options = (lease != NO_LEASE_ID).then(|| PutOptions::new().with_lease(lease));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn lease_ttl(&self, lease: LeaseId) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.lease_time_to_live(lease, None).await?;
        Ok(resp.ttl())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_rev: i64,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_rev)
            .with_prev_key();
        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;

        let (tx, rx) = mpsc::channel(WATCH_CHAN_CAPACITY);
        tokio::spawn(async move {
            // The watcher cancels the server-side watch when dropped, so
            // it lives as long as the stream is being drained.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        debug!("watch stream closed");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "watch stream failed");
                        return;
                    }
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let kind = match event.event_type() {
                        EventType::Put if kv.create_revision() == kv.mod_revision() => {
                            WatchKind::Create
                        }
                        EventType::Put => WatchKind::Modify,
                        EventType::Delete => WatchKind::Delete,
                    };
                    let prev_value = event
                        .prev_kv()
                        .map(|prev| String::from_utf8_lossy(prev.value()).into_owned());
                    let out = WatchEvent {
                        kind,
                        key: String::from_utf8_lossy(kv.key()).into_owned(),
                        value: String::from_utf8_lossy(kv.value()).into_owned(),
                        prev_value,
                    };
                    if tx.send(out).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
