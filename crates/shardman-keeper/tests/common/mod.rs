//! Shared fixtures for the keeper integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use shardman_core::lease::Lease;
use shardman_core::shard::ShardSpec;
use shardman_core::{Error, Result};
use shardman_keeper::ShardPrimitives;

/// Application double tracking live shards and every callback made.
#[derive(Default)]
pub struct RecordingApp {
    live: Mutex<HashSet<String>>,
    adds: Mutex<Vec<String>>,
    drops: Mutex<Vec<String>>,
}

impl RecordingApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_set(&self) -> HashSet<String> {
        self.live.lock().unwrap().clone()
    }

    pub fn add_calls(&self, id: &str) -> usize {
        self.adds.lock().unwrap().iter().filter(|x| *x == id).count()
    }

    pub fn drop_calls(&self, id: &str) -> usize {
        self.drops.lock().unwrap().iter().filter(|x| *x == id).count()
    }
}

#[async_trait]
impl ShardPrimitives for RecordingApp {
    async fn add(&self, id: &str, _spec: &ShardSpec) -> Result<()> {
        self.adds.lock().unwrap().push(id.to_string());
        if !self.live.lock().unwrap().insert(id.to_string()) {
            return Err(Error::AlreadyExists);
        }
        Ok(())
    }

    async fn drop(&self, id: &str) -> Result<()> {
        self.drops.lock().unwrap().push(id.to_string());
        if !self.live.lock().unwrap().remove(id) {
            return Err(Error::NotExist);
        }
        Ok(())
    }
}

pub fn spec(service: &str, id: &str, lease: i64) -> ShardSpec {
    ShardSpec {
        id: id.into(),
        service: service.into(),
        task: "{}".into(),
        lease: (lease != 0).then(|| Lease::new(lease, 0)),
        update_time: 1,
    }
}

pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
