use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::datastore::Subscription;
use crate::error::Result;
use crate::types::{Job, RateLimit};

/// Batches buffered per subscription before the feed waits on the reader.
const FEED_BUFFER: usize = 64;

/// Something a feed can tell apart across re-queries.
pub(crate) trait FeedItem {
    fn feed_key(&self) -> &str;
    fn revision(&self) -> u64;
}

impl FeedItem for Job {
    fn feed_key(&self) -> &str {
        self.id.as_str()
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl FeedItem for RateLimit {
    fn feed_key(&self) -> &str {
        &self.key
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

/// Drive a subscription by re-running `query` whenever `changes` moves (and
/// every `poll` if set).
///
/// Each run delivers the items that were not in the previous result at the
/// same revision, so an item is sent once per entry into the matching set.
pub(crate) fn spawn_feed<T, F>(
    mut changes: watch::Receiver<u64>,
    cancel: CancellationToken,
    poll: Option<Duration>,
    mut query: F,
) -> Subscription<T>
where
    T: FeedItem + Send + 'static,
    F: FnMut() -> Result<Vec<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FEED_BUFFER);
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut seen: HashMap<String, u64> = HashMap::new();
        loop {
            changes.borrow_and_update();
            match query() {
                Ok(items) => {
                    let mut current = HashMap::with_capacity(items.len());
                    let mut fresh = Vec::new();
                    for item in items {
                        let key = item.feed_key().to_string();
                        let revision = item.revision();
                        if seen.get(&key) != Some(&revision) {
                            fresh.push(item);
                        }
                        current.insert(key, revision);
                    }
                    seen = current;
                    if !fresh.is_empty() {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            sent = tx.send(fresh) => if sent.is_err() { break },
                        }
                    }
                }
                Err(e) => warn!("subscription query failed: {e}"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                changed = changes.changed() => if changed.is_err() { break },
                _ = wait(poll) => {}
            }
        }
        debug!("subscription closed");
    });

    Subscription::new(rx, cancel)
}

async fn wait(poll: Option<Duration>) {
    match poll {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
