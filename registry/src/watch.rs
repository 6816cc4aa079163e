// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The long-running watcher that turns store deltas into a filtered, batched
//! event stream.

use crate::client::{RegistryClient, RegistryError};
use crate::subnet::Event;
use net::ipv4::Ip4Net;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff between attempts after a transient store failure.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The store operations the watcher consumes.
///
/// [`RegistryClient`] is the real implementation; the seam exists so the
/// watch loop can be exercised against a scripted store.
pub trait SubnetStore {
    /// Read every published subnet plus the index to resume watching from.
    fn subnets(
        &self,
    ) -> impl Future<Output = Result<(Vec<Event>, Option<u64>), RegistryError>> + Send;
    /// Block for the next modification strictly after `after`.
    fn watch_subnet(
        &self,
        after: u64,
    ) -> impl Future<Output = Result<(Event, u64), RegistryError>> + Send;
}

impl SubnetStore for RegistryClient {
    async fn subnets(&self) -> Result<(Vec<Event>, Option<u64>), RegistryError> {
        RegistryClient::subnets(self).await
    }

    async fn watch_subnet(&self, after: u64) -> Result<(Event, u64), RegistryError> {
        RegistryClient::watch_subnet(self, after).await
    }
}

/// Follows the store's subnet prefix and delivers batches of peer events in
/// store order.
///
/// The watcher holds a single resume index.  While it has none it performs a
/// full recursive read and adopts the snapshot index; afterwards it issues
/// single-event watches strictly after the index and advances it on every
/// success.  Transient failures leave the index untouched so the sequence
/// of delivered events stays monotonic.
///
/// Events for the agent's own subnet are dropped.  Empty batches are not
/// delivered.
pub struct SubnetWatcher<S> {
    store: S,
    own_subnet: Ip4Net,
    resume_index: Option<u64>,
    batches: mpsc::Sender<Vec<Event>>,
    token: CancellationToken,
}

impl<S: SubnetStore> SubnetWatcher<S> {
    /// Create a watcher filtering out `own_subnet` and delivering on
    /// `batches`.
    #[must_use]
    pub fn new(
        store: S,
        own_subnet: Ip4Net,
        batches: mpsc::Sender<Vec<Event>>,
        token: CancellationToken,
    ) -> SubnetWatcher<S> {
        SubnetWatcher {
            store,
            own_subnet,
            resume_index: None,
            batches,
            token,
        }
    }

    /// Run until cancelled (or until the batch receiver goes away).
    pub async fn run(mut self) {
        loop {
            let token = self.token.clone();
            let step = tokio::select! {
                () = token.cancelled() => break,
                step = self.next_events() => step,
            };
            match step {
                Ok(events) => {
                    let batch = self.filter_own(events);
                    if batch.is_empty() {
                        continue;
                    }
                    if self.batches.send(batch).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("watch subnets: {err}");
                    tokio::select! {
                        () = self.token.cancelled() => break,
                        () = sleep(WATCH_RETRY_DELAY) => {}
                    }
                }
            }
        }
        debug!("subnet watcher exiting");
    }

    async fn next_events(&mut self) -> Result<Vec<Event>, RegistryError> {
        match self.resume_index {
            None => {
                let (events, index) = self.store.subnets().await?;
                self.resume_index = index;
                Ok(events)
            }
            Some(after) => {
                let (event, index) = self.store.watch_subnet(after).await?;
                self.resume_index = Some(index);
                Ok(vec![event])
            }
        }
    }

    fn filter_own(&self, events: Vec<Event>) -> Vec<Event> {
        events
            .into_iter()
            .filter(|event| event.subnet() != self.own_subnet)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{SubnetStore, SubnetWatcher};
    use crate::client::RegistryError;
    use crate::subnet::{Attrs, Event};
    use net::eth::mac::Mac;
    use net::ipv4::{Ip4, Ip4Net};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn subnet(c: u8) -> Ip4Net {
        Ip4Net::new(Ip4::from_octets([10, 5, c, 0]), 24)
    }

    fn add_event(c: u8) -> Event {
        let subnet = subnet(c);
        Event::Add {
            subnet,
            attrs: Attrs {
                public_ip: Ip4::from_octets([192, 0, 2, c]),
                subnet,
                hardware_addr: Mac([0x02, 0, 0, 0, 0, c]),
            },
        }
    }

    enum Reply {
        Snapshot(Vec<Event>, Option<u64>),
        Watch(Event, u64),
        Fail,
    }

    #[derive(Default)]
    struct ScriptedStore {
        replies: Mutex<VecDeque<Reply>>,
        watch_args: Mutex<Vec<u64>>,
    }

    impl ScriptedStore {
        fn next_reply(&self) -> Option<Reply> {
            self.replies.lock().unwrap().pop_front()
        }
    }

    impl SubnetStore for Arc<ScriptedStore> {
        async fn subnets(&self) -> Result<(Vec<Event>, Option<u64>), RegistryError> {
            match self.next_reply() {
                Some(Reply::Snapshot(events, index)) => Ok((events, index)),
                Some(Reply::Fail) => Err(RegistryError::Store {
                    code: 300,
                    message: "raft leader changed".to_string(),
                }),
                _ => std::future::pending().await,
            }
        }

        async fn watch_subnet(&self, after: u64) -> Result<(Event, u64), RegistryError> {
            self.watch_args.lock().unwrap().push(after);
            match self.next_reply() {
                Some(Reply::Watch(event, index)) => Ok((event, index)),
                Some(Reply::Fail) => Err(RegistryError::Store {
                    code: 401,
                    message: "the event in requested index is outdated".to_string(),
                }),
                _ => std::future::pending().await,
            }
        }
    }

    fn watcher(
        store: Arc<ScriptedStore>,
        own: Ip4Net,
    ) -> (
        SubnetWatcher<Arc<ScriptedStore>>,
        mpsc::Receiver<Vec<Event>>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        (
            SubnetWatcher::new(store, own, tx, token.clone()),
            rx,
            token,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn own_subnet_never_reaches_the_receiver() {
        let store = Arc::new(ScriptedStore::default());
        store.replies.lock().unwrap().push_back(Reply::Snapshot(
            vec![add_event(137), add_event(42)],
            Some(10),
        ));
        let (watcher, mut rx, token) = watcher(store, subnet(137));
        let handle = tokio::spawn(watcher.run());
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![add_event(42)]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_batch_of_only_own_events_is_not_delivered() {
        let store = Arc::new(ScriptedStore::default());
        {
            let mut replies = store.replies.lock().unwrap();
            replies.push_back(Reply::Snapshot(vec![add_event(137)], Some(10)));
            replies.push_back(Reply::Watch(add_event(42), 11));
        }
        let (watcher, mut rx, token) = watcher(store, subnet(137));
        let handle = tokio::spawn(watcher.run());
        // the snapshot held only our own subnet, so the first delivery is the
        // watch event that followed it
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![add_event(42)]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_preserve_the_resume_index() {
        let store = Arc::new(ScriptedStore::default());
        {
            let mut replies = store.replies.lock().unwrap();
            replies.push_back(Reply::Snapshot(vec![], Some(10)));
            replies.push_back(Reply::Fail);
            replies.push_back(Reply::Watch(add_event(42), 12));
        }
        let (watcher, mut rx, token) = watcher(store.clone(), subnet(137));
        let handle = tokio::spawn(watcher.run());
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![add_event(42)]);
        token.cancel();
        handle.await.unwrap();
        // the failed watch was retried from the same index, and only the
        // successful one advanced it
        assert_eq!(*store.watch_args.lock().unwrap(), vec![10, 10, 12]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_subnet_directory_is_an_empty_set_with_no_resume_index() {
        let store = Arc::new(ScriptedStore::default());
        {
            let mut replies = store.replies.lock().unwrap();
            replies.push_back(Reply::Snapshot(vec![], None));
            replies.push_back(Reply::Snapshot(vec![add_event(42)], Some(7)));
        }
        let (watcher, mut rx, token) = watcher(store.clone(), subnet(137));
        let handle = tokio::spawn(watcher.run());
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![add_event(42)]);
        token.cancel();
        handle.await.unwrap();
        // no watch was ever issued before a snapshot produced an index
        assert_eq!(*store.watch_args.lock().unwrap(), vec![7]);
    }
}
