//! GroupQuery - scatter-gather aggregate query coordinator
//!
//! A short-lived task spawned per aggregate query. It takes a snapshot of one
//! group's device handles, fans a read out to each, and folds replies,
//! terminations, and a single deadline into exactly one status per device.
//! Replies and stop notices flow through the query's private event queue, so
//! resolution is serial even though the sources race.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::device::DeviceHandle;
use super::messages::{AggregateResult, DeviceCommand, ReadingStatus};

/// Events posted into the query's own queue by the per-device tasks
#[derive(Debug)]
enum QueryEvent {
    /// A device answered its read request
    Reading { device_id: String, value: Option<f64> },
    /// A device's inbox closed before it answered
    DeviceStopped { device_id: String },
}

/// One in-flight aggregate query
pub(crate) struct GroupQuery {
    request_id: u64,
    group_id: String,
    reply: oneshot::Sender<AggregateResult>,
    still_waiting: HashSet<String>,
    readings: HashMap<String, ReadingStatus>,
}

impl GroupQuery {
    /// Spawn a query over a snapshot of device handles
    pub(crate) fn spawn(
        request_id: u64,
        group_id: String,
        snapshot: HashMap<String, DeviceHandle>,
        reply: oneshot::Sender<AggregateResult>,
        timeout: Duration,
    ) {
        let query = GroupQuery {
            request_id,
            group_id,
            reply,
            still_waiting: snapshot.keys().cloned().collect(),
            readings: HashMap::new(),
        };
        tokio::spawn(query.run(snapshot, timeout));
    }

    async fn run(mut self, snapshot: HashMap<String, DeviceHandle>, timeout: Duration) {
        debug!(
            group_id = %self.group_id,
            request_id = self.request_id,
            devices = snapshot.len(),
            "Query started"
        );

        // Nothing to wait for; answer before arming any machinery.
        if snapshot.is_empty() {
            self.finish();
            return;
        }

        let (events_tx, mut events_rx) = mpsc::channel(snapshot.len());

        for (device_id, device) in snapshot {
            // Watch for termination before sending the read, so a death
            // between dispatch and answer cannot be missed.
            let watched = device.clone();
            let watch_tx = events_tx.clone();
            let watch_id = device_id.clone();
            tokio::spawn(async move {
                let stopped = tokio::select! {
                    _ = watched.closed() => true,
                    _ = watch_tx.closed() => false,
                };
                if stopped {
                    let _ = watch_tx.send(QueryEvent::DeviceStopped { device_id: watch_id }).await;
                }
            });

            // Fan out the read; the reply is forwarded into the event queue.
            // A dropped reply means the device stopped, which the watcher
            // reports, so this task just goes away.
            let (reply_tx, reply_rx) = oneshot::channel();
            let read_tx = events_tx.clone();
            let request_id = self.request_id;
            tokio::spawn(async move {
                if device
                    .send(DeviceCommand::Read {
                        request_id,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                if let Ok(reading) = reply_rx.await {
                    let _ = read_tx
                        .send(QueryEvent::Reading {
                            device_id,
                            value: reading.value,
                        })
                        .await;
                }
            });
        }

        // Only the per-device tasks hold senders now; dropping the receiver
        // at the end releases the watchers of devices that never stop.
        drop(events_tx);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !self.still_waiting.is_empty() {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(QueryEvent::Reading { device_id, value }) => {
                        let status = match value {
                            Some(v) => ReadingStatus::Value(v),
                            None => ReadingStatus::NotTracked,
                        };
                        self.resolve(device_id, status);
                    }
                    Some(QueryEvent::DeviceStopped { device_id }) => {
                        self.resolve(device_id, ReadingStatus::Terminated);
                    }
                    // All senders gone; nothing further can arrive.
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        group_id = %self.group_id,
                        request_id = self.request_id,
                        pending = self.still_waiting.len(),
                        "Query deadline reached"
                    );
                    for device_id in std::mem::take(&mut self.still_waiting) {
                        self.readings.insert(device_id, ReadingStatus::TimedOut);
                    }
                }
            }
        }

        self.finish();
    }

    /// Record a device's terminal status, first event wins
    fn resolve(&mut self, device_id: String, status: ReadingStatus) {
        // A reply and a stop notice for the same device can race; the loser
        // arrives after the id left the waiting set and is ignored.
        if self.still_waiting.remove(&device_id) {
            self.readings.insert(device_id, status);
        }
    }

    fn finish(self) {
        debug!(
            group_id = %self.group_id,
            request_id = self.request_id,
            devices = self.readings.len(),
            "Query finished"
        );
        let _ = self.reply.send(AggregateResult {
            request_id: self.request_id,
            readings: self.readings,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::messages::Reading;
    use std::time::Instant;

    /// Device stand-in that answers every read with a fixed value
    fn replying_device(device_id: &str, value: Option<f64>) -> DeviceHandle {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let DeviceCommand::Read { request_id, reply } = cmd {
                    let _ = reply.send(Reading { request_id, value });
                }
            }
        });
        DeviceHandle::from_channel("g", device_id, tx)
    }

    /// Device stand-in that never answers; stops when the receiver drops
    fn silent_device(device_id: &str) -> (DeviceHandle, mpsc::Receiver<DeviceCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (DeviceHandle::from_channel("g", device_id, tx), rx)
    }

    #[tokio::test]
    async fn test_query_collects_values_and_not_tracked() {
        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), replying_device("a", Some(24.0)));
        snapshot.insert("b".to_string(), replying_device("b", None));

        let (reply_tx, reply_rx) = oneshot::channel();
        GroupQuery::spawn(7, "g".to_string(), snapshot, reply_tx, Duration::from_secs(1));

        let result = reply_rx.await.unwrap();
        assert_eq!(result.request_id, 7);
        assert_eq!(result.readings.len(), 2);
        assert_eq!(result.readings["a"], ReadingStatus::Value(24.0));
        assert_eq!(result.readings["b"], ReadingStatus::NotTracked);
    }

    #[tokio::test]
    async fn test_empty_snapshot_answers_immediately() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let started = Instant::now();
        GroupQuery::spawn(1, "g".to_string(), HashMap::new(), reply_tx, Duration::from_secs(10));

        let result = reply_rx.await.unwrap();
        assert_eq!(result.request_id, 1);
        assert!(result.readings.is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_already_stopped_device_is_terminated() {
        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), replying_device("a", Some(1.0)));
        let (stopped, stopped_rx) = silent_device("b");
        drop(stopped_rx);
        snapshot.insert("b".to_string(), stopped);

        let (reply_tx, reply_rx) = oneshot::channel();
        GroupQuery::spawn(2, "g".to_string(), snapshot, reply_tx, Duration::from_secs(1));

        let result = reply_rx.await.unwrap();
        assert_eq!(result.readings["a"], ReadingStatus::Value(1.0));
        assert_eq!(result.readings["b"], ReadingStatus::Terminated);
    }

    #[tokio::test]
    async fn test_device_stopping_mid_query_is_terminated() {
        let (device, inbox) = silent_device("a");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(inbox);
        });

        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), device);

        let (reply_tx, reply_rx) = oneshot::channel();
        let started = Instant::now();
        GroupQuery::spawn(3, "g".to_string(), snapshot, reply_tx, Duration::from_secs(5));

        let result = reply_rx.await.unwrap();
        assert_eq!(result.readings["a"], ReadingStatus::Terminated);
        // Resolved by the stop notice, not the deadline.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), replying_device("a", Some(1.0)));
        let (silent, _inbox) = silent_device("b");
        snapshot.insert("b".to_string(), silent);

        let (reply_tx, reply_rx) = oneshot::channel();
        let started = Instant::now();
        GroupQuery::spawn(4, "g".to_string(), snapshot, reply_tx, Duration::from_millis(200));

        let result = reply_rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(result.readings["a"], ReadingStatus::Value(1.0));
        assert_eq!(result.readings["b"], ReadingStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_reply_sent_before_stop_yields_value() {
        let (tx, mut rx) = mpsc::channel(8);
        let device = DeviceHandle::from_channel("g", "a", tx);

        // Answer the read, then close the inbox right away.
        tokio::spawn(async move {
            if let Some(DeviceCommand::Read { request_id, reply }) = rx.recv().await {
                let _ = reply.send(Reading {
                    request_id,
                    value: Some(9.5),
                });
            }
        });

        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), device);

        let (reply_tx, reply_rx) = oneshot::channel();
        GroupQuery::spawn(5, "g".to_string(), snapshot, reply_tx, Duration::from_secs(5));

        let result = reply_rx.await.unwrap();
        assert_eq!(result.readings.len(), 1);
        assert_eq!(result.readings["a"], ReadingStatus::Value(9.5));
    }

    #[tokio::test]
    async fn test_late_reply_after_stop_notice_is_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let device = DeviceHandle::from_channel("g", "a", tx);
        let (keeper, _keeper_inbox) = silent_device("b");

        // Hold on to the reply sender, close the inbox, answer afterwards.
        tokio::spawn(async move {
            let cmd = rx.recv().await;
            drop(rx);
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(DeviceCommand::Read { request_id, reply }) = cmd {
                let _ = reply.send(Reading {
                    request_id,
                    value: Some(3.0),
                });
            }
        });

        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), device);
        snapshot.insert("b".to_string(), keeper);

        let (reply_tx, reply_rx) = oneshot::channel();
        GroupQuery::spawn(6, "g".to_string(), snapshot, reply_tx, Duration::from_millis(300));

        let result = reply_rx.await.unwrap();
        assert_eq!(result.readings["a"], ReadingStatus::Terminated);
        assert_eq!(result.readings["b"], ReadingStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_concurrent_reply_and_stop_resolve_exactly_once() {
        for _ in 0..20 {
            let (tx, mut rx) = mpsc::channel(8);
            let device = DeviceHandle::from_channel("g", "a", tx);

            // The inbox drops as soon as the reply is sent, racing the
            // reading against the stop notice through the relays.
            tokio::spawn(async move {
                if let Some(DeviceCommand::Read { request_id, reply }) = rx.recv().await {
                    let _ = reply.send(Reading {
                        request_id,
                        value: Some(1.0),
                    });
                }
            });

            let mut snapshot = HashMap::new();
            snapshot.insert("a".to_string(), device);

            let (reply_tx, reply_rx) = oneshot::channel();
            GroupQuery::spawn(8, "g".to_string(), snapshot, reply_tx, Duration::from_secs(5));

            let result = reply_rx.await.unwrap();
            assert_eq!(result.readings.len(), 1);
            assert!(matches!(
                result.readings["a"],
                ReadingStatus::Value(_) | ReadingStatus::Terminated
            ));
        }
    }

    #[tokio::test]
    async fn test_reads_carry_the_query_request_id() {
        let (tx, mut rx) = mpsc::channel(8);
        let device = DeviceHandle::from_channel("g", "a", tx);
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Some(DeviceCommand::Read { request_id, reply }) = rx.recv().await {
                let _ = seen_tx.send(request_id);
                let _ = reply.send(Reading { request_id, value: None });
            }
        });

        let mut snapshot = HashMap::new();
        snapshot.insert("a".to_string(), device);

        let (reply_tx, reply_rx) = oneshot::channel();
        GroupQuery::spawn(41, "g".to_string(), snapshot, reply_tx, Duration::from_secs(1));

        assert_eq!(seen_rx.await.unwrap(), 41);
        let result = reply_rx.await.unwrap();
        assert_eq!(result.readings["a"], ReadingStatus::NotTracked);
    }
}
