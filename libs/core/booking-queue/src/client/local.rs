//! In-process FIFO queue with visibility leases.
//!
//! One mutex guards all state so receive, ack and lease expiry are
//! serialized. Intended for development and tests; state is lost with the
//! process.

use super::{EnqueueReport, QueueClient};
use crate::config::{QueueConfig, MAX_RECEIVE_BATCH};
use crate::error::QueueError;
use crate::message::{BookingMessage, ReceiptHandle};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug)]
struct Lease {
    handle: String,
    deadline: Instant,
}

#[derive(Debug)]
struct StoredMessage {
    message: BookingMessage,
    lease: Option<Lease>,
}

impl StoredMessage {
    fn is_leased(&self, now: Instant) -> bool {
        self.lease.as_ref().is_some_and(|l| l.deadline > now)
    }
}

#[derive(Debug, Default)]
struct State {
    groups: HashMap<String, VecDeque<StoredMessage>>,
    /// Group keys in rotation order
    order: VecDeque<String>,
    /// handle -> group key of the leased message
    leases: HashMap<String, String>,
    /// dedup_id -> (message_id, accepted_at)
    dedup: HashMap<String, (String, Instant)>,
    dedup_order: VecDeque<(Instant, String)>,
    unavailable: bool,
}

impl State {
    fn purge_dedup(&mut self, now: Instant, window: Duration) {
        while let Some((accepted_at, _)) = self.dedup_order.front() {
            if now.duration_since(*accepted_at) < window {
                break;
            }
            if let Some((_, dedup_id)) = self.dedup_order.pop_front() {
                self.dedup.remove(&dedup_id);
            }
        }
    }

    /// Position of the message leased under `handle`. An expired or unknown
    /// handle is stale.
    fn find_leased(&mut self, handle: &str, now: Instant) -> Result<(String, usize), QueueError> {
        let stale = || QueueError::StaleReceipt(handle.to_string());

        let group_key = self.leases.get(handle).cloned().ok_or_else(stale)?;
        let position = self.groups.get(&group_key).and_then(|group| {
            group.iter().position(|m| {
                m.lease
                    .as_ref()
                    .is_some_and(|l| l.handle == handle && l.deadline > now)
            })
        });

        match position {
            Some(index) => Ok((group_key, index)),
            None => {
                self.leases.remove(handle);
                Err(stale())
            }
        }
    }

    fn remove_group_if_empty(&mut self, group_key: &str) {
        if self.groups.get(group_key).is_some_and(VecDeque::is_empty) {
            self.groups.remove(group_key);
            self.order.retain(|g| g != group_key);
        }
    }
}

/// Single-process queue client
pub struct LocalQueueClient {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
    dedup_window: Duration,
}

impl LocalQueueClient {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout: config.visibility_timeout(),
            dedup_window: config.dedup_window(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total messages held, including in-flight ones
    pub fn len(&self) -> usize {
        self.lock().groups.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently under an unexpired lease
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .groups
            .values()
            .flatten()
            .filter(|m| m.is_leased(now))
            .count()
    }

    /// Simulate a queue outage: while set, every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
        if !unavailable {
            self.notify.notify_waiters();
        }
    }

    fn check_available(state: &State) -> Result<(), QueueError> {
        if state.unavailable {
            Err(QueueError::unavailable("local queue marked unavailable"))
        } else {
            Ok(())
        }
    }

    /// Take up to `max` deliverable messages. Also returns the earliest
    /// lease deadline that kept a group locked, if any.
    fn take_available(
        &self,
        max: usize,
    ) -> Result<(Vec<BookingMessage>, Option<Instant>), QueueError> {
        let mut guard = self.lock();
        Self::check_available(&guard)?;

        let now = Instant::now();
        let deadline = now + self.visibility_timeout;
        let mut batch = Vec::new();
        let mut next_expiry: Option<Instant> = None;

        let State {
            groups,
            order,
            leases,
            ..
        } = &mut *guard;

        for group_key in order.iter() {
            if batch.len() >= max {
                break;
            }
            let Some(group) = groups.get_mut(group_key) else {
                continue;
            };

            // A group with any live lease stays locked
            if let Some(blocking) = group
                .iter()
                .filter_map(|m| m.lease.as_ref())
                .filter(|l| l.deadline > now)
                .map(|l| l.deadline)
                .min()
            {
                next_expiry = Some(next_expiry.map_or(blocking, |e| e.min(blocking)));
                continue;
            }

            for stored in group.iter_mut() {
                if batch.len() >= max {
                    break;
                }
                if let Some(expired) = stored.lease.take() {
                    trace!(
                        message_id = %stored.message.message_id,
                        "Visibility expired, redelivering"
                    );
                    leases.remove(&expired.handle);
                }

                let handle = format!("{}:{}", stored.message.message_id, Uuid::new_v4());
                stored.message.receive_count += 1;
                stored.lease = Some(Lease {
                    handle: handle.clone(),
                    deadline,
                });
                leases.insert(handle.clone(), group_key.clone());

                let mut delivered = stored.message.clone();
                delivered.receipt_handle = Some(ReceiptHandle::new(handle));
                batch.push(delivered);
            }
        }

        // Start the next receive at a different group
        if !batch.is_empty() && !order.is_empty() {
            order.rotate_left(1);
        }

        Ok((batch, next_expiry))
    }
}

#[async_trait]
impl QueueClient for LocalQueueClient {
    async fn enqueue(&self, messages: Vec<BookingMessage>) -> Result<EnqueueReport, QueueError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let now = Instant::now();
        state.purge_dedup(now, self.dedup_window);

        let mut report = EnqueueReport::default();
        for mut message in messages {
            if let Some((existing_id, _)) = state.dedup.get(&message.dedup_id) {
                debug!(dedup_id = %message.dedup_id, "Duplicate enqueue suppressed");
                report.message_ids.push(existing_id.clone());
                continue;
            }

            message.receive_count = 0;
            message.receipt_handle = None;

            state
                .dedup
                .insert(message.dedup_id.clone(), (message.message_id.clone(), now));
            state.dedup_order.push_back((now, message.dedup_id.clone()));
            report.message_ids.push(message.message_id.clone());

            let group_key = message.group_key.clone();
            if !state.groups.contains_key(&group_key) {
                state.order.push_back(group_key.clone());
            }
            state
                .groups
                .entry(group_key)
                .or_default()
                .push_back(StoredMessage {
                    message,
                    lease: None,
                });
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(report)
    }

    async fn receive_batch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<BookingMessage>, QueueError> {
        let max = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let poll_deadline = Instant::now() + wait;

        loop {
            // Register interest before looking so a concurrent enqueue is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_expiry) = self.take_available(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= poll_deadline {
                return Ok(batch);
            }

            let wake_at = next_expiry.map_or(poll_deadline, |e| e.min(poll_deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let (group_key, index) = state.find_leased(handle.as_str(), Instant::now())?;
        state.leases.remove(handle.as_str());
        if let Some(group) = state.groups.get_mut(&group_key) {
            group.remove(index);
        }
        state.remove_group_if_empty(&group_key);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let now = Instant::now();
        let (group_key, index) = state.find_leased(handle.as_str(), now)?;
        if let Some(lease) = state
            .groups
            .get_mut(&group_key)
            .and_then(|g| g.get_mut(index))
            .and_then(|m| m.lease.as_mut())
        {
            lease.deadline = now + Duration::from_secs(timeout_seconds);
        }
        Ok(())
    }

    async fn nack(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let (group_key, index) = state.find_leased(handle.as_str(), Instant::now())?;
        state.leases.remove(handle.as_str());
        if let Some(stored) = state.groups.get_mut(&group_key).and_then(|g| g.get_mut(index)) {
            stored.lease = None;
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Self::check_available(&self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(visibility_seconds: u64) -> LocalQueueClient {
        LocalQueueClient::new(&QueueConfig::local().with_visibility_timeout_seconds(visibility_seconds))
    }

    fn msg(dedup: &str, group: &str) -> BookingMessage {
        BookingMessage::new(dedup, group, json!({ "dedup": dedup }))
    }

    fn handle(m: &BookingMessage) -> &ReceiptHandle {
        m.receipt_handle.as_ref().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_within_group() {
        let queue = client(30);
        queue
            .enqueue(vec![msg("a1", "a"), msg("a2", "a"), msg("a3", "a")])
            .await
            .unwrap();

        let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        let order: Vec<_> = batch.iter().map(|m| m.dedup_id.as_str()).collect();
        assert_eq!(order, vec!["a1", "a2", "a3"]);
        assert!(batch.iter().all(|m| m.receive_count == 1));
    }

    #[tokio::test]
    async fn test_group_locked_while_in_flight() {
        let queue = client(30);
        queue.enqueue(vec![msg("a1", "a"), msg("a2", "a")]).await.unwrap();

        let first = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // a2 must wait until a1 is acked
        let second = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        assert!(second.is_empty());

        queue.ack(handle(&first[0])).await.unwrap();
        let second = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].dedup_id, "a2");
    }

    #[tokio::test]
    async fn test_other_groups_not_blocked() {
        let queue = client(30);
        queue.enqueue(vec![msg("a1", "a"), msg("b1", "b")]).await.unwrap();

        let first = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        let second = queue.receive_batch(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].group_key, second[0].group_key);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = client(30);
        queue.enqueue(vec![msg("a1", "a")]).await.unwrap();

        let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        queue.ack(handle(&batch[0])).await.unwrap();

        assert!(queue.is_empty());
        // Handles are single-use
        let err = queue.ack(handle(&batch[0])).await.unwrap_err();
        assert!(err.is_stale_receipt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_redelivers_and_invalidates_handle() {
        let queue = client(1);
        queue.enqueue(vec![msg("a1", "a")]).await.unwrap();

        let first = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_millis(1100)).await;

        let err = queue.ack(handle(&first[0])).await.unwrap_err();
        assert!(err.is_stale_receipt());

        let again = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert!(again[0].is_redelivery());
        assert_ne!(first[0].receipt_handle, again[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_visibility_keeps_message_hidden() {
        let queue = client(1);
        queue.enqueue(vec![msg("a1", "a")]).await.unwrap();

        let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        queue.extend_visibility(handle(&batch[0]), 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(queue.receive_batch(10, Duration::ZERO).await.unwrap().is_empty());
        queue.ack(handle(&batch[0])).await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_makes_message_visible_immediately() {
        let queue = client(30);
        queue.enqueue(vec![msg("a1", "a")]).await.unwrap();

        let batch = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        queue.nack(handle(&batch[0])).await.unwrap();

        let again = queue.receive_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(again[0].dedup_id, "a1");
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_dedup_suppresses_repeated_enqueue() {
        let queue = client(30);
        let original = msg("same", "a");
        let first = queue.enqueue(vec![original.clone()]).await.unwrap();
        let second = queue.enqueue(vec![msg("same", "a")]).await.unwrap();

        assert_eq!(first.message_ids, second.message_ids);
        assert!(second.is_complete());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window_expires() {
        let queue = LocalQueueClient::new(&QueueConfig {
            dedup_window_seconds: 5,
            ..QueueConfig::local()
        });
        queue.enqueue(vec![msg("same", "a")]).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        queue.enqueue(vec![msg("same", "a")]).await.unwrap();

        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(client(30));

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive_batch(10, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(vec![msg("late", "a")]).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].dedup_id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_returns_empty_after_wait() {
        let queue = client(30);
        let batch = queue.receive_batch(10, Duration::from_secs(2)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_receive_caps_batch_size() {
        let queue = client(30);
        let messages = (0..25).map(|i| msg(&format!("m{i}"), &format!("g{i}"))).collect();
        queue.enqueue(messages).await.unwrap();

        let batch = queue.receive_batch(50, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), MAX_RECEIVE_BATCH);
        assert_eq!(queue.in_flight(), MAX_RECEIVE_BATCH);
    }

    #[tokio::test]
    async fn test_unavailable_fails_calls() {
        let queue = client(30);
        queue.set_unavailable(true);

        assert!(matches!(
            queue.receive_batch(1, Duration::ZERO).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(queue.health_check().await.is_err());

        queue.set_unavailable(false);
        assert!(queue.health_check().await.is_ok());
    }
}
