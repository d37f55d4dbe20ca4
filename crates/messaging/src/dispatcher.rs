//! Inbox dispatcher.
//!
//! Consumes broker deliveries and turns at-least-once delivery into
//! exactly-once-effective processing: the dedup ledger is checked before the
//! handler runs, and the handler's effects commit atomically with the ledger
//! entry. Per-saga order is preserved by hashing the correlation id onto a
//! fixed worker, so two events for the same saga are never processed
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use common::{BackoffPolicy, partition_for};
use envelope::Envelope;
use store::{InboxRecord, SagaStore, SagaUpdate, StoreError};

use crate::broker::Delivery;
use crate::dead_letter::{DeadLetterQueue, DeadLetterReason, DeadLetterRecord};
use crate::handler::{EventHandler, HandlerError};
use crate::Result;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name written to the dedup ledger; one per consuming service.
    pub consumer: String,
    /// Total handler attempts per delivery, including the first.
    pub max_attempts: u32,
    /// Ordered worker lanes. Events for one saga always land on one lane.
    pub workers: usize,
    pub retry_backoff: BackoffPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            consumer: "billing-saga".to_string(),
            max_attempts: 5,
            workers: 4,
            retry_backoff: BackoffPolicy::new(
                Duration::from_millis(100),
                Duration::from_secs(5),
                0.2,
            ),
        }
    }
}

impl DispatcherConfig {
    /// Builds a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            consumer: std::env::var("DISPATCHER_CONSUMER").unwrap_or(defaults.consumer),
            max_attempts: std::env::var("DISPATCHER_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            workers: std::env::var("DISPATCHER_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.workers),
            retry_backoff: defaults.retry_backoff,
        }
    }
}

/// What happened to one delivery. Every variant acks the message; redelivery
/// is only caused by returning an error to the broker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler effects committed together with the ledger entry.
    Processed,
    /// The ledger already held this event id; nothing ran.
    Duplicate,
    /// Escalated to the dead-letter queue.
    DeadLettered,
    /// No handler consumes this routing key; acked with a warning.
    Unhandled,
}

/// Routes decoded envelopes to handlers and commits their effects.
pub struct InboxDispatcher<S> {
    store: Arc<S>,
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
    dead_letters: DeadLetterQueue,
    config: DispatcherConfig,
}

impl<S: SagaStore + 'static> InboxDispatcher<S> {
    /// Creates a dispatcher over the given store.
    pub fn new(store: Arc<S>, dead_letters: DeadLetterQueue, config: DispatcherConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            dead_letters,
            config,
        }
    }

    /// Registers a handler for every routing key it declares.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        for key in handler.routing_keys() {
            self.handlers.insert(key, Arc::clone(&handler));
        }
    }

    /// The routing keys this dispatcher's queue should bind.
    pub fn routing_keys(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Processes one raw delivery end to end.
    #[tracing::instrument(skip_all, fields(routing_key = %delivery.routing_key))]
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<DispatchOutcome> {
        let envelope = match envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.dead_letters.push(DeadLetterRecord {
                    event_id: None,
                    correlation_id: None,
                    routing_key: delivery.routing_key.clone(),
                    body: delivery.body.clone(),
                    reason: DeadLetterReason::DecodeFailure(err.to_string()),
                    attempts: 0,
                    dead_lettered_at: Utc::now(),
                });
                return Ok(DispatchOutcome::DeadLettered);
            }
        };
        self.dispatch_envelope(&envelope, delivery).await
    }

    /// Processes an already-decoded envelope.
    #[tracing::instrument(
        skip_all,
        fields(
            correlation_id = %envelope.correlation_id,
            event_id = %envelope.event_id,
            event_type = envelope.event_type().as_str(),
        )
    )]
    pub async fn dispatch_envelope(
        &self,
        envelope: &Envelope,
        delivery: &Delivery,
    ) -> Result<DispatchOutcome> {
        // The correlation id is the invoice id; a payload claiming to belong
        // to a different invoice is malformed, not a settlement to apply.
        if envelope.payload.invoice_id() != envelope.correlation_id {
            return Ok(self.dead_letter(
                envelope,
                delivery,
                DeadLetterReason::DecodeFailure(format!(
                    "payload invoice id {} does not match correlation id {}",
                    envelope.payload.invoice_id(),
                    envelope.correlation_id
                )),
                0,
            ));
        }

        if self
            .store
            .is_processed(envelope.event_id, &self.config.consumer)
            .await?
        {
            tracing::debug!("duplicate delivery, already processed");
            metrics::counter!("inbox_duplicates_total").increment(1);
            return Ok(DispatchOutcome::Duplicate);
        }

        let Some(handler) = self.handlers.get(envelope.routing_key()) else {
            tracing::warn!("no handler for routing key, acking");
            metrics::counter!("inbox_unhandled_total").increment(1);
            return Ok(DispatchOutcome::Unhandled);
        };

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            match handler.handle(envelope).await {
                Ok(effects) => {
                    let update = SagaUpdate {
                        saga: effects.saga,
                        outbox: effects.outbox,
                        inbox: Some(InboxRecord::new(
                            envelope.event_id,
                            self.config.consumer.clone(),
                        )),
                    };
                    match self.store.commit(update).await {
                        Ok(_) => {
                            metrics::counter!("inbox_processed_total").increment(1);
                            return Ok(DispatchOutcome::Processed);
                        }
                        // Lost the race against a concurrent writer: reload
                        // through the handler and try again.
                        Err(StoreError::ConcurrencyConflict { .. }) => {
                            tracing::debug!(attempt, "commit conflict, re-running handler");
                            last_error = "optimistic concurrency conflict".to_string();
                        }
                        // Another delivery of this event won the race.
                        Err(StoreError::DuplicateEvent { .. }) => {
                            return Ok(DispatchOutcome::Duplicate);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(HandlerError::Transient(message)) => {
                    tracing::warn!(attempt, %message, "transient handler failure");
                    last_error = message;
                }
                Err(HandlerError::Permanent(message)) => {
                    return Ok(self.dead_letter(
                        envelope,
                        delivery,
                        DeadLetterReason::HandlerPermanent(message),
                        attempt,
                    ));
                }
                Err(HandlerError::ConflictingTransition(message)) => {
                    return Ok(self.dead_letter(
                        envelope,
                        delivery,
                        DeadLetterReason::ConflictingTransition(message),
                        attempt,
                    ));
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_backoff.delay(attempt)).await;
            }
        }

        Ok(self.dead_letter(
            envelope,
            delivery,
            DeadLetterReason::RetriesExhausted(last_error),
            self.config.max_attempts,
        ))
    }

    fn dead_letter(
        &self,
        envelope: &Envelope,
        delivery: &Delivery,
        reason: DeadLetterReason,
        attempts: u32,
    ) -> DispatchOutcome {
        self.dead_letters.push(DeadLetterRecord {
            event_id: Some(envelope.event_id),
            correlation_id: Some(envelope.correlation_id),
            routing_key: delivery.routing_key.clone(),
            body: delivery.body.clone(),
            reason,
            attempts,
            dead_lettered_at: Utc::now(),
        });
        DispatchOutcome::DeadLettered
    }

    /// Consumes a delivery stream until it closes.
    ///
    /// Deliveries are decoded up front and fanned out to worker lanes by
    /// correlation id, so per-saga order survives concurrency. A dispatch
    /// error on one delivery is logged and the delivery is left unacked to
    /// the caller's broker; processing continues.
    pub async fn run(self: Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        let workers = self.config.workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);

        for lane in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<(Envelope, Delivery)>();
            lanes.push(tx);
            let dispatcher = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                while let Some((envelope, delivery)) = rx.recv().await {
                    if let Err(err) = dispatcher.dispatch_envelope(&envelope, &delivery).await {
                        tracing::error!(lane, error = %err, "dispatch failed");
                    }
                }
            }));
        }

        while let Some(delivery) = deliveries.recv().await {
            let envelope = match envelope::decode(&delivery.body) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.dead_letters.push(DeadLetterRecord {
                        event_id: None,
                        correlation_id: None,
                        routing_key: delivery.routing_key.clone(),
                        body: delivery.body.clone(),
                        reason: DeadLetterReason::DecodeFailure(err.to_string()),
                        attempts: 0,
                        dead_lettered_at: Utc::now(),
                    });
                    continue;
                }
            };
            let lane = partition_for(envelope.correlation_id, workers);
            if lanes[lane].send((envelope, delivery)).is_err() {
                break;
            }
        }

        drop(lanes);
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use common::{CorrelationId, Money, Version};
    use envelope::EventPayload;
    use store::{InMemoryStore, StoredSaga};

    use super::*;
    use crate::handler::HandlerEffects;

    struct ScriptedHandler {
        calls: AtomicU32,
        transient_failures: u32,
        response: fn(&Envelope, u32) -> std::result::Result<HandlerEffects, HandlerError>,
    }

    impl ScriptedHandler {
        fn ok_after(transient_failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                transient_failures,
                response: |envelope, _| {
                    Ok(HandlerEffects::saga(
                        StoredSaga::new(
                            envelope.correlation_id,
                            serde_json::json!({"status": "paid"}),
                            Version::initial().next(),
                        ),
                        Version::initial(),
                    ))
                },
            }
        }

        fn failing(
            response: fn(&Envelope, u32) -> std::result::Result<HandlerEffects, HandlerError>,
        ) -> Self {
            Self {
                calls: AtomicU32::new(0),
                transient_failures: 0,
                response,
            }
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        fn routing_keys(&self) -> Vec<&'static str> {
            vec!["payment_received"]
        }

        async fn handle(&self, envelope: &Envelope) -> std::result::Result<HandlerEffects, HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.transient_failures {
                return Err(HandlerError::Transient("not yet".to_string()));
            }
            (self.response)(envelope, call)
        }
    }

    fn payment_delivery(correlation_id: CorrelationId) -> Delivery {
        let envelope = Envelope::new(
            "payment-service",
            correlation_id,
            EventPayload::PaymentReceived {
                invoice_id: correlation_id,
                payment_id: "PAY-1".to_string(),
                amount: Money::from_cents(9_800),
                received_at: Utc::now(),
            },
        );
        Delivery::new(envelope.routing_key(), envelope::encode(&envelope).unwrap())
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            retry_backoff: BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(1),
                0.0,
            ),
            ..DispatcherConfig::default()
        }
    }

    fn dispatcher_with(
        store: Arc<InMemoryStore>,
        handler: Arc<ScriptedHandler>,
    ) -> (InboxDispatcher<InMemoryStore>, DeadLetterQueue) {
        let dead_letters = DeadLetterQueue::new();
        let mut dispatcher = InboxDispatcher::new(store, dead_letters.clone(), test_config());
        dispatcher.register(handler);
        (dispatcher, dead_letters)
    }

    #[tokio::test]
    async fn processes_and_dedups() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::ok_after(0));
        let (dispatcher, _) = dispatcher_with(Arc::clone(&store), Arc::clone(&handler));

        let delivery = payment_delivery(CorrelationId::new());
        assert_eq!(
            dispatcher.dispatch(&delivery).await.unwrap(),
            DispatchOutcome::Processed
        );
        // Redelivery of the same event id is a no-op.
        assert_eq!(
            dispatcher.dispatch(&delivery).await.unwrap(),
            DispatchOutcome::Duplicate
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::ok_after(3));
        let (dispatcher, dead_letters) = dispatcher_with(store, Arc::clone(&handler));

        let outcome = dispatcher
            .dispatch(&payment_delivery(CorrelationId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::failing(|_, _| {
            Err(HandlerError::Transient("still down".to_string()))
        }));
        let (dispatcher, dead_letters) = dispatcher_with(store, Arc::clone(&handler));

        let outcome = dispatcher
            .dispatch(&payment_delivery(CorrelationId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        let records = dead_letters.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0].reason,
            DeadLetterReason::RetriesExhausted(_)
        ));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retry() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::failing(|_, _| {
            Err(HandlerError::Permanent("bad amount".to_string()))
        }));
        let (dispatcher, dead_letters) = dispatcher_with(store, Arc::clone(&handler));

        let outcome = dispatcher
            .dispatch(&payment_delivery(CorrelationId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dead_letters.records()[0].reason,
            DeadLetterReason::HandlerPermanent(_)
        ));
    }

    #[tokio::test]
    async fn conflicting_transition_goes_to_operator_queue() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::failing(|_, _| {
            Err(HandlerError::ConflictingTransition(
                "already settled as paid".to_string(),
            ))
        }));
        let (dispatcher, dead_letters) = dispatcher_with(store, Arc::clone(&handler));

        let outcome = dispatcher
            .dispatch(&payment_delivery(CorrelationId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert!(matches!(
            dead_letters.records()[0].reason,
            DeadLetterReason::ConflictingTransition(_)
        ));
    }

    #[tokio::test]
    async fn mismatched_payload_invoice_id_is_dead_lettered() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::ok_after(0));
        let (dispatcher, dead_letters) = dispatcher_with(store, Arc::clone(&handler));

        // Correlation id says one invoice, payload claims another.
        let correlation_id = CorrelationId::new();
        let envelope = Envelope::new(
            "payment-service",
            correlation_id,
            EventPayload::PaymentReceived {
                invoice_id: CorrelationId::new(),
                payment_id: "PAY-1".to_string(),
                amount: Money::from_cents(1),
                received_at: Utc::now(),
            },
        );
        let delivery = Delivery::new(envelope.routing_key(), envelope::encode(&envelope).unwrap());

        let outcome = dispatcher.dispatch(&delivery).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        // The handler never saw it.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let records = dead_letters.records();
        assert_eq!(records[0].correlation_id, Some(correlation_id));
        assert!(matches!(
            records[0].reason,
            DeadLetterReason::DecodeFailure(_)
        ));
    }

    #[tokio::test]
    async fn commit_conflict_reruns_handler_against_fresh_snapshot() {
        // Simulates a writer landing between the handler's read and the
        // dispatcher's commit; the second invocation sees the new version.
        struct ContendedHandler {
            store: Arc<InMemoryStore>,
            calls: AtomicU32,
        }

        #[async_trait]
        impl EventHandler for ContendedHandler {
            fn routing_keys(&self) -> Vec<&'static str> {
                vec!["payment_received"]
            }

            async fn handle(
                &self,
                envelope: &Envelope,
            ) -> std::result::Result<HandlerEffects, HandlerError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let expected = self
                    .store
                    .load_saga(envelope.correlation_id)
                    .await
                    .map_err(|err| HandlerError::Transient(err.to_string()))?
                    .map(|s| s.version)
                    .unwrap_or(Version::initial());

                if call == 1 {
                    self.store
                        .commit(SagaUpdate::saga(
                            StoredSaga::new(
                                envelope.correlation_id,
                                serde_json::json!({"status": "payment_pending"}),
                                expected.next(),
                            ),
                            expected,
                        ))
                        .await
                        .map_err(|err| HandlerError::Transient(err.to_string()))?;
                }

                Ok(HandlerEffects::saga(
                    StoredSaga::new(
                        envelope.correlation_id,
                        serde_json::json!({"status": "paid"}),
                        expected.next(),
                    ),
                    expected,
                ))
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ContendedHandler {
            store: Arc::clone(&store),
            calls: AtomicU32::new(0),
        });
        let dead_letters = DeadLetterQueue::new();
        let mut dispatcher =
            InboxDispatcher::new(Arc::clone(&store), dead_letters.clone(), test_config());
        dispatcher.register(Arc::clone(&handler) as Arc<dyn EventHandler>);

        let correlation_id = CorrelationId::new();
        let outcome = dispatcher
            .dispatch(&payment_delivery(correlation_id))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(dead_letters.is_empty());

        let stored = store.load_saga(correlation_id).await.unwrap().unwrap();
        assert_eq!(stored.version, Version::new(2));
        assert_eq!(stored.state["status"], "paid");
    }

    #[tokio::test]
    async fn undecodable_delivery_is_dead_lettered() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(ScriptedHandler::ok_after(0));
        let (dispatcher, dead_letters) = dispatcher_with(store, handler);

        let outcome = dispatcher
            .dispatch(&Delivery::new("payment_received", b"not json".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert!(matches!(
            dead_letters.records()[0].reason,
            DeadLetterReason::DecodeFailure(_)
        ));
    }

    #[tokio::test]
    async fn unhandled_routing_key_is_acked() {
        let store = Arc::new(InMemoryStore::new());
        let dead_letters = DeadLetterQueue::new();
        let dispatcher: InboxDispatcher<InMemoryStore> =
            InboxDispatcher::new(store, dead_letters.clone(), test_config());

        let outcome = dispatcher
            .dispatch(&payment_delivery(CorrelationId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn run_preserves_per_saga_order() {
        struct RecordingHandler {
            seen: std::sync::Mutex<Vec<(CorrelationId, Money)>>,
        }

        #[async_trait]
        impl EventHandler for RecordingHandler {
            fn routing_keys(&self) -> Vec<&'static str> {
                vec!["payment_received"]
            }

            async fn handle(
                &self,
                envelope: &Envelope,
            ) -> std::result::Result<HandlerEffects, HandlerError> {
                if let EventPayload::PaymentReceived { amount, .. } = &envelope.payload {
                    self.seen
                        .lock()
                        .unwrap()
                        .push((envelope.correlation_id, *amount));
                }
                Ok(HandlerEffects::none())
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(RecordingHandler {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let dead_letters = DeadLetterQueue::new();
        let mut dispatcher = InboxDispatcher::new(store, dead_letters, test_config());
        dispatcher.register(Arc::clone(&handler) as Arc<dyn EventHandler>);
        let dispatcher = Arc::new(dispatcher);

        let (tx, rx) = mpsc::unbounded_channel();
        let sagas: Vec<CorrelationId> = (0..4).map(|_| CorrelationId::new()).collect();
        for step in 0..10i64 {
            for saga in &sagas {
                let envelope = Envelope::new(
                    "payment-service",
                    *saga,
                    EventPayload::PaymentReceived {
                        invoice_id: *saga,
                        payment_id: format!("PAY-{step}"),
                        amount: Money::from_cents(step),
                        received_at: Utc::now(),
                    },
                );
                tx.send(Delivery::new(
                    envelope.routing_key(),
                    envelope::encode(&envelope).unwrap(),
                ))
                .unwrap();
            }
        }
        drop(tx);

        dispatcher.run(rx).await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 40);
        for saga in &sagas {
            let amounts: Vec<i64> = seen
                .iter()
                .filter(|(id, _)| id == saga)
                .map(|(_, amount)| amount.as_cents())
                .collect();
            assert_eq!(amounts, (0..10).collect::<Vec<i64>>());
        }
    }
}
