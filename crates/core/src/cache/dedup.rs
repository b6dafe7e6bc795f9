use std::fmt;

use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::ttl::TtlCache;
use crate::clock::SharedClock;
use crate::domain::envelope::ValidatedEnvelope;
use crate::domain::message::normalize_message;

/// `<thread>:<sha256(contactId-normalizedMessage-phone)>`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn for_envelope(envelope: &ValidatedEnvelope) -> Self {
        Self::new(&envelope.thread_id.0, &envelope.contact_id.0, &envelope.message, &envelope.phone)
    }

    pub fn new(thread_id: &str, contact_id: &str, message: &str, phone: &str) -> Self {
        let material = format!("{contact_id}-{}-{phone}", normalize_message(message));
        let digest = Sha256::digest(material.as_bytes());
        Self(format!("{thread_id}:{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DedupEntry<R> {
    InFlight,
    Completed(R),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DedupDecision<R> {
    /// First delivery: process it, then call `complete` or `abandon`.
    Fresh(DedupKey),
    /// Already processed within the TTL; the stored result is returned as-is.
    Replay(R),
    /// The same delivery is being processed right now.
    InFlight,
}

/// Rejects replays of a (thread, contact, message, phone) delivery within the
/// TTL. Claiming a key is atomic, so two concurrent deliveries cannot both be
/// `Fresh`. Every claim first drops expired entries, so the map holds at most
/// one TTL's worth of deliveries.
pub struct DedupGuard<R> {
    entries: TtlCache<DedupKey, DedupEntry<R>>,
    enabled: bool,
}

impl<R: Clone> DedupGuard<R> {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self { entries: TtlCache::new(ttl, clock), enabled: true }
    }

    pub fn disabled(clock: SharedClock) -> Self {
        Self { entries: TtlCache::new(Duration::zero(), clock), enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn begin(&self, envelope: &ValidatedEnvelope) -> DedupDecision<R> {
        let key = DedupKey::for_envelope(envelope);
        if !self.enabled {
            return DedupDecision::Fresh(key);
        }

        let purged = self.purge_expired().await;
        if purged > 0 {
            debug!(
                event_name = "core.dedup.purged",
                correlation_id = %key,
                purged,
                "expired deliveries dropped"
            );
        }

        match self.entries.insert_if_absent(key.clone(), DedupEntry::InFlight).await {
            Ok(()) => DedupDecision::Fresh(key),
            Err(DedupEntry::Completed(result)) => {
                debug!(
                    event_name = "core.dedup.replay",
                    correlation_id = %key,
                    thread_id = %envelope.thread_id,
                    "duplicate delivery answered from dedup cache"
                );
                DedupDecision::Replay(result)
            }
            Err(DedupEntry::InFlight) => DedupDecision::InFlight,
        }
    }

    pub async fn complete(&self, key: &DedupKey, result: R) {
        if self.enabled {
            self.entries.replace(key, DedupEntry::Completed(result)).await;
        }
    }

    /// Releases a claim whose processing failed so a redelivery can retry.
    pub async fn abandon(&self, key: &DedupKey) {
        if self.enabled {
            self.entries.remove(key).await;
        }
    }

    pub async fn purge_expired(&self) -> usize {
        self.entries.purge_expired().await
    }

    pub async fn len(&self) -> usize {
        self.entries.len().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::{DedupDecision, DedupGuard, DedupKey};
    use crate::clock::ManualClock;
    use crate::domain::envelope::{InboundEnvelope, ValidatedEnvelope};

    fn envelope(message: &str) -> ValidatedEnvelope {
        InboundEnvelope {
            phone: Some("+15550001111".to_string()),
            message: Some(message.to_string()),
            contact_id: Some("C1".to_string()),
            conversation_id: None,
            channel: None,
        }
        .validate()
        .expect("valid envelope")
    }

    #[test]
    fn key_is_scoped_by_thread_and_ignores_message_case() {
        let a = DedupKey::new("thread_C1", "C1", "Hola ", "+1555");
        let b = DedupKey::new("thread_C1", "C1", "hola", "+1555");
        let other_thread = DedupKey::new("conv-2", "C1", "hola", "+1555");

        assert_eq!(a, b);
        assert_ne!(a, other_thread);
        assert!(a.as_str().starts_with("thread_C1:"));
    }

    #[tokio::test]
    async fn replay_within_ttl_returns_stored_result() {
        let clock = Arc::new(ManualClock::default());
        let guard = DedupGuard::new(Duration::minutes(10), clock.clone());

        let key = match guard.begin(&envelope("hola")).await {
            DedupDecision::Fresh(key) => key,
            other => panic!("expected fresh delivery, got {other:?}"),
        };
        assert_eq!(guard.begin(&envelope("hola")).await, DedupDecision::InFlight);

        guard.complete(&key, "¡Hola! ¿Cómo te llamas?".to_string()).await;
        clock.advance(Duration::seconds(5));
        assert_eq!(
            guard.begin(&envelope("HOLA")).await,
            DedupDecision::Replay("¡Hola! ¿Cómo te llamas?".to_string())
        );
    }

    #[tokio::test]
    async fn expired_and_abandoned_entries_allow_reprocessing() {
        let clock = Arc::new(ManualClock::default());
        let guard: DedupGuard<String> = DedupGuard::new(Duration::minutes(10), clock.clone());

        let DedupDecision::Fresh(key) = guard.begin(&envelope("500")).await else {
            panic!("expected fresh delivery");
        };
        guard.complete(&key, "ok".to_string()).await;
        clock.advance(Duration::minutes(10));
        assert!(matches!(guard.begin(&envelope("500")).await, DedupDecision::Fresh(_)));

        let DedupDecision::Fresh(key) = guard.begin(&envelope("600")).await else {
            panic!("expected fresh delivery");
        };
        guard.abandon(&key).await;
        assert!(matches!(guard.begin(&envelope("600")).await, DedupDecision::Fresh(_)));
    }

    #[tokio::test]
    async fn expired_deliveries_do_not_accumulate() {
        let clock = Arc::new(ManualClock::default());
        let guard: DedupGuard<String> = DedupGuard::new(Duration::minutes(10), clock.clone());

        for n in 0..100 {
            let inbound = envelope(&format!("mensaje {n}"));
            let DedupDecision::Fresh(key) = guard.begin(&inbound).await else {
                panic!("expected fresh delivery");
            };
            guard.complete(&key, "ok".to_string()).await;
            clock.advance(Duration::minutes(11));
        }

        assert_eq!(guard.len().await, 1);
        guard.begin(&envelope("uno más")).await;
        assert_eq!(guard.len().await, 1);
    }

    #[tokio::test]
    async fn disabled_guard_never_reports_replays() {
        let guard: DedupGuard<String> = DedupGuard::disabled(Arc::new(ManualClock::default()));
        let DedupDecision::Fresh(key) = guard.begin(&envelope("hola")).await else {
            panic!("expected fresh delivery");
        };
        guard.complete(&key, "reply".to_string()).await;

        assert!(matches!(guard.begin(&envelope("hola")).await, DedupDecision::Fresh(_)));
        assert_eq!(guard.len().await, 0);
    }
}
