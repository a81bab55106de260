//! Per-boundary ingestion buffers for events and meter readings
//! (component G): bounded queues with a sticky "disabled" saturation
//! state, duplicate suppression, and deterministic replay ordering.
//!
//! `BufferEntry.record.received_at` is the field the rest of this crate
//! treats as each record's storage-side "recorded at" timestamp —
//! `rgs_core::ingestion::IngestionRecord` has no separate field of that
//! name, and `received_at` is the moment ingestion actually took the
//! record in, so replay ordering is defined over it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rgs_audit::AuditChain;
use rgs_core::audit::{AuditDraft, AuditResult as AuditOutcome};
use rgs_core::ingestion::{BoundaryState, BufferEntry, BufferEntryStatus, IngestionKind, IngestionRecord, MeterKind};
use rgs_core::{Actor, Clock, RgsError, RgsResult};
use rgs_storage::{composite_key, decode, encode, Backend, KvTree};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone, Debug)]
pub struct IngestionConfig {
    pub buffer_capacity: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { buffer_capacity: 10_000 }
    }
}

pub struct IngestionService {
    buffer: Arc<dyn KvTree>,
    boundary_state: Arc<dyn KvTree>,
    dedup_index: Arc<dyn KvTree>,
    boundary_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    audit: Arc<AuditChain>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
}

impl IngestionService {
    pub fn new(backend: &Backend, audit: Arc<AuditChain>, clock: Arc<dyn Clock>, config: IngestionConfig) -> RgsResult<Self> {
        Ok(Self {
            buffer: backend.open_tree("ingestion_buffer")?,
            boundary_state: backend.open_tree("ingestion_boundary_state")?,
            dedup_index: backend.open_tree("ingestion_dedup_index")?,
            boundary_locks: DashMap::new(),
            audit,
            clock,
            config,
        })
    }

    fn lock_for(&self, boundary_id: &str) -> Arc<AsyncMutex<()>> {
        self.boundary_locks
            .entry(boundary_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn get_boundary_state(&self, boundary_id: &str) -> RgsResult<BoundaryState> {
        match self.boundary_state.get(boundary_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(BoundaryState::default()),
        }
    }

    fn put_boundary_state(&self, boundary_id: &str, state: &BoundaryState) -> RgsResult<()> {
        self.boundary_state
            .insert(boundary_id.as_bytes(), encode(state)?)
            .map_err(RgsError::from)
    }

    fn get_entry(&self, entry_id: &str) -> RgsResult<BufferEntry> {
        match self.buffer.get(entry_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(RgsError::Invalid("buffer entry not found".to_string())),
        }
    }

    fn put_entry(&self, entry: &BufferEntry) -> RgsResult<()> {
        self.buffer.insert(entry.entry_id.as_bytes(), encode(entry)?).map_err(RgsError::from)
    }

    async fn audit(
        &self,
        actor: &Actor,
        object_id: &str,
        action: &str,
        result: AuditOutcome,
        reason: Option<String>,
    ) -> RgsResult<()> {
        let now = self.clock.now();
        self.audit
            .append(
                now.date_naive(),
                AuditDraft {
                    occurred_at: now,
                    actor: actor.clone(),
                    object_type: "ingestion_buffer_entry".to_string(),
                    object_id: object_id.to_string(),
                    action: action.to_string(),
                    before_state: None,
                    after_state: None,
                    result,
                    reason,
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| RgsError::AuditUnavailable(e.to_string()))
    }

    fn dedup_key(equipment_id: &str, source_record_id: &str) -> Vec<u8> {
        composite_key(&[equipment_id.as_bytes(), source_record_id.as_bytes()])
    }

    /// Submit a record into a boundary's buffer (§4.G). A duplicate
    /// `(equipment_id, source_record_id)` — when `source_record_id` is
    /// non-empty — is silently ignored and returns the original entry.
    /// A disabled (saturated) boundary denies with "buffer exhausted".
    pub async fn submit(&self, actor: &Actor, boundary_id: &str, record: IngestionRecord) -> RgsResult<BufferEntry> {
        let lock = self.lock_for(boundary_id);
        let _permit = lock.lock().await;

        if !record.source_record_id.is_empty() {
            let key = Self::dedup_key(&record.equipment_id, &record.source_record_id);
            if let Some(bytes) = self.dedup_index.get(&key)? {
                let entry_id = String::from_utf8_lossy(&bytes).to_string();
                return self.get_entry(&entry_id);
            }
        }

        let mut state = self.get_boundary_state(boundary_id)?;
        if state.disabled || state.queued_count >= self.config.buffer_capacity {
            state.disabled = true;
            self.put_boundary_state(boundary_id, &state)?;
            self.audit(actor, boundary_id, "submit", AuditOutcome::Denied, Some("buffer exhausted".to_string())).await?;
            return Err(RgsError::Denied("buffer exhausted".to_string()));
        }

        let entry = BufferEntry {
            entry_id: rgs_core::new_id(),
            boundary_id: boundary_id.to_string(),
            record: record.clone(),
            status: BufferEntryStatus::Queued,
            attempts: 0,
            next_attempt_at: None,
        };

        state.queued_count += 1;
        if state.queued_count >= self.config.buffer_capacity {
            state.disabled = true;
        }

        self.put_entry(&entry)?;
        self.put_boundary_state(boundary_id, &state)?;
        if !record.source_record_id.is_empty() {
            let key = Self::dedup_key(&record.equipment_id, &record.source_record_id);
            self.dedup_index.insert(&key, entry.entry_id.as_bytes().to_vec())?;
        }
        self.audit(actor, &entry.entry_id, "submit", AuditOutcome::Ok, None).await?;
        Ok(entry)
    }

    /// `queued → processing` (§4.G): the draining worker claims an entry.
    pub async fn advance_to_processing(&self, actor: &Actor, entry_id: &str) -> RgsResult<BufferEntry> {
        let mut entry = self.get_entry(entry_id)?;
        if entry.status != BufferEntryStatus::Queued {
            return Err(RgsError::Invalid("entry is not queued".to_string()));
        }
        entry.status = BufferEntryStatus::Processing;
        entry.attempts += 1;
        self.put_entry(&entry)?;
        self.audit(actor, entry_id, "advance_to_processing", AuditOutcome::Ok, None).await?;
        Ok(entry)
    }

    /// `processing → acknowledged` (§4.G, §5 compare-and-decrement).
    /// The boundary's `disabled` flag is sticky: it is never cleared by
    /// draining the backlog, only by [`IngestionService::reenable_boundary`].
    pub async fn acknowledge(&self, actor: &Actor, entry_id: &str) -> RgsResult<BufferEntry> {
        let mut entry = self.get_entry(entry_id)?;
        if entry.status != BufferEntryStatus::Processing {
            return Err(RgsError::Invalid("entry is not processing".to_string()));
        }
        entry.status = BufferEntryStatus::Acknowledged;
        self.put_entry(&entry)?;
        self.decrement_queued_count(&entry.boundary_id)?;
        self.audit(actor, entry_id, "acknowledge", AuditOutcome::Ok, None).await?;
        Ok(entry)
    }

    /// `processing → dead_letter` (§4.G, §7 bounded retry exhaustion).
    pub async fn dead_letter(&self, actor: &Actor, entry_id: &str, reason: &str) -> RgsResult<BufferEntry> {
        let mut entry = self.get_entry(entry_id)?;
        if entry.status != BufferEntryStatus::Processing {
            return Err(RgsError::Invalid("entry is not processing".to_string()));
        }
        entry.status = BufferEntryStatus::DeadLetter;
        self.put_entry(&entry)?;
        self.decrement_queued_count(&entry.boundary_id)?;
        self.audit(actor, entry_id, "dead_letter", AuditOutcome::Invalid, Some(reason.to_string())).await?;
        Ok(entry)
    }

    fn decrement_queued_count(&self, boundary_id: &str) -> RgsResult<()> {
        let mut state = self.get_boundary_state(boundary_id)?;
        state.queued_count = state.queued_count.saturating_sub(1);
        self.put_boundary_state(boundary_id, &state)
    }

    /// Operator op (supplemented): clears the sticky `disabled` flag.
    /// Does not touch `queued_count` — if the backlog was never actually
    /// drained, the very next `submit` will re-disable the boundary.
    pub async fn reenable_boundary(&self, actor: &Actor, boundary_id: &str) -> RgsResult<BoundaryState> {
        let mut state = self.get_boundary_state(boundary_id)?;
        state.disabled = false;
        self.put_boundary_state(boundary_id, &state)?;
        self.audit(actor, boundary_id, "reenable_boundary", AuditOutcome::Ok, None).await?;
        Ok(state)
    }

    pub fn get_boundary(&self, boundary_id: &str) -> RgsResult<BoundaryState> {
        self.get_boundary_state(boundary_id)
    }

    /// `ListRecords` (§4.G): deterministic replay order, independent of
    /// ingestion order, ordered by `received_at` ascending.
    pub fn list_records(&self, boundary_id: &str) -> RgsResult<Vec<BufferEntry>> {
        let mut out = Vec::new();
        for (_, bytes) in self.buffer.scan()? {
            let entry: BufferEntry = decode(&bytes)?;
            if entry.boundary_id == boundary_id {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.record.received_at);
        Ok(out)
    }

    /// Operator op (supplemented): inspect a boundary's dead letters so
    /// they can be triaged and resubmitted out of band.
    pub fn drain_dead_letter(&self, boundary_id: &str) -> RgsResult<Vec<BufferEntry>> {
        let mut out = self.list_records(boundary_id)?;
        out.retain(|e| e.status == BufferEntryStatus::DeadLetter);
        Ok(out)
    }

    /// Running meter value at `at` (§4.G): the last snapshot value at or
    /// before `at`, plus the sum of deltas strictly after that snapshot
    /// and at or before `at`. Entries in `dead_letter` never contributed
    /// a real reading and are excluded.
    pub fn running_meter_value(&self, equipment_id: &str, meter_label: &str, at: DateTime<Utc>) -> RgsResult<i64> {
        let mut snapshot: Option<(DateTime<Utc>, i64)> = None;
        let mut deltas: Vec<(DateTime<Utc>, i64)> = Vec::new();

        for (_, bytes) in self.buffer.scan()? {
            let entry: BufferEntry = decode(&bytes)?;
            if entry.status == BufferEntryStatus::DeadLetter {
                continue;
            }
            let record = &entry.record;
            if record.kind != IngestionKind::Meter || record.equipment_id != equipment_id {
                continue;
            }
            if record.meter_label.as_deref() != Some(meter_label) {
                continue;
            }
            if record.occurred_at > at {
                continue;
            }
            match record.meter_kind {
                Some(MeterKind::Snapshot) => {
                    let value = record.value_minor.unwrap_or(0);
                    if snapshot.map_or(true, |(t, _)| record.occurred_at > t) {
                        snapshot = Some((record.occurred_at, value));
                    }
                }
                Some(MeterKind::Delta) => {
                    deltas.push((record.occurred_at, record.delta_minor.unwrap_or(0)));
                }
                None => {}
            }
        }

        let (base_time, base_value) = snapshot.unwrap_or((DateTime::<Utc>::MIN_UTC, 0));
        let delta_sum: i64 = deltas
            .iter()
            .filter(|(t, _)| *t > base_time)
            .map(|(_, d)| d)
            .sum();
        Ok(base_value + delta_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_core::{ActorType, FakeClock};
    use serde_json::json;

    fn new_service() -> (IngestionService, Arc<FakeClock>) {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let audit = Arc::new(AuditChain::new(&backend, clock.clone()).unwrap());
        let service = IngestionService::new(&backend, audit, clock.clone(), IngestionConfig { buffer_capacity: 3 }).unwrap();
        (service, clock)
    }

    fn actor() -> Actor {
        Actor::new("boundary-feed", ActorType::Service)
    }

    fn event_record(source_record_id: &str, occurred_at: DateTime<Utc>) -> IngestionRecord {
        IngestionRecord {
            kind: IngestionKind::Event,
            source_record_id: source_record_id.to_string(),
            equipment_id: "eq-1".to_string(),
            payload: json!({"door": "open"}),
            occurred_at,
            received_at: occurred_at,
            meter_kind: None,
            value_minor: None,
            delta_minor: None,
            meter_label: None,
            monetary_unit: None,
        }
    }

    #[tokio::test]
    async fn submit_then_drain_acknowledges() {
        let (service, clock) = new_service();
        let entry = service.submit(&actor(), "boundary-1", event_record("rec-1", clock.now())).await.unwrap();
        assert_eq!(entry.status, BufferEntryStatus::Queued);

        let processing = service.advance_to_processing(&actor(), &entry.entry_id).await.unwrap();
        assert_eq!(processing.status, BufferEntryStatus::Processing);

        let done = service.acknowledge(&actor(), &entry.entry_id).await.unwrap();
        assert_eq!(done.status, BufferEntryStatus::Acknowledged);

        let state = service.get_boundary("boundary-1").unwrap();
        assert_eq!(state.queued_count, 0);
        assert!(!state.disabled);
    }

    #[tokio::test]
    async fn duplicate_source_record_id_is_silently_ignored() {
        let (service, clock) = new_service();
        let first = service.submit(&actor(), "boundary-1", event_record("rec-1", clock.now())).await.unwrap();
        let second = service.submit(&actor(), "boundary-1", event_record("rec-1", clock.now())).await.unwrap();
        assert_eq!(first.entry_id, second.entry_id);

        let state = service.get_boundary("boundary-1").unwrap();
        assert_eq!(state.queued_count, 1);
    }

    #[tokio::test]
    async fn boundary_disables_at_capacity_and_stays_disabled_until_reenabled() {
        let (service, clock) = new_service();
        for i in 0..3 {
            service.submit(&actor(), "boundary-1", event_record(&format!("rec-{i}"), clock.now())).await.unwrap();
        }
        let state = service.get_boundary("boundary-1").unwrap();
        assert!(state.disabled);

        let err = service.submit(&actor(), "boundary-1", event_record("rec-overflow", clock.now())).await.unwrap_err();
        assert_eq!(err.wire_reason(), "buffer exhausted");

        service.reenable_boundary(&actor(), "boundary-1").await.unwrap();
        let err = service.submit(&actor(), "boundary-1", event_record("rec-still-full", clock.now())).await.unwrap_err();
        assert_eq!(err.wire_reason(), "buffer exhausted");
    }

    #[tokio::test]
    async fn list_records_orders_by_received_at_independent_of_submit_order() {
        let (service, clock) = new_service();
        let earlier = clock.now() - chrono::Duration::minutes(5);
        let later = clock.now();
        service.submit(&actor(), "boundary-1", event_record("rec-later", later)).await.unwrap();
        service.submit(&actor(), "boundary-1", event_record("rec-earlier", earlier)).await.unwrap();

        let records = service.list_records("boundary-1").unwrap();
        assert_eq!(records[0].record.source_record_id, "rec-earlier");
        assert_eq!(records[1].record.source_record_id, "rec-later");
    }

    #[tokio::test]
    async fn meter_running_value_combines_snapshot_and_subsequent_deltas() {
        let (service, clock) = new_service();
        let t0 = clock.now();
        let snapshot = IngestionRecord {
            kind: IngestionKind::Meter,
            source_record_id: String::new(),
            equipment_id: "eq-meter".to_string(),
            payload: json!({}),
            occurred_at: t0,
            received_at: t0,
            meter_kind: Some(MeterKind::Snapshot),
            value_minor: Some(10_000),
            delta_minor: None,
            meter_label: Some("coin-in".to_string()),
            monetary_unit: Some("USD".to_string()),
        };
        let delta1 = IngestionRecord {
            occurred_at: t0 + chrono::Duration::minutes(1),
            received_at: t0 + chrono::Duration::minutes(1),
            meter_kind: Some(MeterKind::Delta),
            delta_minor: Some(500),
            value_minor: None,
            ..snapshot.clone()
        };
        let delta2 = IngestionRecord {
            occurred_at: t0 + chrono::Duration::minutes(2),
            received_at: t0 + chrono::Duration::minutes(2),
            meter_kind: Some(MeterKind::Delta),
            delta_minor: Some(250),
            value_minor: None,
            ..snapshot.clone()
        };

        service.submit(&actor(), "boundary-1", snapshot).await.unwrap();
        service.submit(&actor(), "boundary-1", delta1).await.unwrap();
        service.submit(&actor(), "boundary-1", delta2).await.unwrap();

        let value = service
            .running_meter_value("eq-meter", "coin-in", t0 + chrono::Duration::minutes(2))
            .unwrap();
        assert_eq!(value, 10_750);

        let value_before_deltas = service
            .running_meter_value("eq-meter", "coin-in", t0)
            .unwrap();
        assert_eq!(value_before_deltas, 10_000);
    }
}
