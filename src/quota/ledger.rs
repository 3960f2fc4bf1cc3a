//! Quota Reservation Ledger
//!
//! Tracks committed usage and pending reservations per tenant scope. Each
//! scope is serialized behind its own lock so commits and cancels in
//! different projects never contend, while concurrent tasks in the same
//! project see a consistent pending total.

use crate::domain::model::generate_id;
use crate::domain::ports::Credential;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Scope and Resources
// =============================================================================

/// Tenant scope a reservation is accounted against
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaScope {
    pub domain_id: String,
    pub project_id: String,
}

impl QuotaScope {
    pub fn new(domain_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            domain_id: domain_id.into(),
            project_id: project_id.into(),
        }
    }
}

impl From<&Credential> for QuotaScope {
    fn from(cred: &Credential) -> Self {
        Self::new(cred.domain_id.clone(), cred.project_id.clone())
    }
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain_id, self.project_id)
    }
}

/// Billable resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Cpu,
    MemoryMb,
    StorageMb,
    Guests,
}

impl std::fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaResource::Cpu => write!(f, "cpu"),
            QuotaResource::MemoryMb => write!(f, "memory_mb"),
            QuotaResource::StorageMb => write!(f, "storage_mb"),
            QuotaResource::Guests => write!(f, "guests"),
        }
    }
}

/// Signed resource deltas; negative amounts model releases
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDeltas(BTreeMap<QuotaResource, i64>);

impl QuotaDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an amount; zero amounts are dropped
    pub fn with(mut self, resource: QuotaResource, amount: i64) -> Self {
        if amount != 0 {
            *self.0.entry(resource).or_insert(0) += amount;
        }
        self
    }

    /// Deltas for creating (or, negated, deleting) a guest
    pub fn for_guest(vcpu_count: u32, vmem_size_mb: u64, storage_mb: u64) -> Self {
        Self::new()
            .with(QuotaResource::Guests, 1)
            .with(QuotaResource::Cpu, vcpu_count as i64)
            .with(QuotaResource::MemoryMb, vmem_size_mb as i64)
            .with(QuotaResource::StorageMb, storage_mb as i64)
    }

    pub fn get(&self, resource: QuotaResource) -> i64 {
        self.0.get(&resource).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (QuotaResource, i64)> + '_ {
        self.0.iter().map(|(r, a)| (*r, *a))
    }

    pub fn negated(&self) -> Self {
        Self(self.0.iter().map(|(r, a)| (*r, -a)).collect())
    }
}

// =============================================================================
// Reservations
// =============================================================================

/// Reservation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    pub fn generate() -> Self {
        Self(generate_id("resv"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReservationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reservation lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    #[default]
    Pending,
    Committed,
    Cancelled,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationState::Pending => write!(f, "pending"),
            ReservationState::Committed => write!(f, "committed"),
            ReservationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A pending-usage entry; also the form persisted inside task records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub scope: QuotaScope,
    pub deltas: QuotaDeltas,
    #[serde(default)]
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_pending(&self) -> bool {
        self.state == ReservationState::Pending
    }
}

/// Outcome of a commit or cancel call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// This call resolved the reservation
    Applied,
    AlreadyCommitted,
    AlreadyCancelled,
}

// =============================================================================
// Scope Ledger
// =============================================================================

/// Resolved reservations remembered per scope so repeats stay idempotent
const RESOLVED_RETENTION: usize = 1024;

#[derive(Debug, Default)]
struct ScopeLedger {
    limits: BTreeMap<QuotaResource, i64>,
    usage: BTreeMap<QuotaResource, i64>,
    pending: BTreeMap<ReservationId, Reservation>,
    /// Running sum of positive pending deltas
    pending_totals: BTreeMap<QuotaResource, i64>,
    resolved: BTreeMap<ReservationId, Reservation>,
    resolved_order: VecDeque<ReservationId>,
}

impl ScopeLedger {
    fn pending_total(&self, resource: QuotaResource) -> i64 {
        self.pending_totals.get(&resource).copied().unwrap_or(0)
    }

    fn check_limits(&self, scope: &QuotaScope, deltas: &QuotaDeltas) -> Result<()> {
        for (resource, amount) in deltas.iter().filter(|(_, a)| *a > 0) {
            let Some(limit) = self.limits.get(&resource).copied() else {
                continue;
            };
            let used = self.usage.get(&resource).copied().unwrap_or(0) + self.pending_total(resource);
            if used + amount > limit {
                return Err(Error::QuotaExceeded {
                    scope: scope.to_string(),
                    resource: resource.to_string(),
                    requested: amount,
                    available: (limit - used).max(0),
                });
            }
        }
        Ok(())
    }

    fn hold(&mut self, reservation: Reservation) {
        for (resource, amount) in reservation.deltas.iter().filter(|(_, a)| *a > 0) {
            *self.pending_totals.entry(resource).or_insert(0) += amount;
        }
        self.pending.insert(reservation.id.clone(), reservation);
    }

    fn get(&self, id: &ReservationId) -> Option<&Reservation> {
        self.pending.get(id).or_else(|| self.resolved.get(id))
    }

    /// Resolve a reservation, returning the ids that fell out of the
    /// resolved window
    fn resolve(
        &mut self,
        id: &ReservationId,
        commit: bool,
    ) -> Result<(Resolution, Vec<ReservationId>)> {
        if let Some(done) = self.resolved.get(id) {
            let resolution = match done.state {
                ReservationState::Committed => Resolution::AlreadyCommitted,
                _ => Resolution::AlreadyCancelled,
            };
            return Ok((resolution, Vec::new()));
        }

        let mut reservation = self
            .pending
            .remove(id)
            .ok_or_else(|| Error::ReservationNotFound {
                reservation_id: id.to_string(),
            })?;

        for (resource, amount) in reservation.deltas.iter().filter(|(_, a)| *a > 0) {
            let total = self.pending_totals.entry(resource).or_insert(0);
            *total -= amount;
            if *total <= 0 {
                self.pending_totals.remove(&resource);
            }
        }

        if commit {
            reservation.state = ReservationState::Committed;
            for (resource, amount) in reservation.deltas.iter() {
                let entry = self.usage.entry(resource).or_insert(0);
                *entry = (*entry + amount).max(0);
            }
        } else {
            reservation.state = ReservationState::Cancelled;
        }

        self.resolved_order.push_back(id.clone());
        self.resolved.insert(id.clone(), reservation);

        let mut evicted = Vec::new();
        while self.resolved_order.len() > RESOLVED_RETENTION {
            if let Some(old) = self.resolved_order.pop_front() {
                self.resolved.remove(&old);
                evicted.push(old);
            }
        }

        Ok((Resolution::Applied, evicted))
    }
}

// =============================================================================
// Quota Ledger
// =============================================================================

/// Process-wide reservation ledger
#[derive(Debug, Default)]
pub struct QuotaLedger {
    scopes: DashMap<QuotaScope, Arc<Mutex<ScopeLedger>>>,
    index: DashMap<ReservationId, QuotaScope>,
    default_limits: BTreeMap<QuotaResource, i64>,
}

pub type QuotaLedgerRef = Arc<QuotaLedger>;

impl QuotaLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ledger whose scopes start with the given limits
    pub fn with_default_limits(limits: BTreeMap<QuotaResource, i64>) -> Arc<Self> {
        Arc::new(Self {
            default_limits: limits,
            ..Default::default()
        })
    }

    fn scope(&self, scope: &QuotaScope) -> Arc<Mutex<ScopeLedger>> {
        self.scopes
            .entry(scope.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ScopeLedger {
                    limits: self.default_limits.clone(),
                    ..Default::default()
                }))
            })
            .clone()
    }

    fn scope_of(&self, id: &ReservationId) -> Result<Arc<Mutex<ScopeLedger>>> {
        let scope = self
            .index
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::ReservationNotFound {
                reservation_id: id.to_string(),
            })?;
        Ok(self.scope(&scope))
    }

    /// Reserve deltas against a scope
    pub fn reserve(&self, scope: &QuotaScope, deltas: QuotaDeltas) -> Result<Reservation> {
        let ledger = self.scope(scope);
        let mut ledger = ledger.lock();

        ledger.check_limits(scope, &deltas)?;

        let reservation = Reservation {
            id: ReservationId::generate(),
            scope: scope.clone(),
            deltas,
            state: ReservationState::Pending,
            created_at: Utc::now(),
        };
        ledger.hold(reservation.clone());
        self.index.insert(reservation.id.clone(), scope.clone());

        info!(
            reservation_id = %reservation.id,
            scope = %scope,
            "Reserved quota"
        );
        Ok(reservation)
    }

    fn resolve(&self, id: &ReservationId, commit: bool) -> Result<Resolution> {
        let ledger = self.scope_of(id)?;
        let (resolution, evicted) = ledger.lock().resolve(id, commit)?;
        for old in evicted {
            self.index.remove(&old);
        }
        Ok(resolution)
    }

    /// Fold a reservation into committed usage
    pub fn commit(&self, id: &ReservationId) -> Result<Resolution> {
        let resolution = self.resolve(id, true)?;
        match resolution {
            Resolution::Applied => info!(reservation_id = %id, "Committed quota reservation"),
            other => debug!(reservation_id = %id, ?other, "Commit was a no-op"),
        }
        Ok(resolution)
    }

    /// Discard a reservation
    pub fn cancel(&self, id: &ReservationId) -> Result<Resolution> {
        let resolution = self.resolve(id, false)?;
        match resolution {
            Resolution::Applied => info!(reservation_id = %id, "Cancelled quota reservation"),
            other => debug!(reservation_id = %id, ?other, "Cancel was a no-op"),
        }
        Ok(resolution)
    }

    pub fn get(&self, id: &ReservationId) -> Option<Reservation> {
        let ledger = self.scope_of(id).ok()?;
        let ledger = ledger.lock();
        ledger.get(id).cloned()
    }

    /// Re-register a pending reservation restored from a task record
    pub fn adopt(&self, reservation: &Reservation) {
        if !reservation.is_pending() || self.index.contains_key(&reservation.id) {
            return;
        }

        let ledger = self.scope(&reservation.scope);
        ledger.lock().hold(reservation.clone());
        self.index
            .insert(reservation.id.clone(), reservation.scope.clone());

        warn!(
            reservation_id = %reservation.id,
            scope = %reservation.scope,
            "Adopted pending reservation after restart"
        );
    }

    /// Committed usage of a scope
    pub fn usage(&self, scope: &QuotaScope) -> BTreeMap<QuotaResource, i64> {
        self.scope(scope).lock().usage.clone()
    }

    /// Sum of pending positive deltas in a scope
    pub fn pending(&self, scope: &QuotaScope) -> BTreeMap<QuotaResource, i64> {
        let ledger = self.scope(scope);
        let ledger = ledger.lock();
        [
            QuotaResource::Cpu,
            QuotaResource::MemoryMb,
            QuotaResource::StorageMb,
            QuotaResource::Guests,
        ]
        .into_iter()
        .map(|r| (r, ledger.pending_total(r)))
        .filter(|(_, a)| *a != 0)
        .collect()
    }

    pub fn set_limit(&self, scope: &QuotaScope, resource: QuotaResource, limit: i64) {
        self.scope(scope).lock().limits.insert(resource, limit);
    }

    /// Record usage that predates the ledger
    pub fn seed_usage(&self, scope: &QuotaScope, resource: QuotaResource, amount: i64) {
        *self
            .scope(scope)
            .lock()
            .usage
            .entry(resource)
            .or_insert(0) += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> QuotaScope {
        QuotaScope::new("default", "p1")
    }

    #[test]
    fn test_commit_then_cancel_is_noop() {
        let ledger = QuotaLedger::new();
        let r = ledger
            .reserve(&scope(), QuotaDeltas::for_guest(2, 2048, 40 * 1024))
            .unwrap();

        assert_eq!(ledger.commit(&r.id).unwrap(), Resolution::Applied);
        assert_eq!(ledger.cancel(&r.id).unwrap(), Resolution::AlreadyCommitted);
        assert_eq!(ledger.commit(&r.id).unwrap(), Resolution::AlreadyCommitted);

        let usage = ledger.usage(&scope());
        assert_eq!(usage.get(&QuotaResource::Cpu), Some(&2));
        assert_eq!(usage.get(&QuotaResource::Guests), Some(&1));
        assert_eq!(
            ledger.get(&r.id).unwrap().state,
            ReservationState::Committed
        );
    }

    #[test]
    fn test_cancel_then_commit_is_noop() {
        let ledger = QuotaLedger::new();
        let r = ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 4))
            .unwrap();

        assert_eq!(ledger.cancel(&r.id).unwrap(), Resolution::Applied);
        assert_eq!(ledger.commit(&r.id).unwrap(), Resolution::AlreadyCancelled);
        assert!(ledger.usage(&scope()).is_empty());
        assert!(ledger.pending(&scope()).is_empty());
    }

    #[test]
    fn test_limits_count_pending() {
        let ledger = QuotaLedger::new();
        ledger.set_limit(&scope(), QuotaResource::Cpu, 8);
        ledger.seed_usage(&scope(), QuotaResource::Cpu, 2);

        let first = ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 4))
            .unwrap();
        assert_eq!(ledger.pending(&scope()).get(&QuotaResource::Cpu), Some(&4));

        let err = ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 4))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                requested: 4,
                available: 2,
                ..
            }
        ));

        // Releases are never blocked by limits
        ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, -2))
            .unwrap();

        ledger.cancel(&first.id).unwrap();
        ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 4))
            .unwrap();
    }

    #[test]
    fn test_negative_deltas_release_usage() {
        let ledger = QuotaLedger::new();
        let create = QuotaDeltas::for_guest(2, 1024, 20480);
        let r = ledger.reserve(&scope(), create.clone()).unwrap();
        ledger.commit(&r.id).unwrap();

        let r = ledger.reserve(&scope(), create.negated()).unwrap();
        ledger.commit(&r.id).unwrap();

        let usage = ledger.usage(&scope());
        assert!(usage.values().all(|v| *v == 0));
    }

    #[test]
    fn test_adopt_restored_reservation() {
        let ledger = QuotaLedger::new();
        let restored = Reservation {
            id: ReservationId::from("resv-restored"),
            scope: scope(),
            deltas: QuotaDeltas::new().with(QuotaResource::Guests, 1),
            state: ReservationState::Pending,
            created_at: Utc::now(),
        };

        ledger.adopt(&restored);
        ledger.adopt(&restored);
        assert_eq!(ledger.commit(&restored.id).unwrap(), Resolution::Applied);
        assert!(matches!(
            ledger.commit(&ReservationId::from("resv-missing")),
            Err(Error::ReservationNotFound { .. })
        ));
    }

    #[test]
    fn test_resolved_reservations_leave_a_bounded_window() {
        let ledger = QuotaLedger::new();
        let oldest = ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 1))
            .unwrap();
        ledger.commit(&oldest.id).unwrap();

        for _ in 0..RESOLVED_RETENTION {
            let r = ledger
                .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 1))
                .unwrap();
            ledger.cancel(&r.id).unwrap();
        }

        let latest = ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 1))
            .unwrap();
        assert_eq!(ledger.pending(&scope()).get(&QuotaResource::Cpu), Some(&1));
        ledger.cancel(&latest.id).unwrap();

        // Recent repeats are still no-ops
        assert_eq!(ledger.cancel(&latest.id).unwrap(), Resolution::AlreadyCancelled);
        assert_eq!(
            ledger.get(&latest.id).unwrap().state,
            ReservationState::Cancelled
        );

        // The oldest fell out of the window
        assert!(ledger.get(&oldest.id).is_none());
        assert!(matches!(
            ledger.commit(&oldest.id),
            Err(Error::ReservationNotFound { .. })
        ));
        assert_eq!(ledger.index.len(), RESOLVED_RETENTION);

        assert!(ledger.pending(&scope()).is_empty());
        assert_eq!(ledger.usage(&scope()).get(&QuotaResource::Cpu), Some(&1));
    }

    #[test]
    fn test_concurrent_resolution_applies_once() {
        let ledger = QuotaLedger::new();
        let r = ledger
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::StorageMb, 100))
            .unwrap();

        let applied: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let ledger = &ledger;
                    let id = r.id.clone();
                    s.spawn(move || {
                        let res = if i % 2 == 0 {
                            ledger.commit(&id)
                        } else {
                            ledger.cancel(&id)
                        };
                        (res.unwrap() == Resolution::Applied) as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(applied, 1);
    }
}
