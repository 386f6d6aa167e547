use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use ulid::Ulid;

use crate::config::Policy;
use crate::model::*;

use super::EngineError;
use super::ledger::Ledger;

/// A unit of work staged over a read-only view of the ledger.
///
/// Reads see the base ledger with the transaction's own writes layered on
/// top. Nothing reaches the base until the engine has made the staged events
/// durable as one WAL frame.
pub(super) struct Txn<'a> {
    base: &'a Ledger,
    overlay: Ledger,
    events: Vec<Event>,
    now: Ms,
    policy: &'a Policy,
    commit_on_error: bool,
}

fn copy_entry<K: Hash + Eq + Copy, V: Clone>(overlay: &mut HashMap<K, V>, base: &HashMap<K, V>, id: &K) {
    if !overlay.contains_key(id)
        && let Some(v) = base.get(id)
    {
        overlay.insert(*id, v.clone());
    }
}

fn copy_ordered<V: Clone>(overlay: &mut BTreeMap<Ulid, V>, base: &BTreeMap<Ulid, V>, id: &Ulid) {
    if !overlay.contains_key(id)
        && let Some(v) = base.get(id)
    {
        overlay.insert(*id, v.clone());
    }
}

fn merged<'s, V>(overlay: &'s HashMap<Ulid, V>, base: &'s HashMap<Ulid, V>) -> impl Iterator<Item = &'s V> + 's {
    overlay
        .values()
        .chain(base.iter().filter(move |(k, _)| !overlay.contains_key(*k)).map(|(_, v)| v))
}

impl<'a> Txn<'a> {
    pub fn new(base: &'a Ledger, now: Ms, policy: &'a Policy) -> Self {
        let overlay = Ledger {
            last_id: base.last_id,
            ..Ledger::default()
        };
        Self {
            base,
            overlay,
            events: Vec::new(),
            now,
            policy,
            commit_on_error: false,
        }
    }

    pub fn now(&self) -> Ms {
        self.now
    }

    pub fn policy(&self) -> &Policy {
        self.policy
    }

    /// The committed state, for read models that stage nothing before reading.
    pub fn base(&self) -> &Ledger {
        self.base
    }

    /// Keep the staged events even if the operation returns an error.
    pub fn commit_on_error(&mut self) {
        self.commit_on_error = true;
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn finish(self) -> (Vec<Event>, Ulid, bool) {
        (self.events, self.overlay.last_id, self.commit_on_error)
    }

    /// Stage an event and apply it to the overlay.
    pub fn push(&mut self, event: Event) {
        self.stage(&event);
        self.overlay.apply(&event);
        self.events.push(event);
    }

    /// Copy the entity an update touches into the overlay, leaving indexes alone.
    fn stage(&mut self, event: &Event) {
        let (o, b) = (&mut self.overlay, self.base);
        match event {
            Event::UserActiveSet { id, .. } => copy_entry(&mut o.users, &b.users, id),
            Event::ProfileUpdated { id, .. } => copy_entry(&mut o.profiles, &b.profiles, id),
            Event::SlotStatusSet { id, .. } => copy_entry(&mut o.slots, &b.slots, id),
            Event::PackageLessonConsumed { id }
            | Event::PackageLessonReturned { id }
            | Event::PackageStatusSet { id, .. } => copy_entry(&mut o.packages, &b.packages, id),
            Event::PaymentStatusSet { id, .. } => copy_entry(&mut o.payments, &b.payments, id),
            Event::BookingConfirmed { id, .. }
            | Event::BookingCanceled { id, .. }
            | Event::BookingExpired { id }
            | Event::BookingRescheduled { id, .. } => copy_entry(&mut o.bookings, &b.bookings, id),
            Event::LessonUpdated { id, .. } => copy_entry(&mut o.lessons, &b.lessons, id),
            Event::OutboxProcessed { id, .. }
            | Event::OutboxFailed { id, .. }
            | Event::OutboxRequeued { id, .. } => copy_ordered(&mut o.outbox, &b.outbox, id),
            Event::NotificationStatusSet { id, .. } => {
                copy_ordered(&mut o.notifications, &b.notifications, id)
            }
            _ => {}
        }
    }

    /// Time-ordered id, strictly increasing within the tenant.
    pub fn next_id(&mut self) -> Ulid {
        let candidate = Ulid::from_parts(self.now.max(0) as u64, Ulid::new().random());
        let last = self.overlay.last_id;
        let id = if candidate > last {
            candidate
        } else {
            last.increment().unwrap_or(candidate)
        };
        self.overlay.last_id = id;
        id
    }

    /// Append an outbox row for `payload`.
    pub fn emit(&mut self, payload: DomainEvent) {
        let id = self.next_id();
        let at = self.now;
        self.push(Event::OutboxAppended { id, payload, at });
    }

    pub fn audit(
        &mut self,
        actor: Option<&Actor>,
        action: &str,
        entity_type: &str,
        entity_id: Option<String>,
        payload: serde_json::Value,
    ) {
        let id = self.next_id();
        let at = self.now;
        self.push(Event::AuditRecorded {
            id,
            actor_id: actor.map(|a| a.id),
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            payload: payload.to_string(),
            at,
        });
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<&User> {
        self.overlay.users.get(id).or_else(|| self.base.users.get(id))
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        let id = self
            .overlay
            .email_index
            .get(email)
            .or_else(|| self.base.email_index.get(email))?;
        self.user(id)
    }

    pub fn profile(&self, id: &Ulid) -> Option<&TeacherProfile> {
        self.overlay.profiles.get(id).or_else(|| self.base.profiles.get(id))
    }

    pub fn profile_for_user(&self, user_id: &Ulid) -> Option<&TeacherProfile> {
        let id = self
            .overlay
            .profile_by_user
            .get(user_id)
            .or_else(|| self.base.profile_by_user.get(user_id))?;
        self.profile(id)
    }

    pub fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.overlay.slots.get(id).or_else(|| self.base.slots.get(id))
    }

    pub fn slots_of_teacher(&self, teacher_id: &Ulid) -> Vec<&Slot> {
        let fresh = self.overlay.slots_by_teacher.get(teacher_id).into_iter().flatten();
        let known = self.base.slots_by_teacher.get(teacher_id).into_iter().flatten();
        fresh.chain(known).filter_map(|id| self.slot(id)).collect()
    }

    pub fn package(&self, id: &Ulid) -> Option<&LessonPackage> {
        self.overlay.packages.get(id).or_else(|| self.base.packages.get(id))
    }

    pub fn packages(&self) -> impl Iterator<Item = &LessonPackage> {
        merged(&self.overlay.packages, &self.base.packages)
    }

    pub fn payment(&self, id: &Ulid) -> Option<&Payment> {
        self.overlay.payments.get(id).or_else(|| self.base.payments.get(id))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.overlay.bookings.get(id).or_else(|| self.base.bookings.get(id))
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        merged(&self.overlay.bookings, &self.base.bookings)
    }

    pub fn bookings_for_slot(&self, slot_id: &Ulid) -> Vec<&Booking> {
        let fresh = self.overlay.bookings_by_slot.get(slot_id).into_iter().flatten();
        let known = self.base.bookings_by_slot.get(slot_id).into_iter().flatten();
        fresh.chain(known).filter_map(|id| self.booking(id)).collect()
    }

    pub fn lesson(&self, id: &Ulid) -> Option<&Lesson> {
        self.overlay.lessons.get(id).or_else(|| self.base.lessons.get(id))
    }

    pub fn lesson_for_booking(&self, booking_id: &Ulid) -> Option<&Lesson> {
        let id = self
            .overlay
            .lesson_by_booking
            .get(booking_id)
            .or_else(|| self.base.lesson_by_booking.get(booking_id))?;
        self.lesson(id)
    }

    pub fn outbox_event(&self, id: &Ulid) -> Option<&OutboxEvent> {
        self.overlay.outbox.get(id).or_else(|| self.base.outbox.get(id))
    }

    /// All outbox rows, oldest first.
    pub fn outbox(&self) -> impl Iterator<Item = &OutboxEvent> {
        let overlay = &self.overlay.outbox;
        let known = self
            .base
            .outbox
            .iter()
            .map(move |(id, row)| overlay.get(id).unwrap_or(row));
        let fresh = overlay
            .iter()
            .filter(|(id, _)| !self.base.outbox.contains_key(*id))
            .map(|(_, row)| row);
        known.chain(fresh)
    }

    pub fn notification(&self, id: &Ulid) -> Option<&Notification> {
        self.overlay
            .notifications
            .get(id)
            .or_else(|| self.base.notifications.get(id))
    }

    // ── Owned lookups that fail with NotFound ────────────────

    pub fn require_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.user(&id).cloned().ok_or(EngineError::NotFound("user", id))
    }

    pub fn require_profile(&self, id: Ulid) -> Result<TeacherProfile, EngineError> {
        self.profile(&id).cloned().ok_or(EngineError::NotFound("teacher profile", id))
    }

    pub fn require_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        self.slot(&id).cloned().ok_or(EngineError::NotFound("slot", id))
    }

    pub fn require_package(&self, id: Ulid) -> Result<LessonPackage, EngineError> {
        self.package(&id).cloned().ok_or(EngineError::NotFound("package", id))
    }

    pub fn require_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        self.payment(&id).cloned().ok_or(EngineError::NotFound("payment", id))
    }

    pub fn require_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.booking(&id).cloned().ok_or(EngineError::NotFound("booking", id))
    }

    pub fn require_lesson(&self, id: Ulid) -> Result<Lesson, EngineError> {
        self.lesson(&id).cloned().ok_or(EngineError::NotFound("lesson", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_event(id: Ulid, teacher_id: Ulid) -> Event {
        Event::SlotCreated {
            id,
            teacher_id,
            created_by: Ulid::nil(),
            span: Span::new(1_000, 2_000),
            at: 0,
        }
    }

    #[test]
    fn overlay_reads_its_own_writes_without_touching_base() {
        let mut base = Ledger::new();
        let teacher = Ulid::new();
        let slot = Ulid::new();
        base.apply(&slot_event(slot, teacher));

        let policy = Policy::default();
        let mut tx = Txn::new(&base, 10, &policy);
        tx.push(Event::SlotStatusSet { id: slot, status: SlotStatus::Hold });
        let other = Ulid::new();
        tx.push(slot_event(other, teacher));

        assert_eq!(tx.slot(&slot).unwrap().status, SlotStatus::Hold);
        assert_eq!(tx.slots_of_teacher(&teacher).len(), 2);
        assert_eq!(base.slots[&slot].status, SlotStatus::Open);
        assert!(!base.slots.contains_key(&other));

        let (events, _, keep) = tx.finish();
        assert_eq!(events.len(), 2);
        assert!(!keep);
    }

    #[test]
    fn generated_ids_are_monotonic_within_an_instant() {
        let base = Ledger::new();
        let policy = Policy::default();
        let mut tx = Txn::new(&base, 5_000, &policy);
        let ids: Vec<Ulid> = (0..50).map(|_| tx.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| id.timestamp_ms() == 5_000));
    }

    #[test]
    fn outbox_view_keeps_creation_order() {
        let mut base = Ledger::new();
        let policy = Policy::default();
        let payload = DomainEvent::PackageExpired { package_id: Ulid::new(), student_id: Ulid::new() };

        let first = {
            let mut tx = Txn::new(&base, 1, &policy);
            tx.emit(payload.clone());
            let (events, _, _) = tx.finish();
            for e in &events {
                base.apply(e);
            }
            *base.outbox.keys().next().unwrap()
        };

        let mut tx = Txn::new(&base, 1, &policy);
        tx.push(Event::OutboxProcessed { id: first, at: 2 });
        tx.emit(payload);
        let rows: Vec<_> = tx.outbox().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, first);
        assert_eq!(rows[0].status, OutboxStatus::Processed);
        assert_eq!(rows[1].status, OutboxStatus::Pending);
    }
}
