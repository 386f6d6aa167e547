use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::model::*;

/// Materialized state of one tenant, rebuilt by folding WAL events.
///
/// Secondary indexes are append-only (users, profiles, slots and bookings are
/// never physically removed), which lets a transaction overlay merge them with
/// the base by simple concatenation.
#[derive(Debug, Default)]
pub struct Ledger {
    pub(super) users: HashMap<Ulid, User>,
    pub(super) email_index: HashMap<String, Ulid>,
    pub(super) profiles: HashMap<Ulid, TeacherProfile>,
    pub(super) profile_by_user: HashMap<Ulid, Ulid>,
    pub(super) slots: HashMap<Ulid, Slot>,
    pub(super) slots_by_teacher: HashMap<Ulid, Vec<Ulid>>,
    pub(super) packages: HashMap<Ulid, LessonPackage>,
    pub(super) payments: HashMap<Ulid, Payment>,
    pub(super) bookings: HashMap<Ulid, Booking>,
    pub(super) bookings_by_slot: HashMap<Ulid, Vec<Ulid>>,
    pub(super) lessons: HashMap<Ulid, Lesson>,
    pub(super) lesson_by_booking: HashMap<Ulid, Ulid>,
    /// ULID order is creation order, so iteration is oldest first.
    pub(super) outbox: BTreeMap<Ulid, OutboxEvent>,
    pub(super) notifications: BTreeMap<Ulid, Notification>,
    pub(super) audit: BTreeMap<Ulid, AuditEntry>,
    /// Highest generated id, so ids stay monotonic within one instant.
    pub(super) last_id: Ulid,
    /// Sequence number of the last WAL frame applied since the engine opened.
    pub(super) seq: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_record(&mut self, record: Record) {
        match record {
            Record::User(u) => {
                self.email_index.insert(u.email.clone(), u.id);
                self.users.insert(u.id, u);
            }
            Record::Profile(p) => {
                self.profile_by_user.insert(p.user_id, p.id);
                self.profiles.insert(p.id, p);
            }
            Record::Slot(s) => {
                if !self.slots.contains_key(&s.id) {
                    self.slots_by_teacher.entry(s.teacher_id).or_default().push(s.id);
                }
                self.slots.insert(s.id, s);
            }
            Record::Package(p) => {
                self.packages.insert(p.id, p);
            }
            Record::Payment(p) => {
                self.payments.insert(p.id, p);
            }
            Record::Booking(b) => {
                if !self.bookings.contains_key(&b.id) {
                    self.bookings_by_slot.entry(b.slot_id).or_default().push(b.id);
                }
                self.bookings.insert(b.id, b);
            }
            Record::Lesson(l) => {
                self.lesson_by_booking.insert(l.booking_id, l.id);
                self.lessons.insert(l.id, l);
            }
            Record::Outbox(o) => {
                self.bump_id(o.id);
                self.outbox.insert(o.id, o);
            }
            Record::Notification(n) => {
                self.bump_id(n.id);
                self.notifications.insert(n.id, n);
            }
            Record::Audit(a) => {
                self.bump_id(a.id);
                self.audit.insert(a.id, a);
            }
        }
    }

    fn bump_id(&mut self, id: Ulid) {
        if id > self.last_id {
            self.last_id = id;
        }
    }

    /// Fold one event into the state. Updates to unknown entities are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::UserRegistered { id, email, role, display_name, credential, at } => {
                self.insert_record(Record::User(User {
                    id: *id,
                    email: email.clone(),
                    role: *role,
                    display_name: display_name.clone(),
                    active: true,
                    created_at: *at,
                    credential: credential.clone(),
                }));
            }
            Event::UserActiveSet { id, active } => {
                if let Some(u) = self.users.get_mut(id) {
                    u.active = *active;
                }
            }
            Event::ProfileCreated { id, user_id, display_name, bio, experience_years, at } => {
                self.insert_record(Record::Profile(TeacherProfile {
                    id: *id,
                    user_id: *user_id,
                    display_name: display_name.clone(),
                    bio: bio.clone(),
                    experience_years: *experience_years,
                    approved: false,
                    created_at: *at,
                }));
            }
            Event::ProfileUpdated { id, display_name, bio, experience_years, approved } => {
                if let Some(p) = self.profiles.get_mut(id) {
                    p.display_name = display_name.clone();
                    p.bio = bio.clone();
                    p.experience_years = *experience_years;
                    p.approved = *approved;
                }
            }
            Event::SlotCreated { id, teacher_id, created_by, span, at } => {
                self.insert_record(Record::Slot(Slot {
                    id: *id,
                    teacher_id: *teacher_id,
                    created_by: *created_by,
                    span: *span,
                    status: SlotStatus::Open,
                    created_at: *at,
                }));
            }
            Event::SlotStatusSet { id, status } => {
                if let Some(s) = self.slots.get_mut(id) {
                    s.status = *status;
                }
            }
            Event::PackageCreated { id, student_id, lessons_total, expires_at, at } => {
                self.insert_record(Record::Package(LessonPackage {
                    id: *id,
                    student_id: *student_id,
                    lessons_total: *lessons_total,
                    lessons_left: *lessons_total,
                    expires_at: *expires_at,
                    status: PackageStatus::Active,
                    created_at: *at,
                }));
            }
            Event::PackageLessonConsumed { id } => {
                if let Some(p) = self.packages.get_mut(id) {
                    p.lessons_left = p.lessons_left.saturating_sub(1);
                }
            }
            Event::PackageLessonReturned { id } => {
                if let Some(p) = self.packages.get_mut(id) {
                    p.lessons_left = (p.lessons_left + 1).min(p.lessons_total);
                }
            }
            Event::PackageStatusSet { id, status } => {
                if let Some(p) = self.packages.get_mut(id) {
                    p.status = *status;
                }
            }
            Event::PaymentCreated { id, package_id, amount_cents, currency, external_reference, at } => {
                self.insert_record(Record::Payment(Payment {
                    id: *id,
                    package_id: *package_id,
                    amount_cents: *amount_cents,
                    currency: currency.clone(),
                    status: PaymentStatus::Pending,
                    external_reference: external_reference.clone(),
                    paid_at: None,
                    created_at: *at,
                }));
            }
            Event::PaymentStatusSet { id, status, paid_at } => {
                if let Some(p) = self.payments.get_mut(id) {
                    p.status = *status;
                    p.paid_at = *paid_at;
                }
            }
            Event::BookingHeld { id, slot_id, student_id, teacher_id, package_id, hold_expires_at, at } => {
                self.insert_record(Record::Booking(Booking {
                    id: *id,
                    slot_id: *slot_id,
                    student_id: *student_id,
                    teacher_id: *teacher_id,
                    package_id: *package_id,
                    status: BookingStatus::Hold,
                    hold_expires_at: Some(*hold_expires_at),
                    confirmed_at: None,
                    canceled_at: None,
                    cancellation_reason: None,
                    refund_returned: false,
                    rescheduled_from: None,
                    created_at: *at,
                }));
            }
            Event::BookingConfirmed { id, at } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Confirmed;
                    b.confirmed_at = Some(*at);
                    b.hold_expires_at = None;
                }
            }
            Event::BookingCanceled { id, reason, refund_returned, at } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Canceled;
                    b.canceled_at = Some(*at);
                    b.cancellation_reason = reason.clone();
                    b.refund_returned = *refund_returned;
                    b.hold_expires_at = None;
                }
            }
            Event::BookingExpired { id } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.status = BookingStatus::Expired;
                }
            }
            Event::BookingRescheduled { id, from } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    b.rescheduled_from = Some(*from);
                }
            }
            Event::LessonCreated { id, booking_id, student_id, teacher_id, span, at } => {
                self.insert_record(Record::Lesson(Lesson {
                    id: *id,
                    booking_id: *booking_id,
                    student_id: *student_id,
                    teacher_id: *teacher_id,
                    span: *span,
                    status: LessonStatus::Scheduled,
                    topic: None,
                    notes: None,
                    created_at: *at,
                }));
            }
            Event::LessonUpdated { id, status, topic, notes } => {
                if let Some(l) = self.lessons.get_mut(id) {
                    l.status = *status;
                    l.topic = topic.clone();
                    l.notes = notes.clone();
                }
            }
            Event::OutboxAppended { id, payload, at } => {
                self.insert_record(Record::Outbox(OutboxEvent {
                    id: *id,
                    payload: payload.clone(),
                    status: OutboxStatus::Pending,
                    retries: 0,
                    error_message: None,
                    occurred_at: *at,
                    updated_at: *at,
                    processed_at: None,
                }));
            }
            Event::OutboxProcessed { id, at } => {
                if let Some(o) = self.outbox.get_mut(id) {
                    o.status = OutboxStatus::Processed;
                    o.error_message = None;
                    o.processed_at = Some(*at);
                    o.updated_at = *at;
                }
            }
            Event::OutboxFailed { id, error, at } => {
                if let Some(o) = self.outbox.get_mut(id) {
                    o.status = OutboxStatus::Failed;
                    o.retries += 1;
                    o.error_message = Some(error.clone());
                    o.updated_at = *at;
                }
            }
            Event::OutboxRequeued { id, at } => {
                if let Some(o) = self.outbox.get_mut(id) {
                    o.status = OutboxStatus::Pending;
                    o.updated_at = *at;
                }
            }
            Event::NotificationCreated { id, user_id, channel, title, body, at } => {
                self.insert_record(Record::Notification(Notification {
                    id: *id,
                    user_id: *user_id,
                    channel: channel.clone(),
                    title: title.clone(),
                    body: body.clone(),
                    status: NotificationStatus::Pending,
                    sent_at: None,
                    created_at: *at,
                }));
            }
            Event::NotificationStatusSet { id, status, at } => {
                if let Some(n) = self.notifications.get_mut(id) {
                    n.status = *status;
                    if *status == NotificationStatus::Sent {
                        n.sent_at = Some(*at);
                    }
                }
            }
            Event::AuditRecorded { id, actor_id, action, entity_type, entity_id, payload, at } => {
                self.insert_record(Record::Audit(AuditEntry {
                    id: *id,
                    actor_id: *actor_id,
                    action: action.clone(),
                    entity_type: entity_type.clone(),
                    entity_id: entity_id.clone(),
                    payload: payload.clone(),
                    created_at: *at,
                }));
            }
            Event::Restored(record) => self.insert_record(record.clone()),
        }
    }

    /// Current state as restore records. PROCESSED outbox rows processed
    /// before `drop_processed_before` are left out.
    pub fn snapshot(&self, drop_processed_before: Ms) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.users.values().cloned().map(Record::User).map(Event::Restored));
        events.extend(self.profiles.values().cloned().map(Record::Profile).map(Event::Restored));
        events.extend(self.slots.values().cloned().map(Record::Slot).map(Event::Restored));
        events.extend(self.packages.values().cloned().map(Record::Package).map(Event::Restored));
        events.extend(self.payments.values().cloned().map(Record::Payment).map(Event::Restored));
        events.extend(self.bookings.values().cloned().map(Record::Booking).map(Event::Restored));
        events.extend(self.lessons.values().cloned().map(Record::Lesson).map(Event::Restored));
        events.extend(
            self.outbox
                .values()
                .filter(|o| {
                    !(o.status == OutboxStatus::Processed
                        && o.processed_at.is_some_and(|t| t < drop_processed_before))
                })
                .cloned()
                .map(Record::Outbox)
                .map(Event::Restored),
        );
        events.extend(self.notifications.values().cloned().map(Record::Notification).map(Event::Restored));
        events.extend(self.audit.values().cloned().map(Record::Audit).map(Event::Restored));
        events
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}
