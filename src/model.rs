use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use crate::auth::Credential;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Status enums share one text form on the wire and in outbox payloads.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            /// Case-insensitive parse of the text form.
            pub fn parse(s: &str) -> Option<Self> {
                let lower = s.trim().to_ascii_lowercase();
                match lower.as_str() {
                    $($label => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labelled_enum!(Role {
    Student => "student",
    Teacher => "teacher",
    Admin => "admin",
});

labelled_enum!(SlotStatus {
    Open => "open",
    Hold => "hold",
    Booked => "booked",
    Canceled => "canceled",
});

labelled_enum!(
    /// Booking lifecycle: HOLD → CONFIRMED → CANCELED, or HOLD → EXPIRED.
    BookingStatus {
        Hold => "hold",
        Confirmed => "confirmed",
        Canceled => "canceled",
        Expired => "expired",
    }
);

labelled_enum!(PackageStatus {
    Active => "active",
    Expired => "expired",
    Canceled => "canceled",
});

labelled_enum!(PaymentStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Refunded => "refunded",
});

labelled_enum!(LessonStatus {
    Scheduled => "scheduled",
    Completed => "completed",
    Canceled => "canceled",
});

labelled_enum!(OutboxStatus {
    Pending => "pending",
    Processed => "processed",
    Failed => "failed",
});

labelled_enum!(NotificationStatus {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
});

impl PaymentStatus {
    /// Statuses reachable from `self` in one step.
    pub fn allowed_next(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[PaymentStatus::Succeeded, PaymentStatus::Failed],
            PaymentStatus::Failed => &[PaymentStatus::Pending, PaymentStatus::Succeeded],
            PaymentStatus::Succeeded => &[PaymentStatus::Refunded],
            PaymentStatus::Refunded => &[],
        }
    }
}

/// The caller of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    /// The operator identity used by background workers and the configured admin login.
    pub fn operator() -> Self {
        Self {
            id: Ulid::nil(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub role: Role,
    pub display_name: String,
    pub active: bool,
    pub created_at: Ms,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherProfile {
    pub id: Ulid,
    pub user_id: Ulid,
    pub display_name: String,
    pub bio: Option<String>,
    pub experience_years: u32,
    pub approved: bool,
    pub created_at: Ms,
}

/// A bookable window in a teacher's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub created_by: Ulid,
    pub span: Span,
    pub status: SlotStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonPackage {
    pub id: Ulid,
    pub student_id: Ulid,
    pub lessons_total: u32,
    pub lessons_left: u32,
    pub expires_at: Ms,
    pub status: PackageStatus,
    pub created_at: Ms,
}

impl LessonPackage {
    /// ACTIVE and not past its expiry at `now`.
    pub fn is_usable(&self, now: Ms) -> bool {
        self.status == PackageStatus::Active && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub package_id: Ulid,
    /// Minor currency units.
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub external_reference: Option<String>,
    pub paid_at: Option<Ms>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub package_id: Ulid,
    pub status: BookingStatus,
    pub hold_expires_at: Option<Ms>,
    pub confirmed_at: Option<Ms>,
    pub canceled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
    pub refund_returned: bool,
    pub rescheduled_from: Option<Ulid>,
    pub created_at: Ms,
}

impl Booking {
    /// A HOLD whose expiry has passed at `now`.
    pub fn hold_lapsed(&self, now: Ms) -> bool {
        self.status == BookingStatus::Hold && self.hold_expires_at.is_none_or(|t| t <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub span: Span,
    pub status: LessonStatus,
    pub topic: Option<String>,
    pub notes: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Ulid,
    pub payload: DomainEvent,
    pub status: OutboxStatus,
    pub retries: u32,
    pub error_message: Option<String>,
    pub occurred_at: Ms,
    pub updated_at: Ms,
    pub processed_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub channel: String,
    pub title: String,
    pub body: String,
    pub status: NotificationStatus,
    pub sent_at: Option<Ms>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub actor_id: Option<Ulid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    /// JSON object text.
    pub payload: String,
    pub created_at: Ms,
}

// ── Outbox payloads ──────────────────────────────────────────────

/// Integration events written to the outbox alongside each state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    BookingHoldCreated {
        booking_id: Ulid,
        slot_id: Ulid,
        student_id: Ulid,
    },
    BookingConfirmed {
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
    },
    BookingCanceled {
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
        refund_returned: bool,
    },
    BookingRescheduled {
        new_booking_id: Ulid,
        old_booking_id: Ulid,
        student_id: Ulid,
    },
    BookingHoldExpired {
        booking_id: Ulid,
        slot_id: Ulid,
    },
    LessonCreated {
        lesson_id: Ulid,
        booking_id: Ulid,
        student_id: Ulid,
        teacher_id: Ulid,
    },
    LessonCanceled {
        lesson_id: Ulid,
        booking_id: Ulid,
        student_id: Ulid,
        teacher_id: Ulid,
        reason: Option<String>,
    },
    PackageCreated {
        package_id: Ulid,
        student_id: Ulid,
        lessons_total: u32,
    },
    PackageExpired {
        package_id: Ulid,
        student_id: Ulid,
    },
    PaymentCreated {
        payment_id: Ulid,
        package_id: Ulid,
        status: PaymentStatus,
    },
    PaymentStatusUpdated {
        payment_id: Ulid,
        from_status: PaymentStatus,
        to_status: PaymentStatus,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::BookingHoldCreated { .. } => "booking.hold.created",
            DomainEvent::BookingConfirmed { .. } => "booking.confirmed",
            DomainEvent::BookingCanceled { .. } => "booking.canceled",
            DomainEvent::BookingRescheduled { .. } => "booking.rescheduled",
            DomainEvent::BookingHoldExpired { .. } => "booking.hold.expired",
            DomainEvent::LessonCreated { .. } => "lesson.created",
            DomainEvent::LessonCanceled { .. } => "lesson.canceled",
            DomainEvent::PackageCreated { .. } => "billing.package.created",
            DomainEvent::PackageExpired { .. } => "billing.package.expired",
            DomainEvent::PaymentCreated { .. } => "billing.payment.created",
            DomainEvent::PaymentStatusUpdated { .. } => "billing.payment.status.updated",
        }
    }

    /// `(aggregate_type, aggregate_id)` of the entity that changed.
    pub fn aggregate(&self) -> (&'static str, Ulid) {
        match self {
            DomainEvent::BookingHoldCreated { booking_id, .. }
            | DomainEvent::BookingConfirmed { booking_id, .. }
            | DomainEvent::BookingCanceled { booking_id, .. }
            | DomainEvent::BookingHoldExpired { booking_id, .. } => ("booking", *booking_id),
            DomainEvent::BookingRescheduled { new_booking_id, .. } => ("booking", *new_booking_id),
            DomainEvent::LessonCreated { lesson_id, .. }
            | DomainEvent::LessonCanceled { lesson_id, .. } => ("lesson", *lesson_id),
            DomainEvent::PackageCreated { package_id, .. }
            | DomainEvent::PackageExpired { package_id, .. } => ("billing", *package_id),
            DomainEvent::PaymentCreated { payment_id, .. }
            | DomainEvent::PaymentStatusUpdated { payment_id, .. } => ("billing", *payment_id),
        }
    }

    /// Flat JSON object of the payload fields plus `event_type`.
    pub fn to_json(&self) -> String {
        // Externally tagged: {"Variant": {fields}}. Bincode in the WAL needs that shape.
        let mut value = serde_json::to_value(self).unwrap_or_default();
        let mut body = value
            .as_object_mut()
            .and_then(|m| m.values_mut().next().map(std::mem::take))
            .unwrap_or_default();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("event_type".into(), self.event_type().into());
        }
        body.to_string()
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Full entity image, used by compaction to rewrite the log as a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    User(User),
    Profile(TeacherProfile),
    Slot(Slot),
    Package(LessonPackage),
    Payment(Payment),
    Booking(Booking),
    Lesson(Lesson),
    Outbox(OutboxEvent),
    Notification(Notification),
    Audit(AuditEntry),
}

/// The event types, flat with no nesting. A WAL frame carries the events of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        email: String,
        role: Role,
        display_name: String,
        credential: Credential,
        at: Ms,
    },
    UserActiveSet {
        id: Ulid,
        active: bool,
    },
    ProfileCreated {
        id: Ulid,
        user_id: Ulid,
        display_name: String,
        bio: Option<String>,
        experience_years: u32,
        at: Ms,
    },
    ProfileUpdated {
        id: Ulid,
        display_name: String,
        bio: Option<String>,
        experience_years: u32,
        approved: bool,
    },
    SlotCreated {
        id: Ulid,
        teacher_id: Ulid,
        created_by: Ulid,
        span: Span,
        at: Ms,
    },
    SlotStatusSet {
        id: Ulid,
        status: SlotStatus,
    },
    PackageCreated {
        id: Ulid,
        student_id: Ulid,
        lessons_total: u32,
        expires_at: Ms,
        at: Ms,
    },
    PackageLessonConsumed {
        id: Ulid,
    },
    PackageLessonReturned {
        id: Ulid,
    },
    PackageStatusSet {
        id: Ulid,
        status: PackageStatus,
    },
    PaymentCreated {
        id: Ulid,
        package_id: Ulid,
        amount_cents: i64,
        currency: String,
        external_reference: Option<String>,
        at: Ms,
    },
    PaymentStatusSet {
        id: Ulid,
        status: PaymentStatus,
        paid_at: Option<Ms>,
    },
    BookingHeld {
        id: Ulid,
        slot_id: Ulid,
        student_id: Ulid,
        teacher_id: Ulid,
        package_id: Ulid,
        hold_expires_at: Ms,
        at: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        at: Ms,
    },
    BookingCanceled {
        id: Ulid,
        reason: Option<String>,
        refund_returned: bool,
        at: Ms,
    },
    BookingExpired {
        id: Ulid,
    },
    BookingRescheduled {
        id: Ulid,
        from: Ulid,
    },
    LessonCreated {
        id: Ulid,
        booking_id: Ulid,
        student_id: Ulid,
        teacher_id: Ulid,
        span: Span,
        at: Ms,
    },
    LessonUpdated {
        id: Ulid,
        status: LessonStatus,
        topic: Option<String>,
        notes: Option<String>,
    },
    OutboxAppended {
        id: Ulid,
        payload: DomainEvent,
        at: Ms,
    },
    OutboxProcessed {
        id: Ulid,
        at: Ms,
    },
    OutboxFailed {
        id: Ulid,
        error: String,
        at: Ms,
    },
    OutboxRequeued {
        id: Ulid,
        at: Ms,
    },
    NotificationCreated {
        id: Ulid,
        user_id: Ulid,
        channel: String,
        title: String,
        body: String,
        at: Ms,
    },
    NotificationStatusSet {
        id: Ulid,
        status: NotificationStatus,
        at: Ms,
    },
    AuditRecorded {
        id: Ulid,
        actor_id: Option<Ulid>,
        action: String,
        entity_type: String,
        entity_id: Option<String>,
        payload: String,
        at: Ms,
    },
    Restored(Record),
}

// ── Read models ──────────────────────────────────────────────────

/// Requested window into a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: crate::limits::DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

/// One page of a listing plus the unpaginated total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KpiOverview {
    pub generated_at: Ms,
    pub users_students: usize,
    pub users_teachers: usize,
    pub users_admins: usize,
    pub bookings_hold: usize,
    pub bookings_confirmed: usize,
    pub bookings_canceled: usize,
    pub bookings_expired: usize,
    pub lessons_scheduled: usize,
    pub lessons_completed: usize,
    pub lessons_canceled: usize,
    pub payments_pending: usize,
    pub payments_succeeded: usize,
    pub payments_failed: usize,
    pub payments_refunded: usize,
    pub payments_succeeded_cents: i64,
    pub payments_refunded_cents: i64,
    pub packages_active: usize,
    pub packages_expired: usize,
    pub packages_canceled: usize,
}

impl KpiOverview {
    pub fn users_total(&self) -> usize {
        self.users_students + self.users_teachers + self.users_admins
    }

    pub fn bookings_total(&self) -> usize {
        self.bookings_hold + self.bookings_confirmed + self.bookings_canceled + self.bookings_expired
    }

    pub fn payments_net_cents(&self) -> i64 {
        self.payments_succeeded_cents.saturating_sub(self.payments_refunded_cents)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationsOverview {
    pub generated_at: Ms,
    pub max_retries: u32,
    pub outbox_pending: usize,
    pub outbox_failed_retryable: usize,
    pub outbox_failed_dead_letter: usize,
    pub notifications_failed: usize,
    pub stale_booking_holds: usize,
    pub overdue_active_packages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMetrics {
    pub notifications_pending: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub outbox_pending: usize,
    pub outbox_processed: usize,
    pub outbox_failed: usize,
    pub outbox_retryable_failed: usize,
    pub outbox_dead_letter: usize,
    pub max_retries: u32,
}

impl DeliveryMetrics {
    pub fn notifications_total(&self) -> usize {
        self.notifications_pending + self.notifications_sent + self.notifications_failed
    }

    pub fn outbox_total(&self) -> usize {
        self.outbox_pending + self.outbox_processed + self.outbox_failed
    }
}

/// Counters from one outbox worker cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub requeued: usize,
    pub processed: usize,
    pub failed: usize,
    pub dispatched: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn labels_parse_case_insensitive() {
        assert_eq!(Role::parse("TEACHER"), Some(Role::Teacher));
        assert_eq!(BookingStatus::parse(" Confirmed "), Some(BookingStatus::Confirmed));
        assert_eq!(PaymentStatus::parse("refunded"), Some(PaymentStatus::Refunded));
        assert_eq!(LessonStatus::parse("done"), None);
        assert_eq!(SlotStatus::Booked.to_string(), "booked");
    }

    #[test]
    fn payment_transitions() {
        assert!(PaymentStatus::Pending.allowed_next().contains(&PaymentStatus::Succeeded));
        assert!(PaymentStatus::Failed.allowed_next().contains(&PaymentStatus::Pending));
        assert!(!PaymentStatus::Pending.allowed_next().contains(&PaymentStatus::Refunded));
        assert!(PaymentStatus::Refunded.allowed_next().is_empty());
    }

    #[test]
    fn hold_lapse_boundary() {
        let booking = Booking {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            student_id: Ulid::new(),
            teacher_id: Ulid::new(),
            package_id: Ulid::new(),
            status: BookingStatus::Hold,
            hold_expires_at: Some(1_000),
            confirmed_at: None,
            canceled_at: None,
            cancellation_reason: None,
            refund_returned: false,
            rescheduled_from: None,
            created_at: 0,
        };
        assert!(!booking.hold_lapsed(999));
        assert!(booking.hold_lapsed(1_000));

        let confirmed = Booking { status: BookingStatus::Confirmed, ..booking };
        assert!(!confirmed.hold_lapsed(5_000));
    }

    #[test]
    fn domain_event_names_and_aggregates() {
        let id = Ulid::new();
        let ev = DomainEvent::PackageExpired { package_id: id, student_id: Ulid::new() };
        assert_eq!(ev.event_type(), "billing.package.expired");
        assert_eq!(ev.aggregate(), ("billing", id));

        let json: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(json["event_type"], "billing.package.expired");
        assert_eq!(json["package_id"], id.to_string());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::OutboxAppended {
            id: Ulid::new(),
            payload: DomainEvent::BookingCanceled {
                booking_id: Ulid::new(),
                student_id: Ulid::new(),
                slot_id: Ulid::new(),
                refund_returned: true,
            },
            at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
