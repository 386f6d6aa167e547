//! Outbox relay: turns committed domain events into user notifications.
//!
//! Each cycle first re-queues FAILED rows whose backoff has elapsed, then
//! handles a batch of PENDING rows oldest first. Everything a cycle changes
//! commits as one transaction; notifications are published to the in-process
//! hub only after that commit.

use ulid::Ulid;

use crate::model::*;

use super::access::{paginate, require_admin};
use super::txn::Txn;
use super::{Engine, EngineError};

pub const CHANNEL_IN_APP: &str = "in_app";

struct Message {
    user_id: Ulid,
    title: String,
    body: String,
}

impl Message {
    fn new(user_id: Ulid, title: &str, body: String) -> Self {
        Self { user_id, title: title.to_string(), body }
    }
}

fn recipient(tx: &Txn<'_>, user_id: Ulid) -> Result<Ulid, String> {
    match tx.user(&user_id) {
        Some(u) => Ok(u.id),
        None => Err(format!("recipient {user_id} not found")),
    }
}

/// Notifications owed for one event. An error marks the row FAILED.
fn build_messages(tx: &Txn<'_>, event: &DomainEvent) -> Result<Vec<Message>, String> {
    let messages = match event {
        DomainEvent::BookingHoldCreated { .. }
        | DomainEvent::BookingHoldExpired { .. }
        | DomainEvent::PaymentCreated { .. } => Vec::new(),
        DomainEvent::BookingConfirmed { booking_id, student_id, .. } => vec![Message::new(
            recipient(tx, *student_id)?,
            "Booking confirmed",
            format!("Your booking {booking_id} is confirmed."),
        )],
        DomainEvent::BookingCanceled { booking_id, student_id, refund_returned, .. } => {
            let outcome = if *refund_returned {
                "The lesson was returned to your package."
            } else {
                "The lesson was not returned to your package."
            };
            vec![Message::new(
                recipient(tx, *student_id)?,
                "Booking canceled",
                format!("Your booking {booking_id} was canceled. {outcome}"),
            )]
        }
        DomainEvent::BookingRescheduled { new_booking_id, old_booking_id, student_id } => vec![Message::new(
            recipient(tx, *student_id)?,
            "Booking rescheduled",
            format!("Your booking {old_booking_id} was moved to booking {new_booking_id}."),
        )],
        DomainEvent::LessonCreated { lesson_id, student_id, teacher_id, .. } => {
            let mut out = Vec::new();
            for user_id in participants(*student_id, *teacher_id) {
                out.push(Message::new(
                    recipient(tx, user_id)?,
                    "Lesson scheduled",
                    format!("Lesson {lesson_id} is scheduled."),
                ));
            }
            out
        }
        DomainEvent::LessonCanceled { lesson_id, student_id, teacher_id, reason, .. } => {
            let body = match reason {
                Some(r) => format!("Lesson {lesson_id} was canceled: {r}"),
                None => format!("Lesson {lesson_id} was canceled."),
            };
            let mut out = Vec::new();
            for user_id in participants(*student_id, *teacher_id) {
                out.push(Message::new(recipient(tx, user_id)?, "Lesson canceled", body.clone()));
            }
            out
        }
        DomainEvent::PackageCreated { package_id, student_id, lessons_total } => vec![Message::new(
            recipient(tx, *student_id)?,
            "Lesson package created",
            format!("Your package {package_id} with {lessons_total} lessons is active."),
        )],
        DomainEvent::PackageExpired { package_id, student_id } => vec![Message::new(
            recipient(tx, *student_id)?,
            "Lesson package expired",
            format!("Your package {package_id} has expired."),
        )],
        DomainEvent::PaymentStatusUpdated { payment_id, from_status, to_status } => {
            let payment = tx
                .payment(payment_id)
                .ok_or_else(|| format!("payment {payment_id} not found"))?;
            let package = tx
                .package(&payment.package_id)
                .ok_or_else(|| format!("package {} not found", payment.package_id))?;
            vec![Message::new(
                recipient(tx, package.student_id)?,
                "Payment status updated",
                format!("Payment {payment_id} moved from {from_status} to {to_status}."),
            )]
        }
    };
    Ok(messages)
}

/// Student first, teacher second, once each.
fn participants(student_id: Ulid, teacher_id: Ulid) -> Vec<Ulid> {
    if student_id == teacher_id {
        vec![student_id]
    } else {
        vec![student_id, teacher_id]
    }
}

/// One relay cycle. Returns the counters and the notifications it delivered.
pub(super) fn run_cycle(tx: &mut Txn<'_>) -> (OutboxStats, Vec<Notification>) {
    let now = tx.now();
    let policy = tx.policy().outbox;
    let mut stats = OutboxStats::default();
    let mut delivered = Vec::new();

    let due: Vec<Ulid> = tx
        .outbox()
        .filter(|o| {
            o.status == OutboxStatus::Failed
                && o.retries < policy.max_retries
                && now - o.updated_at >= policy.backoff_ms(o.retries)
        })
        .map(|o| o.id)
        .collect();
    for id in due {
        tx.push(Event::OutboxRequeued { id, at: now });
        stats.requeued += 1;
    }

    let batch: Vec<OutboxEvent> = tx
        .outbox()
        .filter(|o| o.status == OutboxStatus::Pending)
        .take(policy.batch_size)
        .cloned()
        .collect();
    for row in batch {
        match build_messages(tx, &row.payload) {
            Ok(messages) => {
                for m in messages {
                    let id = tx.next_id();
                    tx.push(Event::NotificationCreated {
                        id,
                        user_id: m.user_id,
                        channel: CHANNEL_IN_APP.to_string(),
                        title: m.title,
                        body: m.body,
                        at: now,
                    });
                    tx.push(Event::NotificationStatusSet { id, status: NotificationStatus::Sent, at: now });
                    if let Some(n) = tx.notification(&id) {
                        delivered.push(n.clone());
                    }
                }
                tx.push(Event::OutboxProcessed { id: row.id, at: now });
                stats.processed += 1;
            }
            Err(error) => {
                tracing::warn!("outbox event {} ({}) failed: {error}", row.id, row.payload.event_type());
                tx.push(Event::OutboxFailed { id: row.id, error, at: now });
                stats.failed += 1;
            }
        }
    }
    stats.dispatched = delivered.len();
    (stats, delivered)
}

impl Engine {
    /// Run one relay cycle now. Admin-triggered counterpart of the background worker.
    pub async fn process_outbox(&self, actor: &Actor) -> Result<OutboxStats, EngineError> {
        require_admin(actor)?;
        self.run_outbox_cycle().await
    }

    pub async fn run_outbox_cycle(&self) -> Result<OutboxStats, EngineError> {
        let (stats, delivered) = self.transact(|tx| Ok(run_cycle(tx))).await?;
        self.publish(&delivered);

        use crate::observability::*;
        metrics::counter!(OUTBOX_EVENTS_TOTAL, "outcome" => "requeued").increment(stats.requeued as u64);
        metrics::counter!(OUTBOX_EVENTS_TOTAL, "outcome" => "processed").increment(stats.processed as u64);
        metrics::counter!(OUTBOX_EVENTS_TOTAL, "outcome" => "failed").increment(stats.failed as u64);
        metrics::counter!(NOTIFICATIONS_SENT_TOTAL).increment(stats.dispatched as u64);
        if stats != OutboxStats::default() {
            tracing::debug!(
                "outbox cycle: requeued={} processed={} failed={} dispatched={}",
                stats.requeued,
                stats.processed,
                stats.failed,
                stats.dispatched
            );
        }
        Ok(stats)
    }

    /// The actor's own notifications, newest first.
    pub async fn list_my_notifications(
        &self,
        actor: &Actor,
        page: &PageRequest,
    ) -> Result<Page<Notification>, EngineError> {
        let ledger = self.read().await;
        let mine: Vec<Notification> = ledger
            .notifications
            .values()
            .rev()
            .filter(|n| n.user_id == actor.id)
            .cloned()
            .collect();
        paginate(mine, page)
    }

    /// Outbox rows for one aggregate, oldest first.
    pub async fn outbox_for(&self, actor: &Actor, aggregate_id: Ulid) -> Result<Vec<OutboxEvent>, EngineError> {
        require_admin(actor)?;
        let ledger = self.read().await;
        Ok(ledger
            .outbox
            .values()
            .filter(|o| o.payload.aggregate().1 == aggregate_id)
            .cloned()
            .collect())
    }
}
