use serde_json::json;

use crate::model::*;

use super::access::{paginate, require_admin};
use super::ledger::Ledger;
use super::{Engine, EngineError};

fn kpis(ledger: &Ledger, now: Ms) -> KpiOverview {
    let mut k = KpiOverview {
        generated_at: now,
        ..KpiOverview::default()
    };
    for u in ledger.users.values() {
        match u.role {
            Role::Student => k.users_students += 1,
            Role::Teacher => k.users_teachers += 1,
            Role::Admin => k.users_admins += 1,
        }
    }
    for b in ledger.bookings.values() {
        match b.status {
            BookingStatus::Hold => k.bookings_hold += 1,
            BookingStatus::Confirmed => k.bookings_confirmed += 1,
            BookingStatus::Canceled => k.bookings_canceled += 1,
            BookingStatus::Expired => k.bookings_expired += 1,
        }
    }
    for l in ledger.lessons.values() {
        match l.status {
            LessonStatus::Scheduled => k.lessons_scheduled += 1,
            LessonStatus::Completed => k.lessons_completed += 1,
            LessonStatus::Canceled => k.lessons_canceled += 1,
        }
    }
    for p in ledger.payments.values() {
        match p.status {
            PaymentStatus::Pending => k.payments_pending += 1,
            PaymentStatus::Succeeded => {
                k.payments_succeeded += 1;
                k.payments_succeeded_cents = k.payments_succeeded_cents.saturating_add(p.amount_cents);
            }
            PaymentStatus::Failed => k.payments_failed += 1,
            PaymentStatus::Refunded => {
                k.payments_refunded += 1;
                k.payments_refunded_cents = k.payments_refunded_cents.saturating_add(p.amount_cents);
            }
        }
    }
    for p in ledger.packages.values() {
        match p.status {
            PackageStatus::Active => k.packages_active += 1,
            PackageStatus::Expired => k.packages_expired += 1,
            PackageStatus::Canceled => k.packages_canceled += 1,
        }
    }
    k
}

fn operations(ledger: &Ledger, now: Ms, max_retries: u32) -> OperationsOverview {
    let mut o = OperationsOverview {
        generated_at: now,
        max_retries,
        ..OperationsOverview::default()
    };
    for row in ledger.outbox.values() {
        match row.status {
            OutboxStatus::Pending => o.outbox_pending += 1,
            OutboxStatus::Failed if row.retries < max_retries => o.outbox_failed_retryable += 1,
            OutboxStatus::Failed => o.outbox_failed_dead_letter += 1,
            OutboxStatus::Processed => {}
        }
    }
    o.notifications_failed = ledger
        .notifications
        .values()
        .filter(|n| n.status == NotificationStatus::Failed)
        .count();
    o.stale_booking_holds = ledger.bookings.values().filter(|b| b.hold_lapsed(now)).count();
    o.overdue_active_packages = ledger
        .packages
        .values()
        .filter(|p| p.status == PackageStatus::Active && p.expires_at <= now)
        .count();
    o
}

fn delivery(ledger: &Ledger, max_retries: u32) -> DeliveryMetrics {
    let mut d = DeliveryMetrics {
        max_retries,
        ..DeliveryMetrics::default()
    };
    for n in ledger.notifications.values() {
        match n.status {
            NotificationStatus::Pending => d.notifications_pending += 1,
            NotificationStatus::Sent => d.notifications_sent += 1,
            NotificationStatus::Failed => d.notifications_failed += 1,
        }
    }
    for row in ledger.outbox.values() {
        match row.status {
            OutboxStatus::Pending => d.outbox_pending += 1,
            OutboxStatus::Processed => d.outbox_processed += 1,
            OutboxStatus::Failed => {
                d.outbox_failed += 1;
                if row.retries < max_retries {
                    d.outbox_retryable_failed += 1;
                } else {
                    d.outbox_dead_letter += 1;
                }
            }
        }
    }
    d
}

impl Engine {
    /// Marketplace-wide counts. Viewing is itself audited.
    pub async fn kpi_overview(&self, actor: &Actor) -> Result<KpiOverview, EngineError> {
        require_admin(actor)?;
        self.transact(|tx| {
            let overview = kpis(tx.base(), tx.now());
            tx.audit(
                Some(actor),
                "admin.kpi.view",
                "admin",
                None,
                json!({
                    "users_total": overview.users_total(),
                    "bookings_total": overview.bookings_total(),
                }),
            );
            Ok(overview)
        })
        .await
    }

    /// Backlogs an operator should watch. Viewing is itself audited.
    pub async fn operations_overview(&self, actor: &Actor, max_retries: u32) -> Result<OperationsOverview, EngineError> {
        require_admin(actor)?;
        self.transact(|tx| {
            let overview = operations(tx.base(), tx.now(), max_retries);
            tx.audit(
                Some(actor),
                "admin.ops.view",
                "admin",
                None,
                json!({
                    "outbox_pending": overview.outbox_pending,
                    "outbox_failed_dead_letter": overview.outbox_failed_dead_letter,
                }),
            );
            Ok(overview)
        })
        .await
    }

    pub async fn delivery_metrics(&self, actor: &Actor, max_retries: u32) -> Result<DeliveryMetrics, EngineError> {
        require_admin(actor)?;
        Ok(delivery(&*self.read().await, max_retries))
    }

    /// Newest first.
    pub async fn list_audit_log(&self, actor: &Actor, page: &PageRequest) -> Result<Page<AuditEntry>, EngineError> {
        require_admin(actor)?;
        let ledger = self.read().await;
        let entries: Vec<AuditEntry> = ledger.audit.values().rev().cloned().collect();
        paginate(entries, page)
    }
}
