use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{clean_optional, paginate, require_admin, require_booking_party};
use super::txn::Txn;
use super::{Engine, EngineError};

pub const RESCHEDULE_REASON: &str = "Rescheduled by user";
pub const HOLD_EXPIRED: &str = "hold has expired";

fn record_transition(transition: &'static str, n: usize) {
    if n > 0 {
        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "transition" => transition)
            .increment(n as u64);
    }
}

fn check_package_usable(package: &LessonPackage, now: Ms) -> Result<(), EngineError> {
    if package.status != PackageStatus::Active {
        return Err(EngineError::rule(format!("package is {}", package.status)));
    }
    if package.expires_at <= now {
        return Err(EngineError::rule("package has expired"));
    }
    if package.lessons_left == 0 {
        return Err(EngineError::rule("no lessons left in package"));
    }
    Ok(())
}

/// HOLD → EXPIRED, re-opening the slot if it is still held.
fn expire_in(tx: &mut Txn<'_>, booking: &Booking) {
    tx.push(Event::BookingExpired { id: booking.id });
    let reopen = tx
        .slot(&booking.slot_id)
        .is_some_and(|s| s.status == SlotStatus::Hold);
    if reopen {
        tx.push(Event::SlotStatusSet { id: booking.slot_id, status: SlotStatus::Open });
    }
    tx.emit(DomainEvent::BookingHoldExpired { booking_id: booking.id, slot_id: booking.slot_id });
}

/// Expire every HOLD whose expiry has passed. Returns the booking ids.
pub(super) fn expire_lapsed_holds(tx: &mut Txn<'_>) -> Vec<Ulid> {
    let now = tx.now();
    let mut lapsed: Vec<Booking> = tx.bookings().filter(|b| b.hold_lapsed(now)).cloned().collect();
    lapsed.sort_by_key(|b| b.id);
    for booking in &lapsed {
        expire_in(tx, booking);
    }
    lapsed.into_iter().map(|b| b.id).collect()
}

fn hold_in(
    tx: &mut Txn<'_>,
    student_id: Ulid,
    id: Ulid,
    slot_id: Ulid,
    package_id: Ulid,
) -> Result<Booking, EngineError> {
    let now = tx.now();
    let slot = tx.require_slot(slot_id)?;
    if slot.status == SlotStatus::Hold {
        // A lapsed hold the reaper has not reached yet does not block the slot.
        let stale: Vec<Booking> = tx
            .bookings_for_slot(&slot_id)
            .into_iter()
            .filter(|b| b.hold_lapsed(now))
            .cloned()
            .collect();
        for booking in &stale {
            expire_in(tx, booking);
        }
    }
    let slot = tx.require_slot(slot_id)?;
    if slot.status != SlotStatus::Open {
        return Err(EngineError::conflict(format!("slot is {}", slot.status)));
    }
    if slot.span.start <= now {
        return Err(EngineError::rule("slot has already started"));
    }

    let package = tx.require_package(package_id)?;
    if package.student_id != student_id {
        return Err(EngineError::Forbidden("package belongs to another student"));
    }
    check_package_usable(&package, now)?;

    let hold_expires_at = now + tx.policy().booking.hold_ms;
    tx.push(Event::BookingHeld {
        id,
        slot_id,
        student_id,
        teacher_id: slot.teacher_id,
        package_id,
        hold_expires_at,
        at: now,
    });
    tx.push(Event::SlotStatusSet { id: slot_id, status: SlotStatus::Hold });
    tx.emit(DomainEvent::BookingHoldCreated { booking_id: id, slot_id, student_id });
    tx.require_booking(id)
}

fn confirm_in(tx: &mut Txn<'_>, id: Ulid) -> Result<Booking, EngineError> {
    let now = tx.now();
    let booking = tx.require_booking(id)?;
    match booking.status {
        BookingStatus::Confirmed => return Ok(booking),
        BookingStatus::Hold => {}
        other => return Err(EngineError::conflict(format!("booking is {other}"))),
    }
    if booking.hold_lapsed(now) {
        expire_in(tx, &booking);
        tx.commit_on_error();
        return Err(EngineError::rule(HOLD_EXPIRED));
    }

    let package = tx.require_package(booking.package_id)?;
    check_package_usable(&package, now)?;
    let slot = tx.require_slot(booking.slot_id)?;

    tx.push(Event::PackageLessonConsumed { id: package.id });
    tx.push(Event::BookingConfirmed { id, at: now });
    tx.push(Event::SlotStatusSet { id: slot.id, status: SlotStatus::Booked });
    tx.emit(DomainEvent::BookingConfirmed {
        booking_id: id,
        student_id: booking.student_id,
        slot_id: slot.id,
    });

    if tx.lesson_for_booking(&id).is_none() {
        let lesson_id = tx.next_id();
        tx.push(Event::LessonCreated {
            id: lesson_id,
            booking_id: id,
            student_id: booking.student_id,
            teacher_id: booking.teacher_id,
            span: slot.span,
            at: now,
        });
        tx.emit(DomainEvent::LessonCreated {
            lesson_id,
            booking_id: id,
            student_id: booking.student_id,
            teacher_id: booking.teacher_id,
        });
    }
    tx.require_booking(id)
}

fn cancel_in(tx: &mut Txn<'_>, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
    let now = tx.now();
    let booking = tx.require_booking(id)?;
    match booking.status {
        BookingStatus::Canceled => return Ok(booking),
        BookingStatus::Expired => return Err(EngineError::conflict("booking has expired")),
        BookingStatus::Hold | BookingStatus::Confirmed => {}
    }
    let slot = tx.require_slot(booking.slot_id)?;

    let mut refund_returned = false;
    if booking.status == BookingStatus::Confirmed
        && slot.span.start - now > tx.policy().booking.refund_window_ms
    {
        let package = tx.require_package(booking.package_id)?;
        if package.lessons_left < package.lessons_total {
            tx.push(Event::PackageLessonReturned { id: package.id });
            refund_returned = true;
        }
    }

    tx.push(Event::BookingCanceled {
        id,
        reason: reason.clone(),
        refund_returned,
        at: now,
    });
    if slot.span.start > now && slot.status != SlotStatus::Canceled {
        tx.push(Event::SlotStatusSet { id: slot.id, status: SlotStatus::Open });
    }
    tx.emit(DomainEvent::BookingCanceled {
        booking_id: id,
        student_id: booking.student_id,
        slot_id: slot.id,
        refund_returned,
    });

    if let Some(lesson) = tx.lesson_for_booking(&id).cloned()
        && lesson.status != LessonStatus::Canceled
    {
        tx.push(Event::LessonUpdated {
            id: lesson.id,
            status: LessonStatus::Canceled,
            topic: lesson.topic.clone(),
            notes: lesson.notes.clone(),
        });
        tx.emit(DomainEvent::LessonCanceled {
            lesson_id: lesson.id,
            booking_id: id,
            student_id: lesson.student_id,
            teacher_id: lesson.teacher_id,
            reason,
        });
    }
    tx.require_booking(id)
}

impl Engine {
    /// Place a HOLD on an open slot against one of the student's packages.
    ///
    /// Repeating the request with the same booking id, slot and package
    /// returns the existing booking.
    pub async fn hold_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        slot_id: Ulid,
        package_id: Ulid,
    ) -> Result<Booking, EngineError> {
        if actor.role != Role::Student {
            return Err(EngineError::Forbidden("only students hold slots"));
        }
        let (booking, changed) = self
            .transact(|tx| {
                if let Some(existing) = tx.booking(&id) {
                    if existing.student_id == actor.id
                        && existing.slot_id == slot_id
                        && existing.package_id == package_id
                    {
                        return Ok((existing.clone(), false));
                    }
                    return Err(EngineError::conflict(format!(
                        "booking {id} already exists for a different request"
                    )));
                }
                hold_in(tx, actor.id, id, slot_id, package_id).map(|b| (b, true))
            })
            .await?;
        if changed {
            record_transition("hold", 1);
        }
        Ok(booking)
    }

    /// HOLD → CONFIRMED, consuming one lesson and scheduling the lesson.
    /// A lapsed hold is expired (and that is committed) before the error is returned.
    pub async fn confirm_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let result = self
            .transact(|tx| {
                let booking = tx.require_booking(id)?;
                require_booking_party(actor, &booking)?;
                let before = booking.status;
                let confirmed = confirm_in(tx, id)?;
                Ok((confirmed, before == BookingStatus::Hold))
            })
            .await;
        match result {
            Ok((booking, changed)) => {
                if changed {
                    record_transition("confirm", 1);
                }
                Ok(booking)
            }
            Err(e) => {
                if matches!(&e, EngineError::BusinessRule(msg) if msg == HOLD_EXPIRED) {
                    record_transition("expire", 1);
                }
                Err(e)
            }
        }
    }

    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<&str>,
    ) -> Result<Booking, EngineError> {
        let reason = clean_optional(reason, MAX_REASON_LEN, "reason")?;
        let (booking, changed) = self
            .transact(|tx| {
                let booking = tx.require_booking(id)?;
                require_booking_party(actor, &booking)?;
                let before = booking.status;
                let canceled = cancel_in(tx, id, reason)?;
                Ok((canceled, before != BookingStatus::Canceled))
            })
            .await?;
        if changed {
            record_transition("cancel", 1);
            tracing::debug!("booking {id} canceled, refund_returned={}", booking.refund_returned);
        }
        Ok(booking)
    }

    /// Cancel `id` and book `new_slot_id` on the same package, atomically.
    pub async fn reschedule_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        new_booking_id: Ulid,
        new_slot_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let (booking, changed) = self
            .transact(|tx| {
                let old = tx.require_booking(id)?;
                if !actor.is_admin() && actor.id != old.student_id {
                    return Err(EngineError::Forbidden("only the student or an admin reschedules"));
                }
                if let Some(existing) = tx.booking(&new_booking_id) {
                    if existing.rescheduled_from == Some(id) && existing.slot_id == new_slot_id {
                        return Ok((existing.clone(), false));
                    }
                    return Err(EngineError::AlreadyExists(new_booking_id));
                }
                if !matches!(old.status, BookingStatus::Hold | BookingStatus::Confirmed) {
                    return Err(EngineError::conflict(format!("booking is {}", old.status)));
                }
                // The cancel re-opens the old slot, so moving onto it again is allowed.
                cancel_in(tx, id, Some(RESCHEDULE_REASON.to_string()))?;
                hold_in(tx, old.student_id, new_booking_id, new_slot_id, old.package_id)?;
                tx.push(Event::BookingRescheduled { id: new_booking_id, from: id });
                let booking = confirm_in(tx, new_booking_id)?;
                tx.emit(DomainEvent::BookingRescheduled {
                    new_booking_id,
                    old_booking_id: id,
                    student_id: old.student_id,
                });
                Ok((booking, true))
            })
            .await?;
        if changed {
            record_transition("reschedule", 1);
        }
        Ok(booking)
    }

    /// Expire lapsed holds and re-open their slots.
    pub async fn expire_holds(&self, actor: &Actor) -> Result<Vec<Ulid>, EngineError> {
        require_admin(actor)?;
        let expired = self.transact(|tx| Ok(expire_lapsed_holds(tx))).await?;
        record_transition("expire", expired.len());
        if !expired.is_empty() {
            tracing::info!("expired {} booking holds", expired.len());
        }
        Ok(expired)
    }

    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let ledger = self.read().await;
        let booking = ledger.bookings.get(&id).ok_or(EngineError::NotFound("booking", id))?;
        require_booking_party(actor, booking)?;
        Ok(booking.clone())
    }

    /// Newest first. Admins see every booking, others the ones they take part in.
    pub async fn list_bookings(&self, actor: &Actor, page: &PageRequest) -> Result<Page<Booking>, EngineError> {
        let ledger = self.read().await;
        let mut bookings: Vec<Booking> = ledger
            .bookings
            .values()
            .filter(|b| actor.is_admin() || b.student_id == actor.id || b.teacher_id == actor.id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        paginate(bookings, page)
    }
}
