use ulid::Ulid;

use crate::model::*;

use super::access::{paginate, require_self_or_admin, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Publish a bookable window for a teacher. Admins may create slots for
    /// any teacher, teachers for themselves.
    pub async fn create_slot(
        &self,
        actor: &Actor,
        id: Ulid,
        teacher_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Slot, EngineError> {
        require_self_or_admin(actor, teacher_id)?;
        if end <= start {
            return Err(EngineError::invalid("slot must end after it starts"));
        }
        let span = Span::new(start, end);
        validate_span(&span)?;

        self.transact(|tx| {
            if tx.slot(&id).is_some() {
                return Err(EngineError::AlreadyExists(id));
            }
            if span.start <= tx.now() {
                return Err(EngineError::rule("slot must start in the future"));
            }
            let teacher = tx.require_user(teacher_id)?;
            if teacher.role != Role::Teacher || !teacher.active {
                return Err(EngineError::rule("slots belong to active teachers"));
            }
            if let Some(clash) = tx
                .slots_of_teacher(&teacher_id)
                .into_iter()
                .find(|s| s.status != SlotStatus::Canceled && s.span.overlaps(&span))
            {
                return Err(EngineError::conflict(format!("overlaps slot {}", clash.id)));
            }
            let at = tx.now();
            tx.push(Event::SlotCreated {
                id,
                teacher_id,
                created_by: actor.id,
                span,
                at,
            });
            tx.require_slot(id)
        })
        .await
    }

    /// Withdraw an OPEN slot.
    pub async fn cancel_slot(&self, actor: &Actor, id: Ulid) -> Result<Slot, EngineError> {
        self.transact(|tx| {
            let slot = tx.require_slot(id)?;
            require_self_or_admin(actor, slot.teacher_id)?;
            match slot.status {
                SlotStatus::Canceled => return Ok(slot),
                SlotStatus::Open => {}
                other => return Err(EngineError::conflict(format!("slot is {other}"))),
            }
            tx.push(Event::SlotStatusSet { id, status: SlotStatus::Canceled });
            tx.require_slot(id)
        })
        .await
    }

    /// Future OPEN slots by start time, optionally for one teacher.
    pub async fn list_open_slots(
        &self,
        teacher_id: Option<Ulid>,
        page: &PageRequest,
    ) -> Result<Page<Slot>, EngineError> {
        let now = self.now();
        let ledger = self.read().await;
        let mut slots: Vec<Slot> = match teacher_id {
            Some(t) => ledger
                .slots_by_teacher
                .get(&t)
                .into_iter()
                .flatten()
                .filter_map(|id| ledger.slots.get(id))
                .cloned()
                .collect(),
            None => ledger.slots.values().cloned().collect(),
        };
        slots.retain(|s| s.status == SlotStatus::Open && s.span.start > now);
        slots.sort_by_key(|s| (s.span.start, s.id));
        paginate(slots, page)
    }

    pub async fn get_slot(&self, id: Ulid) -> Option<Slot> {
        self.read().await.slots.get(&id).cloned()
    }
}
