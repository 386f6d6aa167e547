use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{clean_optional, paginate, require_self_or_admin};
use super::{Engine, EngineError};

/// Partial lesson update; `None` leaves a field as it is, `Some("")` clears text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonChanges {
    pub status: Option<LessonStatus>,
    pub topic: Option<String>,
    pub notes: Option<String>,
}

impl Engine {
    /// Record what happened in a lesson. Admins or the lesson's teacher.
    pub async fn update_lesson(&self, actor: &Actor, id: Ulid, changes: LessonChanges) -> Result<Lesson, EngineError> {
        let topic = match changes.topic.as_deref() {
            Some(t) => Some(clean_optional(Some(t), MAX_NAME_LEN, "topic")?),
            None => None,
        };
        let notes = match changes.notes.as_deref() {
            Some(n) => Some(clean_optional(Some(n), MAX_TEXT_LEN, "notes")?),
            None => None,
        };

        self.transact(|tx| {
            let lesson = tx.require_lesson(id)?;
            require_self_or_admin(actor, lesson.teacher_id)?;

            let status = changes.status.unwrap_or(lesson.status);
            if lesson.status == LessonStatus::Canceled && status != LessonStatus::Canceled {
                return Err(EngineError::conflict("lesson is canceled"));
            }
            let topic = topic.unwrap_or_else(|| lesson.topic.clone());
            let notes = notes.unwrap_or_else(|| lesson.notes.clone());
            if status == lesson.status && topic == lesson.topic && notes == lesson.notes {
                return Ok(lesson);
            }

            tx.push(Event::LessonUpdated { id, status, topic, notes });
            if status == LessonStatus::Canceled && lesson.status != LessonStatus::Canceled {
                tx.emit(DomainEvent::LessonCanceled {
                    lesson_id: id,
                    booking_id: lesson.booking_id,
                    student_id: lesson.student_id,
                    teacher_id: lesson.teacher_id,
                    reason: None,
                });
            }
            tx.require_lesson(id)
        })
        .await
    }

    /// By scheduled start. Admins see every lesson, others their own.
    pub async fn list_lessons(&self, actor: &Actor, page: &PageRequest) -> Result<Page<Lesson>, EngineError> {
        let ledger = self.read().await;
        let mut lessons: Vec<Lesson> = ledger
            .lessons
            .values()
            .filter(|l| actor.is_admin() || l.student_id == actor.id || l.teacher_id == actor.id)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| (l.span.start, l.id));
        paginate(lessons, page)
    }

    pub async fn lesson_for_booking(&self, booking_id: Ulid) -> Option<Lesson> {
        let ledger = self.read().await;
        let id = ledger.lesson_by_booking.get(&booking_id)?;
        ledger.lessons.get(id).cloned()
    }
}
