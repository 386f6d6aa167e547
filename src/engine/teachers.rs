use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{clean_optional, clean_text, paginate, require_self_or_admin};
use super::{Engine, EngineError};

/// Partial update of a teacher profile; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileChanges {
    pub display_name: Option<String>,
    /// `Some("")` clears the bio.
    pub bio: Option<String>,
    pub experience_years: Option<u32>,
    pub approved: Option<bool>,
}

fn check_experience(years: u32) -> Result<(), EngineError> {
    if years > MAX_EXPERIENCE_YEARS {
        return Err(EngineError::LimitExceeded("experience_years too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_teacher_profile(
        &self,
        actor: &Actor,
        id: Ulid,
        user_id: Ulid,
        display_name: &str,
        bio: Option<&str>,
        experience_years: u32,
    ) -> Result<TeacherProfile, EngineError> {
        require_self_or_admin(actor, user_id)?;
        let display_name = clean_text(display_name, MAX_NAME_LEN, "display name")?;
        let bio = clean_optional(bio, MAX_TEXT_LEN, "bio")?;
        check_experience(experience_years)?;

        self.transact(|tx| {
            if tx.profile(&id).is_some() {
                return Err(EngineError::AlreadyExists(id));
            }
            let user = tx.require_user(user_id)?;
            if user.role != Role::Teacher {
                return Err(EngineError::rule("profile owner must have the teacher role"));
            }
            if tx.profile_for_user(&user_id).is_some() {
                return Err(EngineError::conflict("teacher already has a profile"));
            }
            let at = tx.now();
            tx.push(Event::ProfileCreated {
                id,
                user_id,
                display_name: display_name.clone(),
                bio: bio.clone(),
                experience_years,
                at,
            });
            tx.audit(
                Some(actor),
                "teachers.profile.created",
                "teacher_profile",
                Some(id.to_string()),
                json!({ "user_id": user_id.to_string() }),
            );
            tx.require_profile(id)
        })
        .await
    }

    pub async fn update_teacher_profile(
        &self,
        actor: &Actor,
        id: Ulid,
        changes: ProfileChanges,
    ) -> Result<TeacherProfile, EngineError> {
        if changes.approved.is_some() && !actor.is_admin() {
            return Err(EngineError::Forbidden("only admins approve teachers"));
        }
        if let Some(years) = changes.experience_years {
            check_experience(years)?;
        }
        let display_name = match changes.display_name.as_deref() {
            Some(name) => Some(clean_text(name, MAX_NAME_LEN, "display name")?),
            None => None,
        };
        let bio = match changes.bio.as_deref() {
            Some(text) => Some(clean_optional(Some(text), MAX_TEXT_LEN, "bio")?),
            None => None,
        };

        self.transact(|tx| {
            let current = tx.require_profile(id)?;
            require_self_or_admin(actor, current.user_id)?;

            let next = TeacherProfile {
                display_name: display_name.unwrap_or_else(|| current.display_name.clone()),
                bio: bio.unwrap_or_else(|| current.bio.clone()),
                experience_years: changes.experience_years.unwrap_or(current.experience_years),
                approved: changes.approved.unwrap_or(current.approved),
                ..current.clone()
            };
            if next == current {
                return Ok(current);
            }
            tx.push(Event::ProfileUpdated {
                id,
                display_name: next.display_name.clone(),
                bio: next.bio.clone(),
                experience_years: next.experience_years,
                approved: next.approved,
            });
            tx.audit(
                Some(actor),
                "teachers.profile.updated",
                "teacher_profile",
                Some(id.to_string()),
                json!({
                    "approved": next.approved,
                    "experience_years": next.experience_years,
                }),
            );
            Ok(next)
        })
        .await
    }

    /// Approved profiles, or every profile for an admin; ordered by display name.
    pub async fn list_teacher_profiles(
        &self,
        actor: Option<&Actor>,
        page: &PageRequest,
    ) -> Result<Page<TeacherProfile>, EngineError> {
        let show_all = actor.is_some_and(Actor::is_admin);
        let ledger = self.read().await;
        let mut profiles: Vec<TeacherProfile> = ledger
            .profiles
            .values()
            .filter(|p| show_all || p.approved)
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        paginate(profiles, page)
    }
}
