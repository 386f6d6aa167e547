use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{clean_text, normalize_email, require_admin, require_self_or_admin};
use super::{Engine, EngineError};

impl Engine {
    /// Register an account with the password it will log in with. Without an
    /// actor only students may sign up; an admin may create any role.
    pub async fn register_user(
        &self,
        actor: Option<&Actor>,
        id: Ulid,
        email: &str,
        role: Role,
        display_name: &str,
        password: &str,
    ) -> Result<User, EngineError> {
        match actor {
            None if role != Role::Student => {
                return Err(EngineError::Forbidden("self sign-up is limited to students"));
            }
            Some(a) if !a.is_admin() => {
                return Err(EngineError::Forbidden("only admins register other users"));
            }
            _ => {}
        }
        let email = normalize_email(email)?;
        let display_name = clean_text(display_name, MAX_NAME_LEN, "display name")?;
        let chars = password.chars().count();
        if chars < MIN_PASSWORD_LEN {
            return Err(EngineError::invalid(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        if chars > MAX_PASSWORD_LEN {
            return Err(EngineError::LimitExceeded("password too long"));
        }
        let credential = Credential::new(password);

        self.transact(|tx| {
            if tx.user(&id).is_some() {
                return Err(EngineError::AlreadyExists(id));
            }
            if tx.user_by_email(&email).is_some() {
                return Err(EngineError::conflict(format!("email already registered: {email}")));
            }
            let at = tx.now();
            tx.push(Event::UserRegistered {
                id,
                email: email.clone(),
                role,
                display_name: display_name.clone(),
                credential,
                at,
            });
            tx.audit(
                actor,
                "identity.user.registered",
                "user",
                Some(id.to_string()),
                json!({ "email": email, "role": role.as_str() }),
            );
            tx.require_user(id)
        })
        .await
    }

    pub async fn set_user_active(&self, actor: &Actor, id: Ulid, active: bool) -> Result<User, EngineError> {
        require_admin(actor)?;
        self.transact(|tx| {
            let user = tx.require_user(id)?;
            if user.active == active {
                return Ok(user);
            }
            tx.push(Event::UserActiveSet { id, active });
            tx.audit(
                Some(actor),
                if active { "identity.user.activated" } else { "identity.user.deactivated" },
                "user",
                Some(id.to_string()),
                json!({ "active": active }),
            );
            tx.require_user(id)
        })
        .await
    }

    /// The acting identity for a logged-in user id.
    pub async fn resolve_actor(&self, id: Ulid) -> Result<Actor, EngineError> {
        let ledger = self.read().await;
        let user = ledger.users.get(&id).ok_or(EngineError::NotFound("user", id))?;
        if !user.active {
            return Err(EngineError::Forbidden("account is deactivated"));
        }
        Ok(Actor::new(user.id, user.role))
    }

    /// Login verifier of an active user. Deactivated accounts cannot log in.
    pub async fn credential(&self, id: Ulid) -> Option<Credential> {
        let ledger = self.read().await;
        ledger.users.get(&id).filter(|u| u.active).map(|u| u.credential.clone())
    }

    /// A user's own record, or any record for an admin.
    pub async fn get_user(&self, actor: &Actor, id: Ulid) -> Result<User, EngineError> {
        require_self_or_admin(actor, id)?;
        let ledger = self.read().await;
        ledger.users.get(&id).cloned().ok_or(EngineError::NotFound("user", id))
    }
}
