use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::{clean_optional, paginate, require_admin, require_self_or_admin, validate_timestamp};
use super::txn::Txn;
use super::{Engine, EngineError};

fn normalize_currency(currency: &str) -> Result<String, EngineError> {
    let code = currency.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EngineError::invalid(format!("currency must be a 3-letter code: {currency:?}")));
    }
    Ok(code)
}

/// Expire every ACTIVE package whose expiry has passed. Returns the package ids.
pub(super) fn expire_due_packages(tx: &mut Txn<'_>, actor: Option<&Actor>) -> Vec<Ulid> {
    let now = tx.now();
    let mut due: Vec<(Ulid, Ulid)> = tx
        .packages()
        .filter(|p| p.status == PackageStatus::Active && p.expires_at <= now)
        .map(|p| (p.id, p.student_id))
        .collect();
    due.sort();
    for (id, student_id) in &due {
        tx.push(Event::PackageStatusSet { id: *id, status: PackageStatus::Expired });
        tx.audit(
            actor,
            "billing.package.expired",
            "lesson_package",
            Some(id.to_string()),
            json!({ "student_id": student_id.to_string() }),
        );
        tx.emit(DomainEvent::PackageExpired { package_id: *id, student_id: *student_id });
    }
    due.into_iter().map(|(id, _)| id).collect()
}

impl Engine {
    pub async fn create_package(
        &self,
        actor: &Actor,
        id: Ulid,
        student_id: Ulid,
        lessons_total: u32,
        expires_at: Ms,
    ) -> Result<LessonPackage, EngineError> {
        require_admin(actor)?;
        if lessons_total == 0 {
            return Err(EngineError::invalid("lessons_total must be positive"));
        }
        if lessons_total > MAX_LESSONS_PER_PACKAGE {
            return Err(EngineError::LimitExceeded("lessons_total too large"));
        }
        validate_timestamp(expires_at)?;

        self.transact(|tx| {
            if tx.package(&id).is_some() {
                return Err(EngineError::AlreadyExists(id));
            }
            if expires_at <= tx.now() {
                return Err(EngineError::rule("package must expire in the future"));
            }
            let student = tx.require_user(student_id)?;
            if student.role != Role::Student {
                return Err(EngineError::rule("packages belong to students"));
            }
            let at = tx.now();
            tx.push(Event::PackageCreated { id, student_id, lessons_total, expires_at, at });
            tx.audit(
                Some(actor),
                "billing.package.created",
                "lesson_package",
                Some(id.to_string()),
                json!({
                    "student_id": student_id.to_string(),
                    "lessons_total": lessons_total,
                    "expires_at": expires_at,
                }),
            );
            tx.emit(DomainEvent::PackageCreated { package_id: id, student_id, lessons_total });
            tx.require_package(id)
        })
        .await
    }

    pub async fn list_student_packages(
        &self,
        actor: &Actor,
        student_id: Ulid,
        page: &PageRequest,
    ) -> Result<Page<LessonPackage>, EngineError> {
        require_self_or_admin(actor, student_id)?;
        let ledger = self.read().await;
        let mut packages: Vec<LessonPackage> = ledger
            .packages
            .values()
            .filter(|p| p.student_id == student_id)
            .cloned()
            .collect();
        packages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        paginate(packages, page)
    }

    /// Mark overdue ACTIVE packages EXPIRED.
    pub async fn expire_packages(&self, actor: &Actor) -> Result<Vec<Ulid>, EngineError> {
        require_admin(actor)?;
        let expired = self.transact(|tx| Ok(expire_due_packages(tx, Some(actor)))).await?;
        if !expired.is_empty() {
            metrics::counter!(crate::observability::PACKAGES_EXPIRED_TOTAL).increment(expired.len() as u64);
            tracing::info!("expired {} lesson packages", expired.len());
        }
        Ok(expired)
    }

    pub async fn create_payment(
        &self,
        actor: &Actor,
        id: Ulid,
        package_id: Ulid,
        amount_cents: i64,
        currency: &str,
        external_reference: Option<&str>,
    ) -> Result<Payment, EngineError> {
        if amount_cents <= 0 {
            return Err(EngineError::invalid("amount must be positive"));
        }
        if amount_cents > MAX_AMOUNT_CENTS {
            return Err(EngineError::LimitExceeded("amount too large"));
        }
        let currency = normalize_currency(currency)?;
        let external_reference = clean_optional(external_reference, MAX_REFERENCE_LEN, "external reference")?;

        self.transact(|tx| {
            if tx.payment(&id).is_some() {
                return Err(EngineError::AlreadyExists(id));
            }
            let package = tx.require_package(package_id)?;
            require_self_or_admin(actor, package.student_id)?;
            let at = tx.now();
            tx.push(Event::PaymentCreated {
                id,
                package_id,
                amount_cents,
                currency: currency.clone(),
                external_reference: external_reference.clone(),
                at,
            });
            tx.audit(
                Some(actor),
                "billing.payment.created",
                "payment",
                Some(id.to_string()),
                json!({
                    "package_id": package_id.to_string(),
                    "amount_cents": amount_cents,
                    "currency": currency,
                }),
            );
            tx.emit(DomainEvent::PaymentCreated {
                payment_id: id,
                package_id,
                status: PaymentStatus::Pending,
            });
            tx.require_payment(id)
        })
        .await
    }

    pub async fn update_payment_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: PaymentStatus,
    ) -> Result<Payment, EngineError> {
        require_admin(actor)?;
        self.transact(|tx| {
            let payment = tx.require_payment(id)?;
            let from = payment.status;
            if from == status {
                return Ok(payment);
            }
            if !from.allowed_next().contains(&status) {
                return Err(EngineError::conflict(format!("payment cannot move from {from} to {status}")));
            }
            let paid_at = match status {
                PaymentStatus::Succeeded => payment.paid_at.or(Some(tx.now())),
                PaymentStatus::Refunded => payment.paid_at,
                PaymentStatus::Pending | PaymentStatus::Failed => None,
            };
            tx.push(Event::PaymentStatusSet { id, status, paid_at });
            tx.audit(
                Some(actor),
                "billing.payment.status_updated",
                "payment",
                Some(id.to_string()),
                json!({ "from_status": from.as_str(), "to_status": status.as_str() }),
            );
            tx.emit(DomainEvent::PaymentStatusUpdated { payment_id: id, from_status: from, to_status: status });
            tx.require_payment(id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_codes() {
        assert_eq!(normalize_currency(" usd ").unwrap(), "USD");
        assert!(normalize_currency("US").is_err());
        assert!(normalize_currency("U5D").is_err());
    }
}
