use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("admin role required"))
    }
}

/// Admin, or the user the record belongs to.
pub(crate) fn require_self_or_admin(actor: &Actor, owner: Ulid) -> Result<(), EngineError> {
    if actor.is_admin() || actor.id == owner {
        Ok(())
    } else {
        Err(EngineError::Forbidden("not the owner"))
    }
}

/// Admin, the booking's student, or the booking's teacher.
pub(crate) fn require_booking_party(actor: &Actor, booking: &Booking) -> Result<(), EngineError> {
    if actor.is_admin() || actor.id == booking.student_id || actor.id == booking.teacher_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden("not a party to this booking"))
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(())
}

pub(crate) fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Trimmed, non-empty, at most `max` bytes.
pub(crate) fn clean_text(value: &str, max: usize, what: &'static str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be empty")));
    }
    if trimmed.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(trimmed.to_string())
}

/// Like `clean_text`, but blank input means "absent".
pub(crate) fn clean_optional(
    value: Option<&str>,
    max: usize,
    what: &'static str,
) -> Result<Option<String>, EngineError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => clean_text(v, max, what).map(Some),
    }
}

/// Lower-cased, trimmed address with a non-empty local part and domain.
pub(crate) fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_ascii_lowercase();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(EngineError::invalid(format!("not an email address: {email}"))),
    }
}

pub(crate) fn check_page(page: &PageRequest) -> Result<(), EngineError> {
    if page.limit == 0 {
        return Err(EngineError::invalid("page_limit must be positive"));
    }
    if page.limit > MAX_PAGE_SIZE {
        return Err(EngineError::LimitExceeded("page_limit too large"));
    }
    Ok(())
}

/// Cut one page out of an already ordered listing.
pub(crate) fn paginate<T>(items: Vec<T>, page: &PageRequest) -> Result<Page<T>, EngineError> {
    check_page(page)?;
    let total = items.len();
    let items = items.into_iter().skip(page.offset).take(page.limit).collect();
    Ok(Page { items, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Ana@Example.COM ").unwrap(), "ana@example.com");
        assert!(normalize_email("ana.example.com").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("ana@localhost").is_err());
        assert!(matches!(
            normalize_email(&format!("{}@x.io", "a".repeat(300))),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn text_cleaning() {
        assert_eq!(clean_text("  Ana ", MAX_NAME_LEN, "name").unwrap(), "Ana");
        assert!(clean_text("   ", MAX_NAME_LEN, "name").is_err());
        assert_eq!(clean_optional(Some("  "), 10, "bio").unwrap(), None);
        assert!(clean_optional(Some("x".repeat(11).as_str()), 10, "bio").is_err());
    }

    #[test]
    fn pagination_window() {
        let page = paginate((0..10).collect(), &PageRequest { limit: 3, offset: 8 }).unwrap();
        assert_eq!(page.items, vec![8, 9]);
        assert_eq!(page.total, 10);
        assert!(paginate(vec![1], &PageRequest { limit: 0, offset: 0 }).is_err());
        assert!(paginate(vec![1], &PageRequest { limit: MAX_PAGE_SIZE + 1, offset: 0 }).is_err());
    }

    #[test]
    fn booking_parties() {
        let student = Actor::new(Ulid::new(), Role::Student);
        let teacher = Actor::new(Ulid::new(), Role::Teacher);
        let stranger = Actor::new(Ulid::new(), Role::Student);
        let booking = Booking {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            student_id: student.id,
            teacher_id: teacher.id,
            package_id: Ulid::new(),
            status: BookingStatus::Hold,
            hold_expires_at: Some(0),
            confirmed_at: None,
            canceled_at: None,
            cancellation_reason: None,
            refund_returned: false,
            rescheduled_from: None,
            created_at: 0,
        };
        assert!(require_booking_party(&student, &booking).is_ok());
        assert!(require_booking_party(&teacher, &booking).is_ok());
        assert!(require_booking_party(&Actor::operator(), &booking).is_ok());
        assert_eq!(
            require_booking_party(&stranger, &booking),
            Err(EngineError::Forbidden("not a party to this booking"))
        );
    }
}
