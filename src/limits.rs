//! Hard input limits enforced by the engine and the tenant manager.

use crate::model::{HOUR_MS, Ms};

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_TEXT_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_REFERENCE_LEN: usize = 128;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

pub const MAX_LESSONS_PER_PACKAGE: u32 = 1_000;
pub const MAX_EXPERIENCE_YEARS: u32 = 100;
pub const MAX_SLOT_DURATION_MS: Ms = 12 * HOUR_MS;
/// Ten digits of cents: amounts up to 99,999,999.99.
pub const MAX_AMOUNT_CENTS: i64 = 9_999_999_999;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 3000-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 32_503_680_000_000;
