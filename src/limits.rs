use crate::model::Ms;

// Per-tenant ceilings. A tenant that hits these is misbehaving, not growing.
pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

// Field-level business rules carried over from the booking form.
pub const MIN_TITLE_LEN: usize = 3;
pub const MIN_PURPOSE_LEN: usize = 10;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 4_096;
pub const MAX_ROOM_NAME_LEN: usize = 256;

// Timestamps are Unix ms; anything outside [1970, 2100) is a client bug.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// No single reservation may span more than 30 days.
pub const MAX_SPAN_DURATION_MS: Ms = 30 * 24 * 3_600_000;

/// Listing queries are clamped to a one-year window.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Slot width used by the availability probe when the caller gives only a
/// start instant. Overridable per deployment, fixed per process.
pub const DEFAULT_SLOT_DURATION_MS: Ms = 30 * 60_000;
