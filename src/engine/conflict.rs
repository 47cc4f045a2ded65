use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Find the first CONFIRMED reservation overlapping `span`, if any.
///
/// Pure read against the room's sorted reservation list; the sort lets
/// `overlapping` cut off the scan at the first start >= span.end.
/// Cancelled reservations never conflict with anything.
pub(crate) fn first_conflict<'a>(room: &'a RoomState, span: &Span) -> Option<&'a Reservation> {
    room.overlapping(span).find(|r| r.is_active())
}

pub(crate) fn check_no_conflict(room: &RoomState, span: &Span) -> Result<(), EngineError> {
    match first_conflict(room, span) {
        Some(existing) => Err(EngineError::Conflict {
            booking_id: existing.id,
            window: existing.span,
        }),
        None => Ok(()),
    }
}
