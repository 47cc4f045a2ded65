use ulid::Ulid;

use crate::model::{BookingStatus, RoomStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Field-level rule violated; the message names the rule.
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The candidate span overlaps a confirmed reservation.
    Conflict { booking_id: Ulid, window: Span },
    Unauthorized(Ulid),
    /// Room exists but is not ACTIVE.
    RoomUnavailable(RoomStatus),
    /// Attendee count exceeds the room's capacity.
    CapacityExceeded(u32),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(rule) => write!(f, "validation failed: {rule}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { booking_id, window } => {
                write!(
                    f,
                    "slot already booked by {booking_id} over [{}, {})",
                    window.start, window.end
                )
            }
            EngineError::Unauthorized(actor) => {
                write!(f, "actor {actor} is neither the requester nor an administrator")
            }
            EngineError::RoomUnavailable(status) => {
                write!(f, "room is {}, not ACTIVE", status.as_str())
            }
            EngineError::CapacityExceeded(cap) => {
                write!(f, "attendee count exceeds room capacity of {cap}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "illegal transition {} -> {}", from.as_str(), to.as_str())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
