use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError, WalCommand};

fn validate_title(title: &str) -> Result<(), EngineError> {
    if title.len() < MIN_TITLE_LEN {
        return Err(EngineError::Validation("title must be at least 3 characters"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

fn validate_purpose(purpose: &str) -> Result<(), EngineError> {
    if purpose.len() < MIN_PURPOSE_LEN {
        return Err(EngineError::Validation("purpose must be at least 10 characters"));
    }
    if purpose.len() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_room(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        status: RoomStatus,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if name.is_empty() {
            return Err(EngineError::Validation("room name must not be empty"));
        }
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomRegistered { id, name: name.clone(), capacity, status };
        self.wal_append(&event).await?;
        let room = RoomState::new(id, name, capacity, status);
        self.state.insert(id, Arc::new(RwLock::new(room)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        status: RoomStatus,
    ) -> Result<(), EngineError> {
        if name.is_empty() {
            return Err(EngineError::Validation("room name must not be empty"));
        }
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1"));
        }
        let room = self
            .get_room(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = room.write().await;

        let event = Event::RoomUpdated { id, name, capacity, status };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Create a confirmed reservation.
    ///
    /// Field validation happens before the store is touched; the conflict
    /// re-check and the insert happen under the room's write lock, which
    /// also spans the WAL append — two concurrent creates for overlapping
    /// spans on one room can never both pass the check.
    pub async fn create_booking(
        &self,
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        span: Span,
        attendees: u32,
        title: String,
        purpose: String,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if attendees == 0 {
            return Err(EngineError::Validation("attendees must be at least 1"));
        }
        validate_title(&title)?;
        validate_purpose(&purpose)?;
        if self.booking_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let mut guard = room.write().await;

        if guard.status != RoomStatus::Active {
            return Err(EngineError::RoomUnavailable(guard.status));
        }
        if attendees > guard.capacity {
            return Err(EngineError::CapacityExceeded(guard.capacity));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        check_no_conflict(&guard, &span)?;

        let event = Event::BookingCreated {
            id,
            room_id,
            requester_id,
            span,
            attendees,
            title,
            purpose,
        };
        self.persist_and_apply(room_id, &mut guard, &event).await
    }

    /// Cancel a reservation. Owner or administrator only.
    ///
    /// Idempotent on an already-cancelled reservation. Rejected once the
    /// span has elapsed (Completed is terminal). Relaxing the schedule
    /// never needs a conflict check.
    pub async fn cancel_booking(&self, id: Ulid, actor: Actor) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let reservation = guard
            .reservation(id)
            .ok_or(EngineError::NotFound(id))?;

        if actor.id != reservation.requester_id && !actor.admin {
            return Err(EngineError::Unauthorized(actor.id));
        }

        let current = reservation.status_at(now_ms());
        if current == BookingStatus::Cancelled {
            return Ok(()); // idempotent, no event
        }
        if !current.can_transition(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: BookingStatus::Cancelled,
            });
        }

        let event = Event::BookingCancelled { id, room_id };
        self.persist_and_apply(room_id, &mut guard, &event).await
    }

    /// Update title/purpose of a confirmed reservation. Owner only — the
    /// schedule itself is immutable; rescheduling is cancel + create.
    pub async fn update_booking_metadata(
        &self,
        id: Ulid,
        actor: Actor,
        title: Option<String>,
        purpose: Option<String>,
    ) -> Result<(), EngineError> {
        if title.is_none() && purpose.is_none() {
            return Err(EngineError::Validation("nothing to update"));
        }
        if let Some(ref t) = title {
            validate_title(t)?;
        }
        if let Some(ref p) = purpose {
            validate_purpose(p)?;
        }

        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let reservation = guard
            .reservation(id)
            .ok_or(EngineError::NotFound(id))?;

        if actor.id != reservation.requester_id {
            return Err(EngineError::Unauthorized(actor.id));
        }
        // Terminal states are immutable, metadata included.
        let current = reservation.status_at(now_ms());
        if current != BookingStatus::Confirmed {
            return Err(EngineError::Validation("only confirmed bookings can be updated"));
        }

        let event = Event::BookingRetitled { id, room_id, title, purpose };
        self.persist_and_apply(room_id, &mut guard, &event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Cancelled reservations are re-emitted as
    /// create-then-cancel pairs so booking history survives the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let room_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in room_ids {
            let entry = match self.state.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let room = entry.value().clone();
            let guard = room.try_read().expect("compact: uncontended read");

            events.push(Event::RoomRegistered {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                status: guard.status,
            });

            for r in &guard.reservations {
                events.push(Event::BookingCreated {
                    id: r.id,
                    room_id: guard.id,
                    requester_id: r.requester_id,
                    span: r.span,
                    attendees: r.attendees,
                    title: r.title.clone(),
                    purpose: r.purpose.clone(),
                });
                if r.status == BookingStatus::Cancelled {
                    events.push(Event::BookingCancelled {
                        id: r.id,
                        room_id: guard.id,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
