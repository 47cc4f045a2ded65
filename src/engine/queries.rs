use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{first_conflict, now_ms, validate_span};
use super::{Engine, EngineError};

fn to_info(room_id: Ulid, r: &Reservation, now: Ms) -> BookingInfo {
    BookingInfo {
        id: r.id,
        room_id,
        requester_id: r.requester_id,
        start: r.span.start,
        end: r.span.end,
        attendees: r.attendees,
        title: r.title.clone(),
        purpose: r.purpose.clone(),
        status: r.status_at(now),
    }
}

impl Engine {
    /// Availability probe for a single slot starting at `start`, using the
    /// deployment-configured slot width.
    pub async fn check_slot(&self, room_id: Ulid, start: Ms) -> Result<SlotCheck, EngineError> {
        self.check_window(room_id, Span::new(start, start + self.slot_duration_ms))
            .await
    }

    /// Availability probe for an arbitrary window.
    ///
    /// Advisory only: takes a read lock, reserves nothing, and its answer
    /// can be stale by the time a create call lands — the create path
    /// re-runs the same check under the write lock. A probe against an
    /// unknown room reports available (there is nothing to conflict with);
    /// existence is enforced on the create path.
    pub async fn check_window(&self, room_id: Ulid, span: Span) -> Result<SlotCheck, EngineError> {
        validate_span(&span)?;
        let room = match self.get_room(&room_id) {
            Some(room) => room,
            None => {
                return Ok(SlotCheck {
                    available: true,
                    conflict: None,
                });
            }
        };
        let guard = room.read().await;
        Ok(match first_conflict(&guard, &span) {
            Some(existing) => SlotCheck {
                available: false,
                conflict: Some(existing.span),
            },
            None => SlotCheck {
                available: true,
                conflict: None,
            },
        })
    }

    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        self.state
            .iter()
            .map(|entry| {
                let room = entry.value().clone();
                let guard = room.try_read().expect("list_rooms: uncontended read");
                RoomInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    capacity: guard.capacity,
                    status: guard.status,
                }
            })
            .collect()
    }

    pub async fn get_room_info(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let room = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = room.read().await;
        Ok(RoomInfo {
            id: guard.id,
            name: guard.name.clone(),
            capacity: guard.capacity,
            status: guard.status,
        })
    }

    /// All reservations on a room, oldest start first, statuses derived.
    pub async fn bookings_for_room(&self, room_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let room = match self.get_room(&room_id) {
            Some(room) => room,
            None => return Ok(vec![]),
        };
        let guard = room.read().await;
        let now = now_ms();
        Ok(guard
            .reservations
            .iter()
            .map(|r| to_info(room_id, r, now))
            .collect())
    }

    /// Reservations on a room within a window (status-blind, history included).
    pub async fn bookings_in_window(
        &self,
        room_id: Ulid,
        span: Span,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        if span.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let room = match self.get_room(&room_id) {
            Some(room) => room,
            None => return Ok(vec![]),
        };
        let guard = room.read().await;
        let now = now_ms();
        Ok(guard
            .overlapping(&span)
            .map(|r| to_info(room_id, r, now))
            .collect())
    }

    /// Every reservation a requester has made, across all rooms.
    pub async fn bookings_for_requester(
        &self,
        requester_id: Ulid,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let room_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let now = now_ms();
        let mut out = Vec::new();
        for room_id in room_ids {
            if let Some(room) = self.get_room(&room_id) {
                let guard = room.read().await;
                out.extend(
                    guard
                        .reservations
                        .iter()
                        .filter(|r| r.requester_id == requester_id)
                        .map(|r| to_info(room_id, r, now)),
                );
            }
        }
        out.sort_by_key(|b| b.start);
        Ok(out)
    }

    /// Every reservation in the store, newest start first (admin listing).
    pub async fn all_bookings(&self) -> Result<Vec<BookingInfo>, EngineError> {
        let room_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let now = now_ms();
        let mut out = Vec::new();
        for room_id in room_ids {
            if let Some(room) = self.get_room(&room_id) {
                let guard = room.read().await;
                out.extend(guard.reservations.iter().map(|r| to_info(room_id, r, now)));
            }
        }
        out.sort_by_key(|b| std::cmp::Reverse(b.start));
        Ok(out)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let room_id = self
            .get_room_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = room.read().await;
        let r = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        Ok(to_info(room_id, r, now_ms()))
    }
}
