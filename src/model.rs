use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[s1,e1)` and `[s2,e2)` overlap iff `s1 < e2 && s2 < e1`.
    /// Adjacent spans sharing an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Room lifecycle. Only ACTIVE rooms accept new reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Active,
    Maintenance,
    Inactive,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Active => "ACTIVE",
            RoomStatus::Maintenance => "MAINTENANCE",
            RoomStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(RoomStatus::Active),
            "MAINTENANCE" => Some(RoomStatus::Maintenance),
            "INACTIVE" => Some(RoomStatus::Inactive),
            _ => None,
        }
    }
}

/// Reservation status. Only Confirmed and Cancelled are ever stored;
/// Completed is derived at read time from `end <= now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// The only legal stored transition is Confirmed → Cancelled.
    /// Cancelled and Completed are terminal.
    pub fn can_transition(self, to: BookingStatus) -> bool {
        matches!((self, to), (BookingStatus::Confirmed, BookingStatus::Cancelled))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }
}

/// A claim on a room for a half-open time span. Cancellation flips the
/// status; rows are never removed, so history survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub span: Span,
    pub attendees: u32,
    pub title: String,
    pub purpose: String,
    pub status: BookingStatus,
}

impl Reservation {
    /// True when this reservation counts against the no-overlap invariant.
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    /// Status as presented to callers: a stored Confirmed whose span has
    /// fully elapsed reads as Completed. No background job required.
    pub fn status_at(&self, now: Ms) -> BookingStatus {
        match self.status {
            BookingStatus::Confirmed if self.span.end <= now => BookingStatus::Completed,
            other => other,
        }
    }
}

/// The identity performing an operation. Whether the actor is an
/// administrator is decided outside the engine (deployment config).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub admin: bool,
}

impl Actor {
    pub fn member(id: Ulid) -> Self {
        Self { id, admin: false }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, admin: true }
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    /// Max attendees, not max concurrent reservations — one confirmed
    /// reservation occupies the whole room.
    pub capacity: u32,
    pub status: RoomStatus,
    /// All reservations ever made on this room, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: Ulid, name: String, capacity: u32, status: RoomStatus) -> Self {
        Self {
            id,
            name,
            capacity,
            status,
            reservations: Vec::new(),
        }
    }

    /// Insert preserving sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        id: Ulid,
        name: String,
        capacity: u32,
        status: RoomStatus,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        status: RoomStatus,
    },
    BookingCreated {
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        span: Span,
        attendees: u32,
        title: String,
        purpose: String,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
    },
    BookingRetitled {
        id: Ulid,
        room_id: Ulid,
        title: Option<String>,
        purpose: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub status: RoomStatus,
}

/// A reservation as presented to callers — status already derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub attendees: u32,
    pub title: String,
    pub purpose: String,
    pub status: BookingStatus,
}

/// Availability probe result. Advisory only — it can go stale before a
/// subsequent create call lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCheck {
    pub available: bool,
    pub conflict: Option<Span>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms, status: BookingStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            requester_id: Ulid::new(),
            span: Span::new(start, end),
            attendees: 2,
            title: "Standup".into(),
            purpose: "Daily team sync meeting".into(),
            status,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_overlap_shapes() {
        // The four shapes the single predicate has to cover.
        let existing = Span::new(100, 200);
        assert!(existing.overlaps(&Span::new(50, 150))); // partial-left
        assert!(existing.overlaps(&Span::new(150, 250))); // partial-right
        assert!(existing.overlaps(&Span::new(120, 180))); // candidate inside
        assert!(existing.overlaps(&Span::new(50, 250))); // existing inside
        assert!(!existing.overlaps(&Span::new(200, 300))); // back-to-back right
        assert!(!existing.overlaps(&Span::new(0, 100))); // back-to-back left
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Confirmed.can_transition(Cancelled));
        assert!(!Confirmed.can_transition(Completed)); // derived, never stored
        assert!(!Cancelled.can_transition(Confirmed));
        assert!(!Cancelled.can_transition(Cancelled));
        assert!(!Completed.can_transition(Cancelled));
    }

    #[test]
    fn completed_is_derived() {
        let r = reservation(1000, 2000, BookingStatus::Confirmed);
        assert_eq!(r.status_at(500), BookingStatus::Confirmed);
        assert_eq!(r.status_at(1999), BookingStatus::Confirmed);
        assert_eq!(r.status_at(2000), BookingStatus::Completed); // boundary: end <= now
        // Cancellation wins over elapsed time.
        let c = reservation(1000, 2000, BookingStatus::Cancelled);
        assert_eq!(c.status_at(5000), BookingStatus::Cancelled);
    }

    #[test]
    fn reservation_ordering() {
        let mut rs = RoomState::new(Ulid::new(), "Boardroom".into(), 10, RoomStatus::Active);
        rs.insert_reservation(reservation(300, 400, BookingStatus::Confirmed));
        rs.insert_reservation(reservation(100, 200, BookingStatus::Confirmed));
        rs.insert_reservation(reservation(200, 300, BookingStatus::Cancelled));
        assert_eq!(rs.reservations[0].span.start, 100);
        assert_eq!(rs.reservations[1].span.start, 200);
        assert_eq!(rs.reservations[2].span.start, 300);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut rs = RoomState::new(Ulid::new(), "Huddle".into(), 4, RoomStatus::Active);
        rs.insert_reservation(reservation(100, 200, BookingStatus::Confirmed));
        rs.insert_reservation(reservation(450, 600, BookingStatus::Confirmed));
        rs.insert_reservation(reservation(1000, 1100, BookingStatus::Confirmed));

        let query = Span::new(500, 800);
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // A reservation ending exactly at query.start is NOT overlapping (half-open)
        let mut rs = RoomState::new(Ulid::new(), "Huddle".into(), 4, RoomStatus::Active);
        rs.insert_reservation(reservation(100, 200, BookingStatus::Confirmed));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_includes_cancelled() {
        // The window scan is status-blind; the conflict checker filters.
        let mut rs = RoomState::new(Ulid::new(), "Huddle".into(), 4, RoomStatus::Active);
        rs.insert_reservation(reservation(100, 200, BookingStatus::Cancelled));
        let hits: Vec<_> = rs.overlapping(&Span::new(0, 1000)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_empty_room() {
        let rs = RoomState::new(Ulid::new(), "Huddle".into(), 4, RoomStatus::Active);
        let hits: Vec<_> = rs.overlapping(&Span::new(0, 1000)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut rs = RoomState::new(Ulid::new(), "Huddle".into(), 4, RoomStatus::Active);
        // [100, 201) overlaps [200, 300) by exactly 1ms
        rs.insert_reservation(reservation(100, 201, BookingStatus::Confirmed));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn reservation_lookup() {
        let mut rs = RoomState::new(Ulid::new(), "Huddle".into(), 4, RoomStatus::Active);
        let r = reservation(100, 200, BookingStatus::Confirmed);
        let id = r.id;
        rs.insert_reservation(r);
        assert!(rs.reservation(id).is_some());
        assert!(rs.reservation(Ulid::new()).is_none());

        rs.reservation_mut(id).unwrap().status = BookingStatus::Cancelled;
        assert_eq!(rs.reservation(id).unwrap().status, BookingStatus::Cancelled);
    }

    #[test]
    fn room_status_roundtrip() {
        for s in [RoomStatus::Active, RoomStatus::Maintenance, RoomStatus::Inactive] {
            assert_eq!(RoomStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RoomStatus::parse("active"), Some(RoomStatus::Active));
        assert_eq!(RoomStatus::parse("RETIRED"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            room_id: Ulid::new(),
            requester_id: Ulid::new(),
            span: Span::new(1000, 2000),
            attendees: 5,
            title: "Design review".into(),
            purpose: "Quarterly design review session".into(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
