mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The reservation engine: the sole owner of room and reservation state.
///
/// Each room lives behind its own RwLock; the write guard held across
/// check-and-insert is what makes conflicting concurrent creates
/// impossible. Different rooms never contend.
pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → room id
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    /// Slot width for single-instant availability probes.
    pub(super) slot_duration_ms: Ms,
}

/// Apply an event directly to a RoomState (no locking — caller holds the lock).
fn apply_to_room(room: &mut RoomState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            room_id,
            requester_id,
            span,
            attendees,
            title,
            purpose,
        } => {
            room.insert_reservation(Reservation {
                id: *id,
                requester_id: *requester_id,
                span: *span,
                attendees: *attendees,
                title: title.clone(),
                purpose: purpose.clone(),
                status: BookingStatus::Confirmed,
            });
            booking_map.insert(*id, *room_id);
        }
        Event::BookingCancelled { id, .. } => {
            // Status flip, never removal — cancelled rows stay as history
            // and the booking_to_room index keeps serving lookups.
            if let Some(r) = room.reservation_mut(*id) {
                r.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingRetitled { id, title, purpose, .. } => {
            if let Some(r) = room.reservation_mut(*id) {
                if let Some(t) = title {
                    r.title = t.clone();
                }
                if let Some(p) = purpose {
                    r.purpose = p.clone();
                }
            }
        }
        Event::RoomUpdated { name, capacity, status, .. } => {
            room.name = name.clone();
            room.capacity = *capacity;
            room.status = *status;
        }
        // RoomRegistered is handled at the DashMap level, not here
        Event::RoomRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, slot_duration_ms: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_room: DashMap::new(),
            slot_duration_ms,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::RoomRegistered { id, name, capacity, status } => {
                    let room = RoomState::new(*id, name.clone(), *capacity, *status);
                    engine.state.insert(*id, Arc::new(RwLock::new(room)));
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.state.get(&room_id) {
                            let room_arc = entry.clone();
                            let mut guard = room_arc.try_write().expect("replay: uncontended write");
                            apply_to_room(&mut guard, other, &engine.booking_to_room);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    pub fn slot_duration_ms(&self) -> Ms {
        self.slot_duration_ms
    }

    /// WAL-append + apply + notify in one call, under the caller's write
    /// guard. Nothing mutates in memory unless the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        room_id: Ulid,
        room: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(room, event, &self.booking_to_room);
        self.notify.send(room_id, event);
        Ok(())
    }

    /// Lookup booking → room, get room, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .get_room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = room.write_owned().await;
        Ok((room_id, guard))
    }
}

/// Extract the room_id from an event (for non-RoomRegistered events).
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { room_id, .. }
        | Event::BookingCancelled { room_id, .. }
        | Event::BookingRetitled { room_id, .. } => Some(*room_id),
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::RoomRegistered { .. } => None,
    }
}
