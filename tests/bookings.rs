use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roomd::tenant::TenantManager;
use roomd::wire;

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(admins: HashSet<Ulid>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        PathBuf::from(dir),
        1000,
        30 * 60_000,
    ));
    let admins = Arc::new(admins);

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            let admins = admins.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "roomd".to_string(), admins, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("test_{}", Ulid::new()))
        .user("roomd")
        .password("roomd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// First data row of a simple query, as (column name → value) lookups.
async fn query_row(
    client: &tokio_postgres::Client,
    sql: &str,
) -> tokio_postgres::SimpleQueryRow {
    let messages = client.simple_query(sql).await.unwrap();
    for m in messages {
        if let SimpleQueryMessage::Row(row) = m {
            return row;
        }
    }
    panic!("query returned no rows: {sql}");
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn create_room(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let id = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO rooms (id, name, capacity) VALUES ('{id}', 'Boardroom', {capacity})"
        ))
        .await
        .unwrap();
    id
}

fn insert_booking_sql(id: Ulid, room: Ulid, requester: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO bookings (id, room_id, requester_id, start, "end", attendees, title, purpose)
           VALUES ('{id}', '{room}', '{requester}', {start}, {end}, 4, 'Planning', 'Sprint planning session')"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let addr = start_test_server(HashSet::new()).await;
    let client = connect(addr).await;

    let room = create_room(&client, 12).await;
    let requester = Ulid::new();
    let base = now_ms() + 24 * HOUR;

    // Create returns the reservation row.
    let id = Ulid::new();
    let row = query_row(&client, &insert_booking_sql(id, room, requester, base, base + HOUR)).await;
    assert_eq!(row.get("id"), Some(id.to_string().as_str()));
    assert_eq!(row.get("status"), Some("CONFIRMED"));
    assert_eq!(row.get("title"), Some("Planning"));

    // The same slot conflicts, surfaced as an exclusion violation.
    let err = client
        .simple_query(&insert_booking_sql(Ulid::new(), room, requester, base, base + HOUR))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    // Back-to-back is not a conflict.
    client
        .simple_query(&insert_booking_sql(
            Ulid::new(),
            room,
            requester,
            base + HOUR,
            base + 2 * HOUR,
        ))
        .await
        .unwrap();

    // A stranger may not cancel.
    let stranger = Ulid::new();
    let err = client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'CANCELLED' WHERE id = '{id}' AND actor_id = '{stranger}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INSUFFICIENT_PRIVILEGE));

    // The owner may; the response carries the new status.
    let row = query_row(
        &client,
        &format!(
            "UPDATE bookings SET status = 'CANCELLED' WHERE id = '{id}' AND actor_id = '{requester}'"
        ),
    )
    .await;
    assert_eq!(row.get("status"), Some("CANCELLED"));

    // Cancelling freed the slot.
    client
        .simple_query(&insert_booking_sql(Ulid::new(), room, requester, base, base + HOUR))
        .await
        .unwrap();
}

#[tokio::test]
async fn availability_probe_over_the_wire() {
    let addr = start_test_server(HashSet::new()).await;
    let client = connect(addr).await;

    let room = create_room(&client, 12).await;
    let base = now_ms() + 24 * HOUR;

    let row = query_row(
        &client,
        &format!("SELECT * FROM availability WHERE room_id = '{room}' AND start = {base}"),
    )
    .await;
    assert_eq!(row.get("available"), Some("t"));
    assert_eq!(row.get("conflict_start"), None);

    client
        .simple_query(&insert_booking_sql(
            Ulid::new(),
            room,
            Ulid::new(),
            base,
            base + HOUR,
        ))
        .await
        .unwrap();

    let row = query_row(
        &client,
        &format!("SELECT * FROM availability WHERE room_id = '{room}' AND start = {base}"),
    )
    .await;
    assert_eq!(row.get("available"), Some("f"));
    assert_eq!(row.get("conflict_start"), Some(base.to_string().as_str()));
    assert_eq!(row.get("conflict_end"), Some((base + HOUR).to_string().as_str()));

    // Explicit window probe just past the booking.
    let row = query_row(
        &client,
        &format!(
            "SELECT * FROM availability WHERE room_id = '{room}' AND start = {} AND \"end\" = {}",
            base + HOUR,
            base + 2 * HOUR
        ),
    )
    .await;
    assert_eq!(row.get("available"), Some("t"));
}

#[tokio::test]
async fn admin_cancels_foreign_booking() {
    let admin = Ulid::new();
    let addr = start_test_server(HashSet::from([admin])).await;
    let client = connect(addr).await;

    let room = create_room(&client, 12).await;
    let base = now_ms() + 24 * HOUR;

    let id = Ulid::new();
    client
        .simple_query(&insert_booking_sql(id, room, Ulid::new(), base, base + HOUR))
        .await
        .unwrap();

    let row = query_row(
        &client,
        &format!(
            "UPDATE bookings SET status = 'CANCELLED' WHERE id = '{id}' AND actor_id = '{admin}'"
        ),
    )
    .await;
    assert_eq!(row.get("status"), Some("CANCELLED"));
}

#[tokio::test]
async fn metadata_update_over_the_wire() {
    let addr = start_test_server(HashSet::new()).await;
    let client = connect(addr).await;

    let room = create_room(&client, 12).await;
    let requester = Ulid::new();
    let base = now_ms() + 24 * HOUR;

    let id = Ulid::new();
    client
        .simple_query(&insert_booking_sql(id, room, requester, base, base + HOUR))
        .await
        .unwrap();

    let row = query_row(
        &client,
        &format!(
            "UPDATE bookings SET title = 'Retro', purpose = 'Sprint retrospective notes' WHERE id = '{id}' AND actor_id = '{requester}'"
        ),
    )
    .await;
    assert_eq!(row.get("title"), Some("Retro"));
    assert_eq!(row.get("purpose"), Some("Sprint retrospective notes"));
}

#[tokio::test]
async fn validation_and_capacity_error_codes() {
    let addr = start_test_server(HashSet::new()).await;
    let client = connect(addr).await;

    let room = create_room(&client, 4).await;
    let base = now_ms() + 24 * HOUR;

    // Short title → check violation.
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO bookings (id, room_id, requester_id, start, "end", attendees, title, purpose)
               VALUES ('{}', '{room}', '{}', {base}, {}, 2, 'ab', 'Sprint planning session')"#,
            Ulid::new(),
            Ulid::new(),
            base + HOUR
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::CHECK_VIOLATION));

    // Too many attendees → check violation as well, distinct from conflicts.
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO bookings (id, room_id, requester_id, start, "end", attendees, title, purpose)
               VALUES ('{}', '{room}', '{}', {base}, {}, 9, 'Planning', 'Sprint planning session')"#,
            Ulid::new(),
            Ulid::new(),
            base + HOUR
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::CHECK_VIOLATION));

    // DELETE is not part of the surface.
    let err = client
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn rooms_listing_over_the_wire() {
    let addr = start_test_server(HashSet::new()).await;
    let client = connect(addr).await;

    let room = create_room(&client, 12).await;
    client
        .simple_query(&format!(
            "UPDATE rooms SET status = 'MAINTENANCE' WHERE id = '{room}'"
        ))
        .await
        .unwrap();

    let row = query_row(&client, "SELECT * FROM rooms").await;
    assert_eq!(row.get("id"), Some(room.to_string().as_str()));
    assert_eq!(row.get("capacity"), Some("12"));
    assert_eq!(row.get("status"), Some("MAINTENANCE"));
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server(HashSet::new()).await;
    let client = connect(addr).await;

    let room = create_room(&client, 12).await;
    let requester = Ulid::new();
    let base = now_ms() + 24 * HOUR;

    let id = Ulid::new();
    client
        .simple_query(&insert_booking_sql(id, room, requester, base, base + HOUR))
        .await
        .unwrap();

    // Prepared statement through the extended protocol.
    let rows = client
        .query(
            "SELECT * FROM bookings WHERE room_id = $1",
            &[&room.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let status: &str = rows[0].get("status");
    assert_eq!(status, "CONFIRMED");
}
