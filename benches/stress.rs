use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("roomd")
        .password("roomd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn create_room(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, capacity) VALUES ('{id}', 'Bench Room', {capacity})"
        ))
        .await
        .unwrap();
    id
}

fn booking_sql(room: Ulid, start: i64, end: i64) -> String {
    let id = Ulid::new();
    let requester = Ulid::new();
    format!(
        r#"INSERT INTO bookings (id, room_id, requester_id, start, "end", attendees, title, purpose)
           VALUES ('{id}', '{room}', '{requester}', {start}, {end}, 4, 'Bench', 'Benchmark generated booking')"#
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let room = create_room(&client, 10).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = (i as i64) * HOUR;
        let e = s + HOUR;
        let t = Instant::now();
        client.batch_execute(&booking_sql(room, s, e)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();

        handles.push(tokio::spawn(async move {
            // Each task uses its own tenant (unique dbname from connect())
            let client = connect(&host, port).await;
            let room = create_room(&client, 10).await;

            for j in 0..n_per_task {
                let s = (j as i64) * HOUR;
                let e = s + HOUR;
                client.batch_execute(&booking_sql(room, s, e)).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_probe_under_load(host: &str, port: u16) {
    // Writer tasks: continuously add bookings in the background
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let room = create_room(&client, 10).await;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let s = (w as i64 * 100_000 + i) * HOUR;
                let _ = client.batch_execute(&booking_sql(room, s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    // Reader tasks: probe availability and measure latency
    let n_readers = 10;
    let probes_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let room = create_room(&client, 10).await;
            // Fill the calendar so probes have something to scan
            for i in 0..50 {
                let s = (i as i64) * HOUR;
                client.batch_execute(&booking_sql(room, s, s + HOUR)).await.unwrap();
            }

            let mut latencies = Vec::with_capacity(probes_per_reader);
            for i in 0..probes_per_reader {
                let probe_at = ((i % 100) as i64) * HOUR / 2;
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM availability WHERE room_id = '{room}' AND start = {probe_at}"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability probe", &mut all_latencies);
}

/// Every task fights for the same slot on the same room in one tenant:
/// exactly one booking may win, the rest must come back as conflicts.
async fn phase4_contended_slot(host: &str, port: u16) {
    let tenant = format!("storm_{}", Ulid::new());
    let setup_client = {
        let mut config = Config::new();
        config
            .host(host)
            .port(port)
            .dbname(&tenant)
            .user("roomd")
            .password("roomd");
        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            let _ = conn.await;
        });
        client
    };
    let room = create_room(&setup_client, 10).await;

    let n_tasks = 50;
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let conflict = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let success = success.clone();
        let conflict = conflict.clone();
        handles.push(tokio::spawn(async move {
            let mut config = Config::new();
            config
                .host(&host)
                .port(port)
                .dbname(&tenant)
                .user("roomd")
                .password("roomd");
            let (client, conn) = config.connect(NoTls).await.expect("connect failed");
            tokio::spawn(async move {
                let _ = conn.await;
            });

            match client.batch_execute(&booking_sql(room, 0, HOUR)).await {
                Ok(_) => {
                    success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(_) => {
                    conflict.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    let lost = conflict.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_tasks} racers for one slot: {ok} won, {lost} conflicted in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(ok, 1, "exactly one racer may win the slot");
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ROOMD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOMD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ROOMD_PORT");

    println!("=== roomd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] probe latency under write load");
    phase3_probe_under_load(&host, port).await;

    println!("\n[phase 4] contended slot storm");
    phase4_contended_slot(&host, port).await;

    println!("\n=== benchmark complete ===");
}
