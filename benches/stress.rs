use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("allocd")
        .password("allocd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2030, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid base date")
}

/// Timestamp literal `hours` after the base date.
fn at(hours: i64) -> String {
    (base() + TimeDelta::hours(hours))
        .format("%Y-%m-%dT%H:%M")
        .to_string()
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Register an owner and one room; returns (owner, room).
async fn seed(client: &Client) -> (Ulid, Ulid) {
    let owner = Ulid::new();
    let room = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, username) VALUES ('{owner}', 'bench');
             INSERT INTO resources (id, name, \"type\") VALUES ('{room}', 'Hall {room}', 'room')"
        ))
        .await
        .unwrap();
    (owner, room)
}

async fn book(client: &Client, owner: Ulid, room: Ulid, hour: i64) -> Result<(), tokio_postgres::Error> {
    let event = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, user_id, title, start, "end") VALUES ('{event}', '{owner}', 'Slot {hour}', '{}', '{}');
               INSERT INTO allocations (id, event_id, resource_id) VALUES ('{}', '{event}', '{room}')"#,
            at(hour),
            at(hour + 1),
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let (owner, room) = seed(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, owner, room, i as i64).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("event + allocation latency", &mut latencies);
}

/// Many clients race for the same hours on one room; each hour must have
/// exactly one winner.
async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let (owner, room) = seed(&setup).await;

    let n_tasks = 10;
    let n_hours = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            for hour in 0..n_hours {
                match book(&client, owner, room, hour).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_hours} hours in {:.2}s: {won} won, {lost} rejected",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_hours as usize, "every hour should have exactly one winner");
}

async fn phase3_report_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let (owner, room) = seed(&setup).await;
    for hour in 0..200 {
        book(&setup, owner, room, hour).await.unwrap();
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5i64 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let (owner, room) = seed(&client).await;
            let mut hour = w * 100_000;
            while !stop.load(Ordering::Relaxed) {
                let _ = book(&client, owner, room, hour).await;
                hour += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let sql = format!(
                r#"SELECT * FROM utilization WHERE start = '{}' AND "end" = '{}'"#,
                at(0),
                at(24 * 30)
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("utilization report", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let (owner, room) = seed(&client).await;
            for hour in 0..ops_per_conn {
                book(&client, owner, room, hour).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} bookings each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ALLOCD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOCD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ALLOCD_PORT");

    println!("=== allocd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings on one room");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] report latency under write load");
    phase3_report_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
