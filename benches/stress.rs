use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;
const USER_PASSWORD: &str = "bench-password";
const ANONYMOUS_PASSWORD: &str = "anonymous";

struct Target {
    host: String,
    port: u16,
    password: String,
    operator: String,
}

async fn connect(target: &Target, dbname: &str, user: &str, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(dbname)
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
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

/// A fresh tenant with one teacher, `students` students (one package each)
/// and `slots` hour-long open slots starting tomorrow.
struct Studio {
    db: String,
    teacher: Ulid,
    students: Vec<(Ulid, Ulid)>,
    slots: Vec<Ulid>,
}

async fn setup_studio(target: &Target, students: usize, slots: usize) -> Studio {
    let db = format!("bench_{}", Ulid::new());
    let op = connect(target, &db, &target.operator, &target.password).await;

    let teacher = Ulid::new();
    op.batch_execute(&format!(
        "INSERT INTO users (id, email, role, display_name, password) \
         VALUES ('{teacher}', 'teacher@bench.test', 'teacher', 'Teacher', '{USER_PASSWORD}')"
    ))
    .await
    .unwrap();

    let expires = now_ms() + 365 * DAY;
    let mut student_ids = Vec::with_capacity(students);
    for i in 0..students {
        let student = Ulid::new();
        let package = Ulid::new();
        op.batch_execute(&format!(
            "INSERT INTO users (id, email, role, display_name, password) \
             VALUES ('{student}', 'student{i}@bench.test', 'student', 'Student {i}', '{USER_PASSWORD}')"
        ))
        .await
        .unwrap();
        op.batch_execute(&format!(
            "INSERT INTO packages (id, student_id, lessons_total, expires_at) VALUES ('{package}', '{student}', 1000, {expires})"
        ))
        .await
        .unwrap();
        student_ids.push((student, package));
    }

    let first = now_ms() + DAY;
    let mut slot_ids = Vec::with_capacity(slots);
    for i in 0..slots {
        let slot = Ulid::new();
        let start = first + (i as i64) * HOUR;
        op.batch_execute(&format!(
            r#"INSERT INTO slots (id, teacher_id, start, "end") VALUES ('{slot}', '{teacher}', {start}, {})"#,
            start + HOUR
        ))
        .await
        .unwrap();
        slot_ids.push(slot);
    }

    Studio { db, teacher, students: student_ids, slots: slot_ids }
}

async fn book(client: &Client, slot: Ulid, package: Ulid) -> Result<Ulid, tokio_postgres::Error> {
    let booking = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, slot_id, package_id) VALUES ('{booking}', '{slot}', '{package}')"
        ))
        .await?;
    client
        .batch_execute(&format!("INSERT INTO confirmations (booking_id) VALUES ('{booking}')"))
        .await?;
    Ok(booking)
}

async fn phase1_sequential(target: &Target) {
    let n = 500;
    let studio = setup_studio(target, 1, n).await;
    let (student, package) = studio.students[0];
    let client = connect(target, &studio.db, &student.to_string(), USER_PASSWORD).await;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for &slot in &studio.slots {
        let t = Instant::now();
        book(&client, slot, package).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} hold+confirm pairs in {:.2}s = {ops:.0} bookings/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

async fn phase2_contention(target: &Target) {
    let n_students = 20;
    let n_slots = 50;
    let studio = setup_studio(target, n_students, n_slots).await;
    let slots = Arc::new(studio.slots.clone());

    let start = Instant::now();
    let mut handles = Vec::new();
    for &(student, package) in &studio.students {
        let client = connect(target, &studio.db, &student.to_string(), USER_PASSWORD).await;
        let slots = slots.clone();
        handles.push(tokio::spawn(async move {
            let mut won = 0usize;
            for &slot in slots.iter() {
                if book(&client, slot, package).await.is_ok() {
                    won += 1;
                }
            }
            won
        }));
    }

    let mut booked = 0;
    for h in handles {
        booked += h.await.unwrap();
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_students} students racing for {n_slots} slots: {booked} booked in {:.2}s",
        elapsed.as_secs_f64()
    );
    if booked != n_slots {
        println!("  !! expected exactly one booking per slot");
    }
}

async fn phase3_read_under_load(target: &Target) {
    let studio = setup_studio(target, 5, 1000).await;
    let stop = Arc::new(AtomicBool::new(false));

    // Writers book disjoint slot ranges.
    let per_writer = studio.slots.len() / studio.students.len();
    let mut writer_handles = Vec::new();
    for (w, &(student, package)) in studio.students.iter().enumerate() {
        let client = connect(target, &studio.db, &student.to_string(), USER_PASSWORD).await;
        let slots: Vec<Ulid> = studio.slots[w * per_writer..(w + 1) * per_writer].to_vec();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            for slot in slots {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let _ = book(&client, slot, package).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let client = connect(target, &studio.db, "anonymous", ANONYMOUS_PASSWORD).await;
        let teacher = studio.teacher;
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM open_slots WHERE teacher_id = '{teacher}' AND page_limit = 50"
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
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("open_slots query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 50;
    let db = format!("bench_{}", Ulid::new());

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..n_conns {
        let client = connect(target, &db, "anonymous", ANONYMOUS_PASSWORD).await;
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let id = Ulid::new();
            let signed_up = client
                .batch_execute(&format!(
                    "INSERT INTO users (id, email, role, display_name, password) \
                     VALUES ('{id}', 'storm{i}@bench.test', 'student', 'Storm {i}', '{USER_PASSWORD}')"
                ))
                .await;
            let browsed = client.simple_query("SELECT * FROM teacher_profiles").await;
            if signed_up.is_ok() && browsed.is_ok() {
                success.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections: {ok}/{n_conns} signed up and browsed in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("LESSONBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("LESSONBOOK_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid LESSONBOOK_PORT"),
        password: std::env::var("LESSONBOOK_PASSWORD").unwrap_or_else(|_| "lessonbook".into()),
        operator: std::env::var("LESSONBOOK_OPERATOR_USER").unwrap_or_else(|_| "admin".into()),
    };

    println!("=== lessonbook stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase uses its own tenant to avoid interference.

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] students racing for the same slots");
    phase2_contention(&target).await;

    println!("\n[phase 3] catalog reads under booking load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
