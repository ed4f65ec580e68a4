use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, Error, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use allocd::tenant::TenantManager;
use allocd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("allocd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "allocd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("allocd")
        .password("allocd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> Client {
    connect_db(addr, "school").await
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Rows reported by the command tag of a single statement.
async fn affected(client: &Client, sql: &str) -> u64 {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(n),
            _ => None,
        })
        .unwrap()
}

fn sqlstate(err: &Error) -> &str {
    err.code().map(|c| c.code()).unwrap_or("")
}

fn db_message(err: &Error) -> String {
    err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default()
}

struct Fixture {
    user: Ulid,
    room: Ulid,
}

async fn seed(client: &Client) -> Fixture {
    let user = Ulid::new();
    let room = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, username) VALUES ('{user}', 'admin');
             INSERT INTO resources (id, name, \"type\") VALUES ('{room}', 'Room A', 'room')"
        ))
        .await
        .unwrap();
    Fixture { user, room }
}

async fn create_event(client: &Client, owner: Ulid, title: &str, start: &str, end: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, user_id, title, start, "end") VALUES ('{id}', '{owner}', '{title}', '{start}', '{end}')"#
        ))
        .await
        .unwrap();
    id
}

fn allocate_sql(event: Ulid, resource: Ulid) -> String {
    format!(
        "INSERT INTO allocations (id, event_id, resource_id) VALUES ('{}', '{event}', '{resource}')",
        Ulid::new()
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn register_and_list() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;

    let users = select(&client, "SELECT * FROM users").await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get("id"), Some(fx.user.to_string().as_str()));
    assert_eq!(users[0].get("username"), Some("admin"));
    assert_eq!(users[0].get("mobile"), None);

    let resources = select(&client, "SELECT * FROM resources").await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].get("name"), Some("Room A"));
    assert_eq!(resources[0].get("type"), Some("room"));
}

#[tokio::test]
async fn overlapping_allocation_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;

    let e1 = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;
    let e2 = create_event(&client, fx.user, "Event2", "2025-12-25T10:00", "2025-12-25T12:00").await;
    let e3 = create_event(&client, fx.user, "Event3", "2025-12-25T11:00", "2025-12-25T13:00").await;

    client.batch_execute(&allocate_sql(e1, fx.room)).await.unwrap();

    let err = client.batch_execute(&allocate_sql(e2, fx.room)).await.unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    let msg = db_message(&err);
    assert!(msg.contains("Event1"), "{msg}");
    assert!(msg.contains("2025-12-25T09:00:00"), "{msg}");

    // Back-to-back is fine.
    client.batch_execute(&allocate_sql(e3, fx.room)).await.unwrap();

    let held = select(
        &client,
        &format!("SELECT * FROM allocations WHERE resource_id = '{}'", fx.room),
    )
    .await;
    let titles: Vec<_> = held.iter().filter_map(|r| r.get("event_title")).collect();
    assert_eq!(titles, vec!["Event1", "Event3"]);
}

#[tokio::test]
async fn repeat_allocation_reports_zero_rows() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let event = create_event(&client, fx.user, "Workshop", "2025-12-25T09:00", "2025-12-25T11:00").await;

    assert_eq!(affected(&client, &allocate_sql(event, fx.room)).await, 1);
    assert_eq!(affected(&client, &allocate_sql(event, fx.room)).await, 0);

    let rows = select(
        &client,
        &format!("SELECT * FROM allocations WHERE event_id = '{event}'"),
    )
    .await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn conflicts_query_lists_overlaps() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let event = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;
    client.batch_execute(&allocate_sql(event, fx.room)).await.unwrap();

    let sql = format!(
        r#"SELECT * FROM conflicts WHERE resource_id = '{}' AND start = '2025-12-25T10:30' AND "end" = '2025-12-25T12:00'"#,
        fx.room
    );
    let rows = select(&client, &sql).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("event_id"), Some(event.to_string().as_str()));
    assert_eq!(rows[0].get("start"), Some("2025-12-25T09:00:00"));

    let excluded = format!("{} AND exclude_event_id = '{event}'", sql);
    assert!(select(&client, &excluded).await.is_empty());
}

#[tokio::test]
async fn reschedule_into_conflict_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let e1 = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;
    let e2 = create_event(&client, fx.user, "Event2", "2025-12-25T12:00", "2025-12-25T13:00").await;
    client.batch_execute(&allocate_sql(e1, fx.room)).await.unwrap();
    client.batch_execute(&allocate_sql(e2, fx.room)).await.unwrap();

    let err = client
        .batch_execute(&format!(
            r#"UPDATE events SET start = '2025-12-25T10:00', "end" = '2025-12-25T12:30' WHERE id = '{e2}' AND user_id = '{}'"#,
            fx.user
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    let events = select(&client, "SELECT * FROM events").await;
    let moved = events
        .iter()
        .find(|r| r.get("id") == Some(e2.to_string().as_str()))
        .unwrap();
    assert_eq!(moved.get("start"), Some("2025-12-25T12:00:00"));
}

#[tokio::test]
async fn edit_keeps_unset_fields() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let event = create_event(&client, fx.user, "Draft", "2025-12-25T09:00", "2025-12-25T11:00").await;

    let n = affected(
        &client,
        &format!(
            "UPDATE events SET title = 'Final', description = 'Bring laptops' WHERE id = '{event}' AND user_id = '{}'",
            fx.user
        ),
    )
    .await;
    assert_eq!(n, 1);

    let rows = select(&client, &format!("SELECT * FROM events WHERE user_id = '{}'", fx.user)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some("Final"));
    assert_eq!(rows[0].get("description"), Some("Bring laptops"));
    assert_eq!(rows[0].get("end"), Some("2025-12-25T11:00:00"));
}

#[tokio::test]
async fn non_owner_is_unauthorized() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let event = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;

    let intruder = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO users (id, username) VALUES ('{intruder}', 'mallory')"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("DELETE FROM events WHERE id = '{event}' AND user_id = '{intruder}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let err = client
        .batch_execute(&format!(
            "INSERT INTO allocations VALUES ('{}', '{event}', '{}', '{intruder}')",
            Ulid::new(),
            fx.room
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
    assert_eq!(select(&client, "SELECT * FROM events").await.len(), 1);
}

#[tokio::test]
async fn delete_event_releases_resources() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let e1 = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;
    let e2 = create_event(&client, fx.user, "Event2", "2025-12-25T09:00", "2025-12-25T11:00").await;
    client.batch_execute(&allocate_sql(e1, fx.room)).await.unwrap();

    client
        .batch_execute(&format!("DELETE FROM events WHERE id = '{e1}' AND user_id = '{}'", fx.user))
        .await
        .unwrap();
    assert!(select(&client, "SELECT * FROM allocations").await.is_empty());
    client.batch_execute(&allocate_sql(e2, fx.room)).await.unwrap();
}

#[tokio::test]
async fn utilization_report_rows() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let lab = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, \"type\") VALUES ('{lab}', 'Lab', 'room')"
        ))
        .await
        .unwrap();

    let e1 = create_event(&client, fx.user, "Event1", "2099-12-25T09:00", "2099-12-25T11:00").await;
    let e2 = create_event(&client, fx.user, "Event2", "2099-12-26T09:00", "2099-12-26T09:30").await;
    client.batch_execute(&allocate_sql(e1, fx.room)).await.unwrap();
    client.batch_execute(&allocate_sql(e2, fx.room)).await.unwrap();

    let rows = select(
        &client,
        r#"SELECT * FROM utilization WHERE start = '2099-12-01' AND "end" = '2099-12-31'"#,
    )
    .await;
    assert_eq!(rows.len(), 2);

    let room = rows
        .iter()
        .find(|r| r.get("resource_id") == Some(fx.room.to_string().as_str()))
        .unwrap();
    let hours: f64 = room.get("total_hours_utilized").unwrap().parse().unwrap();
    assert_eq!(hours, 2.5);
    let upcoming: serde_json::Value = serde_json::from_str(room.get("upcoming").unwrap()).unwrap();
    assert_eq!(upcoming.as_array().unwrap().len(), 2);
    assert_eq!(upcoming[0]["title"], "Event1");

    let idle = rows
        .iter()
        .find(|r| r.get("resource_id") == Some(lab.to_string().as_str()))
        .unwrap();
    assert_eq!(idle.get("total_hours_utilized").unwrap().parse::<f64>().unwrap(), 0.0);
    assert_eq!(idle.get("upcoming"), Some("[]"));
}

#[tokio::test]
async fn invalid_input_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, user_id, title, start, "end") VALUES ('{}', '{}', 'x', 'next tuesday', '2025-12-25T11:00')"#,
            Ulid::new(),
            fx.user
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22007");

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, user_id, title, start, "end") VALUES ('{}', '{}', 'x', '2025-12-25T11:00', '2025-12-25T09:00')"#,
            Ulid::new(),
            fx.user
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, user_id, title, start, "end") VALUES ('{}', '{}', 'x', '2025-12-25T09:00', '2025-12-25T11:00')"#,
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23503");

    let err = client.batch_execute("SELECT * FROM rooms").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42P01");
}

#[tokio::test]
async fn parameterized_insert() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    let n = client
        .execute(
            "INSERT INTO users (id, username) VALUES ($1, $2)",
            &[&id, &"o'brien"],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);

    let users = select(&client, "SELECT * FROM users").await;
    assert_eq!(users[0].get("username"), Some("o'brien"));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let a = connect_db(addr, "school_a").await;
    let b = connect_db(addr, "school_b").await;

    seed(&a).await;
    assert_eq!(select(&a, "SELECT * FROM users").await.len(), 1);
    assert!(select(&b, "SELECT * FROM users").await.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn unsupported_filters_leave_rows_alone() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let event = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;

    let err = client
        .batch_execute(&format!(
            "DELETE FROM events WHERE id = '{event}' AND user_id = '{}' AND title = 'only-if-this'",
            fx.user
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42703");

    let err = client
        .batch_execute(&format!(
            "UPDATE events SET title = 'x' WHERE id = '{event}' AND user_id = '{}' AND start = '2025-12-25T09:00'",
            fx.user
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42703");

    let events = select(&client, "SELECT * FROM events").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get("title"), Some("Event1"));
}

#[tokio::test]
async fn single_bound_update_keeps_the_other() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let fx = seed(&client).await;
    let event = create_event(&client, fx.user, "Event1", "2025-12-25T09:00", "2025-12-25T11:00").await;

    let n = affected(
        &client,
        &format!(
            r#"UPDATE events SET "end" = '2025-12-25T12:00' WHERE id = '{event}' AND user_id = '{}'"#,
            fx.user
        ),
    )
    .await;
    assert_eq!(n, 1);
    let n = affected(
        &client,
        &format!("UPDATE users SET mobile = '555-0100' WHERE id = '{}'", fx.user),
    )
    .await;
    assert_eq!(n, 1);

    let events = select(&client, "SELECT * FROM events").await;
    assert_eq!(events[0].get("start"), Some("2025-12-25T09:00:00"));
    assert_eq!(events[0].get("end"), Some("2025-12-25T12:00:00"));
    assert_eq!(events[0].get("title"), Some("Event1"));
    let users = select(&client, "SELECT * FROM users").await;
    assert_eq!(users[0].get("username"), Some("admin"));
    assert_eq!(users[0].get("mobile"), Some("555-0100"));
}
