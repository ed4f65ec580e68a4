use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat,
    FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::SharedPasswordAuth;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;
use crate::timefmt::{format_timestamp, local_now_ms};

pub struct AllocdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AllocdQueryParser>,
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn insert_tag(rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("INSERT").with_rows(rows))]
}

fn update_tag() -> Vec<Response> {
    vec![Response::Execution(Tag::new("UPDATE").with_rows(1))]
}

fn delete_tag() -> Vec<Response> {
    vec![Response::Execution(Tag::new("DELETE").with_rows(1))]
}

impl AllocdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AllocdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn parse(&self, query: &str, batch: bool) -> PgWireResult<Vec<Command>> {
        let parsed = if batch {
            sql::parse_batch(query)
        } else {
            sql::parse_sql(query).map(|cmd| vec![cmd])
        };
        parsed.map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })
    }

    /// Run statements in order. A failing statement ends the batch; the
    /// responses of the ones before it are kept.
    async fn run_batch(&self, engine: &Engine, cmds: Vec<Command>) -> PgWireResult<Vec<Response>> {
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            match self.run(engine, cmd).await {
                Ok(mut r) => responses.append(&mut r),
                Err(PgWireError::UserError(info)) => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }

    /// Execute one command and record its metrics.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUser { id, username } => {
                engine.register_user(id, &username).await.map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::UpdateUser {
                id,
                username,
                mobile,
                address,
            } => {
                engine
                    .update_profile(id, username.as_deref(), mobile, address)
                    .await
                    .map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::InsertResource { id, name, kind } => {
                engine.create_resource(id, &name, &kind).await.map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::UpdateResource { id, name, kind } => {
                engine
                    .update_resource(id, name.as_deref(), kind.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(update_tag())
            }
            Command::InsertEvent {
                id,
                user_id,
                title,
                start,
                end,
                description,
            } => {
                engine
                    .create_event(id, user_id, &title, start, end, description)
                    .await
                    .map_err(engine_err)?;
                Ok(insert_tag(1))
            }
            Command::UpdateEvent {
                id,
                user_id,
                title,
                start,
                end,
                description,
            } => {
                match (title, start, end, description) {
                    (None, Some(start), Some(end), None) => engine
                        .reschedule_event(id, start, end, user_id)
                        .await
                        .map_err(engine_err)?,
                    (title, start, end, description) => engine
                        .edit_event(id, user_id, title.as_deref(), start, end, description)
                        .await
                        .map_err(engine_err)?,
                };
                Ok(update_tag())
            }
            Command::DeleteEvent { id, user_id } => {
                engine.delete_event(id, user_id).await.map_err(engine_err)?;
                Ok(delete_tag())
            }
            Command::InsertAllocation {
                id,
                event_id,
                resource_id,
                user_id,
            } => match engine
                .allocate_resource(id, event_id, resource_id, user_id)
                .await
            {
                Ok(_) => Ok(insert_tag(1)),
                Err(e) if e.is_noop() => {
                    debug!("{e}");
                    Ok(insert_tag(0))
                }
                Err(e) => Err(engine_err(e)),
            },
            Command::DeleteAllocation { id, user_id } => {
                engine
                    .deallocate_resource(id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(delete_tag())
            }
            Command::SelectUsers => {
                let users = engine.list_users().await;
                rows_response(Table::Users, users.iter().map(encode_user))
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                rows_response(Table::Resources, resources.iter().map(encode_resource))
            }
            Command::SelectEvents { user_id } => {
                let events = engine.list_events(user_id).await;
                rows_response(Table::Events, events.iter().map(encode_event))
            }
            Command::SelectAllocations {
                resource_id,
                event_id,
            } => {
                let allocations = match (resource_id, event_id) {
                    (Some(rid), Some(eid)) => engine
                        .allocations_for_resource(&rid)
                        .await
                        .into_iter()
                        .filter(|a| a.event_id == eid)
                        .collect(),
                    (Some(rid), None) => engine.allocations_for_resource(&rid).await,
                    (None, Some(eid)) => engine.allocations_for_event(&eid).await,
                    (None, None) => engine.all_allocations().await,
                };
                rows_response(Table::Allocations, allocations.iter().map(encode_allocation))
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude_event_id,
            } => {
                let conflicts = engine
                    .find_conflicts(&resource_id, start, end, exclude_event_id)
                    .await
                    .map_err(engine_err)?;
                rows_response(Table::Allocations, conflicts.iter().map(encode_allocation))
            }
            Command::SelectUtilization { start, end } => {
                let report = engine
                    .utilization_report(start, end, local_now_ms())
                    .await
                    .map_err(engine_err)?;
                rows_response(Table::Utilization, report.iter().map(encode_utilization))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Table {
    Users,
    Resources,
    Events,
    /// Also the shape of `conflicts`.
    Allocations,
    Utilization,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "users" => Some(Table::Users),
            "resources" => Some(Table::Resources),
            "events" => Some(Table::Events),
            "allocations" | "conflicts" => Some(Table::Allocations),
            "utilization" => Some(Table::Utilization),
            _ => None,
        }
    }

    fn schema(self) -> Vec<FieldInfo> {
        let text = |name: &str| FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text);
        match self {
            Table::Users => vec![text("id"), text("username"), text("mobile"), text("address")],
            Table::Resources => vec![text("id"), text("name"), text("type")],
            Table::Events => vec![
                text("id"),
                text("user_id"),
                text("title"),
                text("start"),
                text("end"),
                text("description"),
            ],
            Table::Allocations => vec![
                text("id"),
                text("event_id"),
                text("resource_id"),
                text("event_title"),
                text("start"),
                text("end"),
            ],
            Table::Utilization => vec![
                text("resource_id"),
                text("name"),
                text("type"),
                FieldInfo::new(
                    "total_hours_utilized".into(),
                    None,
                    None,
                    Type::FLOAT8,
                    FieldFormat::Text,
                ),
                text("upcoming"),
            ],
        }
    }
}

/// A row is a list of text-or-NULL cells, except for float columns.
enum Cell {
    Text(Option<String>),
    Float(f64),
}

fn rows_response<I>(table: Table, rows: I) -> PgWireResult<Vec<Response>>
where
    I: Iterator<Item = Vec<Cell>>,
{
    let schema = Arc::new(table.schema());
    let rows: Vec<PgWireResult<_>> = rows
        .map(|cells| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in cells {
                match cell {
                    Cell::Text(v) => encoder.encode_field(&v)?,
                    Cell::Float(f) => encoder.encode_field(&f)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn text(s: impl ToString) -> Cell {
    Cell::Text(Some(s.to_string()))
}

fn ts(ms: Ms) -> Cell {
    Cell::Text(Some(format_timestamp(ms)))
}

fn encode_user(u: &UserInfo) -> Vec<Cell> {
    vec![
        text(u.id),
        text(&u.username),
        Cell::Text(u.mobile.clone()),
        Cell::Text(u.address.clone()),
    ]
}

fn encode_resource(r: &ResourceInfo) -> Vec<Cell> {
    vec![text(r.id), text(&r.name), text(&r.kind)]
}

fn encode_event(e: &EventInfo) -> Vec<Cell> {
    vec![
        text(e.id),
        text(e.owner_id),
        text(&e.title),
        ts(e.start),
        ts(e.end),
        Cell::Text(e.description.clone()),
    ]
}

fn encode_allocation(a: &AllocationInfo) -> Vec<Cell> {
    vec![
        text(a.id),
        text(a.event_id),
        text(a.resource_id),
        text(&a.event_title),
        ts(a.start),
        ts(a.end),
    ]
}

fn encode_utilization(r: &ResourceUtilization) -> Vec<Cell> {
    let upcoming: Vec<serde_json::Value> = r
        .upcoming
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id.to_string(),
                "title": e.title,
                "start": format_timestamp(e.start),
                "end": format_timestamp(e.end),
            })
        })
        .collect();
    vec![
        text(r.resource_id),
        text(&r.name),
        text(&r.kind),
        Cell::Float(r.total_hours_utilized),
        text(serde_json::Value::Array(upcoming)),
    ]
}

/// Result columns for a statement, found from its FROM clause without
/// binding parameters.
fn describe_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    let mut words = sql.split_whitespace();
    let table = words
        .by_ref()
        .find(|w| w.eq_ignore_ascii_case("from"))
        .and_then(|_| words.next())
        .map(|w| w.trim_matches(|c| c == '"' || c == ';').to_lowercase());
    table
        .as_deref()
        .and_then(Table::from_name)
        .map(Table::schema)
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for AllocdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmds = self.parse(query, true)?;
        self.run_batch(&engine, cmds).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllocdQueryParser;

#[async_trait]
impl QueryParser for AllocdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllocdHandler {
    type Statement = String;
    type QueryParser = AllocdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut cmds = self.parse(&sql, false)?;
        let mut responses = self.run(&engine, cmds.remove(0)).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_sql(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_sql(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllocdFactory {
    handler: Arc<AllocdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllocdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(AllocdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllocdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(AllocdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ResourceConflict { .. } => "23P01",
        EngineError::Unauthorized { .. } => "42501",
        EngineError::ReferentialError(_) => "23503",
        EngineError::DuplicateAllocation { .. }
        | EngineError::AlreadyAllocated { .. }
        | EngineError::AlreadyExists(_)
        | EngineError::NameTaken(_) => "23505",
        EngineError::InvalidTimestamp(_) => "22007",
        EngineError::InvalidInterval { .. } | EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidTimestamp(_) => "22007",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MissingColumn(_) => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
