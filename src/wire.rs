use std::collections::HashSet;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::RoomdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct RoomdHandler {
    tenant_manager: Arc<TenantManager>,
    /// Administrator identities from deployment config; the engine itself
    /// only ever sees the resolved Actor.
    admins: Arc<HashSet<Ulid>>,
    query_parser: Arc<RoomdQueryParser>,
}

impl RoomdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admins: Arc<HashSet<Ulid>>) -> Self {
        Self {
            tenant_manager,
            admins,
            query_parser: Arc::new(RoomdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    fn resolve_actor(&self, actor_id: Ulid) -> Actor {
        Actor {
            id: actor_id,
            admin: self.admins.contains(&actor_id),
        }
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label, "status" => status
        )
        .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertRoom { id, name, capacity, status } => {
                engine
                    .register_room(id, name, capacity, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoom { id, name, capacity, status } => {
                // Partial SQL assignment over full-replacement engine update.
                let current = engine.get_room_info(id).await.map_err(engine_err)?;
                engine
                    .update_room(
                        id,
                        name.unwrap_or(current.name),
                        capacity.unwrap_or(current.capacity),
                        status.unwrap_or(current.status),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                room_id,
                requester_id,
                start,
                end,
                attendees,
                title,
                purpose,
            } => {
                // Raw client input — the engine's span validation decides,
                // so no Span::new here.
                let result = engine
                    .create_booking(
                        id,
                        room_id,
                        requester_id,
                        Span { start, end },
                        attendees,
                        title,
                        purpose,
                    )
                    .await;
                if let Err(EngineError::Conflict { .. }) = &result {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                result.map_err(engine_err)?;
                // The created reservation is the response body.
                let created = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![created])])
            }
            Command::CancelBooking { id, actor_id } => {
                let actor = self.resolve_actor(actor_id);
                engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                let updated = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![updated])])
            }
            Command::UpdateBooking { id, actor_id, title, purpose } => {
                let actor = self.resolve_actor(actor_id);
                engine
                    .update_booking_metadata(id, actor, title, purpose)
                    .await
                    .map_err(engine_err)?;
                let updated = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![updated])])
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms();
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&room.name)?;
                        encoder.encode_field(&(room.capacity as i32))?;
                        encoder.encode_field(&room.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { room_id, requester_id } => {
                let bookings = match (room_id, requester_id) {
                    (Some(rid), _) => engine.bookings_for_room(rid).await,
                    (None, Some(uid)) => engine.bookings_for_requester(uid).await,
                    (None, None) => engine.all_bookings().await,
                }
                .map_err(engine_err)?;
                Ok(vec![booking_rows(bookings)])
            }
            Command::SelectAvailability { room_id, start, end } => {
                let check = match end {
                    Some(end) => engine.check_window(room_id, Span { start, end }).await,
                    None => engine.check_slot(room_id, start).await,
                }
                .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&check.available)?;
                encoder.encode_field(&check.conflict.map(|s| s.start))?;
                encoder.encode_field(&check.conflict.map(|s| s.end))?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let room_id_str = channel.strip_prefix("room_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected room_{{id}})"),
                    )))
                })?;
                let _room_id = Ulid::from_string(room_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new(
            "requester_id".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("attendees".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("title".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("purpose".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new(
            "conflict_start".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "conflict_end".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn booking_rows(bookings: Vec<BookingInfo>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.requester_id.to_string())?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            encoder.encode_field(&(b.attendees as i32))?;
            encoder.encode_field(&b.title)?;
            encoder.encode_field(&b.purpose)?;
            encoder.encode_field(&b.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
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
        Ok(result_schema_for(stmt))
    }
}

/// Statement text → result schema, for Describe. INSERT/UPDATE on bookings
/// return the affected reservation row.
fn result_schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SELECT") && upper.contains("ROOMS") {
        rooms_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        admins: Arc<HashSet<Ulid>>,
    ) -> Self {
        let auth_source = RoomdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomdHandler::new(tenant_manager, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
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

/// Drive one client connection through the pgwire state machine.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    admins: Arc<HashSet<Ulid>>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoomdFactory::new(tenant_manager, password, admins));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Map engine errors to SQLSTATE codes so callers can tell a conflict from
/// a validation failure without string matching.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Conflict { .. } => "23P01", // exclusion_violation
        EngineError::Validation(_)
        | EngineError::CapacityExceeded(_)
        | EngineError::LimitExceeded(_) => "23514", // check_violation
        EngineError::Unauthorized(_) => "42501", // insufficient_privilege
        EngineError::NotFound(_) => "P0002",     // no_data_found
        EngineError::RoomUnavailable(_)
        | EngineError::InvalidTransition { .. }
        | EngineError::AlreadyExists(_)
        | EngineError::WalError(_) => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
