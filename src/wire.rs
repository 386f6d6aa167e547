use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::sasl::SASLAuthStartupHandler;
use pgwire::api::auth::sasl::scram::ScramAuth;
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

use crate::auth::{LessonbookAuthSource, Login};
use crate::engine::{Engine, EngineError, LessonChanges, ProfileChanges};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, Filters, Job, SqlError, View};
use crate::tenant::{DEFAULT_TENANT, TenantManager};

pub struct LessonbookHandler {
    tenant_manager: Arc<TenantManager>,
    operator_user: String,
    query_parser: Arc<LessonbookQueryParser>,
}

impl LessonbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, operator_user: String) -> Self {
        Self {
            tenant_manager,
            operator_user,
            query_parser: Arc::new(LessonbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// The login user name decides who acts. Deactivated or unknown
    /// users are rejected on every query, not only at startup.
    async fn resolve_actor<C: ClientInfo>(&self, client: &C, engine: &Engine) -> PgWireResult<Option<Actor>> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        let login = Login::parse(&user, &self.operator_user);
        let resolved = match login {
            Some(Login::Operator) => return Ok(Some(Actor::operator())),
            Some(Login::Anonymous) => return Ok(None),
            Some(Login::User(id)) => engine.resolve_actor(id).await.map_err(|e| e.to_string()),
            None => Err(format!("unknown login {user:?}")),
        };
        resolved.map(Some).map_err(|msg| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", msg)
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client, &engine).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, actor.as_ref(), cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Anonymous callers may sign up and browse the catalog, nothing else.
    async fn execute_anonymous(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser { id, email, role, display_name, password } => {
                register(engine, None, id, &email, role, &display_name, &password).await
            }
            Command::Select { view: View::OpenSlots, filters } => open_slots(engine, &filters).await,
            Command::Select { view: View::TeacherProfiles, filters } => {
                teacher_profiles(engine, None, &filters).await
            }
            _ => Err(user_error("42501", "login required".to_string())),
        }
    }

    async fn execute_command(&self, engine: &Engine, actor: Option<&Actor>, cmd: Command) -> PgWireResult<Response> {
        let Some(actor) = actor else {
            return self.execute_anonymous(engine, cmd).await;
        };

        match cmd {
            Command::InsertUser { id, email, role, display_name, password } => {
                register(engine, Some(actor), id, &email, role, &display_name, &password).await
            }
            Command::SetUserActive { user_id, active } => {
                engine.set_user_active(actor, user_id, active).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertTeacherProfile { id, user_id, display_name, bio, experience_years } => {
                engine
                    .create_teacher_profile(actor, id, user_id, &display_name, bio.as_deref(), experience_years)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateTeacherProfile { profile_id, display_name, bio, experience_years, approved } => {
                let changes = ProfileChanges { display_name, bio, experience_years, approved };
                engine
                    .update_teacher_profile(actor, profile_id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSlot { id, teacher_id, start, end } => {
                engine
                    .create_slot(actor, id, teacher_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteSlot { id } => {
                engine.cancel_slot(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertPackage { id, student_id, lessons_total, expires_at } => {
                engine
                    .create_package(actor, id, student_id, lessons_total, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertPayment { id, package_id, amount_cents, currency, external_reference } => {
                engine
                    .create_payment(actor, id, package_id, amount_cents, &currency, external_reference.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetPaymentStatus { payment_id, status } => {
                engine
                    .update_payment_status(actor, payment_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertHold { id, slot_id, package_id } => {
                engine
                    .hold_booking(actor, id, slot_id, package_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ConfirmBooking { booking_id } => {
                engine.confirm_booking(actor, booking_id).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelBooking { booking_id, reason } => {
                engine
                    .cancel_booking(actor, booking_id, reason.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RescheduleBooking { booking_id, new_booking_id, new_slot_id } => {
                engine
                    .reschedule_booking(actor, booking_id, new_booking_id, new_slot_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateLesson { lesson_id, status, topic, notes } => {
                let changes = LessonChanges { status, topic, notes };
                engine.update_lesson(actor, lesson_id, changes).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RunJob { job } => {
                let affected = match job {
                    Job::ExpireHolds => engine.expire_holds(actor).await.map_err(engine_err)?.len(),
                    Job::ExpirePackages => engine.expire_packages(actor).await.map_err(engine_err)?.len(),
                    Job::ProcessOutbox => {
                        let stats = engine.process_outbox(actor).await.map_err(engine_err)?;
                        stats.processed + stats.failed
                    }
                };
                Ok(inserted(affected))
            }
            Command::Select { view, filters } => self.select(engine, actor, view, filters).await,
        }
    }

    async fn select(&self, engine: &Engine, actor: &Actor, view: View, filters: Filters) -> PgWireResult<Response> {
        let page = &filters.page;
        match view {
            View::Users => {
                let user = engine
                    .get_user(actor, filters.id.unwrap_or(actor.id))
                    .await
                    .map_err(engine_err)?;
                user_rows(&[user])
            }
            View::Bookings => {
                let bookings = match filters.id {
                    Some(id) => vec![engine.get_booking(actor, id).await.map_err(engine_err)?],
                    None => engine.list_bookings(actor, page).await.map_err(engine_err)?.items,
                };
                booking_rows(&bookings)
            }
            View::Lessons => {
                let lessons = match filters.booking_id {
                    Some(booking_id) => {
                        engine.get_booking(actor, booking_id).await.map_err(engine_err)?;
                        engine.lesson_for_booking(booking_id).await.into_iter().collect()
                    }
                    None => engine.list_lessons(actor, page).await.map_err(engine_err)?.items,
                };
                lesson_rows(&lessons)
            }
            View::Packages => {
                let student_id = filters.student_id.unwrap_or(actor.id);
                let packages = engine
                    .list_student_packages(actor, student_id, page)
                    .await
                    .map_err(engine_err)?;
                package_rows(&packages.items)
            }
            View::Notifications => {
                let notifications = engine.list_my_notifications(actor, page).await.map_err(engine_err)?;
                notification_rows(&notifications.items)
            }
            View::Outbox => {
                let aggregate_id = filters
                    .aggregate_id
                    .ok_or_else(|| sql_err(SqlError::MissingFilter("aggregate_id")))?;
                let events = engine.outbox_for(actor, aggregate_id).await.map_err(engine_err)?;
                outbox_rows(&events)
            }
            View::AuditLog => {
                let entries = engine.list_audit_log(actor, page).await.map_err(engine_err)?;
                audit_rows(&entries.items)
            }
            View::KpiOverview => {
                let kpi = engine.kpi_overview(actor).await.map_err(engine_err)?;
                metric_rows(kpi_metrics(&kpi))
            }
            View::OperationsOverview => {
                let max_retries = engine.policy().outbox.max_retries;
                let ops = engine
                    .operations_overview(actor, max_retries)
                    .await
                    .map_err(engine_err)?;
                metric_rows(operations_metrics(&ops))
            }
            View::DeliveryMetrics => {
                let max_retries = engine.policy().outbox.max_retries;
                let delivery = engine.delivery_metrics(actor, max_retries).await.map_err(engine_err)?;
                metric_rows(delivery_metrics(&delivery))
            }
            View::OpenSlots => open_slots(engine, &filters).await,
            View::TeacherProfiles => teacher_profiles(engine, Some(actor), &filters).await,
        }
    }
}

async fn register(
    engine: &Engine,
    actor: Option<&Actor>,
    id: ulid::Ulid,
    email: &str,
    role: Role,
    display_name: &str,
    password: &str,
) -> PgWireResult<Response> {
    engine
        .register_user(actor, id, email, role, display_name, password)
        .await
        .map_err(engine_err)?;
    Ok(inserted(1))
}

async fn open_slots(engine: &Engine, filters: &Filters) -> PgWireResult<Response> {
    let page = engine
        .list_open_slots(filters.teacher_id, &filters.page)
        .await
        .map_err(engine_err)?;
    slot_rows(&page.items)
}

async fn teacher_profiles(engine: &Engine, actor: Option<&Actor>, filters: &Filters) -> PgWireResult<Response> {
    let page = engine
        .list_teacher_profiles(actor, &filters.page)
        .await
        .map_err(engine_err)?;
    profile_rows(&page.items)
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn fields(columns: &[(&str, Type)]) -> Vec<FieldInfo> {
    columns.iter().map(|(name, ty)| field(name, ty.clone())).collect()
}

/// Ids are text ULIDs and instants are epoch milliseconds.
pub fn view_schema(view: View) -> Vec<FieldInfo> {
    match view {
        View::Users => fields(&[
            ("id", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("role", Type::VARCHAR),
            ("display_name", Type::VARCHAR),
            ("active", Type::BOOL),
            ("created_at", Type::INT8),
        ]),
        View::OpenSlots => fields(&[
            ("id", Type::VARCHAR),
            ("teacher_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
        ]),
        View::TeacherProfiles => fields(&[
            ("id", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("display_name", Type::VARCHAR),
            ("bio", Type::VARCHAR),
            ("experience_years", Type::INT8),
            ("approved", Type::BOOL),
        ]),
        View::Bookings => fields(&[
            ("id", Type::VARCHAR),
            ("slot_id", Type::VARCHAR),
            ("student_id", Type::VARCHAR),
            ("teacher_id", Type::VARCHAR),
            ("package_id", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("hold_expires_at", Type::INT8),
            ("confirmed_at", Type::INT8),
            ("canceled_at", Type::INT8),
            ("cancellation_reason", Type::VARCHAR),
            ("refund_returned", Type::BOOL),
            ("rescheduled_from", Type::VARCHAR),
            ("created_at", Type::INT8),
        ]),
        View::Lessons => fields(&[
            ("id", Type::VARCHAR),
            ("booking_id", Type::VARCHAR),
            ("student_id", Type::VARCHAR),
            ("teacher_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("topic", Type::VARCHAR),
            ("notes", Type::VARCHAR),
        ]),
        View::Packages => fields(&[
            ("id", Type::VARCHAR),
            ("student_id", Type::VARCHAR),
            ("lessons_total", Type::INT8),
            ("lessons_left", Type::INT8),
            ("expires_at", Type::INT8),
            ("status", Type::VARCHAR),
        ]),
        View::Notifications => fields(&[
            ("id", Type::VARCHAR),
            ("channel", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("body", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("sent_at", Type::INT8),
            ("created_at", Type::INT8),
        ]),
        View::Outbox => fields(&[
            ("id", Type::VARCHAR),
            ("event_type", Type::VARCHAR),
            ("aggregate_type", Type::VARCHAR),
            ("aggregate_id", Type::VARCHAR),
            ("payload", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("retries", Type::INT8),
            ("error_message", Type::VARCHAR),
            ("occurred_at", Type::INT8),
            ("processed_at", Type::INT8),
        ]),
        View::AuditLog => fields(&[
            ("id", Type::VARCHAR),
            ("actor_id", Type::VARCHAR),
            ("action", Type::VARCHAR),
            ("entity_type", Type::VARCHAR),
            ("entity_id", Type::VARCHAR),
            ("payload", Type::VARCHAR),
            ("created_at", Type::INT8),
        ]),
        View::KpiOverview | View::OperationsOverview | View::DeliveryMetrics => {
            fields(&[("metric", Type::VARCHAR), ("value", Type::INT8)])
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn query_rows<T>(
    view: View,
    items: &[T],
    mut encode: impl FnMut(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(view_schema(view));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn id_text(id: Option<ulid::Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn user_rows(users: &[User]) -> PgWireResult<Response> {
    query_rows(View::Users, users, |enc, u| {
        enc.encode_field(&u.id.to_string())?;
        enc.encode_field(&u.email)?;
        enc.encode_field(&u.role.as_str())?;
        enc.encode_field(&u.display_name)?;
        enc.encode_field(&u.active)?;
        enc.encode_field(&u.created_at)
    })
}

fn slot_rows(slots: &[Slot]) -> PgWireResult<Response> {
    query_rows(View::OpenSlots, slots, |enc, s| {
        enc.encode_field(&s.id.to_string())?;
        enc.encode_field(&s.teacher_id.to_string())?;
        enc.encode_field(&s.span.start)?;
        enc.encode_field(&s.span.end)?;
        enc.encode_field(&s.status.as_str())
    })
}

fn profile_rows(profiles: &[TeacherProfile]) -> PgWireResult<Response> {
    query_rows(View::TeacherProfiles, profiles, |enc, p| {
        enc.encode_field(&p.id.to_string())?;
        enc.encode_field(&p.user_id.to_string())?;
        enc.encode_field(&p.display_name)?;
        enc.encode_field(&p.bio)?;
        enc.encode_field(&i64::from(p.experience_years))?;
        enc.encode_field(&p.approved)
    })
}

fn booking_rows(bookings: &[Booking]) -> PgWireResult<Response> {
    query_rows(View::Bookings, bookings, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.slot_id.to_string())?;
        enc.encode_field(&b.student_id.to_string())?;
        enc.encode_field(&b.teacher_id.to_string())?;
        enc.encode_field(&b.package_id.to_string())?;
        enc.encode_field(&b.status.as_str())?;
        enc.encode_field(&b.hold_expires_at)?;
        enc.encode_field(&b.confirmed_at)?;
        enc.encode_field(&b.canceled_at)?;
        enc.encode_field(&b.cancellation_reason)?;
        enc.encode_field(&b.refund_returned)?;
        enc.encode_field(&id_text(b.rescheduled_from))?;
        enc.encode_field(&b.created_at)
    })
}

fn lesson_rows(lessons: &[Lesson]) -> PgWireResult<Response> {
    query_rows(View::Lessons, lessons, |enc, l| {
        enc.encode_field(&l.id.to_string())?;
        enc.encode_field(&l.booking_id.to_string())?;
        enc.encode_field(&l.student_id.to_string())?;
        enc.encode_field(&l.teacher_id.to_string())?;
        enc.encode_field(&l.span.start)?;
        enc.encode_field(&l.span.end)?;
        enc.encode_field(&l.status.as_str())?;
        enc.encode_field(&l.topic)?;
        enc.encode_field(&l.notes)
    })
}

fn package_rows(packages: &[LessonPackage]) -> PgWireResult<Response> {
    query_rows(View::Packages, packages, |enc, p| {
        enc.encode_field(&p.id.to_string())?;
        enc.encode_field(&p.student_id.to_string())?;
        enc.encode_field(&i64::from(p.lessons_total))?;
        enc.encode_field(&i64::from(p.lessons_left))?;
        enc.encode_field(&p.expires_at)?;
        enc.encode_field(&p.status.as_str())
    })
}

fn notification_rows(notifications: &[Notification]) -> PgWireResult<Response> {
    query_rows(View::Notifications, notifications, |enc, n| {
        enc.encode_field(&n.id.to_string())?;
        enc.encode_field(&n.channel)?;
        enc.encode_field(&n.title)?;
        enc.encode_field(&n.body)?;
        enc.encode_field(&n.status.as_str())?;
        enc.encode_field(&n.sent_at)?;
        enc.encode_field(&n.created_at)
    })
}

fn outbox_rows(events: &[OutboxEvent]) -> PgWireResult<Response> {
    query_rows(View::Outbox, events, |enc, e| {
        let (aggregate_type, aggregate_id) = e.payload.aggregate();
        enc.encode_field(&e.id.to_string())?;
        enc.encode_field(&e.payload.event_type())?;
        enc.encode_field(&aggregate_type)?;
        enc.encode_field(&aggregate_id.to_string())?;
        enc.encode_field(&e.payload.to_json())?;
        enc.encode_field(&e.status.as_str())?;
        enc.encode_field(&i64::from(e.retries))?;
        enc.encode_field(&e.error_message)?;
        enc.encode_field(&e.occurred_at)?;
        enc.encode_field(&e.processed_at)
    })
}

fn audit_rows(entries: &[AuditEntry]) -> PgWireResult<Response> {
    query_rows(View::AuditLog, entries, |enc, a| {
        enc.encode_field(&a.id.to_string())?;
        enc.encode_field(&id_text(a.actor_id))?;
        enc.encode_field(&a.action)?;
        enc.encode_field(&a.entity_type)?;
        enc.encode_field(&a.entity_id)?;
        enc.encode_field(&a.payload)?;
        enc.encode_field(&a.created_at)
    })
}

type Metric = (&'static str, i64);

fn metric_rows(metrics: Vec<Metric>) -> PgWireResult<Response> {
    // All three dashboards share the metric/value layout.
    query_rows(View::KpiOverview, &metrics, |enc, (name, value)| {
        enc.encode_field(name)?;
        enc.encode_field(value)
    })
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn kpi_metrics(k: &KpiOverview) -> Vec<Metric> {
    vec![
        ("generated_at", k.generated_at),
        ("users_total", count(k.users_total())),
        ("users_students", count(k.users_students)),
        ("users_teachers", count(k.users_teachers)),
        ("users_admins", count(k.users_admins)),
        ("bookings_total", count(k.bookings_total())),
        ("bookings_hold", count(k.bookings_hold)),
        ("bookings_confirmed", count(k.bookings_confirmed)),
        ("bookings_canceled", count(k.bookings_canceled)),
        ("bookings_expired", count(k.bookings_expired)),
        ("lessons_scheduled", count(k.lessons_scheduled)),
        ("lessons_completed", count(k.lessons_completed)),
        ("lessons_canceled", count(k.lessons_canceled)),
        ("payments_pending", count(k.payments_pending)),
        ("payments_succeeded", count(k.payments_succeeded)),
        ("payments_failed", count(k.payments_failed)),
        ("payments_refunded", count(k.payments_refunded)),
        ("payments_succeeded_cents", k.payments_succeeded_cents),
        ("payments_refunded_cents", k.payments_refunded_cents),
        ("payments_net_cents", k.payments_net_cents()),
        ("packages_active", count(k.packages_active)),
        ("packages_expired", count(k.packages_expired)),
        ("packages_canceled", count(k.packages_canceled)),
    ]
}

fn operations_metrics(o: &OperationsOverview) -> Vec<Metric> {
    vec![
        ("generated_at", o.generated_at),
        ("max_retries", i64::from(o.max_retries)),
        ("outbox_pending", count(o.outbox_pending)),
        ("outbox_failed_retryable", count(o.outbox_failed_retryable)),
        ("outbox_failed_dead_letter", count(o.outbox_failed_dead_letter)),
        ("notifications_failed", count(o.notifications_failed)),
        ("stale_booking_holds", count(o.stale_booking_holds)),
        ("overdue_active_packages", count(o.overdue_active_packages)),
    ]
}

fn delivery_metrics(d: &DeliveryMetrics) -> Vec<Metric> {
    vec![
        ("max_retries", i64::from(d.max_retries)),
        ("notifications_total", count(d.notifications_total())),
        ("notifications_pending", count(d.notifications_pending)),
        ("notifications_sent", count(d.notifications_sent)),
        ("notifications_failed", count(d.notifications_failed)),
        ("outbox_total", count(d.outbox_total())),
        ("outbox_pending", count(d.outbox_pending)),
        ("outbox_processed", count(d.outbox_processed)),
        ("outbox_failed", count(d.outbox_failed)),
        ("outbox_retryable_failed", count(d.outbox_retryable_failed)),
        ("outbox_dead_letter", count(d.outbox_dead_letter)),
    ]
}

#[async_trait]
impl SimpleQueryHandler for LessonbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LessonbookQueryParser;

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::select_view(sql).map(view_schema).unwrap_or_default()
}

#[async_trait]
impl QueryParser for LessonbookQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LessonbookHandler {
    type Statement = String;
    type QueryParser = LessonbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, statement_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(statement_schema(&target.statement.statement)))
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

/// Inline bound text parameters as quoted literals. Higher placeholders go
/// first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
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

/// Shared per-server state; pgwire asks it for handlers once per connection.
pub struct LessonbookFactory {
    handler: Arc<LessonbookHandler>,
    auth_source: Arc<LessonbookAuthSource>,
    parameters: Arc<DefaultServerParameterProvider>,
    noop: Arc<NoopHandler>,
}

impl LessonbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, operator_password: &str, operator_user: String) -> Self {
        let auth_source = LessonbookAuthSource::new(tenant_manager.clone(), operator_user.clone(), operator_password);
        Self {
            handler: Arc::new(LessonbookHandler::new(tenant_manager, operator_user)),
            auth_source: Arc::new(auth_source),
            parameters: Arc::new(DefaultServerParameterProvider::default()),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LessonbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    /// SCRAM state lives in the handler, so every connection gets its own.
    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        let scram = ScramAuth::new(self.auth_source.clone());
        Arc::new(SASLAuthStartupHandler::new(self.parameters.clone()).with_scram(scram))
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<LessonbookFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::Conflict(_) => "23505",
        EngineError::Forbidden(_) => "42501",
        EngineError::BusinessRule(_) => "P0001",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn placeholder_count() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("INSERT INTO holds VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM lessons WHERE booking_id = $12"), 12);
        assert_eq!(count_params("costs $ nothing"), 0);
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::NotFound("booking", id)), "P0002");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
        assert_eq!(sqlstate(&EngineError::conflict("slot is booked")), "23505");
        assert_eq!(sqlstate(&EngineError::Forbidden("admins only")), "42501");
        assert_eq!(sqlstate(&EngineError::rule("package has no lessons left")), "P0001");
        assert_eq!(sqlstate(&EngineError::invalid("bad email")), "22023");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("too many")), "54000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn described_columns_follow_the_view() {
        let schema = statement_schema("SELECT * FROM bookings WHERE id = $1");
        assert_eq!(schema.len(), 13);
        assert_eq!(schema[0].name(), "id");
        assert_eq!(schema[6].datatype(), &Type::INT8);

        let metrics = statement_schema("SELECT * FROM delivery_metrics");
        assert_eq!(metrics.len(), 2);
        assert!(statement_schema("INSERT INTO jobs VALUES ('expire_holds')").is_empty());
    }

    #[test]
    fn kpi_rows_include_derived_totals() {
        let kpi = KpiOverview {
            users_students: 3,
            users_teachers: 2,
            users_admins: 1,
            payments_succeeded_cents: 5000,
            payments_refunded_cents: 1500,
            ..Default::default()
        };
        let rows = kpi_metrics(&kpi);
        let get = |name: &str| rows.iter().find(|(n, _)| *n == name).map(|(_, v)| *v);
        assert_eq!(get("users_total"), Some(6));
        assert_eq!(get("payments_net_cents"), Some(3500));
    }
}
