//! Unified query executor.
//!
//! Every database access from the resolver, the authorization engine, and
//! the credit engine goes through this façade. No call site picks its own
//! client: the executor owns the privileged / delegated / anonymous policy,
//! including the demotion fallback when the privileged credential is
//! rejected mid-flight.
//!
//! Timeouts are enforced here, on the outer scheduling scope, not by the
//! driver alone: a slow statement cannot hold an authorization worker past
//! its budget.
//!
//! Delegated and anonymous transactions are tagged with transaction-local
//! `request.role` / `request.jwt.claims` / `request.jwt.token` settings;
//! the row-level policies in the schema key off those, so a delegated
//! connection is restricted by the database itself, not just by the
//! authorization engine above it.

use crate::credential::{CredentialGate, GateMode};
use crate::db::pools::{PoolKind, PoolManager};
use crate::errors::DbError;
use crate::observability::metrics::record_db_query;
use crate::token::ValidatedToken;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::QueryAs;
use sqlx::{Connection, Postgres};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

// Timeout taxonomy. Callers pick the bucket that matches their operation.

/// Single-row select on the authorization hot path.
pub const AUTH_SELECT_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Materialized-view authorization check.
pub const AUTHZ_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// General-purpose query.
pub const GENERAL_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Bulk/batch statement.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Migration or admin maintenance statement.
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum interval between demotion log lines for the same caller tag.
const DEMOTION_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Operation requested of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    Select,
    Insert,
    Update,
    Delete,
    Rpc,
}

impl QueryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOp::Select => "select",
            QueryOp::Insert => "insert",
            QueryOp::Update => "update",
            QueryOp::Delete => "delete",
            QueryOp::Rpc => "rpc",
        }
    }
}

/// A bind parameter. Column and table names are compile-time constants;
/// only values travel as parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Uuid(uuid::Uuid),
    Text(String),
    Int4(i32),
    Int8(i64),
    Bool(bool),
    Json(serde_json::Value),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

/// Comparison applied by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lte,
}

impl FilterOp {
    fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Gte => ">=",
            FilterOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub column: &'static str,
    pub op: FilterOp,
    pub value: SqlParam,
}

/// Identity placed on a delegated connection: the raw bearer token plus
/// the validated subject, both fed to the transaction-local `request.*`
/// settings that the row-level policies read. The token is redacted in
/// Debug output.
#[derive(Clone)]
pub struct DelegatedAuth {
    pub token: String,
    pub user_id: uuid::Uuid,
}

impl From<&ValidatedToken> for DelegatedAuth {
    fn from(token: &ValidatedToken) -> Self {
        Self {
            token: token.raw.clone(),
            user_id: token.user_id,
        }
    }
}

impl fmt::Debug for DelegatedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedAuth")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// One request against the façade.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub table: &'static str,
    pub op: QueryOp,
    pub filters: Vec<Filter>,
    pub data: Vec<(&'static str, SqlParam)>,
    pub order_by: Option<(&'static str, bool)>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub use_privileged: bool,
    pub token: Option<DelegatedAuth>,
    pub serializable: bool,
    pub timeout: Duration,
    pub pool: PoolKind,
    pub tag: &'static str,
}

impl QueryRequest {
    fn new(table: &'static str, op: QueryOp, pool: PoolKind, tag: &'static str) -> Self {
        Self {
            table,
            op,
            filters: Vec::new(),
            data: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            use_privileged: false,
            token: None,
            serializable: false,
            timeout: GENERAL_QUERY_TIMEOUT,
            pool,
            tag,
        }
    }

    pub fn select(table: &'static str, pool: PoolKind, tag: &'static str) -> Self {
        Self::new(table, QueryOp::Select, pool, tag)
    }

    pub fn insert(table: &'static str, pool: PoolKind, tag: &'static str) -> Self {
        Self::new(table, QueryOp::Insert, pool, tag)
    }

    pub fn update(table: &'static str, pool: PoolKind, tag: &'static str) -> Self {
        Self::new(table, QueryOp::Update, pool, tag)
    }

    pub fn delete(table: &'static str, pool: PoolKind, tag: &'static str) -> Self {
        Self::new(table, QueryOp::Delete, pool, tag)
    }

    /// Call a SQL function: `SELECT * FROM {function}(args...)`.
    pub fn rpc(function: &'static str, pool: PoolKind, tag: &'static str) -> Self {
        Self::new(function, QueryOp::Rpc, pool, tag)
    }

    pub fn filter(mut self, column: &'static str, value: SqlParam) -> Self {
        self.filters.push(Filter {
            column,
            op: FilterOp::Eq,
            value,
        });
        self
    }

    pub fn filter_gte(mut self, column: &'static str, value: SqlParam) -> Self {
        self.filters.push(Filter {
            column,
            op: FilterOp::Gte,
            value,
        });
        self
    }

    pub fn filter_lte(mut self, column: &'static str, value: SqlParam) -> Self {
        self.filters.push(Filter {
            column,
            op: FilterOp::Lte,
            value,
        });
        self
    }

    /// Column value for insert/update, or a positional rpc argument.
    pub fn data(mut self, column: &'static str, value: SqlParam) -> Self {
        self.data.push((column, value));
        self
    }

    pub fn order_by(mut self, column: &'static str, desc: bool) -> Self {
        self.order_by = Some((column, desc));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Prefer the privileged client if the gate currently allows it.
    pub fn privileged(mut self) -> Self {
        self.use_privileged = true;
        self
    }

    /// Bearer token for delegated mode (and for the demotion fallback).
    pub fn with_token(mut self, token: Option<&ValidatedToken>) -> Self {
        self.token = token.map(DelegatedAuth::from);
        self
    }

    /// Run inside a SERIALIZABLE transaction (admin maintenance only).
    pub fn serializable(mut self) -> Self {
        self.serializable = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Which client a request runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Privileged,
    Delegated,
    Anonymous,
}

impl ClientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Privileged => "privileged",
            ClientMode::Delegated => "delegated",
            ClientMode::Anonymous => "anonymous",
        }
    }
}

/// Client selection policy, in order:
/// 1. privileged requested AND the gate says privileged is valid
/// 2. a bearer token is available: delegated
/// 3. anonymous (policy-restricted to public data)
pub fn select_client(use_privileged: bool, gate: GateMode, has_token: bool) -> ClientMode {
    if use_privileged && gate == GateMode::Privileged {
        ClientMode::Privileged
    } else if has_token {
        ClientMode::Delegated
    } else {
        ClientMode::Anonymous
    }
}

/// Build the SQL text and ordered bind parameters for a request.
///
/// Identifiers come from compile-time constants in the services; only values
/// are bound.
pub fn build_sql(req: &QueryRequest) -> (String, Vec<SqlParam>) {
    let mut params: Vec<SqlParam> = Vec::new();

    let sql = match req.op {
        QueryOp::Select => {
            let mut sql = format!("SELECT * FROM {}", req.table);
            append_where(&req.filters, &mut params, &mut sql);
            if let Some((column, desc)) = req.order_by {
                sql.push_str(&format!(
                    " ORDER BY {column}{}",
                    if desc { " DESC" } else { "" }
                ));
            }
            if let Some(limit) = req.limit {
                params.push(SqlParam::Int8(limit));
                sql.push_str(&format!(" LIMIT ${}", params.len()));
            }
            if let Some(offset) = req.offset {
                params.push(SqlParam::Int8(offset));
                sql.push_str(&format!(" OFFSET ${}", params.len()));
            }
            sql
        }
        QueryOp::Insert => {
            let columns: Vec<&str> = req.data.iter().map(|(c, _)| *c).collect();
            let mut values = Vec::with_capacity(req.data.len());
            for (_, value) in &req.data {
                params.push(value.clone());
                values.push(format!("${}", params.len()));
            }
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                req.table,
                columns.join(", "),
                values.join(", ")
            )
        }
        QueryOp::Update => {
            let mut assignments = Vec::with_capacity(req.data.len());
            for (column, value) in &req.data {
                params.push(value.clone());
                assignments.push(format!("{column} = ${}", params.len()));
            }
            let mut sql = format!("UPDATE {} SET {}", req.table, assignments.join(", "));
            append_where(&req.filters, &mut params, &mut sql);
            sql.push_str(" RETURNING *");
            sql
        }
        QueryOp::Delete => {
            let mut sql = format!("DELETE FROM {}", req.table);
            append_where(&req.filters, &mut params, &mut sql);
            sql.push_str(" RETURNING *");
            sql
        }
        QueryOp::Rpc => {
            let mut args = Vec::with_capacity(req.data.len());
            for (_, value) in &req.data {
                params.push(value.clone());
                args.push(format!("${}", params.len()));
            }
            format!("SELECT * FROM {}({})", req.table, args.join(", "))
        }
    };

    (sql, params)
}

fn append_where(filters: &[Filter], params: &mut Vec<SqlParam>, sql: &mut String) {
    if filters.is_empty() {
        return;
    }
    let clauses: Vec<String> = filters
        .iter()
        .map(|f| {
            params.push(f.value.clone());
            format!("{} {} ${}", f.column, f.op.sql(), params.len())
        })
        .collect();
    sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
}

fn bind_param<'q, T>(
    query: QueryAs<'q, Postgres, T, PgArguments>,
    param: &SqlParam,
) -> QueryAs<'q, Postgres, T, PgArguments> {
    match param {
        SqlParam::Uuid(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
        SqlParam::Int4(v) => query.bind(*v),
        SqlParam::Int8(v) => query.bind(*v),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Json(v) => query.bind(v.clone()),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

pub struct QueryExecutor {
    pools: Arc<PoolManager>,
    gate: Arc<CredentialGate>,
    demotion_log: Mutex<HashMap<&'static str, Instant>>,
}

impl QueryExecutor {
    pub fn new(pools: Arc<PoolManager>, gate: Arc<CredentialGate>) -> Self {
        Self {
            pools,
            gate,
            demotion_log: Mutex::new(HashMap::new()),
        }
    }

    pub fn gate(&self) -> &Arc<CredentialGate> {
        &self.gate
    }

    /// Fetch all rows produced by the request.
    pub async fn fetch_all<T>(&self, req: QueryRequest) -> Result<Vec<T>, DbError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let started = Instant::now();
        let result = self.run::<T>(&req).await;
        record_db_query(
            req.op.as_str(),
            req.table,
            if result.is_ok() { "success" } else { "error" },
            started.elapsed(),
        );
        result
    }

    /// Fetch at most one row.
    pub async fn fetch_optional<T>(&self, req: QueryRequest) -> Result<Option<T>, DbError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        Ok(self.fetch_all::<T>(req).await?.into_iter().next())
    }

    /// Execute a statement whose rows the caller does not need; returns the
    /// number of rows the statement produced or touched.
    pub async fn execute(&self, req: QueryRequest) -> Result<u64, DbError> {
        let rows = self.fetch_all::<EmptyRow>(req).await?;
        Ok(rows.len() as u64)
    }

    async fn run<T>(&self, req: &QueryRequest) -> Result<Vec<T>, DbError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let mode = select_client(
            req.use_privileged,
            self.gate.mode().await,
            req.token.is_some(),
        );

        let result = self.attempt::<T>(req, mode).await;

        // Fallback rule: a credential rejection on the privileged client
        // demotes to delegated immediately, if a token is available.
        if mode == ClientMode::Privileged {
            if let Err(e @ DbError::CredentialRejected(_)) = &result {
                self.gate.record_privileged_failure(e).await;
                self.log_demotion(req.tag);
                if req.token.is_some() {
                    return self.attempt::<T>(req, ClientMode::Delegated).await;
                }
            }
        }

        result
    }

    async fn attempt<T>(&self, req: &QueryRequest, mode: ClientMode) -> Result<Vec<T>, DbError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let timeout_ms = u64::try_from(req.timeout.as_millis()).unwrap_or(u64::MAX);
        let outcome =
            match tokio::time::timeout(req.timeout, self.attempt_inner::<T>(req, mode)).await {
                Ok(result) => result,
                Err(_) => Err(DbError::Timeout {
                    op: req.tag,
                    timeout_ms,
                }),
            };
        self.pools.record_query_outcome(req.pool, outcome.as_ref().err());
        outcome
    }

    async fn attempt_inner<T>(
        &self,
        req: &QueryRequest,
        mode: ClientMode,
    ) -> Result<Vec<T>, DbError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let mut lease = self.pools.acquire(req.pool).await?;
        let mut tx = (&mut *lease)
            .begin()
            .await
            .map_err(|e| DbError::classify(&e))?;

        if req.serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::classify(&e))?;
        }

        // Session authorization is transaction-local (`set_config` with
        // is_local = true) so the token is cleared with the transaction.
        // The row-level policies read request.role and the claims subject;
        // privileged transactions set nothing and fall into the service
        // policies.
        match mode {
            ClientMode::Privileged => {}
            ClientMode::Delegated => {
                let auth = req
                    .token
                    .as_ref()
                    .ok_or_else(|| DbError::Unknown("delegated mode without token".into()))?;
                let claims = serde_json::json!({
                    "sub": auth.user_id,
                    "role": "authenticated",
                })
                .to_string();
                sqlx::query(
                    "SELECT set_config('request.jwt.token', $1, true), \
                     set_config('request.jwt.claims', $2, true), \
                     set_config('request.role', $3, true)",
                )
                .bind(&auth.token)
                .bind(claims)
                .bind("authenticated")
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::classify(&e))?;
            }
            ClientMode::Anonymous => {
                sqlx::query(
                    "SELECT set_config('request.jwt.token', $1, true), \
                     set_config('request.jwt.claims', $2, true), \
                     set_config('request.role', $3, true)",
                )
                .bind("")
                .bind("")
                .bind("anon")
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::classify(&e))?;
            }
        }

        let (sql, params) = build_sql(req);
        let mut query = sqlx::query_as::<_, T>(&sql);
        for param in &params {
            query = bind_param(query, param);
        }

        let rows = query
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DbError::classify(&e))?;

        tx.commit().await.map_err(|e| DbError::classify(&e))?;
        Ok(rows)
    }

    /// Log a privileged→delegated demotion, throttled per caller tag.
    fn log_demotion(&self, tag: &'static str) {
        let should_log = {
            let Ok(mut log) = self.demotion_log.lock() else {
                return;
            };
            let now = Instant::now();
            match log.get(tag) {
                Some(last) if now.duration_since(*last) < DEMOTION_LOG_INTERVAL => false,
                _ => {
                    log.insert(tag, now);
                    true
                }
            }
        };

        if should_log {
            warn!(
                target: "authz.db.executor",
                tag = tag,
                "Privileged client rejected, demoting request to delegated mode"
            );
        }
    }
}

/// Row type for statements whose output is ignored.
#[derive(Debug)]
struct EmptyRow;

impl sqlx::FromRow<'_, PgRow> for EmptyRow {
    fn from_row(_row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(EmptyRow)
    }
}
