//! End-to-end scenarios against a real Postgres instance.
//!
//! Each test receives its own database with the workspace migrations
//! applied, builds a full core on top of it, and drives the inbound
//! operation surface the way a host transport would.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use authz_service::config::Config;
use authz_service::core::AuthzCore;
use authz_service::errors::{CoreError, ForbiddenReason};
use authz_service::models::{AccessOp, DecisionMethod, EffectiveRole, LedgerKind, ResourceType};
use chrono::Utc;
use common::jwt::Claims;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use std::collections::HashMap;
use uuid::Uuid;

const TEST_SECRET: &str = "integration-test-secret";
const TEST_ISSUER: &str = "https://issuer.test";

fn test_vars(database_url: String) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("AUTHZ_ENV".into(), "dev".into());
    vars.insert("DATABASE_URL".into(), database_url);
    vars.insert("SERVICE_CREDENTIAL".into(), "test-service-credential".into());
    vars.insert("TOKEN_ISSUER".into(), TEST_ISSUER.into());
    vars.insert("JWT_SECRET".into(), TEST_SECRET.into());
    // Keep the pools tiny: every test builds six of them
    for pool in ["AUTH", "READ", "WRITE", "ANALYTICS", "ADMIN", "BATCH"] {
        vars.insert(format!("DB_POOL_{pool}_MIN"), "0".into());
        vars.insert(format!("DB_POOL_{pool}_MAX"), "4".into());
    }
    vars
}

async fn start_core(connect_opts: PgConnectOptions) -> AuthzCore {
    let url = connect_opts.to_url_lossy().to_string();
    let config = Config::from_vars(&test_vars(url)).expect("test config should be valid");
    AuthzCore::start(config).await.expect("core should start")
}

fn jwt_for(user_id: Uuid, exp_offset_secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + exp_offset_secs,
        iat: Some(now),
        nbf: None,
        iss: Some(TEST_ISSUER.to_string()),
        aud: Some("authenticated".to_string()),
        email: Some(format!("{user_id}@example.com")),
        role: Some("user".to_string()),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("token should encode")
}

async fn seed_user(pool: &sqlx::PgPool, balance: i32) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (id, email, credits_balance, role) VALUES ($1, $2, $3, 'user')",
    )
    .bind(id)
    .bind(format!("{id}@example.com"))
    .bind(balance)
    .execute(pool)
    .await
    .expect("seed user");
    id
}

async fn seed_generation(
    pool: &sqlx::PgPool,
    owner: Uuid,
    project: Option<Uuid>,
    visibility: &str,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO generations (id, owner_user_id, project_id, visibility, status) \
         VALUES ($1, $2, $3, $4, 'completed')",
    )
    .bind(id)
    .bind(owner)
    .bind(project)
    .bind(visibility)
    .execute(pool)
    .await
    .expect("seed generation");
    id
}

async fn ledger_sum(pool: &sqlx::PgPool, user: Uuid) -> i64 {
    let (sum,): (Option<i64>,) =
        sqlx::query_as("SELECT SUM(amount)::int8 FROM credit_ledger WHERE user_id = $1")
            .bind(user)
            .fetch_one(pool)
            .await
            .expect("ledger sum");
    sum.unwrap_or(0)
}

async fn balance_of(pool: &sqlx::PgPool, user: Uuid) -> i32 {
    let (balance,): (i32,) =
        sqlx::query_as("SELECT credits_balance FROM users WHERE id = $1")
            .bind(user)
            .fetch_one(pool)
            .await
            .expect("balance");
    balance
}

// S1: fresh user, first read. The caller is auto-provisioned with the
// default grant; the unknown generation is NotFound, not Forbidden.
#[sqlx::test(migrations = "../../migrations")]
async fn fresh_user_first_read_provisions_then_not_found(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user_id = Uuid::new_v4();
    let token = jwt_for(user_id, 3600);
    let missing_generation = Uuid::new_v4().to_string();

    let result = core
        .authorize(
            &token,
            user_id,
            ResourceType::Generation,
            &missing_generation,
            AccessOp::Read,
            None,
        )
        .await;
    assert!(matches!(result, Err(CoreError::NotFound { .. })));

    // Provisioning happened as a side effect of the authenticated access
    let (balance, role): (i32, String) =
        sqlx::query_as("SELECT credits_balance, role FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .expect("auto-provisioned user should exist");
    assert_eq!(balance, 100);
    assert_eq!(role, "viewer");

    core.shutdown().await;
}

// S2: owner read, then a warm-cache re-read.
#[sqlx::test(migrations = "../../migrations")]
async fn owner_read_is_cached_on_second_call(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let owner = seed_user(&pool, 100).await;
    let generation = seed_generation(&pool, owner, None, "private").await;
    sqlx::query("REFRESH MATERIALIZED VIEW mv_user_authorization_context")
        .execute(&pool)
        .await
        .unwrap();

    let token = jwt_for(owner, 3600);
    let gen_id = generation.to_string();

    let first = core
        .authorize(&token, owner, ResourceType::Generation, &gen_id, AccessOp::Read, None)
        .await
        .expect("owner read should be granted");
    assert!(first.granted);
    assert_eq!(first.effective_role, Some(EffectiveRole::Owner));
    assert_eq!(first.method, DecisionMethod::MaterializedView);

    let second = core
        .authorize(&token, owner, ResourceType::Generation, &gen_id, AccessOp::Read, None)
        .await
        .expect("cached read should be granted");
    assert!(second.granted);
    assert_eq!(second.method, DecisionMethod::CacheL1);

    core.shutdown().await;
}

// S3: team editor may write but not delete.
#[sqlx::test(migrations = "../../migrations")]
async fn team_editor_write_granted_delete_forbidden(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let owner = seed_user(&pool, 100).await;
    let editor = seed_user(&pool, 100).await;

    let team_id = Uuid::new_v4();
    sqlx::query("INSERT INTO teams (id, name) VALUES ($1, 'T1')")
        .bind(team_id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO team_members (user_id, team_id, role, is_active) VALUES ($1, $2, 'editor', true)",
    )
    .bind(editor)
    .bind(team_id)
    .execute(&pool)
    .await
    .unwrap();

    let project_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO projects (id, owner_user_id, team_id, visibility, title) \
         VALUES ($1, $2, $3, 'team', 'P1')",
    )
    .bind(project_id)
    .bind(owner)
    .bind(team_id)
    .execute(&pool)
    .await
    .unwrap();

    let generation = seed_generation(&pool, owner, Some(project_id), "team").await;
    let token = jwt_for(editor, 3600);
    let gen_id = generation.to_string();

    let write = core
        .authorize(&token, editor, ResourceType::Generation, &gen_id, AccessOp::Write, None)
        .await
        .expect("editor write should be granted");
    assert!(write.granted);
    assert_eq!(write.effective_role, Some(EffectiveRole::Editor));

    let delete = core
        .authorize(&token, editor, ResourceType::Generation, &gen_id, AccessOp::Delete, None)
        .await;
    assert!(matches!(
        delete,
        Err(CoreError::Forbidden {
            reason: ForbiddenReason::RoleInsufficient
        })
    ));

    core.shutdown().await;
}

// S4 / property 6: concurrent spends cannot overdraw.
#[sqlx::test(migrations = "../../migrations")]
async fn concurrent_spends_cannot_overdraw(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = seed_user(&pool, 50).await;
    let token = jwt_for(user, 3600);

    let (a, b, c) = tokio::join!(
        core.spend_credits(&token, user, 45, LedgerKind::Usage, None, None, None),
        core.spend_credits(&token, user, 45, LedgerKind::Usage, None, None, None),
        core.spend_credits(&token, user, 45, LedgerKind::Usage, None, None, None),
    );

    let outcomes = [a, b, c];
    let successes: Vec<_> = outcomes.iter().filter(|r| r.is_ok()).collect();
    let insufficient = outcomes
        .iter()
        .filter(|r| matches!(r, Err(CoreError::InsufficientCredits { .. })))
        .count();

    assert_eq!(successes.len(), 1, "exactly one spend may win");
    assert_eq!(insufficient, 2, "the losers see InsufficientCredits");
    assert_eq!(successes[0].as_ref().unwrap().new_balance, 5);

    assert_eq!(balance_of(&pool, user).await, 5);
    let (entries,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM credit_ledger WHERE user_id = $1 AND kind = 'usage'")
            .bind(user)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(entries, 1, "exactly one usage entry");

    core.shutdown().await;
}

// S6 / property 4: an expired token is rejected before any database work.
#[sqlx::test(migrations = "../../migrations")]
async fn expired_token_rejected_before_database(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = Uuid::new_v4();
    let stale = jwt_for(user, -10);

    let result = core
        .authorize(
            &stale,
            user,
            ResourceType::Generation,
            &Uuid::new_v4().to_string(),
            AccessOp::Read,
            None,
        )
        .await;
    assert!(matches!(result, Err(CoreError::Unauthenticated { .. })));

    // No side effects: the user was never provisioned
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
        .bind(user)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(row.is_none());

    core.shutdown().await;
}

// Round-trip law: grant(+x) then spend(x) leaves the balance unchanged and
// appends two ledger entries with opposite signs.
#[sqlx::test(migrations = "../../migrations")]
async fn grant_then_spend_round_trip(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = seed_user(&pool, 100).await;
    let token = jwt_for(user, 3600);

    let granted = core
        .grant_credits(
            &token,
            user,
            30,
            LedgerKind::Bonus,
            serde_json::json!({"campaign": "launch"}),
            None,
        )
        .await
        .expect("grant should succeed");
    assert_eq!(granted.new_balance, 130);
    assert!(granted.ledger_entry_id.is_some());

    let spent = core
        .spend_credits(&token, user, 30, LedgerKind::Usage, None, None, None)
        .await
        .expect("spend should succeed");
    assert_eq!(spent.new_balance, 100);

    assert_eq!(balance_of(&pool, user).await, 100);

    let amounts: Vec<(i32,)> = sqlx::query_as(
        "SELECT amount FROM credit_ledger WHERE user_id = $1 ORDER BY created_at",
    )
    .bind(user)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(amounts, vec![(30,), (-30,)]);

    core.shutdown().await;
}

// Boundary: spend(u, 0) is a no-op success with no ledger entry.
#[sqlx::test(migrations = "../../migrations")]
async fn zero_spend_is_a_noop(pool_opts: PgPoolOptions, connect_opts: PgConnectOptions) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = seed_user(&pool, 40).await;
    let token = jwt_for(user, 3600);

    let receipt = core
        .spend_credits(&token, user, 0, LedgerKind::Usage, None, None, None)
        .await
        .expect("zero spend succeeds");
    assert_eq!(receipt.new_balance, 40);
    assert!(receipt.ledger_entry_id.is_none());

    assert_eq!(ledger_sum(&pool, user).await, 0);

    core.shutdown().await;
}

// Idempotency: the same key cannot deduct twice.
#[sqlx::test(migrations = "../../migrations")]
async fn idempotent_spend_deducts_once(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = seed_user(&pool, 100).await;
    let token = jwt_for(user, 3600);
    let key = Some("op-123".to_string());

    let first = core
        .spend_credits(&token, user, 25, LedgerKind::Usage, None, key.clone(), None)
        .await
        .expect("first spend succeeds");
    let second = core
        .spend_credits(&token, user, 25, LedgerKind::Usage, None, key, None)
        .await
        .expect("replay returns the recorded outcome");

    assert_eq!(first.new_balance, 75);
    assert_eq!(second.new_balance, 75);
    assert_eq!(first.ledger_entry_id, second.ledger_entry_id);
    assert_eq!(balance_of(&pool, user).await, 75);

    core.shutdown().await;
}

// Property: N concurrent ensure_user calls yield exactly one row.
#[sqlx::test(migrations = "../../migrations")]
async fn concurrent_ensure_user_creates_one_row(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user_id = Uuid::new_v4();
    let users = core.users();

    let (a, b, c, d) = tokio::join!(
        users.ensure_user(user_id, None, None),
        users.ensure_user(user_id, None, None),
        users.ensure_user(user_id, None, None),
        users.ensure_user(user_id, None, None),
    );

    for result in [&a, &b, &c, &d] {
        let user = result.as_ref().expect("every caller gets the row");
        assert_eq!(user.id, user_id);
        assert_eq!(user.credits_balance, 100);
        assert_eq!(user.role, "viewer");
    }

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    core.shutdown().await;
}

// Property 1: the ledger sums to the balance delta once appends settle.
#[sqlx::test(migrations = "../../migrations")]
async fn ledger_is_consistent_with_balance(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = seed_user(&pool, 200).await;
    let token = jwt_for(user, 3600);

    core.spend_credits(&token, user, 50, LedgerKind::Usage, None, None, None)
        .await
        .unwrap();
    core.grant_credits(&token, user, 10, LedgerKind::Refund, serde_json::json!({}), None)
        .await
        .unwrap();
    core.spend_credits(&token, user, 20, LedgerKind::Usage, None, None, None)
        .await
        .unwrap();

    let balance = balance_of(&pool, user).await;
    assert_eq!(balance, 140);
    // Seeded balance (200) plus the ledger delta equals the final balance
    assert_eq!(200 + ledger_sum(&pool, user).await as i32, balance);

    core.shutdown().await;
}

// Public visibility grants read to strangers, and nothing else.
#[sqlx::test(migrations = "../../migrations")]
async fn public_generation_readable_not_writable(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let owner = seed_user(&pool, 100).await;
    let stranger = seed_user(&pool, 100).await;
    let generation = seed_generation(&pool, owner, None, "public").await;

    let token = jwt_for(stranger, 3600);
    let gen_id = generation.to_string();

    let read = core
        .authorize(&token, stranger, ResourceType::Generation, &gen_id, AccessOp::Read, None)
        .await
        .expect("public read should be granted");
    assert!(read.granted);
    assert_eq!(read.effective_role, Some(EffectiveRole::Viewer));

    let write = core
        .authorize(&token, stranger, ResourceType::Generation, &gen_id, AccessOp::Write, None)
        .await;
    assert!(matches!(write, Err(CoreError::Forbidden { .. })));

    core.shutdown().await;
}

// Spending more than the balance reports both sides of the shortfall.
#[sqlx::test(migrations = "../../migrations")]
async fn overspend_reports_required_and_available(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(connect_opts.clone()).await.unwrap();
    let core = start_core(connect_opts).await;

    let user = seed_user(&pool, 10).await;
    let token = jwt_for(user, 3600);

    let result = core
        .spend_credits(&token, user, 45, LedgerKind::Usage, None, None, None)
        .await;
    match result {
        Err(CoreError::InsufficientCredits {
            required,
            available,
        }) => {
            assert_eq!(required, 45);
            assert_eq!(available, 10);
        }
        other => panic!("expected InsufficientCredits, got {other:?}"),
    }

    assert_eq!(balance_of(&pool, user).await, 10);
    assert_eq!(ledger_sum(&pool, user).await, 0);

    core.shutdown().await;
}
