use crate::datastore::{CheckpointRow, Datastore, TableCounts, WriteSet};
use crate::error::IndexerError;
use crate::types::{
    FundingRequestRecord, MemberRecord, PoolRecord, RequestStatus, RequestType,
    TransactionRecord, VoteRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, Pool, Postgres, Row};
use std::time::Duration;

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name
pub const SCHEMA: &str = "pool_indexer";

/// Connects to `database_url` and makes sure the schema exists.
///
/// Retries with exponential backoff so the indexer survives the database
/// container starting after it.
pub async fn connect(database_url: &str, max_connections: u32, max_attempts: u32) -> Result<DbPool> {
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "Connected to database (attempt {}/{}).",
                    attempt,
                    max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        if attempt == max_attempts {
            break;
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms, 800ms, ... capped at 12.8s
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

/// Creates the schema and tables idempotently. Concurrent starters serialize
/// on a transaction-scoped advisory lock.
pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x504F4F4C49445852; // "POOLIDXR"

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::debug!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&mut *tx)
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(&mut *tx)
        .await?;
    create_tables(&mut tx).await?;

    tx.commit().await?;
    log::info!("Database schema {} ready.", SCHEMA);
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<()> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {}.pools (
                address VARCHAR(42) PRIMARY KEY,
                name TEXT NOT NULL,
                deposit_token VARCHAR(42) NOT NULL,
                deposit_token_symbol TEXT NOT NULL,
                deposit_token_decimals SMALLINT NOT NULL,
                min_deposit NUMERIC NOT NULL,
                voting_period BIGINT NOT NULL,
                quorum_bps INTEGER NOT NULL,
                approval_bps INTEGER NOT NULL,
                guardian_threshold_bps INTEGER NOT NULL,
                admin_address VARCHAR(42) NOT NULL,
                share_token VARCHAR(42) NOT NULL,
                total_deposited NUMERIC NOT NULL,
                chain_id BIGINT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_tx VARCHAR(66),
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.members (
                pool_address VARCHAR(42) NOT NULL,
                address VARCHAR(42) NOT NULL,
                is_guardian BOOLEAN NOT NULL,
                is_active BOOLEAN NOT NULL,
                shares NUMERIC NOT NULL,
                joined_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY (pool_address, address)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.requests (
                pool_address VARCHAR(42) NOT NULL,
                onchain_id BIGINT NOT NULL,
                requester_address VARCHAR(42) NOT NULL,
                title TEXT NOT NULL,
                description_uri TEXT NOT NULL,
                amount NUMERIC NOT NULL,
                request_type VARCHAR(16) NOT NULL,
                reward_bps INTEGER NOT NULL,
                duration BIGINT NOT NULL,
                collateral_token VARCHAR(42) NOT NULL,
                collateral_amount NUMERIC NOT NULL,
                repaid_amount NUMERIC NOT NULL,
                status VARCHAR(16) NOT NULL,
                voting_ends_at TIMESTAMPTZ,
                yes_votes NUMERIC NOT NULL,
                no_votes NUMERIC NOT NULL,
                funded_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY (pool_address, onchain_id)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.votes (
                pool_address VARCHAR(42) NOT NULL,
                request_onchain_id BIGINT NOT NULL,
                voter_address VARCHAR(42) NOT NULL,
                support BOOLEAN NOT NULL,
                weight NUMERIC NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                PRIMARY KEY (pool_address, request_onchain_id, voter_address)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.transactions (
                tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                pool_address VARCHAR(42) NOT NULL,
                address VARCHAR(42) NOT NULL,
                tx_type VARCHAR(16) NOT NULL,
                amount NUMERIC NOT NULL,
                block_number BIGINT NOT NULL,
                created_at TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY (tx_hash, log_index)
            )",
            SCHEMA
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}.indexer_state (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                last_block BIGINT NOT NULL,
                pools TEXT[] NOT NULL DEFAULT '{{}}',
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )",
            SCHEMA
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_members_pool ON {}.members (pool_address)",
            SCHEMA
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_requests_status ON {}.requests (pool_address, status)",
            SCHEMA
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_transactions_pool ON {}.transactions (pool_address, block_number)",
            SCHEMA
        ),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(&mut **tx).await?;
    }
    Ok(())
}

/// [`Datastore`] backed by Postgres. Each [`WriteSet`] is one transaction.
#[derive(Clone)]
pub struct PgDatastore {
    pool: DbPool,
}

impl PgDatastore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn upsert_pool(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    pool: &PoolRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {}.pools (
            address, name, deposit_token, deposit_token_symbol, deposit_token_decimals,
            min_deposit, voting_period, quorum_bps, approval_bps, guardian_threshold_bps,
            admin_address, share_token, total_deposited, chain_id, is_active, created_tx, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6::numeric, $7, $8, $9, $10, $11, $12, $13::numeric, $14, $15, $16, NOW())
        ON CONFLICT (address) DO UPDATE SET
            name = EXCLUDED.name,
            deposit_token = EXCLUDED.deposit_token,
            deposit_token_symbol = EXCLUDED.deposit_token_symbol,
            deposit_token_decimals = EXCLUDED.deposit_token_decimals,
            min_deposit = EXCLUDED.min_deposit,
            voting_period = EXCLUDED.voting_period,
            quorum_bps = EXCLUDED.quorum_bps,
            approval_bps = EXCLUDED.approval_bps,
            guardian_threshold_bps = EXCLUDED.guardian_threshold_bps,
            admin_address = EXCLUDED.admin_address,
            share_token = EXCLUDED.share_token,
            total_deposited = EXCLUDED.total_deposited,
            chain_id = EXCLUDED.chain_id,
            is_active = EXCLUDED.is_active,
            created_tx = COALESCE(EXCLUDED.created_tx, {}.pools.created_tx),
            updated_at = NOW()",
        SCHEMA, SCHEMA
    ))
    .bind(&pool.address)
    .bind(&pool.name)
    .bind(&pool.deposit_token)
    .bind(&pool.deposit_token_symbol)
    .bind(pool.deposit_token_decimals as i16)
    .bind(&pool.min_deposit)
    .bind(pool.voting_period as i64)
    .bind(pool.quorum_bps as i32)
    .bind(pool.approval_bps as i32)
    .bind(pool.guardian_threshold_bps as i32)
    .bind(&pool.admin_address)
    .bind(&pool.share_token)
    .bind(&pool.total_deposited)
    .bind(pool.chain_id as i64)
    .bind(pool.is_active)
    .bind(&pool.created_tx)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_member(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    member: &MemberRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {}.members (pool_address, address, is_guardian, is_active, shares, joined_at, updated_at)
         VALUES ($1, $2, $3, $4, $5::numeric, $6, NOW())
         ON CONFLICT (pool_address, address) DO UPDATE SET
            is_guardian = EXCLUDED.is_guardian,
            is_active = EXCLUDED.is_active,
            shares = EXCLUDED.shares,
            joined_at = EXCLUDED.joined_at,
            updated_at = NOW()",
        SCHEMA
    ))
    .bind(&member.pool_address)
    .bind(&member.address)
    .bind(member.is_guardian)
    .bind(member.is_active)
    .bind(&member.shares)
    .bind(member.joined_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_request(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    request: &FundingRequestRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {}.requests (
            pool_address, onchain_id, requester_address, title, description_uri, amount,
            request_type, reward_bps, duration, collateral_token, collateral_amount,
            repaid_amount, status, voting_ends_at, yes_votes, no_votes, funded_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6::numeric, $7, $8, $9, $10, $11::numeric, $12::numeric,
                  $13, $14, $15::numeric, $16::numeric, $17, NOW())
        ON CONFLICT (pool_address, onchain_id) DO UPDATE SET
            requester_address = EXCLUDED.requester_address,
            title = EXCLUDED.title,
            description_uri = EXCLUDED.description_uri,
            amount = EXCLUDED.amount,
            request_type = EXCLUDED.request_type,
            reward_bps = EXCLUDED.reward_bps,
            duration = EXCLUDED.duration,
            collateral_token = EXCLUDED.collateral_token,
            collateral_amount = EXCLUDED.collateral_amount,
            repaid_amount = EXCLUDED.repaid_amount,
            status = EXCLUDED.status,
            voting_ends_at = EXCLUDED.voting_ends_at,
            yes_votes = EXCLUDED.yes_votes,
            no_votes = EXCLUDED.no_votes,
            funded_at = EXCLUDED.funded_at,
            updated_at = NOW()",
        SCHEMA
    ))
    .bind(&request.pool_address)
    .bind(request.onchain_id as i64)
    .bind(&request.requester_address)
    .bind(&request.title)
    .bind(&request.description_uri)
    .bind(&request.amount)
    .bind(request.request_type.as_str())
    .bind(request.reward_bps as i32)
    .bind(request.duration as i64)
    .bind(&request.collateral_token)
    .bind(&request.collateral_amount)
    .bind(&request.repaid_amount)
    .bind(request.status.as_str())
    .bind(request.voting_ends_at)
    .bind(&request.yes_votes)
    .bind(&request.no_votes)
    .bind(request.funded_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_vote(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    vote: &VoteRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {}.votes (pool_address, request_onchain_id, voter_address, support, weight, tx_hash)
         VALUES ($1, $2, $3, $4, $5::numeric, $6)
         ON CONFLICT (pool_address, request_onchain_id, voter_address) DO UPDATE SET
            support = EXCLUDED.support,
            weight = EXCLUDED.weight,
            tx_hash = EXCLUDED.tx_hash",
        SCHEMA
    ))
    .bind(&vote.pool_address)
    .bind(vote.request_onchain_id as i64)
    .bind(&vote.voter_address)
    .bind(vote.support)
    .bind(&vote.weight)
    .bind(&vote.tx_hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    record: &TransactionRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {}.transactions (tx_hash, log_index, pool_address, address, tx_type, amount, block_number)
         VALUES ($1, $2, $3, $4, $5, $6::numeric, $7)
         ON CONFLICT (tx_hash, log_index) DO NOTHING",
        SCHEMA
    ))
    .bind(&record.tx_hash)
    .bind(record.log_index as i64)
    .bind(&record.pool_address)
    .bind(&record.address)
    .bind(record.tx_type.as_str())
    .bind(&record.amount)
    .bind(record.block_number as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode_enum<T>(
    row: &PgRow,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, IndexerError> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| {
        IndexerError::Datastore(format!("unexpected {} value {:?}", column, raw))
    })
}

fn pool_from_row(row: &PgRow) -> Result<PoolRecord, IndexerError> {
    Ok(PoolRecord {
        address: row.try_get("address")?,
        name: row.try_get("name")?,
        deposit_token: row.try_get("deposit_token")?,
        deposit_token_symbol: row.try_get("deposit_token_symbol")?,
        deposit_token_decimals: row.try_get::<i16, _>("deposit_token_decimals")? as u8,
        min_deposit: row.try_get("min_deposit")?,
        voting_period: row.try_get::<i64, _>("voting_period")? as u64,
        quorum_bps: row.try_get::<i32, _>("quorum_bps")? as u32,
        approval_bps: row.try_get::<i32, _>("approval_bps")? as u32,
        guardian_threshold_bps: row.try_get::<i32, _>("guardian_threshold_bps")? as u32,
        admin_address: row.try_get("admin_address")?,
        share_token: row.try_get("share_token")?,
        total_deposited: row.try_get("total_deposited")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        is_active: row.try_get("is_active")?,
        created_tx: row.try_get("created_tx")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<FundingRequestRecord, IndexerError> {
    Ok(FundingRequestRecord {
        pool_address: row.try_get("pool_address")?,
        onchain_id: row.try_get::<i64, _>("onchain_id")? as u64,
        requester_address: row.try_get("requester_address")?,
        title: row.try_get("title")?,
        description_uri: row.try_get("description_uri")?,
        amount: row.try_get("amount")?,
        request_type: decode_enum(row, "request_type", RequestType::parse)?,
        reward_bps: row.try_get::<i32, _>("reward_bps")? as u32,
        duration: row.try_get::<i64, _>("duration")? as u64,
        collateral_token: row.try_get("collateral_token")?,
        collateral_amount: row.try_get("collateral_amount")?,
        repaid_amount: row.try_get("repaid_amount")?,
        status: decode_enum(row, "status", RequestStatus::parse)?,
        voting_ends_at: row.try_get("voting_ends_at")?,
        yes_votes: row.try_get("yes_votes")?,
        no_votes: row.try_get("no_votes")?,
        funded_at: row.try_get("funded_at")?,
    })
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn commit(&self, writes: &WriteSet) -> Result<(), IndexerError> {
        if writes.is_empty() {
            return Ok(());
        }
        // Dropping `tx` on an early return rolls everything back.
        let mut tx = self.pool.begin().await?;
        for pool in &writes.pools {
            upsert_pool(&mut tx, pool).await?;
        }
        for member in &writes.members {
            upsert_member(&mut tx, member).await?;
        }
        for request in &writes.requests {
            upsert_request(&mut tx, request).await?;
        }
        for vote in &writes.votes {
            upsert_vote(&mut tx, vote).await?;
        }
        for record in &writes.transactions {
            insert_transaction(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<CheckpointRow>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT last_block, pools, updated_at FROM {}.indexer_state WHERE id = 1",
            SCHEMA
        ))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(CheckpointRow {
                last_block: row.try_get::<i64, _>("last_block")?.max(0) as u64,
                known_pools: row.try_get("pools")?,
                updated_at: row.try_get("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn save_checkpoint(
        &self,
        last_block: u64,
        known_pools: &[String],
    ) -> Result<(), IndexerError> {
        sqlx::query(&format!(
            "INSERT INTO {}.indexer_state (id, last_block, pools, updated_at)
             VALUES (1, $1, $2, NOW())
             ON CONFLICT (id) DO UPDATE SET
                last_block = GREATEST({}.indexer_state.last_block, EXCLUDED.last_block),
                pools = EXCLUDED.pools,
                updated_at = NOW()",
            SCHEMA, SCHEMA
        ))
        .bind(last_block as i64)
        .bind(known_pools)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pool(&self, address: &str) -> Result<Option<PoolRecord>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT address, name, deposit_token, deposit_token_symbol, deposit_token_decimals,
                    min_deposit::text AS min_deposit, voting_period, quorum_bps, approval_bps,
                    guardian_threshold_bps, admin_address, share_token,
                    total_deposited::text AS total_deposited, chain_id, is_active, created_tx
             FROM {}.pools WHERE address = $1",
            SCHEMA
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn member(
        &self,
        pool: &str,
        address: &str,
    ) -> Result<Option<MemberRecord>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT pool_address, address, is_guardian, is_active, shares::text AS shares, joined_at
             FROM {}.members WHERE pool_address = $1 AND address = $2",
            SCHEMA
        ))
        .bind(pool)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(MemberRecord {
                pool_address: row.try_get("pool_address")?,
                address: row.try_get("address")?,
                is_guardian: row.try_get("is_guardian")?,
                is_active: row.try_get("is_active")?,
                shares: row.try_get("shares")?,
                joined_at: row.try_get("joined_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn request(
        &self,
        pool: &str,
        onchain_id: u64,
    ) -> Result<Option<FundingRequestRecord>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT pool_address, onchain_id, requester_address, title, description_uri,
                    amount::text AS amount, request_type, reward_bps, duration, collateral_token,
                    collateral_amount::text AS collateral_amount,
                    repaid_amount::text AS repaid_amount, status, voting_ends_at,
                    yes_votes::text AS yes_votes, no_votes::text AS no_votes, funded_at
             FROM {}.requests WHERE pool_address = $1 AND onchain_id = $2",
            SCHEMA
        ))
        .bind(pool)
        .bind(onchain_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn votes_for(
        &self,
        pool: &str,
        onchain_id: u64,
    ) -> Result<Vec<VoteRecord>, IndexerError> {
        let rows = sqlx::query(&format!(
            "SELECT pool_address, request_onchain_id, voter_address, support,
                    weight::text AS weight, tx_hash
             FROM {}.votes WHERE pool_address = $1 AND request_onchain_id = $2
             ORDER BY voter_address",
            SCHEMA
        ))
        .bind(pool)
        .bind(onchain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(VoteRecord {
                    pool_address: row.try_get("pool_address")?,
                    request_onchain_id: row.try_get::<i64, _>("request_onchain_id")? as u64,
                    voter_address: row.try_get("voter_address")?,
                    support: row.try_get("support")?,
                    weight: row.try_get("weight")?,
                    tx_hash: row.try_get("tx_hash")?,
                })
            })
            .collect()
    }

    async fn counts(&self) -> Result<TableCounts, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT
                (SELECT COUNT(*) FROM {s}.pools) AS pools,
                (SELECT COUNT(*) FROM {s}.members) AS members,
                (SELECT COUNT(*) FROM {s}.requests) AS requests,
                (SELECT COUNT(*) FROM {s}.votes) AS votes,
                (SELECT COUNT(*) FROM {s}.transactions) AS transactions",
            s = SCHEMA
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(TableCounts {
            pools: row.try_get::<i64, _>("pools")? as u64,
            members: row.try_get::<i64, _>("members")? as u64,
            requests: row.try_get::<i64, _>("requests")? as u64,
            votes: row.try_get::<i64, _>("votes")? as u64,
            transactions: row.try_get::<i64, _>("transactions")? as u64,
        })
    }
}
