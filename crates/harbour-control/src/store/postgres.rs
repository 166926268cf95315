//! PostgreSQL control store implementation.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::error::{ControlError, ControlResult, EntityKind};
use crate::records::{
    AgentJobRecord, AppRecord, BenchRecord, DeployCandidateRecord, PlanRecord,
    ProxyServerRecord, ReleaseGroupRecord, ServerRecord, SiteData, SiteDomainRecord, SiteRecord,
};
use crate::types::{
    AgentJobId, AppId, BenchId, BenchStatus, CandidateStatus, DeployCandidateId, DomainId,
    HostStatus, JobStatus, JobTarget, PlanId, ProxyServerId, ReleaseGroupId, ServerId, SiteId,
    SiteStatus,
};

use super::{
    bench_in_use, ensure_bench_accepts_sites, BenchStore, Claim, DomainStore, JobFilter, JobStore, PlanStore, ReleaseStore, ServerStore,
    SiteFilter, SiteStore,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS proxy_servers (
        name TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        ip TEXT,
        private_ip TEXT,
        reachable BOOLEAN NOT NULL DEFAULT FALSE,
        last_seen_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS servers (
        name TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        ip TEXT,
        private_ip TEXT,
        proxy_server TEXT NOT NULL REFERENCES proxy_servers(name),
        reachable BOOLEAN NOT NULL DEFAULT FALSE,
        last_seen_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS apps (
        name TEXT PRIMARY KEY,
        repository TEXT NOT NULL,
        branch TEXT NOT NULL,
        hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS release_groups (
        name TEXT PRIMARY KEY,
        apps JSONB NOT NULL,
        enabled BOOLEAN NOT NULL,
        frozen BOOLEAN NOT NULL DEFAULT FALSE,
        config JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deploy_candidates (
        id TEXT PRIMARY KEY,
        group_name TEXT NOT NULL REFERENCES release_groups(name),
        apps JSONB NOT NULL,
        build_server TEXT NOT NULL,
        status TEXT NOT NULL,
        job TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS benches (
        name TEXT PRIMARY KEY,
        group_name TEXT NOT NULL,
        candidate TEXT NOT NULL REFERENCES deploy_candidates(id),
        server TEXT NOT NULL REFERENCES servers(name),
        workers BIGINT NOT NULL,
        gunicorn_workers BIGINT NOT NULL,
        status TEXT NOT NULL,
        active_job TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plans (
        name TEXT PRIMARY KEY,
        price_usd DOUBLE PRECISION NOT NULL,
        price_inr DOUBLE PRECISION NOT NULL,
        period BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sites (
        name TEXT PRIMARY KEY,
        subdomain TEXT NOT NULL,
        bench TEXT NOT NULL REFERENCES benches(name),
        server TEXT NOT NULL,
        plan TEXT NOT NULL REFERENCES plans(name),
        apps JSONB NOT NULL,
        status TEXT NOT NULL,
        active_job TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS site_domains (
        name TEXT PRIMARY KEY,
        site TEXT NOT NULL REFERENCES sites(name) ON DELETE CASCADE,
        is_primary BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_site_domains_one_primary
    ON site_domains (site) WHERE is_primary
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_jobs (
        id TEXT PRIMARY KEY,
        job_type TEXT NOT NULL,
        host TEXT NOT NULL,
        path TEXT NOT NULL,
        method TEXT NOT NULL,
        payload JSONB NOT NULL,
        files JSONB NOT NULL,
        target_kind TEXT NOT NULL,
        target_id TEXT NOT NULL,
        remote_id TEXT,
        status TEXT NOT NULL,
        attempts BIGINT NOT NULL DEFAULT 0,
        error TEXT,
        output JSONB,
        deadline TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_agent_jobs_open
    ON agent_jobs (created_at) WHERE status IN ('undelivered', 'delivered')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_agent_jobs_target
    ON agent_jobs (target_kind, target_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_benches_server
    ON benches (server)
    "#,
];

const SITE_COLUMNS: &str = "name, subdomain, bench, server, plan, apps, status, active_job, \
                            error, created_at, updated_at";

const JOB_COLUMNS: &str = "id, job_type, host, path, method, payload, files, target_kind, \
                           target_id, remote_id, status, attempts, error, output, deadline, \
                           created_at, updated_at";

/// PostgreSQL-backed control store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse<T>(value: &str, what: &str) -> ControlResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| ControlError::Serialisation(format!("failed to parse {what} '{value}': {e}")))
}

fn to_json<T: Serialize>(value: &T, what: &str) -> ControlResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| ControlError::Serialisation(format!("failed to serialise {what}: {e}")))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> ControlResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ControlError::Serialisation(format!("failed to deserialise {what}: {e}")))
}

fn to_u32(value: i64, what: &str) -> ControlResult<u32> {
    u32::try_from(value)
        .map_err(|_| ControlError::Serialisation(format!("{what} out of range: {value}")))
}

/// Lock a site row until the transaction ends.
///
/// Every domain write for a site takes this lock, which serialises changes
/// to its primary flag.
async fn lock_site(tx: &mut Transaction<'_, Postgres>, site: &SiteId) -> ControlResult<()> {
    sqlx::query("SELECT name FROM sites WHERE name = $1 FOR UPDATE")
        .bind(site.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| ControlError::not_found(EntityKind::Site, site))?;
    Ok(())
}

fn row_to_proxy(row: &PgRow) -> ControlResult<ProxyServerRecord> {
    let status: String = row.try_get("status")?;
    Ok(ProxyServerRecord {
        name: ProxyServerId::new(row.try_get::<String, _>("name")?),
        status: parse(&status, "host status")?,
        ip: row.try_get("ip")?,
        private_ip: row.try_get("private_ip")?,
        reachable: row.try_get("reachable")?,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_server(row: &PgRow) -> ControlResult<ServerRecord> {
    let status: String = row.try_get("status")?;
    Ok(ServerRecord {
        name: ServerId::new(row.try_get::<String, _>("name")?),
        status: parse(&status, "host status")?,
        ip: row.try_get("ip")?,
        private_ip: row.try_get("private_ip")?,
        proxy_server: ProxyServerId::new(row.try_get::<String, _>("proxy_server")?),
        reachable: row.try_get("reachable")?,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_app(row: &PgRow) -> ControlResult<AppRecord> {
    Ok(AppRecord {
        name: AppId::new(row.try_get::<String, _>("name")?),
        repository: row.try_get("repository")?,
        branch: row.try_get("branch")?,
        hash: row.try_get("hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_group(row: &PgRow) -> ControlResult<ReleaseGroupRecord> {
    Ok(ReleaseGroupRecord {
        name: ReleaseGroupId::new(row.try_get::<String, _>("name")?),
        apps: from_json(row.try_get("apps")?, "group apps")?,
        enabled: row.try_get("enabled")?,
        frozen: row.try_get("frozen")?,
        config: row.try_get("config")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_candidate(row: &PgRow) -> ControlResult<DeployCandidateRecord> {
    let status: String = row.try_get("status")?;
    let job: Option<String> = row.try_get("job")?;
    Ok(DeployCandidateRecord {
        id: DeployCandidateId::new(row.try_get::<String, _>("id")?),
        group: ReleaseGroupId::new(row.try_get::<String, _>("group_name")?),
        apps: from_json(row.try_get("apps")?, "candidate apps")?,
        build_server: ServerId::new(row.try_get::<String, _>("build_server")?),
        status: parse(&status, "candidate status")?,
        job: job.map(AgentJobId::new),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_bench(row: &PgRow) -> ControlResult<BenchRecord> {
    let status: String = row.try_get("status")?;
    let active_job: Option<String> = row.try_get("active_job")?;
    Ok(BenchRecord {
        name: BenchId::new(row.try_get::<String, _>("name")?),
        group: ReleaseGroupId::new(row.try_get::<String, _>("group_name")?),
        candidate: DeployCandidateId::new(row.try_get::<String, _>("candidate")?),
        server: ServerId::new(row.try_get::<String, _>("server")?),
        workers: to_u32(row.try_get("workers")?, "workers")?,
        gunicorn_workers: to_u32(row.try_get("gunicorn_workers")?, "gunicorn workers")?,
        status: parse(&status, "bench status")?,
        active_job: active_job.map(AgentJobId::new),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_plan(row: &PgRow) -> ControlResult<PlanRecord> {
    Ok(PlanRecord {
        name: PlanId::new(row.try_get::<String, _>("name")?),
        price_usd: row.try_get("price_usd")?,
        price_inr: row.try_get("price_inr")?,
        period: to_u32(row.try_get("period")?, "plan period")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_site(row: &PgRow) -> ControlResult<SiteRecord> {
    let status: String = row.try_get("status")?;
    let active_job: Option<String> = row.try_get("active_job")?;
    Ok(SiteRecord {
        data: SiteData {
            name: SiteId::new(row.try_get::<String, _>("name")?),
            subdomain: row.try_get("subdomain")?,
            bench: BenchId::new(row.try_get::<String, _>("bench")?),
            server: ServerId::new(row.try_get::<String, _>("server")?),
            plan: PlanId::new(row.try_get::<String, _>("plan")?),
            apps: from_json(row.try_get("apps")?, "site apps")?,
            active_job: active_job.map(AgentJobId::new),
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        },
        status: parse(&status, "site status")?,
    })
}

fn row_to_domain(row: &PgRow) -> ControlResult<SiteDomainRecord> {
    Ok(SiteDomainRecord {
        name: DomainId::new(row.try_get::<String, _>("name")?),
        site: SiteId::new(row.try_get::<String, _>("site")?),
        primary: row.try_get("is_primary")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_job(row: &PgRow) -> ControlResult<AgentJobRecord> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let target_kind: String = row.try_get("target_kind")?;
    let target_id: String = row.try_get("target_id")?;
    let remote_id: Option<String> = row.try_get("remote_id")?;

    let target = JobTarget::from_parts(&target_kind, target_id)
        .map_err(|e| ControlError::Serialisation(format!("failed to parse job target: {e}")))?;

    Ok(AgentJobRecord {
        id: AgentJobId::new(row.try_get::<String, _>("id")?),
        job_type: parse(&job_type, "job type")?,
        host: row.try_get("host")?,
        path: row.try_get("path")?,
        method: row.try_get("method")?,
        payload: row.try_get("payload")?,
        files: from_json(row.try_get("files")?, "job files")?,
        target,
        remote_id,
        status: parse(&status, "job status")?,
        attempts: to_u32(row.try_get("attempts")?, "job attempts")?,
        error: row.try_get("error")?,
        output: row.try_get("output")?,
        deadline: row.try_get("deadline")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ServerStore for PostgresStore {
    async fn upsert_proxy_server(
        &self,
        record: &ProxyServerRecord,
    ) -> ControlResult<ProxyServerRecord> {
        sqlx::query(
            r#"
            INSERT INTO proxy_servers (
                name, status, ip, private_ip, reachable, last_seen_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(record.name.as_str())
        .bind(record.status.as_str())
        .bind(&record.ip)
        .bind(&record.private_ip)
        .bind(record.reachable)
        .bind(record.last_seen_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_proxy_server(&record.name)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::ProxyServer, &record.name))
    }

    async fn get_proxy_server(
        &self,
        id: &ProxyServerId,
    ) -> ControlResult<Option<ProxyServerRecord>> {
        let row = sqlx::query("SELECT * FROM proxy_servers WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_proxy).transpose()
    }

    async fn upsert_server(&self, record: &ServerRecord) -> ControlResult<ServerRecord> {
        sqlx::query(
            r#"
            INSERT INTO servers (
                name, status, ip, private_ip, proxy_server, reachable, last_seen_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(record.name.as_str())
        .bind(record.status.as_str())
        .bind(&record.ip)
        .bind(&record.private_ip)
        .bind(record.proxy_server.as_str())
        .bind(record.reachable)
        .bind(record.last_seen_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_server(&record.name)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Server, &record.name))
    }

    async fn get_server(&self, id: &ServerId) -> ControlResult<Option<ServerRecord>> {
        let row = sqlx::query("SELECT * FROM servers WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_server).transpose()
    }

    async fn list_servers(&self) -> ControlResult<Vec<ServerRecord>> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_server).collect()
    }

    async fn set_server_status(&self, id: &ServerId, status: HostStatus) -> ControlResult<()> {
        let result =
            sqlx::query("UPDATE servers SET status = $1, updated_at = NOW() WHERE name = $2")
                .bind(status.as_str())
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(EntityKind::Server, id));
        }

        Ok(())
    }

    async fn set_proxy_status(
        &self,
        id: &ProxyServerId,
        status: HostStatus,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            "UPDATE proxy_servers SET status = $1, updated_at = NOW() WHERE name = $2",
        )
        .bind(status.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(EntityKind::ProxyServer, id));
        }

        Ok(())
    }

    async fn record_reachability(
        &self,
        host: &str,
        reachable: bool,
        at: DateTime<Utc>,
    ) -> ControlResult<bool> {
        for table in ["servers", "proxy_servers"] {
            let query = format!(
                "UPDATE {table} \
                 SET reachable = $2, \
                     last_seen_at = CASE WHEN $2 THEN $3 ELSE last_seen_at END \
                 WHERE name = $1"
            );
            let result = sqlx::query(&query)
                .bind(host)
                .bind(reachable)
                .bind(at)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[async_trait]
impl ReleaseStore for PostgresStore {
    async fn upsert_app(&self, record: &AppRecord) -> ControlResult<AppRecord> {
        sqlx::query(
            r#"
            INSERT INTO apps (name, repository, branch, hash, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(record.name.as_str())
        .bind(&record.repository)
        .bind(&record.branch)
        .bind(&record.hash)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        self.get_app(&record.name)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::App, &record.name))
    }

    async fn get_app(&self, id: &AppId) -> ControlResult<Option<AppRecord>> {
        let row = sqlx::query("SELECT * FROM apps WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_app).transpose()
    }

    async fn upsert_release_group(
        &self,
        record: &ReleaseGroupRecord,
    ) -> ControlResult<ReleaseGroupRecord> {
        let apps = to_json(&record.apps, "group apps")?;

        sqlx::query(
            r#"
            INSERT INTO release_groups (
                name, apps, enabled, frozen, config, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(record.name.as_str())
        .bind(&apps)
        .bind(record.enabled)
        .bind(record.frozen)
        .bind(&record.config)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_release_group(&record.name)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::ReleaseGroup, &record.name))
    }

    async fn get_release_group(
        &self,
        id: &ReleaseGroupId,
    ) -> ControlResult<Option<ReleaseGroupRecord>> {
        let row = sqlx::query("SELECT * FROM release_groups WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_group).transpose()
    }

    async fn add_group_app(
        &self,
        group: &ReleaseGroupId,
        app: &AppId,
    ) -> ControlResult<ReleaseGroupRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM release_groups WHERE name = $1 FOR UPDATE")
            .bind(group.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::ReleaseGroup, group))?;
        let mut record = row_to_group(&row)?;

        if record.apps.contains(app) {
            return Ok(record);
        }
        if record.frozen {
            return Err(ControlError::invariant(format!(
                "release group {group} has deploy candidates; its apps are fixed"
            )));
        }

        record.apps.push(app.clone());
        record.updated_at = Utc::now();

        sqlx::query("UPDATE release_groups SET apps = $1, updated_at = $2 WHERE name = $3")
            .bind(to_json(&record.apps, "group apps")?)
            .bind(record.updated_at)
            .bind(group.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn insert_candidate(&self, record: &DeployCandidateRecord) -> ControlResult<()> {
        let apps = to_json(&record.apps, "candidate apps")?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE release_groups SET frozen = TRUE, updated_at = NOW() WHERE name = $1",
        )
        .bind(record.group.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(EntityKind::ReleaseGroup, &record.group));
        }

        sqlx::query(
            r#"
            INSERT INTO deploy_candidates (
                id, group_name, apps, build_server, status, job, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.group.as_str())
        .bind(&apps)
        .bind(record.build_server.as_str())
        .bind(record.status.as_str())
        .bind(record.job.as_ref().map(AgentJobId::as_str))
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_candidate(
        &self,
        id: &DeployCandidateId,
    ) -> ControlResult<Option<DeployCandidateRecord>> {
        let row = sqlx::query("SELECT * FROM deploy_candidates WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_candidate).transpose()
    }

    async fn list_candidates(
        &self,
        group: &ReleaseGroupId,
    ) -> ControlResult<Vec<DeployCandidateRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM deploy_candidates WHERE group_name = $1 ORDER BY created_at DESC",
        )
        .bind(group.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_candidate).collect()
    }

    async fn transition_candidate(
        &self,
        id: &DeployCandidateId,
        from: CandidateStatus,
        to: CandidateStatus,
        job: Option<&AgentJobId>,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deploy_candidates
            SET status = $1, job = COALESCE($2, job), error = $3, updated_at = NOW()
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(to.as_str())
        .bind(job.map(AgentJobId::as_str))
        .bind(error)
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get_candidate(id).await?.is_none() {
                return Err(ControlError::not_found(EntityKind::DeployCandidate, id));
            }
            return Ok(false);
        }

        Ok(true)
    }
}

#[async_trait]
impl BenchStore for PostgresStore {
    async fn insert_bench_within_capacity(
        &self,
        record: &BenchRecord,
        limit: Option<u32>,
    ) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        // Serialises concurrent placements on the same server.
        sqlx::query("SELECT name FROM servers WHERE name = $1 FOR UPDATE")
            .bind(record.server.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Server, &record.server))?;

        let exists = sqlx::query("SELECT 1 FROM benches WHERE name = $1")
            .bind(record.name.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(ControlError::validation(format!(
                "bench {} already exists",
                record.name
            )));
        }

        if let Some(limit) = limit {
            let in_use: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM benches WHERE server = $1 AND status <> $2",
            )
            .bind(record.server.as_str())
            .bind(BenchStatus::Archived.as_str())
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;

            let in_use = u32::try_from(in_use).unwrap_or(u32::MAX);
            if in_use >= limit {
                return Err(ControlError::Capacity {
                    server: record.server.to_string(),
                    benches: in_use,
                    limit,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO benches (
                name, group_name, candidate, server, workers, gunicorn_workers,
                status, active_job, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.name.as_str())
        .bind(record.group.as_str())
        .bind(record.candidate.as_str())
        .bind(record.server.as_str())
        .bind(i64::from(record.workers))
        .bind(i64::from(record.gunicorn_workers))
        .bind(record.status.as_str())
        .bind(record.active_job.as_ref().map(AgentJobId::as_str))
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_bench(&self, id: &BenchId) -> ControlResult<Option<BenchRecord>> {
        let row = sqlx::query("SELECT * FROM benches WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_bench).transpose()
    }

    async fn list_benches(&self, server: Option<&ServerId>) -> ControlResult<Vec<BenchRecord>> {
        let rows = match server {
            Some(server) => {
                sqlx::query("SELECT * FROM benches WHERE server = $1 ORDER BY name")
                    .bind(server.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM benches ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_bench).collect()
    }

    async fn claim_bench_transition(
        &self,
        id: &BenchId,
        claim: Claim<'_, BenchStatus>,
    ) -> ControlResult<BenchRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM benches WHERE name = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, id))?;
        let mut bench = row_to_bench(&row)?;

        if let Some(ref job) = bench.active_job {
            return Err(ControlError::StateConflict {
                kind: EntityKind::Bench,
                id: id.to_string(),
                job: job.to_string(),
            });
        }
        if !claim.allowed.contains(&bench.status) {
            return Err(ControlError::InvalidStateTransition {
                from: bench.status.as_str(),
                to: claim.target.as_str(),
            });
        }

        if claim.target == BenchStatus::Archived {
            let live: i64 = sqlx::query(
                "SELECT COUNT(*) AS live FROM sites WHERE bench = $1 AND status <> $2",
            )
            .bind(id.as_str())
            .bind(SiteStatus::Archived.as_str())
            .fetch_one(&mut *tx)
            .await?
            .try_get("live")?;
            if live > 0 {
                return Err(bench_in_use(id, u64::try_from(live).unwrap_or(u64::MAX)));
            }
        }

        bench.active_job = Some(claim.job.clone());
        if let Some(during) = claim.during {
            bench.status = during;
        }
        bench.updated_at = Utc::now();

        sqlx::query(
            "UPDATE benches SET status = $1, active_job = $2, updated_at = $3 WHERE name = $4",
        )
        .bind(bench.status.as_str())
        .bind(claim.job.as_str())
        .bind(bench.updated_at)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(bench)
    }

    async fn finish_bench_transition(
        &self,
        id: &BenchId,
        job: &AgentJobId,
        to: BenchStatus,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE benches
            SET status = $1, active_job = NULL, error = $2, updated_at = NOW()
            WHERE name = $3 AND active_job = $4
            "#,
        )
        .bind(to.as_str())
        .bind(error)
        .bind(id.as_str())
        .bind(job.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get_bench(id).await?.is_none() {
                return Err(ControlError::not_found(EntityKind::Bench, id));
            }
            return Ok(false);
        }

        Ok(true)
    }
}

#[async_trait]
impl PlanStore for PostgresStore {
    async fn upsert_plan(&self, record: &PlanRecord) -> ControlResult<PlanRecord> {
        sqlx::query(
            r#"
            INSERT INTO plans (name, price_usd, price_inr, period, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(record.name.as_str())
        .bind(record.price_usd)
        .bind(record.price_inr)
        .bind(i64::from(record.period))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        self.get_plan(&record.name)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Plan, &record.name))
    }

    async fn get_plan(&self, id: &PlanId) -> ControlResult<Option<PlanRecord>> {
        let row = sqlx::query("SELECT * FROM plans WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_plan).transpose()
    }
}

#[async_trait]
impl SiteStore for PostgresStore {
    async fn insert_site(&self, record: &SiteRecord) -> ControlResult<()> {
        let apps = to_json(&record.data.apps, "site apps")?;
        let mut tx = self.pool.begin().await?;

        // Shares the row lock an archive claim takes exclusively
        let row = sqlx::query("SELECT * FROM benches WHERE name = $1 FOR SHARE")
            .bind(record.data.bench.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Bench, &record.data.bench))?;
        ensure_bench_accepts_sites(&row_to_bench(&row)?)?;

        let result = sqlx::query(
            r#"
            INSERT INTO sites (
                name, subdomain, bench, server, plan, apps, status, active_job,
                error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(record.data.name.as_str())
        .bind(&record.data.subdomain)
        .bind(record.data.bench.as_str())
        .bind(record.data.server.as_str())
        .bind(record.data.plan.as_str())
        .bind(&apps)
        .bind(record.status.as_str())
        .bind(record.data.active_job.as_ref().map(AgentJobId::as_str))
        .bind(&record.data.error)
        .bind(record.data.created_at)
        .bind(record.data.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::validation(format!(
                "site {} already exists",
                record.name()
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_site(&self, id: &SiteId) -> ControlResult<Option<SiteRecord>> {
        let query = format!("SELECT {SITE_COLUMNS} FROM sites WHERE name = $1");
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_site).transpose()
    }

    async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<SiteRecord>> {
        let mut query = format!("SELECT {SITE_COLUMNS} FROM sites WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref bench) = filter.bench {
            params.push(bench.as_str().to_owned());
            query.push_str(&format!(" AND bench = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        query.push_str(" ORDER BY name");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(row_to_site).collect()
    }

    async fn claim_site_transition(
        &self,
        id: &SiteId,
        claim: Claim<'_, SiteStatus>,
    ) -> ControlResult<SiteRecord> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {SITE_COLUMNS} FROM sites WHERE name = $1 FOR UPDATE");
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::Site, id))?;
        let mut site = row_to_site(&row)?;

        if let Some(ref job) = site.data.active_job {
            return Err(ControlError::StateConflict {
                kind: EntityKind::Site,
                id: id.to_string(),
                job: job.to_string(),
            });
        }
        if !claim.allowed.contains(&site.status) {
            return Err(ControlError::InvalidStateTransition {
                from: site.status.as_str(),
                to: claim.target.as_str(),
            });
        }

        site.data.active_job = Some(claim.job.clone());
        if let Some(during) = claim.during {
            site.status = during;
        }
        site.data.updated_at = Utc::now();

        sqlx::query(
            "UPDATE sites SET status = $1, active_job = $2, updated_at = $3 WHERE name = $4",
        )
        .bind(site.status.as_str())
        .bind(claim.job.as_str())
        .bind(site.data.updated_at)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(site)
    }

    async fn progress_site_transition(
        &self,
        id: &SiteId,
        job: &AgentJobId,
        from: SiteStatus,
        to: SiteStatus,
    ) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sites
            SET status = $1, updated_at = NOW()
            WHERE name = $2 AND active_job = $3 AND status = $4
            "#,
        )
        .bind(to.as_str())
        .bind(id.as_str())
        .bind(job.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get_site(id).await?.is_none() {
                return Err(ControlError::not_found(EntityKind::Site, id));
            }
            return Ok(false);
        }

        Ok(true)
    }

    async fn finish_site_transition(
        &self,
        id: &SiteId,
        job: &AgentJobId,
        to: SiteStatus,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sites
            SET status = $1, active_job = NULL, error = $2, updated_at = NOW()
            WHERE name = $3 AND active_job = $4
            "#,
        )
        .bind(to.as_str())
        .bind(error)
        .bind(id.as_str())
        .bind(job.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get_site(id).await?.is_none() {
                return Err(ControlError::not_found(EntityKind::Site, id));
            }
            return Ok(false);
        }

        Ok(true)
    }
}

#[async_trait]
impl DomainStore for PostgresStore {
    async fn insert_domain(&self, record: &SiteDomainRecord) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_site(&mut tx, &record.site).await?;

        if let Some(existing) = sqlx::query("SELECT site FROM site_domains WHERE name = $1")
            .bind(record.name.as_str())
            .fetch_optional(&mut *tx)
            .await?
        {
            let site: String = existing.try_get("site")?;
            return Err(ControlError::validation(format!(
                "domain {} is already bound to {site}",
                record.name
            )));
        }

        if record.primary {
            sqlx::query(
                r#"
                UPDATE site_domains SET is_primary = FALSE, updated_at = NOW()
                WHERE site = $1 AND is_primary
                "#,
            )
            .bind(record.site.as_str())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO site_domains (name, site, is_primary, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.name.as_str())
        .bind(record.site.as_str())
        .bind(record.primary)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_domain(&self, id: &DomainId) -> ControlResult<Option<SiteDomainRecord>> {
        let row = sqlx::query("SELECT * FROM site_domains WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_domain).transpose()
    }

    async fn list_domains(&self, site: &SiteId) -> ControlResult<Vec<SiteDomainRecord>> {
        let rows =
            sqlx::query("SELECT * FROM site_domains WHERE site = $1 ORDER BY created_at, name")
                .bind(site.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(row_to_domain).collect()
    }

    async fn set_domain_primary(
        &self,
        id: &DomainId,
        primary: bool,
    ) -> ControlResult<SiteDomainRecord> {
        let mut tx = self.pool.begin().await?;

        let site: String = sqlx::query("SELECT site FROM site_domains WHERE name = $1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::SiteDomain, id))?
            .try_get("site")?;
        lock_site(&mut tx, &SiteId::new(site.as_str())).await?;

        // Re-read under the lock; the domain may have been deleted meanwhile
        if sqlx::query("SELECT name FROM site_domains WHERE name = $1 AND site = $2")
            .bind(id.as_str())
            .bind(&site)
            .fetch_optional(&mut *tx)
            .await?
            .is_none()
        {
            return Err(ControlError::not_found(EntityKind::SiteDomain, id));
        }

        if primary {
            sqlx::query(
                r#"
                UPDATE site_domains SET is_primary = FALSE, updated_at = NOW()
                WHERE site = $1 AND name <> $2 AND is_primary
                "#,
            )
            .bind(&site)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(
            r#"
            UPDATE site_domains SET is_primary = $1, updated_at = NOW()
            WHERE name = $2
            RETURNING *
            "#,
        )
        .bind(primary)
        .bind(id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let record = row_to_domain(&row)?;

        tx.commit().await?;
        Ok(record)
    }

    async fn delete_domain(&self, id: &DomainId) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM site_domains WHERE name = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(EntityKind::SiteDomain, id));
        }

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert_job(&self, record: &AgentJobRecord) -> ControlResult<()> {
        let files = to_json(&record.files, "job files")?;

        sqlx::query(
            r#"
            INSERT INTO agent_jobs (
                id, job_type, host, path, method, payload, files, target_kind, target_id,
                remote_id, status, attempts, error, output, deadline, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.job_type.as_str())
        .bind(&record.host)
        .bind(&record.path)
        .bind(&record.method)
        .bind(&record.payload)
        .bind(&files)
        .bind(record.target.kind().as_str())
        .bind(record.target.id())
        .bind(&record.remote_id)
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(&record.error)
        .bind(&record.output)
        .bind(record.deadline)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, id: &AgentJobId) -> ControlResult<Option<AgentJobRecord>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> ControlResult<Vec<AgentJobRecord>> {
        let mut query = format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref target) = filter.target {
            params.push(target.kind().as_str().to_owned());
            query.push_str(&format!(" AND target_kind = ${}", params.len()));
            params.push(target.id().to_owned());
            query.push_str(&format!(" AND target_id = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn list_open_jobs(&self) -> ControlResult<Vec<AgentJobRecord>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs \
             WHERE status IN ('undelivered', 'delivered') \
             ORDER BY created_at"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn mark_job_delivered(&self, id: &AgentJobId, remote_id: &str) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_jobs
            SET status = $1, remote_id = $2, attempts = attempts + 1, error = NULL,
                updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(JobStatus::Delivered.as_str())
        .bind(remote_id)
        .bind(id.as_str())
        .bind(JobStatus::Undelivered.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get_job(id).await?.is_none() {
                return Err(ControlError::not_found(EntityKind::AgentJob, id));
            }
            return Ok(false);
        }

        Ok(true)
    }

    async fn record_job_attempt(&self, id: &AgentJobId, error: &str) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE agent_jobs
            SET attempts = attempts + 1, error = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(EntityKind::AgentJob, id));
        }

        Ok(())
    }

    async fn finish_job(
        &self,
        id: &AgentJobId,
        status: JobStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_jobs
            SET status = $1, output = $2, error = $3, updated_at = NOW()
            WHERE id = $4 AND status IN ('undelivered', 'delivered')
            "#,
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get_job(id).await?.is_none() {
                return Err(ControlError::not_found(EntityKind::AgentJob, id));
            }
            return Ok(false);
        }

        Ok(true)
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    async fn seed_site(store: &PostgresStore, suffix: &str) -> SiteId {
        let now = Utc::now();
        let proxy = ProxyServerId::new(format!("n-{suffix}.harbour.test"));
        let server = ServerId::new(format!("f-{suffix}.harbour.test"));
        let group = ReleaseGroupId::new(format!("group-{suffix}"));
        let candidate = DeployCandidateId::generate();
        let bench = BenchId::new(format!("bench-{suffix}"));

        store
            .upsert_proxy_server(&ProxyServerRecord {
                name: proxy.clone(),
                status: HostStatus::Active,
                ip: None,
                private_ip: None,
                reachable: true,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("proxy insert failed");
        store
            .upsert_server(&ServerRecord {
                name: server.clone(),
                status: HostStatus::Active,
                ip: None,
                private_ip: None,
                proxy_server: proxy,
                reachable: true,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("server insert failed");
        store
            .upsert_release_group(&ReleaseGroupRecord {
                name: group.clone(),
                apps: vec![AppId::new("frappe")],
                enabled: true,
                frozen: false,
                config: serde_json::json!({}),
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("group insert failed");
        store
            .insert_candidate(&DeployCandidateRecord {
                id: candidate.clone(),
                group: group.clone(),
                apps: Vec::new(),
                build_server: server.clone(),
                status: CandidateStatus::Built,
                job: None,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("candidate insert failed");
        store
            .insert_bench_within_capacity(
                &BenchRecord {
                    name: bench.clone(),
                    group,
                    candidate,
                    server: server.clone(),
                    workers: 1,
                    gunicorn_workers: 2,
                    status: BenchStatus::Active,
                    active_job: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                },
                None,
            )
            .await
            .expect("bench insert failed");
        store
            .upsert_plan(&PlanRecord {
                name: PlanId::new("basic"),
                price_usd: 10.0,
                price_inr: 750.0,
                period: 30,
                created_at: now,
            })
            .await
            .expect("plan insert failed");

        let site = SiteId::new(format!("s-{suffix}.harbour.test"));
        store
            .insert_site(&SiteRecord {
                data: SiteData {
                    name: site.clone(),
                    subdomain: format!("s-{suffix}"),
                    bench,
                    server,
                    plan: PlanId::new("basic"),
                    apps: vec![AppId::new("frappe")],
                    active_job: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                },
                status: SiteStatus::Active,
            })
            .await
            .expect("site insert failed");
        site
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn site_claim_and_finish() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url, 2).await.expect("failed to connect");
        let site = seed_site(&store, &AgentJobId::generate().to_string()).await;

        let job = AgentJobId::generate();
        let claimed = store
            .claim_site_transition(
                &site,
                Claim {
                    allowed: &[SiteStatus::Active],
                    during: None,
                    target: SiteStatus::Suspended,
                    job: &job,
                },
            )
            .await
            .expect("claim failed");
        assert_eq!(claimed.data.active_job.as_ref(), Some(&job));

        assert!(store
            .finish_site_transition(&site, &job, SiteStatus::Suspended, None)
            .await
            .expect("finish failed"));

        let stored = store
            .get_site(&site)
            .await
            .expect("get failed")
            .expect("site not found");
        assert_eq!(stored.status, SiteStatus::Suspended);
        assert!(stored.data.active_job.is_none());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn primary_domain_is_exclusive() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url, 2).await.expect("failed to connect");
        let suffix = AgentJobId::generate().to_string();
        let site = seed_site(&store, &suffix).await;
        let now = Utc::now();

        for (name, primary) in [("a", true), ("b", false)] {
            store
                .insert_domain(&SiteDomainRecord {
                    name: DomainId::new(format!("{name}-{suffix}.example.com")),
                    site: site.clone(),
                    primary,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .expect("domain insert failed");
        }

        store
            .set_domain_primary(&DomainId::new(format!("b-{suffix}.example.com")), true)
            .await
            .expect("set primary failed");

        let domains = store.list_domains(&site).await.expect("list failed");
        assert_eq!(domains.iter().filter(|d| d.primary).count(), 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn concurrent_primary_flags_are_serialised() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url, 4).await.expect("failed to connect");
        let suffix = AgentJobId::generate().to_string();
        let site = seed_site(&store, &suffix).await;
        let now = Utc::now();

        let names: Vec<_> = ["a", "b"]
            .iter()
            .map(|n| DomainId::new(format!("{n}-{suffix}.example.com")))
            .collect();
        for name in &names {
            store
                .insert_domain(&SiteDomainRecord {
                    name: name.clone(),
                    site: site.clone(),
                    primary: false,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .expect("domain insert failed");
        }

        let (first, second) = tokio::join!(
            store.set_domain_primary(&names[0], true),
            store.set_domain_primary(&names[1], true),
        );
        first.expect("first flag failed");
        second.expect("second flag failed");

        let domains = store.list_domains(&site).await.expect("list failed");
        assert_eq!(domains.iter().filter(|d| d.primary).count(), 1);
    }
}
