use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{NodeStatus, ProbeNode, RegistrationToken, UsageLog};

/// Async SQLite-backed store for the durable control-plane state: probe
/// nodes, registration tokens, and usage logs.
///
/// Rate counters and the admission queue are deliberately volatile; a
/// restart starts with fresh windows and an empty queue.
pub struct StateDb {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – domain values <-> SQLite text
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn dt_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("parse stored timestamp")
        .with_timezone(&Utc)
}

fn uuid_from_sql(raw: &str) -> Uuid {
    Uuid::parse_str(raw).expect("parse stored uuid")
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProbeNode> {
    let tools_json: String = row.get("supported_tools")?;
    Ok(ProbeNode {
        node_uuid: uuid_from_sql(&row.get::<_, String>("node_uuid")?),
        api_key: row.get("api_key")?,
        name: row.get("name")?,
        hostname: row.get("hostname")?,
        region: row.get("region")?,
        zone: row.get("zone")?,
        internal_ip: row.get("internal_ip")?,
        external_ip: row.get("external_ip")?,
        version: row.get("version")?,
        supported_tools: serde_json::from_str(&tools_json).expect("deserialize tool set"),
        priority: row.get("priority")?,
        max_concurrent_probes: row.get("max_concurrent_probes")?,
        status: enum_from_sql(&row.get::<_, String>("status")?),
        last_heartbeat: row
            .get::<_, Option<String>>("last_heartbeat")?
            .map(|s| dt_from_sql(&s)),
        last_connected: row
            .get::<_, Option<String>>("last_connected")?
            .map(|s| dt_from_sql(&s)),
        current_load: row.get("current_load")?,
        avg_response_time: row.get("avg_response_time")?,
        error_count: row.get("error_count")?,
        total_probes_executed: row.get::<_, i64>("total_probes_executed")? as u64,
        reconnect_count: row.get("reconnect_count")?,
        connection_id: row
            .get::<_, Option<String>>("connection_id")?
            .map(|s| uuid_from_sql(&s)),
        created_at: dt_from_sql(&row.get::<_, String>("created_at")?),
        updated_at: dt_from_sql(&row.get::<_, String>("updated_at")?),
    })
}

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistrationToken> {
    Ok(RegistrationToken {
        token: row.get("token")?,
        description: row.get("description")?,
        created_by: row.get("created_by")?,
        intended_region: row.get("intended_region")?,
        created_at: dt_from_sql(&row.get::<_, String>("created_at")?),
        expires_at: dt_from_sql(&row.get::<_, String>("expires_at")?),
        is_used: row.get("is_used")?,
        used_at: row
            .get::<_, Option<String>>("used_at")?
            .map(|s| dt_from_sql(&s)),
        node_uuid: row
            .get::<_, Option<String>>("node_uuid")?
            .map(|s| uuid_from_sql(&s)),
    })
}

impl StateDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS probe_nodes (
                        node_uuid             TEXT PRIMARY KEY,
                        api_key               TEXT NOT NULL UNIQUE,
                        name                  TEXT NOT NULL,
                        hostname              TEXT,
                        region                TEXT NOT NULL,
                        zone                  TEXT,
                        internal_ip           TEXT,
                        external_ip           TEXT,
                        version               TEXT,
                        supported_tools       TEXT NOT NULL,
                        priority              INTEGER NOT NULL DEFAULT 0,
                        max_concurrent_probes INTEGER NOT NULL DEFAULT 10,
                        status                TEXT NOT NULL,
                        last_heartbeat        TEXT,
                        last_connected        TEXT,
                        current_load          REAL NOT NULL DEFAULT 0,
                        avg_response_time     REAL NOT NULL DEFAULT 0,
                        error_count           INTEGER NOT NULL DEFAULT 0,
                        total_probes_executed INTEGER NOT NULL DEFAULT 0,
                        reconnect_count       INTEGER NOT NULL DEFAULT 0,
                        connection_id         TEXT,
                        created_at            TEXT NOT NULL,
                        updated_at            TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_nodes_status ON probe_nodes(status);
                    CREATE INDEX IF NOT EXISTS idx_nodes_region ON probe_nodes(region);

                    CREATE TABLE IF NOT EXISTS registration_tokens (
                        token           TEXT PRIMARY KEY,
                        description     TEXT NOT NULL,
                        created_by      INTEGER,
                        intended_region TEXT,
                        created_at      TEXT NOT NULL,
                        expires_at      TEXT NOT NULL,
                        is_used         INTEGER NOT NULL DEFAULT 0,
                        used_at         TEXT,
                        node_uuid       TEXT
                    );

                    CREATE TABLE IF NOT EXISTS usage_logs (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        principal     TEXT NOT NULL,
                        endpoint      TEXT NOT NULL,
                        timestamp     TEXT NOT NULL,
                        success       INTEGER NOT NULL,
                        response_time REAL NOT NULL,
                        client_addr   TEXT NOT NULL,
                        tier          TEXT NOT NULL,
                        api_key_id    INTEGER,
                        was_queued    INTEGER NOT NULL,
                        queue_wait    REAL NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_usage_principal ON usage_logs(principal);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Probe nodes
    // -----------------------------------------------------------------------

    pub async fn upsert_node(&self, node: &ProbeNode) -> Result<(), tokio_rusqlite::Error> {
        let node = node.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO probe_nodes (node_uuid, api_key, name, hostname, region, zone,
                        internal_ip, external_ip, version, supported_tools, priority,
                        max_concurrent_probes, status, last_heartbeat, last_connected,
                        current_load, avg_response_time, error_count, total_probes_executed,
                        reconnect_count, connection_id, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)
                     ON CONFLICT(node_uuid) DO UPDATE SET
                        api_key=excluded.api_key, name=excluded.name, hostname=excluded.hostname,
                        region=excluded.region, zone=excluded.zone,
                        internal_ip=excluded.internal_ip, external_ip=excluded.external_ip,
                        version=excluded.version, supported_tools=excluded.supported_tools,
                        priority=excluded.priority,
                        max_concurrent_probes=excluded.max_concurrent_probes,
                        status=excluded.status, last_heartbeat=excluded.last_heartbeat,
                        last_connected=excluded.last_connected, current_load=excluded.current_load,
                        avg_response_time=excluded.avg_response_time,
                        error_count=excluded.error_count,
                        total_probes_executed=excluded.total_probes_executed,
                        reconnect_count=excluded.reconnect_count,
                        connection_id=excluded.connection_id, updated_at=excluded.updated_at",
                    rusqlite::params![
                        node.node_uuid.to_string(),
                        node.api_key,
                        node.name,
                        node.hostname,
                        node.region,
                        node.zone,
                        node.internal_ip,
                        node.external_ip,
                        node.version,
                        serde_json::to_string(&node.supported_tools).expect("serialize tool set"),
                        node.priority,
                        node.max_concurrent_probes,
                        enum_to_sql(&node.status),
                        node.last_heartbeat.map(|d| d.to_rfc3339()),
                        node.last_connected.map(|d| d.to_rfc3339()),
                        node.current_load,
                        node.avg_response_time,
                        node.error_count,
                        node.total_probes_executed as i64,
                        node.reconnect_count,
                        node.connection_id.map(|u| u.to_string()),
                        node.created_at.to_rfc3339(),
                        node.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_node(&self, node_uuid: Uuid) -> Result<Option<ProbeNode>, tokio_rusqlite::Error> {
        let id = node_uuid.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM probe_nodes WHERE node_uuid = ?1")?;
                let mut rows = stmt.query_map([id], node_from_row)?;
                Ok(rows.next().transpose()?)
            })
            .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<ProbeNode>, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM probe_nodes ORDER BY created_at ASC")?;
                let rows = stmt.query_map([], node_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Downgrade every previously `active` node to `disconnected`.
    ///
    /// Sessions are volatile; after a restart none of them exist.
    pub async fn mark_all_disconnected(&self) -> Result<usize, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let changed = conn.execute(
                    "UPDATE probe_nodes
                     SET status = ?1, connection_id = NULL, updated_at = ?2
                     WHERE status = ?3",
                    rusqlite::params![
                        enum_to_sql(&NodeStatus::Disconnected),
                        Utc::now().to_rfc3339(),
                        enum_to_sql(&NodeStatus::Active),
                    ],
                )?;
                Ok(changed)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Registration tokens
    // -----------------------------------------------------------------------

    pub async fn insert_token(
        &self,
        token: &RegistrationToken,
    ) -> Result<(), tokio_rusqlite::Error> {
        let token = token.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO registration_tokens (token, description, created_by,
                        intended_region, created_at, expires_at, is_used, used_at, node_uuid)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        token.token,
                        token.description,
                        token.created_by,
                        token.intended_region,
                        token.created_at.to_rfc3339(),
                        token.expires_at.to_rfc3339(),
                        token.is_used,
                        token.used_at.map(|d| d.to_rfc3339()),
                        token.node_uuid.map(|u| u.to_string()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_token(
        &self,
        token: &str,
    ) -> Result<Option<RegistrationToken>, tokio_rusqlite::Error> {
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM registration_tokens WHERE token = ?1")?;
                let mut rows = stmt.query_map([token], token_from_row)?;
                Ok(rows.next().transpose()?)
            })
            .await
    }

    pub async fn list_tokens(
        &self,
        include_used: bool,
        include_expired: bool,
    ) -> Result<Vec<RegistrationToken>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM registration_tokens ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], token_from_row)?;
                let now = Utc::now();
                let tokens = rows
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .filter(|t| include_used || !t.is_used)
                    .filter(|t| include_expired || t.expires_at > now)
                    .collect();
                Ok(tokens)
            })
            .await
    }

    /// Revoke a token: mark it used and expire it immediately.
    ///
    /// Returns `false` when no such token exists.
    pub async fn revoke_token(&self, token: &str) -> Result<bool, tokio_rusqlite::Error> {
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                let now = Utc::now().to_rfc3339();
                let changed = conn.execute(
                    "UPDATE registration_tokens
                     SET is_used = 1, used_at = ?1, expires_at = ?1
                     WHERE token = ?2",
                    rusqlite::params![now, token],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Consume a registration token and insert the freshly minted node in a
    /// single transaction.
    ///
    /// Returns `Ok(None)` when the token is missing, already used, or
    /// expired — the token's used flag flips false→true at most once, no
    /// matter how many registrations race on it.
    pub async fn register_node(
        &self,
        token: String,
        node: ProbeNode,
    ) -> Result<Option<ProbeNode>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let now = Utc::now();
                let tx = conn.transaction()?;

                let consumed = tx.execute(
                    "UPDATE registration_tokens
                     SET is_used = 1, used_at = ?1, node_uuid = ?2
                     WHERE token = ?3 AND is_used = 0 AND expires_at > ?1",
                    rusqlite::params![
                        now.to_rfc3339(),
                        node.node_uuid.to_string(),
                        token,
                    ],
                )?;
                if consumed == 0 {
                    // Dropping the transaction rolls it back.
                    return Ok(None);
                }

                tx.execute(
                    "INSERT INTO probe_nodes (node_uuid, api_key, name, hostname, region, zone,
                        internal_ip, external_ip, version, supported_tools, priority,
                        max_concurrent_probes, status, last_heartbeat, last_connected,
                        current_load, avg_response_time, error_count, total_probes_executed,
                        reconnect_count, connection_id, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
                    rusqlite::params![
                        node.node_uuid.to_string(),
                        node.api_key,
                        node.name,
                        node.hostname,
                        node.region,
                        node.zone,
                        node.internal_ip,
                        node.external_ip,
                        node.version,
                        serde_json::to_string(&node.supported_tools).expect("serialize tool set"),
                        node.priority,
                        node.max_concurrent_probes,
                        enum_to_sql(&node.status),
                        node.last_heartbeat.map(|d| d.to_rfc3339()),
                        node.last_connected.map(|d| d.to_rfc3339()),
                        node.current_load,
                        node.avg_response_time,
                        node.error_count,
                        node.total_probes_executed as i64,
                        node.reconnect_count,
                        node.connection_id.map(|u| u.to_string()),
                        node.created_at.to_rfc3339(),
                        node.updated_at.to_rfc3339(),
                    ],
                )?;

                tx.commit()?;
                Ok(Some(node))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Usage logs
    // -----------------------------------------------------------------------

    pub async fn append_usage(&self, log: &UsageLog) -> Result<(), tokio_rusqlite::Error> {
        let log = log.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO usage_logs (principal, endpoint, timestamp, success,
                        response_time, client_addr, tier, api_key_id, was_queued, queue_wait)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        log.principal.to_string(),
                        log.endpoint,
                        log.timestamp.to_rfc3339(),
                        log.success,
                        log.response_time,
                        log.client_addr,
                        log.tier,
                        log.api_key_id,
                        log.was_queued,
                        log.queue_wait,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// The most recent usage rows, newest first (test and ops visibility).
    pub async fn recent_usage(&self, limit: u32) -> Result<Vec<StoredUsage>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT principal, endpoint, timestamp, success, response_time,
                            client_addr, tier, api_key_id, was_queued, queue_wait
                     FROM usage_logs ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |row| {
                    Ok(StoredUsage {
                        principal: row.get(0)?,
                        endpoint: row.get(1)?,
                        timestamp: dt_from_sql(&row.get::<_, String>(2)?),
                        success: row.get(3)?,
                        response_time: row.get(4)?,
                        client_addr: row.get(5)?,
                        tier: row.get(6)?,
                        api_key_id: row.get(7)?,
                        was_queued: row.get(8)?,
                        queue_wait: row.get(9)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}

/// A usage row as read back from the store (principal kept as its display
/// key).
#[derive(Debug, Clone)]
pub struct StoredUsage {
    pub principal: String,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time: f64,
    pub client_addr: String,
    pub tier: String,
    pub api_key_id: Option<i64>,
    pub was_queued: bool,
    pub queue_wait: f64,
}
