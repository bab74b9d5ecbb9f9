/// Redis cache backend speaking RESP2 over one TCP connection
///
/// Commands are serialized by a mutex around the connection. A request whose
/// future was dropped before its reply arrived leaves the connection in an
/// unknown state, so the next command reconnects first.
use super::resp::{RespEncoder, RespParser, RespValue};
use super::{BackendKind, CacheBackend, CacheError, CacheResult};
use crate::core::dsn::{self, Dsn};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Keys requested per SCAN iteration
const SCAN_COUNT: &[u8] = b"500";

pub struct RedisBackend {
    address: String,
    username: Option<String>,
    password: Option<String>,
    database: u32,
    namespace: String,
    conn: Mutex<Option<RespConnection>>,
}

struct RespConnection {
    stream: TcpStream,
    buffer: BytesMut,
    in_flight: bool,
}

impl RespConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            in_flight: false,
        }
    }

    async fn request(&mut self, command: &RespValue) -> CacheResult<RespValue> {
        self.in_flight = true;

        let mut out = BytesMut::new();
        RespEncoder::encode_into(&mut out, command);
        self.stream.write_all(&out).await?;

        let reply = self.read_reply().await?;
        self.in_flight = false;

        match reply {
            RespValue::Error(message) => Err(CacheError::Command(message)),
            other => Ok(other),
        }
    }

    async fn read_reply(&mut self) -> CacheResult<RespValue> {
        loop {
            if let Some(value) = RespParser::parse(&mut self.buffer)? {
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(CacheError::Unavailable(
                    "connection closed by server".to_string(),
                ));
            }
        }
    }
}

impl RedisBackend {
    /// Connect and handshake (AUTH, SELECT, PING)
    pub async fn connect(url: &str, namespace: impl Into<String>) -> CacheResult<Self> {
        let parsed = Dsn::parse(url).map_err(|e| CacheError::InvalidUrl(e.to_string()))?;
        let address = parsed
            .endpoint()
            .map_err(|e| CacheError::InvalidUrl(e.to_string()))?;
        let database = match parsed.path.as_deref() {
            Some(db) => db
                .parse::<u32>()
                .map_err(|_| CacheError::InvalidUrl(format!("invalid database index: {}", db)))?,
            None => 0,
        };

        let backend = Self {
            address,
            username: parsed.username,
            password: parsed.password,
            database,
            namespace: namespace.into(),
            conn: Mutex::new(None),
        };

        let conn = backend.open().await?;
        *backend.conn.lock().await = Some(conn);
        debug!(url = %dsn::redact(url), database, "Redis cache backend connected");

        Ok(backend)
    }

    async fn open(&self) -> CacheResult<RespConnection> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let mut conn = RespConnection::new(stream);

        if let Some(password) = &self.password {
            let auth = match &self.username {
                Some(user) => {
                    RespEncoder::create_command("AUTH", &[user.as_bytes(), password.as_bytes()])
                }
                None => RespEncoder::create_command("AUTH", &[password.as_bytes()]),
            };
            conn.request(&auth).await?;
        }

        if self.database != 0 {
            let db = self.database.to_string();
            conn.request(&RespEncoder::create_command("SELECT", &[db.as_bytes()]))
                .await?;
        }

        match conn.request(&RespEncoder::create_command("PING", &[])).await? {
            RespValue::SimpleString(pong) if pong == "PONG" => Ok(conn),
            other => Err(unexpected("PING", &other)),
        }
    }

    async fn command(&self, name: &str, args: &[&[u8]]) -> CacheResult<RespValue> {
        let mut guard = self.conn.lock().await;

        if !matches!(guard.as_ref(), Some(conn) if !conn.in_flight) {
            debug!("Reconnecting to Redis cache backend");
            *guard = Some(self.open().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(CacheError::Unavailable("no connection".to_string()));
        };

        conn.request(&RespEncoder::create_command(name, args)).await
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let key = self.key(key);
        match self.command("GET", &[key.as_bytes()]).await? {
            RespValue::BulkString(value) => Ok(value),
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let key = self.key(key);
        let millis = ttl.as_millis().max(1).to_string();
        match self
            .command("SET", &[key.as_bytes(), &value[..], b"PX", millis.as_bytes()])
            .await?
        {
            RespValue::SimpleString(_) => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let key = self.key(key);
        match self.command("DEL", &[key.as_bytes()]).await? {
            RespValue::Integer(_) => Ok(()),
            other => Err(unexpected("DEL", &other)),
        }
    }

    async fn invalidate_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let pattern = format!("{}{}*", escape_glob(&self.namespace), escape_glob(prefix));
        let mut cursor = Bytes::from_static(b"0");
        let mut removed = 0u64;

        loop {
            let reply = self
                .command(
                    "SCAN",
                    &[&cursor[..], b"MATCH", pattern.as_bytes(), b"COUNT", SCAN_COUNT],
                )
                .await?;
            let (next, keys) = scan_page(reply)?;

            if !keys.is_empty() {
                let args: Vec<&[u8]> = keys.iter().map(|k| &k[..]).collect();
                match self.command("DEL", &args).await? {
                    RespValue::Integer(n) => removed += n.max(0) as u64,
                    other => return Err(unexpected("DEL", &other)),
                }
            }

            if &next[..] == b"0" {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

/// Split a SCAN reply into the next cursor and the page of keys
fn scan_page(reply: RespValue) -> CacheResult<(Bytes, Vec<Bytes>)> {
    let mut parts = match reply {
        RespValue::Array(Some(parts)) => parts,
        other => return Err(unexpected("SCAN", &other)),
    };
    if parts.len() != 2 {
        return Err(CacheError::UnexpectedReply(format!(
            "SCAN returned {} elements",
            parts.len()
        )));
    }

    let keys = match parts.pop() {
        Some(RespValue::Array(Some(items))) => items
            .into_iter()
            .filter_map(|item| match item {
                RespValue::BulkString(Some(key)) => Some(key),
                _ => None,
            })
            .collect(),
        Some(RespValue::Array(None)) => Vec::new(),
        other => {
            return Err(CacheError::UnexpectedReply(format!(
                "SCAN keys: {:?}",
                other
            )))
        }
    };
    let cursor = match parts.pop() {
        Some(RespValue::BulkString(Some(cursor))) => cursor,
        other => {
            return Err(CacheError::UnexpectedReply(format!(
                "SCAN cursor: {:?}",
                other
            )))
        }
    };

    Ok((cursor, keys))
}

/// Escape glob metacharacters so the text matches literally in SCAN MATCH
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn unexpected(command: &str, reply: &RespValue) -> CacheError {
    CacheError::UnexpectedReply(format!("{}: {:?}", command, reply))
}
