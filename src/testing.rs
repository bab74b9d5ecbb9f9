/// Test doubles: an in-memory connector and a fake Redis server
use crate::cache::resp::{RespEncoder, RespParser, RespValue};
use crate::core::{Connection, Connector, PoolTarget};
use crate::error::{DataError, DataResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Per-target switches and counters shared by all connections to that target
#[derive(Debug, Default)]
pub struct MockTarget {
    connect_fails: AtomicBool,
    ping_fails: AtomicBool,
    lag_ms: Mutex<Option<u64>>,
    connects: AtomicU64,
    pings: AtomicU64,
    queries: AtomicU64,
}

impl MockTarget {
    pub fn set_connect_fails(&self, fails: bool) {
        self.connect_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_replication_lag(&self, lag: Option<Duration>) {
        *self.lag_ms.lock().unwrap() = lag.map(|l| l.as_millis() as u64);
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

/// Connector handing out `MockConnection`s keyed by target name.
///
/// Clones share their targets, so a test can keep one after handing the
/// connector to the layer.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    targets: Arc<Mutex<HashMap<String, Arc<MockTarget>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches for a target, created on first use
    pub fn target(&self, name: &str) -> Arc<MockTarget> {
        let mut targets = self.targets.lock().unwrap();
        Arc::clone(targets.entry(name.to_string()).or_default())
    }
}

#[derive(Debug)]
pub struct MockConnection {
    name: String,
    generation: u64,
    state: Arc<MockTarget>,
}

impl MockConnection {
    /// 1 for the first connection opened to the target, 2 for the second, ...
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Succeeds with `"<target>:<sql>"`
    pub async fn query(&mut self, sql: &str) -> DataResult<String> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}:{}", self.name, sql))
    }

    /// Like `query`, after sleeping for `delay`
    pub async fn slow_query(&mut self, sql: &str, delay: Duration) -> DataResult<String> {
        tokio::time::sleep(delay).await;
        self.query(sql).await
    }

    /// Fails the way a backend rejecting a statement does
    pub async fn reject(&mut self, message: &str) -> DataResult<String> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        Err(DataError::query(message))
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, target: &PoolTarget) -> DataResult<MockConnection> {
        let state = self.target(&target.name);
        if state.connect_fails.load(Ordering::SeqCst) {
            return Err(DataError::connection(&target.name, "connection refused"));
        }

        let generation = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection {
            name: target.name.clone(),
            generation,
            state,
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&mut self) -> DataResult<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.ping_fails.load(Ordering::SeqCst) {
            return Err(DataError::connection(&self.name, "server closed the connection"));
        }
        Ok(())
    }

    async fn replication_lag(&mut self) -> DataResult<Option<Duration>> {
        let lag = *self.state.lag_ms.lock().unwrap();
        Ok(lag.map(Duration::from_millis))
    }
}

#[derive(Debug, Default)]
struct FakeRedisState {
    data: BTreeMap<String, (Bytes, Option<u64>)>,
    commands: Vec<String>,
    auth: Vec<String>,
    cursors: Vec<String>,
    scan_calls: u64,
    hang_up: bool,
}

/// Minimal RESP2 server on a loopback port, enough for the cache backend
pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<Mutex<FakeRedisState>>,
    accept: JoinHandle<()>,
}

impl FakeRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(FakeRedisState::default()));

        let accept = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&state)));
                }
            })
        };

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// TTL in milliseconds passed with the last SET of `key`
    pub fn ttl_ms(&self, key: &str) -> Option<u64> {
        self.state.lock().unwrap().data.get(key).and_then(|(_, ttl)| *ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().data.keys().cloned().collect()
    }

    /// Command names received, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Arguments of the last AUTH command
    pub fn auth_args(&self) -> Vec<String> {
        self.state.lock().unwrap().auth.clone()
    }

    pub fn scan_calls(&self) -> u64 {
        self.state.lock().unwrap().scan_calls
    }

    /// Close the connection instead of answering the next command
    pub fn hang_up_next(&self) {
        self.state.lock().unwrap().hang_up = true;
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<FakeRedisState>>) {
    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some(command)) = RespParser::parse(&mut buf) {
            let reply = {
                let mut state = state.lock().unwrap();
                if state.hang_up {
                    state.hang_up = false;
                    return;
                }
                state.handle(command)
            };
            if stream.write_all(&RespEncoder::encode(&reply)).await.is_err() {
                return;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

impl FakeRedisState {
    fn handle(&mut self, command: RespValue) -> RespValue {
        let args: Vec<Bytes> = match command {
            RespValue::Array(Some(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    RespValue::BulkString(Some(arg)) => Some(arg),
                    _ => None,
                })
                .collect(),
            _ => return RespValue::Error("ERR expected array".to_string()),
        };
        let text = |i: usize| String::from_utf8_lossy(&args[i]).into_owned();
        let name = text(0).to_ascii_uppercase();
        self.commands.push(name.clone());
        let ok = RespValue::SimpleString("OK".to_string());

        match name.as_str() {
            "PING" => RespValue::SimpleString("PONG".to_string()),
            "AUTH" => {
                self.auth = (1..args.len()).map(text).collect();
                ok
            }
            "SELECT" => ok,
            "GET" => RespValue::BulkString(self.data.get(&text(1)).map(|(v, _)| v.clone())),
            "SET" => {
                let ttl = if args.len() >= 5 && text(3).eq_ignore_ascii_case("PX") {
                    text(4).parse().ok()
                } else {
                    None
                };
                self.data.insert(text(1), (args[2].clone(), ttl));
                ok
            }
            "DEL" => {
                let removed = (1..args.len())
                    .filter(|i| self.data.remove(&text(*i)).is_some())
                    .count();
                RespValue::Integer(removed as i64)
            }
            "SCAN" => {
                self.scan_calls += 1;
                let cursor: usize = text(1).parse().unwrap_or(0);
                let prefix = unescape_glob(text(3).trim_end_matches('*'));
                let after = cursor.checked_sub(1).and_then(|i| self.cursors.get(i)).cloned();

                let mut matching = self
                    .data
                    .keys()
                    .filter(|k| after.as_ref().map(|a| *k > a).unwrap_or(true))
                    .filter(|k| k.starts_with(&prefix))
                    .cloned();
                let page: Vec<String> = matching.by_ref().take(2).collect();
                let next = match (matching.next(), page.last()) {
                    (Some(_), Some(last)) => {
                        self.cursors.push(last.clone());
                        self.cursors.len()
                    }
                    _ => 0,
                };

                RespValue::Array(Some(vec![
                    RespValue::bulk(next.to_string()),
                    RespValue::Array(Some(page.into_iter().map(RespValue::bulk).collect())),
                ]))
            }
            other => RespValue::Error(format!("ERR unknown command '{}'", other)),
        }
    }
}

fn unescape_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
