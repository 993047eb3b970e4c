//! Realtime tree database clients.
//!
//! The realtime backend stores a JSON tree addressed by slash-separated
//! paths and pushes the full value of a watched path whenever anything under
//! it changes. `RealtimeClient` covers the calls the adapter needs; it is
//! implemented by `HttpRealtimeClient` (Realtime Database REST API plus
//! server-sent events) and by `InMemoryRealtimeDb`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::error_handling::types::StorageError;

/// Receives the full value at a watched path; `None` when the path is empty.
pub type ValueCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Called once when a listener stops for good without being unregistered,
/// e.g. after the server revoked it or reconnecting gave up.
pub type ClosedCallback = Arc<dyn Fn(ListenerHandle) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub u64);

#[async_trait]
pub trait RealtimeClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StorageError>;

    /// Overwrites the value at `path`. Writing `null` deletes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), StorageError>;

    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Registers `callback` for every change under `path`. The current value
    /// is delivered first. `on_closed` fires if the listener dies on its own;
    /// the handle is no longer registered by then.
    async fn listen(
        &self,
        path: &str,
        callback: ValueCallback,
        on_closed: ClosedCallback,
    ) -> Result<ListenerHandle, StorageError>;

    /// Unregisters a listener. Unknown handles are ignored.
    async fn unlisten(&self, path: &str, handle: ListenerHandle);

    /// Number of listeners currently registered.
    fn active_listeners(&self) -> usize;
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn related(a: &str, b: &str) -> bool {
    let (a, b) = (segments(a), segments(b));
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).into_iter().try_fold(root, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(key.parse::<usize>().ok()?),
        _ => None,
    })
}

/// Arrays are stored children with sequential keys; writing below one turns
/// it back into a keyed object.
fn array_to_object(items: &mut Vec<Value>) -> Map<String, Value> {
    items
        .drain(..)
        .enumerate()
        .filter(|(_, v)| !v.is_null())
        .map(|(i, v)| (i.to_string(), v))
        .collect()
}

/// Writes `value` at `keys` under `node`, pruning objects left empty.
fn write_at(node: &mut Map<String, Value>, keys: &[&str], value: Option<Value>) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };
    if rest.is_empty() {
        match value {
            Some(v) if !v.is_null() => {
                node.insert(first.to_string(), v);
            }
            _ => {
                node.remove(*first);
            }
        }
        return;
    }
    let child = node
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Array(items) = child {
        *child = Value::Object(array_to_object(items));
    } else if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        write_at(map, rest, value);
        if map.is_empty() {
            node.remove(*first);
        }
    }
}

struct Listener {
    handle: ListenerHandle,
    path: String,
    callback: ValueCallback,
    on_closed: ClosedCallback,
}

#[derive(Default)]
struct TreeState {
    root: Map<String, Value>,
    listeners: Vec<Listener>,
}

/// In-process realtime database with synchronous push delivery.
///
/// Callbacks run after the write completes and with no lock held, so a
/// callback may call back into the database.
#[derive(Default)]
pub struct InMemoryRealtimeDb {
    state: Mutex<TreeState>,
    next_handle: AtomicU64,
    offline: AtomicBool,
}

impl InMemoryRealtimeDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later read and write fail until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Transport(
                "realtime database unreachable".to_string(),
            ));
        }
        Ok(())
    }

    /// Drops every listener as a server would on revoked credentials, and
    /// reports each one as closed.
    pub fn revoke_listeners(&self) {
        let revoked: Vec<Listener> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.listeners)
        };
        for listener in revoked {
            warn!("Listener {:?} on '{}' revoked", listener.handle, listener.path);
            (listener.on_closed)(listener.handle);
        }
    }

    fn value_at(root: &Map<String, Value>, path: &str) -> Option<Value> {
        let root = Value::Object(root.clone());
        lookup(&root, path).cloned()
    }

    fn write(&self, path: &str, value: Option<Value>) {
        let notifications: Vec<(ValueCallback, Option<Value>)> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let keys = segments(path);
            if keys.is_empty() {
                state.root = match value {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
            } else {
                write_at(&mut state.root, &keys, value);
            }
            state
                .listeners
                .iter()
                .filter(|l| related(&l.path, path))
                .map(|l| (l.callback.clone(), Self::value_at(&state.root, &l.path)))
                .collect()
        };
        trace!("Write at '{}' notifies {} listener(s)", path, notifications.len());
        for (callback, value) in notifications {
            callback(value);
        }
    }
}

#[async_trait]
impl RealtimeClient for InMemoryRealtimeDb {
    async fn get(&self, path: &str) -> Result<Option<Value>, StorageError> {
        self.check_online()?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Self::value_at(&state.root, path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StorageError> {
        self.check_online()?;
        self.write(path, Some(value));
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.check_online()?;
        self.write(path, None);
        Ok(())
    }

    async fn listen(
        &self,
        path: &str,
        callback: ValueCallback,
        on_closed: ClosedCallback,
    ) -> Result<ListenerHandle, StorageError> {
        self.check_online()?;
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let initial = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.push(Listener {
                handle,
                path: path.to_string(),
                callback: callback.clone(),
                on_closed,
            });
            Self::value_at(&state.root, path)
        };
        callback(initial);
        Ok(handle)
    }

    async fn unlisten(&self, path: &str, handle: ListenerHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.listeners.len();
        state
            .listeners
            .retain(|l| !(l.handle == handle && l.path == path));
        if state.listeners.len() == before {
            warn!("No listener {:?} registered at '{}'", handle, path);
        }
    }

    fn active_listeners(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }
}

/// Connection details shared with listener tasks.
#[derive(Clone)]
struct Endpoint {
    http: reqwest::Client,
    base_url: String,
    auth: Option<String>,
}

impl Endpoint {
    /// Request URL including the `auth` secret. Never log it; reqwest errors
    /// are stripped of it in the `From` conversion.
    fn url(&self, path: &str) -> String {
        let path = segments(path).join("/");
        match &self.auth {
            Some(token) => format!("{}/{}.json?auth={}", self.base_url, path, token),
            None => format!("{}/{}.json", self.base_url, path),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!("Realtime database returned {}: {}", status, body);
        Err(StorageError::Transport(format!(
            "realtime database returned {}",
            status
        )))
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StorageError> {
        let response = self.http.get(self.url(path)).send().await?;
        let value: Value = Self::check(response).await?.json().await?;
        Ok(match value {
            Value::Null => None,
            v => Some(v),
        })
    }
}

/// A parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Parses one event block (the text between blank lines).
pub fn parse_sse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.trim_start());
        }
    }
    event.map(|event| SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Splits the first complete event block off `buffer`.
///
/// Blocks end at a blank line (`\n\n` or `\r\n\r\n`). Bytes are only decoded
/// once the whole block has arrived, so characters split across chunks
/// survive.
pub fn take_event_block(buffer: &mut Vec<u8>) -> Option<String> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    let (end, separator) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    let block: Vec<u8> = buffer.drain(..end + separator).collect();
    Some(String::from_utf8_lossy(&block[..end]).into_owned())
}

/// How a listener task retries after its event stream drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connection attempts before the listener gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Why one connection of a listener task ended.
enum StreamEnd {
    /// The server closed the listener; reconnecting will not help.
    Revoked(String),
    /// The connection dropped. `opened` is set when it was established
    /// before dropping.
    Dropped { opened: bool, reason: String },
}

type TaskMap = Arc<Mutex<HashMap<ListenerHandle, JoinHandle<()>>>>;

/// Realtime Database REST client.
///
/// Listeners are long-lived `text/event-stream` requests, each driven by its
/// own tokio task. On every `put` or `patch` the task re-reads the watched
/// path and hands the full value to the callback. A dropped stream is
/// reopened per the [`ReconnectPolicy`]; when the server revokes the stream
/// or retries run out, the task unregisters itself and fires `on_closed`.
pub struct HttpRealtimeClient {
    endpoint: Endpoint,
    reconnect: ReconnectPolicy,
    next_handle: AtomicU64,
    tasks: TaskMap,
}

impl HttpRealtimeClient {
    pub fn new(base_url: &str, auth: Option<String>) -> Self {
        Self {
            endpoint: Endpoint {
                http: reqwest::Client::new(),
                base_url: base_url.trim_end_matches('/').to_string(),
                auth,
            },
            reconnect: ReconnectPolicy::default(),
            next_handle: AtomicU64::new(0),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    async fn run_listener(
        endpoint: Endpoint,
        path: String,
        handle: ListenerHandle,
        policy: ReconnectPolicy,
        callback: ValueCallback,
        on_closed: ClosedCallback,
        tasks: TaskMap,
    ) {
        let mut failures = 0u32;
        let reason = loop {
            match Self::stream_events(&endpoint, &path, &callback).await {
                StreamEnd::Revoked(reason) => break reason,
                StreamEnd::Dropped { opened, reason } => {
                    if opened {
                        failures = 0;
                    }
                    failures += 1;
                    if failures > policy.max_attempts {
                        break format!(
                            "gave up after {} attempt(s): {}",
                            policy.max_attempts, reason
                        );
                    }
                    let delay = policy.delay(failures);
                    warn!(
                        "Event stream on '{}' dropped ({}), reconnecting in {:?}",
                        path, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        warn!("Listener {:?} on '{}' closed: {}", handle, path, reason);
        on_closed(handle);
    }

    async fn stream_events(endpoint: &Endpoint, path: &str, callback: &ValueCallback) -> StreamEnd {
        let response = match endpoint
            .http
            .get(endpoint.url(path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let e = e.without_url();
                error!("Failed to open event stream on '{}': {}", path, e);
                return StreamEnd::Dropped {
                    opened: false,
                    reason: e.to_string(),
                };
            }
        };
        let response = match Endpoint::check(response).await {
            Ok(r) => r,
            Err(e) => {
                return StreamEnd::Dropped {
                    opened: false,
                    reason: e.to_string(),
                }
            }
        };
        debug!("Event stream on '{}' open", path);

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let e = e.without_url();
                    error!("Event stream on '{}' broke: {}", path, e);
                    return StreamEnd::Dropped {
                        opened: true,
                        reason: e.to_string(),
                    };
                }
            };
            buffer.extend_from_slice(&chunk);
            while let Some(block) = take_event_block(&mut buffer) {
                let Some(event) = parse_sse_event(&block) else { continue };
                match event.event.as_str() {
                    "put" | "patch" => match endpoint.get(path).await {
                        Ok(value) => callback(value),
                        Err(e) => error!("Failed to refresh '{}' after push: {}", path, e),
                    },
                    "keep-alive" => trace!("keep-alive on '{}'", path),
                    "cancel" | "auth_revoked" => {
                        warn!("Event stream on '{}' closed by server: {}", path, event.event);
                        return StreamEnd::Revoked(event.event.clone());
                    }
                    other => debug!("Ignoring event '{}' on '{}'", other, path),
                }
            }
        }
        info!("Event stream on '{}' ended", path);
        StreamEnd::Dropped {
            opened: true,
            reason: "stream ended".to_string(),
        }
    }
}

#[async_trait]
impl RealtimeClient for HttpRealtimeClient {
    async fn get(&self, path: &str) -> Result<Option<Value>, StorageError> {
        self.endpoint.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StorageError> {
        let response = self
            .endpoint
            .http
            .put(self.endpoint.url(path))
            .json(&value)
            .send()
            .await?;
        Endpoint::check(response).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let response = self
            .endpoint
            .http
            .delete(self.endpoint.url(path))
            .send()
            .await?;
        Endpoint::check(response).await?;
        Ok(())
    }

    async fn listen(
        &self,
        path: &str,
        callback: ValueCallback,
        on_closed: ClosedCallback,
    ) -> Result<ListenerHandle, StorageError> {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        // Held across spawn so a task that ends at once cannot remove its
        // handle before it is inserted.
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(Self::run_listener(
            self.endpoint.clone(),
            path.to_string(),
            handle,
            self.reconnect,
            callback,
            on_closed,
            Arc::clone(&self.tasks),
        ));
        tasks.insert(handle, task);
        drop(tasks);
        debug!("Listening on '{}' as {:?}", path, handle);
        Ok(handle)
    }

    async fn unlisten(&self, path: &str, handle: ListenerHandle) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        match task {
            Some(task) => {
                task.abort();
                debug!("Stopped listening on '{}' ({:?})", path, handle);
            }
            None => warn!("No listener {:?} registered at '{}'", handle, path),
        }
    }

    fn active_listeners(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for HttpRealtimeClient {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}
