//! The engine: owns every session and all transport plumbing.
//!
//! One engine holds the `session-id → Session` registry, binds one TCP
//! listener per acceptor port, dials and re-dials initiators, and drives
//! the 1-second keepalive/end-of-day tick over all sessions.
//!
//! Several acceptor sessions may share a listening port. An accepted
//! connection is parked until its first Logon frame arrives; the Logon's
//! CompIDs (inverted) select the owning session and the parked bytes are
//! replayed into it. When nothing matches and exactly one session is
//! configured on the port, that session gets the connection; otherwise it
//! is closed.

use crate::config::{ConfigError, SessionConfig, SessionRole};
use crate::fix::session::Session;
use crate::fix::store::{LogStore, StoreError};
use crate::net::{drive_connection, NetworkHandler};
use chrono::{DateTime, NaiveTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("An I/O error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine is already started")]
    AlreadyStarted,
    #[error("a session named `{0}` already exists")]
    DuplicateSession(String),
    #[error("no session named `{0}`")]
    UnknownSession(String),
    #[error("session `{0}` is not an initiator")]
    NotAnInitiator(String),
}

pub struct Engine {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    bound: Mutex<HashMap<u16, SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        let (shutdown, _) = watch::channel(false);
        Engine {
            sessions: Mutex::new(HashMap::new()),
            bound: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Registers a session, picking a log store from its config: the
    /// sqlite store when `persistence-path` is set (and the feature is
    /// on), an in-memory store otherwise. `log-messages = false` gets no
    /// store at all.
    pub fn add_session(&self, config: SessionConfig) -> Result<Arc<Session>, EngineError> {
        let store: Option<Arc<dyn LogStore>> = if !config.log_messages {
            None
        } else {
            match &config.persistence_path {
                #[cfg(feature = "sqlite")]
                Some(path) => Some(Arc::new(crate::fix::sqlite_store::SqliteLogStore::open(
                    path,
                )?)),
                #[cfg(not(feature = "sqlite"))]
                Some(_) => Some(Arc::new(crate::fix::store::MemoryLogStore::new())),
                None => Some(Arc::new(crate::fix::store::MemoryLogStore::new())),
            }
        };
        self.add_session_with_store(config, store)
    }

    pub fn add_session_with_store(
        &self,
        config: SessionConfig,
        store: Option<Arc<dyn LogStore>>,
    ) -> Result<Arc<Session>, EngineError> {
        let session = Session::new(config, store)?;
        let key = session.id().to_string();
        let mut sessions = self.sessions.lock().expect("registry lock");
        if sessions.contains_key(&key) {
            return Err(EngineError::DuplicateSession(key));
        }
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock")
            .get(session_id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    /// The address a configured acceptor port actually bound to.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.bound.lock().expect("bound lock").get(&port).copied()
    }

    /// Binds acceptor ports, starts initiator dial loops and the
    /// keepalive tick.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }
        let sessions = self.sessions();
        info!(count = sessions.len(), "engine starting");

        let mut acceptor_ports: HashMap<u16, Vec<Arc<Session>>> = HashMap::new();
        for session in &sessions {
            let config = session.config();
            match config.role {
                SessionRole::Acceptor => acceptor_ports
                    .entry(config.port)
                    .or_default()
                    .push(Arc::clone(session)),
                SessionRole::Initiator => {
                    let task = tokio::spawn(initiator_loop(
                        Arc::clone(session),
                        self.shutdown.subscribe(),
                    ));
                    self.tasks.lock().expect("task lock").push(task);
                }
            }
        }

        for (port, group) in acceptor_ports {
            let host = group[0]
                .config()
                .host
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let listener = TcpListener::bind((host.as_str(), port)).await?;
            let addr = listener.local_addr()?;
            info!(%addr, sessions = group.len(), "accepting");
            self.bound.lock().expect("bound lock").insert(port, addr);
            let task = tokio::spawn(accept_loop(listener, group, self.shutdown.subscribe()));
            self.tasks.lock().expect("task lock").push(task);
        }

        let tick = tokio::spawn(tick_loop(Arc::clone(self), self.shutdown.subscribe()));
        self.tasks.lock().expect("task lock").push(tick);
        Ok(())
    }

    /// Dials an initiator session once, outside its automatic loop.
    pub async fn connect(self: &Arc<Self>, session_id: &str) -> Result<(), EngineError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        let config = session.config().clone();
        if config.role != SessionRole::Initiator {
            return Err(EngineError::NotAnInitiator(session_id.to_string()));
        }
        if !session.connect_requested() {
            debug!(session = %session.id(), "connect ignored, session already active");
            return Ok(());
        }
        let host = config.host.clone().unwrap_or_default();
        match TcpStream::connect((host.as_str(), config.port)).await {
            Ok(stream) => {
                let handler: Arc<dyn NetworkHandler> = session;
                tokio::spawn(drive_connection(stream, handler, Vec::new()));
                Ok(())
            }
            Err(e) => {
                session.on_connect_failed(&format!("{host}:{}", config.port), &e);
                Err(e.into())
            }
        }
    }

    /// Gracefully ends every session and stops all engine tasks.
    pub async fn stop(&self) {
        info!("engine stopping");
        let _ = self.shutdown.send(true);
        for session in self.sessions() {
            if session.is_logged_on() {
                let _ = session.logout(None);
            }
            session.disconnect();
        }
        // connection tasks exit on their own once channels close; the
        // accept/dial/tick loops watch the shutdown signal
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().expect("task lock").drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
        }
        self.started.store(false, Ordering::Release);
    }
}

async fn accept_loop(
    listener: TcpListener,
    group: Vec<Arc<Session>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted, awaiting logon");
                    tokio::spawn(route_incoming(stream, group.clone()));
                }
                Err(e) => {
                    for session in &group {
                        session.on_accept_failed(&e);
                    }
                }
            }
        }
    }
}

/// Parks an accepted connection until its first Logon identifies the
/// session, then replays the buffered bytes into it.
async fn route_incoming(mut stream: TcpStream, group: Vec<Arc<Session>>) {
    const PENDING_LIMIT: usize = 64 * 1024;
    const PENDING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    let mut buffered = Vec::new();
    let identified = tokio::time::timeout(PENDING_TIMEOUT, async {
        let mut chunk = [0u8; 4096];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut stream, &mut chunk)
                .await
                .ok()?;
            if n == 0 {
                return None;
            }
            buffered.extend_from_slice(&chunk[..n]);
            if let Some(ids) = peek_logon_comp_ids(&buffered) {
                return Some(ids);
            }
            if buffered.len() > PENDING_LIMIT {
                return None;
            }
        }
    })
    .await;

    let session = match identified {
        Ok(Some((their_sender, their_target))) => group
            .iter()
            .find(|s| {
                s.config().sender_comp_id == their_target
                    && s.config().target_comp_id == their_sender
            })
            .cloned()
            .or_else(|| {
                // lone session on the port takes unmatched connections
                (group.len() == 1).then(|| Arc::clone(&group[0]))
            }),
        // no parseable Logon arrived: drop the connection
        _ => None,
    };

    match session {
        Some(session) => {
            debug!(session = %session.id(), "connection routed");
            session.connect_requested();
            let handler: Arc<dyn NetworkHandler> = session;
            drive_connection(stream, handler, buffered).await;
        }
        None => {
            warn!("no session matched the pending connection, closing");
        }
    }
}

/// Extracts (SenderCompID, TargetCompID) from a buffered Logon prefix.
/// Only complete SOH-terminated fields are considered; returns None until
/// a Logon's 49 and 56 have both arrived.
fn peek_logon_comp_ids(buf: &[u8]) -> Option<(String, String)> {
    let complete_len = buf.iter().rposition(|b| *b == 1).map(|p| p + 1)?;
    let mut msg_type: Option<&[u8]> = None;
    let mut sender: Option<&[u8]> = None;
    let mut target: Option<&[u8]> = None;
    for part in buf[..complete_len].split(|b| *b == 1) {
        let Some(eq) = part.iter().position(|b| *b == b'=') else {
            continue;
        };
        match &part[..eq] {
            b"35" => msg_type = Some(&part[eq + 1..]),
            b"49" => sender = Some(&part[eq + 1..]),
            b"56" => target = Some(&part[eq + 1..]),
            _ => {}
        }
        if msg_type.is_some() && sender.is_some() && target.is_some() {
            break;
        }
    }
    if msg_type != Some(b"A") {
        return None;
    }
    match (sender, target) {
        (Some(s), Some(t)) => Some((
            String::from_utf8_lossy(s).into_owned(),
            String::from_utf8_lossy(t).into_owned(),
        )),
        _ => None,
    }
}

async fn initiator_loop(session: Arc<Session>, mut shutdown: watch::Receiver<bool>) {
    let config = session.config().clone();
    let host = config.host.clone().unwrap_or_default();
    let remote = format!("{host}:{}", config.port);
    let retry = std::time::Duration::from_secs(config.reconnect_interval.max(1));
    let mut failures: i64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if !schedule_allows(&config, config.clock.now()) {
            if sleep_or_shutdown(std::time::Duration::from_secs(1), &mut shutdown).await {
                break;
            }
            continue;
        }
        if session.connect_requested() {
            match TcpStream::connect((host.as_str(), config.port)).await {
                Ok(stream) => {
                    failures = 0;
                    let handler: Arc<dyn NetworkHandler> = session.clone() as Arc<dyn NetworkHandler>;
                    drive_connection(stream, handler, Vec::new()).await;
                }
                Err(e) => {
                    session.on_connect_failed(&remote, &e);
                    failures += 1;
                    if config.max_reconnect_attempts >= 0
                        && failures > config.max_reconnect_attempts as i64
                    {
                        warn!(session = %session.id(), failures, "reconnect attempts exhausted");
                        break;
                    }
                }
            }
        }
        if sleep_or_shutdown(retry, &mut shutdown).await {
            break;
        }
    }
}

/// Sleeps for `dur`; returns true when shutdown fired instead.
async fn sleep_or_shutdown(
    dur: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = shutdown.changed() => true,
    }
}

/// True when the session's start/end window (if any) contains `now`.
fn schedule_allows(config: &SessionConfig, now: DateTime<Utc>) -> bool {
    let Ok(offset) = config.utc_offset() else {
        return true;
    };
    let local = now.with_timezone(&offset).time();
    match (config.start_time, config.end_time) {
        (None, None) => true,
        (Some(start), None) => local >= start,
        (None, Some(end)) => local < end,
        (Some(start), Some(end)) if start <= end => local >= start && local < end,
        // window wraps midnight
        (Some(start), Some(end)) => local >= start || local < end,
    }
}

/// True when `eod` falls in the half-open interval (prev, now].
fn eod_crossed(prev: DateTime<Utc>, now: DateTime<Utc>, eod: NaiveTime, config: &SessionConfig) -> bool {
    let Ok(offset) = config.utc_offset() else {
        return false;
    };
    let prev_local = prev.with_timezone(&offset);
    let now_local = now.with_timezone(&offset);
    if prev_local.date_naive() != now_local.date_naive() {
        return now_local.time() >= eod || prev_local.time() < eod;
    }
    prev_local.time() < eod && now_local.time() >= eod
}

async fn tick_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut prev_times: HashMap<String, DateTime<Utc>> = HashMap::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        for session in engine.sessions() {
            session.keepalive_tick();
            let config = session.config();
            let now = config.clock.now();
            let key = session.id().to_string();
            let prev = prev_times.insert(key, now);
            if let (true, Some(eod), Some(prev)) =
                (config.reset_on_eod, config.eod_time, prev)
            {
                if eod_crossed(prev, now, eod, config) {
                    session.end_of_day();
                }
            }
        }
    }
}
