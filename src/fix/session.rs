//! The per-session protocol state machine.
//!
//! A [`Session`] owns its sequence counters, its two message pools and its
//! half of the bound channel, and implements the whole administrative
//! protocol: logon handshake, heartbeats and test requests, sequence
//! discipline with gap recovery, resend replay with gap-fill, reject
//! handling, logout and disconnect.
//!
//! Inbound processing is single-threaded: the network task feeds bytes
//! through [`NetworkHandler::on_data_received`] and every dispatch runs to
//! completion there. The outbound path may be entered from any thread and
//! serializes claim → serialize → enqueue under one mutex, so on-the-wire
//! byte order always equals MsgSeqNum order.

use crate::config::{BeginString, ConfigError, SessionConfig, SessionRole};
use crate::fix::decode::FrameReader;
use crate::fix::encode::{HeaderTemplate, IntBytes, MessageWriter};
use crate::fix::fields::{MsgType, SessionRejectReason, Tags, APPL_VER_ID_FIX50SP2};
use crate::fix::mem::{IncomingMessage, MsgBuf};
use crate::fix::pool::{InboundPool, OutboundPool, OutgoingMessage};
use crate::fix::store::{outbound_range, Direction, LogEntry, LogStore};
use crate::fix::{SessionError, SessionId};
use crate::net::{Channel, NetworkHandler};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// The session FSM.
///
/// `Created` is initial; `Disconnected` is terminal for one connection
/// cycle (a reconnect goes back through `Connecting`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Connecting = 1,
    Connected = 2,
    LogonSent = 3,
    LoggedOn = 4,
    Resending = 5,
    LogoutSent = 6,
    Disconnected = 7,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::LogonSent,
            4 => SessionState::LoggedOn,
            5 => SessionState::Resending,
            6 => SessionState::LogoutSent,
            _ => SessionState::Disconnected,
        }
    }
}

/// Observes FSM transitions. On disconnect, `cause` carries the reason.
///
/// Listener callbacks must not call back into sending or state-changing
/// APIs of the same session; panics are caught and logged.
pub trait StateListener: Send + Sync {
    fn state_changed(
        &self,
        id: &SessionId,
        old: SessionState,
        new: SessionState,
        cause: Option<&str>,
    );
}

/// Observes inbound messages. Universal listeners see every dispatched
/// message, admin included; application listeners see only application
/// messages.
pub trait MessageListener: Send + Sync {
    fn message_received(&self, id: &SessionId, msg: &IncomingMessage);
}

type Listeners<T> = RwLock<Arc<Vec<Arc<T>>>>;

struct InboundState {
    reader: FrameReader,
    /// Gap we have already asked the peer to fill: (first missing, highest seen).
    awaiting_resend: Option<(u32, u32)>,
    /// Set when a Logon carried (or config forced) a sequence reset; the
    /// post-dispatch advance then pins expected to 2.
    logon_seq_reset: bool,
}

enum Dispatched {
    Continue,
    Disconnect(Option<SessionError>),
}

pub struct Session {
    config: SessionConfig,
    id: SessionId,
    header: HeaderTemplate,
    state: AtomicU8,
    /// Next MsgSeqNum to assign to an outgoing message.
    outgoing_seq: AtomicU32,
    /// Next MsgSeqNum we expect from the peer.
    expected_incoming: AtomicU32,
    last_sent_millis: AtomicI64,
    last_received_millis: AtomicI64,
    pending_test_request: AtomicBool,
    test_request_gen: AtomicU32,
    inbound: Mutex<InboundState>,
    /// Serializes assign-seq → serialize → enqueue across sender threads.
    outbound: Mutex<()>,
    transition: Mutex<()>,
    channel: Mutex<Option<Channel>>,
    inbound_pool: InboundPool,
    outbound_pool: OutboundPool,
    store: Option<Arc<dyn LogStore>>,
    state_listeners: Listeners<dyn StateListener>,
    message_listeners: Listeners<dyn MessageListener>,
    app_listeners: Listeners<dyn MessageListener>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        store: Option<Arc<dyn LogStore>>,
    ) -> Result<Arc<Session>, ConfigError> {
        config.validate()?;
        let id = config.session_id();
        let header = HeaderTemplate::new(&config.sender_comp_id, &config.target_comp_id);
        let reader = FrameReader::new(
            config.begin_string.as_str(),
            config.max_message_length,
            config.max_tag_number,
        );
        let pool_size = config.message_pool_size;
        let inbound_pool = InboundPool::new(pool_size, config.max_message_length, 64);
        let outbound_pool = OutboundPool::new(pool_size, 512);
        Ok(Arc::new(Session {
            id,
            header,
            state: AtomicU8::new(SessionState::Created as u8),
            outgoing_seq: AtomicU32::new(1),
            expected_incoming: AtomicU32::new(1),
            last_sent_millis: AtomicI64::new(0),
            last_received_millis: AtomicI64::new(0),
            pending_test_request: AtomicBool::new(false),
            test_request_gen: AtomicU32::new(0),
            inbound: Mutex::new(InboundState {
                reader,
                awaiting_resend: None,
                logon_seq_reset: false,
            }),
            outbound: Mutex::new(()),
            transition: Mutex::new(()),
            channel: Mutex::new(None),
            inbound_pool,
            outbound_pool,
            store,
            state_listeners: RwLock::new(Arc::new(Vec::new())),
            message_listeners: RwLock::new(Arc::new(Vec::new())),
            app_listeners: RwLock::new(Arc::new(Vec::new())),
            config,
        }))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_logged_on(&self) -> bool {
        self.state() == SessionState::LoggedOn
    }

    pub fn can_send_app_message(&self) -> bool {
        self.is_logged_on()
    }

    /// Next outgoing MsgSeqNum.
    pub fn outgoing_seq(&self) -> u32 {
        self.outgoing_seq.load(Ordering::Acquire)
    }

    /// Next MsgSeqNum expected from the peer.
    pub fn expected_incoming(&self) -> u32 {
        self.expected_incoming.load(Ordering::Acquire)
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        push_listener(&self.state_listeners, listener);
    }

    /// Registers a universal listener observing every inbound message.
    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        push_listener(&self.message_listeners, listener);
    }

    /// Registers a listener observing application messages only.
    pub fn add_app_message_listener(&self, listener: Arc<dyn MessageListener>) {
        push_listener(&self.app_listeners, listener);
    }

    // ---- lifecycle -----------------------------------------------------

    /// Marks the session as dialing. Returns false unless the FSM was in
    /// `Created` or `Disconnected`.
    pub fn connect_requested(&self) -> bool {
        let _g = self.transition.lock().expect("transition lock");
        let current = self.state();
        if !matches!(
            current,
            SessionState::Created | SessionState::Disconnected
        ) {
            return false;
        }
        self.transition_locked(current, SessionState::Connecting, None);
        true
    }

    /// Sends Logout (when logged on) and tears the connection down.
    pub fn logout(&self, text: Option<&str>) -> Result<(), SessionError> {
        if !matches!(
            self.state(),
            SessionState::LoggedOn | SessionState::Resending
        ) {
            return Err(SessionError::NotLoggedOn(self.state()));
        }
        self.send_logout(text)?;
        self.transition_to(SessionState::LogoutSent, None);
        Ok(())
    }

    /// Immediately closes the channel and moves to `Disconnected`.
    pub fn disconnect(&self) {
        self.disconnect_with(None);
    }

    fn disconnect_with(&self, cause: Option<SessionError>) {
        {
            let _g = self.transition.lock().expect("transition lock");
            let old = self.state();
            if old == SessionState::Disconnected {
                return;
            }
            let cause_text = cause.as_ref().map(|e| e.to_string());
            self.transition_locked(old, SessionState::Disconnected, cause_text.as_deref());
        }
        let channel = self.channel.lock().expect("channel lock").take();
        if let Some(channel) = channel {
            channel.close();
        }
        self.pending_test_request.store(false, Ordering::Release);
        if self.config.reset_on_disconnect {
            self.reset_sequences();
        }
    }

    /// Resets both sequence counters to 1.
    pub fn reset_sequences(&self) {
        self.outgoing_seq.store(1, Ordering::Release);
        self.expected_incoming.store(1, Ordering::Release);
        info!(session = %self.id, "sequence numbers reset");
    }

    /// End-of-day: logs out when logged on, drops the connection, resets
    /// sequences.
    pub fn end_of_day(&self) {
        info!(session = %self.id, "end of day");
        if self.is_logged_on() {
            let _ = self.send_logout(Some("End of day"));
        }
        self.disconnect_with(None);
        self.reset_sequences();
    }

    // ---- keepalive -----------------------------------------------------

    /// Periodic keepalive check; drive at 1s granularity or finer.
    ///
    /// With `HB` the configured interval: past `HB` seconds without a send,
    /// emit a Heartbeat; past `1.5·HB` seconds without a receive, emit one
    /// TestRequest, and disconnect if a previous one is still unanswered.
    pub fn keepalive_tick(&self) {
        let hb = self.config.heartbeat_interval as i64;
        if hb == 0 || !self.is_logged_on() {
            return;
        }
        let now = self.config.clock.epoch_millis();
        if now - self.last_sent_millis.load(Ordering::Acquire) > hb * 1000 {
            if let Err(e) = self.send_heartbeat(None) {
                debug!(session = %self.id, error = %e, "heartbeat send failed");
            }
        }
        if now - self.last_received_millis.load(Ordering::Acquire) > hb * 1500 {
            if !self.pending_test_request.swap(true, Ordering::AcqRel) {
                let generation = self.test_request_gen.fetch_add(1, Ordering::AcqRel) + 1;
                if let Err(e) = self.send_test_request(generation) {
                    debug!(session = %self.id, error = %e, "test request send failed");
                }
            } else {
                warn!(session = %self.id, "peer silent past test request deadline");
                self.disconnect_with(Some(SessionError::TestRequestTimeout));
            }
        }
    }

    // ---- outbound application path ------------------------------------

    /// Claims a pooled outgoing message, or None when all slots are in
    /// flight (backpressure; retry after a pause or a commit).
    pub fn try_claim(&self, msg_type: char) -> Option<OutgoingMessage> {
        self.outbound_pool.try_claim(msg_type)
    }

    /// Assigns the next MsgSeqNum, serializes, records and enqueues the
    /// claimed message, then returns its sequence number.
    ///
    /// Refused outside `LoggedOn`. The slot is always released.
    pub fn commit(&self, msg: OutgoingMessage) -> Result<u32, SessionError> {
        if !self.is_logged_on() {
            let state = self.state();
            self.outbound_pool.release(msg);
            return Err(SessionError::NotLoggedOn(state));
        }
        let channel = match self.bound_channel() {
            Ok(c) => c,
            Err(e) => {
                self.outbound_pool.release(msg);
                return Err(e);
            }
        };

        let _guard = self.outbound.lock().expect("outbound lock");
        let seq = self.outgoing_seq.load(Ordering::Acquire);
        let frame = MessageWriter::begin(self.config.begin_string.as_str(), msg.msg_type())
            .push_raw(self.header.bytes())
            .push_int(Tags::MsgSeqNum, seq)
            .push_timestamp(Tags::SendingTime, self.config.clock.now())
            .push_raw(msg.body())
            .finish();
        let logged = self.log_raw(&frame);
        let msg_type = msg.msg_type();
        self.outbound_pool.release(msg);
        match channel.send(frame) {
            Ok(()) => {
                self.outgoing_seq.store(seq + 1, Ordering::Release);
                self.record_outbound(seq, msg_type, logged);
                self.touch_sent();
                Ok(seq)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases a claimed message without sending. No sequence number was
    /// reserved, so the next commit uses the number this claim would have.
    pub fn abort(&self, msg: OutgoingMessage) {
        self.outbound_pool.release(msg);
    }

    // ---- admin send paths ---------------------------------------------

    fn bound_channel(&self) -> Result<Channel, SessionError> {
        self.channel
            .lock()
            .expect("channel lock")
            .clone()
            .ok_or(SessionError::NoChannel)
    }

    fn log_raw(&self, frame: &MsgBuf) -> Option<Vec<u8>> {
        (self.config.log_messages && self.store.is_some()).then(|| frame.0.clone())
    }

    fn touch_sent(&self) {
        self.last_sent_millis
            .store(self.config.clock.epoch_millis(), Ordering::Release);
    }

    fn record_outbound(&self, seq: u32, msg_type: char, raw: Option<Vec<u8>>) {
        let (Some(store), Some(raw)) = (self.store.as_ref(), raw) else {
            return;
        };
        let entry = LogEntry::new(
            self.config.clock.epoch_millis(),
            seq,
            Direction::Outbound,
            &self.id,
            msg_type,
            raw,
        );
        if let Err(e) = store.write(entry) {
            warn!(session = %self.id, error = %e, "outbound log write failed");
        }
    }

    fn record_inbound(&self, seq: u32, msg_type: char, raw: &[u8]) {
        if !self.config.log_messages {
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let entry = LogEntry::new(
            self.config.clock.epoch_millis(),
            seq,
            Direction::Inbound,
            &self.id,
            msg_type,
            raw.to_vec(),
        );
        if let Err(e) = store.write(entry) {
            warn!(session = %self.id, error = %e, "inbound log write failed");
        }
    }

    /// Sends an admin message: assigns the next sequence number, stamps the
    /// standard header, appends `fields`, records and enqueues. Admin sends
    /// are legal outside `LoggedOn` (Logon is sent from `Connected`).
    fn send_admin(
        &self,
        msg_type: MsgType,
        fields: impl FnOnce(MessageWriter) -> MessageWriter,
    ) -> Result<u32, SessionError> {
        let channel = self.bound_channel()?;
        let _guard = self.outbound.lock().expect("outbound lock");
        let seq = self.outgoing_seq.load(Ordering::Acquire);
        let writer = MessageWriter::begin(self.config.begin_string.as_str(), msg_type.as_char())
            .push_raw(self.header.bytes())
            .push_int(Tags::MsgSeqNum, seq)
            .push_timestamp(Tags::SendingTime, self.config.clock.now());
        let frame = fields(writer).finish();
        let logged = self.log_raw(&frame);
        channel.send(frame)?;
        self.outgoing_seq.store(seq + 1, Ordering::Release);
        self.record_outbound(seq, msg_type.as_char(), logged);
        self.touch_sent();
        Ok(seq)
    }

    fn send_logon(&self, reset_seq_num: bool) -> Result<u32, SessionError> {
        let begin_string = self.config.begin_string;
        let heartbeat = self.config.heartbeat_interval;
        self.send_admin(MsgType::Logon, move |mut w| {
            w = w
                .push_int(Tags::EncryptMethod, 0)
                .push_int(Tags::HeartBtInt, heartbeat);
            if reset_seq_num {
                w = w.push_char(Tags::ResetSeqNumFlag, 'Y');
            }
            if begin_string == BeginString::Fixt11 {
                w = w.push(Tags::DefaultApplVerID, APPL_VER_ID_FIX50SP2);
            }
            w
        })
    }

    fn send_logout(&self, text: Option<&str>) -> Result<u32, SessionError> {
        self.send_admin(MsgType::Logout, |mut w| {
            if let Some(text) = text {
                w = w.push(Tags::Text, text.as_bytes());
            }
            w
        })
    }

    fn send_heartbeat(&self, test_req_id: Option<&[u8]>) -> Result<u32, SessionError> {
        self.send_admin(MsgType::Heartbeat, |mut w| {
            if let Some(id) = test_req_id {
                w = w.push(Tags::TestReqID, id);
            }
            w
        })
    }

    fn send_test_request(&self, generation: u32) -> Result<u32, SessionError> {
        self.send_admin(MsgType::TestRequest, |w| {
            w.push_int(Tags::TestReqID, generation)
        })
    }

    fn send_resend_request(&self, begin: u32, end: u32) -> Result<u32, SessionError> {
        self.send_admin(MsgType::ResendRequest, |w| {
            w.push_int(Tags::BeginSeqNo, begin).push_int(Tags::EndSeqNo, end)
        })
    }

    fn send_reject(
        &self,
        ref_seq: u32,
        reason: SessionRejectReason,
    ) -> Result<u32, SessionError> {
        self.send_admin(MsgType::Reject, move |w| {
            w.push_int(Tags::RefSeqNum, ref_seq)
                .push_int(Tags::SessionRejectReason, reason.code())
                .push(Tags::Text, reason.text().as_bytes())
        })
    }

    /// Sends a SequenceReset/GapFill carrying the supplied sequence number
    /// (the first number of the filled gap). Does not consume a sequence
    /// number and is never recorded: the covered range is already logged.
    fn send_gap_fill(&self, seq: u32, new_seq_no: u32) -> Result<(), SessionError> {
        let channel = self.bound_channel()?;
        let _guard = self.outbound.lock().expect("outbound lock");
        let frame = MessageWriter::begin(
            self.config.begin_string.as_str(),
            MsgType::SequenceReset.as_char(),
        )
        .push_raw(self.header.bytes())
        .push_int(Tags::MsgSeqNum, seq)
        .push_timestamp(Tags::SendingTime, self.config.clock.now())
        .push_char(Tags::PossDupFlag, 'Y')
        .push_char(Tags::GapFillFlag, 'Y')
        .push_int(Tags::NewSeqNo, new_seq_no)
        .finish();
        channel.send(frame)?;
        self.touch_sent();
        Ok(())
    }

    /// Replays a logged frame byte-for-byte.
    fn resend_raw(&self, entry: &LogEntry) -> Result<(), SessionError> {
        let channel = self.bound_channel()?;
        let _guard = self.outbound.lock().expect("outbound lock");
        channel.send(MsgBuf(entry.raw.clone()))?;
        self.touch_sent();
        Ok(())
    }

    // ---- inbound dispatch ---------------------------------------------

    fn dispatch(&self, inbound: &mut InboundState, view: &IncomingMessage) -> Dispatched {
        self.last_received_millis
            .store(self.config.clock.epoch_millis(), Ordering::Release);

        let Some(msg_type_char) = view.msg_type() else {
            return Dispatched::Disconnect(Some(SessionError::MissingMsgType));
        };
        let seq_opt = view.msg_seq_num();
        self.record_inbound(seq_opt.unwrap_or(0), msg_type_char, view.raw());

        // Our 49/56 must appear inverted on everything the peer sends.
        if view.get_bytes(Tags::SenderCompID) != Some(self.config.target_comp_id.as_bytes())
            || view.get_bytes(Tags::TargetCompID) != Some(self.config.sender_comp_id.as_bytes())
        {
            warn!(session = %self.id, "CompID mismatch on inbound message");
            let _ = self.send_reject(seq_opt.unwrap_or(0), SessionRejectReason::CompIdProblem);
            return Dispatched::Disconnect(Some(SessionError::CompIdMismatch));
        }

        let Some(seq) = seq_opt else {
            return Dispatched::Disconnect(Some(SessionError::MissingMsgSeqNum));
        };
        let msg_type = MsgType::from(msg_type_char);

        // Sequence guard; Logon and SequenceReset carry their own rules.
        if !matches!(msg_type, MsgType::Logon | MsgType::SequenceReset) {
            let expected = self.expected_incoming();
            if seq > expected {
                debug!(session = %self.id, seq, expected, "sequence gap");
                if inbound.awaiting_resend.is_none() {
                    let _ = self.send_resend_request(expected, 0);
                }
                let high = inbound
                    .awaiting_resend
                    .map_or(seq, |(_, h)| h.max(seq));
                inbound.awaiting_resend = Some((expected, high));
                return Dispatched::Continue;
            }
            if seq < expected && view.get_bool(Tags::PossDupFlag) != Some(true) {
                let _ = self.send_logout(Some(&format!(
                    "MsgSeqNum too low, expecting {expected} but received {seq}"
                )));
                return Dispatched::Disconnect(Some(SessionError::SequenceTooLow {
                    expected,
                    received: seq,
                }));
            }
            // seq < expected with PossDupFlag=Y is a resend: process it.
        }

        let mut advance = true;
        let mut logout = false;
        match msg_type {
            MsgType::Logon => self.handle_logon(inbound, view),
            MsgType::Logout => logout = self.handle_logout(),
            MsgType::Heartbeat => self.handle_heartbeat(view),
            MsgType::TestRequest => self.handle_test_request(view),
            MsgType::ResendRequest => self.handle_resend_request(view),
            MsgType::SequenceReset => {
                self.handle_sequence_reset(view);
                advance = false;
            }
            MsgType::Reject | MsgType::BusinessReject => {
                warn!(session = %self.id, seq, msg_type = %msg_type_char, "reject received");
            }
            MsgType::Application(_) => self.notify(&self.app_listeners, view),
        }

        self.notify(&self.message_listeners, view);

        if inbound.logon_seq_reset {
            self.expected_incoming.store(2, Ordering::Release);
            inbound.logon_seq_reset = false;
        } else if advance && seq >= self.expected_incoming() {
            self.expected_incoming.store(seq + 1, Ordering::Release);
        }
        if let Some((_, high)) = inbound.awaiting_resend {
            if self.expected_incoming() > high {
                inbound.awaiting_resend = None;
            }
        }

        if logout {
            if self.config.reset_on_logout {
                self.reset_sequences();
            }
            info!(session = %self.id, "logged out");
            return Dispatched::Disconnect(None);
        }
        Dispatched::Continue
    }

    fn handle_logon(&self, inbound: &mut InboundState, view: &IncomingMessage) {
        let reset_requested =
            view.get_bool(Tags::ResetSeqNumFlag) == Some(true) || self.config.reset_on_logon;
        if reset_requested {
            // The initiator has already spent seq 1 on its own Logon; the
            // acceptor spends 1 on the response it is about to send.
            let next_outgoing = match self.config.role {
                SessionRole::Initiator => 2,
                SessionRole::Acceptor => 1,
            };
            self.outgoing_seq.store(next_outgoing, Ordering::Release);
            self.expected_incoming.store(1, Ordering::Release);
            inbound.logon_seq_reset = true;
        }
        if self.config.role == SessionRole::Acceptor && self.state() == SessionState::Connected {
            if let Err(e) = self.send_logon(reset_requested) {
                warn!(session = %self.id, error = %e, "logon response failed");
            }
        }
        self.pending_test_request.store(false, Ordering::Release);
        info!(session = %self.id, reset = reset_requested, "logged on");
        self.transition_to(SessionState::LoggedOn, None);
    }

    /// Returns true when the session should disconnect after the logout
    /// bookkeeping of the dispatch epilogue.
    fn handle_logout(&self) -> bool {
        match self.state() {
            SessionState::LoggedOn | SessionState::Resending => {
                // Peer-initiated: acknowledge before dropping.
                if let Err(e) = self.send_logout(None) {
                    debug!(session = %self.id, error = %e, "logout ack failed");
                }
            }
            SessionState::LogoutSent => {
                debug!(session = %self.id, "logout acknowledged by peer");
            }
            state => {
                debug!(session = %self.id, ?state, "logout in unexpected state");
            }
        }
        true
    }

    fn handle_heartbeat(&self, view: &IncomingMessage) {
        if !self.pending_test_request.load(Ordering::Acquire) {
            return;
        }
        let outstanding = IntBytes::from(self.test_request_gen.load(Ordering::Acquire));
        if view.get_bytes(Tags::TestReqID) == Some(outstanding.as_bytes()) {
            self.pending_test_request.store(false, Ordering::Release);
        }
    }

    fn handle_test_request(&self, view: &IncomingMessage) {
        if let Some(id) = view.get_bytes(Tags::TestReqID) {
            let id = id.to_vec();
            if let Err(e) = self.send_heartbeat(Some(&id)) {
                debug!(session = %self.id, error = %e, "test request reply failed");
            }
        }
    }

    fn handle_resend_request(&self, view: &IncomingMessage) {
        let next_outgoing = self.outgoing_seq();
        let begin = view.get_int(Tags::BeginSeqNo).unwrap_or(1);
        let end = match view.get_int(Tags::EndSeqNo) {
            // EndSeqNo=0 means "through the latest message sent".
            Some(0) | None => next_outgoing.saturating_sub(1),
            Some(n) => n,
        };
        info!(session = %self.id, begin, end, "resend requested");
        let return_state = self.state();
        self.transition_to(SessionState::Resending, None);
        self.replay_range(begin, end);
        self.transition_to(return_state, None);
    }

    /// Replays OUTBOUND log entries in `[begin, end]`: application
    /// messages go out verbatim, runs of admin messages collapse into
    /// gap-fills, and a terminal gap-fill covers any trailing admin run.
    fn replay_range(&self, begin: u32, end: u32) {
        let entries = match (self.config.log_messages, self.store.as_ref()) {
            (true, Some(store)) => match outbound_range(&**store, &self.id.to_string(), begin, end)
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(session = %self.id, error = %e, "log replay failed");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        if entries.is_empty() {
            // Nothing to replay: fill the whole requested range.
            if let Err(e) = self.send_gap_fill(begin, end + 1) {
                debug!(session = %self.id, error = %e, "gap fill failed");
            }
            return;
        }

        let mut admin_run: u32 = 0;
        for entry in &entries {
            if MsgType::from(entry.msg_type).is_admin() {
                admin_run += 1;
                continue;
            }
            if admin_run > 0 {
                let _ = self.send_gap_fill(entry.seq_num - admin_run, entry.seq_num);
                admin_run = 0;
            }
            if let Err(e) = self.resend_raw(entry) {
                debug!(session = %self.id, error = %e, "resend failed");
                return;
            }
        }
        if admin_run > 0 {
            let last = entries[entries.len() - 1].seq_num;
            let _ = self.send_gap_fill(last - admin_run + 1, last + 1);
        }
    }

    fn handle_sequence_reset(&self, view: &IncomingMessage) {
        let Some(new_seq_no) = view.get_int(Tags::NewSeqNo) else {
            warn!(session = %self.id, "SequenceReset without NewSeqNo ignored");
            return;
        };
        let expected = self.expected_incoming();
        let gap_fill = view.get_bool(Tags::GapFillFlag) == Some(true);
        if gap_fill && new_seq_no < expected {
            warn!(
                session = %self.id,
                new_seq_no, expected, "gap fill NewSeqNo below expected, keeping"
            );
            return;
        }
        self.expected_incoming.store(new_seq_no, Ordering::Release);
        debug!(session = %self.id, new_seq_no, gap_fill, "incoming sequence set");
    }

    // ---- listeners and transitions ------------------------------------

    fn notify(&self, listeners: &Listeners<dyn MessageListener>, view: &IncomingMessage) {
        let current = listeners.read().expect("listener lock").clone();
        for listener in current.iter() {
            let guarded = AssertUnwindSafe(|| listener.message_received(&self.id, view));
            if catch_unwind(guarded).is_err() {
                error!(session = %self.id, "message listener panicked");
            }
        }
    }

    fn transition_to(&self, new: SessionState, cause: Option<&str>) {
        let _g = self.transition.lock().expect("transition lock");
        let old = self.state();
        self.transition_locked(old, new, cause);
    }

    fn transition_locked(&self, old: SessionState, new: SessionState, cause: Option<&str>) {
        if old == new {
            return;
        }
        self.state
            .compare_exchange(
                old as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok();
        debug!(session = %self.id, ?old, ?new, cause, "state transition");
        let listeners = self.state_listeners.read().expect("listener lock").clone();
        for listener in listeners.iter() {
            let guarded = AssertUnwindSafe(|| listener.state_changed(&self.id, old, new, cause));
            if catch_unwind(guarded).is_err() {
                error!(session = %self.id, "state listener panicked");
            }
        }
    }
}

fn push_listener<T: ?Sized>(list: &Listeners<T>, listener: Arc<T>) {
    let mut guard = list.write().expect("listener lock");
    let mut next = guard.as_ref().clone();
    next.push(listener);
    *guard = Arc::new(next);
}

impl NetworkHandler for Session {
    fn on_connected(&self, channel: Channel) {
        {
            let mut bound = self.channel.lock().expect("channel lock");
            if bound.is_some() {
                warn!(session = %self.id, "second channel refused");
                channel.close();
                return;
            }
            *bound = Some(channel);
        }
        {
            let mut inbound = self.inbound.lock().expect("inbound lock");
            inbound.reader.reset();
            inbound.awaiting_resend = None;
            inbound.logon_seq_reset = false;
        }
        let now = self.config.clock.epoch_millis();
        self.last_sent_millis.store(now, Ordering::Release);
        self.last_received_millis.store(now, Ordering::Release);
        self.pending_test_request.store(false, Ordering::Release);
        info!(session = %self.id, "channel opened");
        self.transition_to(SessionState::Connected, None);

        if self.config.role == SessionRole::Initiator {
            if self.config.reset_on_logon {
                self.reset_sequences();
            }
            match self.send_logon(self.config.reset_on_logon) {
                Ok(_) => self.transition_to(SessionState::LogonSent, None),
                Err(e) => self.disconnect_with(Some(e)),
            }
        }
    }

    fn on_data_received(&self, channel: &Channel, data: &[u8]) -> usize {
        {
            let bound = self.channel.lock().expect("channel lock");
            match bound.as_ref() {
                Some(c) if c.id() == channel.id() => {}
                // Bytes from a stale channel are swallowed.
                _ => return data.len(),
            }
        }
        let mut inbound = self.inbound.lock().expect("inbound lock");
        inbound.reader.extend(data);
        loop {
            let Some(mut view) = self.inbound_pool.try_acquire() else {
                break;
            };
            match inbound.reader.try_parse(&mut view) {
                Ok(true) => {
                    let outcome = self.dispatch(&mut inbound, &view);
                    self.inbound_pool.release(view);
                    if let Dispatched::Disconnect(cause) = outcome {
                        drop(inbound);
                        self.disconnect_with(cause);
                        return data.len();
                    }
                }
                Ok(false) => {
                    self.inbound_pool.release(view);
                    break;
                }
                Err(e) => {
                    self.inbound_pool.release(view);
                    warn!(session = %self.id, error = %e, "corrupt inbound frame");
                    drop(inbound);
                    self.disconnect_with(Some(e.into()));
                    return data.len();
                }
            }
        }
        data.len()
    }

    fn on_disconnected(&self, channel: &Channel, cause: Option<&SessionError>) {
        let ours = {
            let bound = self.channel.lock().expect("channel lock");
            matches!(bound.as_ref(), Some(c) if c.id() == channel.id())
        };
        if !ours {
            return;
        }
        info!(session = %self.id, ?cause, "channel lost");
        self.disconnect_with(cause.map(|c| {
            SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                c.to_string(),
            ))
        }));
    }

    fn on_connect_failed(&self, remote: &str, cause: &std::io::Error) {
        warn!(session = %self.id, remote, error = %cause, "connect failed");
        if self.state() == SessionState::Connecting {
            self.transition_to(SessionState::Disconnected, Some(&cause.to_string()));
        }
    }

    fn on_accept_failed(&self, cause: &std::io::Error) {
        warn!(session = %self.id, error = %cause, "accept failed");
    }

    fn num_bytes_to_read(&self, _channel: &Channel) -> usize {
        self.config.max_message_length
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::clock::test_support::ManualClock;
    use crate::fix::store::MemoryLogStore;
    use crate::net::test_support::{capturing_channel, CapturedFrames};
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from(std::time::UNIX_EPOCH)
    }

    fn config(role: SessionRole) -> crate::config::SessionConfigBuilder {
        let (sender, target) = match role {
            SessionRole::Initiator => ("CLIENT", "SERVER"),
            SessionRole::Acceptor => ("SERVER", "CLIENT"),
        };
        SessionConfig::builder()
            .with_session_name("test")
            .with_sender_comp_id(sender)
            .with_target_comp_id(target)
            .with_role(role)
            .with_host("127.0.0.1")
            .with_port(9880)
            .with_heartbeat_interval(30)
            .with_clock(Arc::new(ManualClock::default()))
    }

    /// A frame as the peer of an initiator session would send it.
    fn peer_frame(msg_type: char, seq: u32, extra: &[(u32, &[u8])]) -> MsgBuf {
        let mut w = MessageWriter::begin("FIX.4.4", msg_type)
            .push(Tags::SenderCompID, b"SERVER")
            .push(Tags::TargetCompID, b"CLIENT")
            .push_int(Tags::MsgSeqNum, seq)
            .push_timestamp(Tags::SendingTime, epoch());
        for (tag, value) in extra {
            w = w.push(*tag, value);
        }
        w.finish()
    }

    fn field(frame: &MsgBuf, tag: u32) -> Option<String> {
        let prefix = format!("{tag}=");
        frame
            .0
            .split(|b| *b == 1)
            .find(|part| part.starts_with(prefix.as_bytes()))
            .map(|part| String::from_utf8_lossy(&part[prefix.len()..]).into_owned())
    }

    fn logged_on_initiator(
        builder: crate::config::SessionConfigBuilder,
        store: Option<Arc<dyn LogStore>>,
    ) -> (Arc<Session>, Channel, CapturedFrames) {
        let session = Session::new(
            builder.with_reset_on_logon(true).build().unwrap(),
            store,
        )
        .unwrap();
        assert!(session.connect_requested());
        let (channel, mut frames) = capturing_channel();
        session.on_connected(channel.clone());
        session.on_data_received(
            &channel,
            peer_frame('A', 1, &[(98, b"0"), (108, b"30"), (141, b"Y")]).as_slice(),
        );
        assert!(session.is_logged_on());
        frames.drain(); // discard the handshake
        (session, channel, frames)
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: StdMutex<Vec<(char, u32)>>,
    }
    impl MessageListener for RecordingListener {
        fn message_received(&self, _id: &SessionId, msg: &IncomingMessage) {
            self.seen.lock().unwrap().push((
                msg.msg_type().unwrap_or('?'),
                msg.msg_seq_num().unwrap_or(0),
            ));
        }
    }

    #[derive(Default)]
    struct TransitionLog {
        seen: StdMutex<Vec<(SessionState, SessionState, Option<String>)>>,
    }
    impl StateListener for TransitionLog {
        fn state_changed(
            &self,
            _id: &SessionId,
            old: SessionState,
            new: SessionState,
            cause: Option<&str>,
        ) {
            self.seen
                .lock()
                .unwrap()
                .push((old, new, cause.map(str::to_string)));
        }
    }

    #[test]
    fn initiator_logon_handshake() {
        let session = Session::new(
            config(SessionRole::Initiator)
                .with_reset_on_logon(true)
                .build()
                .unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.connect_requested());
        let (channel, mut frames) = capturing_channel();
        session.on_connected(channel.clone());
        assert_eq!(session.state(), SessionState::LogonSent);

        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("A"));
        assert_eq!(field(&sent[0], 34).as_deref(), Some("1"));
        assert_eq!(field(&sent[0], 49).as_deref(), Some("CLIENT"));
        assert_eq!(field(&sent[0], 56).as_deref(), Some("SERVER"));
        assert_eq!(field(&sent[0], 98).as_deref(), Some("0"));
        assert_eq!(field(&sent[0], 108).as_deref(), Some("30"));
        assert_eq!(field(&sent[0], 141).as_deref(), Some("Y"));

        session.on_data_received(
            &channel,
            peer_frame('A', 1, &[(98, b"0"), (108, b"30"), (141, b"Y")]).as_slice(),
        );
        assert_eq!(session.state(), SessionState::LoggedOn);
        assert_eq!(session.outgoing_seq(), 2);
        assert_eq!(session.expected_incoming(), 2);
    }

    #[test]
    fn acceptor_responds_to_logon() {
        let session = Session::new(config(SessionRole::Acceptor).build().unwrap(), None).unwrap();
        assert!(session.connect_requested());
        let (channel, mut frames) = capturing_channel();
        session.on_connected(channel.clone());
        assert_eq!(session.state(), SessionState::Connected);
        assert!(frames.drain().is_empty());

        let logon = MessageWriter::begin("FIX.4.4", 'A')
            .push(Tags::SenderCompID, b"CLIENT")
            .push(Tags::TargetCompID, b"SERVER")
            .push_int(Tags::MsgSeqNum, 1)
            .push_timestamp(Tags::SendingTime, epoch())
            .push_int(Tags::EncryptMethod, 0)
            .push_int(Tags::HeartBtInt, 30)
            .push_char(Tags::ResetSeqNumFlag, 'Y')
            .finish();
        session.on_data_received(&channel, logon.as_slice());

        assert_eq!(session.state(), SessionState::LoggedOn);
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("A"));
        assert_eq!(field(&sent[0], 34).as_deref(), Some("1"));
        assert_eq!(field(&sent[0], 141).as_deref(), Some("Y"));
        assert_eq!(session.outgoing_seq(), 2);
        assert_eq!(session.expected_incoming(), 2);
    }

    #[test]
    fn seq_reset_on_logon_pins_expected_to_two() {
        let session = Session::new(config(SessionRole::Acceptor).build().unwrap(), None).unwrap();
        session.connect_requested();
        let (channel, _frames) = capturing_channel();
        session.on_connected(channel.clone());

        // Logon arriving with a wild sequence still lands expected on 2.
        let logon = MessageWriter::begin("FIX.4.4", 'A')
            .push(Tags::SenderCompID, b"CLIENT")
            .push(Tags::TargetCompID, b"SERVER")
            .push_int(Tags::MsgSeqNum, 7)
            .push_timestamp(Tags::SendingTime, epoch())
            .push_int(Tags::EncryptMethod, 0)
            .push_int(Tags::HeartBtInt, 30)
            .push_char(Tags::ResetSeqNumFlag, 'Y')
            .finish();
        session.on_data_received(&channel, logon.as_slice());
        assert!(session.is_logged_on());
        assert_eq!(session.expected_incoming(), 2);
    }

    #[test]
    fn test_request_is_echoed_in_heartbeat() {
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        session.on_data_received(
            &channel,
            peer_frame('1', 2, &[(112, b"ping-7")]).as_slice(),
        );
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("0"));
        assert_eq!(field(&sent[0], 112).as_deref(), Some("ping-7"));
        assert_eq!(session.expected_incoming(), 3);
    }

    #[test]
    fn gap_triggers_resend_request_and_holds_expected() {
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        let listener = Arc::new(RecordingListener::default());
        session.add_app_message_listener(listener.clone());

        // expected is 2; an application message with seq 5 is a gap
        session.on_data_received(&channel, peer_frame('8', 5, &[(58, b"fill")]).as_slice());
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("2"));
        assert_eq!(field(&sent[0], 7).as_deref(), Some("2"));
        assert_eq!(field(&sent[0], 16).as_deref(), Some("0"));
        assert_eq!(session.expected_incoming(), 2);
        assert!(listener.seen.lock().unwrap().is_empty());

        // a further high message does not spam another request
        session.on_data_received(&channel, peer_frame('8', 6, &[]).as_slice());
        assert!(frames.drain().is_empty());
        assert_eq!(session.expected_incoming(), 2);
    }

    #[test]
    fn sequence_too_low_disconnects() {
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        let transitions = Arc::new(TransitionLog::default());
        session.add_state_listener(transitions.clone());

        // drive expected up to 3
        session.on_data_received(&channel, peer_frame('0', 2, &[]).as_slice());
        assert_eq!(session.expected_incoming(), 3);
        frames.drain();

        session.on_data_received(&channel, peer_frame('8', 1, &[]).as_slice());
        assert_eq!(session.state(), SessionState::Disconnected);
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("5"));
        assert!(field(&sent[0], 58).unwrap().contains("too low"));

        let seen = transitions.seen.lock().unwrap();
        let (_, last, cause) = seen.last().unwrap();
        assert_eq!(*last, SessionState::Disconnected);
        assert!(cause.as_deref().unwrap().contains("Sequence number too low"));
    }

    #[test]
    fn poss_dup_below_expected_is_processed() {
        let (session, channel, _frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        let listener = Arc::new(RecordingListener::default());
        session.add_app_message_listener(listener.clone());

        session.on_data_received(&channel, peer_frame('0', 2, &[]).as_slice());
        session.on_data_received(&channel, peer_frame('0', 3, &[]).as_slice());
        assert_eq!(session.expected_incoming(), 4);

        session.on_data_received(
            &channel,
            peer_frame('8', 2, &[(43, b"Y"), (122, b"19700101-00:00:00.000")]).as_slice(),
        );
        assert!(session.is_logged_on());
        assert_eq!(listener.seen.lock().unwrap().as_slice(), &[('8', 2)]);
        // a resent old message never rewinds expected
        assert_eq!(session.expected_incoming(), 4);
    }

    #[test]
    fn resend_request_replays_app_and_gap_fills_admin() {
        let store = Arc::new(MemoryLogStore::new());
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), Some(store.clone()));

        let id = session.id().clone();
        let raw_order = b"RAW-ORDER-SEQ-4".to_vec();
        for (seq, msg_type, raw) in [
            (3u32, '0', b"HB-3".to_vec()),
            (4, 'D', raw_order.clone()),
            (5, '0', b"HB-5".to_vec()),
        ] {
            store
                .write(LogEntry::new(0, seq, Direction::Outbound, &id, msg_type, raw))
                .unwrap();
        }

        let outgoing_before = session.outgoing_seq();
        session.on_data_received(
            &channel,
            peer_frame('2', 2, &[(7, b"3"), (16, b"5")]).as_slice(),
        );

        let sent = frames.drain();
        assert_eq!(sent.len(), 3);
        // leading admin run collapses into a gap fill over seq 3
        assert_eq!(field(&sent[0], 35).as_deref(), Some("4"));
        assert_eq!(field(&sent[0], 34).as_deref(), Some("3"));
        assert_eq!(field(&sent[0], 36).as_deref(), Some("4"));
        assert_eq!(field(&sent[0], 123).as_deref(), Some("Y"));
        assert_eq!(field(&sent[0], 43).as_deref(), Some("Y"));
        // the application message is replayed byte-for-byte
        assert_eq!(&sent[1].0, &raw_order);
        // trailing admin run: gap fill seq 5, NewSeqNo 6
        assert_eq!(field(&sent[2], 35).as_deref(), Some("4"));
        assert_eq!(field(&sent[2], 34).as_deref(), Some("5"));
        assert_eq!(field(&sent[2], 36).as_deref(), Some("6"));

        assert_eq!(session.outgoing_seq(), outgoing_before);
        assert_eq!(session.state(), SessionState::LoggedOn);
    }

    #[test]
    fn resend_without_store_gap_fills_whole_range() {
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        session.on_data_received(
            &channel,
            peer_frame('2', 2, &[(7, b"1"), (16, b"0")]).as_slice(),
        );
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("4"));
        assert_eq!(field(&sent[0], 34).as_deref(), Some("1"));
        // EndSeqNo 0 resolves to outgoing-1 = 1, so the fill lands on 2
        assert_eq!(field(&sent[0], 36).as_deref(), Some("2"));
        assert_eq!(session.state(), SessionState::LoggedOn);
    }

    #[test]
    fn sequence_reset_moves_expected() {
        let (session, channel, _frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);

        // gap fill forward
        session.on_data_received(
            &channel,
            peer_frame('4', 2, &[(123, b"Y"), (36, b"10")]).as_slice(),
        );
        assert_eq!(session.expected_incoming(), 10);

        // gap fill backwards is refused
        session.on_data_received(
            &channel,
            peer_frame('4', 10, &[(123, b"Y"), (36, b"5")]).as_slice(),
        );
        assert_eq!(session.expected_incoming(), 10);

        // hard reset applies unconditionally
        session.on_data_received(&channel, peer_frame('4', 99, &[(36, b"3")]).as_slice());
        assert_eq!(session.expected_incoming(), 3);
        assert!(session.is_logged_on());
    }

    #[test]
    fn logout_is_acknowledged_and_resets_when_configured() {
        let (session, channel, mut frames) = logged_on_initiator(
            config(SessionRole::Initiator).with_reset_on_logout(true),
            None,
        );
        session.on_data_received(&channel, peer_frame('5', 2, &[(58, b"bye")]).as_slice());

        assert_eq!(session.state(), SessionState::Disconnected);
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("5"));
        assert_eq!(session.outgoing_seq(), 1);
        assert_eq!(session.expected_incoming(), 1);
    }

    #[test]
    fn local_logout_completes_on_ack() {
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        session.logout(Some("bye")).unwrap();
        assert_eq!(session.state(), SessionState::LogoutSent);
        let sent = frames.drain();
        assert_eq!(field(&sent[0], 35).as_deref(), Some("5"));
        assert_eq!(field(&sent[0], 58).as_deref(), Some("bye"));

        session.on_data_received(&channel, peer_frame('5', 2, &[]).as_slice());
        assert_eq!(session.state(), SessionState::Disconnected);
        // no second Logout goes out for the ack
        assert!(frames.drain().is_empty());
    }

    #[test]
    fn commit_assigns_contiguous_sequences_and_abort_rolls_back() {
        let (session, _channel, mut frames) = logged_on_initiator(
            config(SessionRole::Initiator).with_message_pool_size(4),
            None,
        );

        let mut a = session.try_claim('D').unwrap();
        a.push_str(11u32, "order-a");
        let b = session.try_claim('D').unwrap();
        let c = session.try_claim('D').unwrap();
        let d = session.try_claim('D').unwrap();
        assert!(session.try_claim('D').is_none(), "pool exhausted");

        assert_eq!(session.commit(a).unwrap(), 2);
        // a freed slot is claimable again
        let e = session.try_claim('D').unwrap();
        session.abort(e);
        session.abort(b);
        // the aborted claims never consumed a sequence number
        assert_eq!(session.commit(c).unwrap(), 3);
        assert_eq!(session.commit(d).unwrap(), 4);

        let seqs: Vec<String> = frames
            .drain()
            .iter()
            .map(|f| field(f, 34).unwrap())
            .collect();
        assert_eq!(seqs, vec!["2", "3", "4"]);
    }

    #[test]
    fn commit_is_refused_when_not_logged_on() {
        let session = Session::new(
            config(SessionRole::Initiator)
                .with_message_pool_size(2)
                .build()
                .unwrap(),
            None,
        )
        .unwrap();
        let msg = session.try_claim('D').unwrap();
        assert!(matches!(
            session.commit(msg),
            Err(SessionError::NotLoggedOn(SessionState::Created))
        ));
        // the slot came back
        let again = session.try_claim('D').unwrap();
        session.abort(again);
    }

    #[test]
    fn keepalive_heartbeats_then_test_request_then_disconnect() {
        let clock = Arc::new(ManualClock::default());
        clock.set_millis(1_000_000);
        let (session, _channel, mut frames) = logged_on_initiator(
            config(SessionRole::Initiator).with_clock(clock.clone()),
            None,
        );

        clock.advance_millis(31_000);
        session.keepalive_tick();
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("0"));
        assert_eq!(field(&sent[0], 112), None);

        // 46s since anything was received: one test request goes out
        clock.advance_millis(15_000);
        session.keepalive_tick();
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("1"));
        assert_eq!(field(&sent[0], 112).as_deref(), Some("1"));
        assert!(session.is_logged_on());

        // still silent: the pending test request expires the session
        clock.advance_millis(2_000);
        session.keepalive_tick();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn matching_heartbeat_clears_pending_test_request() {
        let clock = Arc::new(ManualClock::default());
        clock.set_millis(1_000_000);
        let (session, channel, mut frames) = logged_on_initiator(
            config(SessionRole::Initiator).with_clock(clock.clone()),
            None,
        );
        clock.advance_millis(46_000);
        session.keepalive_tick();
        frames.drain();

        session.on_data_received(&channel, peer_frame('0', 2, &[(112, b"1")]).as_slice());
        // the reply also refreshes last-received, so the next tick is calm
        session.keepalive_tick();
        assert!(session.is_logged_on());
        assert!(frames.drain().is_empty());
    }

    #[test]
    fn heartbeat_disabled_when_interval_is_zero() {
        let clock = Arc::new(ManualClock::default());
        clock.set_millis(1_000_000);
        let (session, _channel, mut frames) = logged_on_initiator(
            config(SessionRole::Initiator)
                .with_heartbeat_interval(0)
                .with_clock(clock.clone()),
            None,
        );
        clock.advance_millis(3_600_000);
        session.keepalive_tick();
        assert!(session.is_logged_on());
        assert!(frames.drain().is_empty());
    }

    #[test]
    fn corrupt_checksum_disconnects_without_dispatch() {
        let (session, channel, _frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        let listener = Arc::new(RecordingListener::default());
        session.add_message_listener(listener.clone());

        let mut corrupted = peer_frame('0', 2, &[]).0;
        let n = corrupted.len();
        corrupted[n - 2] = b'0' + (corrupted[n - 2] - b'0' + 1) % 10;
        session.on_data_received(&channel, &corrupted);

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(listener.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn compid_mismatch_sends_reject_and_disconnects() {
        let (session, channel, mut frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        let imposter = MessageWriter::begin("FIX.4.4", '8')
            .push(Tags::SenderCompID, b"IMPOSTER")
            .push(Tags::TargetCompID, b"CLIENT")
            .push_int(Tags::MsgSeqNum, 2)
            .push_timestamp(Tags::SendingTime, epoch())
            .finish();
        session.on_data_received(&channel, imposter.as_slice());

        assert_eq!(session.state(), SessionState::Disconnected);
        let sent = frames.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(field(&sent[0], 35).as_deref(), Some("3"));
        assert_eq!(field(&sent[0], 45).as_deref(), Some("2"));
        assert_eq!(field(&sent[0], 373).as_deref(), Some("9"));
    }

    #[test]
    fn fsm_transitions_are_monotone() {
        let session = Session::new(
            config(SessionRole::Initiator)
                .with_reset_on_logon(true)
                .build()
                .unwrap(),
            None,
        )
        .unwrap();
        let transitions = Arc::new(TransitionLog::default());
        session.add_state_listener(transitions.clone());

        session.connect_requested();
        let (channel, _frames) = capturing_channel();
        session.on_connected(channel.clone());
        session.on_data_received(
            &channel,
            peer_frame('A', 1, &[(98, b"0"), (108, b"30"), (141, b"Y")]).as_slice(),
        );
        session.logout(None).unwrap();
        session.on_data_received(&channel, peer_frame('5', 2, &[]).as_slice());

        let seen: Vec<(SessionState, SessionState)> = transitions
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(old, new, _)| (*old, *new))
            .collect();
        assert_eq!(
            seen,
            vec![
                (SessionState::Created, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Connected),
                (SessionState::Connected, SessionState::LogonSent),
                (SessionState::LogonSent, SessionState::LoggedOn),
                (SessionState::LoggedOn, SessionState::LogoutSent),
                (SessionState::LogoutSent, SessionState::Disconnected),
            ]
        );
    }

    #[test]
    fn listener_panic_does_not_poison_dispatch() {
        struct Panicker;
        impl MessageListener for Panicker {
            fn message_received(&self, _id: &SessionId, _msg: &IncomingMessage) {
                panic!("listener bug");
            }
        }
        let (session, channel, _frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        session.add_message_listener(Arc::new(Panicker));
        session.on_data_received(&channel, peer_frame('0', 2, &[]).as_slice());
        assert!(session.is_logged_on());
        assert_eq!(session.expected_incoming(), 3);
    }

    #[test]
    fn universal_listener_sees_admin_and_app_messages() {
        let (session, channel, _frames) =
            logged_on_initiator(config(SessionRole::Initiator), None);
        let universal = Arc::new(RecordingListener::default());
        let app_only = Arc::new(RecordingListener::default());
        session.add_message_listener(universal.clone());
        session.add_app_message_listener(app_only.clone());

        session.on_data_received(&channel, peer_frame('0', 2, &[]).as_slice());
        session.on_data_received(&channel, peer_frame('8', 3, &[]).as_slice());

        assert_eq!(
            universal.seen.lock().unwrap().as_slice(),
            &[('0', 2), ('8', 3)]
        );
        assert_eq!(app_only.seen.lock().unwrap().as_slice(), &[('8', 3)]);
    }

    #[test]
    fn outbound_messages_are_logged_for_resend() {
        let store = Arc::new(MemoryLogStore::new());
        let (session, _channel, _frames) = logged_on_initiator(
            config(SessionRole::Initiator),
            Some(store.clone() as Arc<dyn LogStore>),
        );
        let mut order = session.try_claim('D').unwrap();
        order.push_str(11u32, "oid-1");
        session.commit(order).unwrap();

        // logon + the order
        assert_eq!(store.len("CLIENT->SERVER"), 3); // logon out, logon in, order
        let entries = outbound_range(&*store, "CLIENT->SERVER", 1, 10).unwrap();
        let kinds: Vec<(u32, char)> = entries.iter().map(|e| (e.seq_num, e.msg_type)).collect();
        assert_eq!(kinds, vec![(1, 'A'), (2, 'D')]);
    }

    #[test]
    fn log_messages_off_skips_the_store() {
        let store = Arc::new(MemoryLogStore::new());
        let (session, channel, _frames) = logged_on_initiator(
            config(SessionRole::Initiator).with_log_messages(false),
            Some(store.clone() as Arc<dyn LogStore>),
        );
        session.on_data_received(&channel, peer_frame('0', 2, &[]).as_slice());
        assert!(session.is_logged_on());
        assert!(store.is_empty("CLIENT->SERVER"));
    }
}
