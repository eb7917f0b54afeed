//! One peer session
//!
//! A [`Connection`] owns the command queue of one socket, the value table
//! mirrored from the peer, the peer's state words and its device client.
//! It does not own the socket: bytes are moved by reader/writer tasks and
//! outbound frames go through an unbounded channel. Everything that needs
//! the rest of the registry (line dispatch, broadcasts, hooks) lives on
//! [`crate::Block`], which addresses connections by [`ConnId`].

pub mod data;
pub mod values;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use observa_protocol::messages::{command_end, Message, PROTO_PROGRESS, PROTO_TECHNICAL};
use observa_protocol::status::{BOP_MASK, DEVICE_IDLE, DEVICE_NOT_READY, DEVICE_STATUS_MASK};
use observa_protocol::{DeviceType, Frame, ServerState, StatusWord};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::command::{
    CipState, Command, CommandEffect, CommandOutcome, BOP_WHILE_STATE,
};
use crate::devclient::{DevClient, DevEffect};
use crate::event::ObjectRef;

use self::data::ReadChannels;
use self::values::ValueTable;

/// Stable identity of a connection inside the block arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unknown,
    ResolvingDevice,
    Connecting,
    /// Non-blocking connect pending
    InProgress,
    Connected,
    AuthPending,
    AuthOk,
    AuthFailed,
    /// Broker connection waiting for a reconnect
    Broken,
    /// Terminal; the block reaps the connection
    Delete,
}

impl ConnState {
    /// Commands queued in this state wait until the session is usable.
    fn holds_queue(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::InProgress | Self::AuthPending | Self::Unknown
        )
    }

    /// The peer has been reached and accepts traffic.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::AuthOk | Self::AuthPending)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::ResolvingDevice => "resolving",
            Self::Connecting => "connecting",
            Self::InProgress => "in progress",
            Self::Connected => "connected",
            Self::AuthPending => "auth pending",
            Self::AuthOk => "auth ok",
            Self::AuthFailed => "auth failed",
            Self::Broken => "broken",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Broker login data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentraldLogin {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub service: String,
}

/// Who is on the other side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnRole {
    /// Accepted on our listening socket
    Peer,
    /// Dialled to a named device found in the address book
    Device { address: String },
    /// Dialled to a broker; survives errors and is re-dialled
    Centrald(CentraldLogin),
}

/// Where the running command is in its exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningStatus {
    /// Written to the peer, reply pending
    Send,
    /// Held back by the BOP mask
    Waiting,
    /// Reply being processed
    Returning,
}

/// Result of a keepalive check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    Fine,
    /// `T ready` was sent
    Probed,
    /// Silent for twice the timeout
    TimedOut,
}

/// Which hook a device state update calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateNotice {
    None,
    Ready,
    Idle,
}

/// One peer session
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    role: ConnRole,
    name: String,
    centrald_num: i32,
    centrald_id: i32,
    key: i32,
    conn_state: ConnState,
    state: ServerState,
    bop_state: ServerState,
    running: Option<Command>,
    running_status: RunningStatus,
    queue: VecDeque<Command>,
    values: ValueTable,
    status_start: f64,
    status_expected_end: f64,
    device_type: Option<DeviceType>,
    dev_client: Option<DevClient>,
    last_data: Instant,
    last_probe: Instant,
    last_good_send: Instant,
    transport: Option<mpsc::UnboundedSender<Frame>>,
    peer_addr: Option<SocketAddr>,
    read_channels: ReadChannels,
}

impl Connection {
    pub fn new(id: ConnId, role: ConnRole) -> Self {
        let now = Instant::now();
        let name = match &role {
            ConnRole::Device { address } => address.clone(),
            _ => String::new(),
        };
        Self {
            id,
            role,
            name,
            centrald_num: -1,
            centrald_id: -1,
            key: 0,
            conn_state: ConnState::Unknown,
            state: ServerState::new(0),
            bop_state: ServerState::new(0),
            running: None,
            running_status: RunningStatus::Send,
            queue: VecDeque::new(),
            values: ValueTable::new(),
            status_start: f64::NAN,
            status_expected_end: f64::NAN,
            device_type: None,
            dev_client: None,
            last_data: now,
            last_probe: now,
            last_good_send: now,
            transport: None,
            peer_addr: None,
            read_channels: ReadChannels::new(),
        }
    }

    // ==================== Identity ====================

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> &ConnRole {
        &self.role
    }

    pub fn is_centrald(&self) -> bool {
        matches!(self.role, ConnRole::Centrald(_))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn centrald_num(&self) -> i32 {
        self.centrald_num
    }

    pub fn set_centrald_num(&mut self, num: i32) {
        self.centrald_num = num;
    }

    pub fn centrald_id(&self) -> i32 {
        self.centrald_id
    }

    pub fn set_centrald_id(&mut self, id: i32) {
        self.centrald_id = id;
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn set_key(&mut self, key: i32) {
        self.key = key;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Broker connections are never deleted, only marked broken.
    pub fn can_delete(&self) -> bool {
        !self.is_centrald()
    }

    // ==================== Connection State ====================

    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    pub fn is_conn_state(&self, state: ConnState) -> bool {
        self.conn_state == state
    }

    /// Move to a new life-cycle state.
    ///
    /// Reaching `Connected` or `AuthOk` starts the queue when nothing runs;
    /// `AuthFailed` ends the connection.
    pub fn set_conn_state(&mut self, state: ConnState, master_state: StatusWord) {
        debug!(conn = %self.id, name = %self.name, from = %self.conn_state, to = %state, "connection state");
        let starts_queue = matches!(state, ConnState::AuthOk | ConnState::Connected);
        self.conn_state = state;
        if starts_queue && self.running.is_none() {
            self.send_next_command(master_state);
        }
        if state == ConnState::AuthFailed {
            self.connection_error();
        }
    }

    /// Fail the session: drop the transport and any partially read data.
    pub fn connection_error(&mut self) {
        self.read_channels.clear();
        self.conn_state = if self.can_delete() {
            ConnState::Delete
        } else {
            ConnState::Broken
        };
        if self.transport.take().is_some() {
            warn!(conn = %self.id, name = %self.name, state = %self.conn_state, "connection error");
        }
    }

    // ==================== Transport ====================

    /// Attach the writer side of a freshly opened socket.
    pub fn attach_transport(&mut self, tx: mpsc::UnboundedSender<Frame>, peer_addr: Option<SocketAddr>) {
        let now = Instant::now();
        self.transport = Some(tx);
        self.peer_addr = peer_addr;
        self.last_data = now;
        self.last_probe = now;
        self.last_good_send = now;
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Queue one frame for the writer task. A closed writer fails the connection.
    pub fn send_frame(&mut self, frame: Frame) -> bool {
        let Some(tx) = &self.transport else {
            trace!(conn = %self.id, "send without transport");
            return false;
        };
        if tx.send(frame).is_err() {
            self.connection_error();
            return false;
        }
        self.last_good_send = Instant::now();
        true
    }

    pub fn send_line(&mut self, line: impl Into<String>) -> bool {
        let line = line.into();
        debug!(conn = %self.id, name = %self.name, "send {}", line);
        self.send_frame(Frame::Line(line))
    }

    pub fn send_command_end(&mut self, code: i32, text: &str) -> bool {
        if code < 0 {
            error!(conn = %self.id, code, "command end with error: {}", text);
        } else if code > 0 {
            debug!(conn = %self.id, code, "command end with note: {}", text);
        }
        self.send_line(command_end(code, text))
    }

    pub fn send_message(&mut self, message: &Message) -> bool {
        self.send_line(message.to_line())
    }

    pub fn send_progress(&mut self, start: f64, end: f64) -> bool {
        self.send_line(format!("{} {:.6} {:.6}", PROTO_PROGRESS, start, end))
    }

    /// Note that the peer sent something.
    pub fn successful_read(&mut self) {
        self.last_data = Instant::now();
    }

    /// Probe a silent peer, fail a dead one.
    pub fn keepalive(&mut self, now: Instant, timeout: Duration) -> Keepalive {
        if timeout.is_zero() || self.transport.is_none() {
            return Keepalive::Fine;
        }
        if now > self.last_data + timeout * 2 {
            debug!(conn = %self.id, name = %self.name, "connection timeout");
            self.connection_error();
            return Keepalive::TimedOut;
        }
        if now > self.last_data + timeout && now > self.last_probe + timeout / 4 {
            self.send_line(format!("{} ready", PROTO_TECHNICAL));
            self.last_probe = now;
            return Keepalive::Probed;
        }
        Keepalive::Fine
    }

    /// Time of the last frame handed to the writer
    pub fn last_good_send(&self) -> Instant {
        self.last_good_send
    }

    // ==================== Device State ====================

    pub fn state(&self) -> StatusWord {
        self.state.value()
    }

    pub fn server_state(&self) -> &ServerState {
        &self.state
    }

    pub fn bop_state(&self) -> StatusWord {
        self.bop_state.value()
    }

    /// Master state combined with the peer's BOP state
    pub fn full_bop_state(&self, master_state: StatusWord) -> StatusWord {
        master_state | self.bop_state.value()
    }

    /// Store a device state word and tell the device client.
    pub fn set_state(&mut self, value: StatusWord) -> StateNotice {
        self.state.set_value(value);
        if let Some(client) = self.dev_client.as_mut() {
            client.state_changed(&self.state);
        }
        if self.state.mask_changed(DEVICE_NOT_READY) {
            if value & DEVICE_NOT_READY == 0 {
                return StateNotice::Ready;
            }
        } else if self.state.mask_changed(DEVICE_STATUS_MASK) && value & DEVICE_STATUS_MASK == DEVICE_IDLE {
            return StateNotice::Idle;
        }
        StateNotice::None
    }

    pub fn set_bop_state(&mut self, value: StatusWord, master_state: StatusWord) {
        self.bop_state.set_value(value);
        self.resend_if(CipState::Run, master_state);
    }

    /// The block's master state changed; retry a command held by it.
    pub fn master_state_changed(&mut self, master_state: StatusWord) {
        self.resend_if(CipState::Run, master_state);
    }

    /// A status round-trip finished; resume the command waiting for it.
    pub fn update_status_wait(&mut self, master_state: StatusWord) {
        self.resend_if(CipState::Wait, master_state);
    }

    fn resend_if(&mut self, cip: CipState, master_state: StatusWord) {
        if self.running.as_ref().map(Command::cip) == Some(cip) {
            self.send_command(master_state);
        }
    }

    pub fn set_progress(&mut self, start: f64, expected_end: f64) {
        self.status_start = start;
        self.status_expected_end = expected_end;
    }

    pub fn progress_window(&self) -> (f64, f64) {
        (self.status_start, self.status_expected_end)
    }

    /// Percent of the announced progress window elapsed at `now` (unix seconds).
    pub fn progress(&self, now: f64) -> f64 {
        if self.status_start.is_nan() || self.status_expected_end.is_nan() {
            return f64::NAN;
        }
        if now > self.status_expected_end {
            return 100.0;
        }
        100.0 * ((now - self.status_start) / (self.status_expected_end - self.status_start))
    }

    // ==================== Device Client ====================

    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    /// Install the device client for a newly learned peer type.
    pub fn set_other_type(&mut self, device_type: DeviceType, client: Option<DevClient>) {
        self.device_type = Some(device_type);
        self.dev_client = client;
    }

    pub fn dev_client(&self) -> Option<&DevClient> {
        self.dev_client.as_ref()
    }

    pub fn dev_client_mut(&mut self) -> Option<&mut DevClient> {
        self.dev_client.as_mut()
    }

    /// Collect what the device client asked for since the last drain.
    pub fn drain_dev_effects(&mut self) -> Vec<DevEffect> {
        self.dev_client
            .as_mut()
            .map(DevClient::drain_effects)
            .unwrap_or_default()
    }

    /// Remove the device client so its retirement callbacks can be delivered.
    pub fn take_dev_client(&mut self) -> Option<DevClient> {
        self.dev_client.take()
    }

    // ==================== Values ====================

    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueTable {
        &mut self.values
    }

    /// Tell the device client that `name` was updated.
    pub fn value_changed(&mut self, name: &str) {
        if let Some(client) = self.dev_client.as_mut() {
            client.value_changed(name, &self.values);
        }
    }

    pub fn read_channels(&self) -> &ReadChannels {
        &self.read_channels
    }

    pub fn read_channels_mut(&mut self) -> &mut ReadChannels {
        &mut self.read_channels
    }

    // ==================== Command Queue ====================

    pub fn running_command(&self) -> Option<&Command> {
        self.running.as_ref()
    }

    pub fn running_status(&self) -> Option<RunningStatus> {
        self.running.as_ref().map(|_| self.running_status)
    }

    pub fn queue(&self) -> impl Iterator<Item = &Command> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing running and nothing queued
    pub fn que_empty(&self) -> bool {
        self.running.is_none() && self.queue.is_empty()
    }

    /// Queue a command; it runs now when the session is idle and usable.
    pub fn que_command(&mut self, mut cmd: Command, master_state: StatusWord) {
        cmd.set_connection(self.id);
        if self.running.is_some() || self.conn_state.holds_queue() {
            self.queue.push_back(cmd);
            return;
        }
        self.running = Some(cmd);
        self.send_command(master_state);
    }

    /// Queue with an explicit BOP mask and completion target.
    pub fn que_command_with(
        &mut self,
        cmd: Command,
        bop_mask: StatusWord,
        originator: Option<ObjectRef>,
        master_state: StatusWord,
    ) {
        let mut cmd = cmd.with_bop_mask(bop_mask);
        cmd.set_originator(originator);
        self.que_command(cmd, master_state);
    }

    /// Run a command ahead of the queue.
    ///
    /// A running command that has not been written yet goes back to the
    /// front, behind the new one.
    pub fn que_send(&mut self, mut cmd: Command, master_state: StatusWord) {
        cmd.set_connection(self.id);
        if matches!(
            self.conn_state,
            ConnState::Connecting | ConnState::InProgress | ConnState::Unknown
        ) {
            self.queue.push_front(cmd);
            return;
        }
        if let Some(running) = self.running.take() {
            if matches!(self.running_status, RunningStatus::Send | RunningStatus::Returning) {
                self.running = Some(running);
                self.queue.push_front(cmd);
                return;
            }
            self.queue.push_front(running);
        }
        self.running = Some(cmd);
        self.send_command(master_state);
    }

    /// Try to write the running command, honouring its BOP mask.
    pub fn send_command(&mut self, master_state: StatusWord) {
        let full_bop = self.full_bop_state(master_state);
        let Some(cmd) = self.running.as_mut() else {
            return;
        };
        let mask = cmd.bop_mask();
        if mask == 0 {
            let text = cmd.text().to_string();
            self.running_status = RunningStatus::Send;
            self.send_line(text);
            return;
        }

        // BOP_WHILE_STATE commands wait for the bits to be set and use the
        // CIP bits only to remember that they were sent
        if mask & BOP_WHILE_STATE != 0 {
            if full_bop & mask & BOP_MASK != 0 {
                if cmd.cip() == CipState::Wait {
                    self.running_status = RunningStatus::Waiting;
                    return;
                }
                cmd.set_cip(CipState::Wait);
                let text = cmd.text().to_string();
                self.running_status = RunningStatus::Send;
                self.send_line(text);
            } else {
                cmd.set_cip(CipState::Run);
            }
            return;
        }

        match cmd.cip() {
            CipState::NotCalled => {
                let mut status = Command::device_status(Some(self.id));
                status.set_connection(self.id);
                status.set_cip(CipState::Return);
                cmd.set_cip(CipState::Wait);
                let held = self.running.replace(status);
                if let Some(held) = held {
                    self.queue.push_front(held);
                }
                self.running_status = RunningStatus::Send;
                let text = self.running.as_ref().map(|c| c.text().to_string());
                if let Some(text) = text {
                    self.send_line(text);
                }
            }
            CipState::Wait | CipState::Run => {
                cmd.set_cip(CipState::Run);
                if full_bop & mask & BOP_MASK != 0 {
                    self.running_status = RunningStatus::Waiting;
                    return;
                }
                cmd.set_cip(CipState::Return);
                let text = cmd.text().to_string();
                self.running_status = RunningStatus::Send;
                self.send_line(text);
            }
            CipState::Return => {}
        }
    }

    /// Promote the queue head. Returns false when the queue is empty.
    pub fn send_next_command(&mut self, master_state: StatusWord) -> bool {
        match self.queue.pop_front() {
            Some(cmd) => {
                self.running = Some(cmd);
                self.send_command(master_state);
                true
            }
            None => {
                self.running = None;
                false
            }
        }
    }

    /// Process a command return line.
    ///
    /// Returns the effects the block has to apply, `None` when no command
    /// was running.
    pub fn command_return(&mut self, status: i32, master_state: StatusWord) -> Option<Vec<CommandEffect>> {
        let Some(cmd) = self.running.as_mut() else {
            error!(
                conn = %self.id,
                name = %self.name,
                centrald_id = self.centrald_id,
                status,
                "command return without running command"
            );
            return None;
        };
        self.running_status = RunningStatus::Returning;
        if let Some(client) = self.dev_client.as_mut() {
            client.command_return(cmd.text(), status);
        }
        let ret = cmd.command_return(status);
        match ret.outcome {
            CommandOutcome::Requeue => self.send_command(master_state),
            CommandOutcome::Retire => {
                self.running = None;
                self.send_next_command(master_state);
            }
            CommandOutcome::Keep => {}
        }

        let mut effects = Vec::with_capacity(ret.effects.len());
        for effect in ret.effects {
            match effect {
                CommandEffect::Device(note) => {
                    if let Some(client) = self.dev_client.as_mut() {
                        client.command_note(note);
                    }
                }
                other => effects.push(other),
            }
        }
        Some(effects)
    }

    /// Drop queued commands. A command already written stays running.
    pub fn que_clear(&mut self) {
        if self.running.is_some() && self.running_status != RunningStatus::Send {
            self.running = None;
        }
        self.queue.clear();
    }

    /// Forget everything, including a command already written; used before
    /// re-dialling, when no reply can arrive on the old socket.
    pub fn reset_queue(&mut self) {
        self.running = None;
        self.running_status = RunningStatus::Send;
        self.queue.clear();
    }

    /// True when no pending command was queued by `originator`.
    pub fn que_empty_for_originator(&self, originator: ObjectRef) -> bool {
        if let Some(cmd) = &self.running {
            if self.running_status != RunningStatus::Returning && cmd.is_originator(originator) {
                return false;
            }
        }
        !self.queue.iter().any(|c| c.is_originator(originator))
    }

    /// True while a command queued by `originator` still waits for its reply.
    pub fn command_originator_pending(&self, originator: ObjectRef) -> bool {
        !self.que_empty_for_originator(originator)
    }

    /// Another connection is going away: forget every reference to it.
    pub fn delete_connection(&mut self, conn: ConnId) {
        if let Some(cmd) = self.running.as_mut() {
            cmd.delete_connection(conn);
        }
        for cmd in self.queue.iter_mut() {
            cmd.delete_connection(conn);
        }
        if let Some(client) = self.dev_client.as_mut() {
            client.delete_connection(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::devclient::DeviceCallback;
    use crate::event::EventType;
    use observa_protocol::status::{BOP_EXPOSURE, BOP_TEL_MOVE, DEVICE_SC_CURR};

    fn open_conn(role: ConnRole) -> (Connection, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(ConnId::new(1), role);
        conn.attach_transport(tx, None);
        conn.set_conn_state(ConnState::AuthOk, 0);
        (conn, rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Line(line) = frame {
                out.push(line);
            }
        }
        out
    }

    // ==================== Queue Tests ====================

    #[test]
    fn test_one_command_in_flight() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        conn.que_command(Command::new("first"), 0);
        conn.que_command(Command::new("second"), 0);
        conn.que_command(Command::new("third"), 0);

        assert_eq!(sent(&mut rx), vec!["first"]);
        assert_eq!(conn.queue_len(), 2);

        conn.command_return(0, 0).unwrap();
        assert_eq!(sent(&mut rx), vec!["second"]);
        assert_eq!(conn.running_command().unwrap().text(), "second");

        conn.command_return(-3, 0).unwrap();
        conn.command_return(0, 0).unwrap();
        assert_eq!(sent(&mut rx), vec!["third"]);
        assert!(conn.que_empty());
    }

    #[test]
    fn test_queue_held_until_connected() {
        let mut conn = Connection::new(ConnId::new(3), ConnRole::Device { address: "C0".into() });
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_conn_state(ConnState::Connecting, 0);
        conn.que_command(Command::new("info"), 0);
        assert!(conn.running_command().is_none());

        conn.attach_transport(tx, None);
        conn.set_conn_state(ConnState::Connected, 0);
        assert_eq!(sent(&mut rx), vec!["info"]);
        assert_eq!(conn.name(), "C0");
    }

    #[test]
    fn test_que_send_jumps_queue() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        conn.que_command(Command::new("slow"), 0);
        conn.que_command(Command::new("later"), 0);
        conn.que_send(Command::new("urgent"), 0);

        // the running command was already sent, so urgent waits at the front
        assert_eq!(sent(&mut rx), vec!["slow"]);
        assert_eq!(conn.queue().next().unwrap().text(), "urgent");

        conn.command_return(0, 0).unwrap();
        assert_eq!(sent(&mut rx), vec!["urgent"]);
    }

    #[test]
    fn test_que_send_preempts_waiting_command() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        conn.set_bop_state(BOP_EXPOSURE, 0);
        conn.que_command(Command::new("held").with_bop_mask(BOP_EXPOSURE), 0);
        // device_status goes out first; answer it so "held" starts waiting
        assert_eq!(sent(&mut rx), vec!["device_status"]);
        conn.command_return(0, 0).unwrap();
        assert_eq!(conn.running_status(), Some(RunningStatus::Waiting));

        conn.que_send(Command::new("now"), 0);
        assert_eq!(sent(&mut rx), vec!["now"]);
        assert_eq!(conn.queue().next().unwrap().text(), "held");
    }

    #[test]
    fn test_return_without_running_command_is_ignored() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        assert!(conn.command_return(0, 0).is_none());
    }

    #[test]
    fn test_que_clear_keeps_sent_command() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        conn.que_command(Command::new("a"), 0);
        conn.que_command(Command::new("b"), 0);
        conn.que_clear();
        assert_eq!(conn.running_command().unwrap().text(), "a");
        assert_eq!(conn.queue_len(), 0);
    }

    #[test]
    fn test_que_empty_for_originator() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        let me = ObjectRef::Connection(ConnId::new(7));
        assert!(conn.que_empty_for_originator(me));

        conn.que_command_with(Command::new("a"), 0, Some(me), 0);
        assert!(!conn.que_empty_for_originator(me));
        assert!(conn.que_empty_for_originator(ObjectRef::Block));
    }

    // ==================== BOP Tests ====================

    #[test]
    fn test_bop_mask_requests_status_first() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        conn.que_command(Command::new("expose").with_bop_mask(BOP_TEL_MOVE), 0);
        assert_eq!(sent(&mut rx), vec!["device_status"]);
        assert!(matches!(
            conn.running_command().unwrap().kind(),
            CommandKind::DeviceStatus { .. }
        ));

        // status returned, nothing blocks: the held command goes out
        let effects = conn.command_return(0, 0).unwrap();
        assert_eq!(effects, vec![CommandEffect::UpdateStatusWait { control: conn.id() }]);
        assert_eq!(sent(&mut rx), vec!["expose"]);
        assert_eq!(conn.running_command().unwrap().cip(), CipState::Return);
    }

    #[test]
    fn test_bop_blocked_until_state_clears() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        conn.que_command(Command::new("expose").with_bop_mask(BOP_TEL_MOVE), BOP_TEL_MOVE);
        conn.command_return(0, BOP_TEL_MOVE).unwrap();
        assert_eq!(sent(&mut rx), vec!["device_status"]);
        assert_eq!(conn.running_status(), Some(RunningStatus::Waiting));

        conn.master_state_changed(BOP_TEL_MOVE);
        assert!(sent(&mut rx).is_empty());

        conn.master_state_changed(0);
        assert_eq!(sent(&mut rx), vec!["expose"]);
    }

    #[test]
    fn test_bop_while_state_waits_for_bits() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        let mask = BOP_EXPOSURE | BOP_WHILE_STATE;
        conn.que_command(Command::new("readout").with_bop_mask(mask), 0);
        assert!(sent(&mut rx).is_empty());
        assert_eq!(conn.running_command().unwrap().cip(), CipState::Run);

        conn.set_bop_state(BOP_EXPOSURE, 0);
        assert_eq!(sent(&mut rx), vec!["readout"]);
        assert_eq!(conn.running_command().unwrap().cip(), CipState::Wait);
    }

    // ==================== State Tests ====================

    #[test]
    fn test_state_notices() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        assert_eq!(conn.set_state(DEVICE_NOT_READY), StateNotice::None);
        assert_eq!(conn.set_state(0), StateNotice::Ready);
        assert_eq!(conn.set_state(0x01), StateNotice::None);
        assert_eq!(conn.set_state(DEVICE_IDLE), StateNotice::Idle);
    }

    #[test]
    fn test_device_note_reaches_client() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        conn.set_other_type(DeviceType::Ccd, Some(DevClient::for_type(DeviceType::Ccd)));
        conn.que_command(Command::exposure(0), 0);
        conn.command_return(-2, 0).unwrap();

        let effects = conn.drain_dev_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            DevEffect::Callback(DeviceCallback::ExposureFailed(-2))
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            DevEffect::Callback(DeviceCallback::CommandReturn { status: -2, .. })
        )));

        conn.set_state(observa_protocol::status::CAM_EXPOSING | DEVICE_SC_CURR);
        assert!(matches!(
            conn.drain_dev_effects().as_slice(),
            [DevEffect::Callback(DeviceCallback::ExposureStarted { expect_image: true })]
        ));
    }

    #[test]
    fn test_originator_notified_on_return() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        conn.que_command_with(Command::new("park"), 0, Some(ObjectRef::Block), 0);
        let effects = conn.command_return(0, 0).unwrap();
        match effects.as_slice() {
            [CommandEffect::Notify { target, kind, notice }] => {
                assert_eq!(*target, ObjectRef::Block);
                assert_eq!(*kind, EventType::COMMAND_OK);
                assert_eq!(notice.conn, Some(conn.id()));
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_delete_connection_clears_references() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        let gone = ConnId::new(9);
        conn.que_command_with(Command::new("a"), 0, Some(ObjectRef::Connection(gone)), 0);
        conn.que_command(Command::status_info(Some(gone)), 0);
        conn.delete_connection(gone);

        assert!(conn.que_empty_for_originator(ObjectRef::Connection(gone)));
        assert_eq!(conn.queue().next().unwrap().control(), None);
    }

    // ==================== Failure Tests ====================

    #[test]
    fn test_connection_error_by_role() {
        let (mut peer, _rx) = open_conn(ConnRole::Peer);
        peer.connection_error();
        assert_eq!(peer.conn_state(), ConnState::Delete);
        assert!(!peer.has_transport());

        let (mut central, _rx) = open_conn(ConnRole::Centrald(CentraldLogin {
            host: "localhost".into(),
            port: 617,
            login: "observer".into(),
            password: "secret".into(),
            service: "observa".into(),
        }));
        central.connection_error();
        assert_eq!(central.conn_state(), ConnState::Broken);
    }

    #[test]
    fn test_auth_failed_ends_connection() {
        let (mut conn, _rx) = open_conn(ConnRole::Peer);
        conn.set_conn_state(ConnState::AuthFailed, 0);
        assert_eq!(conn.conn_state(), ConnState::Delete);
    }

    #[test]
    fn test_closed_writer_fails_connection() {
        let (mut conn, rx) = open_conn(ConnRole::Peer);
        drop(rx);
        assert!(!conn.send_line("T ready"));
        assert_eq!(conn.conn_state(), ConnState::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_probe_then_timeout() {
        let (mut conn, mut rx) = open_conn(ConnRole::Peer);
        let timeout = Duration::from_secs(10);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(conn.keepalive(Instant::now(), timeout), Keepalive::Fine);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(conn.keepalive(Instant::now(), timeout), Keepalive::Probed);
        assert_eq!(sent(&mut rx), vec!["T ready"]);
        // probed recently: stay quiet
        assert_eq!(conn.keepalive(Instant::now(), timeout), Keepalive::Fine);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(conn.keepalive(Instant::now(), timeout), Keepalive::TimedOut);
        assert_eq!(conn.conn_state(), ConnState::Delete);
    }

    #[test]
    fn test_progress_window() {
        let mut conn = Connection::new(ConnId::new(1), ConnRole::Peer);
        assert!(conn.progress(10.0).is_nan());
        conn.set_progress(10.0, 20.0);
        assert_eq!(conn.progress(15.0), 50.0);
        assert_eq!(conn.progress(25.0), 100.0);
    }
}
