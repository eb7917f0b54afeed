//! Connection registry and event loop
//!
//! A [`Block`] owns every [`Connection`] of the process in an arena keyed by
//! [`ConnId`]. Connections are listed in one of two pools (peers and
//! brokers); new entries are staged in the pool's pending list and become
//! visible to lookups and broadcasts when the idle pass promotes them.
//!
//! All protocol processing happens in [`Block::one_run_loop`]: it waits for
//! the next network event or the next timer, drains whatever else is ready,
//! removes connections marked for deletion and runs [`Block::idle`].

mod dispatch;
pub mod hooks;
mod state;
pub mod timers;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use observa_protocol::{DeviceType, Frame, Message, StatusWord};
use observa_utils::Result;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::{AddressBook, ConnUser, NetworkAddress};
use crate::command::{Command, CommandEffect};
use crate::config::BlockConfig;
use crate::connection::values::{Value, ValueTable};
use crate::connection::{CentraldLogin, ConnId, ConnRole, ConnState, Connection};
use crate::devclient::DevEffect;
use crate::event::{Event, EventHandler, EventPayload, EventType, HandlerChain, HandlerId, ObjectRef};
use crate::net::{self, NetEvent, NetLink};

use self::hooks::Notice;
pub use self::hooks::{BlockHooks, CommandReply, NoHooks};
use self::timers::TimerQueue;

/// Connections of one kind: live ones and ones waiting for promotion
#[derive(Debug, Default)]
struct Pool {
    active: Vec<ConnId>,
    pending: Vec<ConnId>,
}

impl Pool {
    fn contains(&self, id: ConnId) -> bool {
        self.active.contains(&id) || self.pending.contains(&id)
    }

    fn remove(&mut self, id: ConnId) -> bool {
        let before = self.active.len() + self.pending.len();
        self.active.retain(|c| *c != id);
        self.pending.retain(|c| *c != id);
        before != self.active.len() + self.pending.len()
    }

    fn promote(&mut self) {
        self.active.append(&mut self.pending);
    }
}

/// Walk state for [`Block::get_open_connection_type`]
#[derive(Debug, Default)]
pub struct ConnCursor {
    visited: HashSet<ConnId>,
}

impl ConnCursor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The process-wide connection registry and its event loop
pub struct Block {
    config: BlockConfig,
    connections: HashMap<ConnId, Connection>,
    next_conn: u64,
    peers: Pool,
    centralds: Pool,
    state: StatusWord,
    state_master: Option<ConnId>,
    addresses: AddressBook,
    timers: TimerQueue,
    values: ValueTable,
    handlers: HandlerChain<Block>,
    hooks: Option<Box<dyn BlockHooks>>,
    notices: VecDeque<Notice>,
    posted: VecDeque<(ObjectRef, Event)>,
    posting: bool,
    net: NetLink,
    local_addr: Option<SocketAddr>,
    broken_since: HashMap<ConnId, Instant>,
    /// Connections whose deletion the others were already told about
    detached: HashSet<ConnId>,
    end_loop: bool,
}

impl Block {
    pub fn new(config: BlockConfig, hooks: impl BlockHooks + 'static) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            next_conn: 1,
            peers: Pool::default(),
            centralds: Pool::default(),
            state: 0,
            state_master: None,
            addresses: AddressBook::new(),
            timers: TimerQueue::new(),
            values: ValueTable::new(),
            handlers: HandlerChain::new(),
            hooks: Some(Box::new(hooks)),
            notices: VecDeque::new(),
            posted: VecDeque::new(),
            posting: false,
            net: NetLink::new(),
            local_addr: None,
            broken_since: HashMap::new(),
            detached: HashSet::new(),
            end_loop: false,
        }
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.block.name
    }

    /// Address of the listening socket once [`Block::listen`] ran
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn end_run_loop(&mut self) {
        self.end_loop = true;
    }

    pub fn is_end_loop(&self) -> bool {
        self.end_loop
    }

    // ==================== Hooks ====================

    /// Call into the hooks. While a hook already runs the defaults answer.
    fn call_hooks<R>(&mut self, f: impl FnOnce(&mut dyn BlockHooks, &mut Block) -> R) -> R {
        match self.hooks.take() {
            Some(mut hooks) => {
                let result = f(hooks.as_mut(), self);
                self.hooks = Some(hooks);
                self.flush_notices();
                result
            }
            None => f(&mut NoHooks, self),
        }
    }

    /// Queue a notification; it is delivered now unless a hook is running.
    fn notify(&mut self, notice: Notice) {
        self.notices.push_back(notice);
        self.flush_notices();
    }

    fn flush_notices(&mut self) {
        let Some(mut hooks) = self.hooks.take() else {
            return;
        };
        while let Some(notice) = self.notices.pop_front() {
            notice.deliver(hooks.as_mut(), self);
        }
        self.hooks = Some(hooks);
    }

    // ==================== Pools ====================

    fn alloc_id(&mut self) -> ConnId {
        let id = ConnId::new(self.next_conn);
        self.next_conn += 1;
        id
    }

    /// Create an unregistered connection with a fresh id.
    pub fn create_connection(&mut self, role: ConnRole) -> Connection {
        let id = self.alloc_id();
        Connection::new(id, role)
    }

    /// Stage a peer connection; it goes live on the next idle pass.
    pub fn add_connection(&mut self, conn: Connection) -> ConnId {
        let id = conn.id();
        self.connections.insert(id, conn);
        self.peers.pending.push(id);
        id
    }

    /// Register a broker connection, live now when `added` is set.
    pub fn add_centrald_connection(&mut self, conn: Connection, added: bool) -> ConnId {
        let id = conn.id();
        self.connections.insert(id, conn);
        if added {
            self.centralds.active.push(id);
        } else {
            self.centralds.pending.push(id);
        }
        id
    }

    /// Take a connection out of every pool and the arena.
    pub fn remove_connection(&mut self, id: ConnId) -> Option<Connection> {
        self.peers.remove(id);
        self.centralds.remove(id);
        self.broken_since.remove(&id);
        self.detached.remove(&id);
        self.connections.remove(&id)
    }

    /// Make staged connections live.
    pub fn promote(&mut self) {
        self.peers.promote();
        self.centralds.promote();
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Live peer connections, in registration order
    pub fn peer_ids(&self) -> &[ConnId] {
        &self.peers.active
    }

    /// Live broker connections, in registration order
    pub fn centrald_ids(&self) -> &[ConnId] {
        &self.centralds.active
    }

    pub fn is_pending(&self, id: ConnId) -> bool {
        self.peers.pending.contains(&id) || self.centralds.pending.contains(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live connections, peers first
    fn live_ids(&self) -> Vec<ConnId> {
        self.peers
            .active
            .iter()
            .chain(self.centralds.active.iter())
            .copied()
            .collect()
    }

    /// Every registered connection, live or staged
    fn all_ids(&self) -> Vec<ConnId> {
        self.live_ids()
            .into_iter()
            .chain(self.peers.pending.iter().copied())
            .chain(self.centralds.pending.iter().copied())
            .collect()
    }

    fn live_conns(&self) -> impl Iterator<Item = &Connection> {
        self.peers
            .active
            .iter()
            .chain(self.centralds.active.iter())
            .filter_map(|id| self.connections.get(id))
    }

    fn peer_conns(&self) -> impl Iterator<Item = &Connection> {
        self.peers.active.iter().filter_map(|id| self.connections.get(id))
    }

    fn centrald_conns(&self) -> impl Iterator<Item = &Connection> {
        self.centralds
            .active
            .iter()
            .filter_map(|id| self.connections.get(id))
    }

    // ==================== Lookups ====================

    /// Live peer connection with this name
    pub fn find_name(&self, name: &str) -> Option<ConnId> {
        self.peer_conns().find(|c| c.name() == name).map(Connection::id)
    }

    /// Live peer connection with this broker-assigned id
    pub fn find_central_id(&self, centrald_id: i32) -> Option<ConnId> {
        self.peer_conns()
            .find(|c| c.centrald_id() == centrald_id)
            .map(Connection::id)
    }

    pub fn get_open_connection(&self, name: &str) -> Option<ConnId> {
        self.find_name(name)
    }

    /// First live peer connection to a device of this type
    pub fn get_open_connection_of_type(&self, device_type: DeviceType) -> Option<ConnId> {
        self.peer_conns()
            .find(|c| c.device_type() == Some(device_type))
            .map(Connection::id)
    }

    /// Next live peer of this type the cursor has not returned yet.
    /// Connections removed or promoted between calls do not make the walk
    /// skip or repeat an entry.
    pub fn get_open_connection_type(&self, device_type: DeviceType, cursor: &mut ConnCursor) -> Option<ConnId> {
        let id = self
            .peer_conns()
            .filter(|c| c.device_type() == Some(device_type))
            .map(Connection::id)
            .find(|id| !cursor.visited.contains(id))?;
        cursor.visited.insert(id);
        Some(id)
    }

    /// Connection to the named device, dialling it when it is known from
    /// the address book but not connected yet.
    pub fn get_connection(&mut self, name: &str) -> Option<ConnId> {
        if let Some(id) = self.get_open_connection(name) {
            return Some(id);
        }
        if let Some(id) = self.pending_device(name) {
            return Some(id);
        }
        let Some(address) = self.addresses.find_address(name).cloned() else {
            warn!("cannot find device with name {}", name);
            return None;
        };
        Some(self.create_client_connection(&address))
    }

    /// Staged outbound connection to `name`
    fn pending_device(&self, name: &str) -> Option<ConnId> {
        self.peers
            .pending
            .iter()
            .filter_map(|id| self.connections.get(id))
            .find(|c| matches!(c.role(), ConnRole::Device { .. }) && c.name() == name)
            .map(Connection::id)
    }

    fn create_client_connection(&mut self, address: &NetworkAddress) -> ConnId {
        let mut conn = self.create_connection(ConnRole::Device {
            address: address.name().to_string(),
        });
        let id = conn.id();
        conn.set_centrald_num(address.centrald_num());
        conn.set_conn_state(ConnState::ResolvingDevice, self.state);
        self.add_connection(conn);

        let device_type = address.device_type();
        let client = self.call_hooks(|hooks, block| hooks.create_other_type(block, id, device_type));
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_other_type(device_type, client);
        }
        debug!(conn = %id, device = %address.name(), addr = %address.socket_spec(), "dialling device");
        self.dial(id, address.socket_spec());
        id
    }

    fn dial(&mut self, id: ConnId, addr: String) {
        let master = self.state;
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            // no runtime, e.g. in unit tests: the connection stays in progress
            trace!(conn = %id, "no runtime, not dialling {}", addr);
            conn.set_conn_state(ConnState::InProgress, master);
            return;
        }
        conn.set_conn_state(ConnState::InProgress, master);
        self.net.dial(id, addr, self.config.connect_timeout());
    }

    /// First live broker connection
    pub fn single_central_conn(&self) -> Option<ConnId> {
        self.centralds.active.first().copied()
    }

    /// Live broker connection with this broker number
    pub fn centrald_by_num(&self, centrald_num: i32) -> Option<ConnId> {
        self.centrald_conns()
            .find(|c| c.centrald_num() == centrald_num)
            .map(Connection::id)
    }

    /// Peer whose integer value `name` is smallest (and not negative)
    pub fn get_min_conn(&self, value_name: &str) -> Option<ConnId> {
        self.peer_conns()
            .filter_map(|c| {
                let v = c.values().get(value_name)?.as_integer()?;
                (v >= 0).then_some((v, c.id()))
            })
            .min_by_key(|(v, _)| *v)
            .map(|(_, id)| id)
    }

    pub fn get_value(&self, device: &str, value: &str) -> Option<&Value> {
        let id = self.get_open_connection(device)?;
        self.connections.get(&id)?.values().get(value)
    }

    /// Resolve `device.value`; an empty device or `centrald` names the first
    /// broker, and a bare `value` is looked up on `default_device`.
    pub fn get_value_expression(&self, expression: &str, default_device: &str) -> Option<&Value> {
        match expression.split_once('.') {
            Some((device, value)) => {
                if device.is_empty() || device == "centrald" {
                    if let Some(conn) = self.centrald_conns().next() {
                        return conn.values().get(value);
                    }
                }
                self.get_value(device, value)
            }
            None => self.get_value(default_device, expression),
        }
    }

    // ==================== Address Book ====================

    pub fn addresses(&self) -> &[NetworkAddress] {
        self.addresses.addresses()
    }

    pub fn find_address(&self, name: &str) -> Option<&NetworkAddress> {
        self.addresses.find_address(name)
    }

    /// Record an announced device; dial it when the hooks want it.
    pub fn add_address(&mut self, address: NetworkAddress) {
        let name = address.name().to_string();
        debug!(device = %name, centrald_num = address.centrald_num(), "address {}", address.socket_spec());
        self.addresses.add_address(address.clone());
        if self.get_open_connection(&name).is_some() || self.pending_device(&name).is_some() {
            return;
        }
        if self.call_hooks(|hooks, block| hooks.will_connect(block, &address)) {
            self.get_connection(&name);
        }
    }

    pub fn delete_address(&mut self, centrald_num: i32, name: &str) -> Option<NetworkAddress> {
        self.addresses.delete_address(centrald_num, name)
    }

    pub fn users(&self) -> &[ConnUser] {
        self.addresses.users()
    }

    pub fn add_client(&mut self, centrald_id: i32, login: &str, name: &str) {
        self.addresses.add_client(centrald_id, login, name);
    }

    pub fn delete_client(&mut self, centrald_id: i32) -> Option<ConnUser> {
        self.addresses.delete_client(centrald_id)
    }

    // ==================== Broadcasts ====================

    pub fn send_all(&mut self, line: &str) {
        for id in self.live_ids() {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.send_line(line);
            }
        }
    }

    pub fn send_all_except(&mut self, line: &str, except: ConnId) {
        for id in self.live_ids() {
            if id == except {
                continue;
            }
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.send_line(line);
            }
        }
    }

    pub fn send_value_all(&mut self, name: &str, value: &str) {
        self.send_all(&format!("V {} {}", name, value));
    }

    pub fn send_message_all(&mut self, message: &Message) {
        self.send_all(&message.to_line());
    }

    /// `S <state> ["msg"]` to everybody. The commanding connection, if any,
    /// gets the state with the current-command bit instead.
    pub fn send_status_message(&mut self, state: StatusWord, message: Option<&str>, commanded: Option<ConnId>) {
        let mut line = format!("S {}", state);
        if let Some(message) = message {
            line.push_str(&format!(" \"{}\"", message));
        }
        match commanded {
            Some(id) => {
                let current = format!("S {}", state | observa_protocol::status::DEVICE_SC_CURR);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.send_line(current);
                }
                self.send_all_except(&line, id);
            }
            None => self.send_all(&line),
        }
    }

    /// `B <state> <bop>` to everybody
    pub fn send_bop_message(&mut self, state: StatusWord, bop_state: StatusWord) {
        self.send_all(&format!("B {} {}", state, bop_state));
    }

    // ==================== Commands ====================

    pub fn que_command(&mut self, id: ConnId, cmd: Command) -> bool {
        let master = self.state;
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.que_command(cmd, master);
                true
            }
            None => false,
        }
    }

    pub fn que_send(&mut self, id: ConnId, cmd: Command) -> bool {
        let master = self.state;
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.que_send(cmd, master);
                true
            }
            None => false,
        }
    }

    /// Queue a copy of `cmd` on every device in the address book,
    /// connecting where needed.
    pub fn que_all(&mut self, cmd: &Command) {
        let names: Vec<String> = self.addresses().iter().map(|a| a.name().to_string()).collect();
        for name in names {
            match self.get_connection(&name) {
                Some(id) => {
                    self.que_command(id, cmd.duplicate());
                }
                None => trace!("que_all: no connection for {}", name),
            }
        }
    }

    pub fn que_all_text(&mut self, text: &str) {
        self.que_all(&Command::new(text));
    }

    pub fn que_all_centralds(&mut self, text: &str) {
        for id in self.centralds.active.clone() {
            self.que_command(id, Command::new(text));
        }
    }

    /// Ask every broker to forward only messages matching `mask`.
    pub fn set_message_mask(&mut self, mask: i32) {
        for id in self.centralds.active.clone() {
            self.que_command(id, Command::message_mask(mask));
        }
    }

    /// Drop queued commands everywhere.
    pub fn clear_all(&mut self) {
        for conn in self.connections.values_mut() {
            conn.que_clear();
        }
    }

    /// Nothing queued or running on any live connection
    pub fn command_que_empty(&self) -> bool {
        self.live_conns().all(Connection::que_empty)
    }

    /// Is a command queued by `originator` still pending anywhere but `exclude`?
    pub fn command_originator_pending(&self, originator: ObjectRef, exclude: Option<ConnId>) -> bool {
        self.live_conns()
            .filter(|c| Some(c.id()) != exclude)
            .any(|c| c.command_originator_pending(originator))
    }

    fn apply_command_effects(&mut self, id: ConnId, effects: Vec<CommandEffect>) {
        for effect in effects {
            match effect {
                CommandEffect::Notify { target, kind, notice } => {
                    self.post_event(target, Event::with_payload(kind, EventPayload::Command(notice)));
                }
                CommandEffect::UpdateStatusWait { control } => {
                    let master = self.state;
                    if let Some(conn) = self.connections.get_mut(&control) {
                        conn.update_status_wait(master);
                    }
                }
                CommandEffect::AuthOk => {
                    info!(conn = %id, "authorized by peer");
                    self.set_conn_state(id, ConnState::AuthOk);
                }
                CommandEffect::AuthFailed => {
                    warn!(conn = %id, "peer refused our key");
                    self.set_conn_state(id, ConnState::AuthFailed);
                }
                // applied by the connection itself
                CommandEffect::Device(_) => {}
            }
        }
    }

    pub fn set_conn_state(&mut self, id: ConnId, state: ConnState) {
        let master = self.state;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_conn_state(state, master);
        }
    }

    // ==================== Events ====================

    /// Register a handler at the end of the chain.
    pub fn add_handler(&mut self, handler: impl EventHandler<Block> + 'static) -> HandlerId {
        self.handlers.add(handler)
    }

    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    /// Deliver an event. Posts made while another event is being delivered
    /// are queued and handled in order once it is done.
    pub fn post_event(&mut self, target: ObjectRef, event: Event) {
        self.posted.push_back((target, event));
        if self.posting {
            return;
        }
        self.posting = true;
        while let Some((target, mut event)) = self.posted.pop_front() {
            self.deliver_event(target, &mut event);
        }
        self.posting = false;
    }

    fn deliver_event(&mut self, target: ObjectRef, event: &mut Event) {
        trace!(kind = %event.kind(), ?target, "deliver event");
        match target {
            ObjectRef::Block => {
                let ids = self.all_ids();
                for id in &ids {
                    if let Some(client) = self.connections.get_mut(id).and_then(Connection::dev_client_mut) {
                        client.post_event(event);
                    }
                }
                let mut chain = self.handlers.detach();
                chain.dispatch(self, event);
                self.handlers.reattach(chain);
                for id in ids {
                    self.apply_dev_effects(id);
                }
            }
            ObjectRef::Connection(id) => {
                if let Some(client) = self.connections.get_mut(&id).and_then(Connection::dev_client_mut) {
                    client.post_event(event);
                }
                self.apply_dev_effects(id);
            }
            ObjectRef::Handler(handler) => {
                let mut chain = self.handlers.detach();
                if chain.dispatch_to(handler, self, event).is_none() {
                    trace!(%handler, "event for removed handler");
                }
                self.handlers.reattach(chain);
            }
        }
    }

    /// Run what device clients asked for.
    fn apply_dev_effects(&mut self, id: ConnId) {
        loop {
            let effects = match self.connections.get_mut(&id) {
                Some(conn) => conn.drain_dev_effects(),
                None => return,
            };
            if effects.is_empty() {
                return;
            }
            for effect in effects {
                self.apply_dev_effect(id, effect);
            }
        }
    }

    fn apply_dev_effect(&mut self, id: ConnId, effect: DevEffect) {
        match effect {
            DevEffect::Callback(callback) => self.notify(Notice::DeviceCallback { conn: id, callback }),
            DevEffect::Unblocked => self.enter_wait_if_possible(),
            DevEffect::Que(cmd) => {
                self.que_command(id, cmd);
            }
        }
    }

    /// Ask every device client whether it blocks the move wait; when none
    /// does, all of them enter it.
    fn enter_wait_if_possible(&mut self) {
        let mut query = Event::with_payload(EventType::QUERY_WAIT, EventPayload::Count(0));
        for client in self.connections.values_mut().filter_map(Connection::dev_client_mut) {
            client.post_event(&mut query);
        }
        if query.count() != Some(0) {
            return;
        }
        let mut enter = Event::new(EventType::ENTER_WAIT);
        for client in self.connections.values_mut().filter_map(Connection::dev_client_mut) {
            client.post_event(&mut enter);
        }
    }

    // ==================== Timers ====================

    /// Deliver `event` to `target` (the block when `None`) after `delay`.
    pub fn add_timer(&mut self, delay: Duration, event: Event, target: Option<ObjectRef>) {
        self.timers.add(Instant::now() + delay, event, target);
    }

    /// Cancel every pending timer of this event type.
    pub fn delete_timers(&mut self, kind: EventType) -> usize {
        self.timers.delete_type(kind)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ==================== Deletion ====================

    /// Remove connections marked for deletion; note brokers that broke.
    pub fn reap_connections(&mut self) {
        for id in self.all_ids() {
            let Some(state) = self.connections.get(&id).map(Connection::conn_state) else {
                continue;
            };
            match state {
                ConnState::Delete => {
                    self.delete_connection(id);
                }
                ConnState::Broken if !self.broken_since.contains_key(&id) => {
                    warn!(conn = %id, "broker connection broken");
                    self.broken_since.insert(id, Instant::now());
                    self.notify(Notice::CentraldConnBroken(id));
                }
                _ => {}
            }
        }
    }

    /// Two-phase removal: every other connection drops its references
    /// first, then the hooks may veto, then the connection is evicted.
    /// Returns false when the connection stays; a vetoed connection is
    /// retried on later passes without notifying the others again.
    fn delete_connection(&mut self, id: ConnId) -> bool {
        if self.detached.insert(id) {
            for other in self.all_ids() {
                if other == id {
                    continue;
                }
                if let Some(conn) = self.connections.get_mut(&other) {
                    conn.delete_connection(id);
                }
                self.apply_dev_effects(other);
            }
        }

        if !self.call_hooks(|hooks, block| hooks.can_delete_connection(block, id)) {
            trace!(conn = %id, "deletion vetoed");
            return false;
        }

        let Some(mut conn) = self.remove_connection(id) else {
            return false;
        };
        if self.state_master == Some(id) {
            self.state_master = None;
        }
        let name = conn.name().to_string();
        if !name.is_empty() {
            self.addresses.delete_address(conn.centrald_num(), &name);
        }
        if let Some(mut client) = conn.take_dev_client() {
            client.retire();
            for effect in client.drain_effects() {
                match effect {
                    DevEffect::Callback(callback) => self.notify(Notice::DeviceCallback { conn: id, callback }),
                    DevEffect::Unblocked => self.enter_wait_if_possible(),
                    // nowhere to send it any more
                    DevEffect::Que(_) => {}
                }
            }
        }
        info!(conn = %id, name = %name, "connection removed");
        drop(conn);
        self.notify(Notice::ConnectionRemoved { conn: id, name });
        true
    }

    // ==================== Idle ====================

    /// Housekeeping run after every network wake-up.
    pub fn idle(&mut self) {
        self.reap_children();

        let now = Instant::now();
        let timeout = self.config.connection_timeout();
        for id in self.live_ids() {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.keepalive(now, timeout);
            }
        }

        self.reconnect_centralds(now);
        self.promote();

        for timer in self.timers.take_expired(now) {
            self.post_event(timer.target.unwrap_or(ObjectRef::Block), timer.event);
        }

        self.reap_connections();
    }

    fn reap_children(&mut self) {
        loop {
            // SAFETY: waitpid with a null status pointer only reaps exited children
            let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            debug!(pid, "child returned");
            self.notify(Notice::ChildReturned(pid));
        }
    }

    fn reconnect_centralds(&mut self, now: Instant) {
        let interval = self.config.reconnect_interval();
        let due: Vec<ConnId> = self
            .broken_since
            .iter()
            .filter(|(_, since)| now >= **since + interval)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.broken_since.remove(&id);
            let addr = match self.connections.get_mut(&id) {
                Some(conn) => match conn.role() {
                    ConnRole::Centrald(login) => {
                        let addr = format!("{}:{}", login.host, login.port);
                        conn.reset_queue();
                        addr
                    }
                    _ => continue,
                },
                None => continue,
            };
            info!(conn = %id, "reconnecting to broker at {}", addr);
            self.dial(id, addr);
        }
    }

    // ==================== Network ====================

    /// Bind the listening socket and start accepting peers.
    pub async fn listen(&mut self) -> Result<SocketAddr> {
        let listener = net::bind(self.config.block.port).await?;
        let addr = listener.local_addr()?;
        self.net.spawn_listener(listener);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Register and dial a broker.
    pub fn add_centrald(&mut self, login: CentraldLogin) -> ConnId {
        let addr = format!("{}:{}", login.host, login.port);
        let num = (self.centralds.active.len() + self.centralds.pending.len()) as i32;
        let mut conn = self.create_connection(ConnRole::Centrald(login));
        let id = conn.id();
        conn.set_centrald_num(num);
        self.add_centrald_connection(conn, true);

        let client = self.call_hooks(|hooks, block| hooks.create_other_type(block, id, DeviceType::Serverd));
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_other_type(DeviceType::Serverd, client);
        }
        info!(conn = %id, centrald_num = num, "connecting to broker at {}", addr);
        self.dial(id, addr);
        id
    }

    /// Listen, log into the configured broker and loop until
    /// [`Block::end_run_loop`] is called.
    pub async fn run(&mut self) -> Result<()> {
        self.listen().await?;
        if let Some(login) = self.config.centrald_login() {
            self.add_centrald(login);
        }
        while !self.end_loop {
            self.one_run_loop().await;
        }
        info!("run loop ended");
        Ok(())
    }

    /// Wait for network traffic or the next timer, process everything
    /// ready, then run the idle pass.
    pub async fn one_run_loop(&mut self) {
        let mut wake = Instant::now() + self.config.idle_timeout();
        if let Some(deadline) = self.timers.next_deadline() {
            wake = wake.min(deadline);
        }
        let event = tokio::select! {
            event = self.net.recv() => event,
            _ = tokio::time::sleep_until(wake) => None,
        };
        if let Some(event) = event {
            self.handle_net_event(event);
        }
        while let Some(event) = self.net.try_recv() {
            self.handle_net_event(event);
        }
        self.reap_connections();
        self.idle();
    }

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Accepted { stream, peer } => {
                let mut conn = self.create_connection(ConnRole::Peer);
                let id = conn.id();
                let tx = self.net.spawn_session(id, stream);
                conn.attach_transport(tx, Some(peer));
                conn.set_conn_state(ConnState::Connected, self.state);
                info!(conn = %id, %peer, "accepted connection");
                self.add_connection(conn);
            }
            NetEvent::Connected { conn: id, stream } => {
                if !self.connections.contains_key(&id) {
                    debug!(conn = %id, "connected after removal");
                    return;
                }
                let peer = stream.peer_addr().ok();
                let tx = self.net.spawn_session(id, stream);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.attach_transport(tx, peer);
                }
                self.connection_opened(id);
            }
            NetEvent::ConnectFailed { conn: id, error } => {
                warn!(conn = %id, "connect failed: {}", error);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.connection_error();
                }
            }
            NetEvent::Frame { conn: id, frame } => self.process_frame(id, frame),
            NetEvent::Closed { conn: id, error } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    if conn.has_transport() {
                        match error {
                            Some(e) => warn!(conn = %id, "connection failed: {}", e),
                            None => debug!(conn = %id, "connection closed by peer"),
                        }
                        conn.connection_error();
                    }
                }
            }
        }
    }

    /// An outbound socket is open: start the role's handshake.
    fn connection_opened(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        match conn.role().clone() {
            ConnRole::Centrald(login) => {
                self.set_conn_state(id, ConnState::Connected);
                let service = login.service.clone();
                self.que_command(id, Command::login(&login.login, &service, &login.password));
            }
            ConnRole::Device { address } => match self.broker_for(id) {
                Some(broker) => {
                    self.que_command(broker, Command::key(&address));
                    self.set_conn_state(id, ConnState::AuthPending);
                }
                None => {
                    debug!(conn = %id, device = %address, "no broker to get a key from");
                    self.set_conn_state(id, ConnState::Connected);
                }
            },
            ConnRole::Peer => self.set_conn_state(id, ConnState::Connected),
        }
    }

    /// Broker that announced the device behind `id`
    fn broker_for(&self, id: ConnId) -> Option<ConnId> {
        let conn = self.connections.get(&id)?;
        self.addresses
            .find_address_num(conn.centrald_num(), conn.name())
            .and_then(|a| self.centrald_by_num(a.host_num()))
            .or_else(|| self.single_central_conn())
    }

    /// Hand one frame from the socket to its connection.
    pub fn process_frame(&mut self, id: ConnId, frame: Frame) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.has_transport() {
            // leftovers of a failed session
            return;
        }
        conn.successful_read();
        match frame {
            Frame::Line(line) => self.process_line(id, &line),
            Frame::Data(bytes) => self.process_data(id, &bytes),
        }
    }
}
