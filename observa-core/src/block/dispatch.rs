//! Line protocol dispatch
//!
//! Every text line read from a connection ends up in
//! [`Block::process_line`]. Single-letter tags carry state, values and
//! binary channel headers; lines starting with a signed number are command
//! returns; anything else is a command, answered with a command end unless
//! the handler stays silent.

use observa_protocol::messages::{
    COMMAND_DATA_IN_FITS, COMMAND_STATUS_INFO, PROTO_AUTH, PROTO_BINARY, PROTO_BINARY_KILLED,
    PROTO_BOP_STATE, PROTO_DATA, PROTO_MESSAGE, PROTO_METAINFO, PROTO_PROGRESS, PROTO_SELMETAINFO,
    PROTO_SET_VALUE, PROTO_SHARED, PROTO_SHARED_FULL, PROTO_SHARED_KILLED, PROTO_STATUS,
    PROTO_STATUS_PROGRESS, PROTO_TECHNICAL, PROTO_VALUE,
};
use observa_protocol::status::{DEVDEM_E_COMMAND, DEVDEM_E_HW, DEVDEM_E_SYSTEM, DEVDEM_OK};
use observa_protocol::{parse_command_return, DeviceType, Message, ParamResult, Params, StatusWord};
use tracing::{debug, info, trace, warn};

use crate::address::NetworkAddress;
use crate::command::Command;
use crate::connection::{ConnId, ConnRole, ConnState, StateNotice};

use super::hooks::Notice;
use super::{Block, CommandReply};

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Tags whose malformed header leaves the byte stream unusable
fn is_data_header(tag: &str) -> bool {
    matches!(
        tag,
        PROTO_BINARY
            | PROTO_DATA
            | PROTO_BINARY_KILLED
            | PROTO_SHARED
            | PROTO_SHARED_FULL
            | PROTO_SHARED_KILLED
            | COMMAND_DATA_IN_FITS
    )
}

impl Block {
    /// Handle one text line received on `id`.
    pub fn process_line(&mut self, id: ConnId, line: &str) {
        if !self.connections.contains_key(&id) {
            return;
        }
        debug!(conn = %id, "recv {}", line);
        let (tag, mut params) = Params::split_command(line);

        let reply = match self.dispatch_line(id, line, tag, &mut params) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(conn = %id, command = tag, "bad parameters: {}", e);
                if is_data_header(tag) {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.connection_error();
                    }
                }
                CommandReply::Invalid
            }
        };
        self.send_reply(id, tag, reply);
    }

    fn send_reply(&mut self, id: ConnId, command: &str, reply: CommandReply) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match reply {
            CommandReply::Ok => {
                conn.send_command_end(DEVDEM_OK, "OK");
            }
            CommandReply::Silent => {}
            CommandReply::Invalid => {
                conn.send_command_end(
                    DEVDEM_E_COMMAND,
                    &format!("invalid parameters/invalid number of parameters - {}", command),
                );
            }
            CommandReply::Unknown => {
                debug!(conn = %id, name = %conn.name(), state = %conn.conn_state(), "unknown command {}", command);
                conn.send_command_end(DEVDEM_E_HW, &format!("unknow command {}", command));
            }
            CommandReply::Failed(code, text) => {
                conn.send_command_end(code, &text);
            }
        }
    }

    fn dispatch_line(&mut self, id: ConnId, line: &str, tag: &str, params: &mut Params<'_>) -> ParamResult<CommandReply> {
        match tag {
            PROTO_STATUS_PROGRESS => {
                let state = params.next_status()?;
                let start = params.next_f64()?;
                let end = params.next_f64()?;
                let message = params.next_string_opt()?;
                params.end()?;
                self.apply_device_state(id, state, message);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.set_progress(start, end);
                }
                self.call_hooks(|hooks, block| hooks.progress(block, id, start, end));
                Ok(CommandReply::Silent)
            }
            PROTO_STATUS => {
                let state = params.next_status()?;
                let message = params.next_string_opt()?;
                params.end()?;
                self.apply_device_state(id, state, message);
                Ok(CommandReply::Silent)
            }
            PROTO_BOP_STATE => {
                let state = params.next_status()?;
                let bop = params.next_status()?;
                params.end()?;
                let master = self.state;
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.set_bop_state(bop, master);
                }
                self.apply_device_state(id, state, None);
                Ok(CommandReply::Silent)
            }
            PROTO_MESSAGE => {
                let message = Message::parse(params)?;
                self.notify(Notice::Message(message));
                Ok(CommandReply::Silent)
            }
            PROTO_TECHNICAL => {
                let word = params.next_string()?;
                params.end()?;
                match word {
                    "ready" => {
                        if let Some(conn) = self.connections.get_mut(&id) {
                            conn.send_line(format!("{} OK", PROTO_TECHNICAL));
                        }
                        Ok(CommandReply::Silent)
                    }
                    "OK" => Ok(CommandReply::Silent),
                    _ => Ok(CommandReply::Invalid),
                }
            }
            PROTO_METAINFO => {
                let flags = params.next_i32()?;
                let name = params.next_string()?;
                let description = params.next_string()?;
                params.end()?;
                if let Some(conn) = self.connections.get_mut(&id) {
                    if conn.values_mut().meta_info(flags, name, description).is_none() {
                        debug!(conn = %id, name, flags, "unsupported value type");
                    }
                }
                Ok(CommandReply::Silent)
            }
            PROTO_VALUE => {
                let name = params.next_string()?;
                self.value_update(id, name, params);
                Ok(CommandReply::Silent)
            }
            PROTO_SELMETAINFO => {
                let name = params.next_string()?;
                let entry = params.next_string_opt()?;
                params.end()?;
                if let Some(conn) = self.connections.get_mut(&id) {
                    let known = match entry {
                        None => conn.values_mut().clear_selection(name),
                        Some(entry) => conn.values_mut().add_selection(name, entry),
                    };
                    if !known {
                        debug!(conn = %id, name, "selection for unknown value");
                    }
                }
                Ok(CommandReply::Silent)
            }
            PROTO_SET_VALUE => {
                let name = params.next_string()?;
                let op = params.next_string()?;
                let value = params.rest();
                Ok(self.call_hooks(|hooks, block| hooks.set_value(block, id, name, op, value)))
            }
            PROTO_BINARY => {
                let data_conn = params.next_i32()?;
                let data_type = params.next_i32()?;
                let count = params.next_usize()?;
                let sizes = (0..count).map(|_| params.next_usize()).collect::<ParamResult<Vec<_>>>()?;
                params.end()?;
                let limit = self.config.max_data_size();
                if let Some(conn) = self.connections.get_mut(&id) {
                    match conn.read_channels_mut().open(data_conn, data_type, &sizes, limit) {
                        Ok(()) => {
                            if let Some(client) = conn.dev_client_mut() {
                                client.new_data_conn(data_conn);
                            }
                        }
                        Err(e) => {
                            warn!(conn = %id, "binary channels refused: {}", e);
                            conn.connection_error();
                        }
                    }
                }
                self.apply_dev_effects(id);
                Ok(CommandReply::Silent)
            }
            PROTO_DATA => {
                let data_conn = params.next_i32()?;
                let channel = params.next_usize()?;
                let size = params.next_usize()?;
                params.end()?;
                if let Some(conn) = self.connections.get_mut(&id) {
                    if let Err(e) = conn.read_channels_mut().start_chunk(data_conn, channel, size) {
                        warn!(conn = %id, "bad data header: {}", e);
                        conn.connection_error();
                    }
                }
                Ok(CommandReply::Silent)
            }
            PROTO_SHARED => {
                let data_conn = params.next_i32()?;
                let shm_id = params.next_i32()?;
                let count = params.next_usize()?;
                let segments = (0..count).map(|_| params.next_i32()).collect::<ParamResult<Vec<_>>>()?;
                params.end()?;
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.read_channels_mut().open_shared(data_conn, shm_id, segments);
                    if let Some(client) = conn.dev_client_mut() {
                        client.new_data_conn(data_conn);
                    }
                }
                self.apply_dev_effects(id);
                Ok(CommandReply::Silent)
            }
            PROTO_BINARY_KILLED | PROTO_SHARED_FULL | PROTO_SHARED_KILLED => {
                let data_conn = params.next_i32()?;
                params.end()?;
                if let Some(conn) = self.connections.get_mut(&id) {
                    if let Some(set) = conn.read_channels_mut().close(data_conn) {
                        if let Some(client) = conn.dev_client_mut() {
                            client.full_data_received(data_conn, set.into_channels());
                        }
                    }
                }
                self.apply_dev_effects(id);
                Ok(CommandReply::Silent)
            }
            COMMAND_DATA_IN_FITS => {
                let path = params.next_string()?;
                params.end()?;
                if let Some(client) = self.connections.get_mut(&id).and_then(|c| c.dev_client_mut()) {
                    client.fits_data(path);
                }
                self.apply_dev_effects(id);
                Ok(CommandReply::Ok)
            }
            _ => match parse_command_return(line) {
                Some(status) => {
                    self.command_returned(id, status);
                    Ok(CommandReply::Silent)
                }
                None => self.command(id, tag, params),
            },
        }
    }

    /// Store a state word reported on `id`; broker states become the master state.
    fn apply_device_state(&mut self, id: ConnId, state: StatusWord, message: Option<&str>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Some(message) = message {
            trace!(conn = %id, state, "state message: {}", message);
        }
        let notice = conn.set_state(state);
        let is_centrald = conn.is_centrald();
        match notice {
            StateNotice::Ready => self.notify(Notice::DeviceReady(id)),
            StateNotice::Idle => self.notify(Notice::DeviceIdle(id)),
            StateNotice::None => {}
        }
        self.apply_dev_effects(id);
        if is_centrald {
            self.set_master_state(Some(id), state);
        }
    }

    fn value_update(&mut self, id: ConnId, name: &str, params: &mut Params<'_>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(value) = conn.values_mut().get_mut(name) else {
            debug!(conn = %id, name, "update of unknown value");
            return;
        };
        if let Err(e) = value.set_from_params(params, now_unix()) {
            debug!(conn = %id, name, "cannot parse value: {}", e);
            return;
        }
        conn.value_changed(name);
        self.apply_dev_effects(id);
    }

    fn command_returned(&mut self, id: ConnId, status: i32) {
        let master = self.state;
        let effects = match self.connections.get_mut(&id) {
            Some(conn) => conn.command_return(status, master),
            None => return,
        };
        if let Some(effects) = effects {
            self.apply_command_effects(id, effects);
        }
        self.apply_dev_effects(id);
    }

    // ==================== Commands ====================

    fn command(&mut self, id: ConnId, command: &str, params: &mut Params<'_>) -> ParamResult<CommandReply> {
        let Some((role, authorized)) = self
            .connections
            .get(&id)
            .map(|c| (c.role().clone(), c.is_conn_state(ConnState::AuthOk)))
        else {
            return Ok(CommandReply::Silent);
        };
        match role {
            ConnRole::Centrald(_) => {
                if let Some(reply) = self.centrald_command(id, command, params)? {
                    return Ok(reply);
                }
            }
            ConnRole::Peer => {
                if command == "auth" {
                    return self.peer_auth(id, params);
                }
                if self.config.block.require_auth && !authorized {
                    return Ok(CommandReply::Failed(DEVDEM_E_SYSTEM, "not authorized".into()));
                }
            }
            ConnRole::Device { .. } => {}
        }
        self.generic_command(id, command, params)
    }

    fn generic_command(&mut self, id: ConnId, command: &str, params: &mut Params<'_>) -> ParamResult<CommandReply> {
        match command {
            "device" => {
                let centrald_num = params.next_i32()?;
                let centrald_id = params.next_i32()?;
                let name = params.next_string()?;
                let host = params.next_string()?;
                let port = params.next_i32()?;
                let device_type = params.next_i32()?;
                params.end()?;
                let Ok(port) = u16::try_from(port) else {
                    return Ok(CommandReply::Invalid);
                };
                let host_num = self.connections.get(&id).map_or(-1, |c| c.centrald_num());
                self.add_address(NetworkAddress::new(
                    host_num,
                    centrald_num,
                    centrald_id,
                    name,
                    host,
                    port,
                    DeviceType::from_code(device_type),
                ));
                Ok(CommandReply::Silent)
            }
            "delete_device" => {
                let centrald_num = params.next_i32()?;
                let name = params.next_string()?;
                params.end()?;
                self.delete_address(centrald_num, name);
                Ok(CommandReply::Silent)
            }
            "client" => {
                let centrald_id = params.next_i32()?;
                let login = params.next_string()?;
                let name = params.next_string()?;
                params.end()?;
                self.add_client(centrald_id, login, name);
                Ok(CommandReply::Silent)
            }
            "delete_client" => {
                let centrald_id = params.next_i32()?;
                params.end()?;
                self.delete_client(centrald_id);
                Ok(CommandReply::Silent)
            }
            COMMAND_STATUS_INFO => {
                params.end()?;
                Ok(self.call_hooks(|hooks, block| hooks.status_info(block, id)))
            }
            PROTO_PROGRESS => {
                let start = params.next_f64()?;
                let end = params.next_f64()?;
                params.end()?;
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.set_progress(start, end);
                }
                Ok(self.call_hooks(|hooks, block| hooks.progress(block, id, start, end)))
            }
            _ => Ok(self.call_hooks(|hooks, block| hooks.command(block, id, command, params))),
        }
    }

    /// Commands only a broker sends. `None` when `command` is not one of them.
    fn centrald_command(
        &mut self,
        id: ConnId,
        command: &str,
        params: &mut Params<'_>,
    ) -> ParamResult<Option<CommandReply>> {
        match command {
            "logged_as" => {
                let centrald_id = params.next_i32()?;
                params.end()?;
                self.centrald_registered(id, centrald_id);
                Ok(Some(CommandReply::Silent))
            }
            "authorization_key" => {
                let name = params.next_string()?;
                let key = params.next_i32()?;
                params.end()?;
                self.authorization_key(id, name, key);
                Ok(Some(CommandReply::Silent))
            }
            PROTO_AUTH => {
                let word = params.next_string()?;
                let centrald_id = params.next_i32()?;
                params.end()?;
                match word {
                    "authorization_ok" => self.authorization_ok(centrald_id),
                    "authorization_failed" => self.authorization_failed(centrald_id),
                    "registered_as" => self.centrald_registered(id, centrald_id),
                    _ => return Ok(Some(CommandReply::Invalid)),
                }
                Ok(Some(CommandReply::Silent))
            }
            _ => Ok(None),
        }
    }

    fn centrald_registered(&mut self, id: ConnId, centrald_id: i32) {
        if let Some(conn) = self.connections.get_mut(&id) {
            info!(conn = %id, centrald_id, "registered at broker");
            conn.set_centrald_id(centrald_id);
        }
        self.notify(Notice::CentraldConnRunning(id));
    }

    /// The broker handed out a key for a device we dial.
    fn authorization_key(&mut self, centrald: ConnId, name: &str, key: i32) {
        let Some(our_id) = self.connections.get(&centrald).map(|c| c.centrald_id()) else {
            return;
        };
        let Some(target) = self.get_connection(name) else {
            warn!(device = name, "key for unknown device");
            return;
        };
        let master = self.state;
        let Some(conn) = self.connections.get_mut(&target) else {
            return;
        };
        conn.set_key(key);
        if conn.is_conn_state(ConnState::AuthPending) {
            let cmd = Command::send_key(our_id, conn.centrald_num(), key);
            conn.que_send(cmd, master);
        }
    }

    /// The broker confirmed a peer's key.
    fn authorization_ok(&mut self, centrald_id: i32) {
        let Some(peer) = self.find_central_id(centrald_id) else {
            debug!(centrald_id, "authorization for unknown client");
            return;
        };
        self.set_conn_state(peer, ConnState::AuthOk);
        self.send_base_info(peer);
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.send_command_end(DEVDEM_OK, "OK authorized");
        }
    }

    fn authorization_failed(&mut self, centrald_id: i32) {
        let Some(peer) = self.find_central_id(centrald_id) else {
            debug!(centrald_id, "authorization failure for unknown client");
            return;
        };
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.send_command_end(DEVDEM_E_SYSTEM, "authorization failed");
            conn.set_centrald_id(-1);
            conn.connection_error();
        }
    }

    /// `auth <id> <num> <key>` from an accepted peer.
    fn peer_auth(&mut self, id: ConnId, params: &mut Params<'_>) -> ParamResult<CommandReply> {
        let centrald_id = params.next_i32()?;
        let centrald_num = params.next_i32()?;
        let key = params.next_i32()?;
        params.end()?;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_centrald_id(centrald_id);
            conn.set_key(key);
        }
        if self.call_hooks(|hooks, block| hooks.authorize(block, id, centrald_num)) {
            self.set_conn_state(id, ConnState::AuthPending);
        } else if let Some(conn) = self.connections.get_mut(&id) {
            conn.send_command_end(DEVDEM_E_SYSTEM, "cannot authorize; try again later");
            conn.set_conn_state(ConnState::AuthFailed, self.state);
        }
        Ok(CommandReply::Silent)
    }

    /// Ask broker `centrald_num` to check the key a peer presented.
    pub fn authorize_peer(&mut self, peer: ConnId, centrald_num: i32) -> bool {
        let Some((centrald_id, key)) = self.connections.get(&peer).map(|c| (c.centrald_id(), c.key())) else {
            return false;
        };
        let Some(broker) = self.centrald_by_num(centrald_num) else {
            warn!(conn = %peer, centrald_num, "no broker to authorize against");
            return false;
        };
        self.que_send(broker, Command::authorize(centrald_id, key))
    }

    // ==================== Binary Data ====================

    /// Payload bytes following a `D` header on `id`.
    pub fn process_data(&mut self, id: ConnId, bytes: &[u8]) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.read_channels_mut().receive(bytes) {
            Ok(progress) => {
                if let Some(client) = conn.dev_client_mut() {
                    client.data_received(progress.data_conn, progress.channel, progress.received);
                    if let Some(set) = progress.complete {
                        client.full_data_received(progress.data_conn, set.into_channels());
                    }
                }
            }
            Err(e) => {
                warn!(conn = %id, "binary data rejected: {}", e);
                conn.connection_error();
            }
        }
        self.apply_dev_effects(id);
    }
}
