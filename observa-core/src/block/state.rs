//! System state word and the block's own values

use observa_protocol::messages::{VALUE_ERROR, VALUE_GOOD, VALUE_WARNING, VALUE_WRITABLE};
use observa_protocol::status::{
    self, BAD_WEATHER, BOP_MASK, CAN_MOVE, GOOD_WEATHER, SERVERD_HARD_OFF, SERVERD_ONOFF_MASK,
    SERVERD_STANDBY, STOP_MASK, WEATHER_MASK,
};
use observa_protocol::StatusWord;
use tracing::{debug, warn};

use crate::connection::values::{Value, ValueData};
use crate::connection::{ConnId, ConnState, Connection};

use super::hooks::Notice;
use super::{Block, CommandReply};

/// Does this state word switch the system off or report bad weather?
fn is_restricting(state: StatusWord) -> bool {
    let onoff = state & SERVERD_ONOFF_MASK;
    onoff == SERVERD_HARD_OFF || onoff == SERVERD_STANDBY || state & WEATHER_MASK == BAD_WEATHER
}

fn is_running(conn: &Connection) -> bool {
    matches!(conn.conn_state(), ConnState::Connected | ConnState::AuthOk)
}

impl Block {
    // ==================== Master State ====================

    pub fn master_state(&self) -> StatusWord {
        self.state
    }

    pub fn master_state_string(&self) -> String {
        status::master_state_string(self.state)
    }

    pub fn state_master(&self) -> Option<ConnId> {
        self.state_master
    }

    /// Only this broker connection may relax the system state from now on.
    pub fn set_state_master(&mut self, conn: Option<ConnId>) {
        self.state_master = conn;
    }

    /// Take a system state word reported by broker connection `from`.
    ///
    /// Once a state master is set, other connections may only switch the
    /// system off, to standby or to bad weather, and never from hard off
    /// to standby. Returns false when the update was ignored.
    pub fn set_master_state(&mut self, from: Option<ConnId>, new_state: StatusWord) -> bool {
        let old_state = self.state;
        if self.state_master.is_some() && from != self.state_master {
            if !is_restricting(new_state) {
                if old_state & !BOP_MASK != new_state & !BOP_MASK {
                    debug!(?from, "ignoring state change, not from the state master");
                }
                return false;
            }
            if old_state & SERVERD_ONOFF_MASK == SERVERD_HARD_OFF
                && new_state & SERVERD_ONOFF_MASK == SERVERD_STANDBY
            {
                return false;
            }
        }

        self.state = new_state;

        if old_state & !BOP_MASK != new_state & !BOP_MASK {
            debug!(
                old = %status::master_state_string(old_state),
                new = %status::master_state_string(new_state),
                "master state changed"
            );
            self.notify(Notice::ChangeMasterState { old: old_state, new: new_state });
            self.master_state_changed_all();
        }
        if old_state & BOP_MASK != new_state & BOP_MASK {
            self.notify(Notice::BopStateChanged { old: old_state, new: new_state });
            self.master_state_changed_all();
        }
        true
    }

    /// Let every connection retry commands held by the old state.
    fn master_state_changed_all(&mut self) {
        let master = self.state;
        for id in self.all_ids() {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.master_state_changed(master);
            }
        }
    }

    /// Is any broker reporting one of the `state` bits?
    pub fn central_server_in_state(&self, state: StatusWord) -> bool {
        self.centrald_conns().any(|c| c.state() & state != 0)
    }

    // ==================== Gates ====================

    /// Every broker is connected and reports good weather.
    pub fn is_good_weather(&self) -> bool {
        self.centralds_all(|c| c.state() & WEATHER_MASK == GOOD_WEATHER)
    }

    /// Every broker is connected and lets the mount move.
    pub fn can_move(&self) -> bool {
        self.centralds_all(|c| c.state() & STOP_MASK == CAN_MOVE)
    }

    pub fn all_centrald_running(&self) -> bool {
        self.centralds_all(|_| true)
    }

    /// Some broker is connected; true when there are none.
    pub fn some_centrald_running(&self) -> bool {
        if self.centralds.active.is_empty() {
            return true;
        }
        self.centrald_conns().any(is_running)
    }

    fn centralds_all(&self, check: impl Fn(&Connection) -> bool) -> bool {
        if self.centralds.active.is_empty() {
            return false;
        }
        self.centrald_conns().all(|c| is_running(c) && check(c))
    }

    // ==================== Own Values ====================

    /// Publish a value of this block. Existing values keep their content.
    pub fn add_value(&mut self, value: Value) {
        if self.values.get(value.name()).is_some() {
            warn!(name = %value.name(), "value already published");
            return;
        }
        self.values.insert(value);
    }

    pub fn own_value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn own_values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Replace the content of an own value and broadcast it.
    pub fn update_value(&mut self, name: &str, data: ValueData) -> bool {
        let line = match self.values.get_mut(name) {
            Some(value) => {
                value.set_data(data);
                value.value_line()
            }
            None => return false,
        };
        self.send_all(&line);
        true
    }

    pub fn value_good(&mut self, name: &str) -> bool {
        self.value_mask_error(name, VALUE_GOOD)
    }

    pub fn value_warning(&mut self, name: &str) -> bool {
        self.value_mask_error(name, VALUE_WARNING)
    }

    pub fn value_error(&mut self, name: &str) -> bool {
        self.value_mask_error(name, VALUE_ERROR)
    }

    /// Set the error bits of an own value. When they change every
    /// connection gets the new meta line and the value once; returns
    /// whether anything was sent.
    pub fn value_mask_error(&mut self, name: &str, mask: i32) -> bool {
        let lines = match self.values.get_mut(name) {
            Some(value) => {
                if !value.set_error_mask(mask) {
                    return false;
                }
                (value.meta_line(), value.value_line())
            }
            None => return false,
        };
        self.send_all(&lines.0);
        self.send_all(&lines.1);
        true
    }

    /// Own values with the warning or error bits set
    pub fn failed_values(&self) -> Vec<&Value> {
        self.values.failed_values().collect()
    }

    /// Peer values with the warning or error bits set, per connection
    pub fn failed_peer_values(&self) -> Vec<(ConnId, Vec<&Value>)> {
        self.live_conns()
            .map(|c| (c.id(), c.values().failed_values().collect::<Vec<_>>()))
            .filter(|(_, values)| !values.is_empty())
            .collect()
    }

    /// `X <name> <op> <value>` against an own writable value. `=` assigns,
    /// `+=` and `-=` work on numeric values.
    pub fn set_own_value(&mut self, conn: ConnId, name: &str, op: &str, value: &str) -> CommandReply {
        let Some(own) = self.values.get_mut(name) else {
            return CommandReply::failed(format!("cannot find variable {}", name));
        };
        if own.flags() & VALUE_WRITABLE == 0 {
            return CommandReply::failed(format!("variable {} is read only", name));
        }

        let data = match (op, own.data()) {
            ("=", _) => {
                let mut probe = own.clone();
                let mut params = observa_protocol::Params::new(value);
                if probe.set_from_params(&mut params, now_unix()).is_err() {
                    return CommandReply::Invalid;
                }
                probe.data().clone()
            }
            ("+=" | "-=", current) => {
                let Ok(delta) = value.trim().parse::<f64>() else {
                    return CommandReply::Invalid;
                };
                let delta = if op == "-=" { -delta } else { delta };
                match apply_delta(current, delta) {
                    Some(data) => data,
                    None => return CommandReply::failed(format!("cannot change {} with {}", name, op)),
                }
            }
            _ => return CommandReply::failed(format!("unknown operation {}", op)),
        };

        debug!(%conn, name, op, value, "own value set");
        self.update_value(name, data);
        CommandReply::Ok
    }

    /// Send meta and content of every own value to one connection.
    pub fn send_base_info(&mut self, conn: ConnId) {
        let lines: Vec<String> = self
            .values
            .iter()
            .flat_map(|v| [v.meta_line(), v.value_line()])
            .collect();
        if let Some(conn) = self.connections.get_mut(&conn) {
            for line in lines {
                conn.send_line(line);
            }
        }
    }
}

fn apply_delta(current: &ValueData, delta: f64) -> Option<ValueData> {
    let data = match current {
        ValueData::Integer(v) => ValueData::Integer(v.checked_add(delta as i32)?),
        ValueData::LongInt(v) => ValueData::LongInt(v.checked_add(delta as i64)?),
        ValueData::Double(v) => ValueData::Double(v + delta),
        ValueData::Float(v) => ValueData::Float(v + delta as f32),
        ValueData::Time(v) => ValueData::Time(v + delta),
        _ => return None,
    };
    Some(data)
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
