//! Application hooks
//!
//! The block calls into [`BlockHooks`] for everything that depends on what
//! the process actually is (a device daemon, a scheduler, a monitor). Every
//! method has a default, so an application overrides only what it needs.
//!
//! Hooks are never re-entered. While one runs, notifications it triggers
//! (state changes, device callbacks, removals) are queued and delivered
//! after it returns; hooks that must answer immediately fall back to their
//! default behaviour.

use observa_protocol::status::{StatusWord, DEVDEM_E_COMMAND};
use observa_protocol::{DeviceType, Message, Params};

use crate::address::NetworkAddress;
use crate::connection::ConnId;
use crate::devclient::{DevClient, DeviceCallback};

use super::Block;

/// How a hook answered a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Reply `+0 OK`
    Ok,
    /// Handled; the hook replied itself or no reply is due
    Silent,
    /// Reply `-1 invalid parameters/...`
    Invalid,
    /// Reply `-4 unknow command ...`
    Unknown,
    /// Reply with this code and text
    Failed(i32, String),
}

impl CommandReply {
    pub fn failed(text: impl Into<String>) -> Self {
        Self::Failed(DEVDEM_E_COMMAND, text.into())
    }
}

/// Deferred hook call
#[derive(Debug, Clone)]
pub(crate) enum Notice {
    Message(Message),
    DeviceReady(ConnId),
    DeviceIdle(ConnId),
    ChangeMasterState { old: StatusWord, new: StatusWord },
    BopStateChanged { old: StatusWord, new: StatusWord },
    CentraldConnRunning(ConnId),
    CentraldConnBroken(ConnId),
    ChildReturned(i32),
    ConnectionRemoved { conn: ConnId, name: String },
    DeviceCallback { conn: ConnId, callback: DeviceCallback },
}

impl Notice {
    pub(crate) fn deliver(self, hooks: &mut dyn BlockHooks, block: &mut Block) {
        match self {
            Self::Message(msg) => hooks.message(block, &msg),
            Self::DeviceReady(conn) => hooks.device_ready(block, conn),
            Self::DeviceIdle(conn) => hooks.device_idle(block, conn),
            Self::ChangeMasterState { old, new } => hooks.change_master_state(block, old, new),
            Self::BopStateChanged { old, new } => hooks.bop_state_changed(block, old, new),
            Self::CentraldConnRunning(conn) => hooks.centrald_conn_running(block, conn),
            Self::CentraldConnBroken(conn) => hooks.centrald_conn_broken(block, conn),
            Self::ChildReturned(pid) => hooks.child_returned(block, pid),
            Self::ConnectionRemoved { conn, name } => hooks.connection_removed(block, conn, &name),
            Self::DeviceCallback { conn, callback } => hooks.device_callback(block, conn, &callback),
        }
    }
}

/// Application side of a [`Block`]
pub trait BlockHooks {
    /// Device client for a peer of the given type; `None` for no client.
    fn create_other_type(&mut self, _block: &mut Block, _conn: ConnId, device_type: DeviceType) -> Option<DevClient> {
        Some(DevClient::for_type(device_type))
    }

    /// Dial every newly announced device?
    fn will_connect(&mut self, _block: &mut Block, _address: &NetworkAddress) -> bool {
        false
    }

    /// `X <name> <op> <value>` from a peer.
    fn set_value(&mut self, block: &mut Block, conn: ConnId, name: &str, op: &str, value: &str) -> CommandReply {
        block.set_own_value(conn, name, op, value)
    }

    /// `status_info` from a peer.
    fn status_info(&mut self, _block: &mut Block, _conn: ConnId) -> CommandReply {
        CommandReply::Ok
    }

    /// `P <start> <end>` progress window from a peer.
    fn progress(&mut self, _block: &mut Block, _conn: ConnId, _start: f64, _end: f64) -> CommandReply {
        CommandReply::Silent
    }

    /// Any command the block itself does not know.
    fn command(&mut self, _block: &mut Block, _conn: ConnId, _command: &str, _params: &mut Params<'_>) -> CommandReply {
        CommandReply::Unknown
    }

    /// `auth <id> <num> <key>` from a peer: ask broker `centrald_num` to check the key.
    fn authorize(&mut self, block: &mut Block, conn: ConnId, centrald_num: i32) -> bool {
        block.authorize_peer(conn, centrald_num)
    }

    fn message(&mut self, _block: &mut Block, _message: &Message) {}

    fn device_ready(&mut self, _block: &mut Block, _conn: ConnId) {}

    fn device_idle(&mut self, _block: &mut Block, _conn: ConnId) {}

    fn change_master_state(&mut self, _block: &mut Block, _old: StatusWord, _new: StatusWord) {}

    fn bop_state_changed(&mut self, _block: &mut Block, _old: StatusWord, _new: StatusWord) {}

    fn centrald_conn_running(&mut self, _block: &mut Block, _conn: ConnId) {}

    fn centrald_conn_broken(&mut self, _block: &mut Block, _conn: ConnId) {}

    /// A child process was reaped.
    fn child_returned(&mut self, _block: &mut Block, _pid: i32) {}

    /// Veto the removal of a connection marked for deletion; it is retried next tick.
    fn can_delete_connection(&mut self, _block: &mut Block, _conn: ConnId) -> bool {
        true
    }

    fn connection_removed(&mut self, _block: &mut Block, _conn: ConnId, _name: &str) {}

    /// Device-class callback from a connection's device client.
    fn device_callback(&mut self, _block: &mut Block, _conn: ConnId, _callback: &DeviceCallback) {}
}

/// Hooks that keep every default
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl BlockHooks for NoHooks {}
