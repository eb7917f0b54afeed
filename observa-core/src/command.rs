//! Outbound requests and their reply continuations
//!
//! A [`Command`] is queued on one connection, sent when it reaches the head
//! of the queue and retired when the peer answers with a command return.
//! The reply is mapped onto a [`CommandOutcome`] plus a list of
//! [`CommandEffect`]s which the block applies; commands never reach into
//! other objects themselves.

use std::fmt;

use observa_protocol::messages::{
    COMMAND_CCD_EXPOSURE, COMMAND_DEVICE_STATUS, COMMAND_INFO, COMMAND_STATUS_INFO,
    COMMAND_TELD_MOVE, PROTO_SET_VALUE,
};
use observa_protocol::StatusWord;

use crate::connection::ConnId;
use crate::event::{CommandNotice, EventType, ObjectRef};

/// Send only while the masked BOP bits are set, instead of waiting for them to clear.
pub const BOP_WHILE_STATE: StatusWord = 0x0000_1000;

/// Call-in-progress sub-state, stored inside the BOP mask
pub const BOP_CIP_MASK: StatusWord = 0x0000_6000;
const CIP_NOT_CALLED: StatusWord = 0x0000_0000;
const CIP_WAIT: StatusWord = 0x0000_2000;
const CIP_RUN: StatusWord = 0x0000_4000;
const CIP_RETURN: StatusWord = 0x0000_6000;

/// Progress of the broker status round-trip a BOP-guarded command needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipState {
    /// Status not requested yet
    NotCalled,
    /// Status requested, waiting for its return
    Wait,
    /// Status known, waiting for the blocking bits to clear
    Run,
    /// Sent, waiting for the reply
    Return,
}

impl CipState {
    fn bits(self) -> StatusWord {
        match self {
            Self::NotCalled => CIP_NOT_CALLED,
            Self::Wait => CIP_WAIT,
            Self::Run => CIP_RUN,
            Self::Return => CIP_RETURN,
        }
    }

    fn from_bits(mask: StatusWord) -> Self {
        match mask & BOP_CIP_MASK {
            CIP_WAIT => Self::Wait,
            CIP_RUN => Self::Run,
            CIP_RETURN => Self::Return,
            _ => Self::NotCalled,
        }
    }
}

/// Step of the broker login exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    LoginSend,
    PasswordSend,
    InfoSend,
}

/// Mirror position requested by [`Command::mirror`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPos {
    A,
    B,
}

/// What a command is for; decides how its reply is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Plain,
    Login { step: LoginStep, password: String },
    Key,
    SendKey,
    Authorize,
    /// Broker-wide status request; `control` is resumed when it returns
    StatusInfo { control: Option<ConnId> },
    DeviceStatus { control: Option<ConnId> },
    Info,
    Exposure,
    Readout,
    Move,
    Change,
    Filter,
    ChangeFocus,
    SetFocus,
    Mirror,
    Integrate,
    CupolaNotMove,
    ChangeValue,
    MessageMask,
}

/// What the queue does with a command after its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Drop it and send the next one
    Retire,
    /// Leave it running
    Keep,
    /// Send the (rewritten) text again
    Requeue,
}

/// Device-class notification carried by a command reply.
///
/// The device client of the connection the command ran on maps it onto its
/// own callback, e.g. a failed filter command is a `FilterFailed` for a
/// camera but a `FilterMoveFailed` for a photometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandNote {
    ExposureOk,
    ExposureFailed(i32),
    FilterOk,
    FilterFailed(i32),
    MoveFailed(i32),
    FocusFailed(i32),
    MirrorFailed(i32),
    IntegrationFailed(i32),
    NotMoveFailed(i32),
    InfoOk,
    InfoFailed,
}

/// Side effect of a command reply, applied by the block.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEffect {
    /// Post a completion event to the originator
    Notify {
        target: ObjectRef,
        kind: EventType,
        notice: CommandNotice,
    },
    /// Resume a command waiting on a status round-trip
    UpdateStatusWait { control: ConnId },
    /// Device-class callback on the command's connection
    Device(CommandNote),
    /// The peer accepted our session key
    AuthOk,
    /// The peer rejected our session key
    AuthFailed,
}

/// Reply handling result
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReturn {
    pub outcome: CommandOutcome,
    pub effects: Vec<CommandEffect>,
}

/// An outbound request
#[derive(Debug, Clone)]
pub struct Command {
    text: String,
    kind: CommandKind,
    bop_mask: StatusWord,
    originator: Option<ObjectRef>,
    connection: Option<ConnId>,
}

impl Command {
    /// Plain command with literal text.
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_kind(CommandKind::Plain, text)
    }

    fn with_kind(kind: CommandKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
            bop_mask: 0,
            originator: None,
            connection: None,
        }
    }

    /// Broker login: `login`, then `password`, then `info`.
    pub fn login(login: &str, service: &str, password: &str) -> Self {
        Self::with_kind(
            CommandKind::Login {
                step: LoginStep::LoginSend,
                password: password.to_string(),
            },
            format!("login {} {}", login, service),
        )
    }

    /// Ask the broker for a session key to `device`.
    pub fn key(device: &str) -> Self {
        Self::with_kind(CommandKind::Key, format!("key {}", device))
    }

    /// Present a broker issued key to a device.
    pub fn send_key(centrald_id: i32, centrald_num: i32, key: i32) -> Self {
        Self::with_kind(
            CommandKind::SendKey,
            format!("auth {} {} {}", centrald_id, centrald_num, key),
        )
    }

    /// Ask the broker whether a client presented the right key.
    pub fn authorize(centrald_id: i32, key: i32) -> Self {
        Self::with_kind(
            CommandKind::Authorize,
            format!("authorize {} {}", centrald_id, key),
        )
    }

    pub fn status_info(control: Option<ConnId>) -> Self {
        Self::with_kind(CommandKind::StatusInfo { control }, COMMAND_STATUS_INFO)
    }

    pub fn device_status(control: Option<ConnId>) -> Self {
        Self::with_kind(CommandKind::DeviceStatus { control }, COMMAND_DEVICE_STATUS)
    }

    pub fn info() -> Self {
        Self::with_kind(CommandKind::Info, COMMAND_INFO)
    }

    pub fn exposure(bop_mask: StatusWord) -> Self {
        Self::with_kind(CommandKind::Exposure, COMMAND_CCD_EXPOSURE).with_bop_mask(bop_mask)
    }

    pub fn readout() -> Self {
        Self::with_kind(CommandKind::Readout, "readout")
    }

    pub fn move_to(ra: f64, dec: f64) -> Self {
        Self::with_kind(
            CommandKind::Move,
            format!("{} {:.6} {:.6}", COMMAND_TELD_MOVE, ra, dec),
        )
    }

    pub fn change(ra: f64, dec: f64) -> Self {
        Self::with_kind(CommandKind::Change, format!("change {:.6} {:.6}", ra, dec))
    }

    pub fn filter(filter: i32) -> Self {
        Self::with_kind(
            CommandKind::Filter,
            format!("{} filter = {}", PROTO_SET_VALUE, filter),
        )
    }

    pub fn change_focus(steps: i32) -> Self {
        Self::with_kind(
            CommandKind::ChangeFocus,
            format!("{} FOC_TOFFS += {}", PROTO_SET_VALUE, steps),
        )
    }

    pub fn set_focus(steps: i32) -> Self {
        Self::with_kind(CommandKind::SetFocus, format!("set {}", steps))
    }

    pub fn mirror(pos: MirrorPos) -> Self {
        let side = match pos {
            MirrorPos::A => "A",
            MirrorPos::B => "B",
        };
        Self::with_kind(CommandKind::Mirror, format!("set {}", side))
    }

    pub fn integrate(exposure: f64, count: i32) -> Self {
        Self::with_kind(
            CommandKind::Integrate,
            format!("integrate {:.6} {}", exposure, count),
        )
    }

    pub fn integrate_filter(filter: i32, exposure: f64, count: i32) -> Self {
        Self::with_kind(
            CommandKind::Integrate,
            format!("intfil {} {:.6} {}", filter, exposure, count),
        )
    }

    pub fn cupola_not_move() -> Self {
        Self::with_kind(CommandKind::CupolaNotMove, "stop")
    }

    /// `X <name> <op> <value>`, e.g. `X quick_enabled = 2`.
    pub fn change_value(name: &str, op: &str, value: impl fmt::Display) -> Self {
        Self::with_kind(
            CommandKind::ChangeValue,
            format!("{} {} {} {}", PROTO_SET_VALUE, name, op, value),
        )
    }

    pub fn message_mask(mask: i32) -> Self {
        Self::with_kind(CommandKind::MessageMask, format!("message_mask {}", mask))
    }

    pub fn with_bop_mask(mut self, mask: StatusWord) -> Self {
        self.bop_mask = mask;
        self
    }

    pub fn with_originator(mut self, originator: ObjectRef) -> Self {
        self.originator = Some(originator);
        self
    }

    /// Plain copy of the text and BOP mask, without originator or connection.
    pub fn duplicate(&self) -> Self {
        Self {
            text: self.text.clone(),
            kind: CommandKind::Plain,
            bop_mask: self.bop_mask,
            originator: None,
            connection: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Rewrite the text before a resend.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn bop_mask(&self) -> StatusWord {
        self.bop_mask
    }

    pub fn set_bop_mask(&mut self, mask: StatusWord) {
        self.bop_mask = mask;
    }

    pub fn cip(&self) -> CipState {
        CipState::from_bits(self.bop_mask)
    }

    pub fn set_cip(&mut self, state: CipState) {
        self.bop_mask = (self.bop_mask & !BOP_CIP_MASK) | state.bits();
    }

    pub fn originator(&self) -> Option<ObjectRef> {
        self.originator
    }

    pub fn set_originator(&mut self, originator: Option<ObjectRef>) {
        self.originator = originator;
    }

    pub fn is_originator(&self, originator: ObjectRef) -> bool {
        self.originator == Some(originator)
    }

    pub fn connection(&self) -> Option<ConnId> {
        self.connection
    }

    pub fn set_connection(&mut self, conn: ConnId) {
        self.connection = Some(conn);
    }

    /// Connection control for status requests
    pub fn control(&self) -> Option<ConnId> {
        match self.kind {
            CommandKind::StatusInfo { control } | CommandKind::DeviceStatus { control } => control,
            _ => None,
        }
    }

    /// Forget every reference to a connection that is going away.
    pub fn delete_connection(&mut self, conn: ConnId) {
        if self.originator == Some(ObjectRef::Connection(conn)) {
            self.originator = None;
        }
        if let CommandKind::StatusInfo { control } | CommandKind::DeviceStatus { control } =
            &mut self.kind
        {
            if *control == Some(conn) {
                *control = None;
            }
        }
    }

    /// Interpret the status code of a command return.
    ///
    /// `0` is success, `1` means the peer queued the request (reported as
    /// success), anything else is a failure.
    pub fn command_return(&mut self, status: i32) -> CommandReturn {
        match status {
            0 | 1 => self.return_ok(status),
            _ => self.return_failed(status),
        }
    }

    fn notify(&self, kind: EventType, status: i32) -> Option<CommandEffect> {
        self.originator.map(|target| CommandEffect::Notify {
            target,
            kind,
            notice: CommandNotice {
                text: self.text.clone(),
                conn: self.connection,
                status,
            },
        })
    }

    fn retire_with(&self, kind: EventType, status: i32, mut effects: Vec<CommandEffect>) -> CommandReturn {
        effects.extend(self.notify(kind, status));
        CommandReturn {
            outcome: CommandOutcome::Retire,
            effects,
        }
    }

    fn return_ok(&mut self, status: i32) -> CommandReturn {
        let mut effects = Vec::new();
        match &mut self.kind {
            CommandKind::Login { step, password } => {
                let next = match step {
                    LoginStep::LoginSend => Some((LoginStep::PasswordSend, format!("password {}", password))),
                    LoginStep::PasswordSend => Some((LoginStep::InfoSend, COMMAND_INFO.to_string())),
                    LoginStep::InfoSend => None,
                };
                if let Some((next_step, text)) = next {
                    *step = next_step;
                    self.text = text;
                    return CommandReturn {
                        outcome: CommandOutcome::Requeue,
                        effects,
                    };
                }
            }
            CommandKind::StatusInfo { control } | CommandKind::DeviceStatus { control } => {
                if let Some(control) = *control {
                    effects.push(CommandEffect::UpdateStatusWait { control });
                }
            }
            CommandKind::SendKey => effects.push(CommandEffect::AuthOk),
            CommandKind::Exposure => effects.push(CommandEffect::Device(CommandNote::ExposureOk)),
            CommandKind::Filter => effects.push(CommandEffect::Device(CommandNote::FilterOk)),
            CommandKind::Info => effects.push(CommandEffect::Device(CommandNote::InfoOk)),
            _ => {}
        }
        self.retire_with(EventType::COMMAND_OK, status, effects)
    }

    fn return_failed(&mut self, status: i32) -> CommandReturn {
        let note = match self.kind {
            CommandKind::StatusInfo { control } | CommandKind::DeviceStatus { control } => {
                // status requests resume their waiter even when they fail
                let effects = control
                    .map(|control| CommandEffect::UpdateStatusWait { control })
                    .into_iter()
                    .collect();
                return self.retire_with(EventType::COMMAND_OK, status, effects);
            }
            CommandKind::Authorize => {
                tracing::error!(command = %self.text, status, "authorization request failed");
                None
            }
            CommandKind::SendKey => {
                let mut ret = self.retire_with(EventType::COMMAND_FAILED, status, Vec::new());
                ret.effects.insert(0, CommandEffect::AuthFailed);
                return ret;
            }
            CommandKind::Exposure => Some(CommandNote::ExposureFailed(status)),
            CommandKind::Filter => Some(CommandNote::FilterFailed(status)),
            CommandKind::Move | CommandKind::Change => Some(CommandNote::MoveFailed(status)),
            CommandKind::ChangeFocus | CommandKind::SetFocus => Some(CommandNote::FocusFailed(status)),
            CommandKind::Mirror => Some(CommandNote::MirrorFailed(status)),
            CommandKind::Integrate => Some(CommandNote::IntegrationFailed(status)),
            CommandKind::CupolaNotMove => Some(CommandNote::NotMoveFailed(status)),
            CommandKind::Info => Some(CommandNote::InfoFailed),
            _ => None,
        };
        let effects = note.map(CommandEffect::Device).into_iter().collect();
        self.retire_with(EventType::COMMAND_FAILED, status, effects)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_kinds(ret: &CommandReturn) -> Vec<EventType> {
        ret.effects
            .iter()
            .filter_map(|e| match e {
                CommandEffect::Notify { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    // ==================== Text Tests ====================

    #[test]
    fn test_command_texts() {
        assert_eq!(Command::key("C0").text(), "key C0");
        assert_eq!(Command::send_key(7, 0, 1234).text(), "auth 7 0 1234");
        assert_eq!(Command::authorize(7, 1234).text(), "authorize 7 1234");
        assert_eq!(Command::move_to(10.5, -20.25).text(), "move 10.500000 -20.250000");
        assert_eq!(Command::filter(3).text(), "X filter = 3");
        assert_eq!(Command::change_focus(-15).text(), "X FOC_TOFFS += -15");
        assert_eq!(Command::mirror(MirrorPos::B).text(), "set B");
        assert_eq!(Command::integrate_filter(2, 1.5, 10).text(), "intfil 2 1.500000 10");
        assert_eq!(Command::change_value("quick_enabled", "=", 2).text(), "X quick_enabled = 2");
        assert_eq!(Command::message_mask(3).text(), "message_mask 3");
    }

    // ==================== CIP Tests ====================

    #[test]
    fn test_cip_state_lives_inside_bop_mask() {
        let mut cmd = Command::exposure(observa_protocol::status::BOP_EXPOSURE);
        assert_eq!(cmd.cip(), CipState::NotCalled);

        cmd.set_cip(CipState::Run);
        assert_eq!(cmd.cip(), CipState::Run);
        assert_eq!(cmd.bop_mask() & observa_protocol::status::BOP_EXPOSURE, observa_protocol::status::BOP_EXPOSURE);

        cmd.set_cip(CipState::Return);
        cmd.set_cip(CipState::Wait);
        assert_eq!(cmd.cip(), CipState::Wait);
    }

    #[test]
    fn test_duplicate_drops_originator() {
        let cmd = Command::exposure(0x0100_0000).with_originator(ObjectRef::Block);
        let copy = cmd.duplicate();
        assert_eq!(copy.text(), "expose");
        assert_eq!(copy.bop_mask(), 0x0100_0000);
        assert!(copy.originator().is_none());
        assert_eq!(copy.kind(), &CommandKind::Plain);
    }

    // ==================== Return Tests ====================

    #[test]
    fn test_plain_ok_retires_and_notifies_once() {
        let mut cmd = Command::new("ping").with_originator(ObjectRef::Block);
        let ret = cmd.command_return(0);
        assert_eq!(ret.outcome, CommandOutcome::Retire);
        assert_eq!(notify_kinds(&ret), vec![EventType::COMMAND_OK]);
    }

    #[test]
    fn test_queued_reports_single_ok() {
        let mut cmd = Command::new("ping").with_originator(ObjectRef::Block);
        let ret = cmd.command_return(1);
        assert_eq!(ret.outcome, CommandOutcome::Retire);
        assert_eq!(notify_kinds(&ret), vec![EventType::COMMAND_OK]);
    }

    #[test]
    fn test_failure_without_originator_has_no_notify() {
        let mut cmd = Command::new("ping");
        let ret = cmd.command_return(-3);
        assert_eq!(ret.outcome, CommandOutcome::Retire);
        assert!(ret.effects.is_empty());
    }

    #[test]
    fn test_login_three_oks_finish() {
        let mut cmd = Command::login("petr", "monitor", "secret").with_originator(ObjectRef::Block);
        assert_eq!(cmd.text(), "login petr monitor");

        let ret = cmd.command_return(0);
        assert_eq!(ret.outcome, CommandOutcome::Requeue);
        assert!(ret.effects.is_empty());
        assert_eq!(cmd.text(), "password secret");

        let ret = cmd.command_return(0);
        assert_eq!(ret.outcome, CommandOutcome::Requeue);
        assert_eq!(cmd.text(), "info");

        let ret = cmd.command_return(0);
        assert_eq!(ret.outcome, CommandOutcome::Retire);
        assert_eq!(notify_kinds(&ret), vec![EventType::COMMAND_OK]);
    }

    #[test]
    fn test_login_failure_at_any_step_terminates() {
        for oks in 0..3 {
            let mut cmd = Command::login("petr", "monitor", "secret").with_originator(ObjectRef::Block);
            for _ in 0..oks {
                assert_eq!(cmd.command_return(0).outcome, CommandOutcome::Requeue);
            }
            let ret = cmd.command_return(-1);
            assert_eq!(ret.outcome, CommandOutcome::Retire);
            assert_eq!(notify_kinds(&ret), vec![EventType::COMMAND_FAILED]);
        }
    }

    #[test]
    fn test_status_info_failure_retires_as_ok() {
        let control = ConnId::new(4);
        let mut cmd = Command::device_status(Some(control)).with_originator(ObjectRef::Block);
        let ret = cmd.command_return(-5);
        assert_eq!(ret.outcome, CommandOutcome::Retire);
        assert_eq!(ret.effects[0], CommandEffect::UpdateStatusWait { control });
        assert_eq!(notify_kinds(&ret), vec![EventType::COMMAND_OK]);
    }

    #[test]
    fn test_send_key_maps_to_auth_effects() {
        let mut cmd = Command::send_key(1, 0, 99);
        assert_eq!(cmd.command_return(0).effects, vec![CommandEffect::AuthOk]);
        let mut cmd = Command::send_key(1, 0, 99);
        assert_eq!(cmd.command_return(-5).effects, vec![CommandEffect::AuthFailed]);
    }

    #[test]
    fn test_device_notes_on_failure() {
        let cases = [
            (Command::exposure(0), CommandNote::ExposureFailed(-4)),
            (Command::move_to(1.0, 2.0), CommandNote::MoveFailed(-4)),
            (Command::change(1.0, 2.0), CommandNote::MoveFailed(-4)),
            (Command::set_focus(100), CommandNote::FocusFailed(-4)),
            (Command::mirror(MirrorPos::A), CommandNote::MirrorFailed(-4)),
            (Command::integrate(1.0, 5), CommandNote::IntegrationFailed(-4)),
            (Command::cupola_not_move(), CommandNote::NotMoveFailed(-4)),
            (Command::info(), CommandNote::InfoFailed),
        ];
        for (mut cmd, note) in cases {
            let ret = cmd.command_return(-4);
            assert_eq!(ret.effects, vec![CommandEffect::Device(note)], "{}", cmd);
        }
    }

    // ==================== Reference Tests ====================

    #[test]
    fn test_delete_connection_clears_references() {
        let gone = ConnId::new(2);
        let kept = ConnId::new(3);

        let mut cmd = Command::status_info(Some(gone)).with_originator(ObjectRef::Connection(gone));
        cmd.delete_connection(kept);
        assert_eq!(cmd.control(), Some(gone));

        cmd.delete_connection(gone);
        assert_eq!(cmd.control(), None);
        assert_eq!(cmd.originator(), None);

        // nothing left to resume
        let ret = cmd.command_return(0);
        assert!(ret.effects.is_empty());
    }
}
