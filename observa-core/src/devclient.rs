//! Device-class adapters
//!
//! Every connection to a device carries a [`DevClient`]. It watches the
//! parts of the device state word that matter for its class and turns
//! transitions into [`DeviceCallback`]s: exactly one of a started/ended or
//! ended/failed pair per transition, picked by the connection's error bits.
//!
//! The adapter never touches the block directly. Callbacks and requests are
//! collected as [`DevEffect`]s and drained by the block after each call.

use bytes::Bytes;
use observa_protocol::status::*;
use observa_protocol::{DeviceType, ServerState};

use crate::command::{Command, CommandNote};
use crate::connection::values::ValueTable;
use crate::connection::ConnId;
use crate::event::{Event, EventType};

/// Move-wait bookkeeping shared by all classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitState {
    #[default]
    NotWaiting,
    WaitMove,
    /// This device is busy and prevents the others from entering the move wait
    WaitNotPossible,
}

/// Device-class callback delivered to [`crate::BlockHooks::device_callback`]
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCallback {
    // camera
    ExposureStarted { expect_image: bool },
    ExposureEnd { expect_image: bool },
    ExposureFailed(i32),
    ExposureCommandOk,
    ReadoutEnd,
    FilterOk,
    FilterFailed(i32),
    FocuserFailed(i32),

    // mount and mirror
    MoveStart { correcting: bool },
    MoveEnd,
    MoveFailed(i32),
    MirrorA,
    MirrorB,

    // cupola
    SyncStarted,
    SyncEnded,
    SyncFailed(StatusWord),
    NotMoveFailed(i32),

    // focuser
    FocusingStart,
    FocusingEnd,
    FocusingFailed(i32),

    // photometer and filter wheel
    IntegrationStart,
    IntegrationEnd,
    IntegrationFailed(i32),
    CountAdded { count: i64, exposure: f64, is_ov: bool },
    FilterMoveStart,
    FilterMoveEnd,
    FilterMoveFailed(i32),

    // executor
    LastReadout,

    // any class
    InfoOk,
    InfoFailed,
    CommandReturn { text: String, status: i32 },
    ValueChanged { name: String },
    NewDataConn { data_conn: i32 },
    DataReceived { data_conn: i32, channel: usize, size: usize },
    FullDataReceived { data_conn: i32, channels: Vec<Bytes> },
    FitsData { path: String },
    ConnectionDeleted { conn: ConnId },
}

/// Work a device client asks the block to do
#[derive(Debug, Clone)]
pub enum DevEffect {
    Callback(DeviceCallback),
    /// The client left `WaitNotPossible`; query the others and maybe enter the wait
    Unblocked,
    /// Queue a command on the client's own connection
    Que(Command),
}

/// Per-class state
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceClass {
    Generic,
    Camera { last_expect_image: bool },
    Telescope { move_was_correcting: bool },
    Dome,
    Cupola,
    Mirror,
    Focus,
    Phot { last_count: i64, last_exposure: f64, integrating: bool },
    Filter,
    Executor,
    Selector,
    Imgproc,
    Grb,
    Bb,
    AugerShooter,
    Rotator,
    Sensor,
}

impl DeviceClass {
    /// Class matching an announced device type
    pub fn for_type(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Mount => Self::Telescope {
                move_was_correcting: false,
            },
            DeviceType::Ccd => Self::Camera {
                last_expect_image: false,
            },
            DeviceType::Dome => Self::Dome,
            DeviceType::Cupola => Self::Cupola,
            DeviceType::Mirror => Self::Mirror,
            DeviceType::Focus => Self::Focus,
            DeviceType::Phot => Self::Phot {
                last_count: -1,
                last_exposure: -1.0,
                integrating: false,
            },
            DeviceType::FilterWheel => Self::Filter,
            DeviceType::Executor => Self::Executor,
            DeviceType::Selector => Self::Selector,
            DeviceType::Imgproc => Self::Imgproc,
            DeviceType::Grb => Self::Grb,
            DeviceType::Bb => Self::Bb,
            DeviceType::AugerShooter => Self::AugerShooter,
            DeviceType::Rotator => Self::Rotator,
            DeviceType::Sensor | DeviceType::Weather => Self::Sensor,
            _ => Self::Generic,
        }
    }
}

/// Consumer-side adapter for one device connection
#[derive(Debug, Clone)]
pub struct DevClient {
    class: DeviceClass,
    processed_base_info: bool,
    wait: WaitState,
    failed_count: u32,
    effects: Vec<DevEffect>,
}

impl DevClient {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            class,
            processed_base_info: false,
            wait: WaitState::NotWaiting,
            failed_count: 0,
            effects: Vec::new(),
        }
    }

    pub fn for_type(device_type: DeviceType) -> Self {
        Self::new(DeviceClass::for_type(device_type))
    }

    pub fn class(&self) -> &DeviceClass {
        &self.class
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    pub fn processed_base_info(&self) -> bool {
        self.processed_base_info
    }

    pub fn set_processed_base_info(&mut self, processed: bool) {
        self.processed_base_info = processed;
    }

    /// Take everything queued since the last drain.
    pub fn drain_effects(&mut self) -> Vec<DevEffect> {
        std::mem::take(&mut self.effects)
    }

    fn emit(&mut self, callback: DeviceCallback) {
        self.effects.push(DevEffect::Callback(callback));
    }

    // ==================== Waits ====================

    pub fn wait_state(&self) -> WaitState {
        self.wait
    }

    pub fn is_wait_move(&self) -> bool {
        self.wait == WaitState::WaitMove
    }

    pub fn block_wait(&mut self) {
        self.wait = WaitState::WaitNotPossible;
    }

    /// Release a block; the block then asks whether everyone may wait.
    pub fn unblock_wait(&mut self) {
        if self.wait == WaitState::WaitNotPossible {
            self.wait = WaitState::NotWaiting;
            self.effects.push(DevEffect::Unblocked);
        }
    }

    pub fn clear_wait(&mut self) {
        self.wait = WaitState::NotWaiting;
    }

    pub fn unset_wait(&mut self) {
        self.unblock_wait();
        self.clear_wait();
    }

    pub fn set_wait_move(&mut self) {
        if self.wait == WaitState::NotWaiting {
            self.wait = WaitState::WaitMove;
        }
    }

    // ==================== Events ====================

    /// React to an event broadcast to the connection. Events are never consumed here.
    pub fn post_event(&mut self, event: &mut Event) {
        match event.kind() {
            EventType::QUERY_WAIT => {
                if self.wait == WaitState::WaitNotPossible {
                    event.increment_count();
                }
            }
            EventType::ENTER_WAIT => self.wait = WaitState::WaitMove,
            EventType::CLEAR_WAIT => self.clear_wait(),
            EventType::QUICK_ENABLE => {
                if let (DeviceClass::Telescope { .. }, Some(enabled)) = (&self.class, event.flag()) {
                    let value = if enabled { 2 } else { 1 };
                    self.effects
                        .push(DevEffect::Que(Command::change_value("quick_enabled", "=", value)));
                }
            }
            _ => {}
        }
    }

    // ==================== State ====================

    /// The device state word changed.
    pub fn state_changed(&mut self, state: &ServerState) {
        let value = state.value();
        let error = state.error_state();
        let failed = error as i32;

        match &mut self.class {
            DeviceClass::Camera { last_expect_image } => {
                let mut out = Vec::new();
                if state.mask_changed(CAM_MASK_EXPOSE) {
                    match value & CAM_MASK_EXPOSE {
                        CAM_EXPOSING | CAM_EXPOSING_NOIM if value & DEVICE_SC_CURR != 0 => {
                            *last_expect_image = value & CAM_EXPOSING != 0;
                            out.push(if error == DEVICE_NO_ERROR {
                                DeviceCallback::ExposureStarted {
                                    expect_image: *last_expect_image,
                                }
                            } else {
                                DeviceCallback::ExposureFailed(failed)
                            });
                        }
                        CAM_NOEXPOSURE => out.push(if error == DEVICE_NO_ERROR {
                            DeviceCallback::ExposureEnd {
                                expect_image: *last_expect_image,
                            }
                        } else {
                            DeviceCallback::ExposureFailed(failed)
                        }),
                        _ => {}
                    }
                } else if state.mask_changed(CAM_MASK_FT) {
                    match value & CAM_MASK_FT {
                        CAM_FT => out.push(DeviceCallback::ExposureEnd {
                            expect_image: *last_expect_image,
                        }),
                        CAM_NOFT if value & DEVICE_SC_CURR != 0 => out.push(DeviceCallback::ExposureStarted {
                            expect_image: *last_expect_image,
                        }),
                        _ => {}
                    }
                }
                if state.mask_changed(CAM_MASK_READING) && value & CAM_MASK_READING == CAM_NOTREADING {
                    out.push(if error == DEVICE_NO_ERROR {
                        DeviceCallback::ReadoutEnd
                    } else {
                        DeviceCallback::ExposureFailed(failed)
                    });
                }
                out.into_iter().for_each(|cb| self.emit(cb));
            }
            DeviceClass::Telescope { move_was_correcting } => {
                let mut out = Vec::new();
                if state.mask_changed(TEL_MASK_CUP_MOVING) {
                    match value & TEL_MASK_CUP_MOVING {
                        TEL_MOVING | TEL_PARKING => {
                            *move_was_correcting = value & TEL_CORRECTING != 0;
                            out.push(DeviceCallback::MoveStart {
                                correcting: *move_was_correcting,
                            });
                        }
                        v if v == TEL_MOVING | TEL_WAIT_CUP => {
                            *move_was_correcting = value & TEL_CORRECTING != 0;
                            out.push(DeviceCallback::MoveStart {
                                correcting: *move_was_correcting,
                            });
                        }
                        TEL_OBSERVING | TEL_PARKED => {
                            *move_was_correcting = false;
                            out.push(if error == DEVICE_NO_ERROR {
                                DeviceCallback::MoveEnd
                            } else {
                                DeviceCallback::MoveFailed(failed)
                            });
                        }
                        _ => {}
                    }
                }
                if state.mask_changed(DEVICE_ERROR_KILL) && error & DEVICE_ERROR_KILL != 0 {
                    out.push(DeviceCallback::MoveFailed(failed));
                }
                out.into_iter().for_each(|cb| self.emit(cb));
            }
            DeviceClass::Cupola => {
                if state.mask_changed(DOME_CUP_MASK_SYNC) || state.mask_changed(DEVICE_ERROR_MASK) {
                    let cb = if error != DEVICE_NO_ERROR {
                        DeviceCallback::SyncFailed(value)
                    } else if value & DOME_CUP_MASK_SYNC == DOME_CUP_SYNC {
                        DeviceCallback::SyncEnded
                    } else {
                        DeviceCallback::SyncStarted
                    };
                    self.emit(cb);
                }
            }
            DeviceClass::Mirror => {
                let cb = if error != DEVICE_NO_ERROR {
                    Some(DeviceCallback::MoveFailed(failed))
                } else {
                    match value & MIRROR_MASK {
                        MIRROR_A => Some(DeviceCallback::MirrorA),
                        MIRROR_B => Some(DeviceCallback::MirrorB),
                        MIRROR_UNKNOWN => Some(DeviceCallback::MoveFailed(DEVICE_ERROR_HW as i32)),
                        _ => None,
                    }
                };
                if let Some(cb) = cb {
                    self.emit(cb);
                }
            }
            DeviceClass::Focus => {
                if state.mask_changed(FOC_MASK_FOCUSING) {
                    let cb = match value & FOC_MASK_FOCUSING {
                        FOC_FOCUSING => DeviceCallback::FocusingStart,
                        _ if error == DEVICE_NO_ERROR => DeviceCallback::FocusingEnd,
                        _ => DeviceCallback::FocusingFailed(failed),
                    };
                    self.emit(cb);
                }
            }
            DeviceClass::Phot { integrating, .. } => {
                let mut out = Vec::new();
                if state.mask_changed(PHOT_MASK_INTEGRATE) {
                    if value & PHOT_MASK_INTEGRATE == PHOT_INTEGRATE {
                        *integrating = true;
                        out.push(DeviceCallback::IntegrationStart);
                    } else {
                        *integrating = false;
                        out.push(if error == DEVICE_NO_ERROR {
                            DeviceCallback::IntegrationEnd
                        } else {
                            DeviceCallback::IntegrationFailed(failed)
                        });
                    }
                }
                if state.mask_changed(PHOT_MASK_FILTER) {
                    out.push(filter_transition(value & PHOT_MASK_FILTER == PHOT_FILTER_MOVE, error));
                }
                out.into_iter().for_each(|cb| self.emit(cb));
            }
            DeviceClass::Filter => {
                if state.mask_changed(FILTERD_MASK) {
                    let cb = filter_transition(value & FILTERD_MASK == FILTERD_MOVE, error);
                    self.emit(cb);
                }
            }
            DeviceClass::Executor => {
                if state.mask_changed(EXEC_STATE_MASK) && value & EXEC_STATE_MASK == EXEC_LASTREAD {
                    self.emit(DeviceCallback::LastReadout);
                }
            }
            _ => {}
        }

        if error == DEVICE_ERROR_HW {
            self.failed_count += 1;
        }
    }

    /// A value on the connection was updated.
    pub fn value_changed(&mut self, name: &str, values: &ValueTable) {
        if let DeviceClass::Phot {
            last_count,
            last_exposure,
            ..
        } = &mut self.class
        {
            if name == "count" {
                let count = values.get("count").and_then(|v| v.as_integer());
                let exposure = values.get("exposure").map(|v| v.as_double());
                let is_ov = values.get("is_ov").and_then(|v| v.as_bool());
                if let (Some(count), Some(exposure), Some(is_ov)) = (count, exposure, is_ov) {
                    *last_count = count;
                    *last_exposure = exposure;
                    self.effects.push(DevEffect::Callback(DeviceCallback::CountAdded {
                        count,
                        exposure,
                        is_ov,
                    }));
                }
            }
        }
        self.emit(DeviceCallback::ValueChanged {
            name: name.to_string(),
        });
    }

    /// Map a command reply note onto this class's callback.
    pub fn command_note(&mut self, note: CommandNote) {
        let cb = match (&self.class, note) {
            (DeviceClass::Camera { .. }, CommandNote::ExposureOk) => Some(DeviceCallback::ExposureCommandOk),
            (DeviceClass::Camera { .. }, CommandNote::ExposureFailed(s)) => Some(DeviceCallback::ExposureFailed(s)),
            (DeviceClass::Camera { .. }, CommandNote::FilterFailed(s)) => Some(DeviceCallback::FilterFailed(s)),
            (DeviceClass::Camera { .. }, CommandNote::FocusFailed(s)) => Some(DeviceCallback::FocuserFailed(s)),
            (DeviceClass::Phot { .. } | DeviceClass::Filter, CommandNote::FilterFailed(s)) => {
                Some(DeviceCallback::FilterMoveFailed(s))
            }
            (DeviceClass::Camera { .. } | DeviceClass::Phot { .. } | DeviceClass::Filter, CommandNote::FilterOk) => {
                Some(DeviceCallback::FilterOk)
            }
            (DeviceClass::Telescope { .. }, CommandNote::MoveFailed(s)) => Some(DeviceCallback::MoveFailed(s)),
            (DeviceClass::Mirror, CommandNote::MirrorFailed(s)) => Some(DeviceCallback::MoveFailed(s)),
            (DeviceClass::Focus, CommandNote::FocusFailed(s)) => Some(DeviceCallback::FocusingFailed(s)),
            (DeviceClass::Phot { .. }, CommandNote::IntegrationFailed(s)) => {
                Some(DeviceCallback::IntegrationFailed(s))
            }
            (DeviceClass::Cupola, CommandNote::NotMoveFailed(s)) => Some(DeviceCallback::NotMoveFailed(s)),
            (_, CommandNote::InfoOk) => Some(DeviceCallback::InfoOk),
            (_, CommandNote::InfoFailed) => Some(DeviceCallback::InfoFailed),
            _ => None,
        };
        if let DeviceClass::Phot { integrating, .. } = &mut self.class {
            if matches!(cb, Some(DeviceCallback::IntegrationFailed(_))) {
                *integrating = false;
            }
        }
        if let Some(cb) = cb {
            self.emit(cb);
        }
    }

    pub fn command_return(&mut self, text: &str, status: i32) {
        self.emit(DeviceCallback::CommandReturn {
            text: text.to_string(),
            status,
        });
    }

    pub fn new_data_conn(&mut self, data_conn: i32) {
        self.emit(DeviceCallback::NewDataConn { data_conn });
    }

    pub fn data_received(&mut self, data_conn: i32, channel: usize, size: usize) {
        self.emit(DeviceCallback::DataReceived {
            data_conn,
            channel,
            size,
        });
    }

    pub fn full_data_received(&mut self, data_conn: i32, channels: Vec<Bytes>) {
        self.emit(DeviceCallback::FullDataReceived { data_conn, channels });
    }

    pub fn fits_data(&mut self, path: &str) {
        self.emit(DeviceCallback::FitsData {
            path: path.to_string(),
        });
    }

    /// Another connection is being deleted.
    pub fn delete_connection(&mut self, conn: ConnId) {
        self.emit(DeviceCallback::ConnectionDeleted { conn });
    }

    /// The connection is going away: fail whatever may still be pending and
    /// release a held wait.
    pub fn retire(&mut self) {
        let hw = DEVICE_ERROR_HW as i32;
        let cb = match &mut self.class {
            DeviceClass::Telescope { .. } | DeviceClass::Mirror => Some(DeviceCallback::MoveFailed(hw)),
            DeviceClass::Focus => Some(DeviceCallback::FocusingFailed(hw)),
            DeviceClass::Phot { integrating, .. } => {
                *integrating = false;
                Some(DeviceCallback::IntegrationFailed(hw))
            }
            _ => None,
        };
        if let Some(cb) = cb {
            self.emit(cb);
        }
        self.unblock_wait();
    }

    // ==================== Class Queries ====================

    /// Camera neither exposing nor reading out
    pub fn is_camera_idle(&self, state: StatusWord) -> bool {
        matches!(self.class, DeviceClass::Camera { .. })
            && state & (CAM_MASK_EXPOSE | CAM_MASK_READING) == CAM_NOEXPOSURE | CAM_NOTREADING
    }

    pub fn is_exposing(&self, state: StatusWord) -> bool {
        matches!(self.class, DeviceClass::Camera { .. }) && state & CAM_MASK_EXPOSE == CAM_EXPOSING
    }

    pub fn is_integrating(&self) -> bool {
        matches!(self.class, DeviceClass::Phot { integrating: true, .. })
    }

    pub fn move_was_correcting(&self) -> bool {
        matches!(
            self.class,
            DeviceClass::Telescope {
                move_was_correcting: true
            }
        )
    }
}

fn filter_transition(moving: bool, error: StatusWord) -> DeviceCallback {
    if moving {
        DeviceCallback::FilterMoveStart
    } else if error == DEVICE_NO_ERROR {
        DeviceCallback::FilterMoveEnd
    } else {
        DeviceCallback::FilterMoveFailed(error as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use observa_protocol::messages::{VALUE_BOOL, VALUE_DOUBLE, VALUE_INTEGER};
    use observa_protocol::Params;

    fn callbacks(client: &mut DevClient) -> Vec<DeviceCallback> {
        client
            .drain_effects()
            .into_iter()
            .filter_map(|e| match e {
                DevEffect::Callback(cb) => Some(cb),
                _ => None,
            })
            .collect()
    }

    fn step(client: &mut DevClient, state: &mut ServerState, value: StatusWord) -> Vec<DeviceCallback> {
        state.set_value(value);
        client.state_changed(state);
        callbacks(client)
    }

    // ==================== Camera Tests ====================

    #[test]
    fn test_camera_exposure_cycle() {
        let mut cam = DevClient::for_type(DeviceType::Ccd);
        let mut state = ServerState::new(0);

        assert_eq!(
            step(&mut cam, &mut state, CAM_EXPOSING | DEVICE_SC_CURR),
            vec![DeviceCallback::ExposureStarted { expect_image: true }]
        );
        assert_eq!(
            step(&mut cam, &mut state, CAM_READING),
            vec![DeviceCallback::ExposureEnd { expect_image: true }]
        );
        assert_eq!(step(&mut cam, &mut state, CAM_NOTREADING), vec![DeviceCallback::ReadoutEnd]);
    }

    #[test]
    fn test_camera_ignores_exposure_started_by_others() {
        let mut cam = DevClient::for_type(DeviceType::Ccd);
        let mut state = ServerState::new(0);
        assert!(step(&mut cam, &mut state, CAM_EXPOSING).is_empty());
    }

    #[test]
    fn test_camera_error_fails_exposure_and_counts() {
        let mut cam = DevClient::for_type(DeviceType::Ccd);
        let mut state = ServerState::new(CAM_EXPOSING);
        assert_eq!(
            step(&mut cam, &mut state, CAM_NOEXPOSURE | DEVICE_ERROR_HW),
            vec![DeviceCallback::ExposureFailed(DEVICE_ERROR_HW as i32)]
        );
        assert_eq!(cam.failed_count(), 1);
    }

    // ==================== Telescope Tests ====================

    #[test]
    fn test_telescope_move_pairs() {
        let mut tel = DevClient::for_type(DeviceType::Mount);
        let mut state = ServerState::new(TEL_OBSERVING);

        assert_eq!(
            step(&mut tel, &mut state, TEL_MOVING | TEL_CORRECTING),
            vec![DeviceCallback::MoveStart { correcting: true }]
        );
        assert!(tel.move_was_correcting());
        assert_eq!(step(&mut tel, &mut state, TEL_OBSERVING), vec![DeviceCallback::MoveEnd]);
        assert!(!tel.move_was_correcting());

        step(&mut tel, &mut state, TEL_MOVING | TEL_WAIT_CUP);
        assert_eq!(
            step(&mut tel, &mut state, TEL_PARKED | DEVICE_ERROR_HW),
            vec![DeviceCallback::MoveFailed(DEVICE_ERROR_HW as i32)]
        );
    }

    #[test]
    fn test_telescope_kill_fails_move() {
        let mut tel = DevClient::for_type(DeviceType::Mount);
        let mut state = ServerState::new(TEL_MOVING);
        assert_eq!(
            step(&mut tel, &mut state, TEL_MOVING | DEVICE_ERROR_KILL),
            vec![DeviceCallback::MoveFailed(DEVICE_ERROR_KILL as i32)]
        );
    }

    #[test]
    fn test_quick_enable_queues_change_value() {
        let mut tel = DevClient::for_type(DeviceType::Mount);
        let mut event = Event::with_payload(EventType::QUICK_ENABLE, EventPayload::Flag(false));
        tel.post_event(&mut event);
        match tel.drain_effects().as_slice() {
            [DevEffect::Que(cmd)] => assert_eq!(cmd.text(), "X quick_enabled = 1"),
            other => panic!("unexpected effects {:?}", other),
        }

        let mut cam = DevClient::for_type(DeviceType::Ccd);
        cam.post_event(&mut event);
        assert!(cam.drain_effects().is_empty());
    }

    // ==================== Other Class Tests ====================

    #[test]
    fn test_mirror_positions() {
        let mut mirror = DevClient::for_type(DeviceType::Mirror);
        let mut state = ServerState::new(MIRROR_A_B);
        assert_eq!(step(&mut mirror, &mut state, MIRROR_B), vec![DeviceCallback::MirrorB]);
        assert_eq!(
            step(&mut mirror, &mut state, MIRROR_UNKNOWN),
            vec![DeviceCallback::MoveFailed(DEVICE_ERROR_HW as i32)]
        );
    }

    #[test]
    fn test_cupola_sync() {
        let mut cupola = DevClient::for_type(DeviceType::Cupola);
        let mut state = ServerState::new(DOME_CUP_SYNC);
        assert_eq!(step(&mut cupola, &mut state, DOME_CUP_NOT_SYNC), vec![DeviceCallback::SyncStarted]);
        assert!(step(&mut cupola, &mut state, DOME_CUP_NOT_SYNC).is_empty());
        assert_eq!(step(&mut cupola, &mut state, DOME_CUP_SYNC), vec![DeviceCallback::SyncEnded]);
    }

    #[test]
    fn test_focus_and_filter() {
        let mut focus = DevClient::for_type(DeviceType::Focus);
        let mut state = ServerState::new(FOC_SLEEPING);
        assert_eq!(step(&mut focus, &mut state, FOC_FOCUSING), vec![DeviceCallback::FocusingStart]);
        assert_eq!(step(&mut focus, &mut state, FOC_SLEEPING), vec![DeviceCallback::FocusingEnd]);

        let mut filter = DevClient::for_type(DeviceType::FilterWheel);
        let mut state = ServerState::new(FILTERD_IDLE);
        assert_eq!(step(&mut filter, &mut state, FILTERD_MOVE), vec![DeviceCallback::FilterMoveStart]);
        assert_eq!(
            step(&mut filter, &mut state, FILTERD_IDLE | DEVICE_ERROR_HW),
            vec![DeviceCallback::FilterMoveFailed(DEVICE_ERROR_HW as i32)]
        );
    }

    #[test]
    fn test_phot_integration_and_count() {
        let mut phot = DevClient::for_type(DeviceType::Phot);
        let mut state = ServerState::new(0);
        assert_eq!(step(&mut phot, &mut state, PHOT_INTEGRATE), vec![DeviceCallback::IntegrationStart]);
        assert!(phot.is_integrating());

        let mut values = ValueTable::new();
        values.meta_info(VALUE_INTEGER, "count", "");
        values.meta_info(VALUE_DOUBLE, "exposure", "");
        values.meta_info(VALUE_BOOL, "is_ov", "");
        values
            .get_mut("count")
            .unwrap()
            .set_from_params(&mut Params::new("120"), 0.0)
            .unwrap();
        values
            .get_mut("exposure")
            .unwrap()
            .set_from_params(&mut Params::new("0.5"), 0.0)
            .unwrap();

        phot.value_changed("count", &values);
        assert_eq!(
            callbacks(&mut phot),
            vec![
                DeviceCallback::CountAdded {
                    count: 120,
                    exposure: 0.5,
                    is_ov: false
                },
                DeviceCallback::ValueChanged { name: "count".into() },
            ]
        );
    }

    #[test]
    fn test_executor_last_readout() {
        let mut exec = DevClient::for_type(DeviceType::Executor);
        let mut state = ServerState::new(EXEC_IDLE);
        assert_eq!(step(&mut exec, &mut state, EXEC_LASTREAD), vec![DeviceCallback::LastReadout]);
    }

    // ==================== Command Note Tests ====================

    #[test]
    fn test_command_notes_map_per_class() {
        let mut cam = DevClient::for_type(DeviceType::Ccd);
        cam.command_note(CommandNote::FilterFailed(-3));
        assert_eq!(callbacks(&mut cam), vec![DeviceCallback::FilterFailed(-3)]);

        let mut phot = DevClient::for_type(DeviceType::Phot);
        phot.command_note(CommandNote::FilterFailed(-3));
        assert_eq!(callbacks(&mut phot), vec![DeviceCallback::FilterMoveFailed(-3)]);

        let mut focus = DevClient::for_type(DeviceType::Focus);
        focus.command_note(CommandNote::MoveFailed(-3));
        assert!(callbacks(&mut focus).is_empty());
    }

    // ==================== Wait Tests ====================

    #[test]
    fn test_wait_transitions() {
        let mut dev = DevClient::for_type(DeviceType::Dome);
        dev.set_wait_move();
        assert!(dev.is_wait_move());

        dev.block_wait();
        dev.set_wait_move();
        assert_eq!(dev.wait_state(), WaitState::WaitNotPossible);

        let mut query = Event::with_payload(EventType::QUERY_WAIT, EventPayload::Count(0));
        dev.post_event(&mut query);
        assert_eq!(query.count(), Some(1));

        dev.unblock_wait();
        assert_eq!(dev.wait_state(), WaitState::NotWaiting);
        assert!(matches!(dev.drain_effects().as_slice(), [DevEffect::Unblocked]));

        // unblocking again is a no-op
        dev.unblock_wait();
        assert!(dev.drain_effects().is_empty());

        dev.post_event(&mut Event::new(EventType::ENTER_WAIT));
        assert!(dev.is_wait_move());
        dev.post_event(&mut Event::new(EventType::CLEAR_WAIT));
        assert_eq!(dev.wait_state(), WaitState::NotWaiting);
    }

    #[test]
    fn test_retire_fails_pending_and_releases_wait() {
        let mut tel = DevClient::for_type(DeviceType::Mount);
        tel.block_wait();
        tel.retire();
        let effects = tel.drain_effects();
        assert!(matches!(
            effects.as_slice(),
            [DevEffect::Callback(DeviceCallback::MoveFailed(_)), DevEffect::Unblocked]
        ));
    }
}
