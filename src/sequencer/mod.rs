//! Unattended test sequencing.
//!
//! Without a test host the engine walks a table of (on, off) command pairs. In
//! standalone mode a button moves through the table and wraps around. In batch-remote
//! mode a dwell timer does, and the end of the table restarts the device. Every
//! command goes through [`ProdTestEngine::handle`] exactly like host traffic.

pub mod remote;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Timer;
use heapless::Vec;

use crate::config::{
    END_OF_TEST_DURATION, HIGH_CHANNEL, LOW_CHANNEL, MID_CHANNEL, PAYLOAD_LENGTH, PAYLOAD_TYPE, REFRESH_PERIOD,
};
use crate::engine::{ProdTestEngine, UnmodulatedOp};
use crate::hci::command::{Command, MAX_PARAM_LEN};
use crate::hci::event::Event;
use crate::sdk::hal::ProdTestHal;
use crate::sdk::pm::SleepMode;

pub const MAX_TESTS: usize = 16;

// Events the ISRs may queue for the sequencer loop
const EVENT_QUEUE_DEPTH: usize = 4;

const TEST_CHANNELS: [u8; 3] = [LOW_CHANNEL, MID_CHANNEL, HIGH_CHANNEL];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequencerState {
    Init,
    Idle,
    StopTest,
    StartTest,
    /// Batch-remote only, the whole table ran.
    Eot,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequencerMode {
    Standalone,
    BatchRemote,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequencerEvent {
    ButtonPress,
    DwellTimer,
}

/// Command starting a test and the command ending it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestPair {
    pub on: Command,
    pub off: Command,
}

impl TestPair {
    pub const fn new(on: Command, off: Command) -> Self {
        Self { on, off }
    }
}

fn unmodulated(op: UnmodulatedOp, freq: u8) -> Command {
    Command::UnmodulatedOn { op: op as u8, freq }
}

/// Built-in table: unmodulated TX, unmodulated RX, LE TX, production RX and continuous
/// TX on the low, mid and high channel, then extended sleep.
pub fn default_tests() -> Vec<TestPair, MAX_TESTS> {
    let mut tests = Vec::new();

    let groups: [fn(u8) -> TestPair; 5] = [
        |ch| TestPair::new(unmodulated(UnmodulatedOp::Tx, ch), unmodulated(UnmodulatedOp::Off, 0)),
        |ch| TestPair::new(unmodulated(UnmodulatedOp::Rx, ch), unmodulated(UnmodulatedOp::Off, 0)),
        |ch| {
            TestPair::new(
                Command::LeTxTest {
                    freq: ch,
                    data_len: PAYLOAD_LENGTH,
                    payload: PAYLOAD_TYPE,
                },
                Command::LeTestEnd,
            )
        },
        |ch| TestPair::new(Command::StartProdRxTest { freq: ch }, Command::EndProdRxTest),
        |ch| {
            TestPair::new(
                Command::TxStartContinueTest {
                    freq: ch,
                    payload: PAYLOAD_TYPE,
                },
                Command::TxEndContinueTest,
            )
        },
    ];

    for group in groups {
        for ch in TEST_CHANNELS {
            let _ = tests.push(group(ch));
        }
    }
    let _ = tests.push(TestPair::new(
        Command::SleepTest {
            mode: SleepMode::Extended as u8,
            mins: 0,
            secs: 0,
        },
        Command::SleepTest {
            mode: SleepMode::Active as u8,
            mins: 0,
            secs: 0,
        },
    ));

    tests
}

/// Feeds a table command into the engine as if the host had sent it.
///
/// LE TX and production RX starts mark a BLE end event as pending, the next start
/// waits for it. Any post-reply action runs right away since there is no reply to wait
/// for.
pub fn send_command<H: ProdTestHal>(engine: &mut ProdTestEngine<'_, H>, cmd: &Command) -> Option<Event> {
    let mut params: Vec<u8, MAX_PARAM_LEN> = Vec::new();
    if let Err(e) = cmd.encode(&mut params) {
        error!("Cannot encode {:?}: {:?}", cmd.opcode(), e);
        return None;
    }

    if matches!(cmd, Command::LeTxTest { .. } | Command::StartProdRxTest { .. }) {
        engine.shared().with(|s| s.ble_event_pending = true);
    }

    let opcode = cmd.opcode();
    info!("Sequencer runs {:?}", opcode);
    let response = engine.handle(opcode.into(), &params);
    if response.event.status_code() != 0 {
        warn!("{:?} answered status {:#x}", opcode, response.event.status_code());
    }
    if let Some(deferred) = response.deferred {
        engine.run_deferred(deferred);
    }

    Some(response.event)
}

/// Button and dwell timer events, posted from interrupt context.
pub struct SequencerEvents {
    channel: Channel<CriticalSectionRawMutex, SequencerEvent, EVENT_QUEUE_DEPTH>,
}

impl SequencerEvents {
    pub const fn default() -> Self {
        Self {
            channel: Channel::<CriticalSectionRawMutex, SequencerEvent, EVENT_QUEUE_DEPTH>::new(),
        }
    }

    /// Returns `false` when the queue is full and the event was dropped.
    pub fn post(&self, event: SequencerEvent) -> bool {
        self.channel.try_send(event).is_ok()
    }

    pub async fn next(&self) -> SequencerEvent {
        self.channel.receive().await
    }
}

/// Batch-remote dwell timer. The first tick fires right away.
pub async fn run_dwell_timer(events: &SequencerEvents) -> ! {
    loop {
        if !events.post(SequencerEvent::DwellTimer) {
            warn!("Dwell tick dropped");
        }
        Timer::after(END_OF_TEST_DURATION).await;
    }
}

pub struct Sequencer {
    mode: SequencerMode,
    tests: Vec<TestPair, MAX_TESTS>,
    index: usize,
    state: SequencerState,
}

impl Sequencer {
    pub fn new(mode: SequencerMode, tests: Vec<TestPair, MAX_TESTS>) -> Self {
        Self {
            mode,
            tests,
            index: 0,
            state: SequencerState::Init,
        }
    }

    /// Standalone sequencer. With `start_immediately` the first test starts without a
    /// button press.
    pub fn standalone(tests: Vec<TestPair, MAX_TESTS>, start_immediately: bool) -> Self {
        let mut seq = Self::new(SequencerMode::Standalone, tests);
        if start_immediately {
            seq.state = SequencerState::StartTest;
        }
        seq
    }

    pub fn batch_remote(tests: Vec<TestPair, MAX_TESTS>) -> Self {
        Self::new(SequencerMode::BatchRemote, tests)
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Table entry of the running or next test.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Button presses only drive standalone mode.
    pub fn on_button_press(&mut self) {
        if self.mode == SequencerMode::BatchRemote || self.state == SequencerState::Eot {
            trace!("Button ignored");
            return;
        }
        self.state = match self.state {
            SequencerState::Init => SequencerState::StartTest,
            _ => SequencerState::StopTest,
        };
        debug!("Button, sequencer {:?}", self.state);
    }

    /// A dwell period ended. After the last test the device restarts.
    pub fn on_dwell_timer<H: ProdTestHal>(&mut self, engine: &mut ProdTestEngine<'_, H>) {
        self.state = match self.state {
            SequencerState::Eot => {
                info!("Test batch done, restarting");
                engine.hal_mut().sw_restart();
                return;
            }
            SequencerState::Init => SequencerState::StartTest,
            _ => SequencerState::StopTest,
        };
    }

    /// Advances the table as far as possible without waiting.
    ///
    /// # Algorithm
    ///
    /// 1. `StopTest`: send the off command of the current test and move to the next one,
    ///    wrapping in standalone mode and ending in `Eot` in batch-remote mode
    /// 2. `StartTest`: unless a BLE end event is pending, send the on command and go idle
    /// 3. Every other state waits for an event
    pub fn step<H: ProdTestHal>(&mut self, engine: &mut ProdTestEngine<'_, H>) -> SequencerState {
        let len = self.tests.len();
        if len == 0 {
            return self.state;
        }

        loop {
            match self.state {
                SequencerState::StopTest => {
                    let Some(test) = self.tests.get(self.index) else {
                        self.state = SequencerState::Eot;
                        break;
                    };
                    let off = test.off.clone();
                    send_command(engine, &off);

                    self.index += 1;
                    self.state = SequencerState::StartTest;
                    match self.mode {
                        SequencerMode::Standalone => self.index %= len,
                        SequencerMode::BatchRemote if self.index == len => {
                            self.state = SequencerState::Eot;
                        }
                        SequencerMode::BatchRemote => {}
                    }
                }
                SequencerState::StartTest => {
                    if engine.shared().ble_event_pending() {
                        trace!("Start waits for the BLE end event");
                        break;
                    }
                    let Some(test) = self.tests.get(self.index) else {
                        self.state = SequencerState::Eot;
                        break;
                    };
                    let on = test.on.clone();
                    send_command(engine, &on);
                    self.state = SequencerState::Idle;
                    break;
                }
                SequencerState::Init | SequencerState::Idle | SequencerState::Eot => break,
            }
        }

        self.state
    }

    pub fn handle_event<H: ProdTestHal>(&mut self, event: SequencerEvent, engine: &mut ProdTestEngine<'_, H>) {
        match event {
            SequencerEvent::ButtonPress => self.on_button_press(),
            SequencerEvent::DwellTimer => self.on_dwell_timer(engine),
        }
        self.step(engine);
    }

    /// Event loop of the standalone and batch-remote modes.
    pub async fn run<H: ProdTestHal>(&mut self, engine: &mut ProdTestEngine<'_, H>, events: &SequencerEvents) -> ! {
        loop {
            self.step(engine);
            while self.state == SequencerState::StartTest && engine.shared().ble_event_pending() {
                Timer::after(REFRESH_PERIOD).await;
                self.step(engine);
            }

            let event = events.next().await;
            self.handle_event(event, engine);
        }
    }
}
