use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::input::{InputError, InputSource};
use crate::protocol::{
    ACCEL_SAMPLES_PER_MESSAGE, AccelSample, Button, ButtonEvent, Command, ConsoleMessage,
    PhoneMessage,
};
use crate::transport::{MessageSink, TransportError};

/// Nominal period of both streaming loops.
pub const FRAME_PERIOD: Duration = Duration::from_millis(15);

/// The accel queue is flushed every third tick.
const FRAMES_PER_FLUSH: u8 = 3;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Console-controlled permissions. Only the inbound dispatch path writes
/// these; the streaming loops just read them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionFlags {
    /// Accelerometer streaming enabled.
    pub accel_enabled: bool,
    /// Input commands currently accepted.
    pub inputs_enabled: bool,
}

/// FIFO queue of samples awaiting transmission plus the running count of
/// samples already sent, which doubles as the wire timestamp.
#[derive(Debug, Default)]
pub struct AccelBuffer {
    queue: VecDeque<AccelSample>,
    sent: u64,
}

impl AccelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: AccelSample) {
        self.queue.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Samples transmitted so far. Reset only on an enable-streaming command.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn reset_sent(&mut self) {
        self.sent = 0;
    }

    /// Pop everything queued, in order, as scoring messages of at most
    /// `ACCEL_SAMPLES_PER_MESSAGE` samples each. Each message's timestamp is
    /// the cumulative-sent count before its chunk is appended.
    pub fn drain_messages(&mut self) -> Vec<PhoneMessage> {
        let mut messages = Vec::new();
        while !self.queue.is_empty() {
            let take = self.queue.len().min(ACCEL_SAMPLES_PER_MESSAGE);
            let samples: Vec<AccelSample> = self.queue.drain(..take).collect();
            messages.push(PhoneMessage::Scoring {
                timestamp: self.sent,
                samples,
            });
            self.sent += take as u64;
        }
        messages
    }
}

/// State shared between the streaming loops and the inbound dispatch path.
/// Each piece has a single writer: the tick loop owns the accel queue, the
/// receive loop owns the flags and shortcut set.
pub struct EngineState {
    accel: Mutex<AccelBuffer>,
    flags: Mutex<PermissionFlags>,
    shortcuts: Mutex<HashSet<Command>>,
    input: Mutex<Option<Box<dyn InputSource>>>,
}

impl EngineState {
    pub fn new(input: Box<dyn InputSource>) -> Self {
        Self {
            accel: Mutex::new(AccelBuffer::new()),
            flags: Mutex::new(PermissionFlags::default()),
            shortcuts: Mutex::new(HashSet::new()),
            input: Mutex::new(Some(input)),
        }
    }

    pub fn flags(&self) -> PermissionFlags {
        *self.flags.lock()
    }

    pub fn shortcuts(&self) -> HashSet<Command> {
        self.shortcuts.lock().clone()
    }

    pub fn sent_samples(&self) -> u64 {
        self.accel.lock().sent()
    }

    pub fn queued_samples(&self) -> usize {
        self.accel.lock().len()
    }

    /// Apply one inbound control message.
    pub fn apply(&self, message: ConsoleMessage) {
        match message {
            ConsoleMessage::EnableAccel => {
                self.flags.lock().accel_enabled = true;
                self.accel.lock().reset_sent();
                tracing::info!(target: "disco::streaming", "accel streaming enabled");
            }
            ConsoleMessage::DisableAccel => {
                self.flags.lock().accel_enabled = false;
                tracing::info!(target: "disco::streaming", "accel streaming disabled");
            }
            ConsoleMessage::InputSetup { enabled } | ConsoleMessage::ShortcutSetup { enabled } => {
                self.flags.lock().inputs_enabled = enabled;
                tracing::debug!(target: "disco::streaming", enabled, "input acceptance updated");
            }
            ConsoleMessage::ShortcutList { shortcuts } => {
                tracing::debug!(
                    target: "disco::streaming",
                    count = shortcuts.len(),
                    "shortcut set replaced"
                );
                *self.shortcuts.lock() = shortcuts;
            }
        }
    }

    /// Drop the controller handle. Safe to call more than once; only the
    /// first call releases anything.
    pub fn release_input(&self) -> bool {
        self.input.lock().take().is_some()
    }

    fn read_accel(&self) -> Result<Option<AccelSample>, InputError> {
        match self.input.lock().as_mut() {
            Some(source) => source.accel_sample().map(Some),
            None => Ok(None),
        }
    }

    fn drain_events(&self) -> Option<Vec<ButtonEvent>> {
        self.input.lock().as_mut().map(|source| source.drain_events())
    }
}

/// Accelerometer path. Collects one sample per frame while streaming is
/// enabled and flushes the queue every third frame, pacing itself against
/// measured overrun so the average cadence holds the frame period.
pub async fn tick_loop(engine: &EngineState, sink: &dyn MessageSink) -> Result<(), StreamError> {
    let mut clock = FrameClock::new();
    let mut frame: u8 = 0;
    loop {
        let started = Instant::now();

        if !engine.flags().accel_enabled {
            frame = 0;
            clock.reset();
            sleep(FRAME_PERIOD).await;
            continue;
        }

        frame = if frame >= FRAMES_PER_FLUSH { 1 } else { frame + 1 };

        match engine.read_accel() {
            Ok(Some(sample)) => engine.accel.lock().push(sample),
            // Controller already released: the session is shutting down.
            Ok(None) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if frame == FRAMES_PER_FLUSH {
            let messages = engine.accel.lock().drain_messages();
            for message in messages {
                sink.send(message).await?;
            }
        }

        clock.pace(started).await;
    }
}

/// Button path, on its own timer. Drains the window's transitions, resolves
/// at most one command (last press wins) and sends it only while the console
/// accepts input.
pub async fn command_loop(engine: &EngineState, sink: &dyn MessageSink) -> Result<(), StreamError> {
    let mut clock = FrameClock::new();
    loop {
        let started = Instant::now();

        let events = match engine.drain_events() {
            Some(events) => events,
            None => return Ok(()),
        };

        let flags = engine.flags();
        if flags.accel_enabled || flags.inputs_enabled {
            let resolved = {
                let shortcuts = engine.shortcuts.lock();
                resolve_window(&events, flags, &shortcuts)
            };
            if let Some(command) = resolved {
                if flags.inputs_enabled {
                    tracing::debug!(target: "disco::streaming", ?command, "sending command");
                    sink.send(command.to_message()).await?;
                }
            }
        }

        clock.pace(started).await;
    }
}

/// Resolve one polling window's transitions to at most one command.
/// "Released" transitions never resolve; if several presses resolve, the
/// last one wins.
pub fn resolve_window(
    events: &[ButtonEvent],
    flags: PermissionFlags,
    shortcuts: &HashSet<Command>,
) -> Option<Command> {
    let mut resolved = None;
    for event in events.iter().filter(|event| event.pressed) {
        if let Some(command) = resolve_button(event.button, flags, shortcuts) {
            resolved = Some(command);
        }
    }
    resolved
}

fn resolve_button(
    button: Button,
    flags: PermissionFlags,
    shortcuts: &HashSet<Command>,
) -> Option<Command> {
    if flags.accel_enabled {
        // Mid-song only the pause/options buttons do anything.
        return matches!(button, Button::Plus | Button::Minus).then_some(Command::Pause);
    }
    match button {
        Button::A => Some(Command::Accept),
        Button::B => Some(Command::Back),
        _ => button
            .candidate_commands()
            .iter()
            .copied()
            .find(|command| shortcuts.contains(command)),
    }
}

/// Drift-compensated pacing: the next sleep is shortened by however far the
/// finished iteration ran past its nominal period, clamped so correction
/// never goes negative.
struct FrameClock {
    sleep_for: Duration,
}

impl FrameClock {
    fn new() -> Self {
        Self {
            sleep_for: FRAME_PERIOD,
        }
    }

    fn reset(&mut self) {
        self.sleep_for = FRAME_PERIOD;
    }

    async fn pace(&mut self, started: Instant) {
        sleep(self.sleep_for).await;
        let elapsed = started.elapsed();
        self.sleep_for = next_sleep(FRAME_PERIOD, elapsed, self.sleep_for);
    }
}

fn next_sleep(period: Duration, elapsed: Duration, previous_sleep: Duration) -> Duration {
    period.saturating_sub(elapsed.saturating_sub(previous_sleep))
}
