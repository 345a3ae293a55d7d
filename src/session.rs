//! Session event loop
//!
//! A [`Session`] owns the link, the dispatcher phase and the pipeline state,
//! and is driven by exactly one thread. Operator requests, link traffic and
//! poll timers all arrive as [`SessionEvent`]s; the session answers with
//! [`SessionUpdate`]s for whoever presents status to the operator.
//!
//! The completion poll never sleeps: a pending re-poll is a deadline the loop
//! selects on alongside the event channel, so disconnects and operator input
//! are serviced while the device is busy.

use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::mem;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::SharedConfig;
use crate::connection::Transport;
use crate::dispatcher::{dispatch, Action, ListKind, Phase};
use crate::error::LogicError;
use crate::logger::{Direction, Logger, WireLogEntry};
use crate::pipeline::{plan, PipelineState, Step};
use crate::protocol::{self, Command};
use crate::types::{DeviceEntry, SampleRate};

/// Identifies one connection attempt; events of superseded links are dropped.
pub type LinkId = u64;

#[derive(Debug)]
pub enum LinkEvent {
    Up,
    Down,
    Failed(String),
    Data(String),
}

#[derive(Debug)]
pub enum SessionEvent {
    Connect { host: String, port: u16 },
    Disconnect,
    SelectDevice(String),
    SelectSampleRate(String),
    Acquire,
    Link { id: LinkId, event: LinkEvent },
    PollDue,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    AwaitingDeviceList,
    AwaitingRateList,
    RunningPipeline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(String),
    State(SessionState),
    Devices(Vec<String>),
    SampleRates(Vec<String>),
    /// Channel counts selectable for the chosen device
    ChannelChoices(Vec<u32>),
    SequenceFinished,
    SequenceHalted(String),
    /// Connect attempt failed or the peer closed the link
    LinkClosed(String),
}

pub struct Session<T: Transport> {
    transport: T,
    config: SharedConfig,
    events: Sender<SessionEvent>,
    updates: Sender<SessionUpdate>,
    link: Option<LinkId>,
    next_link: LinkId,
    link_up: bool,
    phase: Phase,
    pipeline: PipelineState,
    state: SessionState,
    status_prefix: String,
    reply_buffer: String,
    acquiring: bool,
    poll_interval: Duration,
    poll_deadline: Option<Instant>,
    wire_log: Option<Logger<WireLogEntry>>,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        config: SharedConfig,
        poll_interval: Duration,
        events: Sender<SessionEvent>,
        updates: Sender<SessionUpdate>,
    ) -> Self {
        Self {
            transport,
            config,
            events,
            updates,
            link: None,
            next_link: 1,
            link_up: false,
            phase: Phase::Idle,
            pipeline: PipelineState::default(),
            state: SessionState::Disconnected,
            status_prefix: String::new(),
            reply_buffer: String::new(),
            acquiring: false,
            poll_interval,
            poll_deadline: None,
            wire_log: None,
        }
    }

    /// Record every frame to `logger`
    pub fn with_wire_log(mut self, logger: Logger<WireLogEntry>) -> Self {
        self.wire_log = Some(logger);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pipeline(&self) -> &PipelineState {
        &self.pipeline
    }

    /// When the next completion poll is due, if one is scheduled
    pub fn poll_deadline(&self) -> Option<Instant> {
        self.poll_deadline
    }

    /// Process events until shutdown or until every sender is gone.
    pub fn run(mut self, events: Receiver<SessionEvent>) {
        info!("Session loop started");
        loop {
            let timer = match self.poll_deadline {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };
            let keep_running = select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle(event),
                    Err(_) => false,
                },
                recv(timer) -> _ => self.handle(SessionEvent::PollDue),
            };
            if !keep_running {
                break;
            }
        }
        self.transport.close();
        info!("Session loop stopped");
    }

    /// Apply one event. Returns `false` once the session should stop.
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connect { host, port } => self.connect(&host, port),
            SessionEvent::Disconnect => self.disconnect(),
            SessionEvent::SelectDevice(token) => {
                if let Err(e) = self.select_device(&token) {
                    warn!("Device selection ignored: {e}");
                }
            }
            SessionEvent::SelectSampleRate(token) => {
                if let Err(e) = self.select_sample_rate(&token) {
                    warn!("Sample rate selection ignored: {e}");
                }
            }
            SessionEvent::Acquire => {
                if let Err(e) = self.acquire() {
                    warn!("Acquire ignored: {e}");
                }
            }
            SessionEvent::Link { id, event } => self.on_link_event(id, event),
            SessionEvent::PollDue => self.on_poll_due(),
            SessionEvent::Shutdown => {
                self.disconnect();
                return false;
            }
        }
        self.refresh_state();
        true
    }

    /// Open the link; device enumeration starts once it is up.
    pub fn connect(&mut self, host: &str, port: u16) {
        if self.link.is_some() {
            self.disconnect();
        }
        let link = self.next_link;
        self.next_link += 1;
        info!("Connecting to {host}:{port}");
        match self.transport.open(host, port, link, self.events.clone()) {
            Ok(()) => self.link = Some(link),
            Err(e) => {
                error!("Connect failed: {e}");
                self.set_status(format!("Connect failed: {e}"));
                self.publish(SessionUpdate::LinkClosed(e.to_string()));
            }
        }
    }

    /// Close the link and drop any sequence in progress. Idempotent.
    pub fn disconnect(&mut self) {
        self.transport.close();
        let was_linked = self.link.take().is_some();
        self.link_up = false;
        self.abandon_sequence();
        if was_linked {
            info!("Disconnected");
            self.set_status("Disconnected".to_string());
        }
        self.refresh_state();
    }

    /// Choose a device from the enumerated list and fetch its sample rates.
    ///
    /// An empty token is the "no selection" entry and does nothing.
    pub fn select_device(&mut self, token: &str) -> Result<(), LogicError> {
        if token.trim().is_empty() {
            return Ok(());
        }
        self.ensure_ready()?;
        let entry = DeviceEntry::parse(token)?;

        let max_channels = entry.total_channels - 1;
        self.config.update(|cfg| {
            cfg.trigger_channel = entry.trigger_channel();
            cfg.channel_count = cfg.channel_count.clamp(1, max_channels);
        });
        self.publish(SessionUpdate::ChannelChoices(entry.channel_choices()));

        self.issue(Step::SelectDevice(entry));
        Ok(())
    }

    /// Apply a `digital,analog` sample rate pair.
    pub fn select_sample_rate(&mut self, token: &str) -> Result<(), LogicError> {
        if token.trim().is_empty() {
            return Ok(());
        }
        self.ensure_ready()?;
        let rate = SampleRate::parse(token)?;
        self.config.update(|cfg| {
            cfg.digital_rate = rate.digital;
            cfg.analog_rate = rate.analog;
        });
        self.issue(Step::SetSampleRate(rate));
        Ok(())
    }

    /// Start an acquisition sequence from the top.
    pub fn acquire(&mut self) -> Result<(), LogicError> {
        self.ensure_ready()?;
        self.acquiring = true;
        self.pipeline = PipelineState::default();
        self.issue(Step::BeginAcquire);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), LogicError> {
        if !self.link_up || !self.transport.is_open() {
            return Err(LogicError::NotConnected);
        }
        if self.phase.is_busy() {
            return Err(LogicError::Busy);
        }
        Ok(())
    }

    fn on_link_event(&mut self, id: LinkId, event: LinkEvent) {
        if self.link != Some(id) {
            debug!("Dropping event from stale link {id}: {event:?}");
            return;
        }
        match event {
            LinkEvent::Up => {
                info!("Link {id} up");
                self.link_up = true;
                self.abandon_sequence();
                self.phase = Phase::ExpectingDeviceList;
                self.send(Command::GetConnectedDevices);
                self.set_status("Connected!".to_string());
            }
            LinkEvent::Failed(reason) => {
                warn!("Link {id} failed: {reason}");
                self.link = None;
                self.link_up = false;
                self.set_status(format!("Connection failed: {reason}"));
                self.publish(SessionUpdate::LinkClosed(reason));
            }
            LinkEvent::Down => {
                warn!("Link {id} closed by peer");
                self.transport.close();
                self.link = None;
                self.link_up = false;
                self.abandon_sequence();
                self.set_status("Connection closed".to_string());
                self.publish(SessionUpdate::LinkClosed("closed by peer".to_string()));
            }
            LinkEvent::Data(data) => self.on_payload(data),
        }
    }

    fn on_payload(&mut self, data: String) {
        self.log_wire(Direction::Received, &data);

        let payload = if self.phase.is_busy() {
            self.reply_buffer.push_str(&data);
            if !protocol::reply_complete(&self.reply_buffer) {
                return;
            }
            mem::take(&mut self.reply_buffer)
        } else {
            data
        };

        let echo = self.phase == Phase::ExpectingCommandResponse;
        let transition = dispatch(self.phase, mem::take(&mut self.pipeline), &payload);
        self.phase = transition.phase;
        self.pipeline = transition.state;

        if echo {
            self.set_status(format!("{}{}", self.status_prefix, protocol::normalize(&payload)));
        }

        match transition.action {
            Action::Ignore => debug!("Unsolicited payload ignored: {payload:?}"),
            Action::Invoke(step) => self.issue(step),
            Action::Poll => self.send(Command::IsProcessingComplete),
            Action::PollLater => {
                self.poll_deadline = Some(Instant::now() + self.poll_interval);
            }
            Action::Halt(reply) => {
                warn!("Sequence halted: {}", LogicError::Rejected(reply.clone()));
                if !echo {
                    self.set_status(format!("{}{}", self.status_prefix, reply));
                }
                self.acquiring = false;
                self.publish(SessionUpdate::SequenceHalted(reply));
            }
            Action::Finished => {
                if mem::take(&mut self.acquiring) {
                    info!("Acquisition sequence complete");
                    self.set_status("Acquisition complete".to_string());
                    self.publish(SessionUpdate::SequenceFinished);
                }
            }
            Action::Populate(kind, entries) => {
                info!("Received {} {:?} entries", entries.len().saturating_sub(1), kind);
                self.publish(match kind {
                    ListKind::Devices => SessionUpdate::Devices(entries),
                    ListKind::SampleRates => SessionUpdate::SampleRates(entries),
                });
            }
        }
    }

    fn on_poll_due(&mut self) {
        self.poll_deadline = None;
        if self.phase == Phase::ExpectingProcessingPoll {
            self.send(Command::IsProcessingComplete);
        }
    }

    /// Plan `step` against the live configuration and send its command.
    fn issue(&mut self, step: Step) {
        let config = self.config.snapshot();
        let planned = match plan(step, mem::take(&mut self.pipeline), &config) {
            Ok(planned) => planned,
            Err(e) => {
                warn!("Sequence halted: {e}");
                self.abandon_sequence();
                self.set_status(e.to_string());
                self.publish(SessionUpdate::SequenceHalted(e.to_string()));
                return;
            }
        };

        if let Some(path) = planned.next_output_path {
            info!("Next output path: {path}");
            self.config.update(|cfg| cfg.output_path = path);
        }

        self.pipeline = planned.state;
        self.phase = match planned.command {
            Command::GetAllSampleRates => Phase::ExpectingRateList,
            _ => Phase::ExpectingCommandResponse,
        };
        self.status_prefix = planned.status.clone();
        self.set_status(planned.status);
        self.send(planned.command);
    }

    fn send(&mut self, command: Command) {
        let text = command.to_string();
        debug!("-> {text}");
        match self.transport.send(&command) {
            Ok(()) => self.log_wire(Direction::Sent, &text),
            Err(e) => {
                warn!("Could not send '{text}': {e}");
                self.abandon_sequence();
            }
        }
    }

    fn abandon_sequence(&mut self) {
        self.phase = Phase::Idle;
        self.pipeline = PipelineState::default();
        self.poll_deadline = None;
        self.reply_buffer.clear();
        self.acquiring = false;
    }

    fn refresh_state(&mut self) {
        let state = match self.phase {
            _ if !self.link_up => SessionState::Disconnected,
            Phase::Idle => SessionState::Connected,
            Phase::ExpectingDeviceList => SessionState::AwaitingDeviceList,
            Phase::ExpectingRateList => SessionState::AwaitingRateList,
            Phase::ExpectingCommandResponse | Phase::ExpectingProcessingPoll => {
                SessionState::RunningPipeline
            }
        };
        if state != self.state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.publish(SessionUpdate::State(state));
        }
    }

    fn set_status(&self, text: String) {
        info!("{text}");
        self.publish(SessionUpdate::Status(text));
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn log_wire(&mut self, direction: Direction, payload: &str) {
        if let Some(logger) = self.wire_log.as_mut() {
            let entry = WireLogEntry::new(direction, format!("{:?}", self.phase), payload);
            if let Err(e) = logger.add(entry) {
                error!("Wire log disabled: {e}");
                self.wire_log = None;
            }
        }
    }
}

/// Cloneable front end for a session running on its own thread.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: Sender<SessionEvent>,
}

impl SessionHandle {
    fn post(&self, event: SessionEvent) -> Result<(), LogicError> {
        self.events.send(event).map_err(|_| LogicError::NotConnected)
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<(), LogicError> {
        self.post(SessionEvent::Connect {
            host: host.to_string(),
            port,
        })
    }

    pub fn disconnect(&self) -> Result<(), LogicError> {
        self.post(SessionEvent::Disconnect)
    }

    pub fn select_device(&self, token: &str) -> Result<(), LogicError> {
        self.post(SessionEvent::SelectDevice(token.to_string()))
    }

    pub fn select_sample_rate(&self, token: &str) -> Result<(), LogicError> {
        self.post(SessionEvent::SelectSampleRate(token.to_string()))
    }

    pub fn acquire(&self) -> Result<(), LogicError> {
        self.post(SessionEvent::Acquire)
    }

    pub fn shutdown(&self) -> Result<(), LogicError> {
        self.post(SessionEvent::Shutdown)
    }
}

/// A session thread together with its control handle and update stream.
pub struct SessionRunner {
    pub handle: SessionHandle,
    pub updates: Receiver<SessionUpdate>,
    pub thread: JoinHandle<()>,
}

/// Start a session on a dedicated thread.
pub fn spawn<T: Transport + 'static>(
    transport: T,
    config: SharedConfig,
    poll_interval: Duration,
    wire_log: Option<Logger<WireLogEntry>>,
) -> Result<SessionRunner, LogicError> {
    let (event_tx, event_rx) = unbounded();
    let (update_tx, update_rx) = unbounded();

    let mut session = Session::new(transport, config, poll_interval, event_tx.clone(), update_tx);
    if let Some(logger) = wire_log {
        session = session.with_wire_log(logger);
    }

    let thread = thread::Builder::new()
        .name("logic-session".to_string())
        .spawn(move || session.run(event_rx))
        .map_err(|source| LogicError::Io {
            source,
            context: "Spawning session thread".to_string(),
        })?;

    Ok(SessionRunner {
        handle: SessionHandle { events: event_tx },
        updates: update_rx,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::connection::TcpTransport;
    use crate::types::TriggerMode;
    use parking_lot::Mutex;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    /// Records commands instead of writing them anywhere
    #[derive(Clone, Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<String>>>,
        open: Arc<Mutex<bool>>,
    }

    impl MockTransport {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        fn last(&self) -> Option<String> {
            self.sent.lock().last().cloned()
        }
    }

    impl Transport for MockTransport {
        fn open(
            &mut self,
            _host: &str,
            _port: u16,
            _link: LinkId,
            _events: Sender<SessionEvent>,
        ) -> Result<(), LogicError> {
            *self.open.lock() = true;
            Ok(())
        }

        fn close(&mut self) {
            *self.open.lock() = false;
        }

        fn is_open(&self) -> bool {
            *self.open.lock()
        }

        fn send(&mut self, command: &Command) -> Result<(), LogicError> {
            if !self.is_open() {
                return Err(LogicError::NotConnected);
            }
            self.sent.lock().push(command.to_string());
            Ok(())
        }
    }

    struct Harness {
        session: Session<MockTransport>,
        transport: MockTransport,
        config: SharedConfig,
        updates: Receiver<SessionUpdate>,
        link: LinkId,
    }

    impl Harness {
        fn new(acquisition: AcquisitionConfig) -> Self {
            let transport = MockTransport::default();
            let config = SharedConfig::new(acquisition);
            let (event_tx, _event_rx) = unbounded();
            let (update_tx, updates) = unbounded();
            let session = Session::new(
                transport.clone(),
                config.clone(),
                Duration::from_millis(10),
                event_tx,
                update_tx,
            );
            Self {
                session,
                transport,
                config,
                updates,
                link: 0,
            }
        }

        fn connected(acquisition: AcquisitionConfig) -> Self {
            let mut h = Self::new(acquisition);
            h.session.handle(SessionEvent::Connect {
                host: "127.0.0.1".into(),
                port: 10429,
            });
            h.link = 1;
            h.link_event(LinkEvent::Up);
            h.reply("1, Logic Pro 07\nACK");
            h
        }

        fn link_event(&mut self, event: LinkEvent) {
            self.session.handle(SessionEvent::Link {
                id: self.link,
                event,
            });
        }

        fn reply(&mut self, payload: &str) {
            self.link_event(LinkEvent::Data(payload.to_string()));
        }

        fn drain(&self) -> Vec<SessionUpdate> {
            self.updates.try_iter().collect()
        }

        /// Answer every command like a healthy device until nothing is outstanding
        fn run_to_idle(&mut self, pending_polls: usize) {
            let mut pending = pending_polls;
            let mut guard = 0;
            while self.session.phase().is_busy() {
                guard += 1;
                assert!(guard < 1000, "sequence did not settle");
                if self.session.poll_deadline().is_some() {
                    self.session.handle(SessionEvent::PollDue);
                    continue;
                }
                let last = self.transport.last().unwrap_or_default();
                if last == "is_processing_complete" {
                    if pending > 0 {
                        pending -= 1;
                        self.reply("FALSE\nACK");
                    } else {
                        pending = pending_polls;
                        self.reply("TRUE\nACK");
                    }
                } else {
                    self.reply("ACK");
                }
            }
        }
    }

    fn acquisition(channels: u32, repeat: bool) -> AcquisitionConfig {
        AcquisitionConfig {
            channel_count: channels,
            trigger_channel: 6,
            trigger_mode: TriggerMode::Negedge,
            sample_count: 1000,
            pretrigger_size: 250,
            digital_rate: 2.0,
            analog_rate: 4.0,
            output_path: "/data/run.009".to_string(),
            repeat,
        }
    }

    #[test]
    fn test_connect_enumerates_devices() {
        let h = Harness::connected(acquisition(1, false));
        assert_eq!(h.transport.sent(), vec!["get_connected_devices"]);
        assert_eq!(h.session.state(), SessionState::Connected);
        let updates = h.drain();
        assert!(updates.contains(&SessionUpdate::Status("Connected!".into())));
        assert!(updates.contains(&SessionUpdate::Devices(vec![
            "".into(),
            "1, Logic Pro 07".into()
        ])));
    }

    #[test]
    fn test_split_list_payload_is_reassembled() {
        let mut h = Harness::new(acquisition(1, false));
        h.session.handle(SessionEvent::Connect {
            host: "127.0.0.1".into(),
            port: 10429,
        });
        h.link = 1;
        h.link_event(LinkEvent::Up);
        h.reply("1, Logic Pro 07\n2, Logic");
        assert_eq!(h.session.state(), SessionState::AwaitingDeviceList);
        h.reply(" Pro 16\nACK");
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.drain().contains(&SessionUpdate::Devices(vec![
            "".into(),
            "1, Logic Pro 07".into(),
            "2, Logic Pro 16".into()
        ])));
    }

    #[test]
    fn test_device_and_rate_selection() {
        let mut h = Harness::connected(acquisition(9, false));
        h.session.select_device("1, Logic Pro 07").unwrap();
        assert_eq!(h.transport.last().unwrap(), "select_active_device,1");
        let cfg = h.config.snapshot();
        assert_eq!(cfg.trigger_channel, 6);
        assert_eq!(cfg.channel_count, 6);

        h.reply("ACK");
        assert_eq!(h.transport.last().unwrap(), "get_all_sample_rates");
        assert_eq!(h.session.state(), SessionState::AwaitingRateList);

        h.reply("500000,125000\n1000000,250000\nACK");
        assert_eq!(h.session.state(), SessionState::Connected);
        let updates = h.drain();
        assert!(updates.contains(&SessionUpdate::ChannelChoices(vec![1, 2, 3, 4, 5, 6])));
        assert!(updates.contains(&SessionUpdate::SampleRates(vec![
            "".into(),
            "500000,125000".into(),
            "1000000,250000".into()
        ])));

        h.session.select_sample_rate("1000000,250000").unwrap();
        assert_eq!(h.transport.last().unwrap(), "set_sample_rate,1000000,250000");
        h.reply("ACK");
        assert_eq!(h.session.phase(), Phase::Idle);
        let cfg = h.config.snapshot();
        assert_eq!(cfg.digital_rate, 1_000_000.0);
        assert_eq!(cfg.analog_rate, 250_000.0);
    }

    #[test]
    fn test_full_chain_exports_every_channel_once() {
        let mut h = Harness::connected(acquisition(4, false));
        h.session.acquire().unwrap();
        h.run_to_idle(0);

        let sent = h.transport.sent();
        let polls = sent.iter().filter(|c| *c == "is_processing_complete").count();
        let commands: Vec<&String> = sent
            .iter()
            .filter(|c| *c != "is_processing_complete")
            .collect();
        assert_eq!(
            commands,
            vec![
                "get_connected_devices",
                "set_active_channels,digital_channels,6,analog_channels,0,1,2,3",
                "set_trigger,negedge",
                "set_num_samples,500",
                "set_capture_pretrigger_buffer_size,250",
                "capture",
                "export_data,/data/run_0.009,analog_channels,0,voltage,all_time,binary,each_sample,32",
                "export_data,/data/run_1.009,analog_channels,1,voltage,all_time,binary,each_sample,32",
                "export_data,/data/run_2.009,analog_channels,2,voltage,all_time,binary,each_sample,32",
                "export_data,/data/run_3.009,analog_channels,3,voltage,all_time,binary,each_sample,32",
            ]
        );
        // One completion poll after the capture and after each export
        assert_eq!(polls, 5);
        assert_eq!(h.config.snapshot().output_path, "/data/run.010");
        assert!(h.drain().contains(&SessionUpdate::SequenceFinished));
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_pending_polls_wait_for_timer() {
        let mut h = Harness::connected(acquisition(1, false));
        h.session.acquire().unwrap();
        for _ in 0..4 {
            h.reply("ACK");
        }
        assert_eq!(h.transport.last().unwrap(), "capture");
        h.reply("ACK");
        assert_eq!(h.transport.last().unwrap(), "is_processing_complete");
        let before = h.transport.sent().len();

        for round in 1..=3 {
            h.reply("FALSE\nACK");
            // Nothing goes out until the poll timer fires
            assert_eq!(h.transport.sent().len(), before + round - 1);
            assert!(h.session.poll_deadline().is_some());
            h.session.handle(SessionEvent::PollDue);
            assert_eq!(h.transport.sent().len(), before + round);
            assert_eq!(h.transport.last().unwrap(), "is_processing_complete");
        }

        h.reply("TRUE\nACK");
        assert!(h.transport.last().unwrap().starts_with("export_data,/data/run_0.009"));
        assert_eq!(h.transport.sent().len(), before + 4);
    }

    #[test]
    fn test_reply_split_across_reads_is_dispatched_once() {
        let mut h = Harness::connected(acquisition(2, false));
        h.session.acquire().unwrap();
        for _ in 0..4 {
            h.reply("ACK");
        }
        assert_eq!(h.transport.last().unwrap(), "capture");
        h.reply("AC");
        assert_eq!(h.transport.last().unwrap(), "capture");
        h.reply("K");
        assert_eq!(h.transport.last().unwrap(), "is_processing_complete");

        h.reply("TRUE\n");
        assert_eq!(h.transport.last().unwrap(), "is_processing_complete");
        assert_eq!(h.session.phase(), Phase::ExpectingProcessingPoll);
        h.reply("ACK");
        assert!(h.transport.last().unwrap().starts_with("export_data,/data/run_0.009"));
        assert_eq!(h.session.phase(), Phase::ExpectingCommandResponse);

        // The export is still unanswered; nothing else may go out
        let count = h.transport.sent().len();
        h.session.handle(SessionEvent::PollDue);
        assert_eq!(h.transport.sent().len(), count);

        h.reply("ACK");
        assert_eq!(h.transport.last().unwrap(), "is_processing_complete");
        assert_eq!(h.transport.sent().len(), count + 1);
    }

    #[test]
    fn test_nak_to_poll_polls_again() {
        let mut h = Harness::connected(acquisition(1, false));
        h.session.acquire().unwrap();
        for _ in 0..5 {
            h.reply("ACK");
        }
        assert_eq!(h.transport.last().unwrap(), "is_processing_complete");
        let before = h.transport.sent().len();

        h.reply("NAK");
        assert_eq!(h.session.phase(), Phase::ExpectingProcessingPoll);
        assert!(h.session.poll_deadline().is_some());
        h.session.handle(SessionEvent::PollDue);
        assert_eq!(h.transport.sent().len(), before + 1);

        h.reply("TRUE\nACK");
        assert!(h.transport.last().unwrap().starts_with("export_data,/data/run_0.009"));
        assert!(
            !h.drain()
                .iter()
                .any(|u| matches!(u, SessionUpdate::SequenceHalted(_)))
        );
    }

    #[test]
    fn test_nak_halts_sequence_for_good() {
        let mut h = Harness::connected(acquisition(2, false));
        h.session.acquire().unwrap();
        h.reply("ACK");
        assert_eq!(h.transport.last().unwrap(), "set_trigger,negedge");
        h.reply("NAK");

        let count = h.transport.sent().len();
        assert_eq!(h.session.phase(), Phase::Idle);
        assert_eq!(h.session.pipeline(), &PipelineState::default());

        // Stray traffic and timers must not resume the chain
        h.reply("ACK");
        h.session.handle(SessionEvent::PollDue);
        assert_eq!(h.transport.sent().len(), count);

        let updates = h.drain();
        assert!(updates.contains(&SessionUpdate::Status("Set trigger: NAK".into())));
        assert!(updates.contains(&SessionUpdate::SequenceHalted("NAK".into())));
        assert!(!updates.contains(&SessionUpdate::SequenceFinished));
    }

    #[test]
    fn test_repeat_restarts_with_incremented_path() {
        let mut h = Harness::connected(acquisition(2, true));
        h.session.acquire().unwrap();
        // Step through until the second acquisition has begun
        let mut guard = 0;
        loop {
            guard += 1;
            assert!(guard < 100);
            let exports = h
                .transport
                .sent()
                .iter()
                .filter(|c| c.starts_with("export_data"))
                .count();
            if exports == 2 && h.transport.last().unwrap().starts_with("set_active_channels") {
                break;
            }
            if h.transport.last().unwrap() == "is_processing_complete" {
                h.reply("TRUE\nACK");
            } else {
                h.reply("ACK");
            }
        }
        assert_eq!(h.config.snapshot().output_path, "/data/run.010");

        // The next capture exports under the advanced name
        for _ in 0..5 {
            h.reply("ACK");
        }
        h.reply("TRUE\nACK");
        assert!(h.transport.last().unwrap().starts_with("export_data,/data/run_0.010"));
    }

    #[test]
    fn test_live_config_edits_apply_to_next_step() {
        let mut h = Harness::connected(acquisition(1, false));
        h.session.acquire().unwrap();
        h.config.update(|cfg| cfg.trigger_mode = TriggerMode::High);
        h.reply("ACK");
        assert_eq!(h.transport.last().unwrap(), "set_trigger,high");
    }

    #[test]
    fn test_missing_sample_rate_halts_before_sending() {
        let mut config = acquisition(1, false);
        config.analog_rate = 0.0;
        let mut h = Harness::connected(config);
        h.session.acquire().unwrap();
        h.reply("ACK");
        h.reply("ACK");
        assert_eq!(h.transport.last().unwrap(), "set_trigger,negedge");
        assert_eq!(h.session.phase(), Phase::Idle);
        assert!(
            h.drain()
                .iter()
                .any(|u| matches!(u, SessionUpdate::SequenceHalted(_)))
        );
    }

    #[test]
    fn test_operator_requests_need_idle_link() {
        let mut h = Harness::new(acquisition(1, false));
        assert!(matches!(h.session.acquire(), Err(LogicError::NotConnected)));
        assert!(h.transport.sent().is_empty());
        assert!(h.drain().iter().all(|u| !matches!(u, SessionUpdate::Status(_))));

        let mut h = Harness::connected(acquisition(2, false));
        h.session.acquire().unwrap();
        assert!(matches!(h.session.acquire(), Err(LogicError::Busy)));
        assert!(matches!(
            h.session.select_device("1, Logic Pro 07"),
            Err(LogicError::Busy)
        ));
        // Empty selections are the blank list entry
        assert!(h.session.select_sample_rate("").is_ok());
    }

    #[test]
    fn test_disconnect_mid_sequence_is_idempotent() {
        let mut h = Harness::connected(acquisition(2, false));
        h.session.acquire().unwrap();
        h.session.handle(SessionEvent::Disconnect);
        h.session.handle(SessionEvent::Disconnect);
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.session.phase(), Phase::Idle);

        // Late reply from the old link is ignored
        h.reply("ACK");
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[test]
    fn test_stale_link_events_are_dropped_after_reconnect() {
        let mut h = Harness::connected(acquisition(1, false));
        h.session.handle(SessionEvent::Connect {
            host: "127.0.0.1".into(),
            port: 10429,
        });
        // Old link reports closure after the new one was requested
        h.session.handle(SessionEvent::Link {
            id: 1,
            event: LinkEvent::Down,
        });
        h.link = 2;
        h.link_event(LinkEvent::Up);
        assert_eq!(h.session.state(), SessionState::AwaitingDeviceList);
        assert_eq!(h.transport.last().unwrap(), "get_connected_devices");
    }

    /// Minimal stand-in for the Logic application's socket server
    fn fake_device(
        listener: TcpListener,
        incomplete_polls: usize,
    ) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut log = Vec::new();
            let mut pending = incomplete_polls;
            let mut current = Vec::new();
            let mut byte = [0u8; 1];
            while socket.read(&mut byte).map(|n| n == 1).unwrap_or(false) {
                if byte[0] != 0 {
                    current.push(byte[0]);
                    continue;
                }
                let command = String::from_utf8(mem::take(&mut current)).unwrap();
                let reply = match command.as_str() {
                    "get_connected_devices" => "1, Logic Pro 03\nACK".to_string(),
                    "get_all_sample_rates" => "500000,125000\nACK".to_string(),
                    "is_processing_complete" if pending > 0 => {
                        pending -= 1;
                        "FALSE\nACK".to_string()
                    }
                    "is_processing_complete" => {
                        pending = incomplete_polls;
                        "TRUE\nACK".to_string()
                    }
                    _ => "ACK".to_string(),
                };
                log.push(command);
                socket.write_all(reply.as_bytes()).unwrap();
            }
            log
        })
    }

    fn wait_for(
        updates: &Receiver<SessionUpdate>,
        pred: impl Fn(&SessionUpdate) -> bool,
    ) -> SessionUpdate {
        loop {
            let update = updates.recv_timeout(Duration::from_secs(10)).unwrap();
            if pred(&update) {
                return update;
            }
        }
    }

    #[test]
    fn test_end_to_end_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = fake_device(listener, 2);

        let config = SharedConfig::new(AcquisitionConfig {
            channel_count: 2,
            output_path: "/tmp/run.001".to_string(),
            ..AcquisitionConfig::default()
        });
        let runner = spawn(
            TcpTransport::default(),
            config.clone(),
            Duration::from_millis(10),
            None,
        )
        .unwrap();
        let handle = runner.handle.clone();

        handle.connect("127.0.0.1", port).unwrap();
        let devices = wait_for(&runner.updates, |u| matches!(u, SessionUpdate::Devices(_)));
        assert_eq!(
            devices,
            SessionUpdate::Devices(vec!["".into(), "1, Logic Pro 03".into()])
        );

        handle.select_device("1, Logic Pro 03").unwrap();
        let rates = wait_for(&runner.updates, |u| matches!(u, SessionUpdate::SampleRates(_)));
        assert_eq!(
            rates,
            SessionUpdate::SampleRates(vec!["".into(), "500000,125000".into()])
        );

        handle.select_sample_rate("500000,125000").unwrap();
        wait_for(&runner.updates, |u| {
            *u == SessionUpdate::Status("Select sample rate: ACK".into())
        });

        handle.acquire().unwrap();
        let done = wait_for(&runner.updates, |u| {
            matches!(u, SessionUpdate::SequenceFinished | SessionUpdate::SequenceHalted(_))
        });
        assert_eq!(done, SessionUpdate::SequenceFinished);

        handle.shutdown().unwrap();
        runner.thread.join().unwrap();

        let log = device.join().unwrap();
        let exports: Vec<&String> = log.iter().filter(|c| c.starts_with("export_data")).collect();
        assert_eq!(exports.len(), 2);
        assert!(exports[0].starts_with("export_data,/tmp/run_0.001,analog_channels,0,"));
        assert!(exports[1].starts_with("export_data,/tmp/run_1.001,analog_channels,1,"));
        assert!(log.contains(&"set_num_samples,4000".to_string()));
        assert!(
            log.contains(&"set_active_channels,digital_channels,2,analog_channels,0,1".to_string())
        );
        assert_eq!(config.snapshot().output_path, "/tmp/run.002");
    }
}
