// src/session.rs
use crate::block_device::{BlockDevice, CounterSnapshot, DiskError, IoCounters};
use crate::config::Config;
use crate::file_disk::FileDisk;
use crate::image_factory::create_image;
use crate::presentation::{LogStatusView, PresentationModel, StatusView};
use crate::throughput::ThroughputTracker;
use crate::transport::Transport;
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the operator to pick an image or a size for a new one.
    Start,
    /// Size chosen, waiting for the new image's name.
    NameEntry { size: u64 },
    /// Image created but the host link is busy.
    TransportLocked { path: PathBuf },
    Binding { path: PathBuf },
    Bound { path: PathBuf },
    Unbinding { path: PathBuf },
}

impl SessionState {
    /// States that only move on operator input.
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Start | SessionState::NameEntry { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            SessionState::Start => "Start",
            SessionState::NameEntry { .. } => "NameEntry",
            SessionState::TransportLocked { .. } => "TransportLocked",
            SessionState::Binding { .. } => "Binding",
            SessionState::Bound { .. } => "Bound",
            SessionState::Unbinding { .. } => "Unbinding",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    // Operator input
    SelectExisting(PathBuf),
    CreateNew { size: u64 },
    SubmitName(String),
    Cancel,
    // Host side
    Eject,
    // Periodic
    Tick,
    // Effect outcomes
    NameRejected(String),
    ImageCreated { path: PathBuf, transport_locked: bool },
    ImageCreateFailed(String),
    TransportUnlocked,
    BindSucceeded,
    BindFailed(String),
    Unbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CreateImage { name: String, size: u64 },
    Bind(PathBuf),
    PollTransport,
    Sample,
    Unbind,
    ReportError(String),
}

/// Session state machine. Pure: side effects are returned, not performed.
/// Events that don't apply to the current state leave it unchanged.
pub fn transition(state: SessionState, event: SessionEvent) -> (SessionState, Vec<Effect>) {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Start, E::SelectExisting(path)) => (S::Binding { path: path.clone() }, vec![Effect::Bind(path)]),
        (S::Start, E::CreateNew { size }) => (S::NameEntry { size }, vec![]),

        (S::NameEntry { size }, E::SubmitName(name)) => {
            (S::NameEntry { size }, vec![Effect::CreateImage { name, size }])
        }
        (S::NameEntry { size }, E::NameRejected(reason)) => {
            (S::NameEntry { size }, vec![Effect::ReportError(reason)])
        }
        (S::NameEntry { size }, E::ImageCreateFailed(reason)) => (
            S::NameEntry { size },
            vec![Effect::ReportError(format!("Could not create image: {}", reason))],
        ),
        (S::NameEntry { .. }, E::ImageCreated { path, transport_locked: true }) => {
            (S::TransportLocked { path }, vec![])
        }
        (S::NameEntry { .. }, E::ImageCreated { path, transport_locked: false }) => {
            (S::Binding { path: path.clone() }, vec![Effect::Bind(path)])
        }
        (S::NameEntry { .. }, E::Cancel) => (S::Start, vec![]),

        (S::TransportLocked { path }, E::Tick) => (S::TransportLocked { path }, vec![Effect::PollTransport]),
        (S::TransportLocked { path }, E::TransportUnlocked) => {
            (S::Binding { path: path.clone() }, vec![Effect::Bind(path)])
        }
        (S::TransportLocked { .. }, E::Cancel) => (S::Start, vec![]),

        (S::Binding { path }, E::BindSucceeded) => (S::Bound { path }, vec![]),
        (S::Binding { path }, E::BindFailed(reason)) => (
            S::Start,
            vec![Effect::ReportError(format!("Could not bind {:?}: {}", path, reason))],
        ),

        (S::Bound { path }, E::Tick) => (S::Bound { path }, vec![Effect::Sample]),
        (S::Bound { path }, E::Eject | E::Cancel) => (S::Unbinding { path }, vec![Effect::Unbind]),

        (S::Unbinding { .. }, E::Unbound) => (S::Start, vec![]),

        (state, event) => {
            trace!("{}: ignoring {:?}", state, event);
            (state, vec![])
        }
    }
}

/// Drives the session state machine against a transport.
///
/// Owns the bound device for the session's lifetime. Events come in through
/// the channel returned by `sender()` (operator input, Ctrl+C, host eject)
/// and from the tick timer while `run` is active.
pub struct SessionController<T: Transport> {
    config: Config,
    transport: T,
    state: SessionState,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    disk: Option<Arc<FileDisk>>,
    last_counters: CounterSnapshot,
    tracker: ThroughputTracker,
    model: PresentationModel,
    view: Box<dyn StatusView>,
    last_error: Option<String>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(config: Config, transport: T) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            transport,
            state: SessionState::Start,
            events_tx,
            events_rx,
            disk: None,
            last_counters: CounterSnapshot::default(),
            tracker: ThroughputTracker::new(Instant::now()),
            model: PresentationModel::default(),
            view: Box::new(LogStatusView::default()),
            last_error: None,
        }
    }

    pub fn with_view(mut self, view: Box<dyn StatusView>) -> Self {
        self.view = view;
        self
    }

    pub fn sender(&self) -> Sender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn presentation(&self) -> &PresentationModel {
        &self.model
    }

    /// Counters of the bound image, or the final totals of the last session.
    pub fn counters(&self) -> CounterSnapshot {
        match &self.disk {
            Some(disk) => disk.counters().snapshot(),
            None => self.last_counters,
        }
    }

    /// Events are queued that `run` hasn't consumed yet, such as a Ctrl+C
    /// cancel that arrived while the operator was typing.
    pub fn has_pending_events(&self) -> bool {
        !self.events_rx.is_empty()
    }

    /// Most recent error surfaced to the operator, if any.
    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Process events until the session needs operator input, i.e. it is in
    /// Start or NameEntry with nothing queued.
    pub fn run(&mut self) -> SessionState {
        let ticker = tick(self.config.tick);
        loop {
            if self.state.is_idle() {
                match self.events_rx.try_recv() {
                    Ok(event) => {
                        self.handle(event);
                        continue;
                    }
                    Err(_) => return self.state.clone(),
                }
            }

            let event = select! {
                recv(self.events_rx) -> msg => msg.unwrap_or(SessionEvent::Cancel),
                recv(ticker) -> _ => SessionEvent::Tick,
            };
            self.handle(event);
        }
    }

    /// Feed one event through the state machine, executing effects and any
    /// events they produce, until the machine settles.
    pub fn handle(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let from = self.state.name();
            let state = std::mem::replace(&mut self.state, SessionState::Start);
            let (next, effects) = transition(state, event);
            if next.name() != from {
                info!("Session: {} -> {}", from, next);
            }
            self.state = next;

            for effect in effects {
                if let Some(follow_up) = self.execute(effect) {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    fn execute(&mut self, effect: Effect) -> Option<SessionEvent> {
        debug!("Effect: {:?}", effect);
        match effect {
            Effect::CreateImage { name, size } => Some(self.create(&name, size)),
            Effect::Bind(path) => match self.bind(&path) {
                Ok(()) => Some(SessionEvent::BindSucceeded),
                Err(e) => Some(SessionEvent::BindFailed(e.to_string())),
            },
            Effect::PollTransport => {
                if self.transport.is_locked() {
                    None
                } else {
                    Some(SessionEvent::TransportUnlocked)
                }
            }
            Effect::Sample => {
                self.sample();
                None
            }
            Effect::Unbind => {
                self.unbind();
                Some(SessionEvent::Unbound)
            }
            Effect::ReportError(message) => {
                warn!("{}", message);
                self.last_error = Some(message);
                None
            }
        }
    }

    fn create(&mut self, name: &str, size: u64) -> SessionEvent {
        let path = match self.config.validate_name(name) {
            Ok(path) => path,
            Err(e) => return SessionEvent::NameRejected(e.to_string()),
        };

        let created = fs::create_dir_all(&self.config.folder)
            .map_err(DiskError::from)
            .and_then(|_| create_image(&path, size));

        match created {
            Ok(()) => SessionEvent::ImageCreated {
                path,
                transport_locked: self.transport.is_locked(),
            },
            Err(e) => SessionEvent::ImageCreateFailed(e.to_string()),
        }
    }

    fn bind(&mut self, path: &Path) -> Result<(), DiskError> {
        if !path.exists() {
            return Err(DiskError::Missing(path.to_path_buf()));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let disk = Arc::new(FileDisk::new(file, Arc::new(IoCounters::new()), self.events_tx.clone()));

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.tracker.reset(Instant::now());
        self.model.clear();
        self.model.set_file_name(&name);
        self.view.show_file_name(&name);

        if let Err(e) = self.transport.start(&name, disk.clone()) {
            disk.unbind();
            return Err(e);
        }

        info!("Bound {:?} ({} blocks)", path, disk.num_blocks());
        self.disk = Some(disk);
        Ok(())
    }

    fn sample(&mut self) {
        let Some(disk) = &self.disk else { return };
        let counters = disk.counters().snapshot();
        self.tracker.sample(counters, Instant::now());
        self.model.set_stats(counters, &self.tracker);
        self.view.show_stats(&self.model);
    }

    fn unbind(&mut self) {
        let Some(disk) = self.disk.take() else { return };

        // Waits for an in-flight command before the file is closed
        disk.unbind();
        self.transport.stop();

        self.last_counters = disk.counters().snapshot();
        self.model.set_stats(self.last_counters, &self.tracker);
        info!(
            "Unbound: {} bytes read, {} bytes written",
            self.last_counters.bytes_read, self.last_counters.bytes_written
        );
    }
}

impl<T: Transport> Drop for SessionController<T> {
    fn drop(&mut self) {
        self.unbind();
    }
}
