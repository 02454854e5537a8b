use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use radio_core::hci::{HCI_SUCCESS, READ_LOCAL_VERSION, TEXAS_INSTRUMENTS};
use radio_core::{
    BringUpConfig, ChipId, ChipVersion, Completion, ControllerError, CoreId, EventRoute, HciError,
    HciEvent, HciLink, HciStatus, InitScriptRunner, PowerError, PowerSequencer, RadioController,
    ScriptError, ScriptProgress, StackHandle, StackKind, StackNotification,
};
use winnow::ascii::{Caseless, dec_uint, space0, space1};
use winnow::combinator::{alt, delimited, opt, preceded};
use winnow::prelude::*;

const CHIP: ChipId = ChipId(0);
const VENDOR_OPCODE: u16 = 0xFF36;
/// Status the simulated chip reports when told to fail.
const UNSPECIFIED_ERROR: u8 = 0x1f;
/// LMP subversion of a 7.2.26 part.
const DEFAULT_SUBVERSION: u16 = (7 << 10) | (2 << 7) | 26;
const JOURNAL_TAIL: usize = 16;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("on", "on <bt|fm|gps>        - power a stack up"),
    ("off", "off <bt|fm|gps>       - power a stack down"),
    ("abort", "abort <bt|fm|gps>     - cancel a bring-up in progress"),
    ("step", "step [count]          - deliver pending link replies"),
    ("run", "run                   - deliver link replies until none remain"),
    ("fail", "fail                  - make the next link reply fail"),
    ("reset", "reset                 - reinitialize the chip after a failure"),
    ("status", "status                - show stack and transport state"),
    ("log", "log                   - show recent lifecycle transitions"),
    ("help", "help [topic]          - show help for a command"),
];

/// Parsed REPL command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    On(StackKind),
    Off(StackKind),
    Abort(StackKind),
    Step(u8),
    Run,
    Fail,
    Reset,
    Status,
    Log,
}

fn stack(input: &mut &str) -> ModalResult<StackKind> {
    alt((
        alt((Caseless("bluetooth"), Caseless("bt"))).value(StackKind::Bluetooth),
        Caseless("fm").value(StackKind::Fm),
        Caseless("gps").value(StackKind::Gps),
    ))
    .parse_next(input)
}

fn command(input: &mut &str) -> ModalResult<Command> {
    delimited(
        space0,
        alt((
            preceded((Caseless("on"), space1), stack).map(Command::On),
            preceded((Caseless("off"), space1), stack).map(Command::Off),
            preceded((Caseless("abort"), space1), stack).map(Command::Abort),
            preceded(Caseless("step"), opt(preceded(space1, dec_uint::<_, u8, _>)))
                .map(|count| Command::Step(count.unwrap_or(1))),
            Caseless("run").value(Command::Run),
            Caseless("fail").value(Command::Fail),
            Caseless("reset").value(Command::Reset),
            Caseless("status").value(Command::Status),
            Caseless("log").value(Command::Log),
        )),
        space0,
    )
    .parse_next(input)
}

/// Parses one REPL line.
///
/// # Errors
///
/// Returns the byte offset where the line stopped matching the grammar.
pub fn parse_command(line: &str) -> Result<Command, usize> {
    command.parse(line).map_err(|error| error.offset())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    pub script_steps: usize,
    pub subversion: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            script_steps: 2,
            subversion: DEFAULT_SUBVERSION,
        }
    }
}

/// Link request waiting for its reply.
#[derive(Clone, Copy, Debug)]
enum Request {
    TransportOn,
    TransportOff,
    ConfigureLink,
    Command(u16),
}

/// State of the simulated chip shared by the link, power and script models.
struct Wire {
    route: EventRoute,
    requests: VecDeque<Request>,
    fail_next: bool,
    subversion: u16,
    enables: [bool; 3],
}

impl Wire {
    fn status(&mut self) -> u8 {
        if std::mem::take(&mut self.fail_next) {
            UNSPECIFIED_ERROR
        } else {
            HCI_SUCCESS
        }
    }

    /// Builds the chip's answer to `request`; the status is decided now.
    fn reply(&mut self, request: Request) -> HciEvent {
        let status = self.status();
        match request {
            Request::TransportOn => HciEvent::TransportOnCompleted { status },
            Request::TransportOff => HciEvent::TransportOffCompleted { status },
            Request::ConfigureLink => HciEvent::LinkConfigured { status },
            Request::Command(READ_LOCAL_VERSION) => {
                let mut params = [0u8; 12];
                params[0] = 1;
                params[1..3].copy_from_slice(&READ_LOCAL_VERSION.to_le_bytes());
                params[3] = status;
                params[8..10].copy_from_slice(&TEXAS_INSTRUMENTS.to_le_bytes());
                params[10..12].copy_from_slice(&self.subversion.to_le_bytes());
                HciEvent::command_complete(READ_LOCAL_VERSION, status, &params)
            }
            Request::Command(opcode) => HciEvent::command_complete(opcode, status, &[]),
        }
    }
}

type Shared = Rc<RefCell<Wire>>;

/// Link model: every request completes later, when `step` delivers its reply.
struct SimLink(Shared);

impl SimLink {
    fn queue(&self, request: Request) -> Result<HciStatus, HciError> {
        log::debug!("link: {request:?} requested");
        self.0.borrow_mut().requests.push_back(request);
        Ok(HciStatus::Pending)
    }
}

impl HciLink for SimLink {
    fn transport_on(&mut self) -> Result<HciStatus, HciError> {
        self.queue(Request::TransportOn)
    }

    fn transport_off(&mut self) -> Result<HciStatus, HciError> {
        self.queue(Request::TransportOff)
    }

    fn configure_link(&mut self) -> Result<HciStatus, HciError> {
        self.queue(Request::ConfigureLink)
    }

    fn send_command(&mut self, opcode: u16, _params: &[u8]) -> Result<HciStatus, HciError> {
        self.queue(Request::Command(opcode))
    }

    fn replace_event_route(&mut self, route: EventRoute) -> EventRoute {
        std::mem::replace(&mut self.0.borrow_mut().route, route)
    }

    fn event_route(&self) -> EventRoute {
        self.0.borrow().route
    }
}

struct SimPower(Shared);

impl SimPower {
    fn line(core: CoreId) -> usize {
        match core {
            CoreId::Bt => 0,
            CoreId::Fm => 1,
            CoreId::Gps => 2,
        }
    }
}

impl PowerSequencer for SimPower {
    fn assert_enable(&mut self, _chip: ChipId, core: CoreId) -> Result<(), PowerError> {
        log::info!("power: {core:?} enable asserted");
        self.0.borrow_mut().enables[Self::line(core)] = true;
        Ok(())
    }

    fn deassert_enable(&mut self, _chip: ChipId, core: CoreId) -> Result<(), PowerError> {
        log::info!("power: {core:?} enable released");
        self.0.borrow_mut().enables[Self::line(core)] = false;
        Ok(())
    }
}

/// Init script of a fixed number of vendor commands.
struct SimScript {
    steps: usize,
    remaining: usize,
    aborting: bool,
}

impl SimScript {
    fn send_next(&self, hci: &mut dyn HciLink) -> ScriptProgress {
        log::debug!("script: {} command(s) left", self.remaining);
        match hci.send_command(VENDOR_OPCODE, &[]) {
            Ok(_) => ScriptProgress::Running,
            Err(error) => {
                log::warn!("script: command rejected: {error}");
                ScriptProgress::Finished(Err(ScriptError::CommandFailed(UNSPECIFIED_ERROR)))
            }
        }
    }
}

impl InitScriptRunner for SimScript {
    fn start(&mut self, name: &str, hci: &mut dyn HciLink) -> ScriptProgress {
        log::info!("script: loading {name}");
        self.remaining = self.steps;
        self.aborting = false;
        if self.remaining == 0 {
            return ScriptProgress::Finished(Ok(()));
        }
        self.send_next(hci)
    }

    fn command_completed(
        &mut self,
        status: u8,
        _params: &[u8],
        hci: &mut dyn HciLink,
    ) -> ScriptProgress {
        self.remaining = self.remaining.saturating_sub(1);
        if std::mem::take(&mut self.aborting) {
            return ScriptProgress::Finished(Err(ScriptError::Aborted));
        }
        if status != HCI_SUCCESS {
            return ScriptProgress::Finished(Err(ScriptError::CommandFailed(status)));
        }
        if self.remaining == 0 {
            return ScriptProgress::Finished(Ok(()));
        }
        self.send_next(hci)
    }

    fn params_applied(&mut self, _hci: &mut dyn HciLink) -> ScriptProgress {
        ScriptProgress::Running
    }

    fn abort(&mut self, _hci: &mut dyn HciLink) -> ScriptProgress {
        if self.remaining > 0 {
            self.aborting = true;
            ScriptProgress::Running
        } else {
            ScriptProgress::Finished(Err(ScriptError::Aborted))
        }
    }
}

type Client = Box<dyn FnMut(StackNotification)>;
type Observer = Box<dyn FnMut(ChipId, ChipVersion)>;
type Controller = RadioController<SimLink, SimPower, SimScript, Client, Observer>;

pub struct Session {
    controller: Controller,
    handles: Vec<StackHandle>,
    wire: Shared,
    /// Lines produced by client callbacks since the last command.
    outbox: Rc<RefCell<Vec<String>>>,
    transcript: Option<Transcript>,
    started_at: Instant,
}

impl Session {
    /// Builds a session with one simulated chip and all three stacks registered.
    ///
    /// # Errors
    ///
    /// Fails when the transcript file cannot be created.
    pub fn new(options: SessionOptions, transcript: Option<&Path>) -> io::Result<Self> {
        let wire: Shared = Rc::new(RefCell::new(Wire {
            route: EventRoute::Unclaimed,
            requests: VecDeque::new(),
            fail_next: false,
            subversion: options.subversion,
            enables: [false; 3],
        }));
        let outbox = Rc::new(RefCell::new(Vec::new()));

        let observer: Observer = {
            let outbox = outbox.clone();
            Box::new(move |chip: ChipId, version: ChipVersion| {
                outbox
                    .borrow_mut()
                    .push(format!("EVT chip {} identified as {version}", chip.0));
            })
        };

        let mut controller = Controller::new();
        controller
            .add_chip(
                CHIP,
                SimLink(wire.clone()),
                SimPower(wire.clone()),
                SimScript {
                    steps: options.script_steps,
                    remaining: 0,
                    aborting: false,
                },
                observer,
                BringUpConfig::new(),
            )
            .map_err(io::Error::other)?;

        let mut handles = Vec::with_capacity(StackKind::ALL.len());
        for kind in StackKind::ALL {
            let outbox = outbox.clone();
            let client: Client = Box::new(move |notification: StackNotification| {
                outbox.borrow_mut().push(format!(
                    "EVT {} {:?} {:?}",
                    stack_label(notification.stack),
                    notification.event,
                    notification.status
                ));
            });
            let handle = controller
                .register_stack(CHIP, kind, client)
                .map_err(io::Error::other)?;
            handles.push(handle);
        }

        let transcript = transcript.map(Transcript::create).transpose()?;

        Ok(Self {
            controller,
            handles,
            wire,
            outbox,
            transcript,
            started_at: Instant::now(),
        })
    }

    /// Runs one REPL line and returns the lines to print.
    ///
    /// # Errors
    ///
    /// Fails only when the transcript cannot be written.
    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let elapsed = self.started_at.elapsed();
        self.record(elapsed, Role::Host, &[trimmed.to_string()])?;

        let lines = if trimmed.eq_ignore_ascii_case("help") {
            help(None)
        } else if let Some(topic) = trimmed.strip_prefix("help ") {
            help(Some(topic.trim()))
        } else {
            match parse_command(trimmed) {
                Ok(command) => self.execute(command),
                Err(offset) => vec![format!("ERR syntax at column {}", offset + 1)],
            }
        };

        self.record(elapsed, Role::Emulator, &lines)?;
        Ok(lines)
    }

    fn execute(&mut self, command: Command) -> Vec<String> {
        let mut lines = match command {
            Command::On(kind) => {
                let reply = self.controller.stack_on(self.handle(kind));
                vec![describe_reply("on", kind, reply)]
            }
            Command::Off(kind) => {
                let reply = self.controller.stack_off(self.handle(kind));
                vec![describe_reply("off", kind, reply)]
            }
            Command::Abort(kind) => {
                let reply = self.controller.stack_on_abort(self.handle(kind));
                vec![describe_reply("abort", kind, reply)]
            }
            Command::Step(count) => self.step(usize::from(count)),
            Command::Run => self.step(usize::MAX),
            Command::Fail => {
                self.wire.borrow_mut().fail_next = true;
                vec!["OK next link reply will fail".to_string()]
            }
            Command::Reset => match self.controller.reinitialize(CHIP) {
                Ok(()) => vec!["OK chip reinitialized".to_string()],
                Err(error) => vec![format!("ERR reset {error}")],
            },
            Command::Status => self.status(),
            Command::Log => self.journal(),
        };
        lines.append(&mut self.outbox.borrow_mut());
        lines
    }

    fn handle(&self, kind: StackKind) -> StackHandle {
        self.handles[kind.index()]
    }

    fn step(&mut self, limit: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..limit {
            let Some(request) = self.wire.borrow_mut().requests.pop_front() else {
                break;
            };
            let event = self.wire.borrow_mut().reply(request);
            let outcome = match self.controller.handle_hci_event(CHIP, &event) {
                Ok(Completion::Success) => "done".to_string(),
                Ok(Completion::Pending) => "pending".to_string(),
                Err(error) => format!("rejected ({error})"),
            };
            lines.push(format!("HCI {} -> {outcome}", describe_event(&event)));
            lines.append(&mut self.outbox.borrow_mut());
        }
        if lines.is_empty() {
            lines.push("OK no link replies pending".to_string());
        }
        lines
    }

    fn status(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match self.controller.transport_state(CHIP) {
            Ok(state) => lines.push(format!("transport {state:?}")),
            Err(error) => lines.push(format!("ERR transport {error}")),
        }
        let wire = self.wire.borrow();
        for kind in StackKind::ALL {
            let handle = self.handle(kind);
            let state = self
                .controller
                .state(handle)
                .map_or_else(|error| error.to_string(), |state| format!("{state:?}"));
            let enable = if wire.enables[kind.index()] {
                "asserted"
            } else {
                "released"
            };
            lines.push(format!("  {:<4} {state} enable={enable}", stack_label(kind)));
        }
        lines.push(format!("  pending link replies: {}", wire.requests.len()));
        drop(wire);
        if let Some(handle) = self.handles.first() {
            match self.controller.chip_version(*handle) {
                Ok(version) => lines.push(format!("  chip version {version}")),
                Err(ControllerError::VersionUnavailable) => {
                    lines.push("  chip version unknown".to_string());
                }
                Err(error) => lines.push(format!("  ERR version {error}")),
            }
        }
        lines
    }

    fn journal(&self) -> Vec<String> {
        self.controller
            .with_journal(CHIP, |journal| {
                let skip = journal.len().saturating_sub(JOURNAL_TAIL);
                journal
                    .oldest_first()
                    .skip(skip)
                    .map(|record| format!("  #{:<4} {}", record.id, record.kind))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|error| vec![format!("ERR log {error}")])
    }

    fn record(&mut self, elapsed: Duration, role: Role, lines: &[String]) -> io::Result<()> {
        let Some(transcript) = self.transcript.as_mut() else {
            return Ok(());
        };
        for line in lines {
            transcript.append_line(elapsed, role, line)?;
        }
        Ok(())
    }
}

fn stack_label(kind: StackKind) -> &'static str {
    match kind {
        StackKind::Bluetooth => "bt",
        StackKind::Fm => "fm",
        StackKind::Gps => "gps",
    }
}

fn describe_reply(
    verb: &str,
    kind: StackKind,
    reply: Result<Completion, ControllerError>,
) -> String {
    let label = stack_label(kind);
    match reply {
        Ok(Completion::Success) => format!("OK {verb} {label} completed"),
        Ok(Completion::Pending) => format!("OK {verb} {label} pending"),
        Err(error) => format!("ERR {verb} {label}: {error}"),
    }
}

fn describe_event(event: &HciEvent) -> String {
    match event {
        HciEvent::TransportOnCompleted { status } => format!("transport-on status={status}"),
        HciEvent::TransportOffCompleted { status } => format!("transport-off status={status}"),
        HciEvent::CommandComplete { opcode, status, .. } => {
            format!("command-complete opcode={opcode:#06x} status={status}")
        }
        HciEvent::TransportParamsApplied => "params-applied".to_string(),
        HciEvent::LinkConfigured { status } => format!("link-configured status={status}"),
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    match topic {
        Some(target) if !target.is_empty() => HELP_TOPICS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(target))
            .map_or_else(
                || {
                    let topics: Vec<&str> = HELP_TOPICS.iter().map(|(name, _)| *name).collect();
                    vec![
                        format!("No help available for `{target}`."),
                        format!("Available topics: {}", topics.join(", ")),
                    ]
                },
                |(_, detail)| vec![(*detail).to_string()],
            ),
        _ => {
            let mut lines = vec!["Available commands:".to_string()];
            lines.extend(HELP_TOPICS.iter().map(|(_, detail)| format!("  {detail}")));
            lines.push("Type `help <topic>` for a specific command.".to_string());
            lines
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Host,
    Emulator,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Host => "HOST>",
            Role::Emulator => "EMU <",
        }
    }
}

struct Transcript {
    path: PathBuf,
    writer: BufWriter<fs::File>,
}

impl Transcript {
    fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut transcript = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        };
        writeln!(transcript.writer, "# Radio emulator transcript")?;
        writeln!(
            transcript.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(transcript.writer)?;
        transcript.writer.flush()?;
        Ok(transcript)
    }

    fn append_line(&mut self, elapsed: Duration, role: Role, line: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )
        .and_then(|()| self.writer.flush())
        .map_err(|error| {
            io::Error::new(
                error.kind(),
                format!("{}: {error}", self.path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(script_steps: usize) -> Session {
        Session::new(
            SessionOptions {
                script_steps,
                ..SessionOptions::default()
            },
            None,
        )
        .expect("session without transcript")
    }

    fn run(session: &mut Session, line: &str) -> Vec<String> {
        session.handle_command(line).expect("no transcript to fail")
    }

    #[test]
    fn grammar_accepts_stack_commands() {
        assert_eq!(parse_command("on bt"), Ok(Command::On(StackKind::Bluetooth)));
        assert_eq!(parse_command("OFF Gps"), Ok(Command::Off(StackKind::Gps)));
        assert_eq!(parse_command("abort fm "), Ok(Command::Abort(StackKind::Fm)));
        assert_eq!(parse_command("step"), Ok(Command::Step(1)));
        assert_eq!(parse_command("step 5"), Ok(Command::Step(5)));
        assert_eq!(parse_command("log"), Ok(Command::Log));
    }

    #[test]
    fn grammar_rejects_unknown_stack() {
        assert!(parse_command("on wifi").is_err());
        assert!(parse_command("on").is_err());
        assert!(parse_command("step many").is_err());
    }

    #[test]
    fn bring_up_runs_to_completion() {
        let mut session = session(1);

        assert_eq!(run(&mut session, "on bt"), vec!["OK on bt pending"]);
        let lines = run(&mut session, "run");

        assert!(lines.iter().any(|line| line == "EVT chip 0 identified as 7.2.26"));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("EVT bt OnComplete Success")
        );
        assert_eq!(run(&mut session, "on fm"), vec!["OK on fm completed"]);
    }

    #[test]
    fn failed_link_reply_fails_the_stack() {
        let mut session = session(0);

        run(&mut session, "on gps");
        run(&mut session, "fail");
        let lines = run(&mut session, "step");

        assert_eq!(lines[0], "HCI transport-on status=31 -> done");
        assert_eq!(lines[1], "EVT gps OnComplete Failure");
        assert!(
            run(&mut session, "status")
                .iter()
                .any(|line| line.contains("FatalError"))
        );
        assert_eq!(run(&mut session, "reset"), vec!["OK chip reinitialized"]);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let mut session = session(0);
        let lines = run(&mut session, "on wifi");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ERR syntax at column"), "{lines:?}");
    }
}
