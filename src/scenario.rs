//! Scenario state machine
//!
//! A scenario provisions a topology, runs the server and client roles of
//! one test case under the tracer, and derives properties from the
//! resulting socket timeline. Namespaces are released when the run ends,
//! whichever way it ends.

use nix::unistd::Pid;
use regex::Regex;
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::config::{PreferenceThresholds, SuiteConfig};
use crate::error::{ScenarioError, ScenarioIssue, SetupError, TracerError};
use crate::event::{Event, EventKind, Origin, Syscall};
use crate::netns::{Namespaces, NetworkTool};
use crate::property::{Property, PropertyKind};
use crate::socket::{Socket, SocketId};
use crate::timeline::Timeline;
use crate::tracer::{ProcessHandle, Tracer};

/// Connects to port 0 only probe the resolver and never reach the wire
static PROBE_CONNECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" sin6?_port=0, ").expect("Invalid probe connect pattern"));

const LOOPBACK_NS: &str = "test-loopback";
const CLIENT_NS: &str = "test-client";
const SERVER_NS: &str = "test-server";
const CLIENT_ADDRESSES: [&str; 2] = ["192.0.2.2/24", "2001:DB8::2:2/64"];
const SERVER_ADDRESSES: [&str; 2] = ["192.0.2.1/24", "2001:DB8::2:1/64"];

/// Command run in place of a role script that cannot be launched
const FALLBACK_COMMAND: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    Loopback,
    Dualstack,
    V6Dropped,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 3] = [Self::Loopback, Self::Dualstack, Self::V6Dropped];

    pub fn name(self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Dualstack => "dualstack",
            Self::V6Dropped => "v6dropped",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Hostnames exported as `SOURCE` and `DESTINATION`
    pub fn endpoints(self) -> (&'static str, &'static str) {
        match self {
            Self::Loopback => ("localhost", "localhost"),
            Self::Dualstack | Self::V6Dropped => ("client.example.net", "server.example.net"),
        }
    }

    /// Namespace a role runs in
    pub fn namespace(self, origin: Origin) -> &'static str {
        match (self, origin) {
            (Self::Loopback, _) => LOOPBACK_NS,
            (_, Origin::Client) => CLIENT_NS,
            (_, Origin::Server) => SERVER_NS,
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    Idle,
    Prepared,
    ServerStarting,
    ServerReady,
    ServerTimeout,
    ClientStarting,
    ClientDone,
    ClientTimeout,
    EventProcessing,
    Postprocessed,
    CleanedUp,
}

/// What a scenario run needs from its surroundings
pub struct ScenarioContext<'a> {
    pub config: &'a SuiteConfig,
    pub network: &'a dyn NetworkTool,
}

/// One connection attempt as seen by the preference check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    pub attempted: f64,
    pub closed: Option<f64>,
}

impl Attempt {
    pub fn of(socket: &Socket) -> Option<Self> {
        Some(Self {
            attempted: socket.attempted?,
            closed: socket.closed,
        })
    }
}

/// Delay for which the preferred attempt was held before falling back
///
/// `None` when the preferred attempt started too late, was never closed,
/// closed almost immediately or outlived the fallback connection.
pub fn check_preferred(
    preferred: Attempt,
    fallback: Attempt,
    thresholds: &PreferenceThresholds,
) -> Option<f64> {
    if preferred.attempted > fallback.attempted + thresholds.ordering_slack {
        return None;
    }
    let closed = preferred.closed?;
    if closed < preferred.attempted + thresholds.min_delay {
        return None;
    }
    if let Some(fallback_closed) = fallback.closed {
        if closed > fallback_closed {
            return None;
        }
    }
    Some(closed - preferred.attempted)
}

fn is_probe_connect(call: &Syscall) -> bool {
    call.argument(1)
        .is_some_and(|address| PROBE_CONNECT.is_match(&address.to_string()))
}

fn is_so_error(call: &Syscall) -> bool {
    let arg = |index| call.argument(index).map(|arg| arg.as_int());
    arg(1) == Some(libc::SOL_SOCKET) && arg(2) == Some(libc::SO_ERROR)
}

pub struct Scenario {
    kind: ScenarioKind,
    testcase: String,
    state: ScenarioState,
    errors: Vec<ScenarioIssue>,
    listeners: Vec<SocketId>,
    connections: Vec<SocketId>,
    events: Vec<Event>,
    sockets: Vec<Socket>,
    server: Option<Pid>,
    client: Option<Pid>,
}

impl Scenario {
    pub fn new(kind: ScenarioKind, testcase: impl Into<String>) -> Self {
        Self {
            kind,
            testcase: testcase.into(),
            state: ScenarioState::Idle,
            errors: Vec::new(),
            listeners: Vec::new(),
            connections: Vec::new(),
            events: Vec::new(),
            sockets: Vec::new(),
            server: None,
            client: None,
        }
    }

    pub fn kind(&self) -> ScenarioKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn errors(&self) -> &[ScenarioIssue] {
        &self.errors
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, id: usize) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Socket> {
        self.listeners.iter().filter_map(|&id| self.sockets.get(id))
    }

    pub fn connections(&self) -> impl Iterator<Item = &Socket> {
        self.connections.iter().filter_map(|&id| self.sockets.get(id))
    }

    /// Exit code each role is expected to finish with
    pub fn expected_exit_code(&self, _origin: Origin) -> i32 {
        0
    }

    fn error(&mut self, issue: ScenarioIssue) {
        debug!("[{}] {}", self.kind, issue);
        self.errors.push(issue);
    }

    /// Record an error that aborts the run and hand it back
    fn fatal(&mut self, e: ScenarioError) -> ScenarioError {
        self.error(ScenarioIssue::Unexpected(e.to_string()));
        e
    }

    fn transition(&mut self, state: ScenarioState) {
        debug!("[{}] {:?} -> {:?}", self.kind, self.state, state);
        self.state = state;
    }

    /// Run the scenario once and return the properties it derived
    ///
    /// Timeouts, missing scripts and unexpected exit codes end up in
    /// `errors()`. Setup and tracer failures abort the run after the
    /// namespaces were released.
    pub fn run(&mut self, ctx: &ScenarioContext<'_>) -> Result<Vec<Property>, ScenarioError> {
        info!("*** {} / {} ***", self.testcase, self.kind);

        let mut namespaces = Namespaces::new(ctx.network);
        let result = self.run_in(ctx, &mut namespaces);
        drop(namespaces);
        self.transition(ScenarioState::CleanedUp);
        result
    }

    fn run_in(
        &mut self,
        ctx: &ScenarioContext<'_>,
        namespaces: &mut Namespaces<'_>,
    ) -> Result<Vec<Property>, ScenarioError> {
        if let Err(e) = self.prepare(ctx, namespaces) {
            return Err(self.fatal(e.into()));
        }
        self.transition(ScenarioState::Prepared);

        let mut tracer = Tracer::new(&ctx.config.tracer);
        let driven = self.drive(&mut tracer, ctx);
        let quit = tracer.quit();
        if let Err(e) = driven {
            return Err(self.fatal(e));
        }
        if let Err(e) = quit {
            return Err(self.fatal(e.into()));
        }

        self.transition(ScenarioState::EventProcessing);
        self.process_events(tracer.into_timeline());

        let properties = self.postprocess(&ctx.config.preference);
        self.transition(ScenarioState::Postprocessed);
        Ok(properties)
    }

    fn set_environment(&self, config: &SuiteConfig) {
        let (source, destination) = self.kind.endpoints();
        env::set_var("NETRESOLVE_BACKENDS", "any|loopback|numerichost|hosts");
        env::set_var("NETRESOLVE_SYSCONFDIR", &config.data_dir);
        env::set_var("DEFAULT_SERVICE", "http");
        env::set_var("SOURCE", source);
        env::set_var("DESTINATION", destination);
    }

    fn prepare(&self, ctx: &ScenarioContext<'_>, namespaces: &mut Namespaces<'_>) -> Result<(), SetupError> {
        self.set_environment(ctx.config);

        if self.kind == ScenarioKind::Loopback {
            return namespaces.add(LOOPBACK_NS);
        }

        for ns in [CLIENT_NS, SERVER_NS] {
            namespaces.add(ns)?;
        }
        ctx.network.add_veth(CLIENT_NS, SERVER_NS)?;
        for address in CLIENT_ADDRESSES {
            ctx.network.add_address(CLIENT_NS, CLIENT_NS, address)?;
        }
        for address in SERVER_ADDRESSES {
            ctx.network.add_address(SERVER_NS, SERVER_NS, address)?;
        }
        if self.kind == ScenarioKind::V6Dropped {
            ctx.network.drop_outbound_ipv6(CLIENT_NS)?;
        }
        Ok(())
    }

    /// Command line of one role: wrapper and script inside its namespace
    fn command(&self, ctx: &ScenarioContext<'_>, origin: Origin, script: &Path) -> Vec<String> {
        let mut command: Vec<String> = ctx.config.wrapper.iter().cloned().collect();
        command.push(script.display().to_string());
        ctx.network.exec_command(self.kind.namespace(origin), command)
    }

    fn start(
        &mut self,
        tracer: &mut Tracer,
        ctx: &ScenarioContext<'_>,
        origin: Origin,
    ) -> Result<ProcessHandle, TracerError> {
        let script = ctx.config.script(&self.testcase, origin.as_str());
        let fallback = [FALLBACK_COMMAND.to_string()];

        let launched = if script.exists() {
            let command = self.command(ctx, origin, &script);
            match tracer.new_child(origin, &command) {
                Err(TracerError::Launch { reason, .. }) => {
                    debug!("[{}] Launch failed: {}", origin, reason);
                    None
                }
                other => Some(other?),
            }
        } else {
            None
        };

        let handle = match launched {
            Some(handle) => handle,
            None => {
                self.error(ScenarioIssue::LaunchFailed {
                    script: script.display().to_string(),
                });
                tracer.new_child(origin, &fallback)?
            }
        };

        match origin {
            Origin::Server => self.server = Some(handle.pid),
            Origin::Client => self.client = Some(handle.pid),
        }
        Ok(handle)
    }

    /// Wait for the server's listen, then briefly for a second one
    fn await_listen(tracer: &mut Tracer, server: &ProcessHandle, ctx: &ScenarioContext<'_>) -> Result<(), TracerError> {
        let timeouts = &ctx.config.timeouts;
        tracer.set_deadline(timeouts.server_listen());
        tracer.wait(Some(server), Some("listen"))?;
        tracer.set_deadline(timeouts.second_listen());
        tracer.wait(Some(server), Some("listen"))?;
        Ok(())
    }

    fn drive(&mut self, tracer: &mut Tracer, ctx: &ScenarioContext<'_>) -> Result<(), ScenarioError> {
        let timeouts = &ctx.config.timeouts;

        self.transition(ScenarioState::ServerStarting);
        let server = self.start(tracer, ctx, Origin::Server)?;
        let listening = Self::await_listen(tracer, &server, ctx);
        match listening {
            Ok(_) => self.transition(ScenarioState::ServerReady),
            Err(TracerError::Timeout) => {
                self.error(ScenarioIssue::ServerTimeout);
                self.transition(ScenarioState::ServerTimeout);
            }
            Err(e) => return Err(e.into()),
        }

        self.transition(ScenarioState::ClientStarting);
        let client = self.start(tracer, ctx, Origin::Client)?;
        tracer.set_deadline(timeouts.client());
        match tracer.wait(Some(&client), None) {
            Ok(_) => self.transition(ScenarioState::ClientDone),
            Err(TracerError::Timeout) => {
                self.error(ScenarioIssue::ClientTimeout);
                self.transition(ScenarioState::ClientTimeout);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Walk the event log once, collecting listeners and connections
    pub fn process_events(&mut self, timeline: Timeline) {
        let (events, mut sockets) = timeline.into_parts();

        for event in &events {
            let call = match &event.kind {
                EventKind::Exit { code } => {
                    if Some(event.pid) == self.server {
                        debug!("Server exit code is {}.", code);
                    }
                    if Some(event.pid) == self.client {
                        debug!("Client exit code is {}.", code);
                    }
                    if *code != self.expected_exit_code(event.origin) {
                        self.error(ScenarioIssue::UnexpectedExitCode {
                            origin: event.origin,
                            code: *code,
                        });
                    }
                    continue;
                }
                EventKind::NewProcess { .. } => continue,
                EventKind::Syscall(call) => call,
            };
            let Some(id) = call.socket else {
                continue;
            };
            let Some(socket) = sockets.get_mut(id) else {
                continue;
            };

            match (call.name, event.origin) {
                ("listen", Origin::Server) => {
                    if !self.listeners.contains(&id) {
                        self.listeners.push(id);
                    }
                }
                ("connect", Origin::Client) => {
                    if !socket.is_inet() || is_probe_connect(call) {
                        continue;
                    }
                    socket.begin_connect(event.time, call.result);
                    if !self.connections.contains(&id) {
                        self.connections.push(id);
                    }
                }
                ("getsockopt", Origin::Client) if is_so_error(call) => {
                    if let Some(value) = call.argument(3).and_then(|arg| arg.pointee()) {
                        socket.status = Some(i64::from(value));
                    }
                }
                ("shutdown", _) if call.result == 0 => socket.shutdown = true,
                ("close", _) if call.result == 0 && !call.inherited => socket.closed = Some(event.time),
                _ => {}
            }
        }

        self.events = events;
        self.sockets = sockets;
    }

    fn connections_in(&self, domain: i32) -> Vec<&Socket> {
        self.connections().filter(|socket| socket.domain == domain).collect()
    }

    fn listens_on(&self, domain: i32) -> bool {
        self.listeners().any(|socket| socket.domain == domain)
    }

    /// Properties this scenario kind derives from the processed events
    pub fn postprocess(&self, thresholds: &PreferenceThresholds) -> Vec<Property> {
        match self.kind {
            ScenarioKind::Loopback => Vec::new(),
            ScenarioKind::Dualstack => vec![
                Property::new(PropertyKind::Ip4Listener, self.listens_on(libc::AF_INET)),
                Property::new(PropertyKind::Ip6Listener, self.listens_on(libc::AF_INET6)),
                Property::new(PropertyKind::ParallelConnect, self.connections.len() > 1),
            ],
            ScenarioKind::V6Dropped => {
                let v4 = self.connections_in(libc::AF_INET);
                let v6 = self.connections_in(libc::AF_INET6);
                let mut properties = vec![
                    Property::new(PropertyKind::Ip4Connection, !v4.is_empty()),
                    Property::new(PropertyKind::Ip6Connection, !v6.is_empty()),
                ];

                if let ([v4], [v6]) = (v4.as_slice(), v6.as_slice()) {
                    let delay = Attempt::of(v6)
                        .zip(Attempt::of(v4))
                        .and_then(|(preferred, fallback)| check_preferred(preferred, fallback, thresholds));
                    let cleanup = delay.is_some() && v4.shutdown && v4.closed.is_some();
                    properties.push(Property::new(PropertyKind::V6PreferredDelay, delay));
                    properties.push(Property::new(PropertyKind::ConnectionCleanup, cleanup));
                }
                properties
            }
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
