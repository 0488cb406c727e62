//! The leader core: owns the authoritative configuration and app graph,
//! serves peers, and fans actions out to followers.
//!
//! Single-threaded and cooperative: the embedding engine calls [`Leader::pull`]
//! once per iteration, and every descent into io is non-blocking.

use std::io::ErrorKind;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action;
use crate::graph::{compute_config_actions, AppGraph};
use crate::mutator;
use crate::paths;
use crate::schema::{self, parse_data, DataError, Schema, SchemaError, Value};

use super::follower::Follower;
use super::ipc::{self, ErrorPayload, Request, Response, ResponsePayload};
use super::peer::{Peer, PeerState, Progress};

/// Failure from the user-supplied setup function.
#[derive(Debug, Error)]
#[error("setup failed: {0}")]
pub struct SetupError(pub String);

/// `configuration → app graph`, pure.
pub type SetupFn = Box<dyn Fn(&Value) -> Result<AppGraph, SetupError> + Send>;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("failed to bind control socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("tick frequency must be positive")]
    ZeroHz,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("initial configuration invalid: {0}")]
    InitialConfig(#[from] DataError),

    #[error(transparent)]
    Setup(#[from] SetupError),
}

/// Constructor surface for [`Leader`].
pub struct LeaderOptions {
    /// Control socket path; relative names resolve under the pid directory.
    pub socket_file_name: String,
    /// Name of the registered schema configurations validate against.
    pub schema_name: String,
    /// Seed configuration, in printed form.
    pub initial_configuration: String,
    /// Pure function from configuration to app graph.
    pub setup_fn: SetupFn,
    /// Worker processes to ship actions to.
    pub follower_pids: Vec<u32>,
    /// Tick frequency.
    pub hz: u32,
}

impl LeaderOptions {
    pub fn new(schema_name: &str, initial_configuration: &str, setup_fn: SetupFn) -> Self {
        LeaderOptions {
            socket_file_name: "config-leader-socket".to_string(),
            schema_name: schema_name.to_string(),
            initial_configuration: initial_configuration.to_string(),
            setup_fn,
            follower_pids: Vec::new(),
            hz: 100,
        }
    }

    pub fn with_socket_file_name(mut self, name: &str) -> Self {
        self.socket_file_name = name.to_string();
        self
    }

    pub fn with_follower_pids(mut self, pids: Vec<u32>) -> Self {
        self.follower_pids = pids;
        self
    }

    pub fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }
}

pub struct Leader {
    schema: Arc<Schema>,
    current_configuration: Value,
    current_app_graph: AppGraph,
    setup_fn: SetupFn,
    peers: Vec<Peer>,
    followers: Vec<Follower>,
    listener: UnixListener,
    socket_path: PathBuf,
    period: Duration,
    next_time: Instant,
}

impl Leader {
    /// Validate the seed configuration, bind the control socket, and seed
    /// every follower's outbox with the actions that build the initial
    /// graph from nothing.
    pub fn new(options: LeaderOptions) -> Result<Leader, LeaderError> {
        if options.hz == 0 {
            return Err(LeaderError::ZeroHz);
        }
        let schema = schema::load(&options.schema_name)?;
        let current_configuration = parse_data(&schema.grammar, &options.initial_configuration)?;
        let current_app_graph = (options.setup_fn)(&current_configuration)?;

        // A hung-up peer must surface as a write error, not kill the
        // process.
        ignore_sigpipe();

        let socket_path = paths::socket_path(&options.socket_file_name);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LeaderError::Bind {
                path: socket_path.clone(),
                source,
            })?;
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).map_err(|source| LeaderError::Bind {
            path: socket_path.clone(),
            source,
        })?;
        listener.set_nonblocking(true).map_err(|source| LeaderError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        let mut followers: Vec<Follower> =
            options.follower_pids.iter().map(|&pid| Follower::new(pid)).collect();

        let initial_actions = compute_config_actions(&AppGraph::new(), &current_app_graph);
        let frames: Vec<Vec<u8>> = initial_actions.iter().map(action::encode).collect();
        for follower in &mut followers {
            for frame in &frames {
                follower.enqueue(frame.clone());
            }
        }

        info!(
            schema = %schema.name,
            socket = %socket_path.display(),
            followers = followers.len(),
            "leader listening"
        );

        Ok(Leader {
            schema,
            current_configuration,
            current_app_graph,
            setup_fn: options.setup_fn,
            peers: Vec::new(),
            followers,
            listener,
            socket_path,
            period: Duration::from_secs(1) / options.hz,
            next_time: Instant::now(),
        })
    }

    pub fn schema_name(&self) -> &str {
        &self.schema.name
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    pub fn configuration(&self) -> &Value {
        &self.current_configuration
    }

    pub fn app_graph(&self) -> &AppGraph {
        &self.current_app_graph
    }

    /// Frames still queued for a follower (not yet in its ring).
    pub fn follower_backlog(&self, pid: u32) -> Option<usize> {
        self.followers
            .iter()
            .find(|f| f.pid == pid)
            .map(Follower::queued)
    }

    /// One engine iteration: run a tick if its time has come.
    pub fn pull(&mut self) {
        self.tick(Instant::now());
    }

    /// Run the tick if `now` has reached the next deadline.
    pub fn tick(&mut self, now: Instant) {
        if now < self.next_time {
            return;
        }
        self.next_time = now + self.period;
        self.handle_calls_from_peers();
        self.send_messages_to_followers();
    }

    fn handle_calls_from_peers(&mut self) {
        self.accept_peers();

        let mut peers = std::mem::take(&mut self.peers);
        for peer in &mut peers {
            if let Progress::NeedsHandler = peer.service_read() {
                let response = match ipc::decode_request(peer.ready_payload().unwrap_or(&[])) {
                    Ok(request) => self.handle_request(request),
                    Err(e) => Response::err(e),
                };
                let reply = ipc::encode_response(&response);
                peer.begin_reply(reply);
            }
            peer.service_write();
        }
        peers.retain(|peer| {
            if let PeerState::Error { message } = &peer.state {
                warn!(error = %message, "peer terminated");
            }
            !peer.is_terminal()
        });
        self.peers = peers;
    }

    fn accept_peers(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(error = %e, "failed to set peer non-blocking");
                        continue;
                    }
                    debug!("accepted control connection");
                    self.peers.push(Peer::new(stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn send_messages_to_followers(&mut self) {
        for follower in &mut self.followers {
            follower.flush();
        }
    }

    fn handle_request(&mut self, request: Request) -> Response {
        if request.is_mutation() {
            if let Some(named) = request.schema() {
                if named != self.schema.name {
                    return Response::err(ipc::RpcError::SchemaMismatch {
                        expected: self.schema.name.clone(),
                        got: named.to_string(),
                    });
                }
            }
        }

        let result = match request {
            Request::Describe => Ok(ResponsePayload::Describe {
                native_schema: self.schema.name.clone(),
            }),
            Request::GetConfig { path, .. } => self.get_config(&path),
            Request::SetConfig { path, config, .. } => self.set_config(&path, &config),
            Request::AddConfig { path, config, .. } => self.add_config(&path, &config),
            Request::RemoveConfig { path, .. } => self.remove_config(&path),
        };
        match result {
            Ok(payload) => Response::ok(payload),
            Err(error) => Response::err(error),
        }
    }

    fn get_config(&self, path: &str) -> Result<ResponsePayload, ErrorPayload> {
        let op = mutator::get(&self.schema, path)?;
        let config = op.apply(&self.current_configuration)?;
        Ok(ResponsePayload::Config { config })
    }

    fn set_config(&mut self, path: &str, config: &str) -> Result<ResponsePayload, ErrorPayload> {
        let op = mutator::set(&self.schema, path)?;
        let new_config = op.apply(&self.current_configuration, config)?;
        self.commit(new_config)?;
        Ok(ResponsePayload::empty())
    }

    fn add_config(&mut self, path: &str, config: &str) -> Result<ResponsePayload, ErrorPayload> {
        let op = mutator::add(&self.schema, path)?;
        let new_config = op.apply(&self.current_configuration, config)?;
        self.commit(new_config)?;
        Ok(ResponsePayload::empty())
    }

    fn remove_config(&mut self, path: &str) -> Result<ResponsePayload, ErrorPayload> {
        let op = mutator::remove(&self.schema, path)?;
        let new_config = op.apply(&self.current_configuration)?;
        self.commit(new_config)?;
        Ok(ResponsePayload::empty())
    }

    /// Recompute the graph, stage the diff to every follower, and swap in
    /// the new state. Everything before the enqueue is pure, so a failure
    /// here leaves the leader exactly as it was.
    fn commit(&mut self, new_config: Value) -> Result<(), ErrorPayload> {
        let new_graph = (self.setup_fn)(&new_config)
            .map_err(|e| ErrorPayload::new("setup_failed", e.to_string()))?;
        let actions = compute_config_actions(&self.current_app_graph, &new_graph);
        debug!(actions = actions.len(), "configuration committed");
        let frames: Vec<Vec<u8>> = actions.iter().map(action::encode).collect();
        for follower in &mut self.followers {
            for frame in &frames {
                follower.enqueue(frame.clone());
            }
        }
        self.current_configuration = new_config;
        self.current_app_graph = new_graph;
        Ok(())
    }

    /// Close every peer and the listening socket, and unlink the socket
    /// path.
    pub fn stop(self) {
        info!(socket = %self.socket_path.display(), "leader stopping");
        drop(self.peers);
        drop(self.listener);
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: installing SigIgn for SIGPIPE does not hand control to any
    // user code.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        warn!(error = %e, "failed to ignore SIGPIPE");
    }
}
