//! SSH command execution using russh crate

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect};
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConnectionInfo, Timeouts};
use crate::deadline::{DeadlineBoundedConnection, DeadlineGuard, DeadlineHandle};
use crate::error::{ExecutionError, ExitFailure, RunError, StreamKind};
use crate::keys::{Credential, KeySource, ResolvedCredential};
use crate::pipe::PipeSlot;
use crate::stream::{Capture, InputBinding, OutputBinding, claim_pipe, forward, join_stream};
use crate::traits::{CmdWorker, Runner, Sink, Source};

/// Buffer between the session pump and a caller's stdout/stderr pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Channel packets queued per output stream before the pump stops reading
const CHUNK_QUEUE: usize = 16;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Authenticated connection shared by every worker of a [`Remote`]
struct Transport {
    handle: client::Handle<SshClientHandler>,
    deadlines: DeadlineHandle,
    timeouts: Timeouts,
    /// Serializes dispatch phases, which mutate the shared deadlines
    dispatch: Mutex<()>,
    conn_info: ConnectionInfo,
}

impl Transport {
    /// Arm the handshake/dispatch deadlines until the guard drops
    fn arm_deadlines(&self) -> DeadlineGuard {
        self.deadlines
            .arm(self.timeouts.receive_timeout, self.timeouts.send_timeout)
    }
}

/// Remote command runner over one authenticated SSH connection
///
/// Every worker opens its own session channel on the shared connection.
pub struct Remote {
    transport: Arc<Transport>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("conn_info", &self.transport.conn_info)
            .field("timeouts", &self.transport.timeouts)
            .field("closed", &self.transport.handle.is_closed())
            .finish_non_exhaustive()
    }
}

impl Remote {
    /// Connect and authenticate
    ///
    /// The TCP dial is bounded by `timeouts.connection_timeout`; the SSH
    /// handshake and authentication run with the send/receive deadlines
    /// armed, and the deadlines are cleared once the connection is ready.
    ///
    /// # Errors
    /// Returns `RunError::Timeout`, `ConnectionFailed`, `AuthenticationFailed`
    /// or `SshKeyError`
    #[instrument(skip(credential, timeouts), fields(host = %conn_info.host, port = conn_info.port))]
    pub async fn connect(
        conn_info: ConnectionInfo,
        credential: Credential,
        timeouts: Timeouts,
    ) -> Result<Self, RunError> {
        let credential = credential.resolve()?;

        info!(
            host = %conn_info.host,
            port = conn_info.port,
            user = %conn_info.user,
            "connecting to SSH"
        );

        let stream = dial(&conn_info, &timeouts).await?;
        let deadlines = DeadlineHandle::new();
        let connection = DeadlineBoundedConnection::new(stream, deadlines.clone());

        let config = Arc::new(client::Config {
            keepalive_interval: timeouts.keepalive_interval(),
            ..Default::default()
        });

        let handle = {
            // Bound the handshake: a peer that accepts TCP but never speaks
            // would otherwise hang here forever
            let _handshake = deadlines.arm(timeouts.receive_timeout, timeouts.send_timeout);

            let mut handle = client::connect_stream(config, connection, SshClientHandler)
                .await
                .map_err(|e| transport_error(e, &timeouts))?;
            authenticate(&mut handle, &conn_info.user, credential, &timeouts).await?;
            handle
        };

        info!(host = %conn_info.host, "SSH connected and authenticated");

        Ok(Self {
            transport: Arc::new(Transport {
                handle,
                deadlines,
                timeouts,
                dispatch: Mutex::new(()),
                conn_info,
            }),
        })
    }

    /// Connect using password authentication
    ///
    /// # Errors
    /// See [`Remote::connect`]
    pub async fn with_password(
        conn_info: ConnectionInfo,
        password: impl Into<String>,
        timeouts: Timeouts,
    ) -> Result<Self, RunError> {
        Self::connect(conn_info, Credential::Password(password.into()), timeouts).await
    }

    /// Connect using a private key file
    ///
    /// # Errors
    /// See [`Remote::connect`]
    pub async fn with_key_file(
        conn_info: ConnectionInfo,
        path: impl Into<std::path::PathBuf>,
        timeouts: Timeouts,
    ) -> Result<Self, RunError> {
        let credential = Credential::Key(KeySource::Path(path.into()));
        Self::connect(conn_info, credential, timeouts).await
    }

    /// Connect using private key text held in memory
    ///
    /// # Errors
    /// See [`Remote::connect`]
    pub async fn with_raw_key(
        conn_info: ConnectionInfo,
        key: impl Into<String>,
        timeouts: Timeouts,
    ) -> Result<Self, RunError> {
        let credential = Credential::Key(KeySource::Raw(key.into()));
        Self::connect(conn_info, credential, timeouts).await
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.transport.conn_info
    }

    /// Create a concrete remote worker
    ///
    /// # Errors
    /// Returns `RunError::InvalidCommand` if `name` is empty
    pub fn worker<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Result<RemoteCmd, RunError> {
        RemoteCmd::new(Arc::clone(&self.transport), name, args)
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `RunError::ConnectionFailed` if disconnection fails
    pub async fn close_connection(&self) -> Result<(), RunError> {
        self.transport
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| RunError::ConnectionFailed(e.to_string()))?;
        info!(host = %self.transport.conn_info.host, "SSH disconnected");
        Ok(())
    }
}

impl Runner for Remote {
    fn command(&self, name: &str, args: &[&str]) -> Result<Box<dyn CmdWorker>, RunError> {
        Ok(Box::new(self.worker(name, args)?))
    }

    fn runner_type(&self) -> &'static str {
        "ssh"
    }
}

async fn dial(conn_info: &ConnectionInfo, timeouts: &Timeouts) -> Result<TcpStream, RunError> {
    let connect = TcpStream::connect((conn_info.host.as_str(), conn_info.port));

    let result = if timeouts.connection_timeout.is_zero() {
        connect.await
    } else {
        tokio::time::timeout(timeouts.connection_timeout, connect)
            .await
            .map_err(|_| RunError::Timeout {
                timeout: timeouts.connection_timeout,
            })?
    };

    result.map_err(|e| RunError::ConnectionFailed(format!("{}: {e}", conn_info.address())))
}

async fn authenticate(
    handle: &mut client::Handle<SshClientHandler>,
    user: &str,
    credential: ResolvedCredential,
    timeouts: &Timeouts,
) -> Result<(), RunError> {
    let auth_res = match credential {
        ResolvedCredential::Password(password) => {
            handle.authenticate_password(user, password).await
        }
        ResolvedCredential::Key(key) => {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
        }
    }
    .map_err(|e| match transport_error(e, timeouts) {
        RunError::ConnectionFailed(message) => RunError::AuthenticationFailed(message),
        other => other,
    })?;

    if !auth_res.success() {
        return Err(RunError::AuthenticationFailed(format!(
            "server rejected credentials for {user}"
        )));
    }

    Ok(())
}

/// Map a russh failure during connection setup, surfacing deadline expiry
fn transport_error(err: russh::Error, timeouts: &Timeouts) -> RunError {
    match err {
        russh::Error::IO(io_err) if io_err.kind() == io::ErrorKind::TimedOut => {
            RunError::Timeout {
                timeout: timeouts.receive_timeout.max(timeouts.send_timeout),
            }
        }
        other => RunError::ConnectionFailed(other.to_string()),
    }
}

/// Escape one argument so a remote shell sees it as a single literal token
///
/// Backslash, backtick, double quote and dollar sign are backslash-escaped
/// and the result is wrapped in double quotes. Shell expansion is therefore
/// never performed on arguments.
pub fn escape_argument(argument: &str) -> String {
    let mut escaped = String::with_capacity(argument.len() + 2);
    escaped.push('"');
    for ch in argument.chars() {
        if matches!(ch, '\\' | '`' | '"' | '$') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('"');
    escaped
}

/// Escape every argument and join them with single spaces
pub fn join_arguments<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| escape_argument(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

type ChannelWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Remote stdin writer
///
/// Shutting it down or dropping it tells the session pump to send EOF on
/// the channel. The channel writer itself sends nothing when dropped.
struct RemoteStdin {
    writer: ChannelWriter,
    closed: Option<oneshot::Sender<()>>,
}

impl RemoteStdin {
    fn new(channel: &ChannelWriteHalf<Msg>) -> (Self, oneshot::Receiver<()>) {
        let (closed, on_closed) = oneshot::channel();
        let stdin = Self {
            writer: Box::pin(channel.make_writer()),
            closed: Some(closed),
        };
        (stdin, on_closed)
    }
}

impl AsyncWrite for RemoteStdin {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.writer.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.writer.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.writer.as_mut().poll_flush(cx))?;
        // EOF goes out through the pump, exactly once
        drop(self.closed.take());
        Poll::Ready(Ok(()))
    }
}

/// Output streams the session pump feeds
struct Outputs {
    stdout: Option<Sender<Vec<u8>>>,
    stderr: Option<Sender<Vec<u8>>>,
    forwarders: Vec<(StreamKind, JoinHandle<io::Result<()>>)>,
}

/// What the session pump observed by the time the channel closed
struct SessionOutcome {
    exit: Result<(), ExitFailure>,
    stream_error: Option<RunError>,
    close_error: Option<String>,
}

/// A dispatched remote command
struct Session {
    pump: JoinHandle<SessionOutcome>,
    stdin_pipe: Option<PipeSlot<RemoteStdin>>,
    stdin_task: Option<JoinHandle<io::Result<()>>>,
}

/// Remote command worker
pub struct RemoteCmd {
    args: Vec<String>,
    command_line: String,
    transport: Arc<Transport>,
    stdin: InputBinding<PipeSlot<RemoteStdin>>,
    stdout: OutputBinding<DuplexStream>,
    stderr: OutputBinding<DuplexStream>,
    started: bool,
    session: Option<Session>,
    capture: Capture,
}

impl std::fmt::Debug for RemoteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCmd")
            .field("command_line", &self.command_line)
            .field("host", &self.transport.conn_info.host)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl RemoteCmd {
    fn new<S: AsRef<str>>(
        transport: Arc<Transport>,
        name: &str,
        args: &[S],
    ) -> Result<Self, RunError> {
        if name.trim().is_empty() {
            return Err(RunError::InvalidCommand("command cannot be empty".to_string()));
        }

        let args: Vec<String> = std::iter::once(name.to_string())
            .chain(args.iter().map(|arg| arg.as_ref().to_string()))
            .collect();
        let command_line = join_arguments(&args);

        Ok(Self {
            args,
            command_line,
            transport,
            stdin: InputBinding::Unbound,
            stdout: OutputBinding::Unbound,
            stderr: OutputBinding::Unbound,
            started: false,
            session: None,
            capture: Capture::default(),
        })
    }

    /// Open a session channel and send the command line
    async fn dispatch(transport: &Transport, command_line: &str) -> Result<Channel<Msg>, RunError> {
        let _dispatch = transport.dispatch.lock().await;
        let _deadlines = transport.arm_deadlines();

        debug!(command = %command_line, "dispatching remote command");

        let channel = transport
            .handle
            .channel_open_session()
            .await
            .map_err(|e| RunError::SessionError(e.to_string()))?;

        channel
            .exec(true, command_line.to_string())
            .await
            .map_err(|e| RunError::SessionError(e.to_string()))?;

        Ok(channel)
    }

    fn close_pending_pipes(&mut self) {
        if let InputBinding::Pipe(slot) = &self.stdin {
            slot.close();
        }
        // Dropping the duplex halves gives pipe readers EOF
        self.stdout = OutputBinding::Unbound;
        self.stderr = OutputBinding::Unbound;
    }

    fn failure(
        &self,
        failure: ExitFailure,
        close_error: Option<String>,
        stream_error: Option<RunError>,
    ) -> RunError {
        error!(
            command = %self.command_line,
            host = %self.transport.conn_info.host,
            failure = %failure,
            "remote command failed"
        );
        if let Some(e) = &stream_error {
            warn!(command = %self.command_line, error = %e, "stream failed alongside exit failure");
        }
        ExecutionError::new(failure, self.args.clone(), self.capture.snapshot())
            .with_close_error(close_error)
            .with_stream_error(stream_error.as_ref())
            .into()
    }
}

/// Start forwarding one output stream, returning the sender the pump feeds
fn spawn_forwarder(
    binding: OutputBinding<DuplexStream>,
    stream: StreamKind,
    capture: &Capture,
    forwarders: &mut Vec<(StreamKind, JoinHandle<io::Result<()>>)>,
) -> Option<Sender<Vec<u8>>> {
    let sink: Sink = match binding {
        OutputBinding::Unbound => return None,
        OutputBinding::Sink(sink) => sink,
        OutputBinding::Pipe(writer) => Box::new(writer),
    };

    let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
    forwarders.push((stream, tokio::spawn(forward(rx, sink, capture.clone()))));
    Some(tx)
}

/// Queue one chunk for a forwarder, waiting while its queue is full
async fn deliver(target: &mut Option<Sender<Vec<u8>>>, stream: StreamKind, data: &[u8]) {
    let Some(tx) = target.as_ref() else {
        return;
    };
    if tx.send(data.to_vec()).await.is_err() {
        // The forwarder stopped; its own error is reported on join
        debug!(%stream, "output forwarder stopped, discarding further output");
        *target = None;
    }
}

/// Resolves once the stdin writer is shut down or dropped
async fn stdin_closed(on_closed: &mut Option<oneshot::Receiver<()>>) {
    match on_closed {
        Some(rx) => {
            rx.await.ok();
            *on_closed = None;
        }
        None => std::future::pending().await,
    }
}

/// Drive the session until the remote end closes it, then close our side
async fn pump_session(
    mut reader: ChannelReadHalf,
    writer: ChannelWriteHalf<Msg>,
    mut on_stdin_closed: Option<oneshot::Receiver<()>>,
    mut outputs: Outputs,
) -> SessionOutcome {
    let mut exit = None;

    loop {
        let msg = tokio::select! {
            msg = reader.wait() => msg,
            () = stdin_closed(&mut on_stdin_closed) => {
                if let Err(e) = writer.eof().await {
                    debug!(error = %e, "failed to send stdin EOF");
                }
                continue;
            }
        };

        match msg {
            Some(ChannelMsg::Data { data }) => {
                deliver(&mut outputs.stdout, StreamKind::Stdout, &data).await;
            }
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                deliver(&mut outputs.stderr, StreamKind::Stderr, &data).await;
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit = Some(if exit_status == 0 {
                    Ok(())
                } else {
                    Err(ExitFailure::Status(exit_status.cast_signed()))
                });
            }
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                exit = Some(Err(ExitFailure::Signal(format!("{signal_name:?}"))));
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    // Ends the forwarders once they have written everything out
    drop(outputs.stdout.take());
    drop(outputs.stderr.take());

    let close_error = match writer.close().await {
        Ok(()) => None,
        Err(e) => classify_close_error(&e.to_string()),
    };

    let mut stream_error = None;
    for (kind, task) in outputs.forwarders {
        if let Err(e) = join_stream(kind, task).await {
            stream_error.get_or_insert(e);
        }
    }

    SessionOutcome {
        exit: exit.unwrap_or(Err(ExitFailure::MissingStatus)),
        stream_error,
        close_error,
    }
}

/// A close failure reading exactly "EOF" means the peer already hung up
fn classify_close_error(message: &str) -> Option<String> {
    if message == "EOF" {
        debug!("ssh session already closed by peer");
        None
    } else {
        Some(message.to_string())
    }
}

#[async_trait]
impl CmdWorker for RemoteCmd {
    #[instrument(skip(self), fields(host = %self.transport.conn_info.host))]
    async fn start(&mut self) -> Result<(), RunError> {
        if self.started {
            return Err(RunError::AlreadyStarted);
        }
        self.started = true;

        let channel = match Self::dispatch(&self.transport, &self.command_line).await {
            Ok(channel) => channel,
            Err(e) => {
                self.close_pending_pipes();
                return Err(e);
            }
        };

        let (reader, writer) = channel.split();

        let mut stdin_pipe = None;
        let mut stdin_task = None;
        let mut on_stdin_closed = None;
        match std::mem::take(&mut self.stdin) {
            InputBinding::Pipe(slot) => {
                let (stdin, on_closed) = RemoteStdin::new(&writer);
                slot.open(stdin);
                stdin_pipe = Some(slot);
                on_stdin_closed = Some(on_closed);
            }
            InputBinding::Source(mut source) => {
                let (mut stdin, on_closed) = RemoteStdin::new(&writer);
                stdin_task = Some(tokio::spawn(async move {
                    tokio::io::copy(&mut source, &mut stdin).await?;
                    stdin.shutdown().await
                }));
                on_stdin_closed = Some(on_closed);
            }
            InputBinding::Unbound => {
                if let Err(e) = writer.eof().await {
                    self.close_pending_pipes();
                    return Err(RunError::SessionError(e.to_string()));
                }
            }
        }

        let mut forwarders = Vec::new();
        let stdout = spawn_forwarder(
            std::mem::take(&mut self.stdout),
            StreamKind::Stdout,
            &self.capture,
            &mut forwarders,
        );
        let stderr = spawn_forwarder(
            std::mem::take(&mut self.stderr),
            StreamKind::Stderr,
            &self.capture,
            &mut forwarders,
        );
        let outputs = Outputs {
            stdout,
            stderr,
            forwarders,
        };

        self.session = Some(Session {
            pump: tokio::spawn(pump_session(reader, writer, on_stdin_closed, outputs)),
            stdin_pipe,
            stdin_task,
        });

        debug!(command = %self.command_line, "remote command started");
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.transport.conn_info.host))]
    async fn wait(&mut self) -> Result<(), RunError> {
        let Some(mut session) = self.session.take() else {
            return Err(RunError::NotStarted);
        };

        // Dropping the writer sends EOF so a command reading stdin can finish
        if let Some(slot) = session.stdin_pipe.take() {
            slot.close();
        }

        let outcome = match session.pump.await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(self.failure(
                    ExitFailure::Transport(format!("session task failed: {e}")),
                    None,
                    None,
                ));
            }
        };

        let mut stream_error = outcome.stream_error;
        if let Some(task) = session.stdin_task.take() {
            if task.is_finished() {
                if let Err(e) = join_stream(StreamKind::Stdin, task).await {
                    stream_error.get_or_insert(e);
                }
            } else {
                task.abort();
            }
        }

        match (outcome.exit, outcome.close_error) {
            (Err(failure), close_error) => Err(self.failure(failure, close_error, stream_error)),
            (Ok(()), Some(close_error)) => {
                if let Some(e) = &stream_error {
                    warn!(command = %self.command_line, error = %e, "stream failed before session close");
                }
                warn!(error = %close_error, "failed to close ssh session");
                Err(RunError::SessionClose(close_error))
            }
            (Ok(()), None) => match stream_error {
                Some(e) => Err(e),
                None => {
                    debug!(command = %self.command_line, "remote command completed");
                    Ok(())
                }
            },
        }
    }

    fn stdin_pipe(&mut self) -> Result<Sink, RunError> {
        claim_pipe(StreamKind::Stdin, self.started, self.stdin.is_bound())?;
        let slot = PipeSlot::new();
        let end = slot.end();
        self.stdin = InputBinding::Pipe(slot);
        Ok(Box::new(end))
    }

    fn stdout_pipe(&mut self) -> Result<Source, RunError> {
        claim_pipe(StreamKind::Stdout, self.started, self.stdout.is_bound())?;
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdout = OutputBinding::Pipe(writer);
        Ok(Box::new(reader))
    }

    fn stderr_pipe(&mut self) -> Result<Source, RunError> {
        claim_pipe(StreamKind::Stderr, self.started, self.stderr.is_bound())?;
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.stderr = OutputBinding::Pipe(writer);
        Ok(Box::new(reader))
    }

    fn set_stdin(&mut self, source: Source) {
        if let InputBinding::Pipe(slot) =
            std::mem::replace(&mut self.stdin, InputBinding::Source(source))
        {
            slot.close();
        }
    }

    fn set_stdout(&mut self, sink: Sink) {
        self.stdout = OutputBinding::Sink(sink);
    }

    fn set_stderr(&mut self, sink: Sink) {
        self.stderr = OutputBinding::Sink(sink);
    }

    fn has_stdout(&self) -> bool {
        self.stdout.is_bound()
    }

    fn has_stderr(&self) -> bool {
        self.stderr.is_bound()
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn command_line(&self) -> String {
        self.command_line.clone()
    }
}

impl Drop for RemoteCmd {
    fn drop(&mut self) {
        if let InputBinding::Pipe(slot) = &self.stdin {
            slot.close();
        }
    }
}
