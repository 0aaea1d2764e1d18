//! Remote command channel.
//!
//! [`CommandChannel`] is the seam the rest of the crate talks through:
//! the pipeline runner, the stages and the credential vault only ever see
//! the trait. [`SshSession`] is the production implementation on top of
//! blocking libssh2; tests substitute scripted in-memory channels.
//!
//! A command that runs and exits non-zero is data ([`ExecOutput`]), not an
//! error. [`SessionError`] is reserved for the transport itself failing,
//! which always aborts the run.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::SessionError;

/// Port the fallback connection attempt uses when the configured port is
/// unreachable, so re-runs work before hardening has moved sshd.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection-level timeout applied to the TCP connect and to every
/// blocking libssh2 operation.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Token round-tripped by [`probe`]. Kept stable so the probe is the one
/// remote command an idle re-run is guaranteed to issue.
pub const PROBE_TOKEN: &str = "groundwork-probe";

/// Everything needed to open (or reopen) a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub key_file: Option<PathBuf>,
}

impl SessionParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.address.clone(),
            port: config.ssh_port,
            username: config.admin_user.clone(),
            key_file: config.key_file.clone(),
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The single seam between the orchestrator and the remote host.
pub trait CommandChannel {
    /// Execute one command and wait for it to finish.
    fn run(&mut self, command: &str) -> Result<ExecOutput, SessionError>;

    /// Tear the channel down. Calling `run` afterwards is an error.
    fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Issue the non-mutating echo round-trip and require the token back.
///
/// This is the only remote command allowed before any stage, and the only
/// command a fully satisfied re-run issues besides the read-only checks.
pub fn probe(chan: &mut dyn CommandChannel) -> Result<(), SessionError> {
    let out = chan.run(&format!("echo {PROBE_TOKEN}"))?;
    let actual = out.stdout.trim();
    if actual != PROBE_TOKEN {
        return Err(SessionError::Probe {
            expected: PROBE_TOKEN.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Authenticated SSH session to the target host.
pub struct SshSession {
    session: ssh2::Session,
    endpoint: String,
    closed: bool,
}

impl SshSession {
    /// Open the TCP connection and authenticate the SSH session.
    ///
    /// Host keys are accepted on first use; there is no interactive
    /// prompt anywhere in a run. Authentication uses the configured key
    /// file when present, otherwise the SSH agent.
    pub fn open(params: &SessionParams, timeout: Duration) -> Result<Self, SessionError> {
        let endpoint = params.endpoint();
        let ip: Ipv4Addr = params.address.parse().map_err(|err| SessionError::Connect {
            endpoint: endpoint.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
        })?;
        let addr = SocketAddr::from((ip, params.port));
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|source| SessionError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        let mut session =
            ssh2::Session::new().map_err(|err| SessionError::ssh("create ssh session", err))?;
        session.set_tcp_stream(stream);
        session.set_timeout(timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|err| SessionError::ssh("ssh handshake", err))?;

        match &params.key_file {
            Some(key) => session
                .userauth_pubkey_file(&params.username, None, key, None)
                .map_err(|err| SessionError::ssh("public key authentication", err))?,
            None => session
                .userauth_agent(&params.username)
                .map_err(|err| SessionError::ssh("ssh agent authentication", err))?,
        }

        debug!(endpoint = %endpoint, user = %params.username, "ssh session established");
        Ok(Self {
            session,
            endpoint,
            closed: false,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CommandChannel for SshSession {
    fn run(&mut self, command: &str) -> Result<ExecOutput, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| SessionError::ssh("open exec channel", err))?;
        channel
            .exec(command)
            .map_err(|err| SessionError::ssh("start remote command", err))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|err| SessionError::io("read remote stdout", err))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|err| SessionError::io("read remote stderr", err))?;

        channel
            .wait_close()
            .map_err(|err| SessionError::ssh("close exec channel", err))?;
        let exit_code = channel
            .exit_status()
            .map_err(|err| SessionError::ssh("read exit status", err))?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session
            .disconnect(None, "provisioning run finished", None)
            .map_err(|err| SessionError::ssh("disconnect", err))
    }
}

/// Opens channels for the runner. The indirection exists so tests can
/// hand the runner scripted channels, and so the runner can reopen after
/// a stage moves the SSH port.
pub trait ChannelOpener {
    fn open(&mut self, params: &SessionParams) -> Result<Box<dyn CommandChannel>, SessionError>;
}

/// Production opener. Tries the configured port first and falls back to
/// 22 when that differs, so the same configuration reaches a host on
/// either side of the ssh-hardening stage.
pub struct SshOpener {
    pub timeout: Duration,
}

impl Default for SshOpener {
    fn default() -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ChannelOpener for SshOpener {
    fn open(&mut self, params: &SessionParams) -> Result<Box<dyn CommandChannel>, SessionError> {
        match SshSession::open(params, self.timeout) {
            Ok(session) => Ok(Box::new(session)),
            Err(primary @ SessionError::Connect { .. }) if params.port != DEFAULT_SSH_PORT => {
                let fallback = params.with_port(DEFAULT_SSH_PORT);
                info!(
                    endpoint = %fallback.endpoint(),
                    "configured port unreachable, retrying on 22"
                );
                match SshSession::open(&fallback, self.timeout) {
                    Ok(session) => Ok(Box::new(session)),
                    Err(secondary) => {
                        debug!(error = %secondary, "fallback connect failed");
                        Err(primary)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }
}
