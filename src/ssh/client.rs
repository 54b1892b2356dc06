//! SSH executor backed by russh, with a per-host session cache
//!
//! Sessions are created lazily and cached per host behind one mutex, so
//! many calls against the same host pay the handshake cost once.
//! Connection establishment retries with a linearly increasing delay.
//! Uploads land on a temporary sibling path and are renamed into place only
//! after the full transfer succeeds, so a remote reader never observes a
//! partially-written file.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cluster::hosts::{is_local, is_unprivileged, split_host_port};
use crate::cluster::SshConfig;

use super::{local, ExecError, Executor};

/// Handshake attempts before a connectivity error is surfaced.
const CONNECT_ATTEMPTS: u32 = 5;
/// Base delay between attempts; grows linearly with the attempt number.
const CONNECT_RETRY_STEP: Duration = Duration::from_millis(500);
/// Upper bound for a single remote command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned; fleets are provisioned from freshly
        // imaged machines whose keys are not known ahead of time.
        Ok(true)
    }
}

type Session = Arc<Mutex<client::Handle<ClientHandler>>>;

/// Production [`Executor`] over SSH with a local-dispatch fast path.
pub struct SshExecutor {
    config: SshConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn use_local_bypass(host: &str) -> bool {
        is_local(host) && !is_unprivileged()
    }

    /// Look up or create the cached session for a host.
    async fn session(&self, host: &str) -> Result<Session, ExecError> {
        let (addr, port) = split_host_port(host);
        let port = if host.contains(':') { port } else { self.config.port };
        let key = format!("{}:{}", addr, port);

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(session.clone());
        }
        let handle = self.connect(&addr, port).await?;
        let session = Arc::new(Mutex::new(handle));
        sessions.insert(key, session.clone());
        Ok(session)
    }

    async fn connect(
        &self,
        addr: &str,
        port: u16,
    ) -> Result<client::Handle<ClientHandler>, ExecError> {
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let mut last_err = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match client::connect(ssh_config.clone(), (addr, port), ClientHandler).await {
                Ok(mut handle) => {
                    self.authenticate(&mut handle, addr).await?;
                    debug!("ssh session established with {}:{}", addr, port);
                    return Ok(handle);
                }
                Err(e) => {
                    last_err = e.to_string();
                    if attempt < CONNECT_ATTEMPTS {
                        let delay = CONNECT_RETRY_STEP * attempt;
                        warn!(
                            "connect to {}:{} failed (attempt {}/{}): {}, retrying in {:?}",
                            addr, port, attempt, CONNECT_ATTEMPTS, last_err, delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(ExecError::Connectivity {
            host: format!("{}:{}", addr, port),
            message: last_err,
        })
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        addr: &str,
    ) -> Result<(), ExecError> {
        let connectivity = |message: String| ExecError::Connectivity {
            host: addr.to_string(),
            message,
        };

        if let Some(pk) = &self.config.pk {
            let key = russh_keys::load_secret_key(pk, self.config.pk_passwd.as_deref())
                .map_err(|e| connectivity(format!("load private key {}: {}", pk, e)))?;
            let ok = handle
                .authenticate_publickey(&self.config.user, Arc::new(key))
                .await
                .map_err(|e| connectivity(e.to_string()))?;
            if ok {
                return Ok(());
            }
        }
        if let Some(password) = &self.config.password {
            let ok = handle
                .authenticate_password(&self.config.user, password)
                .await
                .map_err(|e| connectivity(e.to_string()))?;
            if ok {
                return Ok(());
            }
        }
        Err(connectivity(format!(
            "authentication failed for user {}",
            self.config.user
        )))
    }

    /// Run one command over the session, streaming combined output when
    /// `stream` is set. Returns the captured output and the exit status.
    async fn exec(
        &self,
        host: &str,
        cmd: &str,
        stream: bool,
    ) -> Result<(Vec<u8>, u32), ExecError> {
        let session = self.session(host).await?;
        let protocol = |message: String| ExecError::Protocol {
            host: host.to_string(),
            message,
        };

        let fut = async {
            let guard = session.lock().await;
            let mut channel = guard
                .channel_open_session()
                .await
                .map_err(|e| protocol(e.to_string()))?;
            drop(guard);

            channel
                .exec(true, cmd)
                .await
                .map_err(|e| protocol(e.to_string()))?;

            let mut output = Vec::new();
            let mut status = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        if stream {
                            for line in String::from_utf8_lossy(data).lines() {
                                info!("[{}] {}", host, line);
                            }
                        }
                        output.extend_from_slice(data);
                    }
                    ChannelMsg::ExtendedData { ref data, .. } => {
                        if stream {
                            for line in String::from_utf8_lossy(data).lines() {
                                info!("[{}] {}", host, line);
                            }
                        }
                        output.extend_from_slice(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        status = Some(exit_status);
                    }
                    ChannelMsg::ExitSignal { signal_name, .. } => {
                        return Err(ExecError::Command {
                            host: host.to_string(),
                            command: cmd.to_string(),
                            output: format!(
                                "terminated by signal {:?}; partial output: {}",
                                signal_name,
                                String::from_utf8_lossy(&output)
                            ),
                        });
                    }
                    _ => {}
                }
            }
            let code = Self::require_exit_status(host, status)?;
            Ok::<_, ExecError>((output, code))
        };

        timeout(COMMAND_TIMEOUT, fut)
            .await
            .map_err(|_| ExecError::Timeout {
                host: host.to_string(),
                command: cmd.to_string(),
            })?
    }

    async fn sftp(&self, host: &str) -> Result<SftpSession, ExecError> {
        let session = self.session(host).await?;
        let protocol = |message: String| ExecError::Protocol {
            host: host.to_string(),
            message,
        };

        let guard = session.lock().await;
        let channel = guard
            .channel_open_session()
            .await
            .map_err(|e| protocol(e.to_string()))?;
        drop(guard);

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| protocol(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| protocol(e.to_string()))
    }

    /// Create every missing ancestor of a remote path.
    async fn ensure_remote_dir(sftp: &SftpSession, dir: &str) {
        let mut prefix = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            // Already-existing components fail; that is fine.
            let _ = sftp.create_dir(&prefix).await;
        }
    }

    async fn upload_file(
        &self,
        host: &str,
        sftp: &SftpSession,
        src: &Path,
        dst: &str,
    ) -> Result<(), ExecError> {
        let protocol = |message: String| ExecError::Protocol {
            host: host.to_string(),
            message,
        };

        if let Some(parent) = Path::new(dst).parent() {
            Self::ensure_remote_dir(sftp, &parent.display().to_string()).await;
        }

        let data = tokio::fs::read(src).await?;
        let mode = std::fs::metadata(src)?.permissions().mode();

        let staging = format!("{}.tmp", dst);
        let mut file = sftp
            .create(&staging)
            .await
            .map_err(|e| protocol(format!("create {}: {}", staging, e)))?;
        file.write_all(&data).await?;
        file.shutdown().await?;

        sftp.set_metadata(
            &staging,
            FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| protocol(format!("chmod {}: {}", staging, e)))?;

        // Plain SFTP rename refuses to clobber an existing target.
        let _ = sftp.remove_file(dst).await;
        sftp.rename(&staging, dst)
            .await
            .map_err(|e| protocol(format!("rename {} -> {}: {}", staging, dst, e)))?;

        debug!("uploaded {} to {}:{}", src.display(), host, dst);
        Ok(())
    }

    /// A channel that closes without reporting an exit status means the
    /// command's fate is unknown; it must not be taken for success.
    fn require_exit_status(host: &str, status: Option<u32>) -> Result<u32, ExecError> {
        status.ok_or_else(|| ExecError::Protocol {
            host: host.to_string(),
            message: "channel closed without an exit status".to_string(),
        })
    }

    /// Flatten a local file or tree into (local file, remote path) pairs.
    fn collect_files(src: &Path, dst: &str) -> Result<Vec<(PathBuf, String)>, ExecError> {
        let mut out = Vec::new();
        if src.is_dir() {
            for entry in std::fs::read_dir(src)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_dst = format!("{}/{}", dst.trim_end_matches('/'), name);
                out.extend(Self::collect_files(&entry.path(), &child_dst)?);
            }
        } else {
            out.push((src.to_path_buf(), dst.to_string()));
        }
        Ok(out)
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn ping(&self, host: &str) -> Result<(), ExecError> {
        if Self::use_local_bypass(host) {
            return Ok(());
        }
        self.session(host).await.map(|_| ())
    }

    async fn output(&self, host: &str, cmd: &str) -> Result<Vec<u8>, ExecError> {
        if Self::use_local_bypass(host) {
            return local::output(host, cmd).await;
        }
        let (output, code) = self.exec(host, cmd, false).await?;
        if code != 0 {
            return Err(ExecError::Command {
                host: host.to_string(),
                command: cmd.to_string(),
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        }
        Ok(output)
    }

    async fn run(&self, host: &str, cmds: &[String]) -> Result<(), ExecError> {
        if Self::use_local_bypass(host) {
            return local::run(host, cmds).await;
        }
        for cmd in cmds {
            let (output, code) = self.exec(host, cmd, true).await?;
            if code != 0 {
                return Err(ExecError::Command {
                    host: host.to_string(),
                    command: cmd.clone(),
                    output: String::from_utf8_lossy(&output).into_owned(),
                });
            }
        }
        Ok(())
    }

    async fn upload(&self, host: &str, src: &Path, dst: &str) -> Result<(), ExecError> {
        if Self::use_local_bypass(host) {
            return local::copy_tree(src, Path::new(dst));
        }
        let sftp = self.sftp(host).await?;
        for (file, remote) in Self::collect_files(src, dst)? {
            self.upload_file(host, &sftp, &file, &remote).await?;
        }
        Ok(())
    }

    async fn download(&self, host: &str, src: &str, dst: &Path) -> Result<(), ExecError> {
        if Self::use_local_bypass(host) {
            return local::copy_tree(Path::new(src), dst);
        }
        let sftp = self.sftp(host).await?;
        let mut file = sftp.open(src).await.map_err(|e| ExecError::Protocol {
            host: host.to_string(),
            message: format!("open {}: {}", src, e),
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dst, data).await?;
        debug!("fetched {}:{} to {}", host, src, dst.display());
        Ok(())
    }
}
