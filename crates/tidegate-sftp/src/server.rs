//! SSH server front end.
//!
//! Accepts TCP connections (optionally behind the PROXY protocol),
//! performs the SSH handshake with provider-backed authentication
//! callbacks, and wires accepted `session` channels into the SFTP
//! handler, the SCP engine or the SSH command dispatcher.
//!
//! Multi-step authentication follows the provider: a public-key check
//! that succeeds for a user restricted to two-step methods yields a
//! rejection that names the remaining methods, and the second step is
//! validated as the combined method.

use async_trait::async_trait;
use russh::keys::ssh_key::certificate::{CertType, Certificate};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{load_secret_key, Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::server::{Auth, Config as SshConfig, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodSet, SshId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::SftpdConfig;
use crate::error::{Error, Result};
use crate::handler::{ChannelInput, OutputSink, SftpChannel};
use crate::metrics::Metrics;
use crate::proxy::{read_proxy_header, ProxyPolicy};
use crate::quota::ScanRegistry;
use crate::registry::ConnectionRegistry;
use crate::scp::{ScpCommand, ScpEngine};
use crate::session::{Protocol, ServerSession};
use crate::ssh_command::{parse_command_payload, SshCommandEngine};
use crate::vfs::VirtualFs;
use tidegate_core::{FsProvider, LoginMethod, QuotaTracking, User};
use tidegate_provider::DataProvider;

/// OpenSSH-compatible handshake deadline; cleared once authentication
/// completes
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Hook timeout for keyboard-interactive exchanges
const KBD_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default host key file names probed in the config directory
const DEFAULT_HOST_KEYS: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519"];

/// Queue depth per channel between the SSH loop and the engines
const CHANNEL_QUEUE: usize = 64;

pub struct SftpServer {
    config: Arc<SftpdConfig>,
    config_dir: PathBuf,
    provider: Arc<dyn DataProvider>,
    registry: Arc<ConnectionRegistry>,
    scans: Arc<ScanRegistry>,
}

impl SftpServer {
    pub fn new(
        config: SftpdConfig,
        config_dir: PathBuf,
        provider: Arc<dyn DataProvider>,
        registry: Arc<ConnectionRegistry>,
        scans: Arc<ScanRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            config_dir,
            provider,
            registry,
            scans,
        }
    }

    pub fn scans(&self) -> Arc<ScanRegistry> {
        self.scans.clone()
    }

    /// Bind and serve until the process ends
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        let keys = load_host_keys(&self.config.host_keys, &self.config_dir).await?;
        for key in &keys {
            info!(
                fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
                algorithm = %key.algorithm(),
                "host key loaded"
            );
        }

        let mut methods = MethodSet::PUBLICKEY | MethodSet::PASSWORD;
        if self.config.keyboard_interactive_auth_hook.is_some() {
            methods |= MethodSet::KEYBOARD_INTERACTIVE;
        }

        let auth_banner: Option<&'static str> = match &self.config.login_banner_file {
            Some(path) => {
                let path = absolute_or_joined(path, &self.config_dir);
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => Some(Box::leak(content.into_boxed_str())),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unable to read login banner file");
                        None
                    }
                }
            }
            None => None,
        };

        let ssh_config = Arc::new(SshConfig {
            server_id: SshId::Standard(format!("SSH-2.0-{}", self.config.banner)),
            methods,
            keys,
            auth_banner,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        });

        let cert_checker = Arc::new(
            CertChecker::load(&self.config.trusted_user_ca_keys, &self.config_dir).await?,
        );
        let policy = ProxyPolicy::from_config(self.config.proxy_protocol, &self.config.proxy_allowed);
        let enabled_commands = Arc::new(self.config.effective_ssh_commands());

        if self.config.idle_timeout > 0 {
            let _ = self
                .registry
                .start_idle_sweeper(Duration::from_secs(self.config.idle_timeout * 60));
        }

        let addr = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Connection(format!("cannot bind {}: {}", addr, e)))?;
        info!(address = %addr, banner = %self.config.banner, "sftp server listening");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let ctx = ConnectionContext {
                config: self.config.clone(),
                ssh_config: ssh_config.clone(),
                provider: self.provider.clone(),
                registry: self.registry.clone(),
                cert_checker: cert_checker.clone(),
                policy: policy.clone(),
                enabled_commands: enabled_commands.clone(),
            };
            let (abort_tx, abort_rx) = oneshot::channel();
            let task = tokio::spawn(handle_connection(ctx, socket, peer, abort_rx));
            let _ = abort_tx.send(task.abort_handle());
        }
    }
}

#[derive(Clone)]
struct ConnectionContext {
    config: Arc<SftpdConfig>,
    ssh_config: Arc<SshConfig>,
    provider: Arc<dyn DataProvider>,
    registry: Arc<ConnectionRegistry>,
    cert_checker: Arc<CertChecker>,
    policy: ProxyPolicy,
    enabled_commands: Arc<Vec<String>>,
}

async fn handle_connection(
    ctx: ConnectionContext,
    mut socket: tokio::net::TcpStream,
    peer: SocketAddr,
    abort_rx: oneshot::Receiver<AbortHandle>,
) {
    let Ok(driver) = abort_rx.await else {
        return;
    };
    let remote_addr = match read_proxy_header(&mut socket, &ctx.policy, peer.ip()).await {
        Ok(Some(advertised)) => advertised,
        Ok(None) => peer,
        Err(e) => {
            warn!(%peer, error = %e, "rejecting connection at the proxy layer");
            return;
        }
    };

    let authenticated = Arc::new(AtomicBool::new(false));
    let handler = SshSessionHandler {
        config: ctx.config.clone(),
        provider: ctx.provider.clone(),
        registry: ctx.registry.clone(),
        cert_checker: ctx.cert_checker.clone(),
        enabled_commands: ctx.enabled_commands.clone(),
        remote_addr,
        driver: driver.clone(),
        authenticated: authenticated.clone(),
        user: None,
        login_method: None,
        partial_methods: Vec::new(),
        auth_attempts: 0,
        session: None,
        routes: HashMap::new(),
    };

    // the handshake and authentication must finish inside the deadline;
    // afterwards the idle sweeper is the only liveness bound
    let watchdog = tokio::spawn({
        let authenticated = authenticated.clone();
        let driver = driver.clone();
        async move {
            tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
            if !authenticated.load(Ordering::Relaxed) {
                debug!("handshake deadline expired, dropping connection");
                driver.abort();
            }
        }
    });

    match russh::server::run_stream(ctx.ssh_config, socket, handler).await {
        Ok(running) => {
            if let Err(e) = running.await {
                debug!(%remote_addr, error = %e, "connection ended with error");
            }
        }
        Err(e) => {
            warn!(%remote_addr, error = %e, "ssh handshake failed");
            connection_failed_log("", remote_addr.ip(), "no_auth_tried", &e.to_string());
        }
    }
    watchdog.abort();
}

/// Structured log entry for every failed connection attempt
fn connection_failed_log(username: &str, ip: IpAddr, method: &str, reason: &str) {
    warn!(
        event = "connection_failed",
        username,
        ip = %ip,
        method,
        reason,
        "connection failed"
    );
}

struct SshSessionHandler {
    config: Arc<SftpdConfig>,
    provider: Arc<dyn DataProvider>,
    registry: Arc<ConnectionRegistry>,
    cert_checker: Arc<CertChecker>,
    enabled_commands: Arc<Vec<String>>,
    remote_addr: SocketAddr,
    driver: AbortHandle,
    authenticated: Arc<AtomicBool>,
    user: Option<Arc<User>>,
    login_method: Option<LoginMethod>,
    partial_methods: Vec<LoginMethod>,
    auth_attempts: u32,
    session: Option<Arc<ServerSession>>,
    routes: HashMap<ChannelId, mpsc::Sender<ChannelInput>>,
}

impl SshSessionHandler {
    fn metrics(&self) -> &Metrics {
        self.registry.metrics()
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    fn attempt_exhausted(&mut self) -> bool {
        self.auth_attempts += 1;
        if self.auth_attempts > self.config.max_auth_tries {
            warn!(ip = %self.remote_addr.ip(), "too many authentication attempts");
            self.driver.abort();
            return true;
        }
        false
    }

    /// The login gate shared by every method. On success the user
    /// snapshot is bound to the connection.
    async fn login_user(&mut self, user: User, method: LoginMethod, key_id: Option<String>) -> Auth {
        if let Err(reason) = evaluate_login(
            &user,
            method,
            &self.partial_methods,
            self.remote_addr.ip(),
            self.provider.quota_tracking(),
            self.registry.count_for_user(&user.username),
        ) {
            self.login_failure(&user.username, method, &reason);
            return self.reject();
        }
        if user.fs_config.provider != FsProvider::Local {
            self.login_failure(
                &user.username,
                method,
                "unsupported filesystem provider for this build",
            );
            return self.reject();
        }
        info!(
            username = %user.username,
            method = %method,
            key_id = key_id.as_deref().unwrap_or(""),
            ip = %self.remote_addr.ip(),
            home_dir = %user.home_dir.display(),
            "user logged in"
        );
        self.metrics().login_result(true);
        let _ = self.provider.update_last_login(&user.username).await;
        self.user = Some(Arc::new(user));
        self.login_method = Some(method);
        self.authenticated.store(true, Ordering::Relaxed);
        Auth::Accept
    }

    fn login_failure(&self, username: &str, method: LoginMethod, reason: &str) {
        self.metrics().login_result(false);
        connection_failed_log(username, self.remote_addr.ip(), method.as_str(), reason);
    }

    /// After a successful first factor, tell the client which methods
    /// can still complete the login
    fn partial_success(&mut self, user: &User) -> Auth {
        self.partial_methods.push(LoginMethod::PublicKey);
        let next = user.next_auth_methods(&self.partial_methods);
        debug!(
            username = %user.username,
            next = ?next,
            "public key accepted, additional authentication required"
        );
        Auth::Reject {
            proceed_with_methods: Some(method_set(&next)),
        }
    }

    fn password_method(&self) -> LoginMethod {
        if self.partial_methods.contains(&LoginMethod::PublicKey) {
            LoginMethod::KeyAndPassword
        } else {
            LoginMethod::Password
        }
    }

    fn kbdint_method(&self) -> LoginMethod {
        if self.partial_methods.contains(&LoginMethod::PublicKey) {
            LoginMethod::KeyAndKeyboardInt
        } else {
            LoginMethod::KeyboardInteractive
        }
    }

    /// Create the per-connection session on first channel open
    async fn ensure_session(&mut self) -> Result<Arc<ServerSession>> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let user = self
            .user
            .clone()
            .ok_or_else(|| Error::Authentication("channel before authentication".to_string()))?;
        let connection_id = uuid::Uuid::new_v4().simple().to_string();
        let fs = Arc::new(VirtualFs::new(user.clone(), connection_id.clone()));
        fs.check_root_path().await;
        let session = ServerSession::new(
            connection_id,
            user,
            fs,
            self.remote_addr,
            format!("SSH-2.0-{}", self.config.banner),
        );
        session.bind_driver(self.driver.clone());
        self.registry.add(session.clone());
        self.session = Some(session.clone());
        Ok(session)
    }

    async fn route_input(&mut self, channel: ChannelId, input: ChannelInput) {
        if let Some(session) = &self.session {
            session.touch();
        }
        if let Some(tx) = self.routes.get(&channel) {
            if tx.send(input).await.is_err() {
                self.routes.remove(&channel);
            }
        }
    }
}

impl Drop for SshSessionHandler {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            self.registry.remove(session.id());
        }
    }
}

#[async_trait]
impl Handler for SshSessionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        self.metrics().login_attempt();
        if self.attempt_exhausted() {
            return Ok(self.reject());
        }
        let method = self.password_method();
        match self
            .provider
            .check_user_and_pass(user, password, &self.remote_addr.ip().to_string(), "SFTP")
            .await
        {
            Ok(account) => Ok(self.login_user(account, method, None).await),
            Err(e) => {
                self.login_failure(user, method, &e.to_string());
                Ok(self.reject())
            }
        }
    }

    async fn auth_publickey_offered(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        let offered = key
            .to_openssh()
            .map_err(|e| Error::Ssh(format!("invalid public key: {}", e)))?;
        match self.provider.check_user_and_pub_key(user, &offered).await {
            Ok(_) => Ok(Auth::Accept),
            Err(_) => Ok(self.reject()),
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        self.metrics().login_attempt();
        if self.attempt_exhausted() {
            return Ok(self.reject());
        }
        let offered = key
            .to_openssh()
            .map_err(|e| Error::Ssh(format!("invalid public key: {}", e)))?;
        match self.provider.check_user_and_pub_key(user, &offered).await {
            Ok((account, key_id)) => {
                if account.is_partial_auth(LoginMethod::PublicKey) {
                    return Ok(self.partial_success(&account));
                }
                Ok(self
                    .login_user(account, LoginMethod::PublicKey, Some(key_id))
                    .await)
            }
            Err(e) => {
                self.login_failure(user, LoginMethod::PublicKey, &e.to_string());
                Ok(self.reject())
            }
        }
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth> {
        self.metrics().login_attempt();
        if self.attempt_exhausted() {
            return Ok(self.reject());
        }
        if let Err(reason) =
            self.cert_checker
                .check_cert(user, certificate, self.remote_addr.ip())
        {
            self.login_failure(user, LoginMethod::PublicKey, &reason.to_string());
            return Ok(self.reject());
        }
        match self.provider.user_exists(user).await {
            Ok(account) => {
                if account.is_partial_auth(LoginMethod::PublicKey) {
                    return Ok(self.partial_success(&account));
                }
                let key_id = certificate.key_id().to_string();
                Ok(self
                    .login_user(account, LoginMethod::PublicKey, Some(key_id))
                    .await)
            }
            Err(e) => {
                self.login_failure(user, LoginMethod::PublicKey, &e.to_string());
                Ok(self.reject())
            }
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'async_trait>>,
    ) -> Result<Auth> {
        let Some(hook) = self.config.keyboard_interactive_auth_hook.clone() else {
            return Ok(self.reject());
        };
        let answers: Vec<String> = response
            .map(|r| r.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()).collect())
            .unwrap_or_default();
        let first_round = answers.is_empty();
        if first_round {
            self.metrics().login_attempt();
            if self.attempt_exhausted() {
                return Ok(self.reject());
            }
        }
        let request = KbdAuthRequest {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            username: user.to_string(),
            ip: self.remote_addr.ip().to_string(),
            answers,
        };
        let reply = match execute_kbd_hook(&hook, &request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.login_failure(user, self.kbdint_method(), &e.to_string());
                return Ok(self.reject());
            }
        };
        if !reply.questions.is_empty() && reply.auth_result != 1 {
            let prompts: Vec<(std::borrow::Cow<'static, str>, bool)> = reply
                .questions
                .iter()
                .enumerate()
                .map(|(i, q)| {
                    let echo = reply.echos.get(i).copied().unwrap_or(false);
                    (std::borrow::Cow::Owned(q.clone()), echo)
                })
                .collect();
            return Ok(Auth::Partial {
                name: std::borrow::Cow::Owned(String::new()),
                instructions: std::borrow::Cow::Owned(reply.instruction.unwrap_or_default()),
                prompts: std::borrow::Cow::Owned(prompts),
            });
        }
        if reply.auth_result == 1 {
            let method = self.kbdint_method();
            match self
                .provider
                .check_keyboard_interactive_auth(user, &self.remote_addr.ip().to_string())
                .await
            {
                Ok(account) => return Ok(self.login_user(account, method, None).await),
                Err(e) => {
                    self.login_failure(user, method, &e.to_string());
                    return Ok(self.reject());
                }
            }
        }
        self.login_failure(user, self.kbdint_method(), "hook rejected the exchange");
        Ok(self.reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        let session = self.ensure_session().await?;
        debug!(
            connection_id = %session.id(),
            channel = %channel.id(),
            "session channel opened"
        );
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != "sftp" {
            warn!(subsystem = name, "unsupported subsystem");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let server_session = self.ensure_session().await?;
        server_session.set_protocol(Protocol::Sftp);
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
        let engine = SftpChannel::new(
            server_session,
            self.registry.clone(),
            self.provider.clone(),
            self.config.actions.clone(),
            self.config.upload_mode,
            self.config.setstat_mode,
            OutputSink::Channel {
                handle: session.handle(),
                channel: channel_id,
            },
        );
        tokio::spawn(engine.run(rx));
        self.routes.insert(channel_id, tx);
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let payload = String::from_utf8_lossy(data).to_string();
        let command = match parse_command_payload(&payload) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "unparseable exec payload");
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };
        if !self.enabled_commands.iter().any(|c| c == &command.command) {
            warn!(command = %command.command, "exec command not enabled");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let server_session = self.ensure_session().await?;
        server_session.set_command(Some(payload.clone()));

        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
        if command.command == "scp" {
            let scp_cmd = match ScpCommand::parse(&command.args) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!(error = %e, "invalid scp command line");
                    session.channel_failure(channel_id)?;
                    return Ok(());
                }
            };
            server_session.set_protocol(Protocol::Scp);
            let engine = ScpEngine::new(
                server_session,
                self.registry.clone(),
                self.provider.clone(),
                self.config.actions.clone(),
                self.config.upload_mode,
                session.handle(),
                channel_id,
                scp_cmd,
            );
            tokio::spawn(engine.run(rx));
        } else {
            server_session.set_protocol(Protocol::Ssh);
            let engine = SshCommandEngine::new(
                server_session,
                self.registry.clone(),
                self.provider.clone(),
                self.config.actions.clone(),
                session.handle(),
                channel_id,
                command,
            );
            tokio::spawn(engine.run(rx));
        }
        self.routes.insert(channel_id, tx);
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<()> {
        debug!("shell request rejected");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        debug!("pty request rejected");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<()> {
        self.route_input(channel, ChannelInput::Data(data.to_vec()))
            .await;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.route_input(channel, ChannelInput::Eof).await;
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.routes.remove(&channel);
        Ok(())
    }
}

/// Pure login gate, shared by every authentication method
pub fn evaluate_login(
    user: &User,
    method: LoginMethod,
    partial_methods: &[LoginMethod],
    remote_ip: IpAddr,
    tracking: QuotaTracking,
    active_sessions: usize,
) -> std::result::Result<(), String> {
    if !user.is_active() {
        return Err(format!("user {} is disabled or expired", user.username));
    }
    if !user.home_dir.is_absolute() {
        return Err(format!(
            "user {} has an invalid home dir {}",
            user.username,
            user.home_dir.display()
        ));
    }
    if user.max_sessions > 0 && active_sessions >= user.max_sessions as usize {
        return Err(format!(
            "too many open sessions: {}/{}",
            active_sessions, user.max_sessions
        ));
    }
    if !user.is_login_method_allowed(method, partial_methods) {
        return Err(format!("login method {} is not allowed", method));
    }
    if tracking != QuotaTracking::Off && user.has_overlapping_folders() {
        return Err(
            "overlapping mapped folders are allowed only with quota tracking disabled".to_string(),
        );
    }
    if !user.is_login_from_addr_allowed(&remote_ip.to_string()) {
        return Err(format!("login from {} is not allowed", remote_ip));
    }
    Ok(())
}

fn method_set(methods: &[LoginMethod]) -> MethodSet {
    let mut set = MethodSet::empty();
    for method in methods {
        match method {
            LoginMethod::Password | LoginMethod::KeyAndPassword => set |= MethodSet::PASSWORD,
            LoginMethod::PublicKey => set |= MethodSet::PUBLICKEY,
            LoginMethod::KeyboardInteractive | LoginMethod::KeyAndKeyboardInt => {
                set |= MethodSet::KEYBOARD_INTERACTIVE
            }
        }
    }
    if set.is_empty() {
        set = MethodSet::PASSWORD | MethodSet::KEYBOARD_INTERACTIVE;
    }
    set
}

fn absolute_or_joined(path: &Path, config_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}

/// Load the configured host keys. With nothing configured the default
/// names are probed in the config directory, and when none exist a new
/// Ed25519 key is generated and persisted.
async fn load_host_keys(configured: &[PathBuf], config_dir: &Path) -> Result<Vec<PrivateKey>> {
    let mut keys = Vec::new();
    if configured.is_empty() {
        for name in DEFAULT_HOST_KEYS {
            let path = config_dir.join(name);
            if path.exists() {
                keys.push(load_key(&path)?);
            }
        }
        if keys.is_empty() {
            let path = config_dir.join("id_ed25519");
            info!(path = %path.display(), "no host keys found, generating a new one");
            keys.push(generate_host_key(&path).await?);
        }
        return Ok(keys);
    }
    for configured_path in configured {
        let path = absolute_or_joined(configured_path, config_dir);
        if !path.exists() {
            warn!(path = %path.display(), "configured host key does not exist, generating");
            keys.push(generate_host_key(&path).await?);
            continue;
        }
        keys.push(load_key(&path)?);
    }
    if keys.is_empty() {
        return Err(Error::Config("no usable host keys".to_string()));
    }
    Ok(keys)
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    load_secret_key(path, None)
        .map_err(|e| Error::Config(format!("cannot load host key {}: {}", path.display(), e)))
}

async fn generate_host_key(path: &Path) -> Result<PrivateKey> {
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Config(format!("host key generation failed: {}", e)))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::Config(format!("host key encoding failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, encoded.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
    }
    Ok(key)
}

/// Validates user certificates against the trusted CA set
pub struct CertChecker {
    trusted_cas: Vec<PublicKey>,
}

impl CertChecker {
    pub async fn load(paths: &[PathBuf], config_dir: &Path) -> Result<Self> {
        let mut trusted_cas = Vec::new();
        for configured in paths {
            let path = absolute_or_joined(configured, config_dir);
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                Error::Config(format!(
                    "cannot read trusted CA key {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let key = PublicKey::from_openssh(content.trim()).map_err(|e| {
                Error::Config(format!(
                    "cannot parse trusted CA key {}: {}",
                    path.display(),
                    e
                ))
            })?;
            trusted_cas.push(key);
        }
        Ok(Self { trusted_cas })
    }

    pub fn check_cert(
        &self,
        username: &str,
        cert: &Certificate,
        client_ip: IpAddr,
    ) -> Result<()> {
        if cert.cert_type() != CertType::User {
            return Err(Error::Authentication(format!(
                "certificate has type {:?}, expected a user certificate",
                cert.cert_type()
            )));
        }
        let signed_by_trusted = self
            .trusted_cas
            .iter()
            .any(|ca| ca.key_data() == cert.signature_key());
        if !signed_by_trusted {
            return Err(Error::Authentication(
                "certificate signed by unrecognized authority".to_string(),
            ));
        }
        let now = chrono::Utc::now().timestamp() as u64;
        if now < cert.valid_after() || now > cert.valid_before() {
            return Err(Error::Authentication("certificate is not valid now".to_string()));
        }
        if !cert.valid_principals().is_empty()
            && !cert.valid_principals().iter().any(|p| p == username)
        {
            return Err(Error::Authentication(format!(
                "certificate is not valid for principal {}",
                username
            )));
        }
        for (name, value) in cert.critical_options().iter() {
            match name.as_str() {
                "source-address" => {
                    if !source_address_match(value, client_ip) {
                        return Err(Error::Authentication(format!(
                            "certificate source-address does not match {}",
                            client_ip
                        )));
                    }
                }
                other => {
                    return Err(Error::Authentication(format!(
                        "unsupported critical option {}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Match a `source-address` critical option value (comma-separated IPs
/// or CIDR blocks) against the client address
pub fn source_address_match(list: &str, ip: IpAddr) -> bool {
    for entry in list.split(',').map(str::trim) {
        if let Some((network, prefix)) = entry.split_once('/') {
            let Ok(prefix) = prefix.parse::<u32>() else {
                continue;
            };
            match (network.parse::<IpAddr>(), ip) {
                (Ok(IpAddr::V4(net)), IpAddr::V4(addr)) if prefix <= 32 => {
                    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                    if u32::from(net) & mask == u32::from(addr) & mask {
                        return true;
                    }
                }
                (Ok(IpAddr::V6(net)), IpAddr::V6(addr)) if prefix <= 128 => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - prefix)
                    };
                    if u128::from(net) & mask == u128::from(addr) & mask {
                        return true;
                    }
                }
                _ => {}
            }
        } else if entry.parse::<IpAddr>().map(|e| e == ip).unwrap_or(false) {
            return true;
        }
    }
    false
}

#[derive(Debug, Serialize)]
struct KbdAuthRequest {
    request_id: String,
    username: String,
    ip: String,
    answers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KbdAuthResponse {
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    echos: Vec<bool>,
    /// 1 success, 0 continue, negative failure
    #[serde(default)]
    auth_result: i32,
}

/// Drive one round of the keyboard-interactive hook: an HTTP endpoint
/// receiving JSON, or a local program receiving the request as its
/// single argument and answering on stdout
async fn execute_kbd_hook(hook: &str, request: &KbdAuthRequest) -> Result<KbdAuthResponse> {
    if hook.starts_with("http") {
        let client = reqwest::Client::builder()
            .timeout(KBD_HOOK_TIMEOUT)
            .build()
            .map_err(|e| Error::Generic(format!("hook client: {}", e)))?;
        let response = client
            .post(hook)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("keyboard interactive hook: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Authentication(format!(
                "keyboard interactive hook returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid hook response: {}", e)))
    } else {
        let payload = serde_json::to_string(request)
            .map_err(|e| Error::Generic(format!("hook request encoding: {}", e)))?;
        let output = tokio::time::timeout(
            KBD_HOOK_TIMEOUT,
            tokio::process::Command::new(hook)
                .arg(payload)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Generic("keyboard interactive hook timed out".to_string()))?
        .map_err(|e| Error::Generic(format!("keyboard interactive hook: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Authentication(
                "keyboard interactive hook rejected the request".to_string(),
            ));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Protocol(format!("invalid hook response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tidegate_core::{Permission, UserStatus};

    fn test_user() -> User {
        let mut permissions = StdHashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        User {
            username: "login".to_string(),
            home_dir: PathBuf::from("/srv/login"),
            status: UserStatus::Enabled,
            expiration_date: 0,
            permissions,
            filters: Default::default(),
            quota_files: 0,
            quota_size: 0,
            max_sessions: 2,
            used_quota_files: 0,
            used_quota_size: 0,
            last_login: None,
            fs_config: Default::default(),
            virtual_folders: Vec::new(),
        }
    }

    #[test]
    fn test_login_gate_accepts_valid_user() {
        let user = test_user();
        assert!(evaluate_login(
            &user,
            LoginMethod::Password,
            &[],
            "10.0.0.1".parse().unwrap(),
            QuotaTracking::Full,
            0,
        )
        .is_ok());
    }

    #[test]
    fn test_login_gate_rejections() {
        let mut user = test_user();
        user.status = UserStatus::Disabled;
        assert!(evaluate_login(
            &user,
            LoginMethod::Password,
            &[],
            "10.0.0.1".parse().unwrap(),
            QuotaTracking::Full,
            0,
        )
        .is_err());

        let user = test_user();
        // session cap reached
        assert!(evaluate_login(
            &user,
            LoginMethod::Password,
            &[],
            "10.0.0.1".parse().unwrap(),
            QuotaTracking::Full,
            2,
        )
        .is_err());

        let mut user = test_user();
        user.home_dir = PathBuf::from("relative");
        assert!(evaluate_login(
            &user,
            LoginMethod::Password,
            &[],
            "10.0.0.1".parse().unwrap(),
            QuotaTracking::Full,
            0,
        )
        .is_err());

        let mut user = test_user();
        user.filters.allowed_ip = vec!["192.168.1.*".to_string()];
        assert!(evaluate_login(
            &user,
            LoginMethod::Password,
            &[],
            "10.0.0.1".parse().unwrap(),
            QuotaTracking::Full,
            0,
        )
        .is_err());
    }

    #[test]
    fn test_login_gate_overlap_depends_on_tracking() {
        let mut user = test_user();
        user.virtual_folders = vec![
            tidegate_core::VirtualFolder {
                name: "a".to_string(),
                mapped_path: PathBuf::from("/data/a"),
                virtual_path: "/a".to_string(),
                used_quota_files: 0,
                used_quota_size: 0,
                quota_files: -1,
                quota_size: -1,
            },
            tidegate_core::VirtualFolder {
                name: "b".to_string(),
                mapped_path: PathBuf::from("/data/a/b"),
                virtual_path: "/b".to_string(),
                used_quota_files: 0,
                used_quota_size: 0,
                quota_files: -1,
                quota_size: -1,
            },
        ];
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(evaluate_login(&user, LoginMethod::Password, &[], ip, QuotaTracking::Full, 0).is_err());
        assert!(evaluate_login(&user, LoginMethod::Password, &[], ip, QuotaTracking::Off, 0).is_ok());
    }

    #[test]
    fn test_source_address_match() {
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        assert!(source_address_match("192.168.1.10", ip));
        assert!(source_address_match("10.0.0.0/8,192.168.1.0/24", ip));
        assert!(!source_address_match("10.0.0.0/8", ip));
        assert!(!source_address_match("garbage", ip));
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(source_address_match("2001:db8::/32", v6));
        assert!(!source_address_match("2001:db9::/32", v6));
    }

    #[test]
    fn test_method_set_mapping() {
        let set = method_set(&[LoginMethod::Password]);
        assert!(set.contains(MethodSet::PASSWORD));
        assert!(!set.contains(MethodSet::PUBLICKEY));
        let set = method_set(&[LoginMethod::KeyboardInteractive, LoginMethod::KeyAndPassword]);
        assert!(set.contains(MethodSet::KEYBOARD_INTERACTIVE));
        assert!(set.contains(MethodSet::PASSWORD));
    }

    #[tokio::test]
    async fn test_host_key_generation_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let keys = load_host_keys(&[], dir.path()).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(dir.path().join("id_ed25519").exists());

        // the second run loads the persisted key instead of generating
        let again = load_host_keys(&[], dir.path()).await.unwrap();
        assert_eq!(
            keys[0].public_key().fingerprint(HashAlg::Sha256).to_string(),
            again[0].public_key().fingerprint(HashAlg::Sha256).to_string()
        );
    }
}
