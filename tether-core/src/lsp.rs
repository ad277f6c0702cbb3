use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::util::extension_for_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
}

/// A language server reachable by the editor content through a local port.
pub trait LspProxy: Send + Sync {
    /// Start serving. Must return immediately; a proxy that is not `Stopped`
    /// ignores the call.
    fn start(&self);

    /// Release the server. Safe to call in any state.
    fn stop(&self);

    fn state(&self) -> ProxyState;

    fn port(&self) -> u16;

    /// Value sent to the editor as `lspPath`.
    fn lsp_path(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port())
    }
}

/// Where the editor should connect for language features.
#[derive(Clone)]
pub enum LspEndpoint {
    /// A proxy owned by the session that resolved it.
    Local(Arc<dyn LspProxy>),
    /// An already running server at a fixed URL.
    Remote(String),
}

impl LspEndpoint {
    pub fn lsp_path(&self) -> String {
        match self {
            LspEndpoint::Local(proxy) => proxy.lsp_path(),
            LspEndpoint::Remote(url) => url.clone(),
        }
    }

    pub fn proxy(&self) -> Option<&Arc<dyn LspProxy>> {
        match self {
            LspEndpoint::Local(proxy) => Some(proxy),
            LspEndpoint::Remote(_) => None,
        }
    }
}

impl fmt::Debug for LspEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LspEndpoint::Local(proxy) => f
                .debug_struct("Local")
                .field("port", &proxy.port())
                .field("state", &proxy.state())
                .finish(),
            LspEndpoint::Remote(url) => f.debug_tuple("Remote").field(url).finish(),
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_string()
}

/// Extension → language server mappings shared by every session.
///
/// Launch commands take precedence over websocket URLs. Adding a mapping for
/// an extension that already has one replaces it.
#[derive(Default)]
pub struct LspRegistry {
    servers: RwLock<HashMap<String, Vec<String>>>,
    ws_servers: RwLock<HashMap<String, String>>,
}

impl LspRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let registry = Self::new();
        for (ext, server) in &config.servers {
            registry.add_lsp_server(server.command_line(), [ext]);
        }
        for (ext, url) in &config.ws_servers {
            registry.add_lsp_ws_server(url, [ext]);
        }
        registry
    }

    /// Use `command` (program followed by its arguments, e.g.
    /// `["html-languageserver", "--stdio"]`) for files with the given extensions.
    pub fn add_lsp_server<I, S>(&self, command: Vec<String>, extensions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut servers = self.servers.write();
        for ext in extensions {
            servers.insert(normalize_extension(ext.as_ref()), command.clone());
        }
    }

    /// Use an already running websocket server, e.g. `ws://127.0.0.1:3000/php`.
    pub fn add_lsp_ws_server<I, S>(&self, url: &str, extensions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ws_servers = self.ws_servers.write();
        for ext in extensions {
            ws_servers.insert(normalize_extension(ext.as_ref()), url.to_string());
        }
    }

    /// Forget both kinds of mapping for the given extensions.
    pub fn remove_lsp_server<I, S>(&self, extensions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exts: Vec<String> = extensions
            .into_iter()
            .map(|e| normalize_extension(e.as_ref()))
            .collect();
        {
            let mut servers = self.servers.write();
            for ext in &exts {
                servers.remove(ext);
            }
        }
        let mut ws_servers = self.ws_servers.write();
        for ext in &exts {
            ws_servers.remove(ext);
        }
    }

    pub fn command_for(&self, ext: &str) -> Option<Vec<String>> {
        self.servers.read().get(&normalize_extension(ext)).cloned()
    }

    pub fn url_for(&self, ext: &str) -> Option<String> {
        self.ws_servers.read().get(&normalize_extension(ext)).cloned()
    }

    /// A fresh proxy for a mapped launch command, the URL of a mapped
    /// websocket server, or nothing.
    pub fn resolve_for_extension(&self, ext: &str) -> Option<LspEndpoint> {
        if let Some(command) = self.command_for(ext) {
            return match StdioLspProxy::new(command) {
                Ok(proxy) => Some(LspEndpoint::Local(Arc::new(proxy))),
                Err(e) => {
                    log::warn!("LSP: no proxy for '.{}': {}", ext, e);
                    None
                }
            };
        }
        self.url_for(ext).map(LspEndpoint::Remote)
    }

    pub fn resolve_for_file(&self, file_name: &str) -> Option<LspEndpoint> {
        self.resolve_for_extension(extension_for_file(file_name)?)
    }
}

struct Lifecycle {
    state: ProxyState,
    /// Bumped by every start and stop so a finished background task from an
    /// earlier run cannot overwrite the state of a later one.
    generation: u64,
    shutdown: Option<watch::Sender<bool>>,
}

impl Lifecycle {
    fn set_if_current(&mut self, generation: u64, state: ProxyState) {
        if self.generation == generation {
            self.state = state;
        }
    }
}

/// Runs a stdio language server behind a websocket on a local port.
///
/// One client is served at a time. When it disconnects the server is
/// restarted so a reconnecting editor finds a fresh session on the same port.
///
/// The port is reserved when the proxy is created and stays reserved until
/// the proxy is dropped, so the `lspPath` handed to the editor remains valid
/// across restarts.
pub struct StdioLspProxy {
    command: Vec<String>,
    listener: StdTcpListener,
    port: u16,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl StdioLspProxy {
    pub fn new(command: Vec<String>) -> Result<Self> {
        let listener = StdTcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .map_err(|e| launch_error(&command, format!("cannot bind local port: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| launch_error(&command, e))?
            .port();

        Ok(Self {
            command,
            listener,
            port,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ProxyState::Stopped,
                generation: 0,
                shutdown: None,
            })),
        })
    }

    fn prepare_listener(&self) -> Result<StdTcpListener> {
        let listener = self
            .listener
            .try_clone()
            .map_err(|e| launch_error(&self.command, format!("cannot reuse listener: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| launch_error(&self.command, e))?;
        Ok(listener)
    }
}

impl LspProxy for StdioLspProxy {
    fn start(&self) {
        let (generation, shutdown_rx) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ProxyState::Stopped {
                log::debug!("LSP proxy on port {} already {:?}", self.port, lifecycle.state);
                return;
            }
            let (tx, rx) = watch::channel(false);
            lifecycle.state = ProxyState::Starting;
            lifecycle.generation += 1;
            lifecycle.shutdown = Some(tx);
            (lifecycle.generation, rx)
        };

        let listener = match self.prepare_listener() {
            Ok(l) => l,
            Err(e) => {
                log::error!("{}", e);
                self.lifecycle
                    .lock()
                    .set_if_current(generation, ProxyState::Stopped);
                return;
            }
        };

        let command = self.command.clone();
        let lifecycle = self.lifecycle.clone();
        let port = self.port;
        let spawned = std::thread::Builder::new()
            .name(format!("lsp-proxy-{}", port))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("LSP proxy: failed to create runtime: {}", e);
                        lifecycle
                            .lock()
                            .set_if_current(generation, ProxyState::Stopped);
                        return;
                    }
                };
                let result = rt.block_on(serve(
                    command,
                    listener,
                    port,
                    shutdown_rx,
                    lifecycle.clone(),
                    generation,
                ));
                if let Err(e) = result {
                    log::error!("{}", e);
                }
                lifecycle
                    .lock()
                    .set_if_current(generation, ProxyState::Stopped);
                log::debug!("LSP proxy on port {} finished", port);
            });

        if let Err(e) = spawned {
            log::error!("LSP proxy: failed to spawn worker thread: {}", e);
            self.lifecycle
                .lock()
                .set_if_current(generation, ProxyState::Stopped);
        }
    }

    fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ProxyState::Stopped {
            return;
        }
        if let Some(tx) = lifecycle.shutdown.take() {
            let _ = tx.send(true);
        }
        lifecycle.generation += 1;
        lifecycle.state = ProxyState::Stopped;
        log::info!("LSP proxy on port {} stopped", self.port);
    }

    fn state(&self) -> ProxyState {
        self.lifecycle.lock().state
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for StdioLspProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Upper bound on a single relayed message, either direction.
const MAX_LSP_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// How long a new connection gets to complete the websocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn launch_error(command: &[String], reason: impl fmt::Display) -> Error {
    Error::ProxyLaunchFailed {
        command: command.join(" "),
        reason: reason.to_string(),
    }
}

struct ServerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

fn spawn_server(command: &[String]) -> Result<ServerProcess> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| launch_error(command, "empty command line"))?;

    log::info!("LSP proxy: starting '{}' with args {:?}", program, args);
    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| launch_error(command, e))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| launch_error(command, "failed to get stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_error(command, "failed to get stdout"))?;

    if let Some(stderr) = child.stderr.take() {
        let name = program.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            log::warn!("LSP stderr [{}]: {}", name, trimmed);
                        }
                    }
                }
            }
        });
    }

    Ok(ServerProcess {
        child,
        stdin,
        stdout,
    })
}

async fn kill_server(mut child: Child, command: &[String]) {
    if let Err(e) = child.kill().await {
        log::debug!("LSP proxy: kill '{}': {}", command.join(" "), e);
    }
}

/// Accepts websocket clients one at a time. Each client gets a server of its
/// own; when the client leaves, the server is replaced before the next accept.
async fn serve(
    command: Vec<String>,
    listener: StdTcpListener,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    generation: u64,
) -> Result<()> {
    if *shutdown.borrow() {
        return Ok(());
    }

    let listener = TcpListener::from_std(listener).map_err(|e| launch_error(&command, e))?;
    let mut server = spawn_server(&command)?;

    lifecycle
        .lock()
        .set_if_current(generation, ProxyState::Running);
    log::info!(
        "LSP proxy: '{}' available on ws://127.0.0.1:{}",
        command.join(" "),
        port
    );

    loop {
        let (socket, peer) = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            status = server.child.wait() => {
                log::warn!("LSP server '{}' exited with status: {:?}", command.join(" "), status);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("LSP proxy: accept failed on port {}: {}", port, e);
                    continue;
                }
            },
        };

        let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(socket)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                log::warn!("LSP proxy: websocket handshake with {} failed: {}", peer, e);
                continue;
            }
            Err(_) => {
                log::warn!("LSP proxy: websocket handshake with {} timed out", peer);
                continue;
            }
        };
        log::debug!("LSP proxy: client {} connected to port {}", peer, port);

        let ServerProcess {
            child,
            stdin,
            stdout,
        } = server;
        let shutting_down = serve_client(ws, stdin, stdout, &listener, &mut shutdown, port).await;
        kill_server(child, &command).await;
        if shutting_down {
            return Ok(());
        }

        log::debug!("LSP proxy: client {} left port {}, restarting server", peer, port);
        server = spawn_server(&command)?;
    }

    kill_server(server.child, &command).await;
    Ok(())
}

/// Relays one client until it or the server goes away. Returns true if the
/// proxy was shut down in the meantime.
async fn serve_client(
    ws: WebSocketStream<TcpStream>,
    stdin: ChildStdin,
    stdout: ChildStdout,
    listener: &TcpListener,
    shutdown: &mut watch::Receiver<bool>,
    port: u16,
) -> bool {
    let session = relay(ws, stdin, stdout);
    tokio::pin!(session);
    loop {
        tokio::select! {
            _ = &mut session => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            accepted = listener.accept() => {
                if let Ok((_, peer)) = accepted {
                    log::warn!(
                        "LSP proxy on port {} already has a client, refusing {}",
                        port,
                        peer
                    );
                }
            }
        }
    }
}

/// Websocket messages go to the server as `Content-Length` framed stdio
/// messages; framed server output goes back as text messages.
async fn relay<S>(ws: WebSocketStream<S>, mut stdin: ChildStdin, stdout: ChildStdout)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let mut reader = BufReader::new(stdout);

    let to_server = async {
        while let Some(message) = source.next().await {
            let body = match message {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("LSP proxy: client read failed: {}", e);
                    break;
                }
            };
            if let Err(e) = write_frame(&mut stdin, &body).await {
                log::debug!("LSP proxy: server stdin closed: {}", e);
                break;
            }
        }
    };

    let to_client = async {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(body)) => {
                    if let Err(e) = sink.send(Message::Text(body)).await {
                        log::debug!("LSP proxy: client write failed: {}", e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("LSP proxy: bad server output: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = to_server => log::debug!("LSP proxy: client disconnected"),
        _ = to_client => log::debug!("LSP proxy: server output ended"),
    }
    let _ = sink.close().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Next message body from a `Content-Length` framed stream, `None` at end of
/// stream. Header names are matched case-insensitively; other headers are
/// skipped.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    let mut content_length = None;
    let length = loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let header = line.trim();
        if header.is_empty() {
            match content_length {
                Some(len) => break len,
                None => continue,
            }
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    };

    if length > MAX_LSP_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {} bytes exceeds the limit", length),
        ));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A server the host already runs and exposes on a known port. The host owns
/// its lifecycle; start and stop only track state.
pub struct HostLspProxy {
    port: u16,
    state: Mutex<ProxyState>,
}

impl HostLspProxy {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: Mutex::new(ProxyState::Stopped),
        }
    }
}

impl LspProxy for HostLspProxy {
    fn start(&self) {
        *self.state.lock() = ProxyState::Running;
    }

    fn stop(&self) {
        *self.state.lock() = ProxyState::Stopped;
    }

    fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    fn port(&self) -> u16 {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LspServerConfig;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn wait_for_state(proxy: &dyn LspProxy, want: ProxyState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if proxy.state() == want {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn latest_mapping_wins() {
        let registry = LspRegistry::new();
        registry.add_lsp_ws_server("ws://127.0.0.1:1/a", ["php"]);
        registry.add_lsp_ws_server("ws://127.0.0.1:2/b", ["php", "php4"]);
        assert_eq!(
            registry.resolve_for_extension("php").unwrap().lsp_path(),
            "ws://127.0.0.1:2/b"
        );
        assert_eq!(registry.url_for(".php4").as_deref(), Some("ws://127.0.0.1:2/b"));
    }

    #[test]
    fn remove_clears_both_mappings() {
        let registry = LspRegistry::new();
        registry.add_lsp_server(cmd(&["gopls"]), ["go"]);
        registry.add_lsp_ws_server("ws://127.0.0.1:9/go", ["go"]);
        registry.remove_lsp_server(["go"]);
        assert!(registry.resolve_for_extension("go").is_none());
        assert!(registry.command_for("go").is_none());
        assert!(registry.url_for("go").is_none());
    }

    #[test]
    fn command_takes_precedence_over_url() {
        let registry = LspRegistry::new();
        registry.add_lsp_ws_server("ws://127.0.0.1:9/go", ["go"]);
        registry.add_lsp_server(cmd(&["gopls"]), ["go"]);
        let endpoint = registry.resolve_for_file("/proj/main.go").unwrap();
        let proxy = endpoint.proxy().expect("local proxy");
        assert_eq!(proxy.state(), ProxyState::Stopped);
        assert_eq!(endpoint.lsp_path(), format!("ws://127.0.0.1:{}", proxy.port()));
    }

    #[test]
    fn unmapped_file_resolves_to_nothing() {
        let registry = LspRegistry::new();
        registry.add_lsp_server(cmd(&["gopls"]), ["go"]);
        assert!(registry.resolve_for_file("notes.txt").is_none());
        assert!(registry.resolve_for_file("Makefile").is_none());
    }

    #[test]
    fn registry_from_config() {
        let mut config = BridgeConfig::default();
        config.servers.insert(
            "rs".into(),
            LspServerConfig {
                command: "rust-analyzer".into(),
                args: vec![],
            },
        );
        config
            .ws_servers
            .insert("php".into(), "ws://127.0.0.1:3000/php".into());
        let registry = LspRegistry::from_config(&config);
        assert_eq!(registry.command_for("rs"), Some(cmd(&["rust-analyzer"])));
        assert_eq!(registry.url_for("php").as_deref(), Some("ws://127.0.0.1:3000/php"));
    }

    #[test]
    fn stopping_a_stopped_proxy_is_noop() {
        let proxy = StdioLspProxy::new(cmd(&["cat"])).unwrap();
        proxy.stop();
        proxy.stop();
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }

    #[test]
    fn missing_binary_leaves_proxy_stopped() {
        let proxy = StdioLspProxy::new(cmd(&["tether-no-such-language-server"])).unwrap();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Stopped));
    }

    #[test]
    fn empty_command_leaves_proxy_stopped() {
        let proxy = StdioLspProxy::new(Vec::new()).unwrap();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Stopped));
    }

    type Client = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn connect(proxy: &dyn LspProxy) -> Client {
        let (ws, response) = tokio_tungstenite::connect_async(proxy.lsp_path())
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 101);
        ws
    }

    async fn round_trip(ws: &mut Client, text: &str) -> String {
        ws.send(Message::Text(text.to_string())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .unwrap();
        match reply {
            Message::Text(body) => body,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_is_idempotent_and_relays_websocket_messages() {
        let proxy = StdioLspProxy::new(cmd(&["cat"])).unwrap();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Running));
        proxy.start();
        assert_eq!(proxy.state(), ProxyState::Running);

        let mut ws = connect(&proxy).await;
        let init = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        assert_eq!(round_trip(&mut ws, init).await, init);
        let note = r#"{"jsonrpc":"2.0","method":"initialized","params":{"text":"ü"}}"#;
        assert_eq!(round_trip(&mut ws, note).await, note);

        proxy.stop();
        proxy.stop();
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reconnecting_client_gets_a_fresh_server() {
        let proxy = StdioLspProxy::new(cmd(&["cat"])).unwrap();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Running));

        let mut first = connect(&proxy).await;
        assert_eq!(round_trip(&mut first, "{\"id\":1}").await, "{\"id\":1}");
        first.close(None).await.unwrap();
        drop(first);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(proxy.state(), ProxyState::Running);

        let mut second = connect(&proxy).await;
        assert_eq!(round_trip(&mut second, "{\"id\":2}").await, "{\"id\":2}");
        proxy.stop();
    }

    #[cfg(unix)]
    #[test]
    fn plain_http_request_is_not_forwarded() {
        let proxy = StdioLspProxy::new(cmd(&["cat"])).unwrap();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Running));

        let mut stream = std::net::TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .unwrap();
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        assert!(!buf.starts_with(b"GET"));
        assert_eq!(proxy.state(), ProxyState::Running);
        proxy.stop();
    }

    #[tokio::test]
    async fn frames_are_read_by_content_length() {
        let input: &[u8] = concat!(
            "content-length: 2\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            "Content-Length: 7\r\n\r\n[1,2,3]"
        )
        .as_bytes();
        let mut reader = BufReader::new(input);
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("{}"));
        assert_eq!(
            read_frame(&mut reader).await.unwrap().as_deref(),
            Some("[1,2,3]")
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let input: &[u8] = b"Content-Length: 10\r\n\r\n{}";
        let mut reader = BufReader::new(input);
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn written_frame_carries_byte_length() {
        let mut out = Vec::new();
        write_frame(&mut out, "{\"t\":\"ü\"}".as_bytes()).await.unwrap();
        assert_eq!(out, "Content-Length: 10\r\n\r\n{\"t\":\"ü\"}".as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn restart_keeps_the_same_port() {
        let proxy = StdioLspProxy::new(cmd(&["cat"])).unwrap();
        let port = proxy.port();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Running));
        proxy.stop();
        proxy.start();
        assert!(wait_for_state(&proxy, ProxyState::Running));
        assert_eq!(proxy.port(), port);
        proxy.stop();
    }

    #[test]
    fn host_proxy_tracks_state() {
        let proxy = HostLspProxy::new(4040);
        assert_eq!(proxy.lsp_path(), "ws://127.0.0.1:4040");
        proxy.start();
        proxy.start();
        assert_eq!(proxy.state(), ProxyState::Running);
        proxy.stop();
        proxy.stop();
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }
}
