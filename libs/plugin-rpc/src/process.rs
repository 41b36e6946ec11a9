use std::process::Stdio;
use std::sync::Arc;

use ingest_api::PluginError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use base64::Engine;

use crate::cert;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::handshake::{
    HandshakeInfo, CLIENT_CERT_KEY, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION, PROTOCOL_VERSION_KEY,
};

/// A spawned plugin child process with its RPC channel established. Held
/// by the plugin manager for the plugin's whole lifetime.
pub struct PluginProcess {
    child: Mutex<Child>,
    pub conn: Arc<Connection>,
}

impl PluginProcess {
    /// Spawn `path`, perform the handshake described in `spec.md` §4.3,
    /// and dial the plugin's advertised mTLS endpoint. A protocol
    /// version mismatch or any handshake failure kills the child and
    /// returns a `Config`-kind error.
    pub async fn spawn(path: &std::path::Path) -> Result<Self, PluginError> {
        let client_identity = cert::generate("127.0.0.1")
            .map_err(|e| PluginError::config(format!("generating client identity: {e}")))?;
        let client_cert_b64 = base64::engine::general_purpose::STANDARD.encode(&client_identity.cert_der);

        let mut child = Command::new(path)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string())
            .env(CLIENT_CERT_KEY, client_cert_b64)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::config(format!("spawn '{}': {e}", path.display())))?;

        if let Some(stderr) = child.stderr.take() {
            let label = path.display().to_string();
            tokio::spawn(log_plugin_stderr(label, stderr));
        }

        let stdout = child.stdout.take().ok_or_else(|| PluginError::config("plugin stdout not piped"))?;
        let mut lines = BufReader::new(stdout).lines();
        let line = lines
            .next_line()
            .await
            .map_err(|e| PluginError::config(format!("reading handshake: {e}")))?
            .ok_or_else(|| PluginError::config("plugin exited before handshake"))?;

        // Remaining stdout (if the plugin logs there) is simply dropped;
        // plugins are expected to log to stderr after the handshake line.
        tokio::spawn(async move {
            let mut lines = lines;
            while lines.next_line().await.transpose().is_some() {}
        });

        let info = HandshakeInfo::parse(&line).map_err(|e| PluginError::config(format!("handshake: {e}")))?;
        if info.protocol_version != PROTOCOL_VERSION {
            let _ = child.kill().await;
            return Err(PluginError::config(format!(
                "plugin protocol version mismatch: plugin={}, host={PROTOCOL_VERSION}",
                info.protocol_version
            )));
        }

        let conn = dial(&info, &client_identity).await.map_err(|e| {
            PluginError::config(format!("dialing plugin at {}: {e}", info.addr))
        })?;

        Ok(Self { child: Mutex::new(child), conn: Arc::new(conn) })
    }

    /// Best-effort kill, safe to call from any number of shared
    /// references (the plugin manager's `stop()` and a crashed-plugin
    /// cleanup path may race to call this).
    pub async fn kill(&self) {
        let _ = self.child.lock().await.kill().await;
    }
}

async fn dial(info: &HandshakeInfo, client_identity: &cert::OneShotIdentity) -> Result<Connection, TransportError> {
    use rustls_pki_types::CertificateDer;

    let stream = TcpStream::connect(info.addr).await?;
    let cert_der = CertificateDer::from(info.cert_der.clone()).into_owned();
    let client_config = cert::client_config(cert_der, client_identity)?;
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = rustls_pki_types::ServerName::IpAddress(info.addr.ip().into());
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Connection::new(tls_stream))
}

async fn log_plugin_stderr(label: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(plugin = %label, "{line}");
    }
}

/// Server side of the handshake, used by a plugin binary's `main`. Binds
/// a loopback mTLS listener, prints the handshake line to stdout, and
/// accepts exactly one connection from the parent.
pub struct PluginHost;

impl PluginHost {
    /// Validate the launch environment the parent is required to set,
    /// bind a one-shot TLS listener, announce it on stdout, and return
    /// the established connection.
    pub async fn announce_and_accept() -> Result<Connection, TransportError> {
        let cookie = std::env::var(MAGIC_COOKIE_KEY).unwrap_or_default();
        if cookie != MAGIC_COOKIE_VALUE {
            return Err(TransportError::Handshake(format!(
                "missing or wrong {MAGIC_COOKIE_KEY}; this binary must be launched by the ingest plugin manager"
            )));
        }
        let requested_version: u32 = std::env::var(PROTOCOL_VERSION_KEY)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| TransportError::Handshake(format!("missing {PROTOCOL_VERSION_KEY}")))?;
        if requested_version != PROTOCOL_VERSION {
            return Err(TransportError::Handshake(format!(
                "protocol version mismatch: host wants {requested_version}, plugin has {PROTOCOL_VERSION}"
            )));
        }
        let client_cert_b64 = std::env::var(CLIENT_CERT_KEY)
            .map_err(|_| TransportError::Handshake(format!("missing {CLIENT_CERT_KEY}")))?;
        let client_cert = rustls_pki_types::CertificateDer::from(
            base64::engine::general_purpose::STANDARD
                .decode(client_cert_b64.as_bytes())
                .map_err(|e| TransportError::Handshake(format!("bad {CLIENT_CERT_KEY}: {e}")))?,
        )
        .into_owned();

        let identity = cert::generate("127.0.0.1")?;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;

        let info = HandshakeInfo { protocol_version: PROTOCOL_VERSION, addr, cert_der: identity.cert_der.to_vec() };
        print!("{}", info.to_line());
        use std::io::Write;
        std::io::stdout().flush()?;

        let (stream, _peer) = listener.accept().await?;
        let server_config = cert::server_config(&identity, client_cert)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let tls_stream = acceptor.accept(stream).await.map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Connection::new(tls_stream))
    }
}
