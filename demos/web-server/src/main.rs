//! Web terminal server: xterm.js in the browser, remote shells behind the
//! broker.
//!
//! Run with: cargo run -p shell-broker-web [-- --config path/to/config.toml]
//!
//! Then open http://localhost:3000 in your browser.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{Router, response::Html, routing::get};
use clap::Parser;
use shell_broker_core::{
    AuditSink, AuthGate, BrokerConfig, OpenGate, RemoteShell, TokenGate, config::BackendKind,
};
use shell_broker_session::{
    Broker,
    audit::{QueuedAudit, TracingAudit},
};
use shell_broker_ssh::SimulatedShell;
use shell_broker_transport::websocket::{WsState, create_ws_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Web terminal server for the shell broker.
#[derive(Parser, Debug)]
#[command(name = "shell-broker-web")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SHELL_BROKER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.or_else(BrokerConfig::default_path);
    let config = match &config_path {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();
    if let Some(path) = &config_path {
        info!(path = %path.display(), "Using config file");
    }

    let shell = backend(&config)?;
    let (audit, _audit_task) =
        QueuedAudit::spawn(Arc::new(TracingAudit), config.audit.queue_capacity);
    let audit: Arc<dyn AuditSink> = Arc::new(audit);
    let broker = Arc::new(Broker::new(shell, audit, &config));
    let sweeper = broker.spawn_sweeper();

    let auth: Arc<dyn AuthGate> = if config.auth_enabled() {
        info!(tokens = config.auth.tokens.len(), "Token authentication enabled");
        Arc::new(TokenGate::new(
            config.auth.cookie_name.clone(),
            config.auth.tokens.clone(),
        ))
    } else {
        info!("Authentication disabled, all callers are anonymous");
        Arc::new(OpenGate)
    };

    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(WsState::new(Arc::clone(&broker), auth)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.server.bind;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Server listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    sweeper.abort();
    broker.shutdown().await;
    info!("Server stopped");
    Ok(())
}

fn backend(config: &BrokerConfig) -> Result<Arc<dyn RemoteShell>> {
    match config.backend.kind {
        BackendKind::Simulated => {
            info!("Using simulated shell backend");
            Ok(Arc::new(SimulatedShell::new()))
        }
        #[cfg(feature = "russh")]
        BackendKind::Russh => {
            info!(term = %config.session.term, "Using SSH backend");
            Ok(Arc::new(shell_broker_ssh::RusshShell::new(
                config.session.term.clone(),
            )))
        }
        #[cfg(not(feature = "russh"))]
        BackendKind::Russh => {
            anyhow::bail!("backend.kind = \"russh\" needs the `russh` feature of shell-broker-web")
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Shell Broker - Terminal</title>
    <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css" />
    <script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js"></script>
    <script src="https://cdn.jsdelivr.net/npm/xterm-addon-fit@0.8.0/lib/xterm-addon-fit.js"></script>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        form { display: flex; gap: 8px; margin-bottom: 10px; flex-wrap: wrap; }
        input, button {
            background: #2d2d2d;
            color: #d4d4d4;
            border: 1px solid #444;
            padding: 4px 8px;
        }
        #terminal-container {
            width: 100%;
            height: calc(100vh - 160px);
        }
        .status {
            color: #888;
            font-size: 14px;
            margin-bottom: 10px;
        }
        .connected { color: #4a4; }
        .connecting { color: #aa4; }
        .disconnected, .error { color: #a44; }
    </style>
</head>
<body>
    <h1>Shell Broker Terminal</h1>
    <form id="connect-form">
        <input id="host" placeholder="host" value="localhost" required />
        <input id="port" type="number" placeholder="port" value="22" min="1" max="65535" required />
        <input id="username" placeholder="username" required />
        <input id="password" type="password" placeholder="password" />
        <button type="submit">Connect</button>
        <button type="button" id="disconnect">Disconnect</button>
    </form>
    <div class="status" id="status">Not connected</div>
    <div id="terminal-container"></div>

    <script>
        const term = new Terminal({
            cursorBlink: true,
            fontSize: 14,
            fontFamily: 'Menlo, Monaco, "Courier New", monospace',
            theme: {
                background: '#1e1e1e',
                foreground: '#d4d4d4',
            }
        });

        const fitAddon = new FitAddon.FitAddon();
        term.loadAddon(fitAddon);
        term.open(document.getElementById('terminal-container'));
        fitAddon.fit();

        const status = document.getElementById('status');
        const encoder = new TextEncoder();
        const decoder = new TextDecoder();
        let ws;
        let connected = false;

        function setStatus(state, message) {
            status.textContent = message;
            status.className = `status ${state}`;
            connected = state === 'connected';
        }

        function toBase64(text) {
            let binary = '';
            for (const byte of encoder.encode(text)) binary += String.fromCharCode(byte);
            return btoa(binary);
        }

        function fromBase64(data) {
            const binary = atob(data);
            const bytes = new Uint8Array(binary.length);
            for (let i = 0; i < binary.length; i++) bytes[i] = binary.charCodeAt(i);
            return decoder.decode(bytes, { stream: true });
        }

        function send(msg) {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify(msg));
            }
        }

        function open() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            const token = new URLSearchParams(window.location.search).get('token');
            const query = token ? `?token=${encodeURIComponent(token)}` : '';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws${query}`);

            ws.onclose = () => {
                setStatus('disconnected', 'Socket closed - reconnecting...');
                setTimeout(open, 2000);
            };

            ws.onerror = (err) => {
                console.error('WebSocket error:', err);
            };

            ws.onmessage = (event) => {
                try {
                    const msg = JSON.parse(event.data);
                    if (msg.type === 'output' && msg.data) {
                        term.write(fromBase64(msg.data));
                    } else if (msg.type === 'status') {
                        setStatus(msg.state, msg.message);
                        if (msg.state === 'connected') {
                            fitAddon.fit();
                            send({ type: 'resize', cols: term.cols, rows: term.rows });
                            term.focus();
                        }
                    } else if (msg.type === 'error') {
                        term.writeln(`\r\n[${msg.kind} error: ${msg.message}]\r\n`);
                    }
                } catch (e) {
                    console.error('Failed to parse message:', e);
                }
            };
        }

        document.getElementById('connect-form').addEventListener('submit', (event) => {
            event.preventDefault();
            term.reset();
            send({
                type: 'connect',
                host: document.getElementById('host').value,
                port: Number(document.getElementById('port').value),
                username: document.getElementById('username').value,
                credential: document.getElementById('password').value,
                auth_method: 'password',
                cols: term.cols,
                rows: term.rows,
            });
        });

        document.getElementById('disconnect').addEventListener('click', () => {
            send({ type: 'disconnect' });
        });

        term.onData((data) => {
            if (connected) send({ type: 'input', data: toBase64(data) });
        });

        window.addEventListener('resize', () => {
            fitAddon.fit();
            if (connected) send({ type: 'resize', cols: term.cols, rows: term.rows });
        });

        setInterval(() => send({ type: 'ping' }), 30000);

        open();
    </script>
</body>
</html>
"#;
