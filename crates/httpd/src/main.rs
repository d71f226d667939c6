//! Demo daemon.
//!
//! ```text
//! micro-httpd [PORT_OR_UNIX_PATH] [Key=Value ...]
//! ```
//!
//! Routes: `/` says hello, `/echo` streams the request body back from a
//! worker thread, `/ws` echoes WebSocket messages. Logging is controlled with
//! `RUST_LOG`.

use std::io::{Read, Write};

use http::StatusCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use micro_httpd::config::HttpConfig;
use micro_httpd::daemon::HttpDaemon;
use micro_httpd::io::{CompressionType, HttpIo};
use micro_httpd::protocol::RequestInfo;
use micro_httpd::ws::Message;

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let mut config = HttpConfig::default();
    config.port = 8080;

    for arg in std::env::args().skip(1) {
        let result = match arg.split_once('=') {
            Some((key, value)) => config.set_property(key, value),
            None => config.set_port_or_path(&arg),
        };
        if let Err(e) = result {
            error!(cause = %e, "invalid argument");
            std::process::exit(2);
        }
    }

    let mut daemon = HttpDaemon::new();
    if let Err(e) = daemon.start(&config, route) {
        error!(cause = %e, "failed to start");
        std::process::exit(1);
    }
    if let Some(addr) = daemon.local_addr() {
        info!(%addr, "listening, press ctrl-c to stop");
    }

    let signal = tokio::runtime::Builder::new_current_thread().enable_all().build().map(|rt| rt.block_on(tokio::signal::ctrl_c()));
    if let Err(e) | Ok(Err(e)) = signal {
        warn!(cause = %e, "failed to wait for ctrl-c");
    }

    daemon.stop();
}

fn route(request: &RequestInfo, io: &HttpIo) {
    match request.path() {
        "/" => io.attach_text(StatusCode::OK, "Hello World!\r\n"),
        "/echo" => io.run_async(echo),
        "/ws" if io.is_websocket() => io.run_async(ws_echo),
        _ => io.attach_error(StatusCode::NOT_FOUND, None),
    }
}

fn echo(io: &HttpIo) {
    let Some(encoding) = io.negotiate_encoding(CompressionType::Gzip) else { return };

    let mut reader = match io.open_for_read(Some(16 << 20)) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(cause = %e, "refusing request body");
            return;
        }
    };
    let mut writer = io.open_for_write(StatusCode::OK, None, encoding);

    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(cause = %e, "failed to read request body");
                return;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]) {
            warn!(cause = %e, "failed to write response body");
            return;
        }
    }

    if let Err(e) = writer.finish() {
        warn!(cause = %e, "failed to finish response body");
    }
}

fn ws_echo(io: &HttpIo) {
    let mut ws = match io.upgrade_websocket() {
        Ok(ws) => ws,
        Err(e) => {
            warn!(cause = %e, "websocket upgrade failed");
            return;
        }
    };

    loop {
        let sent = match ws.read_message() {
            Ok(Some(Message::Text(text))) => ws.send_text(&text),
            Ok(Some(Message::Binary(data))) => ws.send_binary(&data),
            Ok(Some(Message::Close { .. }) | None) => break,
            Err(e) => {
                warn!(cause = %e, "websocket read failed");
                return;
            }
        };
        if let Err(e) = sent {
            warn!(cause = %e, "websocket write failed");
            return;
        }
    }

    if let Err(e) = ws.close(1000, "bye") {
        warn!(cause = %e, "websocket close failed");
    }
}
