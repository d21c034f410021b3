//! Demo web server running scripts in a child interpreter.
//!
//! Run with: cargo run -p web-server-demo -- --host "python3 -u worker.py"
//!
//! Then open http://localhost:3000 in your browser. The host program must
//! speak the JSON-lines worker protocol on its stdin/stdout.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{Router, response::Html, routing::get};
use clap::Parser;
use script_worker_core::{OutputMode, SessionConfig, config::DEFAULT_TIMEOUT_SECS};
use script_worker_host::{CommandBuilder, HostProgram, ProcessLauncher};
use script_worker_transport::websocket::{WsState, create_ws_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Serve a browser page driving a script worker")]
struct Args {
    /// Host program command line.
    #[arg(long, default_value = "python3 -u worker.py")]
    host: String,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Seconds a host may stay busy before it is killed; negative disables.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, allow_negative_numbers = true)]
    timeout: i64,

    /// Only send output increments; the page keeps the buffer.
    #[arg(long)]
    shared_output: bool,

    /// Working directory of the host program.
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Extra environment variable for the host program, as KEY=VALUE (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// Custom host command forwarded to the page (repeatable).
    #[arg(long = "forward", value_name = "NAME")]
    forwarded_commands: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut program = HostProgram::new(CommandBuilder::new(args.host.as_str()));
    if let Some(dir) = &args.working_dir {
        program = program.working_dir(dir);
    }
    for (key, value) in &args.env {
        program = program.env(key, value);
    }
    let output_mode = if args.shared_output {
        OutputMode::Shared
    } else {
        OutputMode::Private
    };
    let config = SessionConfig::default()
        .with_timeout_secs(args.timeout)
        .with_output_mode(output_mode);

    let state = WsState::new(Arc::new(ProcessLauncher::new(program)), config)
        .with_forwarded_commands(args.forwarded_commands);

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(state));

    tracing::info!(host = %args.host, "Server listening on http://{}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Script Worker</title>
    <style>
        body { margin: 0; padding: 16px; background: #1e1e1e; color: #d4d4d4; font-family: monospace; }
        textarea { width: 100%; height: 200px; background: #252526; color: inherit; font-family: inherit; }
        pre { background: #000; min-height: 200px; padding: 8px; white-space: pre-wrap; }
        #status { color: #888; margin-left: 8px; }
        #prompt-row { display: none; }
    </style>
</head>
<body>
    <textarea id="code">name = input("Your name? ")
print("Hello,", name)</textarea>
    <div>
        Breakpoints: <input id="breakpoints" placeholder="3, 5">
        <button id="run">Run</button>
        <button id="stop">Stop</button>
        <button data-dbg="next">Next</button>
        <button data-dbg="step">Step</button>
        <button data-dbg="return">Return</button>
        <button data-dbg="continue">Continue</button>
        <button data-dbg="quit">Quit</button>
        <span id="status">connecting</span>
    </div>
    <pre id="output"></pre>
    <div id="prompt-row">
        <span id="prompt"></span>
        <input id="answer">
        <button id="cancel">Cancel</button>
    </div>
    <script>
        const $ = (id) => document.getElementById(id);
        const ws = new WebSocket(`ws://${location.host}/ws`);
        const send = (msg) => ws.send(JSON.stringify(msg));

        ws.onopen = () => send({ type: 'preload' });
        ws.onclose = () => { $('status').textContent = 'disconnected'; };
        ws.onmessage = (event) => {
            const msg = JSON.parse(event.data);
            switch (msg.type) {
                case 'output':
                    if (msg.update.kind === 'replace') $('output').textContent = msg.update.text;
                    else if (msg.update.kind === 'append') $('output').textContent += msg.update.text;
                    else $('output').textContent = '';
                    break;
                case 'state':
                    $('status').textContent = msg.state.kind;
                    if (msg.state.kind !== 'awaiting_input') $('prompt-row').style.display = 'none';
                    break;
                case 'input_requested':
                    $('prompt').textContent = msg.prompt;
                    $('prompt-row').style.display = 'block';
                    $('answer').value = '';
                    $('answer').focus();
                    break;
                case 'suspended':
                    $('status').textContent = `suspended at line ${msg.line}`;
                    break;
                case 'timed_out':
                    $('status').textContent = 'timed out';
                    break;
                case 'error':
                    console.error(msg.message);
                    break;
            }
        };

        $('run').onclick = () => {
            const breakpoints = $('breakpoints').value.split(',')
                .map((s) => parseInt(s, 10)).filter((n) => n > 0);
            send({ type: 'run', code: $('code').value, breakpoints });
        };
        $('stop').onclick = () => send({ type: 'stop' });
        $('cancel').onclick = () => send({ type: 'cancel' });
        $('answer').onkeydown = (e) => {
            if (e.key === 'Enter') send({ type: 'submit', text: $('answer').value });
        };
        document.querySelectorAll('[data-dbg]').forEach((button) => {
            button.onclick = () => send({ type: 'debug', dbg: button.dataset.dbg });
        });
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_flag_parsing() {
        let args = Args::parse_from(["web-server-demo", "--env", "MPLBACKEND=Agg", "--env", "EMPTY="]);
        assert_eq!(
            args.env,
            vec![
                ("MPLBACKEND".to_string(), "Agg".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
        assert!(parse_env_var("NOVALUE").is_err());
        assert!(parse_env_var("=x").is_err());
    }
}
