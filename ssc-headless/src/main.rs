// ssc-headless: one ipc:// request per stdin line, one response per stdout line.
//
// Input:  `<uri>` or `<uri>\t<hex body>`
// Output: `<seq>\t<json>`, where json is the envelope, the script as a JSON string,
//         or `{"id","headers","body"}` (body hex encoded) for a post.

mod config;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use ssc_core::{Callback, Core, CoreError, Envelope, Request, Response};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("ssc-headless {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load().context("failed to load config")?;
    let core = Core::new(cfg).context("failed to start core")?;
    let out: Callback = Arc::new(|response: Response| {
        let mut stdout = std::io::stdout().lock();
        if writeln!(stdout, "{}", format_response(&response))
            .and_then(|_| stdout.flush())
            .is_err()
        {
            warn!(seq = %response.seq(), "stdout closed; response dropped");
        }
    });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let signal = shutdown_signal();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => handle_line(&core, &line, out.clone()),
                    None => break,
                },
                res = &mut signal => {
                    res?;
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    })?;

    core.shutdown().context("core did not shut down cleanly")?;
    Ok(())
}

/// Submit one input line. Blank lines are ignored.
fn handle_line(core: &Core, line: &str, out: Callback) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }
    let (uri, body) = match line.split_once('\t') {
        Some((uri, body)) => (uri.trim(), Some(body.trim())),
        None => (line.trim(), None),
    };
    let body = match body.map(hex::decode).transpose() {
        Ok(body) => body,
        Err(e) => {
            let seq = Request::parse(uri).map(|r| r.seq).unwrap_or_default();
            let err = CoreError::invalid_arg(format!("request body is not valid hex: {e}"));
            out(Response::Envelope {
                seq,
                envelope: Envelope::error("ipc", None, &err),
            });
            return;
        }
    };
    core.invoke_uri(uri, body, out);
}

fn format_response(response: &Response) -> String {
    let payload = match response {
        Response::Envelope { envelope, .. } => envelope.to_json(),
        Response::Script { script, .. } => json!(script).to_string(),
        Response::Post { post, .. } => json!({
            "id": post.id.to_string(),
            "headers": post.headers,
            "body": hex::encode(post.body.as_deref().unwrap_or_default()),
        })
        .to_string(),
    };
    format!("{}\t{}", response.seq(), payload)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
