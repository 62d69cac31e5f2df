mod analysis;
mod auth;
mod calc;
mod config;
mod db;
mod ipc;
mod logging;
mod model;
mod reconcile;
mod sheet;
mod store;

use clap::Parser;
use std::io::{self, BufRead, Write};

fn main() {
    let args = config::CliArgs::parse();
    logging::init_logging(args.log_format);

    let ai: Option<Box<dyn analysis::GenerativeModel>> =
        match analysis::GeminiClient::from_settings(&args.ai_settings()) {
            Ok(Some(client)) => {
                tracing::info!(model = %args.ai_model, "AI analysis enabled");
                Some(Box::new(client))
            }
            Ok(None) => {
                tracing::info!("no AI API key configured; analysis methods disabled");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "AI client could not be built; analysis methods disabled");
                None
            }
        };

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        ai,
    };

    if let Some(path) = args.workspace.as_ref() {
        match db::open_db(path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "workspace opened");
                state.workspace = Some(path.clone());
                state.db = Some(conn);
            }
            Err(e) => tracing::warn!(workspace = %path.display(), error = %e, "workspace open failed"),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer with.
                tracing::warn!(error = %e, "unparsable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
