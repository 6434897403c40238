use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use porteiro_core::{HttpApiClient, IntercomApi};

/// Fetches a standby messaging bundle (and optionally a call's status) from the intercom backend.
#[derive(Parser, Debug)]
#[command(version, about = "Intercom backend standby probe", long_about = None)]
struct Args {
    /// Resident user id to request a standby token for
    uid: String,

    /// API base URL; defaults to the platform default
    #[arg(long, env = "PORTEIRO_API_BASE_URL")]
    api: Option<String>,

    /// Also look up this call's status
    #[arg(long)]
    call: Option<String>,

    /// Bearer token of the signed-in user
    #[arg(long, env = "PORTEIRO_ACCESS_TOKEN")]
    token: Option<String>,
}

fn main() -> anyhow::Result<()> {
    porteiro_core::init_logging();
    let args = Args::parse();

    let base_url = porteiro_endpoints::resolve_api_base_url(
        args.api.as_deref(),
        None,
        porteiro_endpoints::current_platform(),
    );
    let api = HttpApiClient::new();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let started = Instant::now();
        let bundle = api
            .standby_bundle(&base_url, &args.uid, args.token.as_deref())
            .await
            .context("standby token request failed")?;
        tracing::info!(
            base_url = %base_url,
            uid = %bundle.uid,
            app_id = bundle.app_id.as_deref().unwrap_or("-"),
            expires_at = ?bundle.expires_at,
            ttl_seconds = ?bundle.ttl_seconds,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "standby bundle ok"
        );

        if let Some(call_id) = args.call.as_deref() {
            let report = api
                .call_status(&base_url, call_id)
                .await
                .with_context(|| format!("call status lookup for {call_id} failed"))?;
            tracing::info!(
                call_id,
                status = report.status().unwrap_or("unknown"),
                resumable = report.is_resumable(),
                finished = report.is_finished(),
                participants = report.participants.len(),
                "call status"
            );
        }
        Ok(())
    })
}
