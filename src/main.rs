use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use quickjs_sandbox::{HostDocument, Sandbox, SandboxConfig, SandboxOptions};
use tracing_subscriber::EnvFilter;

const DEFAULT_RUN_MS: u64 = 250;

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let mut args = std::env::args().skip(1);
    let Some(script) = args.next() else {
        bail!("usage: sandbox-run <script.js> [run-ms]");
    };
    let run_ms = match args.next() {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid run-ms {raw:?}"))?,
        None => DEFAULT_RUN_MS,
    };

    let source = std::fs::read_to_string(&script)
        .with_context(|| format!("failed to read {script}"))?;
    let config_path = std::env::var("SANDBOX_CONFIG").ok().map(PathBuf::from);
    let config = SandboxConfig::load(config_path).context("failed to load sandbox config")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let html = rt.block_on(async {
        let document = HostDocument::shared();
        let container = document.borrow().body();
        let mut sandbox = Sandbox::create(
            document,
            container,
            &source,
            SandboxOptions::from_config(&config),
        )?;
        let ran = sandbox.run_for(Duration::from_millis(run_ms)).await?;
        tracing::info!(
            timers = ran,
            tracked = sandbox.tracked_node_count(),
            violations = sandbox.violations().count(),
            "sandbox finished"
        );
        let html = sandbox.document().borrow().to_html()?;
        sandbox.dispose();
        Ok::<_, anyhow::Error>(html)
    })?;

    println!("{html}");
    Ok(())
}
