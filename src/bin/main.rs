use anyhow::{bail, Context};
use clap::Parser;
use eoka_pilot::protocol::{CdpClient, EokaClient, LaunchConfig, ProtocolClient};
use eoka_pilot::relay::{LocalConnector, RelayConfig};
use eoka_pilot::{
    DirectoryStore, Orchestrator, Reply, Runner, Script, Settings, Variables, WorkerHost,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "eoka-pilot")]
#[command(about = "Run recorded browser automation scripts")]
#[command(version)]
struct Cli {
    /// Script file to run (JSON or YAML)
    script: PathBuf,

    /// Set a parameter (can be used multiple times)
    #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Attach to a running browser (ws:// URL or http://host:port)
    #[arg(long)]
    endpoint: Option<String>,

    /// Target id to run against (with --endpoint; defaults to the first page)
    #[arg(long, requires = "endpoint")]
    target: Option<String>,

    /// Launch the browser headless
    #[arg(long, conflicts_with = "endpoint")]
    headless: bool,

    /// Settings file (YAML)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Detach from the tab when the script finishes
    #[arg(long)]
    detach: bool,

    /// Validate the script without running
    #[arg(long)]
    check: bool,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let params = Variables::from_args(&cli.params)?;
    let script = Script::load(&cli.script)
        .with_context(|| format!("loading {}", cli.script.display()))?;

    if cli.check {
        println!("Script valid: {}", script.title);
        println!("  Id: {}", script.id);
        println!("  Steps: {} ({} total)", script.steps.len(), script.step_count());
        if !script.parameters.is_empty() {
            println!("  Parameters:");
            for (name, value) in script.parameters.iter() {
                println!("    - {} = {}", name, value);
            }
        }
        return Ok(());
    }

    let settings = match &cli.settings {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings {}", path.display()))?,
        None => Settings::default(),
    };

    let mut launched = None;
    let (client, target): (Arc<dyn ProtocolClient>, String) = match &cli.endpoint {
        Some(endpoint) => {
            let client = CdpClient::connect(endpoint).await?;
            let target = match &cli.target {
                Some(target) => target.clone(),
                None => match client.page_targets().await?.into_iter().next() {
                    Some(page) => page.target_id,
                    None => bail!("no page targets at {}", endpoint),
                },
            };
            (Arc::new(client) as Arc<dyn ProtocolClient>, target)
        }
        None => {
            let config = LaunchConfig {
                headless: cli.headless,
                ..LaunchConfig::default()
            };
            let client = Arc::new(EokaClient::launch(&config).await?);
            let target = client.initial_target().await?;
            launched = Some(client.clone());
            (client as Arc<dyn ProtocolClient>, target)
        }
    };

    let store_root = cli
        .script
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let relay_config = RelayConfig::from(&settings.relay);
    let runner = Arc::new(Runner::new(client, settings));
    let host = WorkerHost::new(runner, Arc::new(DirectoryStore::new(store_root)))
        .with_default_target(target.clone());
    let orchestrator = Orchestrator::spawn(
        Arc::new(LocalConnector::new(Arc::new(host))),
        relay_config,
    );
    let port = orchestrator.open_port();

    println!("Running: {}", script.title);

    let send = port.send(eoka_pilot::Command::RunScript {
        script_id: script.id.clone(),
        parameters: params,
        target: Some(target),
        detach: cli.detach,
    });
    tokio::pin!(send);
    let reply = loop {
        tokio::select! {
            reply = &mut send => break reply,
            Some(note) = port.next_notification() => {
                if !cli.quiet {
                    println!("  [{}] {}", note.event.path, note.event.kind);
                }
            }
        }
    };

    let success = match reply {
        Ok(Reply::Execution(result)) => {
            println!();
            if result.success {
                println!("✓ Success");
            } else {
                println!("✗ Failed ({})", result.code);
                if let Some(ref error) = result.error {
                    println!("  Error: {}", error);
                }
                if let Some(ref path) = result.step_path {
                    println!("  Step: {}", path);
                }
            }
            println!("  Steps: {}", result.steps_executed);
            println!("  Duration: {}ms", result.duration_ms);
            result.success
        }
        Ok(Reply::Failed { code, error }) => {
            println!("✗ Failed ({}): {}", code, error);
            false
        }
        Ok(other) => {
            println!("✗ Unexpected reply: {:?}", other);
            false
        }
        Err(e) => {
            println!("✗ Failed ({}): {}", e.code(), e);
            false
        }
    };

    orchestrator.shutdown();
    if let Some(client) = launched {
        client.close().await?;
    }

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
