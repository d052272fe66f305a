//! keyweave daemon
//!
//! Grabs the configured input device and turns gesture presses into macro
//! sequences.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keyweave_config::{compile_profile, CompiledProfile};
use keyweave_daemon::collab::{NoopAudio, NoopSpeech};
use keyweave_daemon::device::{find_device, open_grabbed};
use keyweave_daemon::hook::EvdevHook;
use keyweave_daemon::{
    BindingDispatcher, BufferProfile, KeySink, NullSink, Orchestrator, SequenceExecutor,
    TimingOracle, TrafficController, UinputSink,
};

#[derive(Parser, Debug)]
#[command(name = "keyweaved")]
#[command(about = "Gesture macro daemon")]
struct Args {
    /// Path to the profile file
    #[arg(short, long, default_value = "~/.config/keyweave/profile.json")]
    profile: String,

    /// Name of the input device to grab
    #[arg(short, long)]
    device: Option<String>,

    /// Validate and wire everything but inject nothing
    #[arg(long)]
    dry_run: bool,

    /// Draw inter-step buffers from the humanized oracle ranges
    #[arg(long)]
    humanized: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let profile_path: PathBuf = shellexpand::tilde(&args.profile).into_owned().into();
    info!("Loading profile from {}", profile_path.display());

    let profile = keyweave_config::parse_profile(&profile_path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("profile rejected")?;
    info!(
        "Loaded profile '{}' with {} binding(s)",
        profile.name,
        profile.bindings.len()
    );

    // A failed compilation degrades to the all-safe partition: concurrency
    // coordination is lost but the engine stays live.
    let compiled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        compile_profile(&profile)
    }))
    .unwrap_or_else(|_| {
        error!("profile compilation failed; running without traffic control");
        CompiledProfile::all_safe()
    });
    info!(
        "Compiled profile: {} conundrum key(s), {} safe key(s)",
        compiled.conundrum_keys.len(),
        compiled.safe_keys.len()
    );

    let sink: Arc<dyn KeySink> = if args.dry_run {
        info!("Dry run: keystrokes go nowhere");
        Arc::new(NullSink)
    } else {
        Arc::new(UinputSink::new("keyweave").context("creating virtual keyboard")?)
    };

    let oracle = Arc::new(TimingOracle::new());
    let traffic = Arc::new(TrafficController::new(compiled, Arc::clone(&oracle)));
    let buffers = if args.humanized {
        BufferProfile::humanized()
    } else {
        BufferProfile::tight()
    };
    let executor = SequenceExecutor::new(sink, oracle, traffic)
        .with_collaborators(Arc::new(NoopAudio), Arc::new(NoopSpeech))
        .with_buffers(buffers);

    let dispatcher = Arc::new(BindingDispatcher::new(profile.clone(), executor.clone()));
    let orchestrator = {
        let dispatcher = Arc::clone(&dispatcher);
        Orchestrator::spawn(profile.gesture_timing, move |event| {
            dispatcher.dispatch(event)
        })
    };

    let hook_task = match &args.device {
        Some(name) => {
            let capture = find_device(name)?;
            info!("Grabbing {capture}");
            let device = open_grabbed(&capture)?;
            Some(EvdevHook::new(device).spawn(orchestrator.clone()))
        }
        None => {
            info!("No capture device configured; running without a hook");
            None
        }
    };

    info!("keyweave running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    orchestrator.destroy();
    executor.destroy();
    if let Some(task) = hook_task {
        task.abort();
    }

    Ok(())
}
