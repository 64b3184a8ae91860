//! Command-line front end for the drum sequencer.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use drumseq_core::presets::PRESETS;
use drumseq_core::{
    DrumTrackManager, Engine, ExportData, FileStore, RingTrigger, SequencerError, Session,
    SyncGroupId, TokioClock, TriggerCommand, load_export, save_export, save_export_binary,
};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "drumseq")]
#[command(version, about = "Grid-based drum step sequencer", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Track to work on
    #[arg(short, long, global = true, default_value = "drums")]
    track: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a track in real time and print the triggers it fires
    Play(PlayArgs),

    /// Print compiled statistics for a track
    Stats {
        #[arg(short, long)]
        preset: Option<String>,

        #[arg(long)]
        project: Option<PathBuf>,

        #[arg(short, long)]
        bars: Option<usize>,
    },

    /// Write an export bundle
    Export {
        path: PathBuf,

        #[arg(short, long)]
        preset: Option<String>,

        /// MessagePack instead of JSON
        #[arg(long)]
        binary: bool,
    },

    /// Read an export bundle and summarize it
    Import { path: PathBuf },

    /// Save a track snapshot to the snapshot store
    Save {
        #[arg(short, long)]
        preset: Option<String>,
    },

    /// Load a track snapshot from the snapshot store
    Load,

    /// Show the built-in beats
    Presets,

    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args)]
struct PlayArgs {
    /// Start from a built-in beat
    #[arg(short, long)]
    preset: Option<String>,

    /// Load tracks from an export bundle first
    #[arg(long)]
    project: Option<PathBuf>,

    /// Bars to compile (default from config)
    #[arg(short, long)]
    bars: Option<usize>,

    /// Tempo for every sync group
    #[arg(long)]
    tempo: Option<f64>,

    /// How long to play, in seconds
    #[arg(short, long, default_value_t = 4.0)]
    seconds: f64,

    /// Wrap around at the end of the timeline
    #[arg(long = "loop", action = ArgAction::Set)]
    looping: Option<bool>,

    /// Click on every beat
    #[arg(short, long)]
    metronome: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn read_bundle(path: Option<&Path>) -> anyhow::Result<Option<ExportData>> {
    path.map(|path| load_export(path).with_context(|| format!("reading {}", path.display())))
        .transpose()
}

/// Make sure `track` exists: from the bundle, a preset or a blank grid.
fn prepare_manager(
    manager: &mut DrumTrackManager,
    track: &str,
    preset: Option<&str>,
    bundle: Option<&ExportData>,
) -> Result<(), SequencerError> {
    if let Some(bundle) = bundle {
        manager.import_data(bundle)?;
    }
    if manager.track(track).is_ok() {
        return Ok(());
    }
    match preset {
        Some(preset) => manager.create_track_from_preset(track, preset)?,
        None => manager.create_track(track)?,
    };
    Ok(())
}

fn print_trigger(command: &TriggerCommand, at: Duration) {
    let at = at.as_secs_f64();
    match command {
        TriggerCommand::NoteOn {
            pitch,
            velocity,
            track_id,
        } => println!("{at:7.3}s  note  {pitch:3}  vel {velocity:.2}  [{track_id}]"),
        TriggerCommand::Metronome { accent } => {
            println!("{at:7.3}s  click {}", if *accent { "ACCENT" } else { "" })
        }
    }
}

async fn play(config: AppConfig, track: &str, args: PlayArgs) -> anyhow::Result<()> {
    let bundle = read_bundle(args.project.as_deref())?;
    let mut settings = config.sequencer;
    if let Some(looping) = args.looping {
        settings.loop_enabled = looping;
    }
    settings.metronome_enabled |= args.metronome;

    let (trigger, mut triggers) = RingTrigger::new(settings.trigger_ring_capacity.max(1));
    let engine = Engine::new(Arc::new(TokioClock::new()), Arc::new(trigger));
    let mut session = Session::new(engine, settings);

    session.edit(|m| prepare_manager(m, track, args.preset.as_deref(), bundle.as_ref()))?;
    if let Some(tempo) = args.tempo {
        session.edit(|m| {
            for group in SyncGroupId::ALL {
                m.update_sync_group_tempo(track, group, tempo)?;
            }
            Ok(())
        })?;
    }

    session.start_playback(track, args.bars, None).await?;
    let started = tokio::time::Instant::now();
    let deadline = started + Duration::from_secs_f64(args.seconds.max(0.0));

    let mut poll = tokio::time::interval(Duration::from_millis(16));
    while tokio::time::Instant::now() < deadline {
        poll.tick().await;
        while let Ok(command) = triggers.pop() {
            print_trigger(&command, started.elapsed());
        }
        if !session.playback_state(track).is_playing() {
            break;
        }
    }

    session.dispose();
    while let Ok(command) = triggers.pop() {
        print_trigger(&command, started.elapsed());
    }
    Ok(())
}

fn print_stats(manager: &mut DrumTrackManager, track: &str, bars: Option<usize>) -> anyhow::Result<()> {
    let stats = manager.get_combined_stats(track, bars)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for (group, group_stats) in manager.get_sync_group_stats(track)? {
        println!(
            "  {group}: {} ({} cells)",
            group_stats.name, group_stats.cell_count
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = AppConfig::load();
    let track = cli.track.as_str();

    match cli.command {
        Commands::Play(args) => play(config, track, args).await?,
        Commands::Stats {
            preset,
            project,
            bars,
        } => {
            let bundle = read_bundle(project.as_deref())?;
            let mut manager = DrumTrackManager::new(config.sequencer);
            prepare_manager(&mut manager, track, preset.as_deref(), bundle.as_ref())?;
            print_stats(&mut manager, track, bars)?;
        }
        Commands::Export {
            path,
            preset,
            binary,
        } => {
            let mut manager = DrumTrackManager::new(config.sequencer);
            prepare_manager(&mut manager, track, preset.as_deref(), None)?;
            let bundle = manager.export_data();
            if binary {
                save_export_binary(&path, &bundle)?;
            } else {
                save_export(&path, &bundle)?;
            }
            println!("exported {} tracks to {}", bundle.tracks.len(), path.display());
        }
        Commands::Import { path } => {
            let bundle: ExportData =
                load_export(&path).with_context(|| format!("reading {}", path.display()))?;
            let mut manager = DrumTrackManager::new(config.sequencer);
            let count = manager.import_data(&bundle)?;
            println!("imported {count} tracks (format {})", bundle.version);
            let ids: Vec<String> = manager.tracks().map(|t| t.id().to_string()).collect();
            for id in ids {
                println!("{id}:");
                print_stats(&mut manager, &id, None)?;
            }
        }
        Commands::Save { preset } => {
            let store = FileStore::new(config.store_dir());
            let mut manager = DrumTrackManager::new(config.sequencer);
            prepare_manager(&mut manager, track, preset.as_deref(), None)?;
            manager.save_track(track, &store)?;
            println!("saved {track} to {}", store.root().display());
        }
        Commands::Load => {
            let store = FileStore::new(config.store_dir());
            let mut manager = DrumTrackManager::new(config.sequencer);
            if !manager.load_track(track, &store)? {
                anyhow::bail!("no snapshot for {track} in {}", store.root().display());
            }
            print_stats(&mut manager, track, None)?;
        }
        Commands::Presets => {
            for preset in &PRESETS {
                println!("{:12} {:12} {}", preset.id, preset.name, preset.description);
            }
        }
        Commands::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                let path = config.save()?;
                println!("# written to {}", path.display());
            }
        }
    }

    Ok(())
}
