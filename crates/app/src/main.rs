use std::{
    io::Write as _,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use media_control_core::{
    cycle::build_cycle_graph, format_clock_time, player::build_playback_graph, AppConfig,
    Context, EventSource, Player, PlayerView, PositionSnapshot, SessionEnd, SourceCycler,
    StreamCatalog,
};
use tracing_subscriber::EnvFilter;
use url::Url;

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let result = match cli.command {
        None => run_play(None, None),
        Some(Commands::Play { uri, config }) => run_play(uri.as_deref(), config.as_deref()),
        Some(Commands::Cycle {
            interval_ms,
            swaps,
            config,
        }) => run_cycle(interval_ms, swaps, config.as_deref()),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "unable to start");
            ExitCode::FAILURE
        }
    }
}

fn run_play(uri: Option<&str>, config: Option<&Path>) -> media_control_core::Result<ExitCode> {
    let config = load_config(config)?;
    let uri = resolve_uri(uri, &config.playback.default_uri);
    tracing::info!(%uri, "starting playback");

    let mut ctx = Context::new("playbin");
    build_playback_graph(ctx.graph(), &uri, &config.resolver)?;
    let mut player = Player::new(ctx.graph(), config.playback.seek.clone(), ConsoleView);
    player.start(ctx.graph())?;
    ctx.add_timer(config.playback.poll_interval());

    let summary = ctx.run(&mut player);
    println!();
    tracing::debug!(events = summary.events, ticks = summary.ticks, "session finished");
    ctx.teardown();

    Ok(match player.ended() {
        Some(SessionEnd::StreamError) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn run_cycle(
    interval_ms: Option<u64>,
    swaps: Option<u32>,
    config: Option<&Path>,
) -> media_control_core::Result<ExitCode> {
    let mut config = load_config(config)?;
    if let Some(interval_ms) = interval_ms {
        config.cycle.interval_ms = interval_ms;
    }
    tracing::info!(interval_ms = config.cycle.interval_ms, "starting source cycling");

    let mut ctx = Context::new("pipeline");
    let sink = build_cycle_graph(ctx.graph(), &config.cycle)?;
    let mut cycler = SourceCycler::new(ctx.graph(), sink, &config.cycle);
    if let Some(swaps) = swaps {
        cycler = cycler.with_limit(swaps);
    }
    cycler.start(ctx.graph())?;
    ctx.add_timer(config.cycle.interval());

    ctx.run(&mut cycler);
    tracing::info!(swaps = cycler.swaps(), "source cycling finished");
    ctx.teardown();
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&Path>) -> media_control_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_json_file(path),
        None => Ok(AppConfig::default()),
    }
}

/// Falls back to `default` when the argument is missing or not a URI.
fn resolve_uri(arg: Option<&str>, default: &str) -> String {
    match arg.map(Url::parse) {
        Some(Ok(url)) => url.to_string(),
        Some(Err(err)) => {
            tracing::warn!(%err, uri = arg, "malformed URI, playing the default instead");
            default.to_string()
        }
        None => {
            tracing::warn!(default, "no URI given, playing the default");
            default.to_string()
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Prints the position line in place and the stream list when it changes.
struct ConsoleView;

impl PlayerView for ConsoleView {
    fn refresh(&mut self, snapshot: &PositionSnapshot) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(
            stdout,
            "Position {} / {}\r",
            format_clock_time(snapshot.position),
            format_clock_time(snapshot.duration)
        );
        let _ = stdout.flush();
    }

    fn streams_changed(&mut self, catalog: &StreamCatalog) {
        println!("\n{}", catalog.describe());
    }

    fn stream_error(&mut self, source: &EventSource, message: &str, debug_info: Option<&str>) {
        eprintln!("Error received from element {source}: {message}");
        eprintln!("Debugging information: {}", debug_info.unwrap_or("none"));
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives a media graph from a single control thread", long_about = None)]
struct Cli {
    /// Plays the default URI when no subcommand is given.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a URI through a decoder and an audio chain.
    Play {
        /// Media resource to play. Falls back to the configured default.
        uri: Option<String>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Replace a live test source at a fixed interval while playing.
    Cycle {
        /// Milliseconds between source swaps.
        #[arg(short, long)]
        interval_ms: Option<u64>,
        /// Stop after this many swaps.
        #[arg(short, long)]
        swaps: Option<u32>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: &str = "https://example.org/default.webm";

    #[test]
    fn well_formed_uris_are_kept() {
        assert_eq!(
            resolve_uri(Some("file:///media/clip.webm"), DEFAULT),
            "file:///media/clip.webm"
        );
    }

    #[test]
    fn missing_or_malformed_uris_fall_back_to_the_default() {
        assert_eq!(resolve_uri(None, DEFAULT), DEFAULT);
        assert_eq!(resolve_uri(Some("not a uri"), DEFAULT), DEFAULT);
    }

    #[test]
    fn cli_parses_both_subcommands() {
        let cli = Cli::parse_from(["media-control-app", "play", "file:///a.webm"]);
        assert!(matches!(cli.command, Some(Commands::Play { uri: Some(_), .. })));
        let cli = Cli::parse_from(["media-control-app", "cycle", "--interval-ms", "250", "-s", "3"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Cycle {
                interval_ms: Some(250),
                swaps: Some(3),
                ..
            })
        ));
    }

    #[test]
    fn bare_invocation_falls_back_to_playback() {
        let cli = Cli::try_parse_from(["media-control-app"]).unwrap();
        assert!(cli.command.is_none());
    }
}
