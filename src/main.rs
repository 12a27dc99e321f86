mod events;
mod game;
mod locks;
mod maze;
mod raycast;
mod robot;
mod runner;
mod scripting;
mod world;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::game::Outcome;
use crate::maze::Maze;
use crate::runner::{run, Program, RunOptions, RunRequest};

/// Maze baked in at build time via `MAZEBOT_EMBED_MAZE_PATH`; `{}` when the
/// build embedded nothing.
const EMBEDDED_MAZE: &str = include_str!(concat!(env!("OUT_DIR"), "/mazebot_embedded_maze.json"));

struct CliArgs {
    maze_path: Option<PathBuf>,
    script_paths: Vec<PathBuf>,
    timeout: Option<Duration>,
}

fn parse_args() -> Result<CliArgs> {
    let mut maze_path = None;
    let mut script_paths = Vec::new();
    let mut timeout = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--maze" => {
                let value = args.next().context("--maze needs a file path")?;
                maze_path = Some(PathBuf::from(value));
            }
            "--timeout-secs" => {
                let value = args.next().context("--timeout-secs needs a number")?;
                let secs: u64 = value.parse().context("--timeout-secs must be an integer")?;
                timeout = Some(Duration::from_secs(secs));
            }
            "--help" | "-h" => {
                println!("usage: mazebot [--maze MAZE.json] [--timeout-secs N] SCRIPT.rhai ...");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown flag `{other}`"),
            script => script_paths.push(PathBuf::from(script)),
        }
    }
    Ok(CliArgs {
        maze_path,
        script_paths,
        timeout,
    })
}

fn load_maze(path: Option<&PathBuf>) -> Result<Maze> {
    if let Some(path) = path {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read maze file {}", path.display()))?;
        return Maze::from_json(&contents).context("invalid maze file");
    }
    if EMBEDDED_MAZE.trim() != "{}" {
        info!("using the maze embedded at build time");
        return Maze::from_json(EMBEDDED_MAZE).context("invalid embedded maze");
    }
    info!("no maze given, using the built-in demo maze");
    Ok(Maze::test_maze())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let maze = load_maze(args.maze_path.as_ref())?;

    // Scripts pair with robots in maze declaration order.
    if args.script_paths.len() > maze.robots.len() {
        bail!(
            "{} scripts given but the maze declares only {} robots",
            args.script_paths.len(),
            maze.robots.len()
        );
    }
    let mut programs = Vec::new();
    for (path, robot) in args.script_paths.iter().zip(&maze.robots) {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("could not read script {}", path.display()))?;
        programs.push(Program {
            robot: robot.name.clone(),
            source,
        });
    }

    let report = run(
        RunRequest { maze, programs },
        RunOptions {
            interactive: true,
            timeout: args.timeout,
            ..RunOptions::default()
        },
    )
    .await?;

    for error in &report.script_errors {
        eprintln!(
            "[script error] {}: {}",
            error.script_name, error.error_message
        );
    }
    match report.outcome {
        Some(Outcome::Won(message)) => {
            println!("WIN: {message}");
        }
        Some(Outcome::Failed(message)) => {
            println!("LOSE: {message}");
            std::process::exit(1);
        }
        None => {
            println!("Run ended without a decision.");
        }
    }
    Ok(())
}
