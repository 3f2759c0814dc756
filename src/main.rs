use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use mediarig::clock::SystemClock;
use mediarig::config::RecorderConfig;
use mediarig::engine::Engine;
use mediarig::engine::sim::SimEngine;
use mediarig::interrupt::Interrupt;
use mediarig::observability::{LogConfig, init_logging};
use mediarig::pipeline::{Controller, GraphBuilder};
use mediarig::recipes::Recipe;
use mediarig::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "mediarig")]
#[command(about = "Segment-boundary recording pipelines")]
struct Cli {
    /// Log at debug level with targets
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a recipe and run it until EOS, an error, Ctrl-C or --stop-after
    Run(RunCommand),
    /// Print a recipe's graph as DOT without running it
    Describe(DescribeCommand),
    /// List node kinds the engine can create
    Kinds,
    /// List available recipes
    Recipes,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Recipe overriding the configured one
    #[arg(short, long)]
    recipe: Option<Recipe>,
}

impl ConfigArgs {
    fn load(&self) -> Result<RecorderConfig> {
        let mut config = match &self.config {
            Some(path) => RecorderConfig::load(path)?,
            None => RecorderConfig::default(),
        };
        if let Some(recipe) = self.recipe {
            config.recipe = recipe;
            config.validate()?;
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct RunCommand {
    #[command(flatten)]
    config: ConfigArgs,

    /// Stop gracefully after this many seconds
    #[arg(long)]
    stop_after: Option<u64>,

    /// Print the constructed graph as DOT before starting
    #[arg(long)]
    dot: bool,
}

impl RunCommand {
    fn run(self) -> Result<u8> {
        let mut config = self.config.load()?;
        if let Some(secs) = self.stop_after {
            config.run.stop_after_ms = Some(secs.saturating_mul(1000));
            config.validate()?;
        }

        let interrupt = Interrupt::new();
        if let Err(e) = interrupt.listen_for_ctrl_c() {
            tracing::warn!("Ctrl-C will not stop the run gracefully: {}", e);
        }

        let engine = SimEngine::new(Arc::new(SystemClock::new()));
        let spec = config.recipe.spec(&config)?;
        let controller = Controller::assemble(engine, &spec, config.controller_config())?
            .with_interrupt(interrupt);
        if self.dot {
            println!("{}", controller.graph().to_dot());
        }

        let report = controller.run();
        for location in &report.segments {
            tracing::info!("segment {}", location);
        }
        for problem in &report.teardown_errors {
            tracing::warn!("teardown: {}", problem);
        }
        tracing::info!("run finished: {:?}", report.outcome);
        Ok(report.exit_code())
    }
}

#[derive(Args, Debug)]
struct DescribeCommand {
    #[command(flatten)]
    config: ConfigArgs,
}

impl DescribeCommand {
    fn run(self) -> Result<u8> {
        let config = self.config.load()?;
        let engine = SimEngine::new(Arc::new(SystemClock::new()));
        let spec = config.recipe.spec(&config)?;
        let mut graph = GraphBuilder::new(engine).build(&spec)?;
        println!("{}", graph.to_dot());
        graph.destroy()?;
        Ok(0)
    }
}

fn list_kinds() -> u8 {
    let engine = SimEngine::new(Arc::new(SystemClock::new()));
    for kind in engine.catalog().list() {
        println!("{:<16} {:<8} {}", kind.name, kind.category.to_string(), kind.description);
    }
    0
}

fn list_recipes() -> u8 {
    for recipe in Recipe::ALL {
        let eos = match recipe.default_eos_target() {
            mediarig::pipeline::EosInjection::Pipeline => "pipeline".to_string(),
            mediarig::pipeline::EosInjection::Node(node) => node,
        };
        println!("{:<20} eos -> {}", recipe.as_str(), eos);
    }
    0
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log);

    let result = match cli.command {
        Command::Run(cmd) => cmd.run(),
        Command::Describe(cmd) => cmd.run(),
        Command::Kinds => Ok(list_kinds()),
        Command::Recipes => Ok(list_recipes()),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            report(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn report(e: &Error) {
    if e.is_construction() {
        tracing::error!("cannot construct pipeline: {}", e);
    } else {
        tracing::error!("{}", e);
    }
}
