use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use portbridge::{
    attach::PortAttacher,
    config::{AttachOptions, ConfigManager, EnvConfigManager, write_options_schema},
    constants::LogLevel,
    demo::run_demo,
    logger::init_tracing,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "portbridge",
    about = "Bind host handlers to the ports of a UI runtime",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the storage example against an in-memory runtime
    Demo(DemoArgs),

    /// Emit the JSON-Schema of the attach options
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Tracing filter (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Port logging verbosity: NONE, ERRORS, RESULT or DEBUG. Overrides PORTS_LOGGING
    #[arg(long)]
    logging: Option<LogLevel>,

    /// `.env` file with PORTS_* settings
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Write logs to this file (rotated daily) instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Directory the schema is written to
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo(args) => demo(args).await,
        Commands::Schema(args) => {
            let path = write_options_schema(&args.out)?;
            println!("Schema written to {}", path.display());
            Ok(())
        }
    }
}

async fn demo(args: DemoArgs) -> anyhow::Result<()> {
    let sink = init_tracing(&args.log_level, args.log_file, args.json)?;

    let config = ConfigManager(EnvConfigManager::new(args.env_file));
    let mut options = AttachOptions::load(&config).await?;
    if let Some(level) = args.logging {
        options.logging = level;
    }
    info!(?options, "running storage demo");

    let report = run_demo(&PortAttacher::new(Box::new(sink)), options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
