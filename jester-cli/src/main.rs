mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "jester")]
#[command(about = "Run untrusted Python fragments in a governed sandbox")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.config/jester/config.toml)
    #[arg(long, global = true, env = "JESTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the code comes from: an argument, `--file`, or stdin when neither is given
#[derive(Args, Debug, Clone)]
pub struct CodeSource {
    /// Inline code
    pub code: Option<String>,

    /// Read code from a file
    #[arg(short, long, conflicts_with = "code")]
    pub file: Option<PathBuf>,
}

/// Output switches shared by every subcommand that runs code
#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,

    /// Print engine statistics afterwards
    #[arg(long)]
    pub stats: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute code once
    Run {
        #[command(flatten)]
        source: CodeSource,

        #[command(flatten)]
        output: OutputArgs,

        /// Wall-clock limit in milliseconds
        #[arg(long)]
        wall_ms: Option<u64>,

        /// Memory limit in MiB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Allow an extra module (repeatable)
        #[arg(long = "allow-import")]
        allow_imports: Vec<String>,

        /// Permit network modules
        #[arg(long)]
        network: bool,

        /// Ask for the minimal strategy (honoured only outside restricted mode)
        #[arg(long)]
        minimal: bool,

        /// Client key used for rate limiting and auditing
        #[arg(long, default_value = "cli")]
        client: String,
    },
    /// Race variants of the code and report the fastest correct one
    Race {
        #[command(flatten)]
        source: CodeSource,

        #[command(flatten)]
        output: OutputArgs,

        /// Number of variants to race (2-5)
        #[arg(short = 'n', long, default_value_t = 3)]
        variants: usize,

        /// Candidate implementation file (repeatable); rewrites of the code are used when absent
        #[arg(long = "variant")]
        variant_files: Vec<PathBuf>,

        /// Expected stdout; variants printing anything else cannot win
        #[arg(long)]
        expect: Option<String>,

        /// What the code is meant to do
        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "cli")]
        client: String,
    },
    /// Check code against the security policy without running it
    Validate {
        #[command(flatten)]
        source: CodeSource,

        /// Permit network modules
        #[arg(long)]
        network: bool,

        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = commands::init_tracing(cli.verbose, cli.log_file.as_deref())?;
    let config_path = commands::config_path(cli.config)?;

    let succeeded = match cli.command {
        Commands::Run {
            source,
            output,
            wall_ms,
            memory_mb,
            allow_imports,
            network,
            minimal,
            client,
        } => {
            let options = commands::RunOptions {
                wall_ms,
                memory_mb,
                allow_imports,
                network,
                minimal,
                client,
            };
            commands::run(&config_path, &source, &output, options).await?
        }
        Commands::Race {
            source,
            output,
            variants,
            variant_files,
            expect,
            description,
            client,
        } => {
            let options = commands::RaceOptions {
                variants,
                variant_files,
                expect,
                description,
                client,
            };
            commands::race(&config_path, &source, &output, options).await?
        }
        Commands::Validate {
            source,
            network,
            json,
        } => commands::validate(&config_path, &source, network, json).await?,
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => commands::config_show(&config_path)?,
                ConfigAction::Path => println!("{}", config_path.display()),
                ConfigAction::Init { force } => commands::config_init(&config_path, force)?,
            }
            true
        }
    };

    // _guard drops on return and flushes the log file
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
