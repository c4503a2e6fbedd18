use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use toki::config::Config;
use toki::error::TokiError;

#[derive(Parser)]
#[command(
    name = "toki",
    about = "Talk with your tutor",
    long_about = "Toki is a live voice tutoring client. It streams your microphone to a \
        tutoring endpoint over a WebSocket, notices when you have finished \
        speaking, plays the tutor's spoken replies back as they stream in, and \
        reads the tutor's answer aloud locally when its audio is late."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/toki/config.yaml if not specified.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the toki crate, showing connection,
    /// turn detection, playback and fallback speech decisions.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live tutoring session (foreground)
    ///
    /// Connects to the configured endpoint and, once the tutor is ready,
    /// streams the microphone. Lines typed on stdin are sent as text turns;
    /// /toggle connects or disconnects, /status shows the session state and
    /// /quit exits. Runs until /quit or Ctrl+C.
    Live {
        /// Override the tutoring endpoint (ws:// or wss://)
        #[arg(long)]
        url: Option<String>,

        /// Override the learner's grade level
        #[arg(long)]
        grade: Option<u32>,

        /// Subject to focus on (repeatable; replaces configured subjects)
        #[arg(long = "subject")]
        subjects: Vec<String>,
    },

    /// List available audio devices
    ///
    /// Shows all capture and playback devices recognized by the system,
    /// marking the defaults. Put a name in audio.input_device or
    /// audio.output_device to use a specific one.
    Devices,

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config, TokiError> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    Config::load(&path)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("toki=debug,info")
    } else {
        EnvFilter::new("toki=info,warn")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), TokiError> {
    match cli.command {
        Command::Devices => run_devices(),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "toki", &mut std::io::stdout());
            Ok(())
        }
        Command::Live {
            ref url,
            grade,
            ref subjects,
        } => {
            let mut config = load_config(&cli)?;
            if let Some(url) = url {
                config.server.url.clone_from(url);
            }
            if let Some(grade) = grade {
                config.learner.grade_level = grade;
            }
            if !subjects.is_empty() {
                config.learner.subjects.clone_from(subjects);
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(toki::live::run_live(config))
        }
    }
}

fn print_device_list(devices: &[String], default_name: Option<&str>) {
    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
}

fn run_devices() -> Result<(), TokiError> {
    let inputs = toki::audio::capture::list_input_devices()?;
    let outputs = toki::audio::render::list_output_devices()?;

    if inputs.is_empty() {
        println!("No audio input devices found.");
    } else {
        println!("Input devices:");
        print_device_list(
            &inputs,
            toki::audio::capture::default_input_device_name().as_deref(),
        );
    }

    if outputs.is_empty() {
        println!("No audio output devices found.");
    } else {
        println!("Output devices:");
        print_device_list(
            &outputs,
            toki::audio::render::default_output_device_name().as_deref(),
        );
    }

    Ok(())
}
