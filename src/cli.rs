/// Command-line interface to the invoker
use crate::config::ContainerConfig;
use crate::container::Container;
use crate::task::{AccessMode, OwnerId, StreamBinding};
use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};

/// Exit code for command-line parse failures
pub const EXIT_USAGE: i32 = 200;
/// Exit code for any other failure
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one executable inside an isolated process group")]
pub struct Cli {
    /// Configuration file; INVOKER_CONFIG is consulted when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executable to run, as a path inside the container
    #[arg(short, long, required = true)]
    executable: PathBuf,

    /// CPU time limit in nanoseconds
    #[arg(short, long)]
    time_limit: Option<u64>,

    /// Memory limit in bytes
    #[arg(short, long)]
    memory_limit: Option<u64>,

    /// Output limit in bytes
    #[arg(short, long)]
    output_limit: Option<u64>,

    /// Real time limit in milliseconds
    #[arg(short = 'l', long)]
    real_time_limit: Option<u64>,

    /// File for stdin
    #[arg(long, default_value = "/dev/null")]
    stdin: PathBuf,

    /// File for stdout
    #[arg(long, default_value = "/dev/null")]
    stdout: PathBuf,

    /// File for stderr
    #[arg(long, default_value = "/dev/null")]
    stderr: PathBuf,

    /// Arguments passed to the executable
    #[arg(short = 'a', long = "argument", value_name = "ARG", allow_hyphen_values = true)]
    arguments: Vec<String>,

    /// Trailing arguments, appended after --argument values
    #[arg(trailing_var_arg = true)]
    tail: Vec<String>,
}

fn is_dev_null(path: &Path) -> bool {
    path == Path::new("/dev/null")
}

fn execute(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ContainerConfig::load(path)?,
        None => ContainerConfig::from_environment()?,
    };

    let mut process_limits = config
        .group_default_settings
        .process_default_settings
        .resource_limits;
    if cli.time_limit.is_some() {
        process_limits.time_limit_ns = cli.time_limit;
    }
    if cli.memory_limit.is_some() {
        process_limits.memory_limit_bytes = cli.memory_limit;
    }
    if cli.output_limit.is_some() {
        process_limits.output_limit_bytes = cli.output_limit;
    }

    let mut group_limits = config.group_default_settings.resource_limits;
    if cli.real_time_limit.is_some() {
        group_limits.real_time_limit_ms = cli.real_time_limit;
    }

    log::info!(
        "executing {} with limits {:?}",
        cli.executable.display(),
        process_limits
    );

    let container = Container::create(config)?;
    let group = container.create_process_group();
    group.set_resource_limits(group_limits)?;

    let process = group.create_process(&cli.executable)?;
    let mut arguments = vec![cli.executable.to_string_lossy().into_owned()];
    arguments.extend(cli.arguments.iter().cloned());
    arguments.extend(cli.tail.iter().cloned());
    process.set_arguments(arguments)?;
    process.set_resource_limits(process_limits)?;

    if !is_dev_null(&cli.stdin) {
        container.filesystem().push(
            &cli.stdin,
            Path::new("/stdin"),
            OwnerId { uid: 0, gid: 0 },
            0o400,
        )?;
        process.set_stream(
            0,
            StreamBinding::File {
                path: PathBuf::from("/stdin"),
                access_mode: AccessMode::ReadOnly,
            },
        )?;
    }
    if !is_dev_null(&cli.stdout) {
        process.set_stream(
            1,
            StreamBinding::File {
                path: PathBuf::from("/stdout"),
                access_mode: AccessMode::WriteOnly,
            },
        )?;
    }
    if !is_dev_null(&cli.stderr) {
        process.set_stream(
            2,
            StreamBinding::File {
                path: PathBuf::from("/stderr"),
                access_mode: AccessMode::WriteOnly,
            },
        )?;
    }

    let group_result = group.synchronized_call()?;
    let process_result = process.result()?;
    log::info!("process group has terminated");

    println!("Process group result:");
    println!("{}", serde_json::to_string_pretty(&group_result)?);
    println!("Process result:");
    println!("{}", serde_json::to_string_pretty(&process_result)?);

    if !is_dev_null(&cli.stdout) {
        container
            .filesystem()
            .pull(Path::new("/stdout"), &cli.stdout)?;
    }
    if !is_dev_null(&cli.stderr) {
        container
            .filesystem()
            .pull(Path::new("/stderr"), &cli.stderr)?;
    }

    Ok(())
}

/// Parse arguments and run. Returns the process exit code:
/// 0 on success, 200 on an option-parse error, 1 on anything else.
pub fn run() -> i32 {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return EXIT_USAGE;
        }
    };

    match execute(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    }
}
