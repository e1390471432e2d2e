//! In-container control helper: reads a Task on one descriptor, runs the
//! supervision loop, and reports the GroupResult on another.

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about = "Invoker control helper")]
struct Args {
    /// Descriptor the serialized task is read from
    #[arg(long)]
    task_fd: i32,

    /// Descriptor the serialized group result is written to
    #[arg(long)]
    result_fd: i32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    invoker::ctl::run_from_fds(args.task_fd, args.result_fd)
}
