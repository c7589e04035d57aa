use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use handoff::activation::{NotifyContext, NotifyKind, ProcessEnv};

#[derive(Parser)]
#[command(name = "handoff-notify")]
#[command(about = "Send a readiness notification to the supervising process", long_about = None)]
struct Cli {
    /// Fail when no notification socket is configured.
    #[arg(long)]
    require_socket: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// READY=1
    Ready,
    /// STATUS=<text>
    Status { text: String },
    /// ERRNO=<n>
    Errno { code: i32 },
    /// BUSERROR=<name>
    BusError { name: String },
    /// MAINPID=<pid>, defaulting to the parent process
    MainPid { pid: Option<u32> },
    /// WATCHDOG=1
    Watchdog,
    /// STOPPING=1
    Stopping,
}

impl Commands {
    fn into_kind(self) -> NotifyKind {
        match self {
            Commands::Ready => NotifyKind::Ready,
            Commands::Status { text } => NotifyKind::Status(text),
            Commands::Errno { code } => NotifyKind::Errno(code),
            Commands::BusError { name } => NotifyKind::BusError(name),
            Commands::MainPid { pid } => NotifyKind::MainPid(pid.unwrap_or_else(std::os::unix::process::parent_id)),
            Commands::Watchdog => NotifyKind::Watchdog,
            Commands::Stopping => NotifyKind::Stopping,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let context = NotifyContext::new(Arc::new(ProcessEnv));

    if cli.require_socket && context.sink().is_null() {
        eprintln!("handoff-notify: neither NOTIFY_SOCKET nor NOTIFY_FD is set");
        return ExitCode::FAILURE;
    }

    let kind = cli.command.into_kind();
    context.notify(&kind);
    ExitCode::SUCCESS
}
