use clap::{ArgAction, Parser, Subcommand};

mod cli;

use cli::inspect::InspectArgs;
use cli::optimize::OptimizeArgs;
use cli::pack::PackArgs;
use cli::run::RunArgs;

#[derive(Parser)]
#[command(
    name = "vstream",
    version,
    about = "Command-stream compiler and segment scheduler for the vector accelerator"
)]
struct Cli {
    /// Raise the log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a JSON network description into a blob
    Pack(PackArgs),
    /// Optimize the command streams of every layer in a blob
    Optimize(OptimizeArgs),
    /// Show the header, digest and segment listing of a blob
    Inspect(InspectArgs),
    /// Execute a blob on the recording accelerator
    Run(RunArgs),
}

fn main() {
    let cli = Cli::parse();
    vstream::log::init(cli.verbose);

    match cli.command {
        Command::Pack(args) => cli::pack::cmd_pack(args),
        Command::Optimize(args) => cli::optimize::cmd_optimize(args),
        Command::Inspect(args) => cli::inspect::cmd_inspect(args),
        Command::Run(args) => cli::run::cmd_run(args),
    }
}
