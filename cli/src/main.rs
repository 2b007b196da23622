use clap::Parser;
use kfd_cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    kfd_cli::run_main(cli)
}
