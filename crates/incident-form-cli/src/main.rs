use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    incident_form_cli::init_logging()?;
    let cli = incident_form_cli::Cli::parse();
    incident_form_cli::run_cli(cli)
}
