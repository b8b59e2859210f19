use anyhow::Result;
use clap::Parser;
use hci_agent::{Agent, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let status = Agent::new(Config::parse()).run().await?;
    if !status.is_successful() {
        std::process::exit(1);
    }
    Ok(())
}
