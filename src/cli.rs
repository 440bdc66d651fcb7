use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shorecall")]
#[command(about = "Push-notification WebRTC signaling relay")]
pub struct Cli {
    /// Runs as server when no subcommand is given
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one expiry sweep against the session store and exit
    Sweep,
}
