use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::language::Language;

#[derive(Parser, Debug)]
#[command(name = "common-room")]
#[command(version)]
#[command(about = "Shared coding rooms: live code, language, chat and roster kept in sync")]
pub struct Args {
    /// Path to a TOML config file ([server] / [client] tables)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the room coordination service
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Create a new room and enter it
    Create {
        /// Username to join as (defaults to the saved identity)
        #[arg(long, short)]
        username: Option<String>,
    },

    /// Join an existing room by code and enter it
    Join {
        /// Room code
        room: String,

        /// Username to join as (defaults to the saved identity)
        #[arg(long, short)]
        username: Option<String>,
    },

    /// Re-enter a room with the saved identity
    Enter {
        /// Room code
        room: String,
    },

    /// Execute a source file once and print the result
    Run {
        /// Source file to execute
        file: PathBuf,

        /// Language of the file
        #[arg(long, short, value_enum, default_value = "python")]
        language: Language,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
