use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "blive",
    version,
    about = "Listen to Bilibili live rooms: chat, gifts, super chats and more"
)]
pub struct Args {
    /// Configuration file (defaults to ./blive.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for log files (overrides LOG_PATH)
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to rooms and print their events until interrupted
    Listen {
        /// Room ids (comma separated or repeated); adds to LIVE_ROOM_ID and the config file
        #[arg(short, long, value_delimiter = ',')]
        rooms: Vec<u64>,

        /// Broadcaster user ids whose rooms should be followed
        #[arg(short, long, value_delimiter = ',')]
        users: Vec<u64>,

        /// Poll the live status and connect only while the room is live
        #[arg(long)]
        monitor: bool,

        /// Append every notification to <dir>/<room_id>.json
        #[arg(long, value_name = "DIR")]
        save_history: Option<PathBuf>,
    },

    /// Send a chat message (needs SESSDATA and bili_jct cookies)
    Send {
        /// Target room id
        #[arg(short, long)]
        room: u64,

        /// Message text
        message: String,

        /// User id to @-mention
        #[arg(long, requires = "reply_uname")]
        reply_uid: Option<u64>,

        /// User name to @-mention
        #[arg(long, requires = "reply_uid")]
        reply_uname: Option<String>,
    },
}
