use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the http service.
    Daemon {
        /// Load the index at startup instead of on the first search
        #[clap(long, default_value = "false")]
        preload: bool,
    },

    /// Rebuild the local store and the index from the reference service.
    Reload {},

    /// Search notes by similarity. An empty query lists notes.
    Search {
        /// Query text
        #[clap(default_value = "")]
        query: String,

        #[clap(short, long, default_value = "0")]
        offset: usize,

        #[clap(short, long, default_value = "20")]
        count: usize,
    },

    /// Print the sentences of a text and the shape of their embeddings.
    Embed {
        text: String,
    },
}
