use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod credential;
mod notes;
mod notifications;
mod reference;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::AppFactory;
use config::Config;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let config = Config::load_with(&config::default_base_path()?)?;
    log::debug!("{config:?}");

    let synchronizer = AppFactory::create_synchronizer(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match args.command {
            cli::Command::Daemon { preload } => web::serve(&config, synchronizer, preload).await,

            cli::Command::Reload {} => {
                synchronizer.ensure_loaded(true).await?;
                println!("{}", serde_json::to_string_pretty(&synchronizer.status()?)?);
                Ok(())
            }

            cli::Command::Search {
                query,
                offset,
                count,
            } => {
                let notes = synchronizer.search(&query, offset, count).await?;
                println!("{}", serde_json::to_string_pretty(&notes)?);
                Ok(())
            }

            cli::Command::Embed { text } => {
                let sentences = semantic::sanitize::sanitize(&text)?;
                let embeddings = synchronizer.embed_text(&text).await?;

                for sentence in &sentences {
                    println!("{sentence}");
                }
                println!(
                    "{} sentences, {}x{} embeddings",
                    sentences.len(),
                    embeddings.rows(),
                    embeddings.dimensions()
                );
                Ok(())
            }
        }
    })
}
