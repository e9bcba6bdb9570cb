use clap::Parser;
use racecast::cli::{commands, config, CacheCommands, Cli, Commands, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    racecast::native::init_tracing(cli.log_format == LogFormat::Json);

    match cli.command {
        Commands::Serve(args) => {
            let cfg = config::Config::load(cli.config.as_deref())?;
            commands::execute_serve(cfg, args).await?
        }
        Commands::Fetch(args) => {
            let cfg = config::Config::load(cli.config.as_deref())?;
            commands::execute_fetch(cfg, args).await?
        }
        Commands::Watch(args) => commands::execute_watch(args).await?,
        Commands::Cache(args) => {
            let cfg = config::Config::load(cli.config.as_deref())?;
            match args.command {
                CacheCommands::List => commands::execute_cache_list(cfg, args.cache_dir).await?,
                CacheCommands::Delete(delete_args) => {
                    commands::execute_cache_delete(cfg, args.cache_dir, delete_args).await?
                }
                CacheCommands::Prune(prune_args) => {
                    commands::execute_cache_prune(cfg, args.cache_dir, prune_args).await?
                }
            }
        }
    }

    Ok(())
}
