use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::cli::config::{Config, Overrides};
use crate::cli::ServeArgs;
use crate::native;

pub async fn execute_serve(mut config: Config, args: ServeArgs) -> Result<()> {
    config.apply(Overrides {
        listen: args.listen,
        cache_dir: args.source.cache_dir,
        provider_url: args.source.provider_url,
        source_dir: args.source.source_dir,
    });

    let service = config.build_service()?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    native::serve(listener, service).await?;
    Ok(())
}
