use anyhow::{Context, Result};
use std::io::Write;

use crate::cli::config::{Config, Overrides};
use crate::cli::FetchArgs;
use crate::service::FetchOptions;

pub async fn execute_fetch(mut config: Config, args: FetchArgs) -> Result<()> {
    config.apply(Overrides {
        listen: None,
        cache_dir: args.source.cache_dir,
        provider_url: args.source.provider_url,
        source_dir: args.source.source_dir,
    });

    let service = config.build_service()?;
    let params = args.session.params();
    eprintln!("Fetching {} round {}...", params.season, params.round);

    let body = service
        .fetch(
            params,
            FetchOptions {
                compress: args.compress,
                refresh: args.refresh,
            },
        )
        .await?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} bytes to {}", body.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
        }
    }

    Ok(())
}
