mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

use chronocast::config::Config;
use chronocast::index::TimeIndex;
use chronocast::playback::DiskSegmentFinder;
use chronocast::server;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on the
    // verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "chronocast=trace,tower_http=debug".to_string()
        } else {
            "chronocast=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = Config::load_or_default(cli.config.as_deref())?;
            config.server.host = host;
            config.server.port = port;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(server::start_server(config))
        }
        Commands::Index { path } => build_index(cli.config.as_deref(), path.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("chronocast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn build_index(config_path: Option<&std::path::Path>, only: Option<&str>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let finder = DiskSegmentFinder;
    let index = TimeIndex::new();

    for (path_name, path_conf) in &config.paths {
        if only.is_some_and(|p| p != path_name) {
            continue;
        }
        index.rebuild_path(path_name, path_conf, &finder);

        match index.time_span(path_name) {
            Some((first, last)) => {
                let count = index.dump(path_name).map_or(0, |e| e.len());
                println!(
                    "{path_name}: {count} entries, {} .. {}",
                    first.to_rfc3339(),
                    last.to_rfc3339()
                );
            }
            None => println!("{path_name}: no entries"),
        }
    }

    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = Config::load_or_default(Some(p))?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Paths: {}", config.paths.len());
            for (name, conf) in &config.paths {
                println!(
                    "    {name}: {} ({})",
                    conf.record_path.display(),
                    conf.record_format
                );
            }
        }
        None => {
            println!("No config file specified, using defaults");
            let config = Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
