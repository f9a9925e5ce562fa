use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use git_lfs_server::{LfsServer, ServerConfig};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "git-lfs-server", about = "Git LFS batch and transfer server", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Port to listen on, keeping the configured host
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Directory holding the bare repositories
    #[arg(long)]
    projects_root: Option<PathBuf>,

    /// Externally visible base URL for action hrefs
    #[arg(long)]
    server_url: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config.bind_addr.set_port(port);
        }
        if let Some(root) = self.projects_root {
            config.projects_root = root;
        }
        if let Some(url) = self.server_url {
            config.server_url = url;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    let bind_addr = config.bind_addr;
    let server = LfsServer::new(config).context("invalid configuration")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    server
        .serve_on(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "git-lfs-server",
            "--bind",
            "0.0.0.0:8080",
            "--projects-root",
            "/srv/git",
            "--server-url",
            "https://lfs.example.com",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.projects_root, PathBuf::from("/srv/git"));
        assert_eq!(config.server_url, "https://lfs.example.com");
    }

    #[test]
    fn test_port_keeps_host() {
        let cli = Cli::parse_from(["git-lfs-server", "--bind", "0.0.0.0:1", "--port", "9999"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9999".parse::<SocketAddr>().unwrap());
    }
}
