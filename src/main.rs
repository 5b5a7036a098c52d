use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use browser_context::{
    ContextFactory, LaunchConfig, PersistentContextFactory, RelayContextFactory,
};
use site_adapters::AdapterRegistry;
use tab_controller::TabController;

/// Drive chat web UIs through real browsers over CDP.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log filter, e.g. "info" or "cdp_relay=debug"
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a standalone relay and print its endpoints.
    Relay {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Port to bind; 0 picks a free one.
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
    /// List the chat sites the bridge knows how to drive.
    Sites,
    /// Open a tab, inject one prompt, and print the resulting page HTML.
    Send {
        /// Absolute URL of the chat page.
        #[arg(long)]
        url: String,
        /// Site id; inferred from the URL when omitted.
        #[arg(long, default_value = "")]
        site: String,
        /// Prompt text to type.
        #[arg(long)]
        text: String,
        /// Connect through a relay-backed context instead of launching a
        /// local browser.
        #[arg(long)]
        relay: bool,
        /// Print the page HTML after the response settles.
        #[arg(long)]
        dump_html: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Relay { host, port } => run_relay(SocketAddr::new(host, port)).await,
        Commands::Sites => {
            let registry = AdapterRegistry::with_defaults();
            for site in registry.websites() {
                println!(
                    "{:<12} {:<12} {} {}",
                    site.website_id,
                    site.display_name,
                    site.home_url,
                    if site.requires_proxy { "(proxy)" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Send {
            url,
            site,
            text,
            relay,
            dump_html,
        } => run_send(&url, &site, &text, relay, dump_html).await,
    }
}

async fn run_relay(addr: SocketAddr) -> Result<()> {
    let handle = cdp_relay::start(addr).await?;
    println!("CDP endpoint:       {}", handle.cdp_url());
    println!("Extension endpoint: {}", handle.extension_url());
    info!("relay running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

async fn run_send(url: &str, site: &str, text: &str, relay: bool, dump_html: bool) -> Result<()> {
    let factory: Arc<dyn ContextFactory> = if relay {
        let factory = Arc::new(RelayContextFactory::new());
        info!("relay-backed context requested; connect the browser extension once endpoints are printed");
        factory
    } else {
        Arc::new(PersistentContextFactory::new(LaunchConfig::default()))
    };

    let controller = TabController::new(factory, Arc::new(AdapterRegistry::with_defaults()));
    let tab = controller
        .open_tab(url)
        .await
        .with_context(|| format!("failed to open {url}"))?;
    info!(%tab, "tab open");

    controller
        .execute_prompt(tab, site, text)
        .await
        .context("prompt execution failed")?;
    println!("prompt delivered to {url}");

    if dump_html {
        let html = controller.page_content(tab).await?;
        println!("{html}");
    }

    controller.shutdown().await;
    Ok(())
}
