use clap::{
    builder::{styling::AnsiColor, Styles},
    Parser,
};
use color_eyre::eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{self, prelude::*};

mod args;
mod check_base;
mod inspect;
mod modify;
mod rebase;

#[derive(Debug, Parser)]
#[command(version, about, styles = style())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser)]
enum Commands {
    /// Modify an image in a registry and push the result
    Modify(modify::Options),

    /// Rebase an image onto the current version of its base image
    ///
    /// By default the base is read from the `org.opencontainers.image.base.name`
    /// and `org.opencontainers.image.base.digest` annotations of the image.
    /// Use `--old` and `--new` to name the bases explicitly.
    Rebase(rebase::Options),

    /// Check whether an image is still built on the current version of its base image
    ///
    /// Exits with an error if the base has changed.
    CheckBase(check_base::Options),

    /// Print the manifests, platforms, and layers of an image as JSON
    Inspect(inspect::Options),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_writer(std::io::stderr)
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, canceling");
                cancel.cancel();
            }
        }
    });

    let cli = Cli::parse();
    match cli.command {
        Commands::Modify(opts) => modify::main(opts, cancel).await?,
        Commands::Rebase(opts) => rebase::main(opts, cancel).await?,
        Commands::CheckBase(opts) => check_base::main(opts).await?,
        Commands::Inspect(opts) => inspect::main(opts, cancel).await?,
    }

    Ok(())
}

fn style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default())
        .invalid(AnsiColor::Red.on_default())
        .valid(AnsiColor::Blue.on_default())
}
