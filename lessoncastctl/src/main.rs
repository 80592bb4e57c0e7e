use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = lessoncastctl::Cli::parse();
    if let Err(err) = lessoncastctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
