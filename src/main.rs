//! docker-image-mirror command line entry point

use docker_image_mirror::cli::{Args, Runner};
use docker_image_mirror::logging::Logger;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    if debug {
        if let Ok(directive) = "docker_image_mirror=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse_args();
    init_tracing(args.debug);

    let result = match Runner::new(args) {
        Ok(runner) => runner.run().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        Logger::default().error(&e.to_string());
        std::process::exit(1);
    }
}
