use anyhow::Context;

fn main() -> anyhow::Result<()> {
    let args: node::cli::Args = argh::from_env();

    logger::init();

    let config = args.load_config().context("Failed to resolve config")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    // Only a transport bring-up failure propagates out of run() and exits
    // nonzero; everything else degrades and logs.
    runtime.block_on(node::run::run(config))
}
