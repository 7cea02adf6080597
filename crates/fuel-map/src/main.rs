use fuel_map::Settings;
use fuel_map::logging::setup_logging;

fn main() {
    let settings = Settings::from_cli();
    setup_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start the async runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(fuel_map::run(settings)) {
        tracing::error!(error = %e, "Fuel map exited with an error");
        std::process::exit(1);
    }
}
