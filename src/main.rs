fn main() -> std::io::Result<()> {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    wakeword_lib::init_logging();
    let settings = wakeword_lib::settings::load_settings();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(wakeword_lib::run(settings))
}
