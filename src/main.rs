use oidc_bridge::{
    config,
    observability::{init_observability, log_config_info},
    services::controller,
    APP_NAME, VERSION,
};
use tracing::{error, info};

fn install_rustls_provider() {
    use rustls::crypto::{ring, CryptoProvider};

    if CryptoProvider::get_default().is_none() {
        ring::default_provider().install_default().expect("install ring crypto provider");
    }
}

#[tokio::main]
async fn main() {
    install_rustls_provider();

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_observability(&config.observability) {
        eprintln!("Failed to initialize observability: {e}");
        std::process::exit(1);
    }

    info!(app_name = APP_NAME, version = VERSION, "Starting OIDC bridge");
    log_config_info(&config);

    if let Err(e) = controller::run(config).await {
        error!(error = %e, fatal = e.is_fatal(), "OIDC bridge exited with an error");
        std::process::exit(1);
    }
}
