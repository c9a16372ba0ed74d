use log::error;
use spyglass::PROXY_LOGGER;
use spyglass::proxy::ProxyServer;
use spyglass::proxy::config::ProxyConfig;
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    let _ = log::set_logger(&PROXY_LOGGER);
    log::set_max_level(log::LevelFilter::Info);

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "proxy.conf".to_string());

    let config = match ProxyConfig::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match ProxyServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.start() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
