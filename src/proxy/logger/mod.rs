use crate::proxy::request::Response;
use log::{Level, Metadata, Record};

/// ANSI color code for red text.
const RED: &str = "\x1b[31m";

/// ANSI color code for yellow text.
const YELLOW: &str = "\x1b[33m";

/// ANSI color code for blue text.
const BLUE: &str = "\x1b[34m";

/// ANSI color code for green text.
const GREEN: &str = "\x1b[32m";

/// ANSI color code for dimmed text.
const DIM: &str = "\x1b[2m";

/// ANSI color code to reset text formatting.
const RESET: &str = "\x1b[0m";

/// A custom logger that provides colored console output based on log level.
///
/// The logger implements the `log::Log` trait, allowing integration with
/// the standard Rust `log` facade:
///
/// ```rust
/// log::set_logger(&spyglass::PROXY_LOGGER).ok();
/// log::set_max_level(log::LevelFilter::Info);
/// log::info!("this appears in blue");
/// ```
pub struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            match record.level() {
                Level::Error => println!("{}[ERROR] - {}{}", RED, record.args(), RESET),
                Level::Trace => println!("{}[TRACE] - {}{}", DIM, record.args(), RESET),
                Level::Warn => println!("{}[WARN ]{} - {}", YELLOW, RESET, record.args()),
                Level::Info => println!("{}[INFO ]{} - {}", BLUE, RESET, record.args()),
                Level::Debug => println!("{}[DEBUG]{} - {}", GREEN, RESET, record.args()),
            }
        }
    }

    fn flush(&self) {}
}

impl Logger {
    /// Prints one line per relayed exchange: status code colored by class,
    /// then method, destination, path, and the measured round trip.
    pub(crate) fn log_exchange(response: &Response<'_>) {
        let request = response.request;
        let status = response.message.status_code;

        let color = match status {
            200..=299 => GREEN,
            300..=399 => YELLOW,
            400..=599 => RED,
            _ => RESET,
        };

        let roundtrip = response
            .roundtrip_time()
            .map(|d| format!(" {}{}ms{}", DIM, d.num_milliseconds(), RESET))
            .unwrap_or_default();

        println!(
            "{}{}{} {}{}{} {}{}{}",
            color,
            status,
            RESET,
            BLUE,
            request.message.method,
            RESET,
            request.host,
            request.message.target.origin_form(),
            roundtrip
        );
    }
}
