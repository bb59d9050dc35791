use std::io::Write;

use log::LevelFilter;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Install the global logger. `RUST_LOG` overrides `level` when set.
///
/// Returns false if a logger was already installed, which happens when
/// several tests in one binary initialise logging.
pub fn init_logging(level: &str) -> bool {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format(TIME_FORMAT),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_env("RUST_LOG")
        .try_init()
        .is_ok()
}
