use tracing::level_filters::LevelFilter;

/// Map a config level name to a filter. Unknown names fall back to `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Install the global fmt subscriber. `verbose` forces `debug`.
/// A second call is a no-op.
pub fn init(level: &str, verbose: bool) {
    let filter = if verbose {
        LevelFilter::DEBUG
    } else {
        parse_level(level)
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("WARN"), LevelFilter::WARN);
        assert_eq!(parse_level("debug"), LevelFilter::DEBUG);
        assert_eq!(parse_level("chatty"), LevelFilter::INFO);
    }
}
