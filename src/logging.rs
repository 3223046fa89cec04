use log::LevelFilter;

/// Map a `-v` count to a log level; `quiet` wins over verbosity
pub fn level_for(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize logging based on verbosity
///
/// `RUST_LOG` directives are applied on top of the chosen level. Calling this
/// twice is harmless; the first logger stays installed.
pub fn init(verbosity: u8, quiet: bool) {
    let result = env_logger::Builder::new()
        .filter_level(level_for(verbosity, quiet))
        .format_timestamp(None)
        .parse_default_env()
        .try_init();
    if result.is_err() {
        log::debug!("Logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for(0, false), LevelFilter::Warn);
        assert_eq!(level_for(1, false), LevelFilter::Info);
        assert_eq!(level_for(2, false), LevelFilter::Debug);
        assert_eq!(level_for(7, false), LevelFilter::Trace);
        assert_eq!(level_for(3, true), LevelFilter::Error);
    }

    #[test]
    fn test_init_twice() {
        init(1, false);
        init(2, false);
    }
}
