use std::path::Path;
use std::time::SystemTime;

use log::LevelFilter;

fn dispatch(level: LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}: {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target().trim_start_matches("psu_prometheus::"),
                message
            ))
        })
        .level(level)
        // The HTTP stack is chatty at debug.
        .level_for("hyper", LevelFilter::Info)
        .level_for("tokio", LevelFilter::Info)
}

/// Install the global logger. Diagnostics go to stderr so stdout stays free
/// for reports, and are copied to `file` when given.
pub fn init(level: LevelFilter, file: Option<&Path>) -> Result<(), fern::InitError> {
    let mut logger = dispatch(level).chain(std::io::stderr());
    if let Some(path) = file {
        logger = logger.chain(fern::log_file(path)?);
    }
    logger.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_must_be_creatable() {
        let err = init(LevelFilter::Info, Some(Path::new("/nonexistent/dir/psu.log")));
        assert!(matches!(err, Err(fern::InitError::Io(_))));
    }
}
