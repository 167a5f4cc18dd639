use std::path::Path;

use eyre::{eyre, Result};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const CONSOLE_PATTERN: &str = "{d(%H:%M:%S)} {h({l})} {t} - {m}{n}";
const FILE_PATTERN: &str = "{d} {l} {t} - {m}{n}";

/// Build the logger configuration: stderr always, plus a file when asked.
pub fn config(level: LevelFilter, log_file: Option<&Path>) -> Result<Config> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
            .build(path)
            .map_err(|e| eyre!("cannot open log file {}: {}", path.display(), e))?;
        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    // The engine client is chatty at debug level.
    builder = builder.logger(
        log4rs::config::Logger::builder().build("hyper", LevelFilter::Warn.min(level)),
    );

    builder
        .build(root.build(level))
        .map_err(|e| eyre!("invalid logging configuration: {}", e))
}

pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let config = config(level, log_file)?;
    log4rs::init_config(config).map_err(|e| eyre!("cannot install logger: {}", e))?;
    Ok(())
}
