use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

pub fn init(level_override: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let log_level = resolve_log_level(level_override)?;

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn resolve_log_level(level_override: Option<&str>) -> anyhow::Result<LevelFilter> {
    let raw_level = level_override.unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}
