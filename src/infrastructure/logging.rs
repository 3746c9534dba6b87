use crate::domain::settings::{LogRotation, LogSettings};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target of the framing, correlation and loopback modules
const FRAME_TARGET: &str = "rangefinder_link::infrastructure::bluetooth";

pub struct LoggingGuard {
    // Dropping the guards flushes and stops the file writers
    _guards: Vec<WorkerGuard>,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// `RUST_LOG` wins over the configured directives, `info` if neither parses.
/// `trace_frames` is layered on top of either.
pub fn level_filter(settings: &LogSettings) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if !settings.trace_frames {
        return filter;
    }
    match format!("{}=trace", FRAME_TARGET).parse::<Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

fn format_layer<S>(settings: &LogSettings) -> fmt::Layer<S> {
    fmt::layer()
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target)
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let console_layer = settings.console.enabled.then(|| {
        format_layer(settings)
            .with_writer(std::io::stdout)
            .with_ansi(settings.console.ansi_colors)
    });

    let file_layer = settings.file.enabled.then(|| {
        let appender = RollingFileAppender::new(
            settings.file.rotation.into(),
            &settings.file.dir,
            &settings.file.file_name_prefix,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        format_layer(settings).with_writer(writer).with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(level_filter(settings))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    tracing::info!(
        "Logging initialized (level {}, frames {}, file {})",
        settings.level,
        if settings.trace_frames { "traced" } else { "quiet" },
        if settings.file.enabled {
            settings.file.dir.display().to_string()
        } else {
            "off".to_string()
        }
    );

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> LogSettings {
        let mut settings = LogSettings::default();
        settings.console.enabled = false;
        settings.file.enabled = false;
        settings
    }

    #[test]
    fn test_rotation_mapping() {
        assert_eq!(Rotation::from(LogRotation::Hourly), Rotation::HOURLY);
        assert_eq!(Rotation::from(LogRotation::Never), Rotation::NEVER);
        assert_eq!(Rotation::from(LogRotation::default()), Rotation::DAILY);
    }

    #[test]
    fn test_frame_tracing_adds_directive() {
        std::env::remove_var("RUST_LOG");
        let mut settings = quiet();
        assert!(!level_filter(&settings).to_string().contains(FRAME_TARGET));

        settings.trace_frames = true;
        let filter = level_filter(&settings).to_string();
        assert!(filter.contains(&format!("{}=trace", FRAME_TARGET)));
    }

    #[test]
    fn test_second_init_fails() {
        let settings = quiet();
        // whichever test installs the global subscriber first wins
        let _ = init_logger(&settings);
        assert!(init_logger(&settings).is_err());
    }
}
