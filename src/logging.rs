use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A tracing event formatter that colours each line by level.
///
/// Lines carry no timestamp or target. Warnings and errors get a level tag
/// so they stay recognisable when colour is off (piped output, `NO_COLOR`).
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // format_fields writes straight through, so buffer to colour the whole line
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let level = *event.metadata().level();
        let line = match level_tag(level) {
            Some(tag) => format!("{} {}", tag, buffer),
            None => buffer,
        };

        let colored_output = match level {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

fn level_tag(level: Level) -> Option<&'static str> {
    match level {
        Level::WARN => Some("[WARN]"),
        Level::ERROR => Some("[ERROR]"),
        _ => None,
    }
}

/// Default filter directive; `RUST_LOG` takes precedence when set
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber with the colourised formatter
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_warnings_and_errors_are_tagged() {
        assert_eq!(level_tag(Level::WARN), Some("[WARN]"));
        assert_eq!(level_tag(Level::ERROR), Some("[ERROR]"));
        assert_eq!(level_tag(Level::INFO), None);
        assert_eq!(level_tag(Level::DEBUG), None);
    }

    #[test]
    fn test_verbose_raises_default_level() {
        assert_eq!(default_directive(false), "info");
        assert_eq!(default_directive(true), "debug");
    }
}
