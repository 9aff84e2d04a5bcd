use core::fmt as core_fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{
        FmtContext,
        format::{FormatEvent, FormatFields, Writer},
    },
    registry::LookupSpan,
};

const CRATE_PREFIX: &str = "streamcodec::";

/// `[timestamp] LEVEL thread target:line > fields`
///
/// The thread name is printed because pool behavior depends on which
/// thread rents and returns a buffer.
pub struct CodecEventFormat {
    ansi: bool,
}

impl CodecEventFormat {
    pub fn new(ansi: bool) -> Self {
        Self { ansi }
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.ansi { code } else { "" }
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

/// Drops the crate prefix from in-crate targets.
pub fn short_target(target: &str) -> &str {
    target.strip_prefix(CRATE_PREFIX).unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for CodecEventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> core_fmt::Result {
        let reset = self.paint("\x1b[0m");
        let dim = self.paint("\x1b[2m");

        let format = time::macros::format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );
        let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
        let timestamp = now.format(&format).unwrap_or_else(|_| "-".to_string());
        write!(writer, "{}[{}]{} ", dim, timestamp, reset)?;

        let metadata = event.metadata();
        let level = metadata.level();
        write!(
            writer,
            "{}{}{: <5}{} ",
            self.paint(level_color(level)),
            self.paint("\x1b[1m"),
            level.as_str(),
            reset
        )?;

        let thread = std::thread::current();
        write!(writer, "{}{}{} ", dim, thread.name().unwrap_or("-"), reset)?;

        match metadata.line() {
            Some(line) => write!(writer, "{}{}:{}{} > ", dim, short_target(metadata.target()), line, reset)?,
            None => write!(writer, "{}{}{} > ", dim, short_target(metadata.target()), reset)?,
        }

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer, "{}", reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_targets_are_shortened() {
        assert_eq!(short_target("streamcodec::audio::codec::riff"), "audio::codec::riff");
        assert_eq!(short_target("tokio::runtime"), "tokio::runtime");
    }

    #[test]
    fn plain_output_has_no_escapes() {
        let format = CodecEventFormat::new(false);
        assert_eq!(format.paint("\x1b[0m"), "");
        assert_eq!(CodecEventFormat::new(true).paint("\x1b[0m"), "\x1b[0m");
    }
}
