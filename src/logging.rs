use owo_colors::{OwoColorize, Stream, Style};

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    Syslog,
    Stdout,
    Journal,
}

/// Fixed-width severity tag for the stdout sink, colored only when stdout
/// is a terminal that wants color.
fn level_label(level: log::Level) -> String {
    let (text, style) = match level {
        log::Level::Error => ("error", Style::new().red().bold()),
        log::Level::Warn => ("warning", Style::new().yellow().bold()),
        log::Level::Info => ("info", Style::new().green()),
        log::Level::Debug => ("debug", Style::new().blue()),
        log::Level::Trace => ("trace", Style::new().dimmed()),
    };
    format!("{text:7}")
        .if_supports_color(Stream::Stdout, |padded| padded.style(style))
        .to_string()
}

/// Enable the logger
pub fn enable_logger(sink: LogSink, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let dispatch = fern::Dispatch::new().level(match verbose {
        true => log::LevelFilter::Debug,
        false => log::LevelFilter::Info,
    });

    match sink {
        LogSink::Stdout => dispatch
            .format(|out, message, record| {
                out.finish(format_args!("{} {}", level_label(record.level()), message));
            })
            .chain(std::io::stdout())
            .apply()?,
        LogSink::Syslog => {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_DAEMON,
                hostname: None,
                process: "siitd".into(),
                pid: std::process::id(),
            };
            dispatch
                .chain(syslog::unix(formatter).map_err(|err| err.to_string())?)
                .apply()?;
        }
        LogSink::Journal => {
            return Err("not compiled with systemd support; use --syslog or --stdout".into());
        }
    }
    Ok(())
}
