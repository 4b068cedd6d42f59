use std::fmt::{self, Display};

use colored::{ColoredString, Colorize};
use log::{Level, Metadata, SetLoggerError};

/// Installs the logger on stdout.
///
/// Our own crates log from info up, or from debug when verbose. Dependencies only get
/// to report warnings and errors.
pub fn init_logger(verbose: bool) -> Result<(), SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            let time = chrono::Local::now().format("%H:%M:%S").to_string();

            out.finish(format_args!(
                "{} {} {:<6} {}",
                badge(record.level()),
                time.bright_black(),
                Origin::of(record.target()),
                message
            ))
        })
        .filter(move |meta| passes(meta, verbose))
        .chain(std::io::stdout())
        .apply()
}

fn passes(meta: &Metadata, verbose: bool) -> bool {
    let floor = match Origin::of(meta.target()) {
        Origin::Dependency(_) => Level::Warn,
        _ if verbose => Level::Debug,
        _ => Level::Info,
    };

    // Lower levels compare as greater
    meta.level() <= floor
}

/// Which part of the program a record comes from
enum Origin<'a> {
    Cli,
    Collab,
    Core,
    Dependency(&'a str),
}

impl<'a> Origin<'a> {
    fn of(target: &'a str) -> Self {
        let krate = target.split("::").next().unwrap_or_default();

        match krate {
            "listentogether" => Self::Cli,
            "listentogether_collab" => Self::Collab,
            "listentogether_core" => Self::Core,
            other => Self::Dependency(other),
        }
    }
}

impl Display for Origin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Origin::Cli => "CLI".bright_green(),
            Origin::Collab => "COLLAB".bright_purple(),
            Origin::Core => "CORE".blue(),
            Origin::Dependency(name) => name.dimmed(),
        };

        Display::fmt(&label, f)
    }
}

fn badge(level: Level) -> ColoredString {
    let text = format!(" {:<5} ", level.as_str());

    match level {
        Level::Error => text.black().on_red().bold(),
        Level::Warn => text.black().on_yellow().bold(),
        Level::Info => text.black().on_blue(),
        Level::Debug => text.white().on_black(),
        Level::Trace => text.normal(),
    }
}
