use thiserror::Error;

pub const USAGE: &str = "\
Usage: listentogether [--verbose] <command>

Commands:
  create <name>          create a room and enter it
  join <code> <name>     join a room
  restore <code>         rejoin a room with the stored session
  search <query>         search for tracks
  suggestions            show search suggestions
  help                   show this message

Inside a room:
  search <query>         search for tracks
  add <n>                add result n of the last search
  link <url>             add a YouTube or Spotify link
  remove <n>             remove item n from the queue
  queue                  show the queue
  members                show who is here
  switch <code>          move to another room
  leave                  leave the room and quit";

#[derive(Debug, Error, PartialEq)]
pub enum ArgsError {
    #[error("Missing {0}, see `listentogether help`")]
    Missing(&'static str),
    #[error("Unknown command {0:?}, see `listentogether help`")]
    UnknownCommand(String),
    #[error("{0:?} is not a number")]
    NotANumber(String),
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Create { user_name: String },
    Join { room_code: String, user_name: String },
    Restore { room_code: String },
    Search { query: String },
    Suggestions,
    Help,
}

#[derive(Debug, PartialEq)]
pub struct Args {
    pub verbose: bool,
    pub command: Command,
}

/// Something typed while in a room
#[derive(Debug, PartialEq)]
pub enum Action {
    Search(String),
    /// 1-based position in the last search results
    Add(usize),
    Link(String),
    /// 1-based position in the queue
    Remove(usize),
    Queue,
    Members,
    Switch(String),
    Leave,
    Help,
}

pub fn parse_args<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = String>,
{
    let (flags, words): (Vec<_>, Vec<_>) = args.into_iter().partition(|a| a.starts_with('-'));
    let verbose = flags.iter().any(|f| f == "-v" || f == "--verbose");

    let mut words = words.into_iter();
    let rest = |words: std::vec::IntoIter<String>| words.collect::<Vec<_>>().join(" ");

    let command = match words.next().as_deref() {
        None | Some("help") => Command::Help,
        Some("create") => Command::Create {
            user_name: non_empty(rest(words), "name")?,
        },
        Some("join") => Command::Join {
            room_code: words.next().ok_or(ArgsError::Missing("room code"))?,
            user_name: non_empty(rest(words), "name")?,
        },
        Some("restore") => Command::Restore {
            room_code: words.next().ok_or(ArgsError::Missing("room code"))?,
        },
        Some("search") => Command::Search {
            query: non_empty(rest(words), "query")?,
        },
        Some("suggestions") => Command::Suggestions,
        Some(other) => return Err(ArgsError::UnknownCommand(other.to_string())),
    };

    Ok(Args { verbose, command })
}

pub fn parse_action(line: &str) -> Result<Action, ArgsError> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim().to_string();

    let action = match word {
        "search" => Action::Search(non_empty(rest, "query")?),
        "add" => Action::Add(position(&rest)?),
        "link" => Action::Link(non_empty(rest, "link")?),
        "remove" => Action::Remove(position(&rest)?),
        "queue" => Action::Queue,
        "members" => Action::Members,
        "switch" => Action::Switch(non_empty(rest, "room code")?),
        "leave" | "quit" | "exit" => Action::Leave,
        "help" => Action::Help,
        other => return Err(ArgsError::UnknownCommand(other.to_string())),
    };

    Ok(action)
}

fn non_empty(value: String, what: &'static str) -> Result<String, ArgsError> {
    if value.trim().is_empty() {
        Err(ArgsError::Missing(what))
    } else {
        Ok(value)
    }
}

fn position(value: &str) -> Result<usize, ArgsError> {
    if value.is_empty() {
        return Err(ArgsError::Missing("number"));
    }

    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ArgsError::NotANumber(value.to_string())),
    }
}
