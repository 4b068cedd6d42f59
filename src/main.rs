use anyhow::{anyhow, bail};
use cli::{Action, Command};
use colored::Colorize;
use listentogether_collab::{
    Collab, CollabError, ConnectionStatus, HttpApi, QueueState, RestoreOutcome, RoomState,
};
use listentogether_core::{Config, ConfigError, SearchResult, SongLink, User};
use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

mod cli;
mod logging;

struct Client {
    collab: Collab,
    /// Results of the last search, for `add <n>`
    results: Mutex<Vec<SearchResult>>,
}

#[derive(Debug, Error)]
enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Collab(#[from] CollabError),

    #[error("Could not enter room {0}")]
    Restore(String, RestoreOutcome),

    #[error("Could not read input: {0}")]
    Input(#[from] std::io::Error),
}

impl ClientError {
    fn hint(&self) -> String {
        match self {
            ClientError::Config(_) => "Check the LISTENTOGETHER_* environment variables.".to_string(),
            ClientError::Collab(CollabError::Api(e)) if e.is_room_not_found() => {
                "The room code might be mistyped, or the room was closed.".to_string()
            }
            ClientError::Collab(_) => "Make sure the server is running and reachable.".to_string(),
            ClientError::Restore(_, RestoreOutcome::NoSession) => {
                "There is no stored session. Join the room with `listentogether join` first.".to_string()
            }
            ClientError::Restore(_, RestoreOutcome::RoomNotFound) => {
                "The room does not exist anymore, the stored session was cleared.".to_string()
            }
            ClientError::Restore(_, _) => "Make sure the server is running and reachable.".to_string(),
            ClientError::Input(_) => "Standard input was closed unexpectedly.".to_string(),
        }
    }
}

impl Client {
    fn new() -> Result<Self, ClientError> {
        let config = Config::from_env()?;

        Ok(Self {
            collab: Collab::new(config)?,
            results: Default::default(),
        })
    }

    async fn run(&self, command: Command) -> Result<(), ClientError> {
        match command {
            Command::Help => {
                println!("{}", cli::USAGE);
                return Ok(());
            }
            Command::Search { query } => {
                self.search(&query).await?;
                return Ok(());
            }
            Command::Suggestions => {
                for suggestion in self.collab.suggestions().await? {
                    info!("{suggestion}");
                }
                return Ok(());
            }
            Command::Create { user_name } => {
                let session = self
                    .collab
                    .rooms
                    .create_room(&format!("{user_name}'s room"), &user_name)
                    .await?;

                info!("Share the code {} to invite others", session.room.code.bold());
                self.restore(&session.room.code).await?;
            }
            Command::Join {
                room_code,
                user_name,
            } => {
                self.collab.rooms.join_room(&room_code, &user_name).await?;
            }
            Command::Restore { room_code } => self.restore(&room_code).await?,
        }

        self.watch();
        self.collab.queue.setup_listeners();
        self.refresh_queue().await;

        let result = self.interact().await;
        self.collab.exit();

        result
    }

    async fn restore(&self, room_code: &str) -> Result<(), ClientError> {
        match self.collab.rooms.restore_session(room_code).await {
            RestoreOutcome::Restored => Ok(()),
            outcome => Err(ClientError::Restore(room_code.to_string(), outcome)),
        }
    }

    /// Logs room and queue changes as they come in.
    fn watch(&self) {
        let last_room = Mutex::new(None);
        self.collab.rooms.subscribe(move |state: &RoomState| {
            let summary = (
                state.connection,
                state.room.as_ref().map(|r| r.members.len()),
                state.error.clone(),
            );

            let mut last = last_room.lock();
            if last.as_ref() == Some(&summary) {
                return;
            }

            match (&state.error, state.connection) {
                (Some(error), _) => warn!("{error}"),
                (None, ConnectionStatus::Reconnecting) => warn!("Connection lost, reconnecting..."),
                (None, status) => info!("{status:?}, {}", members_line(state)),
            }

            *last = Some(summary);
        });

        let last_queue = Mutex::new(None);
        self.collab.queue.subscribe(move |state: &QueueState| {
            let summary: Vec<_> = state
                .queue
                .iter()
                .map(|item| (item.id.to_string(), item.download_status))
                .collect();
            let summary = (summary, state.current);

            let mut last = last_queue.lock();
            if last.as_ref() == Some(&summary) {
                return;
            }

            info!("Queue changed, {} items", state.queue.len());
            if let Some(playing) = state.now_playing() {
                info!("Now playing {} by {}", playing.title.bold(), playing.artist);
            }

            *last = Some(summary);
        });
    }

    async fn refresh_queue(&self) {
        let Some(room_code) = self.collab.rooms.state().room_code().map(str::to_string) else {
            return;
        };

        if let Err(e) = self.collab.queue.get_queue(&room_code).await {
            error!("Could not fetch the queue: {e}");
        }
    }

    async fn interact(&self) -> Result<(), ClientError> {
        info!("Type `help` to see what you can do");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => line?,
            };

            // Input closed
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            match cli::parse_action(&line) {
                Ok(Action::Leave) => break,
                Ok(action) => {
                    if let Err(e) = self.perform(action).await {
                        error!("{e}");
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }

        info!("Leaving...");
        Ok(())
    }

    async fn perform(&self, action: Action) -> anyhow::Result<()> {
        match action {
            Action::Search(query) => self.search(&query).await?,
            Action::Add(n) => {
                let result = self
                    .results
                    .lock()
                    .get(n - 1)
                    .cloned()
                    .ok_or_else(|| anyhow!("There is no search result {n}"))?;
                let (room_code, user) = self.membership()?;

                self.collab
                    .queue
                    .add_search_result_to_queue(&room_code, &result, &user)
                    .await?;
            }
            Action::Link(link) => {
                let link = SongLink::parse(&link)
                    .ok_or_else(|| anyhow!("{link} is not a YouTube or Spotify link"))?;
                let (room_code, user) = self.membership()?;

                self.collab.queue.add_to_queue(&room_code, &link, &user).await?;
            }
            Action::Remove(n) => {
                let (room_code, _) = self.membership()?;
                let queue = self.collab.queue.state();

                if n > queue.queue.len() {
                    bail!("The queue has {} items", queue.queue.len());
                }

                self.collab
                    .queue
                    .remove_from_queue(&room_code, n - 1)
                    .await?;
            }
            Action::Queue => self.print_queue(),
            Action::Members => info!("{}", members_line(&self.collab.rooms.state())),
            Action::Switch(room_code) => {
                if !self.collab.rooms.switch_room(&room_code).await {
                    bail!("Could not switch to room {room_code}");
                }

                self.refresh_queue().await;
            }
            Action::Help => println!("{}", cli::USAGE),
            Action::Leave => {}
        }

        Ok(())
    }

    async fn search(&self, query: &str) -> Result<(), CollabError> {
        let results = self
            .collab
            .search(query, HttpApi::DEFAULT_SEARCH_LIMIT)
            .await?;

        if results.is_empty() {
            info!("Nothing found for {query:?}");
        }

        for (n, result) in results.iter().enumerate() {
            info!(
                "{:>2}. {} - {} {}",
                n + 1,
                result.title.bold(),
                result.artist,
                format!("({})", result.duration).bright_black()
            );
        }

        *self.results.lock() = results;
        Ok(())
    }

    fn print_queue(&self) {
        let state = self.collab.queue.state();

        if state.queue.is_empty() {
            info!("The queue is empty");
        }

        for (index, item) in state.queue.iter().enumerate() {
            let marker = if state.current.index() == Some(index) {
                ">".bright_green()
            } else {
                " ".clear()
            };

            info!(
                "{marker}{:>2}. {} - {} {}",
                index + 1,
                item.title.bold(),
                item.artist,
                format!("{:?} {:.0}%", item.download_status, item.download_progress).bright_black()
            );
        }
    }

    /// The room and user to act as.
    fn membership(&self) -> anyhow::Result<(String, User)> {
        let state = self.collab.rooms.state();

        match (state.room, state.current_user) {
            (Some(room), Some(user)) => Ok((room.code, user)),
            _ => bail!("Not in a room"),
        }
    }
}

fn members_line(state: &RoomState) -> String {
    let Some(room) = &state.room else {
        return "not in a room".to_string();
    };

    let names: Vec<_> = room
        .members
        .iter()
        .map(|m| {
            if m.is_host {
                format!("{} (host)", m.name)
            } else {
                m.name.clone()
            }
        })
        .collect();

    format!("room {} with {}", room.code, names.join(", "))
}

#[tokio::main]
async fn main() {
    let args = match cli::parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n\n{}", cli::USAGE);
            return;
        }
    };

    if let Err(e) = logging::init_logger(args.verbose) {
        eprintln!("Could not install the logger: {e}");
    }

    let result = match Client::new() {
        Ok(client) => client.run(args.command).await,
        Err(e) => Err(e),
    };

    if let Err(error) = result {
        error!("{}", "listentogether stopped!".bold().red());
        error!("{}", error);
        error!(
            "{}",
            format!("Hint: {}", error.hint()).bright_black().italic()
        );
    }
}
