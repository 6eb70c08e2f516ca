use anyhow::Result;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
    time::Duration,
};

use cowatch_client::{
    catalog::{CatalogClient, CatalogError, Title, TitleSummary},
    clock::{Clock, SystemClock},
    config::{health_url_from_ws, http_base_from_ws, ClientConfig, Endpoint},
    connection::RoomConnection,
    console::{parse_home_command, HomeCommand, HOME_HELP},
    constants::{HTTP_TIMEOUT, LINK_SCHEME, LOCAL_WS_URL},
    home::{RoomDirectory, TitleSearch},
    invite::parse_watch_url,
    player::VirtualPlayer,
    prefs::PreferenceStore,
    protocol::ServerEvent,
    runtime::{RoomExit, RoomRuntime},
    session::{Navigation, RoomEntry, RoomSession, SessionState},
    update,
};

/// Full passes over the endpoint list before giving up on a room
const CONNECT_ROUNDS: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowatch_client=debug,info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env();
    tracing::debug!("Configuration: {:?}", config);

    if !config.skip_update_check {
        tokio::spawn(report_updates(config.releases_url.clone()));
    }

    let mut app = App {
        catalog: CatalogClient::new(&config.catalog_url, &config.storage_url),
        prefs: Arc::new(PreferenceStore::new()),
        lines: spawn_stdin_reader(),
        config,
    };
    tracing::info!("Preferences at {:?}", app.prefs.path());

    let keep_going = match parse_launch(std::env::args().skip(1)) {
        Launch::Home => true,
        Launch::Link(link) => app.join(&link).await?,
        Launch::Create { title_id, episode } => app.create_room(title_id, episode).await?,
    };
    if keep_going {
        app.home().await?;
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Launch {
    Home,
    Link(String),
    Create { title_id: u64, episode: u32 },
}

fn parse_launch(mut args: impl Iterator<Item = String>) -> Launch {
    let mut launch = Launch::Home;
    while let Some(arg) = args.next() {
        if arg == "--create" {
            let title_id = args.next().and_then(|id| id.parse().ok());
            let episode = args.next().and_then(|ep| ep.parse().ok()).unwrap_or(1);
            match title_id {
                Some(title_id) => launch = Launch::Create { title_id, episode },
                None => tracing::warn!("--create needs a numeric title id"),
            }
        } else if arg == "--invite-url" {
            if let Some(url) = args.next() {
                launch = Launch::Link(url);
            }
        } else if !arg.starts_with('-') {
            launch = Launch::Link(arg);
        }
    }
    launch
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn report_updates(releases_url: String) {
    match update::check_for_updates(&releases_url).await {
        Ok(info) if info.is_update_available => {
            tracing::info!(
                "Version {} is available (running {}): {}",
                info.latest_version,
                info.current_version,
                info.release_url
            );
        }
        Ok(info) => tracing::debug!("Running the latest version {}", info.current_version),
        Err(e) => tracing::debug!("Update check failed: {:#}", e),
    }
}

struct App {
    config: ClientConfig,
    prefs: Arc<PreferenceStore>,
    catalog: CatalogClient,
    lines: mpsc::UnboundedReceiver<String>,
}

type SearchResult = (String, Result<Vec<TitleSummary>, CatalogError>);

/// An open socket to whichever endpoint answered, with its event feed
struct RoomLink {
    connection: RoomConnection,
    endpoint: Endpoint,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    closed: oneshot::Receiver<()>,
}

/// Room directory served next to the socket we actually reached
fn directory_for(endpoint: &Endpoint) -> Option<RoomDirectory> {
    http_base_from_ws(&endpoint.url).map(RoomDirectory::new)
}

impl App {
    async fn home(&mut self) -> Result<()> {
        println!("{HOME_HELP}");
        let clock = SystemClock;
        let mut search = TitleSearch::default();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<SearchResult>();

        loop {
            let wait = search
                .next_due()
                .map(|due| Duration::from_secs_f64((due - clock.now()).max(0.0)))
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                line = self.lines.recv() => {
                    let Some(line) = line else {
                        return Ok(());
                    };
                    let keep_going = match parse_home_command(&line) {
                        Ok(HomeCommand::Search(text)) => {
                            search.set_input(&text, clock.now());
                            true
                        }
                        Ok(HomeCommand::Create { title_id, episode }) => {
                            self.create_room(title_id, episode).await?
                        }
                        Ok(HomeCommand::Join(link)) => self.join(&link).await?,
                        Ok(HomeCommand::History) => {
                            self.print_history();
                            true
                        }
                        Ok(HomeCommand::Forget(title_id)) => {
                            self.prefs.remove_title(title_id)?;
                            true
                        }
                        Ok(HomeCommand::Help) => {
                            println!("{HOME_HELP}");
                            true
                        }
                        Ok(HomeCommand::Quit) => false,
                        Err(e) => {
                            println!("{e}");
                            true
                        }
                    };
                    if !keep_going {
                        return Ok(());
                    }
                }
                Some((query, result)) = results_rx.recv() => match result {
                    Ok(results) => {
                        if search.accept(&query, results) {
                            if search.results().is_empty() {
                                println!("Nothing found for {query:?}");
                            }
                            for hit in search.results() {
                                match &hit.name_alt {
                                    Some(alt) => println!("  {:>6}  {} ({})", hit.id, hit.name, alt),
                                    None => println!("  {:>6}  {}", hit.id, hit.name),
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Search for {:?} failed: {}", query, e);
                        println!("Search failed: {e}");
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }

            if let Some(query) = search.poll(clock.now()) {
                let catalog = self.catalog.clone();
                let results_tx = results_tx.clone();
                tokio::spawn(async move {
                    let result = catalog.search_titles(&query).await;
                    let _ = results_tx.send((query, result));
                });
            }
        }
    }

    fn print_history(&self) {
        let history = self.prefs.history();
        if history.is_empty() {
            println!("Nothing watched yet");
        }
        for entry in history {
            println!(
                "  {:>6}  episode {}/{}",
                entry.title_id, entry.last_watched_episode, entry.episodes_count
            );
        }
    }

    async fn fetch_title(&self, title_id: u64) -> Option<Title> {
        match self.catalog.get_title(title_id).await {
            Ok(title) => Some(title),
            Err(e) => {
                tracing::error!("Failed to fetch title {}: {}", title_id, e);
                println!("Could not load title {title_id}: {e}");
                None
            }
        }
    }

    async fn show_title(&self, title_id: u64, episode: u32) {
        if let Some(title) = self.fetch_title(title_id).await {
            println!(
                "{} ({} episodes). `create {} {}` to watch it together again.",
                title.display_name(),
                title.episode_count(),
                title_id,
                episode
            );
        }
    }

    /// Returns false once stdin is gone.
    async fn create_room(&mut self, title_id: u64, episode: u32) -> Result<bool> {
        let Some(title) = self.fetch_title(title_id).await else {
            return Ok(true);
        };

        let Some(link) = self.connect().await else {
            return Ok(true);
        };

        let entry = match directory_for(&link.endpoint) {
            Some(directory) => match directory.create_room(title_id, episode).await {
                Ok(info) => RoomEntry::Join {
                    room_id: info.room_id,
                },
                Err(e) => {
                    tracing::warn!("Room directory failed ({}); creating over the socket", e);
                    RoomEntry::Create { title_id, episode }
                }
            },
            None => RoomEntry::Create { title_id, episode },
        };
        self.enter_room(link, entry, Some(title), episode).await
    }

    async fn join(&mut self, input: &str) -> Result<bool> {
        let Some(link) = parse_watch_url(input) else {
            println!("Not a {LINK_SCHEME}:// link or room code: {input}");
            return Ok(true);
        };
        let Some(room_id) = link.room_id.clone() else {
            let title_id = link.title_id.unwrap_or_default();
            self.show_title(title_id, link.episode.unwrap_or(1)).await;
            return Ok(true);
        };

        let Some(room) = self.connect().await else {
            return Ok(true);
        };

        let (title_id, episode) = match (link.title_id, directory_for(&room.endpoint)) {
            (Some(title_id), _) => (Some(title_id), link.episode.unwrap_or(1)),
            (None, Some(directory)) => match directory.get_room(&room_id).await {
                Ok(info) => (Some(info.title_id), info.episode),
                Err(e) if e.is_room_missing() => {
                    println!("Room {room_id} does not exist");
                    room.connection.close();
                    return Ok(true);
                }
                Err(e) => {
                    tracing::warn!("Room lookup failed: {}", e);
                    (None, 1)
                }
            },
            (None, None) => (None, 1),
        };

        let title = match title_id {
            Some(title_id) => self.fetch_title(title_id).await,
            None => None,
        };
        self.enter_room(room, RoomEntry::Join { room_id }, title, episode)
            .await
    }

    async fn connect(&self) -> Option<RoomLink> {
        let connection = RoomConnection::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let Some((closed, endpoint)) =
            connect_with_fallback(&connection, &self.config.endpoints(), events_tx).await
        else {
            println!("Could not reach the room server");
            return None;
        };
        Some(RoomLink {
            connection,
            endpoint,
            events,
            closed,
        })
    }

    async fn enter_room(
        &mut self,
        link: RoomLink,
        entry: RoomEntry,
        title: Option<Title>,
        episode: u32,
    ) -> Result<bool> {
        let RoomLink {
            connection,
            endpoint,
            events,
            closed,
        } = link;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = SessionState::new(
            Arc::clone(&clock),
            title,
            episode,
            self.prefs.preferences().resolution,
        );
        let session = RoomSession::new(entry, state);
        let engine = VirtualPlayer::new(Arc::clone(&clock));
        let mut runtime = RoomRuntime::new(
            session,
            engine,
            connection.clone(),
            Arc::clone(&self.prefs),
            clock,
        )
        .with_catalog(self.catalog.clone());

        runtime.start().await?;
        println!("Type `help` for room commands");
        let (exit, connection) = runtime.run(events, &mut self.lines, closed).await?;
        connection.close();
        tracing::debug!(
            "Left {} room server; traffic {}",
            endpoint.label,
            connection.traffic()
        );

        match exit {
            RoomExit::Left => println!("Left the room"),
            RoomExit::Navigate(Navigation::Title { title_id, episode }) => {
                self.show_title(title_id, episode).await
            }
            RoomExit::Navigate(Navigation::Home) | RoomExit::Disconnected => {}
            RoomExit::InputClosed => return Ok(false),
        }
        Ok(true)
    }
}

async fn connect_with_fallback(
    connection: &RoomConnection,
    endpoints: &[Endpoint],
    events: mpsc::UnboundedSender<ServerEvent>,
) -> Option<(oneshot::Receiver<()>, Endpoint)> {
    let mut attempt: u32 = 0;
    let total = endpoints.len() as u32 * CONNECT_ROUNDS;

    for _ in 0..CONNECT_ROUNDS {
        for endpoint in endpoints {
            attempt += 1;
            tracing::info!(
                "Connecting to {} room server (attempt {attempt})...",
                endpoint.label
            );
            if endpoint.url != LOCAL_WS_URL {
                warm_up_backend(endpoint).await;
            }

            let events = events.clone();
            match connection
                .connect(&endpoint.url, move |event| {
                    let _ = events.send(event);
                })
                .await
            {
                Ok(closed) => {
                    tracing::info!(
                        "Connected to {} room server at {}",
                        endpoint.label,
                        endpoint.url
                    );
                    return Some((closed, endpoint.clone()));
                }
                Err(e) => tracing::warn!(
                    "Failed to connect to {} room server at {}: {:#}",
                    endpoint.label,
                    endpoint.url,
                    e
                ),
            }

            if attempt < total {
                let delay = Duration::from_secs(5 * attempt.min(6) as u64);
                println!("Room server unavailable, retrying in {}s...", delay.as_secs());
                tokio::time::sleep(delay).await;
            }
        }
    }
    None
}

async fn warm_up_backend(endpoint: &Endpoint) {
    let Some(health_url) = health_url_from_ws(&endpoint.url) else {
        return;
    };
    match reqwest::Client::new()
        .get(&health_url)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => tracing::info!(
            "Warmup request to {} backend at {} returned {}",
            endpoint.label,
            health_url,
            response.status()
        ),
        Err(e) => tracing::warn!(
            "Warmup request to {} backend at {} failed: {}",
            endpoint.label,
            health_url,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(args: &[&str]) -> Launch {
        parse_launch(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn test_launch_arguments() {
        assert_eq!(launch(&[]), Launch::Home);
        assert_eq!(
            launch(&["--create", "9419", "4"]),
            Launch::Create {
                title_id: 9419,
                episode: 4
            }
        );
        assert_eq!(
            launch(&["--create", "9419"]),
            Launch::Create {
                title_id: 9419,
                episode: 1
            }
        );
        assert_eq!(
            launch(&["cowatch://watch?room_id=k3x9"]),
            Launch::Link("cowatch://watch?room_id=k3x9".into())
        );
        assert_eq!(
            launch(&["--invite-url", "k3x9"]),
            Launch::Link("k3x9".into())
        );
        assert_eq!(launch(&["--create", "abc"]), Launch::Home);
    }

    #[test]
    fn test_directory_follows_connected_endpoint() {
        let local = Endpoint {
            label: "local",
            url: LOCAL_WS_URL.to_string(),
        };
        let hosted = Endpoint {
            label: "hosted",
            url: "wss://rooms.example.org/ws".to_string(),
        };
        assert_eq!(
            directory_for(&local).map(|d| d.base_url().to_string()),
            Some("http://localhost:8001".to_string())
        );
        assert_eq!(
            directory_for(&hosted).map(|d| d.base_url().to_string()),
            Some("https://rooms.example.org".to_string())
        );
        let bogus = Endpoint {
            label: "bogus",
            url: "ftp://nope".to_string(),
        };
        assert!(directory_for(&bogus).is_none());
    }
}
