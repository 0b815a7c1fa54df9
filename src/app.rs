use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use color_eyre::Result;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError, Brand, Headphone, HeadphoneType, NameInput, Resource};
use crate::cache::{CacheLayer, Cacheable, QueryKey};
use crate::catalog::Catalog;
use crate::commands::{self, Command, HeadphoneAction, NameAction, ShellInput};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::notify::{ConsoleNotifier, Notifier};
use crate::query::Query;
use crate::render::{self, Row};

/// How often the shell polls observed lists and collects unused entries
const TICK_RATE: Duration = Duration::from_millis(250);

/// Result of running one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
  Done,
  /// The command failed; the user has been told why
  Failed,
  Quit,
}

/// A list the shell keeps observed so writes and reconnects refetch it.
trait Observed: Send {
  /// Error to surface if the list changed into a failed state
  fn poll_error(&mut self) -> Option<String>;
}

impl<T: Send + Sync + 'static> Observed for Query<T> {
  fn poll_error(&mut self) -> Option<String> {
    if !self.poll() || !self.is_error() {
      return None;
    }
    let state = self.state();
    let message = state.error?.user_message();
    Some(format!("{} (after {} attempts)", message, state.failure_count))
  }
}

/// Main application state
pub struct App {
  catalog: Catalog,
  notifier: Arc<dyn Notifier>,
  /// Lists shown in this shell session
  observed: HashMap<QueryKey, Box<dyn Observed>>,
  /// Delete waiting for the answer to its confirmation prompt
  pending: Option<Command>,
  interactive: bool,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let api = ApiClient::new(&config.api.base_url)?;
    info!(api = %api.base_url(), "Catalog client ready");
    let notifier: Arc<dyn Notifier> = Arc::new(ConsoleNotifier);
    let catalog = Catalog::new(api, CacheLayer::new(config.cache_options()), notifier.clone());
    Ok(Self::with_catalog(catalog, notifier))
  }

  pub fn with_catalog(catalog: Catalog, notifier: Arc<dyn Notifier>) -> Self {
    Self {
      catalog,
      notifier,
      observed: HashMap::new(),
      pending: None,
      interactive: false,
    }
  }

  /// Read commands from stdin until `quit` or end of input. The cache lives
  /// for the whole session, so repeated lists are served from it.
  pub async fn run_shell(&mut self) -> Result<()> {
    self.interactive = true;
    let mut events = EventHandler::new(TICK_RATE);
    println!("hpadmin shell. Type 'help' for commands, 'quit' to leave.");
    prompt();

    while let Some(event) = events.next().await {
      match event {
        Event::Line(line) => {
          if self.handle_line(&line).await? == Flow::Quit {
            break;
          }
          if self.pending.is_none() {
            prompt();
          }
        }
        Event::Tick => self.on_tick(),
        Event::Eof => break,
      }
    }

    self.observed.clear();
    Ok(())
  }

  async fn handle_line(&mut self, line: &str) -> Result<Flow> {
    if let Some(command) = self.pending.take() {
      let answer = line.trim().to_lowercase();
      if answer == "y" || answer == "yes" {
        return self.execute(command).await;
      }
      println!("Cancelled");
      return Ok(Flow::Done);
    }

    match commands::parse_line(line) {
      Ok(ShellInput::Empty) => Ok(Flow::Done),
      Ok(ShellInput::Help) => {
        println!("{}", render::help());
        Ok(Flow::Done)
      }
      Ok(ShellInput::Run(command)) => self.execute(command).await,
      Err(e) => {
        eprintln!("{}", e);
        Ok(Flow::Done)
      }
    }
  }

  fn on_tick(&mut self) {
    for (key, query) in self.observed.iter_mut() {
      if let Some(message) = query.poll_error() {
        eprintln!("\n! {}: {}", key.scope(), message);
        prompt();
      }
    }
    let collected = self.catalog.cache().collect_garbage();
    if collected > 0 {
      debug!(collected, "Collected cache entries");
    }
  }

  pub async fn execute(&mut self, command: Command) -> Result<Flow> {
    if let Some((entity, id)) = unconfirmed_delete(&command) {
      return Ok(self.ask_confirmation(entity, id, command));
    }

    let flow = match command {
      Command::Brands { action } => self.run_name_action::<Brand>(action).await,
      Command::Types { action } => {
        self
          .run_name_action::<HeadphoneType>(action)
          .await
      }
      Command::Headphones { action } => self.run_headphone_action(action).await,
      Command::Chat { message } => match self.catalog.chat(&message.join(" ")).await {
        Ok(reply) => {
          println!("{}", reply);
          Flow::Done
        }
        Err(_) => Flow::Failed,
      },
      Command::Status => {
        println!("{}", render::summary(&self.catalog.cache().summary()));
        Flow::Done
      }
      Command::Reconnect => {
        let started = self.catalog.cache().on_reconnect();
        println!("Refetching {} observed list(s)", started);
        Flow::Done
      }
      Command::Focus => {
        let started = self.catalog.cache().on_window_focus();
        println!("Refetching {} observed list(s)", started);
        Flow::Done
      }
      Command::Shell => {
        println!("Already in the shell");
        Flow::Done
      }
      Command::Quit => Flow::Quit,
    };
    Ok(flow)
  }

  /// Deletes need an explicit yes: `--yes` on the command line, or an
  /// answer to the prompt in the shell.
  fn ask_confirmation(&mut self, entity: &str, id: String, command: Command) -> Flow {
    if !self.interactive {
      eprintln!("Not deleting {} '{}' without --yes", entity, id);
      return Flow::Failed;
    }

    let mut out = std::io::stdout().lock();
    let _ = write!(out, "Delete {} '{}'? [y/N] ", entity, id);
    let _ = out.flush();
    self.pending = Some(confirmed(command));
    Flow::Done
  }

  async fn run_name_action<R>(&mut self, action: NameAction) -> Flow
  where
    R: Resource<Input = NameInput> + Row,
  {
    match action {
      NameAction::List { filter } => self.list::<R>(filter.as_deref()).await,
      NameAction::Create { name } => {
        let result = self.catalog.collection::<R>().create(NameInput::new(name)).await;
        show_record(result)
      }
      NameAction::Update { id, name } => {
        let result = self
          .catalog
          .collection::<R>()
          .update(&id, NameInput::new(name))
          .await;
        show_record(result)
      }
      NameAction::Delete { id, .. } => match self.catalog.collection::<R>().delete(&id).await {
        Ok(()) => Flow::Done,
        Err(_) => Flow::Failed,
      },
    }
  }

  async fn run_headphone_action(&mut self, action: HeadphoneAction) -> Flow {
    match action {
      HeadphoneAction::List { filter } => self.list::<Headphone>(filter.as_deref()).await,
      HeadphoneAction::Create { name, fields } => {
        show_record(self.catalog.headphones().create(fields.into_input(name)).await)
      }
      HeadphoneAction::Update { id, name, fields } => {
        let result = self
          .catalog
          .headphones()
          .update(&id, fields.into_input(name))
          .await;
        show_record(result)
      }
      HeadphoneAction::Delete { id, .. } => match self.catalog.headphones().delete(&id).await {
        Ok(()) => Flow::Done,
        Err(_) => Flow::Failed,
      },
    }
  }

  async fn list<R: Resource + Row>(&mut self, filter: Option<&str>) -> Flow {
    let collection = self.catalog.collection::<R>();
    let result = match collection.list().await {
      Ok(result) => result,
      Err(err) => {
        self.notifier.error(&err.user_message());
        return Flow::Failed;
      }
    };

    if self.interactive && !self.observed.contains_key(&R::list_key()) {
      self.observed.insert(R::list_key(), Box::new(collection.subscribe()));
    }

    let rows: Vec<&R> = result
      .data
      .iter()
      .filter(|r| render::matches_filter(r.name(), filter))
      .collect();
    println!("{}", render::records(&rows));
    let updated = result
      .updated_at
      .map(|at| format!(", updated {}", at.with_timezone(&Local).format("%H:%M:%S")))
      .unwrap_or_default();
    println!(
      "{} of {} {} ({}{})",
      rows.len(),
      result.data.len(),
      R::COLLECTION,
      render::source_label(result.source),
      updated
    );
    Flow::Done
  }
}

/// Entity and id of a delete that hasn't been confirmed yet.
fn unconfirmed_delete(command: &Command) -> Option<(&'static str, String)> {
  match command {
    Command::Brands {
      action: NameAction::Delete { id, yes: false },
    } => Some((Brand::entity_type(), id.clone())),
    Command::Types {
      action: NameAction::Delete { id, yes: false },
    } => Some((HeadphoneType::entity_type(), id.clone())),
    Command::Headphones {
      action: HeadphoneAction::Delete { id, yes: false },
    } => Some((Headphone::entity_type(), id.clone())),
    _ => None,
  }
}

fn confirmed(mut command: Command) -> Command {
  match &mut command {
    Command::Brands {
      action: NameAction::Delete { yes, .. },
    }
    | Command::Types {
      action: NameAction::Delete { yes, .. },
    }
    | Command::Headphones {
      action: HeadphoneAction::Delete { yes, .. },
    } => *yes = true,
    _ => {}
  }
  command
}

fn show_record<R: Row>(result: Result<R, ApiError>) -> Flow {
  match result {
    Ok(record) => {
      println!("{}", render::records(&[&record]));
      Flow::Done
    }
    Err(_) => Flow::Failed,
  }
}

fn prompt() {
  let mut out = std::io::stdout().lock();
  let _ = write!(out, "hpadmin> ");
  let _ = out.flush();
}
