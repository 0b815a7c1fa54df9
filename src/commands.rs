//! Command-line commands, shell parsing and autocomplete.

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};

use crate::api::HeadphoneInput;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
  /// Manage brands
  Brands {
    #[command(subcommand)]
    action: NameAction,
  },
  /// Manage headphone types
  Types {
    #[command(subcommand)]
    action: NameAction,
  },
  /// Manage headphones
  Headphones {
    #[command(subcommand)]
    action: HeadphoneAction,
  },
  /// Ask the catalog assistant
  Chat {
    #[arg(required = true)]
    message: Vec<String>,
  },
  /// Show cached queries
  Status,
  /// Refetch observed lists as after a dropped connection
  Reconnect,
  /// Refetch observed lists as after regaining focus
  Focus,
  /// Start an interactive session (the default)
  Shell,
  /// Leave the interactive session
  #[command(hide = true)]
  Quit,
}

/// Actions on collections whose records only carry a name.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum NameAction {
  #[command(alias = "ls")]
  List {
    /// Only show records whose name contains this text
    #[arg(short, long)]
    filter: Option<String>,
  },
  #[command(alias = "add")]
  Create { name: String },
  #[command(alias = "edit")]
  Update { id: String, name: String },
  #[command(alias = "rm")]
  Delete {
    id: String,
    /// Delete without asking for confirmation
    #[arg(short, long)]
    yes: bool,
  },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum HeadphoneAction {
  #[command(alias = "ls")]
  List {
    /// Only show headphones whose name contains this text
    #[arg(short, long)]
    filter: Option<String>,
  },
  #[command(alias = "add")]
  Create {
    name: String,
    #[command(flatten)]
    fields: HeadphoneFields,
  },
  #[command(alias = "edit")]
  Update {
    id: String,
    name: String,
    #[command(flatten)]
    fields: HeadphoneFields,
  },
  #[command(alias = "rm")]
  Delete {
    id: String,
    /// Delete without asking for confirmation
    #[arg(short, long)]
    yes: bool,
  },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct HeadphoneFields {
  #[arg(long, allow_negative_numbers = true)]
  pub price: f64,
  /// Brand id
  #[arg(long)]
  pub brand: String,
  /// Type id
  #[arg(long = "type")]
  pub kind: String,
}

impl HeadphoneFields {
  pub fn into_input(self, name: String) -> HeadphoneInput {
    HeadphoneInput {
      name,
      price: self.price,
      brand_id: self.brand,
      type_id: self.kind,
    }
  }
}

// Shell command names and autocomplete

#[derive(Debug, Clone)]
pub struct CommandInfo {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All commands available in the shell
pub const COMMANDS: &[CommandInfo] = &[
  CommandInfo {
    name: "brands",
    aliases: &["b", "brand"],
    description: "List, create, update or delete brands",
  },
  CommandInfo {
    name: "types",
    aliases: &["t", "type"],
    description: "List, create, update or delete headphone types",
  },
  CommandInfo {
    name: "headphones",
    aliases: &["h", "hp", "headphone"],
    description: "List, create, update or delete headphones",
  },
  CommandInfo {
    name: "chat",
    aliases: &["c", "ask"],
    description: "Ask the catalog assistant",
  },
  CommandInfo {
    name: "status",
    aliases: &["s", "cache"],
    description: "Show cached queries",
  },
  CommandInfo {
    name: "reconnect",
    aliases: &["r"],
    description: "Refetch observed lists",
  },
  CommandInfo {
    name: "focus",
    aliases: &["f"],
    description: "Refetch observed lists if focus refetch is enabled",
  },
  CommandInfo {
    name: "help",
    aliases: &["?"],
    description: "Show this list",
  },
  CommandInfo {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Exit hpadmin",
  },
];

fn ranked(input: &str) -> Vec<(&'static CommandInfo, u32)> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().map(|cmd| (cmd, 0)).collect();
  }

  let mut matches: Vec<(&CommandInfo, u32)> = Vec::new();

  for cmd in COMMANDS {
    if cmd.name == input_lower {
      matches.push((cmd, 0));
    } else if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
    } else if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
    } else if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
    } else if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
    } else if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);
  matches
}

/// Get autocomplete suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static CommandInfo> {
  ranked(input).into_iter().map(|(cmd, _)| cmd).collect()
}

/// Resolve a typed command word to a command name. Exact names and aliases
/// win; otherwise the word must be a prefix of exactly one command.
pub fn resolve(word: &str) -> Result<&'static str> {
  let matches = ranked(word);
  if let Some((cmd, priority)) = matches.first() {
    if *priority <= 1 {
      return Ok(cmd.name);
    }
  }

  let prefixed: Vec<&'static str> = matches
    .iter()
    .filter(|(_, priority)| *priority <= 3)
    .map(|(cmd, _)| cmd.name)
    .collect();
  match prefixed.as_slice() {
    [name] => Ok(*name),
    [] => {
      let similar: Vec<&str> = get_suggestions(word).iter().map(|cmd| cmd.name).collect();
      if similar.is_empty() {
        Err(eyre!("Unknown command '{}'. Type 'help' for a list.", word))
      } else {
        Err(eyre!("Unknown command '{}'. Did you mean: {}?", word, similar.join(", ")))
      }
    }
    names => Err(eyre!("Ambiguous command '{}': {}", word, names.join(", "))),
  }
}

/// Split a shell line into words, honoring single and double quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
  let mut words = Vec::new();
  let mut current = String::new();
  let mut in_word = false;
  let mut quote: Option<char> = None;

  for c in line.chars() {
    match (quote, c) {
      (Some(q), c) if c == q => quote = None,
      (Some(_), c) => current.push(c),
      (None, '"' | '\'') => {
        quote = Some(c);
        in_word = true;
      }
      (None, c) if c.is_whitespace() => {
        if in_word {
          words.push(std::mem::take(&mut current));
          in_word = false;
        }
      }
      (None, c) => {
        current.push(c);
        in_word = true;
      }
    }
  }

  if quote.is_some() {
    return Err(eyre!("Unterminated quote"));
  }
  if in_word {
    words.push(current);
  }
  Ok(words)
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_subcommand = true)]
struct ShellLine {
  #[command(subcommand)]
  command: Command,
}

/// One line typed into the shell.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellInput {
  Empty,
  Help,
  Run(Command),
}

pub fn parse_line(line: &str) -> Result<ShellInput> {
  let mut words = tokenize(line)?;
  if words.is_empty() {
    return Ok(ShellInput::Empty);
  }

  let name = resolve(&words[0])?;
  if name == "help" {
    return Ok(ShellInput::Help);
  }
  words[0] = name.to_string();

  let parsed = ShellLine::try_parse_from(words).map_err(|e| eyre!("{}", e.render()))?;
  Ok(ShellInput::Run(parsed.command))
}
