use serde::Deserialize;

/// Commands accepted on the page -> router message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  /// Activate a waiting router version immediately
  SkipWaiting,
  /// Delete every partition regardless of version
  ClearCache,
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
  pub command: Command,
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[CommandSpec] = &[
  CommandSpec {
    command: Command::SkipWaiting,
    name: "SKIP_WAITING",
    aliases: &["skip-waiting", "skipwaiting"],
    description: "Activate the waiting version now",
  },
  CommandSpec {
    command: Command::ClearCache,
    name: "CLEAR_CACHE",
    aliases: &["clear-cache", "clear"],
    description: "Delete every cache partition",
  },
];

impl Command {
  pub fn name(self) -> &'static str {
    COMMANDS
      .iter()
      .find(|spec| spec.command == self)
      .map(|spec| spec.name)
      .unwrap_or("UNKNOWN")
  }
}

/// Message envelope as posted by the page: `{"type": "SKIP_WAITING"}`
#[derive(Debug, Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: String,
}

/// Parse a posted message into a command.
///
/// Accepts the bare tag, one of its aliases, or a JSON envelope carrying the
/// tag in `type`. Matching is case-insensitive.
pub fn parse(input: &str) -> Option<Command> {
  let input = input.trim();

  if input.starts_with('{') {
    let envelope: Envelope = serde_json::from_str(input).ok()?;
    return lookup(&envelope.kind);
  }

  lookup(input)
}

fn lookup(tag: &str) -> Option<Command> {
  let tag = tag.trim();
  COMMANDS
    .iter()
    .find(|spec| {
      spec.name.eq_ignore_ascii_case(tag)
        || spec.aliases.iter().any(|a| a.eq_ignore_ascii_case(tag))
    })
    .map(|spec| spec.command)
}
