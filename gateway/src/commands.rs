// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chat-command registry. Handlers come in a closed set of admitted
//! shapes; anything else is unrepresentable, so validation at
//! registration reduces to name checks and dispatch to argument parsing.

use netutil::Session;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    #[error("command name is empty")]
    EmptyName,
    #[error("command name may not contain spaces")]
    NameWithSpaces,
    #[error("command {0:?} is already registered")]
    Duplicate(String),
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("expected a number, got {0:?}")]
    BadArgument(String),
    #[error("missing argument")]
    MissingArgument,
}

/// The admitted handler shapes. `T` is the per-client handle the hosting
/// service dispatches on.
pub enum Handler<T> {
    /// Takes nothing.
    NoArg(Box<dyn Fn() + Send + Sync>),
    /// Takes the invoking client.
    Client(Box<dyn Fn(&T) + Send + Sync>),
    /// Takes the invoking client's session.
    Session(Box<dyn Fn(&Session) + Send + Sync>),
    /// Takes the raw argument words.
    Args(Box<dyn Fn(&T, &[&str]) + Send + Sync>),
    /// Takes one integer and an optional second.
    Scalar(Box<dyn Fn(&T, i32, Option<i32>) + Send + Sync>),
}

pub struct Command<T> {
    pub name: String,
    pub description: String,
    pub handler: Handler<T>,
}

/// A named group of commands, e.g. everything a space's server accepts
/// after `#`.
pub struct CommandGroup<T> {
    name: String,
    commands: Mutex<HashMap<String, Command<T>>>,
}

impl<T> CommandGroup<T> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, command: Command<T>) -> Result<(), CommandError> {
        if command.name.is_empty() {
            return Err(CommandError::EmptyName);
        }
        if command.name.contains(' ') {
            return Err(CommandError::NameWithSpaces);
        }
        let mut commands = self.commands.lock().unwrap();
        if commands.contains_key(&command.name) {
            return Err(CommandError::Duplicate(command.name));
        }
        commands.insert(command.name.clone(), command);
        Ok(())
    }

    /// Runs the command named by the first word of `line`.
    pub fn dispatch(&self, client: &T, session: &Session, line: &str) -> Result<(), CommandError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(CommandError::MissingArgument)?;
        let args: Vec<&str> = words.collect();

        let commands = self.commands.lock().unwrap();
        let command = commands
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_owned()))?;

        match &command.handler {
            Handler::NoArg(f) => f(),
            Handler::Client(f) => f(client),
            Handler::Session(f) => f(session),
            Handler::Args(f) => f(client, &args),
            Handler::Scalar(f) => {
                let first = args.first().ok_or(CommandError::MissingArgument)?;
                let first: i32 = first
                    .parse()
                    .map_err(|_| CommandError::BadArgument(first.to_string()))?;
                let second = match args.get(1) {
                    Some(word) => Some(
                        word.parse()
                            .map_err(|_| CommandError::BadArgument(word.to_string()))?,
                    ),
                    None => None,
                };
                f(client, first, second)
            }
        }
        Ok(())
    }

    /// One help line per command, sorted by name.
    pub fn help(&self) -> String {
        let commands = self.commands.lock().unwrap();
        let mut lines: Vec<String> = commands
            .values()
            .map(|command| format!("#{}: {}", command.name, command.description))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    struct FakeClient {
        id: u32,
    }

    fn group() -> CommandGroup<FakeClient> {
        CommandGroup::new("test")
    }

    #[test]
    fn registration_rejects_bad_names() {
        let g = group();
        let noop = || Handler::NoArg(Box::new(|| {}));

        assert_eq!(
            g.register(Command {
                name: String::new(),
                description: String::new(),
                handler: noop(),
            }),
            Err(CommandError::EmptyName)
        );

        assert_eq!(
            g.register(Command {
                name: "two words".to_owned(),
                description: String::new(),
                handler: noop(),
            }),
            Err(CommandError::NameWithSpaces)
        );

        assert!(g
            .register(Command {
                name: "skip".to_owned(),
                description: String::new(),
                handler: noop(),
            })
            .is_ok());
        assert_eq!(
            g.register(Command {
                name: "skip".to_owned(),
                description: String::new(),
                handler: noop(),
            }),
            Err(CommandError::Duplicate("skip".to_owned()))
        );
    }

    #[test]
    fn each_shape_dispatches() {
        let g = group();
        let session = Session::new();
        let client = FakeClient { id: 42 };

        let hits = Arc::new(AtomicI32::new(0));

        let h = hits.clone();
        g.register(Command {
            name: "bare".to_owned(),
            description: String::new(),
            handler: Handler::NoArg(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        })
        .unwrap();

        let h = hits.clone();
        g.register(Command {
            name: "who".to_owned(),
            description: String::new(),
            handler: Handler::Client(Box::new(move |c: &FakeClient| {
                assert_eq!(c.id, 42);
                h.fetch_add(1, Ordering::SeqCst);
            })),
        })
        .unwrap();

        let h = hits.clone();
        g.register(Command {
            name: "ctx".to_owned(),
            description: String::new(),
            handler: Handler::Session(Box::new(move |s: &Session| {
                assert!(!s.is_cancelled());
                h.fetch_add(1, Ordering::SeqCst);
            })),
        })
        .unwrap();

        let h = hits.clone();
        g.register(Command {
            name: "echo".to_owned(),
            description: String::new(),
            handler: Handler::Args(Box::new(move |_, args: &[&str]| {
                assert_eq!(args, ["a", "b"]);
                h.fetch_add(1, Ordering::SeqCst);
            })),
        })
        .unwrap();

        let h = hits.clone();
        g.register(Command {
            name: "warp".to_owned(),
            description: String::new(),
            handler: Handler::Scalar(Box::new(move |_, first, second| {
                assert_eq!(first, 3);
                assert_eq!(second, Some(-1));
                h.fetch_add(1, Ordering::SeqCst);
            })),
        })
        .unwrap();

        g.dispatch(&client, &session, "bare").unwrap();
        g.dispatch(&client, &session, "who").unwrap();
        g.dispatch(&client, &session, "ctx").unwrap();
        g.dispatch(&client, &session, "echo a b").unwrap();
        g.dispatch(&client, &session, "warp 3 -1").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn scalar_arguments_are_validated() {
        let g = group();
        let session = Session::new();
        let client = FakeClient { id: 0 };
        g.register(Command {
            name: "warp".to_owned(),
            description: String::new(),
            handler: Handler::Scalar(Box::new(|_, _, _| {})),
        })
        .unwrap();

        assert_eq!(
            g.dispatch(&client, &session, "warp"),
            Err(CommandError::MissingArgument)
        );
        assert_eq!(
            g.dispatch(&client, &session, "warp here"),
            Err(CommandError::BadArgument("here".to_owned()))
        );
        assert_eq!(
            g.dispatch(&client, &session, "missing"),
            Err(CommandError::Unknown("missing".to_owned()))
        );
    }
}
