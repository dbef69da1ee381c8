//! Check commands: `$MACRO$` templates resolved from `name!arg1!arg2` strings.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;

use crate::core::config::CommandDefinition;
use crate::core::errors::{Result, VigilError};

/// Macro name → value, e.g. `HOSTADDRESS` → `10.0.0.1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macros(BTreeMap<String, String>);

impl Macros {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Bind `$ARG1$`..`$ARGn$`.
    pub fn set_args(&mut self, args: &[&str]) {
        for (i, arg) in args.iter().enumerate() {
            self.insert(format!("ARG{}", i + 1), *arg);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Split `check_ping!100.0,20%!500.0,60%` into the command name and its arguments.
#[must_use]
pub fn split_check_command(raw: &str) -> (&str, Vec<&str>) {
    let mut parts = raw.split('!');
    let name = parts.next().unwrap_or_default().trim();
    (name, parts.collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Macro(String),
}

/// A named command line template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    command_line: String,
    segments: Vec<Segment>,
}

impl Command {
    pub fn new(name: impl Into<String>, command_line: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let command_line = command_line.into();
        let pattern = Regex::new(r"\$([A-Za-z0-9_]*)\$").map_err(|err| VigilError::Runtime {
            details: format!("macro pattern failed to compile: {err}"),
        })?;

        let mut segments = Vec::new();
        let mut last = 0;
        for caps in pattern.captures_iter(&command_line) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(command_line[last..whole.start()].to_string()));
            }
            if inner.as_str().is_empty() {
                segments.push(Segment::Literal("$".to_string()));
            } else {
                segments.push(Segment::Macro(inner.as_str().to_string()));
            }
            last = whole.end();
        }
        if last < command_line.len() {
            segments.push(Segment::Literal(command_line[last..].to_string()));
        }

        Ok(Self {
            name,
            command_line,
            segments,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Expand macros. Unknown macros are left verbatim; `$$` is a literal `$`.
    #[must_use]
    pub fn process_cmd_line(&self, macros: &Macros) -> String {
        let mut out = String::with_capacity(self.command_line.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Macro(name) => match macros.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('$');
                        out.push_str(name);
                        out.push('$');
                    }
                },
            }
        }
        out
    }
}

/// Commands by name.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<Command>>,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: &[CommandDefinition]) -> Result<Self> {
        let mut registry = Self::new();
        for def in definitions {
            registry.insert(Command::new(&def.name, &def.command_line)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, command: Command) {
        self.commands
            .insert(command.name().to_string(), Arc::new(command));
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
