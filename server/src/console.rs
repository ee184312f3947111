//! Console variables and command execution.
//!
//! Variables are strings looked up case-insensitively. Commands run with a
//! [`Privilege`]; clients may only run unrestricted commands. Every execution
//! returns the text it printed so it can be relayed to a remote caller.

use log::debug;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Local console or an authenticated rcon caller.
    Console,
    /// A connected client, identified by network id.
    Client(u16),
}

impl Privilege {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Privilege::Console)
    }
}

pub type CommandCallback = Arc<dyn Fn(&[String], &mut String) + Send + Sync>;

struct Command {
    restricted: bool,
    callback: CommandCallback,
}

#[derive(Debug, Clone)]
struct ConVar {
    name: String,
    value: String,
    server_info: bool,
    /// Only readable with elevated privilege.
    protected: bool,
}

pub struct Console {
    variables: RwLock<BTreeMap<String, ConVar>>,
    commands: RwLock<HashMap<String, Command>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            variables: RwLock::new(BTreeMap::new()),
            commands: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a variable with a default value unless it already exists.
    ///
    /// Returns the value in effect afterwards.
    pub fn register_variable(&self, name: &str, default: &str, server_info: bool) -> String {
        let mut variables = self.variables.write();
        let var = variables
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| ConVar {
                name: name.to_string(),
                value: default.to_string(),
                server_info,
                protected: false,
            });
        var.server_info |= server_info;
        var.value.clone()
    }

    /// Registers a secret, such as a password, that clients may not read.
    pub fn register_protected_variable(&self, name: &str, default: &str) {
        let mut variables = self.variables.write();
        let var = variables
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| ConVar {
                name: name.to_string(),
                value: default.to_string(),
                server_info: false,
                protected: true,
            });
        var.server_info = false;
        var.protected = true;
    }

    pub fn set_variable(&self, name: &str, value: &str) {
        self.set_variable_with_flags(name, value, false);
    }

    fn set_variable_with_flags(&self, name: &str, value: &str, server_info: bool) {
        let mut variables = self.variables.write();
        let var = variables
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| ConVar {
                name: name.to_string(),
                value: String::new(),
                server_info,
                protected: false,
            });
        var.value = value.to_string();
        var.server_info |= server_info && !var.protected;
    }

    pub fn get_variable(&self, name: &str) -> Option<String> {
        self.variables
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|var| var.value.clone())
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get_variable(name)?.trim().parse().ok()
    }

    /// Variables flagged for inclusion in server info replies, sorted by name.
    pub fn server_info(&self) -> Vec<(String, String)> {
        self.variables
            .read()
            .values()
            .filter(|var| var.server_info)
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect()
    }

    pub fn register_command<F>(&self, name: &str, restricted: bool, callback: F)
    where
        F: Fn(&[String], &mut String) + Send + Sync + 'static,
    {
        self.commands.write().insert(
            name.to_ascii_lowercase(),
            Command {
                restricted,
                callback: Arc::new(callback),
            },
        );
    }

    /// Runs one command line and returns everything it printed.
    pub fn execute(&self, line: &str, privilege: Privilege) -> String {
        let mut output = String::new();
        let tokens = tokenize(line);
        let Some((name, args)) = tokens.split_first() else {
            return output;
        };

        debug!("Executing `{}` with {:?}", name, privilege);

        match name.to_ascii_lowercase().as_str() {
            "set" | "sets" => {
                if !privilege.is_elevated() {
                    output.push_str(&format!("Access denied for command {}.\n", name));
                } else if args.len() < 2 {
                    output.push_str(&format!("usage: {} <name> <value>\n", name));
                } else {
                    let server_info = name.eq_ignore_ascii_case("sets");
                    self.set_variable_with_flags(&args[0], &args[1..].join(" "), server_info);
                }
            }
            "get" => match args.first() {
                Some(var) => self.print_variable(var, privilege, &mut output),
                None => output.push_str("usage: get <name>\n"),
            },
            lowered => {
                let command = self
                    .commands
                    .read()
                    .get(lowered)
                    .map(|command| (command.restricted, Arc::clone(&command.callback)));

                match command {
                    Some((true, _)) if !privilege.is_elevated() => {
                        output.push_str(&format!("Access denied for command {}.\n", name));
                    }
                    Some((_, callback)) => callback(args, &mut output),
                    None if self.get_variable(name).is_some() => {
                        self.print_variable(name, privilege, &mut output)
                    }
                    None => output.push_str(&format!("No such command {}.\n", name)),
                }
            }
        }

        output
    }

    fn print_variable(&self, name: &str, privilege: Privilege, output: &mut String) {
        let var = self.variables.read().get(&name.to_ascii_lowercase()).cloned();
        match var {
            Some(var) if var.protected && !privilege.is_elevated() => {
                output.push_str(&format!("Access denied for variable {}.\n", name))
            }
            Some(var) => output.push_str(&format!("\"{}\" = \"{}\"\n", name, var.value)),
            None => output.push_str(&format!("No such variable {}.\n", name)),
        }
    }
}

/// Splits a command line on whitespace, keeping double-quoted runs intact.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        tokens.push(current);
    }

    tokens
}
