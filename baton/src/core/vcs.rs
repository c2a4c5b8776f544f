//! Version-control subcommand classification.
//!
//! Every call site that needs to know whether a shell command touches git in a
//! read-only way goes through [`classify_command`]. Unknown subcommands are
//! never treated as read-only.

use std::collections::BTreeSet;

/// Classification of a single git subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubcommandClass {
    /// Always allowed, regardless of other policy rules.
    ReadOnly,
    /// Mutates repository state; subject to policy.
    Write,
    /// Not in either set; subject to policy.
    Unknown,
}

impl SubcommandClass {
    pub fn is_read_only(self) -> bool {
        self == SubcommandClass::ReadOnly
    }
}

/// Classification of a full shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandClass {
    /// The command contains no git invocation.
    NotVcs,
    /// Every segment is a read-only git invocation.
    ReadOnly,
    /// At least one segment is a git write/unknown subcommand, or git is mixed
    /// with other commands. Carries the git subcommands seen, in order.
    SubjectToPolicy(Vec<String>),
}

impl CommandClass {
    pub fn is_read_only(&self) -> bool {
        matches!(self, CommandClass::ReadOnly)
    }
}

/// Read-only and write subcommand sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsRules {
    pub read_only: BTreeSet<String>,
    pub write: BTreeSet<String>,
}

pub const DEFAULT_READ_ONLY: &[&str] = &[
    "blame",
    "cat-file",
    "count-objects",
    "describe",
    "diff",
    "for-each-ref",
    "grep",
    "help",
    "log",
    "ls-files",
    "ls-remote",
    "ls-tree",
    "merge-base",
    "name-rev",
    "reflog",
    "rev-list",
    "rev-parse",
    "shortlog",
    "show",
    "show-ref",
    "status",
    "version",
    "whatchanged",
];

pub const DEFAULT_WRITE: &[&str] = &[
    "add",
    "am",
    "apply",
    "bisect",
    "branch",
    "checkout",
    "cherry-pick",
    "clean",
    "clone",
    "commit",
    "config",
    "fetch",
    "gc",
    "init",
    "merge",
    "mv",
    "notes",
    "pull",
    "push",
    "rebase",
    "remote",
    "reset",
    "restore",
    "revert",
    "rm",
    "stash",
    "submodule",
    "switch",
    "tag",
    "worktree",
];

impl Default for VcsRules {
    fn default() -> Self {
        Self {
            read_only: DEFAULT_READ_ONLY.iter().map(|s| s.to_string()).collect(),
            write: DEFAULT_WRITE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Global git options that consume the following token as their value.
const OPTIONS_WITH_VALUE: &[&str] = &["-C", "-c", "--git-dir", "--work-tree", "--namespace"];

/// Classify one subcommand against the rule sets.
///
/// The write set wins if a subcommand is configured into both.
pub fn classify_subcommand(subcommand: &str, rules: &VcsRules) -> SubcommandClass {
    if rules.write.contains(subcommand) {
        SubcommandClass::Write
    } else if rules.read_only.contains(subcommand) {
        SubcommandClass::ReadOnly
    } else {
        SubcommandClass::Unknown
    }
}

/// Classify a full shell command line.
pub fn classify_command(command: &str, rules: &VcsRules) -> CommandClass {
    let mut subcommands = Vec::new();
    let mut saw_other = false;
    let mut all_read_only = true;

    for segment in split_segments(command) {
        let tokens = tokenize(&segment);
        match git_subcommand(&tokens) {
            Some(sub) => {
                if !classify_subcommand(&sub, rules).is_read_only()
                    || has_shell_side_effects(&segment)
                    || writes_output_file(&tokens)
                {
                    all_read_only = false;
                }
                subcommands.push(sub);
            }
            None => {
                if !tokens.is_empty() {
                    saw_other = true;
                }
            }
        }
    }

    if subcommands.is_empty() {
        CommandClass::NotVcs
    } else if all_read_only && !saw_other {
        CommandClass::ReadOnly
    } else {
        CommandClass::SubjectToPolicy(subcommands)
    }
}

/// Extract the git subcommand from a tokenized segment, if the segment runs git.
///
/// Leading `NAME=value` environment assignments are skipped. A bare `git` with
/// no subcommand yields an empty string, which classifies as unknown.
pub fn git_subcommand(tokens: &[String]) -> Option<String> {
    let mut iter = tokens
        .iter()
        .skip_while(|tok| is_env_assignment(tok))
        .peekable();
    let program = iter.next()?;
    let name = program.rsplit('/').next().unwrap_or(program);
    if name != "git" {
        return None;
    }
    while let Some(tok) = iter.next() {
        if OPTIONS_WITH_VALUE.contains(&tok.as_str()) {
            iter.next();
            continue;
        }
        if tok.starts_with('-') {
            continue;
        }
        return Some(tok.clone());
    }
    Some(String::new())
}

/// True when `segment` contains unquoted command substitution (`$(`,
/// backticks) or redirection (`<`, `>`). Inside double quotes substitution
/// still runs; inside single quotes nothing does.
fn has_shell_side_effects(segment: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;
    for c in segment.chars() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '`' => return true,
                '(' if prev == Some('$') => return true,
                _ => {}
            },
            None => match c {
                '\'' | '"' => quote = Some(c),
                '`' | '<' | '>' => return true,
                '(' if prev == Some('$') => return true,
                _ => {}
            },
        }
        prev = Some(c);
    }
    false
}

/// `--output[=<file>]` makes otherwise read-only subcommands write a file.
fn writes_output_file(tokens: &[String]) -> bool {
    tokens
        .iter()
        .any(|tok| tok == "--output" || tok.starts_with("--output="))
}

fn is_env_assignment(tok: &str) -> bool {
    match tok.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Split a command line on unquoted `&&`, `||`, `;`, `|`, `&` and newlines.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' | '\n' | '|' | '&' => {
                    if matches!(c, '|' | '&') && chars.peek() == Some(&c) {
                        chars.next();
                    }
                    segments.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    segments.push(current);
    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Whitespace tokenizer that honors single and double quotes.
fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in segment.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
