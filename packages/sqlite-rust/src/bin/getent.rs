//! `getent`-style front end over the `SQLite` resolver.
//!
//! ```text
//! nsslite-getent --database auth.sqlite passwd          # enumerate
//! nsslite-getent --database auth.sqlite group wheel 100 # lookups
//! nsslite-getent --json shadow eve
//! nsslite-getent initgroups eve 100
//! ```
//!
//! Exit status follows `getent`: 0 on success, 2 when a key is not found,
//! 1 on any other failure.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use nsslite_core::{Account, Group, ResolveError, ShadowCredential, UNSET};
use nsslite_sqlite::logging::init_tracing;
use nsslite_sqlite::registry::{self, SqliteResolver};
use nsslite_sqlite::StoreArgs;

/// Largest buffer the retry loop grows to.
const MAX_BUFFER: usize = 1 << 20;

#[derive(Parser, Debug)]
#[command(name = "nsslite-getent")]
#[command(about = "Query accounts, groups and shadow entries from an nsslite database", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    /// Print one JSON object per record
    #[arg(long = "json")]
    json: bool,

    /// Initial record buffer size in bytes
    #[arg(long = "buffer-size", default_value_t = 1024)]
    buffer_size: usize,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accounts, by name or uid
    Passwd { keys: Vec<String> },
    /// Groups, by name or gid
    Group { keys: Vec<String> },
    /// Shadow entries, by name
    Shadow { keys: Vec<String> },
    /// Supplementary groups of a user
    Initgroups {
        user: String,
        /// Primary gid, excluded from the list
        gid: Option<u32>,
    },
}

#[derive(Serialize)]
struct Membership<'a> {
    user: &'a str,
    groups: &'a [u32],
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nsslite-getent: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = cli.store.into_config().context("invalid store configuration")?;
    let resolver = registry::install(config)?;
    let out = Output {
        json: cli.json,
        stdout: io::stdout().lock(),
    };
    let mut tool = Tool {
        resolver: &resolver,
        buffer_size: cli.buffer_size.max(1),
        out,
    };

    let code = match cli.command {
        Command::Passwd { keys } if keys.is_empty() => tool.enumerate_accounts()?,
        Command::Passwd { keys } => tool.lookup_all(&keys, Tool::account)?,
        Command::Group { keys } if keys.is_empty() => tool.enumerate_groups()?,
        Command::Group { keys } => tool.lookup_all(&keys, Tool::group)?,
        Command::Shadow { keys } if keys.is_empty() => tool.enumerate_shadows()?,
        Command::Shadow { keys } => tool.lookup_all(&keys, Tool::shadow)?,
        Command::Initgroups { user, gid } => tool.initgroups(&user, gid)?,
    };
    registry::teardown();
    Ok(code)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

struct Output<W: Write> {
    json: bool,
    stdout: W,
}

impl<W: Write> Output<W> {
    fn emit<T: Serialize>(&mut self, record: &T, line: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            serde_json::to_writer(&mut self.stdout, record)?;
            writeln!(self.stdout)?;
        } else {
            writeln!(self.stdout, "{}", line(record))?;
        }
        Ok(())
    }
}

fn account_line(a: &Account) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}:{}",
        a.name, a.passwd, a.uid, a.gid, a.gecos, a.dir, a.shell
    )
}

fn group_line(g: &Group) -> String {
    format!("{}:{}:{}:{}", g.name, g.passwd, g.gid, g.members.join(","))
}

fn aging(value: i64) -> String {
    if value == UNSET {
        String::new()
    } else {
        value.to_string()
    }
}

fn shadow_line(s: &ShadowCredential) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}:{}:{}:",
        s.name,
        s.passwd,
        aging(s.last_change),
        aging(s.min_age),
        aging(s.max_age),
        aging(s.warn_period),
        aging(s.inactivity),
        aging(s.expire)
    )
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

struct Tool<'r, W: Write> {
    resolver: &'r SqliteResolver,
    buffer_size: usize,
    out: Output<W>,
}

/// Runs `call` with a buffer of `initial` bytes, doubling it (or growing it
/// to the reported requirement) while the record does not fit.
fn with_growing_buffer<T>(
    initial: usize,
    mut call: impl FnMut(&mut [u8]) -> Result<T, ResolveError>,
) -> Result<T, ResolveError> {
    let mut size = initial;
    loop {
        let mut buf = vec![0u8; size];
        match call(&mut buf) {
            Err(ResolveError::InsufficientSpace { required, capacity })
                if capacity < MAX_BUFFER =>
            {
                size = (size * 2).max(required).min(MAX_BUFFER);
                tracing::debug!(required, capacity, size, "growing record buffer");
            }
            other => return other,
        }
    }
}

enum Lookup {
    Found,
    Missing,
}

impl<W: Write> Tool<'_, W> {
    fn account(&mut self, key: &str) -> Result<Lookup> {
        let resolver = self.resolver;
        let found = match key.parse::<u32>() {
            Ok(uid) => with_growing_buffer(self.buffer_size, |buf| {
                resolver.account_by_uid(uid, buf).map(Account::from)
            }),
            Err(_) => with_growing_buffer(self.buffer_size, |buf| {
                resolver.account_by_name(key, buf).map(Account::from)
            }),
        };
        self.report(key, found, account_line)
    }

    fn group(&mut self, key: &str) -> Result<Lookup> {
        let resolver = self.resolver;
        let found = match key.parse::<u32>() {
            Ok(gid) => with_growing_buffer(self.buffer_size, |buf| {
                resolver.group_by_gid(gid, buf).map(Group::from)
            }),
            Err(_) => with_growing_buffer(self.buffer_size, |buf| {
                resolver.group_by_name(key, buf).map(Group::from)
            }),
        };
        self.report(key, found, group_line)
    }

    fn shadow(&mut self, key: &str) -> Result<Lookup> {
        let resolver = self.resolver;
        let found = with_growing_buffer(self.buffer_size, |buf| {
            resolver.shadow_by_name(key, buf).map(ShadowCredential::from)
        });
        self.report(key, found, shadow_line)
    }

    fn report<T: Serialize>(
        &mut self,
        key: &str,
        found: Result<T, ResolveError>,
        line: fn(&T) -> String,
    ) -> Result<Lookup> {
        match found {
            Ok(record) => {
                self.out.emit(&record, line)?;
                Ok(Lookup::Found)
            }
            Err(ResolveError::NotFound) => Ok(Lookup::Missing),
            Err(e) => Err(e).with_context(|| format!("lookup of {key:?} failed")),
        }
    }

    fn lookup_all(
        &mut self,
        keys: &[String],
        lookup: fn(&mut Self, &str) -> Result<Lookup>,
    ) -> Result<ExitCode> {
        let mut missing = false;
        for key in keys {
            if let Lookup::Missing = lookup(self, key)? {
                missing = true;
            }
        }
        Ok(if missing {
            ExitCode::from(2)
        } else {
            ExitCode::SUCCESS
        })
    }

    fn enumerate_accounts(&mut self) -> Result<ExitCode> {
        let resolver = self.resolver;
        resolver.start_account_scan()?;
        loop {
            match with_growing_buffer(self.buffer_size, |buf| {
                resolver.next_account(buf).map(Account::from)
            }) {
                Ok(account) => self.out.emit(&account, account_line)?,
                Err(ResolveError::EndOfSequence) => break,
                Err(e) => return Err(e).context("account enumeration failed"),
            }
        }
        resolver.end_account_scan()?;
        Ok(ExitCode::SUCCESS)
    }

    fn enumerate_groups(&mut self) -> Result<ExitCode> {
        let resolver = self.resolver;
        resolver.start_group_scan()?;
        loop {
            match with_growing_buffer(self.buffer_size, |buf| {
                resolver.next_group(buf).map(Group::from)
            }) {
                Ok(group) => self.out.emit(&group, group_line)?,
                Err(ResolveError::EndOfSequence) => break,
                Err(e) => return Err(e).context("group enumeration failed"),
            }
        }
        resolver.end_group_scan()?;
        Ok(ExitCode::SUCCESS)
    }

    fn enumerate_shadows(&mut self) -> Result<ExitCode> {
        let resolver = self.resolver;
        resolver.start_shadow_scan()?;
        loop {
            match with_growing_buffer(self.buffer_size, |buf| {
                resolver.next_shadow(buf).map(ShadowCredential::from)
            }) {
                Ok(shadow) => self.out.emit(&shadow, shadow_line)?,
                Err(ResolveError::EndOfSequence) => break,
                Err(e) => return Err(e).context("shadow enumeration failed"),
            }
        }
        resolver.end_shadow_scan()?;
        Ok(ExitCode::SUCCESS)
    }

    fn initgroups(&mut self, user: &str, primary: Option<u32>) -> Result<ExitCode> {
        let primary = match primary {
            Some(gid) => gid,
            None => with_growing_buffer(self.buffer_size, |buf| {
                self.resolver.account_by_name(user, buf).map(|a| a.gid)
            })
            .with_context(|| format!("unknown user {user:?}"))?,
        };

        let mut groups = vec![primary];
        match self.resolver.supplementary_groups(user, primary, &mut groups, None) {
            Ok(()) | Err(ResolveError::NotFound) => {}
            Err(e) => bail!("group list of {user:?} failed: {e}"),
        }

        let membership = Membership {
            user,
            groups: &groups,
        };
        self.out.emit(&membership, |m| {
            let gids: Vec<String> = m.groups.iter().map(ToString::to_string).collect();
            format!("{} {}", m.user, gids.join(" "))
        })?;
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_grows_until_record_fits() {
        let mut sizes = Vec::new();
        let len = with_growing_buffer(4, |buf| {
            sizes.push(buf.len());
            if buf.len() < 25 {
                Err(ResolveError::InsufficientSpace {
                    required: 25,
                    capacity: buf.len(),
                })
            } else {
                Ok(buf.len())
            }
        })
        .unwrap();
        assert_eq!(sizes, vec![4, 25]);
        assert_eq!(len, 25);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), ResolveError> = with_growing_buffer(8, |_| {
            calls += 1;
            Err(ResolveError::TemporarilyUnavailable)
        });
        assert_eq!(result, Err(ResolveError::TemporarilyUnavailable));
        assert_eq!(calls, 1);
    }

    #[test]
    fn shadow_line_leaves_unset_fields_empty() {
        let mut sp = ShadowCredential::new("eve", "!");
        sp.last_change = 19000;
        assert_eq!(shadow_line(&sp), "eve:!:19000::::::");
    }

    #[test]
    fn colon_lines() {
        let account = Account {
            name: "eve".to_string(),
            passwd: "x".to_string(),
            uid: 1002,
            gid: 100,
            gecos: String::new(),
            dir: "/home/eve".to_string(),
            shell: "/bin/sh".to_string(),
        };
        assert_eq!(account_line(&account), "eve:x:1002:100::/home/eve:/bin/sh");

        let group = Group {
            name: "wheel".to_string(),
            passwd: "x".to_string(),
            gid: 10,
            members: vec!["alice".to_string(), "eve".to_string()],
        };
        assert_eq!(group_line(&group), "wheel:x:10:alice,eve");
    }

    #[test]
    fn json_output_is_one_object_per_line() {
        let mut out = Output {
            json: true,
            stdout: Vec::new(),
        };
        let sp = ShadowCredential::new("eve", "!");
        out.emit(&sp, shadow_line).unwrap();
        let text = String::from_utf8(out.stdout).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["name"], "eve");
        assert_eq!(value["expire"], -1);
    }
}
