//! Interactive REPL (Read-Eval-Print Loop) for branchstore.

use std::io::{self, BufRead, Write};
use std::time::Instant;

use super::api::{Database, DatabaseError, DatabaseResult};
use super::connection::Connection;
use crate::model::{Pattern, Statement, Term};
use crate::transaction::IsolationLevel;

/// REPL configuration.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Prompt string.
    pub prompt: String,
    /// Show timing information.
    pub timing: bool,
    /// Max statements to display per query.
    pub max_rows: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "branchstore> ".into(),
            timing: false,
            max_rows: 100,
        }
    }
}

/// What the REPL should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Output(String),
    Quit,
}

/// The interactive REPL.
pub struct Repl {
    db: Database,
    conn: Connection,
    config: ReplConfig,
}

impl Repl {
    /// Create a new REPL with the given database.
    pub fn new(db: Database) -> Self {
        let config = ReplConfig {
            prompt: format!("{}> ", db.config().name),
            ..ReplConfig::default()
        };
        Self::with_config(db, config)
    }

    /// Create a REPL with custom configuration.
    pub fn with_config(db: Database, config: ReplConfig) -> Self {
        let conn = db.connect();
        Self { db, conn, config }
    }

    /// Run the REPL interactively.
    pub fn run(&mut self) -> DatabaseResult<()> {
        self.print_banner();

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            let prompt = if self.conn.is_active() {
                format!("{}* ", self.config.prompt.trim_end())
            } else {
                self.config.prompt.clone()
            };
            print!("{}", prompt);
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                println!("\nGoodbye!");
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let start = Instant::now();
            match self.execute(line) {
                Ok(CommandOutcome::Quit) => break,
                Ok(CommandOutcome::Output(text)) => {
                    if !text.is_empty() {
                        println!("{}", text);
                    }
                    if self.config.timing {
                        println!("Time: {:.3}ms", start.elapsed().as_secs_f64() * 1000.0);
                    }
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    if e.is_retryable() {
                        eprintln!("The transaction conflicts with a concurrent commit; .rollback and retry.");
                    }
                }
            }
        }

        if self.conn.is_active() {
            self.conn.rollback()?;
        }
        Ok(())
    }

    fn print_banner(&self) {
        println!("╔═══════════════════════════════════════════════════╗");
        println!("║                 branchstore v0.1.0                ║");
        println!("║       A branchable transactional quad store       ║");
        println!("╠═══════════════════════════════════════════════════╣");
        println!("║          Type .help for available commands        ║");
        println!("╚═══════════════════════════════════════════════════╝");
        println!();
    }

    /// Execute one command line.
    pub fn execute(&mut self, input: &str) -> DatabaseResult<CommandOutcome> {
        let input = input.trim();
        let cmd = input.trim_start_matches(&['.', '\\'][..]);
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let command = parts.first().map(|s| s.to_lowercase());
        let args = parts.get(1..).unwrap_or(&[]);

        let output = match command.as_deref() {
            Some("help") | Some("h") | Some("?") => help_text(),
            Some("quit") | Some("exit") | Some("q") => return Ok(CommandOutcome::Quit),
            Some("add") => {
                let statement = parse_statement(args)?;
                self.conn.add_statement(statement)?;
                "1 statement added".to_string()
            }
            Some("infer") => {
                let statement = parse_statement(args)?;
                if self.conn.add_inferred_statement(statement)? {
                    "1 statement inferred".to_string()
                } else {
                    "statement already present".to_string()
                }
            }
            Some("remove") | Some("rm") => {
                let pattern = parse_pattern(args)?;
                let removed = self.conn.remove_statements(&pattern)?;
                format!("{} statement(s) removed", removed)
            }
            Some("match") | Some("m") => {
                let pattern = parse_pattern(args)?;
                let found = self.conn.statements(&pattern, true)?;
                self.format_statements(&found)
            }
            Some("contexts") => {
                let contexts = self.conn.context_ids()?;
                if contexts.is_empty() {
                    "(no contexts)".to_string()
                } else {
                    lines(contexts.iter().map(|c| format!("  {}", c)))
                }
            }
            Some("ns") => {
                let namespaces = self.conn.namespaces()?;
                if namespaces.is_empty() {
                    "(no namespaces)".to_string()
                } else {
                    lines(namespaces.iter().map(|ns| format!("  {}", ns)))
                }
            }
            Some("prefix") => match args {
                [prefix] => match self.conn.namespace(prefix)? {
                    Some(name) => format!("{}: <{}>", prefix, name),
                    None => format!("prefix {} is not bound", prefix),
                },
                [prefix, name] => {
                    self.conn.set_namespace(prefix, name)?;
                    format!("{}: <{}>", prefix, name)
                }
                _ => return Err(usage(".prefix <prefix> [iri]")),
            },
            Some("unprefix") => match args {
                [prefix] => {
                    self.conn.remove_namespace(prefix)?;
                    format!("prefix {} removed", prefix)
                }
                _ => return Err(usage(".unprefix <prefix>")),
            },
            Some("begin") => {
                let level = match args {
                    [] => self.db.config().default_isolation,
                    words => words
                        .join(" ")
                        .parse::<IsolationLevel>()
                        .map_err(DatabaseError::Parse)?,
                };
                self.conn.begin_with(level)?;
                format!("BEGIN {}", level)
            }
            Some("prepare") => {
                self.conn.prepare()?;
                "PREPARED".to_string()
            }
            Some("commit") => {
                self.conn.commit()?;
                "COMMIT".to_string()
            }
            Some("rollback") => {
                self.conn.rollback()?;
                "ROLLBACK".to_string()
            }
            Some("clear") => {
                let contexts: Vec<Option<Term>> = args.iter().map(|a| parse_context(a)).collect();
                self.conn.clear(&contexts)?;
                if contexts.is_empty() {
                    "all statements cleared".to_string()
                } else {
                    format!("{} context(s) cleared", contexts.len())
                }
            }
            Some("stats") => self.format_stats(),
            Some("history") => self.format_history(),
            Some("timing") => {
                self.config.timing = !self.config.timing;
                format!("Timing: {}", if self.config.timing { "on" } else { "off" })
            }
            Some(other) => {
                return Err(DatabaseError::Parse(format!(
                    "unknown command: .{} (type .help for available commands)",
                    other
                )))
            }
            None => String::new(),
        };
        Ok(CommandOutcome::Output(output))
    }

    fn format_statements(&self, statements: &[Statement]) -> String {
        if statements.is_empty() {
            return "(0 statements)".to_string();
        }
        let limit = statements.len().min(self.config.max_rows);
        let mut out: Vec<String> = statements
            .iter()
            .take(limit)
            .map(|st| format!("  {}", st))
            .collect();
        if statements.len() > limit {
            out.push(format!("... ({} more statements)", statements.len() - limit));
        }
        out.push(format!("({} statements)", statements.len()));
        out.join("\n")
    }

    fn format_stats(&self) -> String {
        let stats = self.db.stats();
        lines([
            "Database Statistics:".to_string(),
            format!("  Explicit Statements: {}", stats.explicit_statements),
            format!("  Inferred Statements: {}", stats.inferred_statements),
            format!("  Namespaces: {}", stats.namespaces),
            format!("  Unflushed Changesets: {}", stats.unflushed_changesets),
            format!("  Active Transactions: {}", stats.active_transactions),
            format!(
                "  Current Transaction: {}",
                self.conn
                    .isolation()
                    .map_or("none".to_string(), |level| level.to_string())
            ),
        ])
    }

    fn format_history(&self) -> String {
        let history = self.db.history();
        if history.is_empty() {
            return "(no unflushed changesets)".to_string();
        }
        lines(history.iter().enumerate().map(|(i, entry)| {
            let when = entry
                .flushed_at
                .map_or("-".to_string(), |t| t.format("%H:%M:%S%.3f").to_string());
            format!("  {}: [{}] {} ({} readers)", i + 1, when, entry.summary, entry.readers)
        }))
    }
}

fn help_text() -> String {
    lines(
        [
            "Commands:",
            "  .add s p o [c]          Add a statement",
            "  .infer s p o [c]        Add an inferred statement",
            "  .remove s p o [c]       Remove matching statements (? = any)",
            "  .match [s p o [c]]      List matching statements (? = any)",
            "  .contexts               List named contexts",
            "  .ns                     List namespaces",
            "  .prefix p [iri]         Show or bind a namespace prefix",
            "  .unprefix p             Remove a namespace prefix",
            "  .clear [c...]           Clear contexts, or everything",
            "  .begin [level]          Begin a transaction",
            "  .prepare                Check the transaction for conflicts",
            "  .commit                 Commit the transaction",
            "  .rollback               Abandon the transaction",
            "  .stats                  Show database statistics",
            "  .history                Show unflushed changesets",
            "  .timing                 Toggle timing display",
            "  .help, .h, .?           Show this help message",
            "  .quit, .exit, .q        Exit the REPL",
            "",
            "Isolation levels: NONE, READ_UNCOMMITTED, READ_COMMITTED,",
            "  SNAPSHOT_READ, SNAPSHOT, SERIALIZABLE",
            "Contexts: a term, or `default` for the default graph",
        ]
        .iter()
        .map(|s| s.to_string()),
    )
}

fn lines(items: impl IntoIterator<Item = String>) -> String {
    items.into_iter().collect::<Vec<_>>().join("\n")
}

fn usage(text: &str) -> DatabaseError {
    DatabaseError::Parse(format!("usage: {}", text))
}

fn parse_context(word: &str) -> Option<Term> {
    match word {
        "default" | "-" => None,
        other => Some(Term::new(other)),
    }
}

fn parse_position(word: &str) -> Option<Term> {
    match word {
        "?" | "*" => None,
        other => Some(Term::new(other)),
    }
}

fn parse_statement(args: &[&str]) -> DatabaseResult<Statement> {
    match args {
        [s, p, o] => Ok(Statement::triple(*s, *p, *o)),
        [s, p, o, c] => Ok(Statement::new(*s, *p, *o, parse_context(c))),
        _ => Err(usage(".add <subject> <predicate> <object> [context]")),
    }
}

fn parse_pattern(args: &[&str]) -> DatabaseResult<Pattern> {
    match args {
        [] => Ok(Pattern::any()),
        [s, p, o] => Ok(Pattern::new(
            parse_position(s),
            parse_position(p),
            parse_position(o),
        )),
        [s, p, o, c] => {
            let pattern = Pattern::new(parse_position(s), parse_position(p), parse_position(o));
            Ok(match *c {
                "?" | "*" => pattern,
                context => pattern.in_contexts([parse_context(context)]),
            })
        }
        _ => Err(usage(".match [<subject> <predicate> <object> [context]]")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(repl: &mut Repl, line: &str) -> String {
        match repl.execute(line).unwrap() {
            CommandOutcome::Output(text) => text,
            CommandOutcome::Quit => panic!("unexpected quit"),
        }
    }

    #[test]
    fn test_parse_pattern() {
        let pattern = parse_pattern(&["ex:a", "?", "?", "default"]).unwrap();
        assert_eq!(pattern.subject, Some(Term::new("ex:a")));
        assert_eq!(pattern.predicate, None);
        assert_eq!(pattern.contexts, vec![None]);

        assert_eq!(parse_pattern(&[]).unwrap(), Pattern::any());
        assert!(parse_pattern(&["ex:a"]).is_err());
    }

    #[test]
    fn test_add_and_match() {
        let mut repl = Repl::new(Database::in_memory());
        assert_eq!(output(&mut repl, ".add ex:a ex:knows ex:b"), "1 statement added");
        output(&mut repl, ".add ex:b ex:knows ex:c ex:g");

        let found = output(&mut repl, ".match ex:a ? ?");
        assert!(found.contains("(ex:a ex:knows ex:b)"));
        assert!(found.ends_with("(1 statements)"));
        assert!(output(&mut repl, ".contexts").contains("ex:g"));
    }

    #[test]
    fn test_transaction_commands() {
        let mut repl = Repl::new(Database::in_memory());
        assert_eq!(output(&mut repl, ".begin serializable"), "BEGIN SERIALIZABLE");
        output(&mut repl, ".add ex:a ex:p ex:b");
        assert_eq!(output(&mut repl, ".prepare"), "PREPARED");
        assert_eq!(output(&mut repl, ".rollback"), "ROLLBACK");
        assert_eq!(output(&mut repl, ".match"), "(0 statements)");

        assert!(repl.execute(".commit").is_err());
        assert!(repl.execute(".begin eventual").is_err());
    }

    #[test]
    fn test_prefix_and_stats() {
        let mut repl = Repl::new(Database::in_memory());
        output(&mut repl, ".prefix ex http://example.org/");
        assert_eq!(output(&mut repl, ".prefix ex"), "ex: <http://example.org/>");
        output(&mut repl, ".unprefix ex");
        assert_eq!(output(&mut repl, ".prefix ex"), "prefix ex is not bound");

        output(&mut repl, ".add ex:a ex:p ex:b");
        assert!(output(&mut repl, ".stats").contains("Explicit Statements: 1"));
        assert_eq!(output(&mut repl, ".history"), "(no unflushed changesets)");
    }

    #[test]
    fn test_quit_and_unknown() {
        let mut repl = Repl::new(Database::in_memory());
        assert_eq!(repl.execute(".quit").unwrap(), CommandOutcome::Quit);
        assert!(matches!(repl.execute(".frobnicate"), Err(DatabaseError::Parse(_))));
        assert!(output(&mut repl, ".help").contains(".begin [level]"));
    }
}
