// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CLI tool for inspecting and manually poking at a B+tree index file.
//!
//! Unlike the engine's normal entry points, this tool has no real data
//! table to collaborate with — it's an offline/admin surface for a single
//! index file, so it drives a [`NullTable`] stub and lets the operator
//! insert synthetic leaf elements directly (`insert`), run bound searches
//! (`bound`), and walk the tree in key order (`dump`), bypassing the
//! record-pairing scan driver entirely.

use bplustree_index::bounds::{self, BoundStatus};
use bplustree_index::cache::{FastSlot, IndexMapCache};
use bplustree_index::comparator::OperatorClass;
use bplustree_index::cursor::{self, Cursor};
use bplustree_index::element::Element;
use bplustree_index::lifecycle::Index;
use bplustree_index::mutator;
use bplustree_index::offset::BlockOffset;
use bplustree_index::table_iface::{DataTable, RecordFingerprint, RecordHeader};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use humansize::{SizeFormatter, BINARY};
use rustyline::DefaultEditor;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    registry::Registry,
};

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};

    ($msg:literal) => {{
        eprintln!($msg);
        std::process::exit(1);
    }};
}

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

/// A stand-in data table for offline index inspection: reports a fixed
/// generation and never has any real records of its own. Sufficient for
/// [`Index::open`]'s generation check; unsuitable for anything that needs
/// to actually read a row (`read_record`/`column_value`/`fingerprint`).
struct NullTable {
    generation: u64,
}

impl DataTable for NullTable {
    fn first_block(&self) -> BlockOffset {
        BlockOffset(0)
    }

    fn next_block(&self, _bh: BlockOffset, _off: BlockOffset) -> Option<BlockOffset> {
        None
    }

    fn append(&self) -> BlockOffset {
        BlockOffset(0)
    }

    fn read_record(&self, _pos: BlockOffset) -> bplustree_index::Result<RecordHeader> {
        Err(bplustree_index::Error::CorruptHeader {
            reason: "this tool has no real data table to read records from",
        })
    }

    fn column_value(&self, _pos: BlockOffset, _col: u32) -> bplustree_index::Result<Vec<u8>> {
        Err(bplustree_index::Error::CorruptHeader {
            reason: "this tool has no real data table to read records from",
        })
    }

    fn fingerprint(&self, _pos: BlockOffset) -> bplustree_index::Result<RecordFingerprint> {
        Err(bplustree_index::Error::CorruptHeader {
            reason: "this tool has no real data table to read records from",
        })
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

fn init_tracing(quiet: bool, verbose: u8) -> LevelFilter {
    let level_filter = if quiet {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let registry = Registry::default();
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("BTIDX_LOG")
        .from_env_lossy();

    let subscriber = registry.with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact(),
    );

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        die!("INTERNAL ERROR: setting default tracing::subscriber failed");
    }

    level_filter
}

fn parse_op_class(s: &str) -> Result<OperatorClass, String> {
    match s {
        "eq" => Ok(OperatorClass::Eq),
        "like" => Ok(OperatorClass::Like),
        "stamp" => Ok(OperatorClass::StampEq),
        "vtid" => Ok(OperatorClass::VtidEq),
        "userid" => Ok(OperatorClass::UserIdEq),
        "opcode" => Ok(OperatorClass::OpcodeEq),
        other => Err(format!(
            "unknown operator class {other:?} (expected one of: eq, like, stamp, vtid, userid, opcode)"
        )),
    }
}

/// CLI tool for inspecting a B+tree index file
#[derive(Parser, Debug)]
#[command(name = "btidx")]
#[command(about = "CLI tool for inspecting a B+tree index file")]
struct ToolArgs {
    /// Suppress all output except for errors. This overrides the -v flag.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Turn on verbose output. Supply -v multiple times to increase verbosity.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the index file (created on first open)
    index_path: PathBuf,

    /// Virtual table id this index covers
    #[arg(long, default_value_t = 1)]
    vtable: u32,

    /// Column id this index covers
    #[arg(long, default_value_t = 0)]
    col: u32,

    /// Operator class: eq, like, stamp, vtid, userid, opcode
    #[arg(long, default_value = "eq", value_parser = parse_op_class)]
    op: OperatorClass,

    /// Generation to open (and create) the index under
    #[arg(long, default_value_t = 1)]
    generation: u64,

    /// Command to run (if omitted, starts interactive shell)
    #[command(subcommand)]
    command: Option<ToolCommand>,
}

#[derive(Subcommand, Debug, Clone)]
enum ToolCommand {
    /// Insert a synthetic leaf element: key, record offset
    Insert {
        key: String,
        record_offset: u64,
        /// Mark the inserted element as a tombstone companion
        #[arg(short = 'd', long)]
        deleted: bool,
    },
    /// Find the smallest/largest element satisfying a bound on `key`
    Bound {
        key: String,
        /// Search for an upper bound instead of a lower bound
        #[arg(short = 'r', long)]
        reverse: bool,
    },
    /// Walk the tree in key order from `first_elm`/`last_elm`
    Dump {
        /// Walk from `last_elm` backwards instead
        #[arg(short = 'r', long)]
        reverse: bool,
        /// Stop after this many elements
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show header fields and cache occupancy
    Stats,
    /// Force the SYNCED witness on (normally only lazy_update does this)
    Sync,
    /// Clear the SYNCED witness (normally only lazy_update does this)
    Unsync,
}

struct Session {
    index: Index,
    op: OperatorClass,
}

impl Session {
    fn open(path: PathBuf, vtable: u32, col: u32, op: OperatorClass, generation: u64) -> bplustree_index::Result<Self> {
        let cache = Arc::new(IndexMapCache::new(64));
        let table = NullTable { generation };
        let index = Index::open(&path, vtable, col, op, cache, bplustree_index::constants::WINDOW_SIZE, &table)?;
        Ok(Self { index, op })
    }
}

fn handle_insert(session: &Session, key: &str, record_offset: u64, deleted: bool) {
    let elm = Element::new(BlockOffset(record_offset), key.as_bytes()).with_deleted(deleted);
    let _lock = session.index.write_lock();
    match mutator::insert(&session.index, elm) {
        Ok(()) => println!("OK (inserted)"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

fn format_bound_status(status: BoundStatus) -> &'static str {
    match status {
        BoundStatus::Equal => "equal",
        BoundStatus::Near => "near",
        BoundStatus::Empty => "empty",
    }
}

fn handle_bound(session: &Session, key: &str, reverse: bool) {
    let result = if reverse {
        bounds::reverse_bound(&session.index, key.as_bytes(), session.op)
    } else {
        bounds::forward_bound(&session.index, key.as_bytes(), session.op)
    };

    match result {
        Ok(Some(found)) => match bounds::resolve(&session.index, found.pos) {
            Ok((found_key, ro)) => println!(
                "status={} ro={} key={:?}",
                format_bound_status(found.status),
                ro,
                String::from_utf8_lossy(&found_key)
            ),
            Err(e) => eprintln!("Error resolving bound: {e}"),
        },
        Ok(None) => println!("status=empty (tree has no elements)"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

fn handle_dump(session: &Session, reverse: bool, limit: Option<usize>) {
    let start = if reverse { session.index.last_elm() } else { session.index.first_elm() };

    let (_, ro) = match bounds::resolve(&session.index, start) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("Error: {e}");
            return;
        }
    };

    let mut fast = FastSlot::new();
    let mut cursor = Some(Cursor::new(ro, start));
    let mut count = 0usize;

    while let Some(c) = cursor {
        if let Some(limit) = limit {
            if count >= limit {
                break;
            }
        }
        println!("{count}: ro={}", c.ro);
        count += 1;

        cursor = match if reverse {
            cursor::step_backward(&session.index, c, &mut fast)
        } else {
            cursor::step_forward(&session.index, c, &mut fast)
        } {
            Ok(next) => next,
            Err(e) => {
                eprintln!("Error stepping cursor: {e}");
                break;
            }
        };
    }

    println!("({count} elements)");
}

fn handle_stats(session: &Session) {
    let header = session.index.header();
    println!("identity: {:?}", session.index.identity());
    println!("op_class: {:?}", session.op);
    println!("generation: {}", header.generation);
    println!("synced: {}", header.is_synced());
    println!("temporary: {}", session.index.is_temp());
    println!("root: {}", header.root);
    println!("append: {} ({})", header.append, SizeFormatter::new(header.append.0, BINARY));
    println!("ext_append: {} ({})", header.ext_append, SizeFormatter::new(header.ext_append.0, BINARY));
    println!("tab_append: {}", header.tab_append);
    println!("first_elm: {:?}", header.first_elm);
    println!("last_elm: {:?}", header.last_elm);
}

fn handle_sync(session: &Session) {
    match session.index.synchronize() {
        Ok(()) => println!("OK (synced)"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

fn handle_unsync(session: &Session) {
    match session.index.unsynchronize() {
        Ok(()) => println!("OK (unsynced)"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

fn execute_command(session: &Session, cmd: ToolCommand) {
    match cmd {
        ToolCommand::Insert { key, record_offset, deleted } => handle_insert(session, &key, record_offset, deleted),
        ToolCommand::Bound { key, reverse } => handle_bound(session, &key, reverse),
        ToolCommand::Dump { reverse, limit } => handle_dump(session, reverse, limit),
        ToolCommand::Stats => handle_stats(session),
        ToolCommand::Sync => handle_sync(session),
        ToolCommand::Unsync => handle_unsync(session),
    }
}

// Internal shell commands: the same subcommands, plus `exit`.
#[derive(Parser, Debug)]
#[command(name = "")]
#[command(no_binary_name = true)]
#[command(disable_version_flag = true)]
struct ShellArgs {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ShellCommand {
    #[command(flatten)]
    ToolCmd(ToolCommand),

    /// Exit the shell
    #[command(visible_alias = "quit")]
    Exit,
}

enum CommandResult {
    Continue,
    Exit,
}

fn run_shell_command(session: &Session, line: &str) -> CommandResult {
    let line = line.trim();
    if line.is_empty() {
        return CommandResult::Continue;
    }

    let tokens = match shlex::split(line) {
        Some(t) if !t.is_empty() => t,
        Some(_) => return CommandResult::Continue,
        None => {
            eprintln!("error: unclosed quote");
            return CommandResult::Continue;
        }
    };

    match ShellArgs::try_parse_from(&tokens) {
        Ok(args) => match args.command {
            ShellCommand::ToolCmd(cmd) => {
                execute_command(session, cmd);
                CommandResult::Continue
            }
            ShellCommand::Exit => CommandResult::Exit,
        },
        Err(e) => {
            eprintln!("{e}");
            CommandResult::Continue
        }
    }
}

fn run_shell(session: &Session) {
    if io::stdin().is_terminal() {
        run_shell_interactive(session);
    } else {
        run_shell_non_interactive(session);
    }
}

fn run_shell_interactive(session: &Session) {
    println!("Welcome to the btidx shell");
    println!("Type 'help' for available commands, 'exit' to quit.\n");

    let mut rl = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Error initializing line editor: {e}");
            return;
        }
    };

    loop {
        match rl.readline("btidx> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                if let CommandResult::Exit = run_shell_command(session, &line) {
                    break;
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        }
    }
}

fn run_shell_non_interactive(session: &Session) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if stdout.flush().is_err() {
            die!("can't flush stdout");
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if let CommandResult::Exit = run_shell_command(session, &line) {
                    break;
                }
            }
            Err(e) => die!("Error reading input: {}", e),
        }
    }
}

fn main() {
    let args = ToolArgs::parse();
    let level_filter = init_tracing(args.quiet, args.verbose);

    let cmd = ToolArgs::command();
    info!(
        "starting {} ({} {}), log level: {level_filter}",
        cmd.get_name(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let session = match Session::open(args.index_path, args.vtable, args.col, args.op, args.generation) {
        Ok(s) => s,
        Err(e) => die!("Error opening index: {}", e),
    };

    match args.command {
        Some(cmd) => execute_command(&session, cmd),
        None => run_shell(&session),
    }

    if let Err(e) = session.index.close() {
        eprintln!("Error closing index: {e}");
    }
}
