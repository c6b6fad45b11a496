//! Command-line shell for the replicated SQL store.
//!
//! Runs a single statement with `-e`, or reads statements interactively.

mod pretty;

use anyhow::Result;
use clap::Parser;
use client::Client;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const DEFAULT_ADDR: &str = "localhost:9301";

#[derive(Parser, Debug)]
#[command(name = "sqlraft-cli", about = "SQL shell for a sqlraft cluster")]
struct Args {
    /// HTTP address of any node in the cluster
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// Run the provided SQL and exit
    #[arg(short = 'e', long)]
    execute: Option<String>,
}

/// Which endpoint a statement goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Query,
    Execute,
}

/// Statements that only read go to the local node; everything else is
/// replicated through the leader.
fn route(sql: &str) -> Route {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match keyword.as_str() {
        "SELECT" | "PRAGMA" | "EXPLAIN" | "WITH" | "VALUES" => Route::Query,
        _ => Route::Execute,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new(&args.addr)?;

    if let Some(sql) = args.execute {
        run_statement(&client, &sql).await?;
    } else {
        println!("Connected to {}", client.base_url());
        interactive_loop(&client).await?;
    }
    Ok(())
}

async fn run_statement(client: &Client, sql: &str) -> Result<()> {
    match route(sql) {
        Route::Query => {
            let rows = client.query(sql).await?;
            println!("{}", pretty::render_rows(&rows));
        }
        Route::Execute => {
            let result = client.execute(sql).await?;
            println!("{} row(s) affected", result.rows_affected);
        }
    }
    Ok(())
}

/// Returns false when the shell should exit.
async fn process_line(client: &Client, line: &str) -> bool {
    match line {
        "" => true,
        ".quit" | ".exit" => false,
        ".help" | "help" => {
            print_help();
            true
        }
        ".status" => {
            match client.status().await {
                Ok(status) => match serde_json::to_string_pretty(&status) {
                    Ok(text) => println!("{}", text),
                    Err(e) => eprintln!("Error: {}", e),
                },
                Err(e) => eprintln!("Error: {}", e),
            }
            true
        }
        sql => {
            if let Err(e) = run_statement(client, sql).await {
                eprintln!("Error: {}", e);
            }
            true
        }
    }
}

/// Returns false when the shell should exit.
fn handle_readline_error(error: ReadlineError) -> bool {
    match error {
        ReadlineError::Interrupted => {
            println!("^C");
            false
        }
        ReadlineError::Eof => {
            println!("^D");
            false
        }
        err => {
            eprintln!("Error: {:?}", err);
            false
        }
    }
}

async fn interactive_loop(client: &Client) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    println!("Type 'help' for commands or '.quit' to exit");
    println!();

    loop {
        let should_continue = match rl.readline("sqlraft> ") {
            Ok(line) => {
                let line = line.trim();
                let _ = rl.add_history_entry(line);
                process_line(client, line).await
            }
            Err(e) => handle_readline_error(e),
        };
        if !should_continue {
            break;
        }
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  help, .help       Show this help message");
    println!("  .status           Show the node's status document");
    println!("  .quit, .exit      Exit the shell");
    println!();
    println!("Any other input is sent as SQL. SELECT, PRAGMA, EXPLAIN, WITH and");
    println!("VALUES are read from the connected node; other statements are");
    println!("replicated through the leader.");
}
