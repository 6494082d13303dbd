//! The Flounder database system.
//!
//! Three modes: interactive REPL (default), TCP server, TCP client. A
//! `startup.sql` in the working directory runs before the REPL or server
//! loop begins.

use std::path::Path;

use clap::Parser;
use flounder_engine::{execute_statement, expand_exec_statements, DbConfig};
use flounder_storage::Database;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser, Debug)]
#[command(name = "flounderdb", about = "Flounder database system", version)]
struct Args {
    /// Start the server
    #[arg(short, long)]
    server: bool,

    /// Start a client and connect to a server
    #[arg(short, long, value_name = "HOST", num_args = 0..=1, default_missing_value = "localhost")]
    attach: Option<String>,

    /// Port for client/server
    #[arg(short, long, default_value_t = 4000)]
    port: u16,

    /// Start the interactive command line (default)
    #[arg(short, long)]
    interactive: bool,
}

fn run_startup(db: &mut Database, config: &mut DbConfig) {
    if !Path::new("startup.sql").exists() {
        return;
    }
    match expand_exec_statements("exec startup.sql") {
        Ok(statements) => {
            for s in statements {
                let result = execute_statement(&s, db, config);
                print!("{}", result.render());
            }
        }
        Err(e) => eprintln!("startup.sql: {e}"),
    }
}

fn is_exit(line: &str) -> bool {
    matches!(line.trim(), "exit" | "q")
}

fn run_interactive(db: &mut Database, config: &mut DbConfig) {
    run_startup(db, config);
    let Ok(mut editor) = DefaultEditor::new() else {
        eprintln!("could not open the terminal");
        return;
    };
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                if is_exit(&line) {
                    return;
                }
                match expand_exec_statements(&line) {
                    Ok(statements) => {
                        for s in statements {
                            let result = execute_statement(&s, db, config);
                            print!("{}", result.render());
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => return,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        }
    }
}

fn run_client(host: &str, port: u16) {
    let mut client = match flounder_net::Client::connect(host, port) {
        Ok(c) => c,
        Err(_) => {
            println!("Could not connect to {host}:{port}");
            return;
        }
    };
    let Ok(mut editor) = DefaultEditor::new() else {
        eprintln!("could not open the terminal");
        return;
    };
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                if is_exit(&line) {
                    return;
                }
                match expand_exec_statements(&line) {
                    Ok(statements) => {
                        for s in statements {
                            match client.send(s.trim()) {
                                Ok(result) => print!("{}", result.render()),
                                Err(e) => {
                                    println!("{e}");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => return,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.server {
        let mut db = Database::new();
        let mut config = DbConfig::default();
        run_startup(&mut db, &mut config);
        if let Err(e) = flounder_net::serve(args.port, &mut db, &mut config) {
            eprintln!("server error: {e}");
            std::process::exit(1);
        }
    } else if let Some(host) = args.attach {
        run_client(&host, args.port);
    } else {
        let mut db = Database::new();
        let mut config = DbConfig::default();
        run_interactive(&mut db, &mut config);
    }
}
