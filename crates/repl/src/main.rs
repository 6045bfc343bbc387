//! Rill interactive console
//!
//! Line-oriented front end for the Rill interpreter: reads statements
//! with rustyline, feeds them to the engine, and wires the engine's host
//! interfaces to stdio and the local filesystem.

use clap::Parser as ClapParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde::Deserialize;
use std::path::PathBuf;
use std::process;

mod console;

use console::{LocalFs, StdConsole};
use rill::{Host, Machine};

#[derive(ClapParser)]
#[command(name = "rillr")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Rill interpreter console", long_about = None)]
struct Cli {
    /// Program file to load before the prompt starts
    program: Option<PathBuf>,

    /// Working directory for the language's file built-ins
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Statements to run after loading (then exit)
    #[arg(short = 'e', long = "eval", value_name = "STMTS")]
    eval: Vec<String>,

    /// Settings file (defaults to rillr.toml in the working directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// `rillr.toml` contents.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    display: DisplayConfig,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DisplayConfig {
    width: u16,
    tab_size: u8,
    /// 0 = radians, 1 = degrees
    angle_mode: u8,
    print_results: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            width: 80,
            tab_size: 8,
            angle_mode: 0,
            print_results: false,
        }
    }
}

fn load_config(path: &std::path::Path) -> ConfigFile {
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("warning: ignoring {}: {}", path.display(), e);
                ConfigFile::default()
            }
        },
        Err(_) => ConfigFile::default(),
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

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.workdir.join("rillr.toml"));
    let config = load_config(&config_path);

    let mut host = Host::default();
    host.console = Box::new(StdConsole::new());
    host.fs = Box::new(LocalFs::new(cli.workdir.clone()));

    let mut machine = Machine::new(host);
    apply_config(&mut machine, &config);

    if let Some(program) = &cli.program {
        let src = match std::fs::read_to_string(program) {
            Ok(src) => src,
            Err(e) => {
                eprintln!("cannot read {}: {}", program.display(), e);
                process::exit(2);
            }
        };
        if let Err(diag) = machine.load_program(&src) {
            eprintln!("{}: {}", program.display(), diag);
            process::exit(1);
        }
    }

    // -e mode: run the given statements and exit
    if !cli.eval.is_empty() {
        for stmts in &cli.eval {
            machine.process_line(stmts);
            if machine.wants_quit() {
                break;
            }
        }
        return;
    }

    let prompt = config.prompt.unwrap_or_else(|| "rill> ".to_string());
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("cannot open terminal: {}", e);
            process::exit(2);
        }
    };
    let history_path = cli.workdir.join(".rillr_history");
    let _ = editor.load_history(&history_path);

    println!("Rill {} — type quit; to leave", env!("CARGO_PKG_VERSION"));
    loop {
        let shown_prompt = if machine.stopped_count() > 0 {
            format!("[stopped {}] {}", machine.stopped_count(), prompt)
        } else {
            prompt.clone()
        };
        match editor.readline(&shown_prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(&line);
                }
                machine.process_line(&line);
                if machine.wants_quit() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("(interrupt — quit; to leave)");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {}", e);
                break;
            }
        }
    }
    let _ = editor.save_history(&history_path);
}

fn apply_config(machine: &mut Machine, config: &ConfigFile) {
    let d = &config.display;
    let mut line = String::new();
    if (10..=255).contains(&d.width) {
        line.push_str(&format!("dispWidth {};", d.width));
    }
    if (2..=30).contains(&d.tab_size) {
        line.push_str(&format!("tabSize {};", d.tab_size));
    }
    if d.angle_mode <= 1 {
        line.push_str(&format!("angleMode {};", d.angle_mode));
    }
    line.push_str(&format!(
        "dispMode 0,{};",
        if d.print_results { 1 } else { 0 }
    ));
    machine.process_line(&line);
}
